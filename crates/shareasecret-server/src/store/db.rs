use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{
    Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use super::model::{DeletionReason, SecretRecord, ViewRecord};

const SECRETS: TableDefinition<u64, &[u8]> = TableDefinition::new("secrets");
const ACCESS_IDS: TableDefinition<&str, u64> = TableDefinition::new("secret_access_ids");
const MANAGEMENT_IDS: TableDefinition<&str, u64> = TableDefinition::new("secret_management_ids");
const VIEWS: TableDefinition<&str, &[u8]> = TableDefinition::new("secret_views");
const VIEWS_BY_SECRET: MultimapTableDefinition<u64, &str> =
    MultimapTableDefinition::new("secret_views_by_secret");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
const SECRET_SEQ_KEY: &str = "secret_seq";

/// Everything needed to insert a secret. Ids are generated by the caller.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub access_id: String,
    pub management_id: String,
    pub cipher_text: String,
    pub ttl_minutes: i64,
    pub maximum_views: u32,
    pub created_at: i64,
}

/// Result of redeeming a viewing key.
#[derive(Debug, PartialEq)]
pub enum RedeemResult {
    /// Key consumed. `maximum_views_reached` means the secret was deleted in
    /// the same transaction.
    Redeemed {
        cipher_text: String,
        maximum_views_reached: bool,
    },
    /// Secret absent or deleted, key unknown, or key already used.
    NotFound,
}

/// Thread-safe handle to the redb store.
///
/// redb runs one write transaction at a time, so every check-then-mutate below
/// is serialized against every other writer, the reaper included.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(ACCESS_IDS)?;
        write_txn.open_table(MANAGEMENT_IDS)?;
        write_txn.open_table(VIEWS)?;
        write_txn.open_multimap_table(VIEWS_BY_SECRET)?;
        write_txn.open_table(COUNTERS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert a new active secret. Fails if either token is already indexed.
    pub fn insert_secret(&self, new: NewSecret) -> Result<SecretRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut access_ids = write_txn.open_table(ACCESS_IDS)?;
            let mut management_ids = write_txn.open_table(MANAGEMENT_IDS)?;
            if access_ids.get(new.access_id.as_str())?.is_some()
                || management_ids.get(new.management_id.as_str())?.is_some()
            {
                anyhow::bail!("secret id collision");
            }

            let mut counters = write_txn.open_table(COUNTERS)?;
            let id = counters.get(SECRET_SEQ_KEY)?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert(SECRET_SEQ_KEY, id)?;

            let record = SecretRecord {
                id,
                access_id: new.access_id,
                management_id: new.management_id,
                cipher_text: Some(new.cipher_text),
                ttl_minutes: new.ttl_minutes,
                maximum_views: new.maximum_views,
                created_at: new.created_at,
                deleted_at: None,
                deletion_reason: None,
            };

            let mut secrets = write_txn.open_table(SECRETS)?;
            secrets.insert(id, encode(&record)?.as_slice())?;
            access_ids.insert(record.access_id.as_str(), id)?;
            management_ids.insert(record.management_id.as_str(), id)?;
            record
        };
        write_txn.commit()?;

        debug!(secret_id = record.id, "stored secret");
        Ok(record)
    }

    /// True if a secret with `access_id` exists and is not deleted.
    pub fn is_active(&self, access_id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let access_ids = read_txn.open_table(ACCESS_IDS)?;
        let secrets = read_txn.open_table(SECRETS)?;
        Ok(active_secret(&access_ids, &secrets, access_id)?.is_some())
    }

    /// Record a pending view against the active secret behind `access_id`.
    /// Returns false, writing nothing, if there is no such secret.
    pub fn insert_view(&self, access_id: &str, viewing_key: &str, now: i64) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let secret_id = {
            let access_ids = write_txn.open_table(ACCESS_IDS)?;
            let secrets = write_txn.open_table(SECRETS)?;
            active_secret(&access_ids, &secrets, access_id)?.map(|s| s.id)
        };

        let Some(secret_id) = secret_id else {
            write_txn.abort()?;
            return Ok(false);
        };

        {
            let mut views = write_txn.open_table(VIEWS)?;
            if views.get(viewing_key)?.is_some() {
                anyhow::bail!("viewing key collision");
            }
            let view = ViewRecord {
                secret_id,
                viewing_key: viewing_key.to_owned(),
                created_at: now,
                viewed_at: None,
            };
            views.insert(viewing_key, encode(&view)?.as_slice())?;

            let mut by_secret = write_txn.open_multimap_table(VIEWS_BY_SECRET)?;
            by_secret.insert(secret_id, viewing_key)?;
        }
        write_txn.commit()?;

        debug!(secret_id, "issued view");
        Ok(true)
    }

    /// Consume `viewing_key` and hand back the cipher text, deleting the secret
    /// if this view spends its budget. Nothing is written on `NotFound`.
    pub fn redeem_view(
        &self,
        access_id: &str,
        viewing_key: &str,
        now: i64,
    ) -> Result<RedeemResult> {
        let write_txn = self.db.begin_write()?;

        let matched = {
            let access_ids = write_txn.open_table(ACCESS_IDS)?;
            let secrets = write_txn.open_table(SECRETS)?;
            let views = write_txn.open_table(VIEWS)?;
            let by_secret = write_txn.open_multimap_table(VIEWS_BY_SECRET)?;

            match active_secret(&access_ids, &secrets, access_id)? {
                None => None,
                Some(secret) => match load_view(&views, viewing_key)? {
                    Some(view) if view.secret_id == secret.id && !view.is_redeemed() => {
                        let redeemed = count_redeemed(&views, &by_secret, secret.id)?;
                        Some((secret, view, redeemed))
                    }
                    _ => None,
                },
            }
        };

        let Some((mut secret, mut view, redeemed)) = matched else {
            write_txn.abort()?;
            return Ok(RedeemResult::NotFound);
        };
        let cipher_text = secret
            .cipher_text
            .clone()
            .with_context(|| format!("active secret {} has no cipher text", secret.id))?;

        view.viewed_at = Some(now);
        let maximum_views_reached = secret.budget_exhausted_after(redeemed);
        {
            let mut views = write_txn.open_table(VIEWS)?;
            views.insert(viewing_key, encode(&view)?.as_slice())?;

            if maximum_views_reached {
                secret.mark_deleted(now, DeletionReason::MaximumViewCountHit);
                let mut secrets = write_txn.open_table(SECRETS)?;
                secrets.insert(secret.id, encode(&secret)?.as_slice())?;
                debug!(
                    secret_id = secret.id,
                    reason = %DeletionReason::MaximumViewCountHit,
                    "deleted secret"
                );
            }
        }
        write_txn.commit()?;

        debug!(secret_id = secret.id, maximum_views_reached, "redeemed view");
        Ok(RedeemResult::Redeemed {
            cipher_text,
            maximum_views_reached,
        })
    }

    /// Access id of the active secret owned by `management_id`.
    pub fn access_id_for_management(&self, management_id: &str) -> Result<Option<String>> {
        Ok(self
            .secret_by_management_id(management_id)?
            .filter(|s| !s.is_deleted())
            .map(|s| s.access_id))
    }

    /// Delete the active secret owned by `management_id`.
    /// Returns false if there was nothing left to delete.
    pub fn delete_by_management(&self, management_id: &str, now: i64) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let management_ids = write_txn.open_table(MANAGEMENT_IDS)?;
            let mut secrets = write_txn.open_table(SECRETS)?;
            let secret = match lookup_id(&management_ids, management_id)? {
                Some(id) => load_secret(&secrets, id)?.filter(|s| !s.is_deleted()),
                None => None,
            };
            match secret {
                Some(mut secret) => {
                    secret.mark_deleted(now, DeletionReason::UserDeleted);
                    secrets.insert(secret.id, encode(&secret)?.as_slice())?;
                    debug!(
                        secret_id = secret.id,
                        reason = %DeletionReason::UserDeleted,
                        "deleted secret"
                    );
                    true
                }
                None => false,
            }
        };

        if !deleted {
            write_txn.abort()?;
            return Ok(false);
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Delete every active secret whose TTL has elapsed at `now`, in one
    /// transaction. Returns how many were deleted.
    pub fn expire(&self, now: i64) -> Result<usize> {
        let write_txn = self.db.begin_write()?;
        let count = {
            let mut secrets = write_txn.open_table(SECRETS)?;

            let mut expired = Vec::new();
            for item in secrets.iter()? {
                let (_k, v) = item?;
                let record: SecretRecord = decode(v.value())?;
                if !record.is_deleted() && record.is_expired(now) {
                    expired.push(record);
                }
            }

            for record in &mut expired {
                record.mark_deleted(now, DeletionReason::Expired);
                secrets.insert(record.id, encode(&*record)?.as_slice())?;
                debug!(secret_id = record.id, reason = %DeletionReason::Expired, "deleted secret");
            }
            expired.len()
        };
        write_txn.commit()?;
        Ok(count)
    }

    /// Fetch a secret row (deleted or not) by access id.
    pub fn secret_by_access_id(&self, access_id: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let access_ids = read_txn.open_table(ACCESS_IDS)?;
        let secrets = read_txn.open_table(SECRETS)?;
        match lookup_id(&access_ids, access_id)? {
            Some(id) => load_secret(&secrets, id),
            None => Ok(None),
        }
    }

    /// Fetch a secret row (deleted or not) by management id.
    pub fn secret_by_management_id(&self, management_id: &str) -> Result<Option<SecretRecord>> {
        let read_txn = self.db.begin_read()?;
        let management_ids = read_txn.open_table(MANAGEMENT_IDS)?;
        let secrets = read_txn.open_table(SECRETS)?;
        match lookup_id(&management_ids, management_id)? {
            Some(id) => load_secret(&secrets, id),
            None => Ok(None),
        }
    }

    /// Fetch a view record by viewing key.
    pub fn view(&self, viewing_key: &str) -> Result<Option<ViewRecord>> {
        let read_txn = self.db.begin_read()?;
        let views = read_txn.open_table(VIEWS)?;
        load_view(&views, viewing_key)
    }
}

fn lookup_id(index: &impl ReadableTable<&'static str, u64>, token: &str) -> Result<Option<u64>> {
    Ok(index.get(token)?.map(|g| g.value()))
}

fn load_secret(
    secrets: &impl ReadableTable<u64, &'static [u8]>,
    id: u64,
) -> Result<Option<SecretRecord>> {
    match secrets.get(id)? {
        Some(guard) => Ok(Some(decode(guard.value()).context("decode secret")?)),
        None => Ok(None),
    }
}

fn load_view(
    views: &impl ReadableTable<&'static str, &'static [u8]>,
    viewing_key: &str,
) -> Result<Option<ViewRecord>> {
    match views.get(viewing_key)? {
        Some(guard) => Ok(Some(decode(guard.value()).context("decode view")?)),
        None => Ok(None),
    }
}

fn active_secret(
    access_ids: &impl ReadableTable<&'static str, u64>,
    secrets: &impl ReadableTable<u64, &'static [u8]>,
    access_id: &str,
) -> Result<Option<SecretRecord>> {
    match lookup_id(access_ids, access_id)? {
        Some(id) => Ok(load_secret(secrets, id)?.filter(|s| !s.is_deleted())),
        None => Ok(None),
    }
}

fn count_redeemed(
    views: &impl ReadableTable<&'static str, &'static [u8]>,
    by_secret: &impl ReadableMultimapTable<u64, &'static str>,
    secret_id: u64,
) -> Result<u64> {
    let mut redeemed = 0;
    for key in by_secret.get(secret_id)? {
        let key = key?;
        if load_view(views, key.value())?.is_some_and(|v| v.is_redeemed()) {
            redeemed += 1;
        }
    }
    Ok(redeemed)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard()).context("bincode encode")
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode")?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::store::model::now_millis;
    use tempfile::tempdir;

    fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path).unwrap();
        (store, dir)
    }

    fn new_secret(tag: &str, ttl_minutes: i64, maximum_views: u32, created_at: i64) -> NewSecret {
        NewSecret {
            access_id: format!("access-{tag}"),
            management_id: format!("manage-{tag}"),
            cipher_text: "a.b.c".into(),
            ttl_minutes,
            maximum_views,
            created_at,
        }
    }

    #[test]
    fn insert_allocates_sequential_ids() {
        let (s, _dir) = make_store();
        let now = now_millis();
        let one = s.insert_secret(new_secret("1", 30, 1, now)).unwrap();
        let two = s.insert_secret(new_secret("2", 30, 1, now)).unwrap();
        assert_eq!(one.id, 1);
        assert_eq!(two.id, 2);
        assert!(s.is_active("access-1").unwrap());
    }

    #[test]
    fn duplicate_tokens_are_rejected() {
        let (s, _dir) = make_store();
        let now = now_millis();
        s.insert_secret(new_secret("dup", 30, 1, now)).unwrap();
        assert!(s.insert_secret(new_secret("dup", 30, 1, now)).is_err());

        let mut other = new_secret("other", 30, 1, now);
        other.management_id = "manage-dup".into();
        assert!(s.insert_secret(other).is_err());
        assert!(s.secret_by_access_id("access-other").unwrap().is_none());
    }

    #[test]
    fn insert_view_requires_active_secret() {
        let (s, _dir) = make_store();
        let now = now_millis();
        assert!(!s.insert_view("access-missing", "k1", now).unwrap());
        assert!(s.view("k1").unwrap().is_none());

        s.insert_secret(new_secret("v", 30, 1, now)).unwrap();
        assert!(s.delete_by_management("manage-v", now).unwrap());
        assert!(!s.insert_view("access-v", "k2", now).unwrap());
        assert!(s.view("k2").unwrap().is_none());
    }

    #[test]
    fn redeem_marks_view_and_burns_on_last() {
        let (s, _dir) = make_store();
        let now = now_millis();
        s.insert_secret(new_secret("r", 30, 1, now)).unwrap();
        assert!(s.insert_view("access-r", "k", now).unwrap());

        assert_eq!(
            s.redeem_view("access-r", "k", now + 5).unwrap(),
            RedeemResult::Redeemed {
                cipher_text: "a.b.c".into(),
                maximum_views_reached: true,
            }
        );
        assert_eq!(s.view("k").unwrap().unwrap().viewed_at, Some(now + 5));

        let secret = s.secret_by_access_id("access-r").unwrap().unwrap();
        assert_eq!(secret.deleted_at, Some(now + 5));
        assert_eq!(
            secret.deletion_reason,
            Some(DeletionReason::MaximumViewCountHit)
        );
        assert_eq!(secret.cipher_text, None);
    }

    #[test]
    fn redeem_rejects_reuse_and_foreign_keys() {
        let (s, _dir) = make_store();
        let now = now_millis();
        s.insert_secret(new_secret("a", 30, 0, now)).unwrap();
        s.insert_secret(new_secret("b", 30, 0, now)).unwrap();
        assert!(s.insert_view("access-a", "ka", now).unwrap());

        // Key belongs to a different secret.
        assert_eq!(
            s.redeem_view("access-b", "ka", now).unwrap(),
            RedeemResult::NotFound
        );
        assert_eq!(
            s.redeem_view("access-a", "unknown", now).unwrap(),
            RedeemResult::NotFound
        );

        assert!(matches!(
            s.redeem_view("access-a", "ka", now).unwrap(),
            RedeemResult::Redeemed { .. }
        ));
        assert_eq!(
            s.redeem_view("access-a", "ka", now).unwrap(),
            RedeemResult::NotFound
        );
    }

    #[test]
    fn failed_redeem_leaves_view_pending() {
        let (s, _dir) = make_store();
        let now = now_millis();
        s.insert_secret(new_secret("p", 30, 1, now)).unwrap();
        s.insert_secret(new_secret("q", 30, 1, now)).unwrap();
        assert!(s.insert_view("access-p", "kp", now).unwrap());

        assert_eq!(
            s.redeem_view("access-q", "kp", now).unwrap(),
            RedeemResult::NotFound
        );
        assert_eq!(s.view("kp").unwrap().unwrap().viewed_at, None);
        assert!(s.is_active("access-p").unwrap());
    }

    #[test]
    fn budget_of_three() {
        let (s, _dir) = make_store();
        let now = now_millis();
        s.insert_secret(new_secret("n", 30, 3, now)).unwrap();
        for key in ["k1", "k2", "k3", "k4"] {
            assert!(s.insert_view("access-n", key, now).unwrap());
        }

        let reached: Vec<bool> = ["k1", "k2", "k3"]
            .iter()
            .map(|k| match s.redeem_view("access-n", k, now).unwrap() {
                RedeemResult::Redeemed {
                    maximum_views_reached,
                    ..
                } => maximum_views_reached,
                RedeemResult::NotFound => panic!("view {k} should redeem"),
            })
            .collect();
        assert_eq!(reached, vec![false, false, true]);

        assert_eq!(
            s.redeem_view("access-n", "k4", now).unwrap(),
            RedeemResult::NotFound
        );
        assert_eq!(
            s.secret_by_access_id("access-n")
                .unwrap()
                .unwrap()
                .deletion_reason,
            Some(DeletionReason::MaximumViewCountHit)
        );
    }

    #[test]
    fn unlimited_views_never_burn() {
        let (s, _dir) = make_store();
        let now = now_millis();
        s.insert_secret(new_secret("u", 30, 0, now)).unwrap();
        for i in 0..25 {
            let key = format!("k{i}");
            assert!(s.insert_view("access-u", &key, now).unwrap());
            assert_eq!(
                s.redeem_view("access-u", &key, now).unwrap(),
                RedeemResult::Redeemed {
                    cipher_text: "a.b.c".into(),
                    maximum_views_reached: false,
                }
            );
        }
        assert!(s.is_active("access-u").unwrap());
    }

    #[test]
    fn concurrent_redeem_of_one_key_succeeds_once() {
        let (s, _dir) = make_store();
        let now = now_millis();
        s.insert_secret(new_secret("race", 30, 0, now)).unwrap();
        assert!(s.insert_view("access-race", "k", now).unwrap());

        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = s.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    s.redeem_view("access-race", "k", now_millis()).unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results
            .iter()
            .filter(|r| matches!(r, RedeemResult::Redeemed { .. }))
            .count();
        assert_eq!(wins, 1);
        assert!(s.is_active("access-race").unwrap());
    }

    #[test]
    fn management_lookup_and_delete() {
        let (s, _dir) = make_store();
        let now = now_millis();
        s.insert_secret(new_secret("m", 30, 1, now)).unwrap();
        assert_eq!(
            s.access_id_for_management("manage-m").unwrap(),
            Some("access-m".into())
        );

        assert!(s.delete_by_management("manage-m", now).unwrap());
        assert!(!s.delete_by_management("manage-m", now + 10).unwrap());
        assert_eq!(s.access_id_for_management("manage-m").unwrap(), None);

        let secret = s.secret_by_management_id("manage-m").unwrap().unwrap();
        assert_eq!(secret.deleted_at, Some(now));
        assert_eq!(secret.deletion_reason, Some(DeletionReason::UserDeleted));
        assert_eq!(secret.cipher_text, None);
    }

    #[test]
    fn expire_only_touches_elapsed_active_secrets() {
        let (s, _dir) = make_store();
        let now = now_millis();
        s.insert_secret(new_secret("old", 1, 1, now - 2 * 60_000)).unwrap();
        s.insert_secret(new_secret("fresh", 30, 1, now)).unwrap();
        s.insert_secret(new_secret("gone", 1, 1, now - 2 * 60_000)).unwrap();
        s.delete_by_management("manage-gone", now - 1).unwrap();

        assert_eq!(s.expire(now).unwrap(), 1);
        assert_eq!(s.expire(now).unwrap(), 0);

        let old = s.secret_by_access_id("access-old").unwrap().unwrap();
        assert_eq!(old.deletion_reason, Some(DeletionReason::Expired));
        assert_eq!(old.cipher_text, None);
        assert!(s.is_active("access-fresh").unwrap());

        let gone = s.secret_by_access_id("access-gone").unwrap().unwrap();
        assert_eq!(gone.deletion_reason, Some(DeletionReason::UserDeleted));
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let now = now_millis();
        {
            let s = Store::open(&path).unwrap();
            s.insert_secret(new_secret("keep", 30, 1, now)).unwrap();
        }
        let s = Store::open(&path).unwrap();
        assert!(s.is_active("access-keep").unwrap());
        let next = s.insert_secret(new_secret("next", 30, 1, now)).unwrap();
        assert_eq!(next.id, 2);
    }
}
