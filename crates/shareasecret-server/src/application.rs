//! The secret lifecycle: create, request access, issue a view, redeem it,
//! manage and delete. Every mutation is a single store transaction; this layer
//! validates input, mints tokens and translates store outcomes into
//! [`SecretError`].

use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{SecretError, SecretResult};
use crate::ids::{secure_id, SECRET_ID_BYTES, VIEWING_KEY_BYTES};
use crate::jobs;
use crate::store::{now_millis, NewSecret, RedeemResult, Store};

/// Cipher text is `content.salt.iv`, so exactly two separators.
const CIPHER_TEXT_SEPARATOR: char = '.';
const CIPHER_TEXT_SEPARATORS: usize = 2;

/// Raw creation input, exactly as submitted. Fields are strings so that
/// malformed numbers surface as validation errors rather than decode errors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateSecretForm {
    pub encrypted_secret: String,
    pub ttl: String,
    pub max_views: String,
}

/// Validated creation input.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSecret {
    pub cipher_text: String,
    pub ttl_minutes: i64,
    pub maximum_views: u32,
}

impl CreateSecretForm {
    /// Structural checks only; the cipher text itself is never inspected.
    pub fn validate(&self) -> SecretResult<ValidatedSecret> {
        let separators = self
            .encrypted_secret
            .chars()
            .filter(|c| *c == CIPHER_TEXT_SEPARATOR)
            .count();
        if separators != CIPHER_TEXT_SEPARATORS {
            return Err(SecretError::BadFormat);
        }
        let ttl_minutes = self.ttl.parse::<i64>().map_err(|_| SecretError::BadTtl)?;
        let maximum_views = self
            .max_views
            .parse::<u32>()
            .map_err(|_| SecretError::BadMaxViews)?;

        Ok(ValidatedSecret {
            cipher_text: self.encrypted_secret.clone(),
            ttl_minutes,
            maximum_views,
        })
    }
}

/// Tokens handed back to the creator.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedSecret {
    pub access_id: String,
    pub management_id: String,
}

/// A successfully redeemed view.
#[derive(Debug, Clone, PartialEq)]
pub struct RedeemedView {
    pub cipher_text: String,
    /// The secret was deleted because this view spent its budget.
    pub maximum_views_reached: bool,
}

/// Owns the store handle and exposes the lifecycle operations. Built once at
/// startup and shared (cloned) with the transport layer.
#[derive(Clone)]
pub struct Application {
    store: Store,
}

impl Application {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Validate and persist a new secret. Nothing is written if validation fails.
    pub fn create_secret(&self, form: &CreateSecretForm) -> SecretResult<CreatedSecret> {
        let validated = form.validate()?;

        let access_id = secure_id(SECRET_ID_BYTES)?;
        let management_id = secure_id(SECRET_ID_BYTES)?;

        let record = self.store.insert_secret(NewSecret {
            access_id,
            management_id,
            cipher_text: validated.cipher_text,
            ttl_minutes: validated.ttl_minutes,
            maximum_views: validated.maximum_views,
            created_at: now_millis(),
        })?;

        debug!(
            secret_id = record.id,
            ttl_minutes = record.ttl_minutes,
            maximum_views = record.maximum_views,
            "created secret"
        );
        Ok(CreatedSecret {
            access_id: record.access_id,
            management_id: record.management_id,
        })
    }

    /// Read-only check that the secret can still be viewed. Spends nothing.
    pub fn request_access(&self, access_id: &str) -> SecretResult<()> {
        if self.store.is_active(access_id)? {
            Ok(())
        } else {
            Err(SecretError::NotFoundOrDeleted)
        }
    }

    /// Allocate a single-use viewing key. Issuing never spends the budget;
    /// only redemption does.
    pub fn issue_view(&self, access_id: &str) -> SecretResult<String> {
        let viewing_key = secure_id(VIEWING_KEY_BYTES)?;
        if self.store.insert_view(access_id, &viewing_key, now_millis())? {
            Ok(viewing_key)
        } else {
            Err(SecretError::NotFoundOrDeleted)
        }
    }

    /// Spend `viewing_key`. The cipher text is only returned once the
    /// consuming transaction has committed.
    pub fn redeem_view(&self, access_id: &str, viewing_key: &str) -> SecretResult<RedeemedView> {
        match self.store.redeem_view(access_id, viewing_key, now_millis())? {
            RedeemResult::Redeemed {
                cipher_text,
                maximum_views_reached,
            } => Ok(RedeemedView {
                cipher_text,
                maximum_views_reached,
            }),
            RedeemResult::NotFound => Err(SecretError::NotFoundOrAlreadyUsed),
        }
    }

    /// Access id of the secret the creator manages.
    pub fn resolve_management(&self, management_id: &str) -> SecretResult<String> {
        self.store
            .access_id_for_management(management_id)?
            .ok_or(SecretError::NotFoundOrDeleted)
    }

    /// Delete the secret. Deleting something already gone is not an error.
    pub fn delete_secret(&self, management_id: &str) -> SecretResult<()> {
        let deleted = self.store.delete_by_management(management_id, now_millis())?;
        debug!(deleted, "delete secret requested");
        Ok(())
    }

    /// Start the expiry reaper. Call once at boot; it runs for the life of
    /// the process.
    pub fn run_expiry_reaper(&self, every: Duration) -> JoinHandle<()> {
        jobs::spawn_expiry_reaper(self.store.clone(), every)
    }
}
