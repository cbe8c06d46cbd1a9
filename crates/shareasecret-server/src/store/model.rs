use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

const MILLIS_PER_MINUTE: i64 = 60 * 1000;

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Why a secret stopped existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionReason {
    Expired,
    UserDeleted,
    MaximumViewCountHit,
}

impl DeletionReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::UserDeleted => "user_deleted",
            Self::MaximumViewCountHit => "maximum_view_count_hit",
        }
    }
}

impl std::fmt::Display for DeletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored in redb as bincode-encoded bytes, keyed by the numeric secret id.
/// `cipher_text` is whatever the client produced; the server never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: u64,
    pub access_id: String,
    pub management_id: String,
    /// `None` once the secret has been deleted.
    pub cipher_text: Option<String>,
    pub ttl_minutes: i64,
    /// `0` means unlimited.
    pub maximum_views: u32,
    /// Unix milliseconds.
    pub created_at: i64,
    pub deleted_at: Option<i64>,
    pub deletion_reason: Option<DeletionReason>,
}

impl SecretRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Instant (Unix milliseconds) from which the secret counts as expired.
    pub fn expires_at(&self) -> i64 {
        self.created_at
            .saturating_add(self.ttl_minutes.saturating_mul(MILLIS_PER_MINUTE))
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at() <= now
    }

    /// Whether one more redemption on top of `redeemed` exhausts the budget.
    pub fn budget_exhausted_after(&self, redeemed: u64) -> bool {
        self.maximum_views > 0 && redeemed + 1 >= u64::from(self.maximum_views)
    }

    /// Terminal transition: stamp the deletion and wipe the cipher text.
    /// A record that is already deleted keeps its original stamp.
    pub fn mark_deleted(&mut self, now: i64, reason: DeletionReason) {
        if self.is_deleted() {
            return;
        }
        if let Some(mut cipher_text) = self.cipher_text.take() {
            cipher_text.zeroize();
        }
        self.deleted_at = Some(now);
        self.deletion_reason = Some(reason);
    }
}

/// One issued viewing key. `viewed_at` goes from `None` to `Some` exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRecord {
    pub secret_id: u64,
    pub viewing_key: String,
    pub created_at: i64,
    pub viewed_at: Option<i64>,
}

impl ViewRecord {
    pub fn is_redeemed(&self) -> bool {
        self.viewed_at.is_some()
    }
}
