//! Pull checkpoints, keyed by (tenant, entity type)

use chrono::{DateTime, Duration, Utc};
use farmsync_schema::{TenantId, epoch};
use serde::{Deserialize, Serialize};

/// The timestamp through which a tenant's entity type has been pulled and
/// durably applied.
///
/// `last_synced_at` never moves backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub tenant: TenantId,
    pub entity: String,
    pub last_synced_at: DateTime<Utc>,
    /// When the last full listing (the only pull that runs the orphan sweep) completed
    #[serde(default)]
    pub last_full_pull_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(tenant: TenantId, entity: impl Into<String>) -> Self {
        Self {
            tenant,
            entity: entity.into(),
            last_synced_at: epoch(),
            last_full_pull_at: None,
        }
    }

    /// Move the checkpoint forward to `to`. Returns false if `to` is not newer.
    pub fn advance(&mut self, to: DateTime<Utc>) -> bool {
        if to > self.last_synced_at {
            self.last_synced_at = to;
            true
        } else {
            false
        }
    }

    /// Whether a full listing is due, given the configured interval.
    ///
    /// `None` disables periodic full pulls.
    pub fn full_pull_due(&self, now: DateTime<Utc>, interval: Option<Duration>) -> bool {
        match (interval, self.last_full_pull_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(interval), Some(last)) => now - last >= interval,
        }
    }
}
