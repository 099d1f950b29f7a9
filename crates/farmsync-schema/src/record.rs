//! Record model shared by the local store and the remote client

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::tenant::TenantId;

/// The timestamp a first sync pulls from.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// A domain entity eligible for sync.
///
/// `id` is identical in the local and remote stores and never changes.
/// `deleted_at` is terminal: once set it is never cleared. Domain fields are
/// carried as an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub id: Uuid,
    /// Owning tenant; `None` only for global entity types
    pub tenant_id: Option<TenantId>,
    pub modified_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl SyncableRecord {
    pub fn new(id: Uuid, tenant_id: Option<TenantId>, modified_at: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id,
            modified_at,
            deleted_at: None,
            payload: Map::new(),
        }
    }

    /// Set a single payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn tombstoned(mut self, deleted_at: DateTime<Utc>) -> Self {
        self.deleted_at = Some(deleted_at);
        self
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// The latest timestamp the record carries.
    pub fn last_changed_at(&self) -> DateTime<Utc> {
        match self.deleted_at {
            Some(deleted_at) => deleted_at.max(self.modified_at),
            None => self.modified_at,
        }
    }
}

/// A remote deletion marker: the id of a tombstoned row and when it died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: Uuid,
    pub deleted_at: DateTime<Utc>,
}
