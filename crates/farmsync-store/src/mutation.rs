//! Dirty-mutation table entries and push settlement
//!
//! A mutation is created when the app writes locally and cleared when the
//! remote acknowledges it. Failed pushes are retained, never dropped.

use chrono::{DateTime, Utc};
use farmsync_schema::{Scope, TenantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Upsert,
    SoftDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    /// Waiting to be pushed
    Pending,
    /// Rejected by the remote or out of attempts; reported until requeued
    Failed,
}

/// A locally dirty record awaiting upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub entity: String,
    pub tenant: Option<TenantId>,
    pub record_id: Uuid,
    pub op: MutationOp,
    pub attempts: u32,
    pub state: MutationState,
    pub last_error: Option<String>,
    /// Bumped on every local write; a push acknowledgement only clears the
    /// mutation if the generation it pushed is still current
    pub generation: u64,
    pub queued_at: DateTime<Utc>,
}

impl PendingMutation {
    pub fn is_pending(&self) -> bool {
        self.state == MutationState::Pending
    }

    pub fn is_failed(&self) -> bool {
        self.state == MutationState::Failed
    }
}

/// How the remote answered a pushed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted; `server_time` is the `modifiedAt` (upsert) or `deletedAt`
    /// (soft delete) the server assigned
    Acked { server_time: DateTime<Utc> },
    /// Retryable failure; parked once `attempts` reaches `max_attempts`
    Retry { error: String, max_attempts: u32 },
    /// Terminal failure for this record
    Rejected { error: String },
    /// The mutation no longer has anything to push (its record is gone)
    Discard,
}

/// The result of pushing one mutation, applied transactionally by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushSettlement {
    pub entity: String,
    pub scope: Scope,
    pub record_id: Uuid,
    pub generation: u64,
    pub outcome: PushOutcome,
}

/// What settling a mutation did to the dirty table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleResult {
    Cleared,
    /// A newer local write arrived while the push was in flight; the
    /// mutation stays pending
    Superseded,
    Retained { attempts: u32 },
    Parked { attempts: u32 },
    /// No mutation exists for the record any more
    Missing,
}
