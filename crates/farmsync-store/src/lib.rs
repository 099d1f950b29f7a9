//! Local store adapter for farmsync
//!
//! The [`LocalStore`] trait is the engine's only view of the embedded
//! store. Every query is resolved against the schema registry and scoped by
//! tenant inside the adapter, so callers cannot read across tenants even by
//! mistake. Checkpoints and the dirty-mutation table live in the same store
//! and change only inside the transaction that applies the matching batch.
//!
//! [`ArenaStore`] is the bundled implementation: an in-memory arena with
//! optional atomic JSON persistence.

pub mod arena;
pub mod batch;
pub mod checkpoint;
pub mod error;
pub mod mutation;
pub mod notify;
mod persist;
mod state;

use async_trait::async_trait;
use farmsync_schema::{Scope, SyncableRecord, TenantId};
use tokio::sync::broadcast;
use uuid::Uuid;

pub use arena::{ArenaStore, StoreSnapshot};
pub use batch::{ApplyBatch, ApplyReport, OrphanSweep, TieBreak};
pub use checkpoint::Checkpoint;
pub use error::{Error, Result};
pub use mutation::{
    MutationOp, MutationState, PendingMutation, PushOutcome, PushSettlement, SettleResult,
};
pub use notify::{ChangeNotification, ChangeSource};

/// Scoped, transactional access to the embedded store.
///
/// Every method that takes a [`Scope`] fails with [`Error::UnscopedQuery`]
/// when given [`Scope::Global`] for a tenant-scoped entity type.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Records visible in `scope` whose `deleted_at` is unset.
    async fn active_records(&self, entity: &str, scope: &Scope) -> Result<Vec<SyncableRecord>>;

    /// One record by id, active or tombstoned.
    async fn record(&self, entity: &str, scope: &Scope, id: Uuid) -> Result<Option<SyncableRecord>>;

    /// The pull checkpoint for `(tenant, entity)`, if any pull has committed.
    async fn checkpoint(&self, tenant: &TenantId, entity: &str) -> Result<Option<Checkpoint>>;

    /// Apply one pull batch all-or-nothing, including its checkpoint advance.
    async fn apply(&self, batch: ApplyBatch) -> Result<ApplyReport>;

    /// Pending and parked mutations, oldest first.
    async fn pending_mutations(&self, entity: &str, scope: &Scope) -> Result<Vec<PendingMutation>>;

    /// Record the remote's answer to a pushed mutation.
    async fn settle(&self, settlement: PushSettlement) -> Result<SettleResult>;

    /// Record several answers, in order. Implementations may commit them as
    /// one transaction; the default settles them one at a time.
    async fn settle_all(&self, settlements: Vec<PushSettlement>) -> Result<Vec<SettleResult>> {
        let mut results = Vec::with_capacity(settlements.len());
        for settlement in settlements {
            results.push(self.settle(settlement).await?);
        }
        Ok(results)
    }

    /// Write a record locally and mark it dirty.
    async fn write_local(
        &self,
        entity: &str,
        scope: &Scope,
        record: SyncableRecord,
    ) -> Result<PendingMutation>;

    /// Soft-delete a record locally and mark it dirty.
    async fn delete_local(&self, entity: &str, scope: &Scope, id: Uuid) -> Result<PendingMutation>;

    /// Move parked mutations back to pending. Returns how many moved.
    async fn requeue_failed(&self, entity: &str, scope: &Scope) -> Result<usize>;

    /// Change notifications emitted after each committed transaction.
    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification>;
}
