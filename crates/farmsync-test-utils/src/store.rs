//! [`FaultyStore`]: wraps a [`LocalStore`] and fails chosen calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use farmsync_schema::{Scope, SyncableRecord, TenantId};
use farmsync_store::{
    ApplyBatch, ApplyReport, ChangeNotification, Checkpoint, Error, LocalStore, PendingMutation,
    PushSettlement, Result, SettleResult,
};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Delegates to an inner store, failing the Nth `apply` or settle call.
///
/// `settle` and `settle_all` share one counter; a batch counts once.
pub struct FaultyStore {
    inner: Arc<dyn LocalStore>,
    applies: AtomicUsize,
    settles: AtomicUsize,
    fail_apply_at: AtomicUsize,
    fail_settle_at: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn LocalStore>) -> Self {
        Self {
            inner,
            applies: AtomicUsize::new(0),
            settles: AtomicUsize::new(0),
            fail_apply_at: AtomicUsize::new(0),
            fail_settle_at: AtomicUsize::new(0),
        }
    }

    /// Fail the `n`th `apply` call from now on (1-based). `0` disarms.
    pub fn fail_apply_on(&self, n: usize) {
        self.applies.store(0, Ordering::SeqCst);
        self.fail_apply_at.store(n, Ordering::SeqCst);
    }

    /// Fail the `n`th `settle` call from now on (1-based). `0` disarms.
    pub fn fail_settle_on(&self, n: usize) {
        self.settles.store(0, Ordering::SeqCst);
        self.fail_settle_at.store(n, Ordering::SeqCst);
    }

    pub fn apply_calls(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    /// Settle transactions requested so far, failed ones included.
    pub fn settle_calls(&self) -> usize {
        self.settles.load(Ordering::SeqCst)
    }

    fn check_settle(&self) -> Result<()> {
        let n = self.settles.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_settle_at.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        Ok(())
    }

    fn injected() -> Error {
        Error::io(
            "faulty-store",
            std::io::Error::other("injected local store failure"),
        )
    }
}

#[async_trait]
impl LocalStore for FaultyStore {
    async fn active_records(&self, entity: &str, scope: &Scope) -> Result<Vec<SyncableRecord>> {
        self.inner.active_records(entity, scope).await
    }

    async fn record(&self, entity: &str, scope: &Scope, id: Uuid) -> Result<Option<SyncableRecord>> {
        self.inner.record(entity, scope, id).await
    }

    async fn checkpoint(&self, tenant: &TenantId, entity: &str) -> Result<Option<Checkpoint>> {
        self.inner.checkpoint(tenant, entity).await
    }

    async fn apply(&self, batch: ApplyBatch) -> Result<ApplyReport> {
        let n = self.applies.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.fail_apply_at.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.apply(batch).await
    }

    async fn pending_mutations(&self, entity: &str, scope: &Scope) -> Result<Vec<PendingMutation>> {
        self.inner.pending_mutations(entity, scope).await
    }

    async fn settle(&self, settlement: PushSettlement) -> Result<SettleResult> {
        self.check_settle()?;
        self.inner.settle(settlement).await
    }

    async fn settle_all(&self, settlements: Vec<PushSettlement>) -> Result<Vec<SettleResult>> {
        self.check_settle()?;
        self.inner.settle_all(settlements).await
    }

    async fn write_local(
        &self,
        entity: &str,
        scope: &Scope,
        record: SyncableRecord,
    ) -> Result<PendingMutation> {
        self.inner.write_local(entity, scope, record).await
    }

    async fn delete_local(&self, entity: &str, scope: &Scope, id: Uuid) -> Result<PendingMutation> {
        self.inner.delete_local(entity, scope, id).await
    }

    async fn requeue_failed(&self, entity: &str, scope: &Scope) -> Result<usize> {
        self.inner.requeue_failed(entity, scope).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.inner.subscribe()
    }
}
