//! The arena-backed local store
//!
//! [`ArenaStore`] keeps every record in an arena addressed by (owner, id)
//! and runs each write as a journalled transaction under the write lock: the
//! change is applied in place, the store is persisted (when file-backed) on
//! the blocking pool, and the journal is then dropped. A failure at any step
//! replays the journal, so the work done is proportional to what the
//! transaction touched and the visible state is left untouched.
//!
//! Readers share the lock and never observe a half-applied batch.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use farmsync_schema::{SchemaRegistry, Scope, SyncableRecord, TenantId};
use tokio::sync::{RwLock, broadcast};
use uuid::Uuid;

use crate::batch::{ApplyBatch, ApplyReport};
use crate::checkpoint::Checkpoint;
use crate::mutation::{PendingMutation, PushSettlement, SettleResult};
use crate::notify::{ChangeNotification, ChangeSource};
use crate::state::{StoreState, resolve_scope};
use crate::{Error, LocalStore, Result, persist};

const NOTIFY_CAPACITY: usize = 256;

pub struct ArenaStore {
    registry: Arc<SchemaRegistry>,
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
    notifier: broadcast::Sender<ChangeNotification>,
}

impl ArenaStore {
    /// Create an empty, memory-only store.
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self::with_state(registry, StoreState::default(), None)
    }

    /// Open a file-backed store, loading `path` if it exists.
    ///
    /// Every committed transaction is saved back to `path` before it
    /// becomes visible.
    pub fn open(registry: Arc<SchemaRegistry>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            persist::load(&path)?
        } else {
            StoreState::default()
        };
        tracing::debug!(path = %path.display(), "Opened local store");
        Ok(Self::with_state(registry, state, Some(path)))
    }

    fn with_state(registry: Arc<SchemaRegistry>, state: StoreState, path: Option<PathBuf>) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            registry,
            state: RwLock::new(state),
            path,
            notifier,
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// A consistent copy of the whole store for readers such as the UI.
    pub async fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            registry: Arc::clone(&self.registry),
            state: self.read(|state| state.clone()).await,
        }
    }

    async fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        let guard = self.state.read().await;
        f(&guard)
    }

    /// Run `f` against the state and commit it on success.
    async fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreState) -> Result<T> + Send,
        T: Send,
    {
        let mut state = self.state.write().await;

        let value = match f(&mut *state) {
            Ok(value) => value,
            Err(err) => {
                state.rollback();
                return Err(err);
            }
        };

        if let Some(path) = &self.path
            && let Err(err) = save(path, &*state).await
        {
            state.rollback();
            return Err(err);
        }

        state.commit();
        Ok(value)
    }

    fn notify(&self, entity: &str, scope: Scope, ids: Vec<Uuid>, source: ChangeSource) {
        if ids.is_empty() {
            return;
        }
        // No receivers is fine.
        let _ = self.notifier.send(ChangeNotification {
            entity: entity.to_string(),
            scope,
            ids,
            source,
        });
    }
}

async fn save(path: &Path, state: &StoreState) -> Result<()> {
    let content = persist::encode(state)?;
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || persist::write(&target, &content))
        .await
        .map_err(|e| Error::io(path, std::io::Error::other(e)))?
}

#[async_trait]
impl LocalStore for ArenaStore {
    async fn active_records(&self, entity: &str, scope: &Scope) -> Result<Vec<SyncableRecord>> {
        let (_, scope) = resolve_scope(&self.registry, entity, scope)?;
        Ok(self.read(|state| state.active_records(entity, &scope)).await)
    }

    async fn record(&self, entity: &str, scope: &Scope, id: Uuid) -> Result<Option<SyncableRecord>> {
        let (_, scope) = resolve_scope(&self.registry, entity, scope)?;
        Ok(self.read(|state| state.record(entity, &scope, id)).await)
    }

    async fn checkpoint(&self, tenant: &TenantId, entity: &str) -> Result<Option<Checkpoint>> {
        self.registry.lookup(entity)?;
        Ok(self.read(|state| state.checkpoint(tenant, entity)).await)
    }

    async fn apply(&self, batch: ApplyBatch) -> Result<ApplyReport> {
        let descriptor = self.registry.lookup(&batch.entity)?;
        let scope = Scope::for_entity(descriptor, &batch.tenant);
        let entity = batch.entity.clone();

        let report = self.transact(|state| state.apply(&scope, batch)).await?;

        tracing::debug!(
            entity = %entity,
            scope = %scope,
            inserted = report.inserted,
            replaced = report.replaced,
            tombstoned = report.tombstoned,
            orphaned = report.orphaned,
            "Applied pull batch"
        );
        self.notify(&entity, scope, report.changed.clone(), ChangeSource::Pull);
        Ok(report)
    }

    async fn pending_mutations(&self, entity: &str, scope: &Scope) -> Result<Vec<PendingMutation>> {
        let (_, scope) = resolve_scope(&self.registry, entity, scope)?;
        Ok(self.read(|state| state.mutations(entity, &scope)).await)
    }

    async fn settle(&self, settlement: PushSettlement) -> Result<SettleResult> {
        let mut results = self.settle_all(vec![settlement]).await?;
        Ok(results.pop().unwrap_or(SettleResult::Missing))
    }

    async fn settle_all(&self, settlements: Vec<PushSettlement>) -> Result<Vec<SettleResult>> {
        let mut resolved = Vec::with_capacity(settlements.len());
        for settlement in settlements {
            let (_, scope) = resolve_scope(&self.registry, &settlement.entity, &settlement.scope)?;
            resolved.push((scope, settlement));
        }

        let settled = self
            .transact(|state| {
                Ok(resolved
                    .into_iter()
                    .map(|(scope, settlement)| {
                        let entity = settlement.entity.clone();
                        let id = settlement.record_id;
                        let (result, changed) = state.settle(&scope, settlement);
                        (entity, scope, id, result, changed)
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        let mut results = Vec::with_capacity(settled.len());
        let mut changed: Vec<(String, Scope, Vec<Uuid>)> = Vec::new();
        for (entity, scope, id, result, was_changed) in settled {
            results.push(result);
            if !was_changed {
                continue;
            }
            match changed.iter_mut().find(|(e, s, _)| *e == entity && *s == scope) {
                Some((_, _, ids)) => ids.push(id),
                None => changed.push((entity, scope, vec![id])),
            }
        }
        for (entity, scope, ids) in changed {
            self.notify(&entity, scope, ids, ChangeSource::Push);
        }
        Ok(results)
    }

    async fn write_local(
        &self,
        entity: &str,
        scope: &Scope,
        record: SyncableRecord,
    ) -> Result<PendingMutation> {
        let (_, scope) = resolve_scope(&self.registry, entity, scope)?;
        let id = record.id;
        let mutation = self
            .transact(|state| state.write_local(entity, &scope, record, Utc::now()))
            .await?;
        self.notify(entity, scope, vec![id], ChangeSource::Local);
        Ok(mutation)
    }

    async fn delete_local(&self, entity: &str, scope: &Scope, id: Uuid) -> Result<PendingMutation> {
        let (_, scope) = resolve_scope(&self.registry, entity, scope)?;
        let mutation = self
            .transact(|state| state.delete_local(entity, &scope, id, Utc::now()))
            .await?;
        self.notify(entity, scope, vec![id], ChangeSource::Local);
        Ok(mutation)
    }

    async fn requeue_failed(&self, entity: &str, scope: &Scope) -> Result<usize> {
        let (_, scope) = resolve_scope(&self.registry, entity, scope)?;
        self.transact(|state| Ok(state.requeue_failed(entity, &scope)))
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeNotification> {
        self.notifier.subscribe()
    }
}

/// A point-in-time copy of an [`ArenaStore`].
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    registry: Arc<SchemaRegistry>,
    state: StoreState,
}

impl StoreSnapshot {
    pub fn active_records(&self, entity: &str, scope: &Scope) -> Result<Vec<SyncableRecord>> {
        let (_, scope) = resolve_scope(&self.registry, entity, scope)?;
        Ok(self.state.active_records(entity, &scope))
    }

    pub fn record(&self, entity: &str, scope: &Scope, id: Uuid) -> Result<Option<SyncableRecord>> {
        let (_, scope) = resolve_scope(&self.registry, entity, scope)?;
        Ok(self.state.record(entity, &scope, id))
    }

    pub fn checkpoint(&self, tenant: &TenantId, entity: &str) -> Option<Checkpoint> {
        self.state.checkpoint(tenant, entity)
    }

    pub fn pending_mutations(&self, entity: &str, scope: &Scope) -> Result<Vec<PendingMutation>> {
        let (_, scope) = resolve_scope(&self.registry, entity, scope)?;
        Ok(self.state.mutations(entity, &scope))
    }

    /// Every checkpoint in the store, ordered by (tenant, entity).
    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.state.checkpoints.values().cloned().collect()
    }
}
