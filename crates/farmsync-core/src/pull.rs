//! Pull reconciliation for one entity type
//!
//! A pull reads the checkpoint, fetches both remote streams to completion,
//! merges them into one timeline ordered by change time, and applies the
//! timeline in batches. Each batch is one local transaction that also moves
//! the checkpoint to the newest change it contains, so the checkpoint never
//! runs ahead of applied data and an interrupted pull resumes safely.
//!
//! A full listing (first sync, forced, or periodically due) fetches from the
//! epoch and ends with an orphan sweep: local records the remote no longer
//! lists at all are inferred deleted.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use farmsync_remote::{RowIssue, ScopedRemote};
use farmsync_schema::{Scope, SyncableRecord, TenantId, Tombstone, epoch};
use farmsync_store::{ApplyBatch, ApplyReport, LocalStore, OrphanSweep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::{Error, Result};

/// What one entity type's pull did.
#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    pub report: ApplyReport,
    /// Remote rows skipped as malformed or foreign
    pub issues: Vec<RowIssue>,
    /// Whether this was a full listing with an orphan sweep
    pub full: bool,
    pub batches: usize,
}

#[derive(Debug, Clone)]
enum Change {
    Upsert(SyncableRecord),
    Tombstone(Tombstone),
}

impl Change {
    fn at(&self) -> DateTime<Utc> {
        match self {
            Change::Upsert(record) => record.last_changed_at(),
            Change::Tombstone(t) => t.deleted_at,
        }
    }
}

/// Await `future` unless `cancel` fires first.
pub(crate) async fn or_cancelled<T, F>(cancel: &CancellationToken, future: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}

pub struct PullReconciler<'a> {
    store: &'a dyn LocalStore,
    remote: &'a ScopedRemote,
    config: &'a SyncConfig,
}

impl<'a> PullReconciler<'a> {
    pub fn new(store: &'a dyn LocalStore, remote: &'a ScopedRemote, config: &'a SyncConfig) -> Self {
        Self {
            store,
            remote,
            config,
        }
    }

    /// Pull one entity type for `tenant`.
    ///
    /// # Errors
    ///
    /// Remote failures abort before anything is applied. Local store
    /// failures abort mid-way; batches already committed stay committed
    /// together with their checkpoints.
    pub async fn pull(
        &self,
        entity: &str,
        tenant: &TenantId,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome> {
        let descriptor = self.remote.registry().lookup(entity)?;
        let scope = Scope::for_entity(descriptor, tenant);
        let now = Utc::now();

        let checkpoint = self.store.checkpoint(tenant, entity).await?;
        let t0 = checkpoint
            .as_ref()
            .map(|cp| cp.last_synced_at)
            .unwrap_or_else(epoch);
        let full = force_full
            || checkpoint
                .as_ref()
                .is_none_or(|cp| cp.full_pull_due(now, self.config.full_reconcile_interval()));
        let since = if full {
            epoch()
        } else {
            t0 - self.config.clock_skew()
        };

        debug!(entity, scope = %scope, since = %since, full, "Pulling");

        let active = or_cancelled(cancel, async {
            self.remote
                .fetch_active(entity, &scope, since)
                .await
                .map_err(Error::from)
        })
        .await?;
        let tombstones = or_cancelled(cancel, async {
            self.remote
                .fetch_tombstones(entity, &scope, since)
                .await
                .map_err(Error::from)
        })
        .await?;

        let mut seen: HashSet<_> = active.records.iter().map(|r| r.id).collect();
        let deleted: HashSet<_> = tombstones.iter().map(|t| t.id).collect();
        seen.extend(deleted.iter().copied());

        // An id listed in both streams is treated as deleted.
        let mut timeline: Vec<Change> = active
            .records
            .into_iter()
            .filter(|r| !deleted.contains(&r.id))
            .map(Change::Upsert)
            .chain(tombstones.into_iter().map(Change::Tombstone))
            .collect();
        timeline.sort_by_key(Change::at);

        let mut outcome = PullOutcome {
            issues: active.issues,
            full,
            ..PullOutcome::default()
        };

        let batch_size = self.config.apply_batch_size.max(1);
        let mut chunks: Vec<Vec<Change>> = Vec::new();
        let mut rest = timeline.into_iter().peekable();
        while rest.peek().is_some() {
            chunks.push(rest.by_ref().take(batch_size).collect());
        }
        if chunks.is_empty() && full {
            // Nothing changed remotely, but the sweep still runs.
            chunks.push(Vec::new());
        }

        let last = chunks.len().saturating_sub(1);
        for (index, chunk) in chunks.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut batch = ApplyBatch::new(entity, tenant.clone(), self.config.tie_break);
            if let Some(max) = chunk.iter().map(Change::at).max() {
                batch = batch.advance_to(max);
            }
            for change in chunk {
                batch = match change {
                    Change::Upsert(record) => batch.upsert(record),
                    Change::Tombstone(tombstone) => batch.tombstone(tombstone),
                };
            }
            if full && index == last {
                batch = batch
                    .sweep(OrphanSweep {
                        seen: seen.clone(),
                        cutoff: t0 - self.config.orphan_grace(),
                        deleted_at: now,
                    })
                    .full_pull(now);
            }

            let report = self.store.apply(batch).await?;
            outcome.report.merge(report);
            outcome.batches += 1;
        }

        info!(
            entity,
            scope = %scope,
            applied = outcome.report.applied(),
            tombstoned = outcome.report.tombstoned,
            orphaned = outcome.report.orphaned,
            skipped = outcome.issues.len(),
            batches = outcome.batches,
            full,
            "Pulled entity type"
        );
        Ok(outcome)
    }
}
