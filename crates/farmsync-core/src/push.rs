//! Push publishing for one entity type
//!
//! Pending mutations are sent one by one, oldest first. Answers are settled
//! in local transactions of up to `settle_batch_size` records, and whatever
//! is buffered is settled before the push returns, even on error. A failure
//! on one record never blocks its siblings. Deletions are always pushed as
//! soft deletes.

use farmsync_remote::{ErrorClass, ScopedRemote};
use farmsync_schema::{Scope, TenantId};
use farmsync_store::{
    LocalStore, MutationOp, PendingMutation, PushOutcome, PushSettlement, SettleResult,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::pull::or_cancelled;
use crate::{Error, Result};

/// What one entity type's push did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    /// Acknowledged, but a newer local write is still pending
    pub superseded: usize,
    /// Failed in this session (retained or newly parked)
    pub failed: usize,
    /// Parked mutations, old and new
    pub parked: usize,
    pub conflicts: usize,
    /// Per-record failures: (record id, reason)
    pub failures: Vec<(Uuid, String)>,
}

/// One remote answer waiting to be settled.
struct Answer {
    settlement: PushSettlement,
    acked: bool,
    failure: Option<String>,
}

pub struct PushPublisher<'a> {
    store: &'a dyn LocalStore,
    remote: &'a ScopedRemote,
    config: &'a SyncConfig,
}

impl<'a> PushPublisher<'a> {
    pub fn new(store: &'a dyn LocalStore, remote: &'a ScopedRemote, config: &'a SyncConfig) -> Self {
        Self {
            store,
            remote,
            config,
        }
    }

    /// Push every pending mutation of one entity type for `tenant`.
    ///
    /// # Errors
    ///
    /// Only session-fatal failures are returned: a local store error,
    /// rejected credentials, or cancellation. Record-level failures are
    /// settled and reported in the [`PushReport`].
    pub async fn push(
        &self,
        entity: &str,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> Result<PushReport> {
        let descriptor = self.remote.registry().lookup(entity)?;
        let scope = Scope::for_entity(descriptor, tenant);
        let mutations = self.store.pending_mutations(entity, &scope).await?;
        let mut report = PushReport::default();
        let mut answered: Vec<Answer> = Vec::new();

        for mutation in mutations {
            if mutation.is_failed() {
                report.parked += 1;
                report.failures.push((
                    mutation.record_id,
                    format!(
                        "parked after {} attempts: {}",
                        mutation.attempts,
                        mutation.last_error.as_deref().unwrap_or("unknown error")
                    ),
                ));
                continue;
            }
            if cancel.is_cancelled() {
                self.settle(&mut answered, &mut report).await?;
                return Err(Error::Cancelled);
            }

            let (outcome, conflict) = match self.publish(entity, &scope, &mutation, cancel).await {
                Ok(answer) => answer,
                Err(err) => {
                    self.settle(&mut answered, &mut report).await?;
                    return Err(err);
                }
            };
            if conflict {
                report.conflicts += 1;
            }
            answered.push(Answer {
                failure: match &outcome {
                    PushOutcome::Retry { error, .. } | PushOutcome::Rejected { error } => {
                        Some(error.clone())
                    }
                    _ => None,
                },
                acked: matches!(outcome, PushOutcome::Acked { .. }),
                settlement: PushSettlement {
                    entity: entity.to_string(),
                    scope: scope.clone(),
                    record_id: mutation.record_id,
                    generation: mutation.generation,
                    outcome,
                },
            });
            if answered.len() >= self.config.settle_batch_size {
                self.settle(&mut answered, &mut report).await?;
            }
        }
        self.settle(&mut answered, &mut report).await?;

        if report.pushed + report.failed > 0 || report.parked > 0 {
            info!(
                entity,
                scope = %scope,
                pushed = report.pushed,
                failed = report.failed,
                parked = report.parked,
                conflicts = report.conflicts,
                "Pushed entity type"
            );
        }
        Ok(report)
    }

    /// Record buffered answers in one local transaction and count them.
    async fn settle(&self, answered: &mut Vec<Answer>, report: &mut PushReport) -> Result<()> {
        if answered.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(answered);
        let settlements = batch.iter().map(|a| a.settlement.clone()).collect();
        let results = self.store.settle_all(settlements).await?;

        for (answer, settled) in batch.into_iter().zip(results) {
            let id = answer.settlement.record_id;
            match settled {
                SettleResult::Cleared => report.pushed += 1,
                // A newer local write owns the mutation now.
                SettleResult::Superseded => {
                    report.superseded += 1;
                    if answer.acked {
                        report.pushed += 1;
                    }
                    continue;
                }
                SettleResult::Retained { .. } => report.failed += 1,
                SettleResult::Parked { .. } => {
                    report.failed += 1;
                    report.parked += 1;
                }
                SettleResult::Missing => {}
            }
            if let Some(error) = answer.failure {
                report.failures.push((id, error));
            }
        }
        Ok(())
    }

    /// Send one mutation and classify the answer. The flag marks conflicts.
    async fn publish(
        &self,
        entity: &str,
        scope: &Scope,
        mutation: &PendingMutation,
        cancel: &CancellationToken,
    ) -> Result<(PushOutcome, bool)> {
        let id = mutation.record_id;
        let sent = match mutation.op {
            MutationOp::Upsert => {
                let Some(record) = self.store.record(entity, scope, id).await? else {
                    debug!(entity, %id, "Record vanished before push, discarding mutation");
                    return Ok((PushOutcome::Discard, false));
                };
                if record.is_deleted() {
                    return Ok((PushOutcome::Discard, false));
                }
                or_cancelled(cancel, async {
                    self.remote
                        .upsert(entity, scope, &record)
                        .await
                        .map(|stored| stored.modified_at)
                        .map_err(Error::from)
                })
                .await
            }
            MutationOp::SoftDelete => {
                or_cancelled(cancel, async {
                    self.remote
                        .soft_delete(entity, scope, id)
                        .await
                        .map_err(Error::from)
                })
                .await
            }
        };

        let err = match sent {
            Ok(server_time) => return Ok((PushOutcome::Acked { server_time }, false)),
            Err(Error::Remote(err)) => err,
            Err(other) => return Err(other),
        };

        let outcome = match err.class() {
            ErrorClass::Retryable => PushOutcome::Retry {
                error: err.to_string(),
                max_attempts: self.config.max_push_attempts,
            },
            ErrorClass::Conflict => {
                warn!(entity, %id, error = %err, "Remote rejected write as conflicting");
                return Ok((
                    PushOutcome::Retry {
                        error: err.to_string(),
                        max_attempts: self.config.max_push_attempts,
                    },
                    true,
                ));
            }
            ErrorClass::Rejected
                if mutation.op == MutationOp::SoftDelete
                    && matches!(err, farmsync_remote::Error::Server { status: 404, .. }) =>
            {
                // Never reached the server; nothing to delete there.
                debug!(entity, %id, "Soft delete of unknown remote row, discarding");
                PushOutcome::Discard
            }
            ErrorClass::Rejected => {
                warn!(entity, %id, error = %err, "Remote rejected record");
                PushOutcome::Rejected {
                    error: err.to_string(),
                }
            }
            ErrorClass::Auth | ErrorClass::Fatal => return Err(err.into()),
        };
        Ok((outcome, false))
    }
}
