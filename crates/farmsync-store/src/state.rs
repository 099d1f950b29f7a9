//! In-memory arena of records, checkpoints and mutations
//!
//! Records are addressed by (owner, id) so that colliding ids across tenants
//! never alias. Every change made inside a transaction is journalled so the
//! transaction can be rolled back in time proportional to what it touched;
//! see [`crate::ArenaStore`].

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use farmsync_schema::{EntityDescriptor, Scope, SchemaRegistry, SyncableRecord, TenantId, Tombstone};
use uuid::Uuid;

use crate::batch::{ApplyBatch, ApplyReport, OrphanSweep, TieBreak};
use crate::checkpoint::Checkpoint;
use crate::mutation::{
    MutationOp, MutationState, PendingMutation, PushOutcome, PushSettlement, SettleResult,
};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct RecordKey {
    pub tenant: Option<TenantId>,
    pub id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct MutationKey {
    pub entity: String,
    pub tenant: Option<TenantId>,
    pub id: Uuid,
}

pub(crate) type Table = BTreeMap<RecordKey, SyncableRecord>;

type CheckpointKey = (TenantId, String);

/// The prior value of one entry changed by the open transaction.
#[derive(Debug, Clone)]
enum Undo {
    Record {
        entity: String,
        key: RecordKey,
        before: Option<SyncableRecord>,
    },
    Mutation {
        key: MutationKey,
        before: Option<PendingMutation>,
    },
    Checkpoint {
        key: CheckpointKey,
        before: Option<Checkpoint>,
    },
    Generation(u64),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    pub tables: HashMap<String, Table>,
    pub checkpoints: BTreeMap<CheckpointKey, Checkpoint>,
    pub mutations: BTreeMap<MutationKey, PendingMutation>,
    pub next_generation: u64,
    journal: Vec<Undo>,
}

/// Resolve `scope` for `entity`, refusing unscoped access to tenant-scoped types.
pub(crate) fn resolve_scope<'r>(
    registry: &'r SchemaRegistry,
    entity: &str,
    scope: &Scope,
) -> Result<(&'r EntityDescriptor, Scope)> {
    let descriptor = registry.lookup(entity)?;
    let resolved = scope.resolve(descriptor).ok_or_else(|| Error::UnscopedQuery {
        entity: entity.to_string(),
    })?;
    Ok((descriptor, resolved))
}

fn mutation_key(entity: &str, scope: &Scope, id: Uuid) -> MutationKey {
    MutationKey {
        entity: entity.to_string(),
        tenant: scope.tenant().cloned(),
        id,
    }
}

fn record_key(scope: &Scope, id: Uuid) -> RecordKey {
    RecordKey {
        tenant: scope.tenant().cloned(),
        id,
    }
}

impl StoreState {
    pub fn active_records(&self, entity: &str, scope: &Scope) -> Vec<SyncableRecord> {
        self.tables
            .get(entity)
            .map(|table| {
                table
                    .values()
                    .filter(|r| r.is_active() && scope.admits(r.tenant_id.as_ref()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn record(&self, entity: &str, scope: &Scope, id: Uuid) -> Option<SyncableRecord> {
        self.tables
            .get(entity)
            .and_then(|table| table.get(&record_key(scope, id)))
            .cloned()
    }

    pub fn checkpoint(&self, tenant: &TenantId, entity: &str) -> Option<Checkpoint> {
        self.checkpoints
            .get(&(tenant.clone(), entity.to_string()))
            .cloned()
    }

    pub fn mutations(&self, entity: &str, scope: &Scope) -> Vec<PendingMutation> {
        let mut found: Vec<PendingMutation> = self
            .mutations
            .iter()
            .filter(|(key, _)| key.entity == entity && scope.admits(key.tenant.as_ref()))
            .map(|(_, m)| m.clone())
            .collect();
        found.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then(a.generation.cmp(&b.generation))
        });
        found
    }

    /// Forget the journal, making every change since the last commit final.
    pub fn commit(&mut self) {
        self.journal.clear();
    }

    /// Undo every change since the last commit, newest first.
    pub fn rollback(&mut self) {
        while let Some(undo) = self.journal.pop() {
            match undo {
                Undo::Record {
                    entity,
                    key,
                    before,
                } => {
                    let table = self.tables.entry(entity).or_default();
                    match before {
                        Some(record) => table.insert(key, record),
                        None => table.remove(&key),
                    };
                }
                Undo::Mutation { key, before } => {
                    match before {
                        Some(mutation) => self.mutations.insert(key, mutation),
                        None => self.mutations.remove(&key),
                    };
                }
                Undo::Checkpoint { key, before } => {
                    match before {
                        Some(cp) => self.checkpoints.insert(key, cp),
                        None => self.checkpoints.remove(&key),
                    };
                }
                Undo::Generation(generation) => self.next_generation = generation,
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.journal.push(Undo::Generation(self.next_generation));
        self.next_generation += 1;
        self.next_generation
    }

    fn record_mut(&mut self, entity: &str, key: &RecordKey) -> Option<&mut SyncableRecord> {
        let before = self.tables.get(entity)?.get(key)?.clone();
        self.journal.push(Undo::Record {
            entity: entity.to_string(),
            key: key.clone(),
            before: Some(before),
        });
        self.tables.get_mut(entity)?.get_mut(key)
    }

    fn put_record(&mut self, entity: &str, key: RecordKey, record: SyncableRecord) {
        let before = self
            .tables
            .entry(entity.to_string())
            .or_default()
            .insert(key.clone(), record);
        self.journal.push(Undo::Record {
            entity: entity.to_string(),
            key,
            before,
        });
    }

    fn mutation_mut(&mut self, key: &MutationKey) -> Option<&mut PendingMutation> {
        let before = self.mutations.get(key)?.clone();
        self.journal.push(Undo::Mutation {
            key: key.clone(),
            before: Some(before),
        });
        self.mutations.get_mut(key)
    }

    fn put_mutation(&mut self, key: MutationKey, mutation: PendingMutation) {
        let before = self.mutations.insert(key.clone(), mutation);
        self.journal.push(Undo::Mutation { key, before });
    }

    fn remove_mutation(&mut self, key: &MutationKey) -> bool {
        let Some(before) = self.mutations.remove(key) else {
            return false;
        };
        self.journal.push(Undo::Mutation {
            key: key.clone(),
            before: Some(before),
        });
        true
    }

    /// Apply one pull batch. The caller rolls back on error.
    pub fn apply(&mut self, scope: &Scope, batch: ApplyBatch) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        let ApplyBatch {
            entity,
            tenant,
            upserts,
            tombstones,
            orphan_sweep,
            checkpoint,
            full_pull_at,
            tie_break,
        } = batch;

        for record in upserts {
            if let Some(deleted_at) = record.deleted_at {
                self.apply_tombstone(
                    &entity,
                    scope,
                    Tombstone {
                        id: record.id,
                        deleted_at,
                    },
                    &mut report,
                );
                continue;
            }
            self.apply_upsert(&entity, scope, record, tie_break, &mut report)?;
        }

        for tombstone in tombstones {
            self.apply_tombstone(&entity, scope, tombstone, &mut report);
        }

        if let Some(sweep) = orphan_sweep {
            self.sweep_orphans(&entity, scope, &sweep, &mut report);
        }

        if checkpoint.is_some() || full_pull_at.is_some() {
            let key = (tenant.clone(), entity.clone());
            let before = self.checkpoints.get(&key).cloned();
            let mut cp = before
                .clone()
                .unwrap_or_else(|| Checkpoint::new(tenant, entity));
            if let Some(to) = checkpoint {
                cp.advance(to);
            }
            if let Some(at) = full_pull_at {
                cp.last_full_pull_at = Some(at);
            }
            self.checkpoints.insert(key.clone(), cp.clone());
            self.journal.push(Undo::Checkpoint { key, before });
            report.checkpoint = Some(cp);
        }

        Ok(report)
    }

    fn apply_upsert(
        &mut self,
        entity: &str,
        scope: &Scope,
        remote: SyncableRecord,
        tie_break: TieBreak,
        report: &mut ApplyReport,
    ) -> Result<()> {
        if !scope.admits(remote.tenant_id.as_ref()) {
            return Err(Error::TenantMismatch {
                entity: entity.to_string(),
                id: remote.id,
                expected: scope.to_string(),
                found: remote
                    .tenant_id
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "no tenant".to_string()),
            });
        }

        let key = record_key(scope, remote.id);
        let id = remote.id;
        match self.tables.get(entity).and_then(|table| table.get(&key)) {
            None => {
                self.put_record(entity, key, remote);
                report.inserted += 1;
                report.changed.push(id);
            }
            Some(local) if local.is_deleted() => {
                report.ignored_deleted += 1;
            }
            Some(local) if tie_break.remote_wins(remote.modified_at, local.modified_at) => {
                if *local == remote {
                    report.unchanged += 1;
                } else {
                    self.put_record(entity, key, remote);
                    report.replaced += 1;
                    report.changed.push(id);
                }
                if self.remove_mutation(&mutation_key(entity, scope, id)) {
                    report.cleared_mutations += 1;
                }
            }
            Some(_) => {
                report.kept_local += 1;
            }
        }
        Ok(())
    }

    fn apply_tombstone(
        &mut self,
        entity: &str,
        scope: &Scope,
        tombstone: Tombstone,
        report: &mut ApplyReport,
    ) {
        let key = record_key(scope, tombstone.id);
        let Some(local) = self.tables.get(entity).and_then(|table| table.get(&key)) else {
            report.unknown_tombstones += 1;
            return;
        };

        if local.is_deleted() {
            report.already_deleted += 1;
        } else if let Some(local) = self.record_mut(entity, &key) {
            local.deleted_at = Some(tombstone.deleted_at);
            report.tombstoned += 1;
            report.changed.push(tombstone.id);
        }

        // The remote tombstone wins over any local edit.
        if self.remove_mutation(&mutation_key(entity, scope, tombstone.id)) {
            report.cleared_mutations += 1;
        }
    }

    fn sweep_orphans(
        &mut self,
        entity: &str,
        scope: &Scope,
        sweep: &OrphanSweep,
        report: &mut ApplyReport,
    ) {
        let Some(table) = self.tables.get(entity) else {
            return;
        };
        let orphans: Vec<RecordKey> = table
            .iter()
            .filter(|(_, record)| {
                record.is_active()
                    && scope.admits(record.tenant_id.as_ref())
                    && record.modified_at < sweep.cutoff
                    && !sweep.seen.contains(&record.id)
                    && !self
                        .mutations
                        .contains_key(&mutation_key(entity, scope, record.id))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in orphans {
            if let Some(record) = self.record_mut(entity, &key) {
                record.deleted_at = Some(sweep.deleted_at);
                report.orphaned += 1;
                report.changed.push(key.id);
            }
        }
    }

    /// Write a record on behalf of the app and flag it dirty.
    ///
    /// The stored `modified_at` is stamped with the write time and never
    /// moves backwards, so the edit outranks the version it was made from.
    pub fn write_local(
        &mut self,
        entity: &str,
        scope: &Scope,
        mut record: SyncableRecord,
        now: DateTime<Utc>,
    ) -> Result<PendingMutation> {
        if record.tenant_id.as_ref() != scope.tenant() {
            return Err(Error::TenantMismatch {
                entity: entity.to_string(),
                id: record.id,
                expected: scope.to_string(),
                found: record
                    .tenant_id
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "no tenant".to_string()),
            });
        }
        let id = record.id;
        let key = record_key(scope, id);
        let existing = self.tables.get(entity).and_then(|table| table.get(&key));
        if existing.is_some_and(|r| r.is_deleted()) || record.is_deleted() {
            return Err(Error::RecordDeleted {
                entity: entity.to_string(),
                id,
            });
        }
        let floor = existing.map_or(now, |r| r.modified_at.max(now));
        record.modified_at = record.modified_at.max(floor);
        self.put_record(entity, key, record);
        Ok(self.queue(entity, scope, id, MutationOp::Upsert, now))
    }

    /// Soft-delete a record on behalf of the app and flag it dirty.
    pub fn delete_local(
        &mut self,
        entity: &str,
        scope: &Scope,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<PendingMutation> {
        let record = self
            .record_mut(entity, &record_key(scope, id))
            .ok_or_else(|| Error::UnknownRecord {
                entity: entity.to_string(),
                id,
            })?;
        if record.is_deleted() {
            return Err(Error::RecordDeleted {
                entity: entity.to_string(),
                id,
            });
        }
        record.deleted_at = Some(at);
        record.modified_at = record.modified_at.max(at);
        Ok(self.queue(entity, scope, id, MutationOp::SoftDelete, at))
    }

    fn queue(
        &mut self,
        entity: &str,
        scope: &Scope,
        id: Uuid,
        op: MutationOp,
        now: DateTime<Utc>,
    ) -> PendingMutation {
        let generation = self.bump_generation();
        let key = mutation_key(entity, scope, id);
        // A rewrite keeps its place in the queue.
        let queued_at = self.mutations.get(&key).map_or(now, |m| m.queued_at);
        let mutation = PendingMutation {
            entity: entity.to_string(),
            tenant: scope.tenant().cloned(),
            record_id: id,
            op,
            attempts: 0,
            state: MutationState::Pending,
            last_error: None,
            generation,
            queued_at,
        };
        self.put_mutation(key, mutation.clone());
        mutation
    }

    /// Apply the remote's answer to one pushed mutation.
    ///
    /// Returns the settle result and whether the local record changed. An
    /// answer for an older generation changes nothing; the newer local write
    /// is pushed on its own.
    pub fn settle(&mut self, scope: &Scope, settlement: PushSettlement) -> (SettleResult, bool) {
        let key = mutation_key(&settlement.entity, scope, settlement.record_id);
        let Some(current) = self.mutations.get(&key) else {
            return (SettleResult::Missing, false);
        };
        let op = current.op;
        if current.generation != settlement.generation {
            return (SettleResult::Superseded, false);
        }

        match settlement.outcome {
            PushOutcome::Acked { server_time } => {
                self.remove_mutation(&key);
                let record_key = record_key(scope, settlement.record_id);
                let changed = match self.record_mut(&settlement.entity, &record_key) {
                    Some(record) => match op {
                        MutationOp::Upsert => {
                            let changed = record.modified_at != server_time;
                            record.modified_at = server_time;
                            changed
                        }
                        MutationOp::SoftDelete => {
                            let changed = record.deleted_at != Some(server_time);
                            record.deleted_at = Some(server_time);
                            changed
                        }
                    },
                    None => false,
                };
                (SettleResult::Cleared, changed)
            }
            PushOutcome::Retry {
                error,
                max_attempts,
            } => {
                let Some(mutation) = self.mutation_mut(&key) else {
                    return (SettleResult::Missing, false);
                };
                mutation.attempts += 1;
                mutation.last_error = Some(error);
                let attempts = mutation.attempts;
                if attempts >= max_attempts {
                    mutation.state = MutationState::Failed;
                    (SettleResult::Parked { attempts }, false)
                } else {
                    (SettleResult::Retained { attempts }, false)
                }
            }
            PushOutcome::Rejected { error } => {
                let Some(mutation) = self.mutation_mut(&key) else {
                    return (SettleResult::Missing, false);
                };
                mutation.attempts += 1;
                mutation.last_error = Some(error);
                mutation.state = MutationState::Failed;
                (
                    SettleResult::Parked {
                        attempts: mutation.attempts,
                    },
                    false,
                )
            }
            PushOutcome::Discard => {
                self.remove_mutation(&key);
                (SettleResult::Cleared, false)
            }
        }
    }

    pub fn requeue_failed(&mut self, entity: &str, scope: &Scope) -> usize {
        let parked: Vec<MutationKey> = self
            .mutations
            .iter()
            .filter(|(key, m)| {
                key.entity == entity && scope.admits(key.tenant.as_ref()) && m.is_failed()
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &parked {
            if let Some(mutation) = self.mutation_mut(key) {
                mutation.state = MutationState::Pending;
                mutation.attempts = 0;
            }
        }
        parked.len()
    }
}
