//! Pull batches and their outcome
//!
//! An [`ApplyBatch`] is everything one pull transaction does: upsert remote
//! rows, apply tombstones, optionally sweep orphans, and advance the
//! checkpoint. The store applies it all-or-nothing.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use farmsync_schema::{SyncableRecord, TenantId, Tombstone};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::Checkpoint;

/// Last-write-wins policy when local and remote `modifiedAt` are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// The remote row replaces the local one on a tie
    #[default]
    RemotePreferred,
    /// Only a strictly newer remote row replaces the local one
    TimestampStrict,
}

impl TieBreak {
    /// Whether a remote row stamped `remote` beats a local row stamped `local`.
    pub fn remote_wins(self, remote: DateTime<Utc>, local: DateTime<Utc>) -> bool {
        match self {
            TieBreak::RemotePreferred => remote >= local,
            TieBreak::TimestampStrict => remote > local,
        }
    }
}

/// Inputs of the orphan sweep that follows a full listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanSweep {
    /// Every id the remote reported, active or tombstoned
    pub seen: HashSet<Uuid>,
    /// Records modified at or after this instant are never swept
    pub cutoff: DateTime<Utc>,
    /// Deletion time stamped on swept records
    pub deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyBatch {
    pub entity: String,
    pub tenant: TenantId,
    pub upserts: Vec<SyncableRecord>,
    pub tombstones: Vec<Tombstone>,
    pub orphan_sweep: Option<OrphanSweep>,
    /// Advance the checkpoint to this instant when the batch commits
    pub checkpoint: Option<DateTime<Utc>>,
    /// Record that a full listing completed at this instant
    pub full_pull_at: Option<DateTime<Utc>>,
    pub tie_break: TieBreak,
}

impl ApplyBatch {
    pub fn new(entity: impl Into<String>, tenant: TenantId, tie_break: TieBreak) -> Self {
        Self {
            entity: entity.into(),
            tenant,
            upserts: Vec::new(),
            tombstones: Vec::new(),
            orphan_sweep: None,
            checkpoint: None,
            full_pull_at: None,
            tie_break,
        }
    }

    pub fn upsert(mut self, record: SyncableRecord) -> Self {
        self.upserts.push(record);
        self
    }

    pub fn tombstone(mut self, tombstone: Tombstone) -> Self {
        self.tombstones.push(tombstone);
        self
    }

    pub fn advance_to(mut self, to: DateTime<Utc>) -> Self {
        self.checkpoint = Some(to);
        self
    }

    pub fn sweep(mut self, sweep: OrphanSweep) -> Self {
        self.orphan_sweep = Some(sweep);
        self
    }

    pub fn full_pull(mut self, at: DateTime<Utc>) -> Self {
        self.full_pull_at = Some(at);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty()
            && self.tombstones.is_empty()
            && self.orphan_sweep.is_none()
            && self.checkpoint.is_none()
            && self.full_pull_at.is_none()
    }
}

/// Counts of what an applied batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub inserted: usize,
    pub replaced: usize,
    /// Remote row identical to the local one
    pub unchanged: usize,
    /// Local row strictly newer (or tied under strict tie-break); kept
    pub kept_local: usize,
    /// Active remote row for a locally deleted record; never resurrected
    pub ignored_deleted: usize,
    pub tombstoned: usize,
    pub already_deleted: usize,
    pub unknown_tombstones: usize,
    pub orphaned: usize,
    /// Dirty flags dropped because the remote won
    pub cleared_mutations: usize,
    /// Ids whose stored state changed
    pub changed: Vec<Uuid>,
    pub checkpoint: Option<Checkpoint>,
}

impl ApplyReport {
    /// Records written from remote rows
    pub fn applied(&self) -> usize {
        self.inserted + self.replaced
    }

    pub fn merge(&mut self, other: ApplyReport) {
        self.inserted += other.inserted;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.kept_local += other.kept_local;
        self.ignored_deleted += other.ignored_deleted;
        self.tombstoned += other.tombstoned;
        self.already_deleted += other.already_deleted;
        self.unknown_tombstones += other.unknown_tombstones;
        self.orphaned += other.orphaned;
        self.cleared_mutations += other.cleared_mutations;
        self.changed.extend(other.changed);
        if other.checkpoint.is_some() {
            self.checkpoint = other.checkpoint;
        }
    }
}
