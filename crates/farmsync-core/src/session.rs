//! Sync sessions, their per-entity statistics, and progress reports

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use farmsync_schema::TenantId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Which phases a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    PullOnly,
    PushOnly,
}

impl SyncMode {
    pub fn pulls(self) -> bool {
        matches!(self, SyncMode::Full | SyncMode::PullOnly)
    }

    pub fn pushes(self) -> bool {
        matches!(self, SyncMode::Full | SyncMode::PushOnly)
    }
}

/// What asked for the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    /// The app came to the foreground
    Foreground,
    /// The user asked for it
    User,
    /// The periodic timer fired
    Periodic,
}

/// `idle -> pulling -> pushing -> {succeeded | failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Pulling,
    Pushing,
    Succeeded,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Succeeded | SessionStatus::Failed)
    }
}

/// A request to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub mode: SyncMode,
    pub trigger: SyncTrigger,
    /// Force a full listing (and orphan sweep) for every entity type
    pub full_reconcile: bool,
}

impl SyncRequest {
    pub fn new(mode: SyncMode, trigger: SyncTrigger) -> Self {
        Self {
            mode,
            trigger,
            full_reconcile: false,
        }
    }

    pub fn full_reconcile(mut self) -> Self {
        self.full_reconcile = true;
        self
    }
}

/// Counts for one entity type within a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    /// Remote rows written locally
    pub applied: usize,
    pub tombstoned: usize,
    pub orphaned: usize,
    /// Local mutations acknowledged by the remote
    pub pushed: usize,
    /// Records that failed to pull or push in this session
    pub failed: usize,
    /// Mutations parked after persistent failure, reported until requeued
    pub parked: usize,
    pub conflicts: usize,
    /// Remote rows that could not be decoded
    pub malformed: usize,
    /// Set when the entity type was not processed (failed parent or pull)
    pub skipped: bool,
    /// Set when the entity type's pull or push failed as a whole
    pub errored: bool,
}

/// A record-level problem surfaced in the session report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordIssue {
    pub entity: String,
    pub record_id: Option<Uuid>,
    pub reason: String,
}

/// Coarse reason a session failed; safe to show to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    /// Credentials must be refreshed before the next attempt
    Auth,
    LocalStore,
    /// One or more entity types could not reach the remote
    Remote,
    Internal,
}

impl FailureKind {
    fn of(error: &Error) -> Self {
        match error {
            Error::Cancelled => FailureKind::Cancelled,
            Error::Store(_) => FailureKind::LocalStore,
            Error::Remote(err) if err.class() == farmsync_remote::ErrorClass::Auth => {
                FailureKind::Auth
            }
            Error::Remote(_) => FailureKind::Remote,
            _ => FailureKind::Internal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    /// Diagnostic detail for logs; never shown to users
    pub detail: String,
}

/// One coordinator run for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: Uuid,
    pub tenant: TenantId,
    pub mode: SyncMode,
    pub trigger: SyncTrigger,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: BTreeMap<String, EntityStats>,
    pub issues: Vec<RecordIssue>,
    pub failure: Option<SessionFailure>,
}

impl SyncSession {
    pub fn new(tenant: TenantId, request: SyncRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant,
            mode: request.mode,
            trigger: request.trigger,
            status: SessionStatus::Idle,
            started_at: Utc::now(),
            completed_at: None,
            stats: BTreeMap::new(),
            issues: Vec::new(),
            failure: None,
        }
    }

    pub fn stats_mut(&mut self, entity: &str) -> &mut EntityStats {
        self.stats.entry(entity.to_string()).or_default()
    }

    pub fn stats(&self, entity: &str) -> Option<&EntityStats> {
        self.stats.get(entity)
    }

    pub fn record_issue(&mut self, entity: &str, record_id: Option<Uuid>, reason: impl Into<String>) {
        self.issues.push(RecordIssue {
            entity: entity.to_string(),
            record_id,
            reason: reason.into(),
        });
    }

    pub(crate) fn succeed(&mut self) {
        self.status = SessionStatus::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, kind: FailureKind, detail: impl Into<String>) {
        self.status = SessionStatus::Failed;
        self.failure = Some(SessionFailure {
            kind,
            detail: detail.into(),
        });
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail_with(&mut self, error: &Error) {
        self.fail(FailureKind::of(error), error.to_string());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn succeeded(&self) -> bool {
        self.status == SessionStatus::Succeeded
    }

    /// Sum of one statistic over every entity type.
    pub fn total(&self, stat: impl Fn(&EntityStats) -> usize) -> usize {
        self.stats.values().map(stat).sum()
    }

    /// The user-facing view of the session.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            status: self.status,
            failure: self.failure.as_ref().map(|f| f.kind),
            applied: self.total(|s| s.applied),
            pushed: self.total(|s| s.pushed),
            failed_records: self.total(|s| s.failed),
            parked_records: self.total(|s| s.parked),
        }
    }
}

/// Status and counts a UI may display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub status: SessionStatus,
    pub failure: Option<FailureKind>,
    pub applied: usize,
    pub pushed: usize,
    pub failed_records: usize,
    pub parked_records: usize,
}

/// Completed entity-type phases out of the session total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncProgress {
    pub tenant: TenantId,
    pub status: SessionStatus,
    pub completed: usize,
    pub total: usize,
}

impl SyncProgress {
    pub fn idle(tenant: TenantId) -> Self {
        Self {
            tenant,
            status: SessionStatus::Idle,
            completed: 0,
            total: 0,
        }
    }
}
