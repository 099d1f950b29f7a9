//! Sync engine for farmsync
//!
//! Keeps an embedded local store and a remote backend in agreement for one
//! tenant at a time:
//!
//! - [`PullReconciler`]: fetches remote changes since the checkpoint and
//!   applies them in checkpointed batches, inferring deletions on full
//!   listings.
//! - [`PushPublisher`]: sends dirty local mutations and settles each answer.
//! - [`SyncCoordinator`]: orders entity types by dependency, runs pull then
//!   push, and allows one session per tenant at a time.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod pull;
pub mod push;
pub mod session;

pub use config::SyncConfig;
pub use coordinator::SyncCoordinator;
pub use error::{Error, Result};
pub use pull::{PullOutcome, PullReconciler};
pub use push::{PushPublisher, PushReport};
pub use session::{
    EntityStats, FailureKind, RecordIssue, SessionFailure, SessionStatus, SessionSummary,
    SyncMode, SyncProgress, SyncRequest, SyncSession, SyncTrigger,
};
