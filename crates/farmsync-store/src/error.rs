//! Error types for farmsync-store
//!
//! Every variant is a local-store failure; callers treat all of them as
//! fatal to the running sync session.

use std::path::PathBuf;

use uuid::Uuid;

/// Result type for farmsync-store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in farmsync-store operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store file {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Lock acquisition failed for {path}")]
    LockFailed { path: PathBuf },

    /// A tenant-scoped entity type was queried without a tenant
    #[error("Unscoped query against tenant-scoped entity type {entity}")]
    UnscopedQuery { entity: String },

    #[error("Record {id} of {entity} is owned by {found}, not visible in {expected}")]
    TenantMismatch {
        entity: String,
        id: Uuid,
        expected: String,
        found: String,
    },

    #[error("Record {id} of {entity} not found")]
    UnknownRecord { entity: String, id: Uuid },

    /// Deletion is terminal; a deleted record cannot be written again
    #[error("Record {id} of {entity} is deleted")]
    RecordDeleted { entity: String, id: Uuid },

    #[error(transparent)]
    Schema(#[from] farmsync_schema::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
