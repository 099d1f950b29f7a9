//! Error types for farmsync-core

use std::path::PathBuf;

use farmsync_remote::ErrorClass;

/// Result type for farmsync-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in farmsync-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The session was cancelled at a batch boundary
    #[error("Sync cancelled")]
    Cancelled,

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Transparent wrappers for underlying crate errors
    /// Schema error from farmsync-schema
    #[error(transparent)]
    Schema(#[from] farmsync_schema::Error),

    /// Local store error from farmsync-store
    #[error(transparent)]
    Store(#[from] farmsync_store::Error),

    /// Remote error from farmsync-remote
    #[error(transparent)]
    Remote(#[from] farmsync_remote::Error),

    /// TOML deserialization error
    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error aborts the whole session rather than one entity type.
    ///
    /// Local store failures, rejected credentials, programming errors and
    /// cancellation stop everything; transport failures only stop the entity
    /// type they occurred in.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            Error::Remote(err) => matches!(err.class(), ErrorClass::Auth | ErrorClass::Fatal),
            _ => true,
        }
    }
}
