//! Error types for farmsync-remote

use uuid::Uuid;

/// Result type for farmsync-remote operations
pub type Result<T> = std::result::Result<T, Error>;

/// How the engine reacts to a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport failure, timeout or 5xx; retried with backoff
    Retryable,
    /// Credentials rejected; aborts the whole session
    Auth,
    /// The request itself is invalid (4xx); terminal for the record
    Rejected,
    /// The remote refused a write due to a concurrent change
    Conflict,
    /// Programming or configuration error; never retried
    Fatal,
}

/// Errors that can occur in farmsync-remote operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("Validation failed for {id:?}: {message}")]
    Validation { id: Option<Uuid>, message: String },

    #[error("Write conflict on {id}: {message}")]
    Conflict { id: Uuid, message: String },

    /// Bounded retries ran out; the last underlying error is attached
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<Error> },

    /// A tenant-scoped table was requested without a tenant
    #[error("Unscoped request against tenant-scoped table {table}")]
    UnscopedRequest { table: String },

    #[error("Malformed response from {table}: {message}")]
    MalformedResponse { table: String, message: String },

    #[error(transparent)]
    Schema(#[from] farmsync_schema::Error),
}

impl Error {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Network { .. } | Error::Timeout { .. } | Error::MalformedResponse { .. } => {
                ErrorClass::Retryable
            }
            Error::Server { status, .. } => match *status {
                401 | 403 => ErrorClass::Auth,
                409 => ErrorClass::Conflict,
                408 | 429 => ErrorClass::Retryable,
                400..=499 => ErrorClass::Rejected,
                _ => ErrorClass::Retryable,
            },
            Error::Auth { .. } => ErrorClass::Auth,
            Error::Validation { .. } => ErrorClass::Rejected,
            Error::Conflict { .. } => ErrorClass::Conflict,
            // Terminal for this call, but a later session may try again
            Error::RetriesExhausted { .. } => ErrorClass::Retryable,
            Error::UnscopedRequest { .. } | Error::Schema(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}
