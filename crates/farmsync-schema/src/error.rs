//! Error types for farmsync-schema

/// Result type for farmsync-schema operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while registering entity types or decoding rows
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Entity type was queried before it was registered
    #[error("Unknown entity type: {entity}")]
    UnknownEntityType { entity: String },

    #[error("Entity type already registered: {entity}")]
    DuplicateEntityType { entity: String },

    /// Parents must be registered before the children that reference them
    #[error("Entity type {entity} references unregistered parent {parent}")]
    UnknownParent { entity: String, parent: String },

    /// A wire row could not be turned into a record
    #[error("Malformed {entity} record: {message}")]
    MalformedRecord { entity: String, message: String },

    #[error("Invalid tenant id: {value:?}")]
    InvalidTenant { value: String },
}

impl Error {
    pub fn malformed(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            entity: entity.into(),
            message: message.into(),
        }
    }
}
