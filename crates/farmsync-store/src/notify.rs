//! Change notifications for external subscribers (the UI layer)

use farmsync_schema::Scope;
use uuid::Uuid;

/// Where a committed change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Pull,
    Push,
    Local,
}

/// Emitted after every committed transaction that changed records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub entity: String,
    pub scope: Scope,
    pub ids: Vec<Uuid>,
    pub source: ChangeSource,
}
