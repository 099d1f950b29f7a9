//! Entity-type registry and record model for farmsync
//!
//! Everything the reconciliation engine knows about the data it moves lives
//! here: which entity types exist, which of them are tenant scoped, how a
//! wire row maps onto a [`SyncableRecord`], and in which order entity types
//! must be synchronised so that parents land before their children.

pub mod descriptor;
pub mod error;
pub mod record;
pub mod registry;
pub mod tenant;

pub use descriptor::{EntityDescriptor, FieldMap};
pub use error::{Error, Result};
pub use record::{SyncableRecord, Tombstone, epoch};
pub use registry::SchemaRegistry;
pub use tenant::{Scope, TenantId};
