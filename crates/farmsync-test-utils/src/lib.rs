//! Shared test fixtures for the farmsync workspace.
//!
//! Dev-dependency only, never published.
//!
//! # Modules
//!
//! - [`fixtures`]: tenants, timestamps and record builders
//! - [`remote`]: [`InMemoryRemote`], a scriptable backend with fault injection
//! - [`store`]: [`FaultyStore`], a local store that fails on demand

pub mod fixtures;
pub mod remote;
pub mod store;

pub use remote::{Fault, InMemoryRemote, RemoteCall, RemoteOp};
pub use store::FaultyStore;
