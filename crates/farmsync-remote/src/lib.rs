//! Remote client adapter for farmsync
//!
//! Two layers:
//!
//! - [`RemoteClient`]: the raw backend operations, implemented by the host
//!   over its transport of choice.
//! - [`ScopedRemote`]: what the engine calls. It resolves entity types to
//!   tables, rejects unscoped requests for tenant-scoped tables, decodes and
//!   validates rows, and wraps every call in [`RetryPolicy`].

pub mod client;
pub mod error;
pub mod retry;
pub mod scoped;

pub use client::{Page, PageRequest, RemoteClient};
pub use error::{Error, ErrorClass, Result};
pub use retry::RetryPolicy;
pub use scoped::{ActiveFetch, RowIssue, ScopedRemote};
