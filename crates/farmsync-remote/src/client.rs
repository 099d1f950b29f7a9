//! The transport-level remote API
//!
//! A [`RemoteClient`] speaks to the backend in wire rows (`serde_json::Value`)
//! and knows nothing about entity types. Host applications implement it over
//! their HTTP client; [`crate::ScopedRemote`] layers tenant scoping,
//! decoding and retries on top.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use farmsync_schema::{Scope, Tombstone};
use serde_json::Value;
use uuid::Uuid;

use crate::Result;

/// One page request: an opaque cursor from the previous page and a limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            cursor: None,
            limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` on the last page
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Logical operations of the backend API.
///
/// `scope` is the tenant filter the request runs under; implementations
/// must apply it server-side.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Non-tombstoned rows with `modifiedAt >= since`.
    async fn fetch_active_since(
        &self,
        table: &str,
        scope: &Scope,
        since: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<Value>>;

    /// Tombstoned rows with `deletedAt >= since`.
    async fn fetch_deleted_since(
        &self,
        table: &str,
        scope: &Scope,
        since: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<Tombstone>>;

    /// Create or replace by id. Returns the stored row with its
    /// server-assigned `modifiedAt`.
    async fn upsert(&self, table: &str, scope: &Scope, row: Value) -> Result<Value>;

    /// Set the tombstone remotely. Returns the server-assigned `deletedAt`.
    async fn soft_delete(&self, table: &str, scope: &Scope, id: Uuid) -> Result<DateTime<Utc>>;
}
