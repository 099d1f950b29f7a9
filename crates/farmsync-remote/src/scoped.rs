//! Tenant-scoped, decoding, retrying view of a [`RemoteClient`]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use farmsync_schema::{EntityDescriptor, SchemaRegistry, Scope, SyncableRecord, Tombstone};
use uuid::Uuid;

use crate::client::{PageRequest, RemoteClient};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// A remote row that could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowIssue {
    pub id: Option<Uuid>,
    pub reason: String,
}

/// Every active row of one entity type changed since a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActiveFetch {
    pub records: Vec<SyncableRecord>,
    /// Malformed or foreign rows, skipped
    pub issues: Vec<RowIssue>,
    pub pages: usize,
}

/// The engine's entry point to the backend.
///
/// Requests are addressed by entity type, resolved through the registry and
/// scoped by tenant here; a tenant-scoped request without a tenant fails
/// before anything is sent.
#[derive(Clone)]
pub struct ScopedRemote {
    client: Arc<dyn RemoteClient>,
    registry: Arc<SchemaRegistry>,
    policy: RetryPolicy,
    page_size: usize,
}

impl ScopedRemote {
    pub fn new(client: Arc<dyn RemoteClient>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            client,
            registry,
            policy: RetryPolicy::default(),
            page_size: 500,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    fn resolve(&self, entity: &str, scope: &Scope) -> Result<(&EntityDescriptor, Scope)> {
        let descriptor = self.registry.lookup(entity)?;
        let scope = scope.resolve(descriptor).ok_or_else(|| Error::UnscopedRequest {
            table: descriptor.table.clone(),
        })?;
        Ok((descriptor, scope))
    }

    /// Fetch every page of active rows modified at or after `since`.
    ///
    /// Rows that fail to decode, or that belong to another tenant, are
    /// skipped and reported in [`ActiveFetch::issues`].
    pub async fn fetch_active(
        &self,
        entity: &str,
        scope: &Scope,
        since: DateTime<Utc>,
    ) -> Result<ActiveFetch> {
        let (descriptor, scope) = self.resolve(entity, scope)?;
        let mut fetch = ActiveFetch::default();
        let mut cursor = None;

        loop {
            let request = PageRequest {
                cursor: cursor.take(),
                limit: self.page_size,
            };
            let page = self
                .policy
                .run("fetch_active_since", || {
                    self.client
                        .fetch_active_since(&descriptor.table, &scope, since, request.clone())
                })
                .await?;
            fetch.pages += 1;

            for row in page.items {
                match descriptor.decode(&row) {
                    Ok(record) if scope.admits(record.tenant_id.as_ref()) => {
                        fetch.records.push(record)
                    }
                    Ok(record) => fetch.issues.push(RowIssue {
                        id: Some(record.id),
                        reason: format!("row belongs to another tenant, expected {}", scope),
                    }),
                    Err(err) => fetch.issues.push(RowIssue {
                        id: descriptor.peek_id(&row),
                        reason: err.to_string(),
                    }),
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if !fetch.issues.is_empty() {
            tracing::warn!(
                entity,
                scope = %scope,
                skipped = fetch.issues.len(),
                "Skipped unusable remote rows"
            );
        }
        Ok(fetch)
    }

    /// Fetch every page of tombstones with `deletedAt` at or after `since`.
    pub async fn fetch_tombstones(
        &self,
        entity: &str,
        scope: &Scope,
        since: DateTime<Utc>,
    ) -> Result<Vec<Tombstone>> {
        let (descriptor, scope) = self.resolve(entity, scope)?;
        let mut tombstones = Vec::new();
        let mut cursor = None;

        loop {
            let request = PageRequest {
                cursor: cursor.take(),
                limit: self.page_size,
            };
            let page = self
                .policy
                .run("fetch_deleted_since", || {
                    self.client
                        .fetch_deleted_since(&descriptor.table, &scope, since, request.clone())
                })
                .await?;
            tombstones.extend(page.items);

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tombstones)
    }

    /// Upload a record. Returns the record as the server stored it.
    pub async fn upsert(
        &self,
        entity: &str,
        scope: &Scope,
        record: &SyncableRecord,
    ) -> Result<SyncableRecord> {
        let (descriptor, scope) = self.resolve(entity, scope)?;
        if !scope.admits(record.tenant_id.as_ref()) {
            return Err(Error::Validation {
                id: Some(record.id),
                message: format!("record is not owned by {}", scope),
            });
        }
        let row = descriptor.encode(record);
        let stored = self
            .policy
            .run("upsert", || {
                self.client.upsert(&descriptor.table, &scope, row.clone())
            })
            .await?;
        descriptor
            .decode(&stored)
            .map_err(|err| Error::MalformedResponse {
                table: descriptor.table.clone(),
                message: err.to_string(),
            })
    }

    /// Tombstone a record remotely. Returns the server-assigned `deletedAt`.
    pub async fn soft_delete(&self, entity: &str, scope: &Scope, id: Uuid) -> Result<DateTime<Utc>> {
        let (descriptor, scope) = self.resolve(entity, scope)?;
        self.policy
            .run("soft_delete", || {
                self.client.soft_delete(&descriptor.table, &scope, id)
            })
            .await
    }
}
