//! [`InMemoryRemote`]: a scriptable backend for engine tests.
//!
//! Rows are stored as wire JSON exactly as a real backend would hold them.
//! The server owns a clock that ticks one second per write, so assigned
//! timestamps are deterministic.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use farmsync_remote::{Error, Page, PageRequest, RemoteClient, Result};
use farmsync_schema::{
    EntityDescriptor, SchemaRegistry, Scope, SyncableRecord, TenantId, Tombstone,
};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::fixtures;

/// Remote operations, for fault injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    FetchActive,
    FetchDeleted,
    Upsert,
    SoftDelete,
}

/// An injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Network,
    Server(u16),
    Auth,
    Validation,
    Conflict,
    /// Never answer (until the caller times out or is cancelled)
    Hang,
}

impl Fault {
    fn error(self, id: Option<Uuid>) -> Error {
        match self {
            Fault::Network | Fault::Hang => Error::network("injected network failure"),
            Fault::Server(status) => Error::server(status, "injected server failure"),
            Fault::Auth => Error::Auth {
                message: "token expired".into(),
            },
            Fault::Validation => Error::Validation {
                id,
                message: "injected validation failure".into(),
            },
            Fault::Conflict => Error::Conflict {
                id: id.unwrap_or_default(),
                message: "injected conflict".into(),
            },
        }
    }
}

/// One logged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub table: String,
    pub tenant: Option<TenantId>,
    pub since: Option<DateTime<Utc>>,
    pub id: Option<Uuid>,
}

#[derive(Debug, Default)]
struct RemoteState {
    clock: DateTime<Utc>,
    /// table -> (owner, id) -> wire row
    rows: HashMap<String, BTreeMap<(Option<TenantId>, Uuid), Value>>,
    /// Rows returned verbatim by every active fetch of a table
    raw: HashMap<String, Vec<Value>>,
    op_faults: HashMap<(RemoteOp, Option<String>), VecDeque<Fault>>,
    record_faults: HashMap<Uuid, Fault>,
    calls: Vec<RemoteCall>,
}

pub struct InMemoryRemote {
    registry: Arc<SchemaRegistry>,
    state: Mutex<RemoteState>,
    paused: watch::Sender<bool>,
}

impl InMemoryRemote {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            registry,
            state: Mutex::new(RemoteState {
                clock: fixtures::at(1_000),
                ..RemoteState::default()
            }),
            paused,
        }
    }

    fn descriptor(&self, entity: &str) -> &EntityDescriptor {
        self.registry.lookup(entity).unwrap()
    }

    fn descriptor_for_table(&self, table: &str) -> &EntityDescriptor {
        self.registry
            .entity_types()
            .find(|d| d.table == table)
            .unwrap_or_else(|| panic!("InMemoryRemote: unknown table {}", table))
    }

    // ---- Scripting ----

    /// The server's current clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().clock
    }

    pub fn set_clock(&self, clock: DateTime<Utc>) {
        self.state.lock().unwrap().clock = clock;
    }

    /// Store `record` as-is, keeping its timestamps.
    pub fn seed(&self, entity: &str, record: &SyncableRecord) {
        let descriptor = self.descriptor(entity);
        let row = descriptor.encode(record);
        self.state
            .lock()
            .unwrap()
            .rows
            .entry(descriptor.table.clone())
            .or_default()
            .insert((record.tenant_id.clone(), record.id), row);
    }

    /// Tombstone a row server-side at `deleted_at`, as another client would.
    pub fn tombstone(&self, entity: &str, owner: Option<&TenantId>, id: Uuid, deleted_at: DateTime<Utc>) {
        let descriptor = self.descriptor(entity);
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state
            .rows
            .get_mut(&descriptor.table)
            .and_then(|rows| rows.get_mut(&(owner.cloned(), id)))
        {
            row[&descriptor.fields.deleted_at] =
                Value::String(farmsync_schema::descriptor::format_timestamp(deleted_at));
        }
    }

    /// Remove a row without leaving a tombstone.
    pub fn hard_delete(&self, entity: &str, owner: Option<&TenantId>, id: Uuid) {
        let table = self.descriptor(entity).table.clone();
        if let Some(rows) = self.state.lock().unwrap().rows.get_mut(&table) {
            rows.remove(&(owner.cloned(), id));
        }
    }

    /// Return `row` verbatim from every active fetch of `entity`'s table.
    pub fn insert_raw(&self, entity: &str, row: Value) {
        let table = self.descriptor(entity).table.clone();
        self.state
            .lock()
            .unwrap()
            .raw
            .entry(table)
            .or_default()
            .push(row);
    }

    /// The stored row for `id`, decoded.
    pub fn record(&self, entity: &str, owner: Option<&TenantId>, id: Uuid) -> Option<SyncableRecord> {
        let descriptor = self.descriptor(entity);
        let state = self.state.lock().unwrap();
        state
            .rows
            .get(&descriptor.table)
            .and_then(|rows| rows.get(&(owner.cloned(), id)))
            .map(|row| descriptor.decode(row).unwrap())
    }

    /// Fail the next `times` calls of `op` (on any table).
    pub fn fail(&self, op: RemoteOp, fault: Fault, times: usize) {
        self.fail_on(op, None, fault, times);
    }

    /// Fail the next `times` calls of `op` against `entity`'s table.
    pub fn fail_entity(&self, op: RemoteOp, entity: &str, fault: Fault, times: usize) {
        let table = self.descriptor(entity).table.clone();
        self.fail_on(op, Some(table), fault, times);
    }

    fn fail_on(&self, op: RemoteOp, table: Option<String>, fault: Fault, times: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.op_faults.entry((op, table)).or_default();
        queue.extend(std::iter::repeat_n(fault, times));
    }

    /// Fail every write of record `id` until cleared.
    pub fn fail_record(&self, id: Uuid, fault: Fault) {
        self.state.lock().unwrap().record_faults.insert(id, fault);
    }

    pub fn clear_record_fault(&self, id: Uuid) {
        self.state.lock().unwrap().record_faults.remove(&id);
    }

    /// Hold every request until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self, op: RemoteOp) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    /// Wait until at least `n` calls of `op` have been made.
    pub async fn wait_for_calls(&self, op: RemoteOp, n: usize) {
        while self.call_count(op) < n {
            tokio::time::sleep(StdDuration::from_millis(1)).await;
        }
    }

    // ---- Request handling ----

    /// Log the call, honour pause, and fire any injected fault.
    async fn enter(&self, call: RemoteCall) -> Result<()> {
        let fault = {
            let mut state = self.state.lock().unwrap();
            let op = call.op;
            let table = call.table.clone();
            let id = call.id;
            state.calls.push(call);

            let by_record = id.and_then(|id| state.record_faults.get(&id).copied());
            by_record
                .or_else(|| {
                    state
                        .op_faults
                        .get_mut(&(op, Some(table)))
                        .and_then(VecDeque::pop_front)
                })
                .or_else(|| state.op_faults.get_mut(&(op, None)).and_then(VecDeque::pop_front))
                .map(|fault| (fault, id))
        };

        let mut paused = self.paused.subscribe();
        // Sender lives as long as self.
        let _ = paused.wait_for(|p| !*p).await;

        match fault {
            Some((Fault::Hang, _)) => {
                tokio::time::sleep(StdDuration::from_secs(3_600)).await;
                Err(Fault::Hang.error(None))
            }
            Some((fault, id)) => Err(fault.error(id)),
            None => Ok(()),
        }
    }

    fn tick(state: &mut RemoteState) -> DateTime<Utc> {
        state.clock += Duration::seconds(1);
        state.clock
    }
}

fn timestamp(row: &Value, field: &str) -> Option<DateTime<Utc>> {
    row.get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn paginate<T>(items: Vec<T>, page: &PageRequest) -> Page<T> {
    let offset: usize = page
        .cursor
        .as_deref()
        .and_then(|c| c.parse().ok())
        .unwrap_or(0);
    let end = (offset + page.limit).min(items.len());
    let next_cursor = (end < items.len()).then(|| end.to_string());
    let items = items.into_iter().skip(offset).take(page.limit).collect();
    Page { items, next_cursor }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn fetch_active_since(
        &self,
        table: &str,
        scope: &Scope,
        since: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<Value>> {
        self.enter(RemoteCall {
            op: RemoteOp::FetchActive,
            table: table.to_string(),
            tenant: scope.tenant().cloned(),
            since: Some(since),
            id: None,
        })
        .await?;

        let fields = &self.descriptor_for_table(table).fields;
        let state = self.state.lock().unwrap();
        let mut matching: Vec<(DateTime<Utc>, Uuid, Value)> = state
            .rows
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter())
            .filter(|((owner, _), row)| {
                scope.admits(owner.as_ref())
                    && row.get(&fields.deleted_at).is_none_or(Value::is_null)
            })
            .filter_map(|((_, id), row)| {
                let modified = timestamp(row, &fields.modified_at)?;
                (modified >= since).then(|| (modified, *id, row.clone()))
            })
            .collect();
        matching.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut items: Vec<Value> = state.raw.get(table).cloned().unwrap_or_default();
        items.extend(matching.into_iter().map(|(_, _, row)| row));
        Ok(paginate(items, &page))
    }

    async fn fetch_deleted_since(
        &self,
        table: &str,
        scope: &Scope,
        since: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<Tombstone>> {
        self.enter(RemoteCall {
            op: RemoteOp::FetchDeleted,
            table: table.to_string(),
            tenant: scope.tenant().cloned(),
            since: Some(since),
            id: None,
        })
        .await?;

        let fields = &self.descriptor_for_table(table).fields;
        let state = self.state.lock().unwrap();
        let mut tombstones: Vec<Tombstone> = state
            .rows
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter())
            .filter(|((owner, _), _)| scope.admits(owner.as_ref()))
            .filter_map(|((_, id), row)| {
                let deleted_at = timestamp(row, &fields.deleted_at)?;
                (deleted_at >= since).then_some(Tombstone { id: *id, deleted_at })
            })
            .collect();
        tombstones.sort_by(|a, b| (a.deleted_at, a.id).cmp(&(b.deleted_at, b.id)));
        Ok(paginate(tombstones, &page))
    }

    async fn upsert(&self, table: &str, scope: &Scope, row: Value) -> Result<Value> {
        let descriptor = self.descriptor_for_table(table);
        let record = descriptor.decode(&row).map_err(|e| Error::Validation {
            id: descriptor.peek_id(&row),
            message: e.to_string(),
        })?;
        self.enter(RemoteCall {
            op: RemoteOp::Upsert,
            table: table.to_string(),
            tenant: scope.tenant().cloned(),
            since: None,
            id: Some(record.id),
        })
        .await?;

        if !scope.admits(record.tenant_id.as_ref()) {
            return Err(Error::Validation {
                id: Some(record.id),
                message: "row owner does not match request tenant".into(),
            });
        }

        let mut state = self.state.lock().unwrap();
        let key = (record.tenant_id.clone(), record.id);
        let existing_deleted = state
            .rows
            .get(table)
            .and_then(|rows| rows.get(&key))
            .is_some_and(|row| timestamp(row, &descriptor.fields.deleted_at).is_some());
        if existing_deleted {
            return Err(Error::Conflict {
                id: record.id,
                message: "row is deleted on the server".into(),
            });
        }

        let now = Self::tick(&mut state);
        let mut stored = record;
        stored.modified_at = now;
        stored.deleted_at = None;
        let stored_row = descriptor.encode(&stored);
        state
            .rows
            .entry(table.to_string())
            .or_default()
            .insert(key, stored_row.clone());
        Ok(stored_row)
    }

    async fn soft_delete(&self, table: &str, scope: &Scope, id: Uuid) -> Result<DateTime<Utc>> {
        self.enter(RemoteCall {
            op: RemoteOp::SoftDelete,
            table: table.to_string(),
            tenant: scope.tenant().cloned(),
            since: None,
            id: Some(id),
        })
        .await?;

        let fields = self.descriptor_for_table(table).fields.clone();
        let mut state = self.state.lock().unwrap();
        let now = state.clock + Duration::seconds(1);
        let Some(row) = state
            .rows
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&(scope.tenant().cloned(), id)))
        else {
            return Err(Error::server(404, format!("no row {} in {}", id, table)));
        };

        if let Some(deleted_at) = timestamp(row, &fields.deleted_at) {
            return Ok(deleted_at);
        }
        let stamp = Value::String(farmsync_schema::descriptor::format_timestamp(now));
        row[&fields.deleted_at] = stamp.clone();
        row[&fields.modified_at] = stamp;
        state.clock = now;
        Ok(now)
    }
}
