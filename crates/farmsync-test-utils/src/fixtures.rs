//! Tenants, timestamps and record builders.

use chrono::{DateTime, Duration, Utc};
use farmsync_schema::{Scope, SyncableRecord, TenantId};
use serde_json::json;
use uuid::Uuid;

/// Base instant all fixture timestamps are offsets from.
pub fn base() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + Duration::seconds(1_700_000_000)
}

/// `base() + secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    base() + Duration::seconds(secs)
}

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

pub fn scope(tenant: &TenantId) -> Scope {
    Scope::Tenant(tenant.clone())
}

pub fn herd(owner: &TenantId, modified: i64) -> SyncableRecord {
    SyncableRecord::new(Uuid::new_v4(), Some(owner.clone()), at(modified))
        .with_field("name", json!(format!("Herd {}", modified)))
}

pub fn cow(owner: &TenantId, modified: i64) -> SyncableRecord {
    SyncableRecord::new(Uuid::new_v4(), Some(owner.clone()), at(modified))
        .with_field("ear_tag", json!(format!("IE-{:06}", modified)))
        .with_field("sex", json!("female"))
}

pub fn breed(name: &str, modified: i64) -> SyncableRecord {
    SyncableRecord::new(Uuid::new_v4(), None, at(modified)).with_field("name", json!(name))
}

pub fn health_record(owner: &TenantId, cattle_id: Uuid, modified: i64) -> SyncableRecord {
    SyncableRecord::new(Uuid::new_v4(), Some(owner.clone()), at(modified))
        .with_field("cattle_id", json!(cattle_id.to_string()))
        .with_field("treatment", json!("vaccination"))
}
