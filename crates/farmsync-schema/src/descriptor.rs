//! Entity-type descriptors
//!
//! A descriptor tells the engine where an entity type lives (`table`),
//! whether its rows are owned by a tenant, which entity types it references,
//! and how to pull the id, owner and timestamps out of a wire row.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::record::SyncableRecord;
use crate::tenant::TenantId;
use crate::{Error, Result};

/// Names of the wire fields the engine interprets.
///
/// Every other field of a row is opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMap {
    pub id: String,
    pub tenant: String,
    pub modified_at: String,
    pub deleted_at: String,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            id: "id".to_string(),
            tenant: "farm_id".to_string(),
            modified_at: "updated_at".to_string(),
            deleted_at: "deleted_at".to_string(),
        }
    }
}

/// Static description of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescriptor {
    /// Entity type name used for checkpoints and mutations (e.g. "cattle")
    pub entity: String,
    /// Remote table name
    pub table: String,
    /// Whether rows are owned by a tenant
    pub tenant_scoped: bool,
    /// Entity types this one references by id
    pub parents: Vec<String>,
    pub fields: FieldMap,
}

impl EntityDescriptor {
    /// Create a tenant-scoped descriptor with the default field map.
    pub fn new(entity: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            tenant_scoped: true,
            parents: Vec::new(),
            fields: FieldMap::default(),
        }
    }

    /// Mark the entity type as global reference data shared by all tenants.
    pub fn global(mut self) -> Self {
        self.tenant_scoped = false;
        self
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parents.push(parent.into());
        self
    }

    pub fn fields(mut self, fields: FieldMap) -> Self {
        self.fields = fields;
        self
    }

    /// Best-effort id extraction, used to report rows that fail to decode.
    pub fn peek_id(&self, row: &Value) -> Option<Uuid> {
        row.get(&self.fields.id)
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Decode a wire row into a record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedRecord`] if the row is not an object, the id
    /// is not a UUID, a tenant-scoped row has no valid owner, or a timestamp
    /// is missing or not RFC 3339.
    pub fn decode(&self, row: &Value) -> Result<SyncableRecord> {
        let Value::Object(map) = row else {
            return Err(self.malformed("row is not a JSON object"));
        };
        let mut payload = map.clone();

        let id = match payload.remove(&self.fields.id) {
            Some(Value::String(s)) => Uuid::parse_str(&s)
                .map_err(|e| self.malformed(format!("invalid id {:?}: {}", s, e)))?,
            _ => return Err(self.malformed(format!("missing {}", self.fields.id))),
        };

        let owner = payload.remove(&self.fields.tenant);
        let tenant_id = if self.tenant_scoped {
            match owner {
                Some(Value::String(s)) => Some(
                    TenantId::new(s)
                        .map_err(|e| self.malformed(format!("record {}: {}", id, e)))?,
                ),
                _ => {
                    return Err(self.malformed(format!(
                        "record {} has no {}",
                        id, self.fields.tenant
                    )));
                }
            }
        } else {
            None
        };

        let modified_at = match payload.remove(&self.fields.modified_at) {
            Some(value) => self.timestamp(&value, id)?,
            None => {
                return Err(self.malformed(format!(
                    "record {} has no {}",
                    id, self.fields.modified_at
                )));
            }
        };

        let deleted_at = match payload.remove(&self.fields.deleted_at) {
            None | Some(Value::Null) => None,
            Some(value) => Some(self.timestamp(&value, id)?),
        };

        Ok(SyncableRecord {
            id,
            tenant_id,
            modified_at,
            deleted_at,
            payload,
        })
    }

    /// Encode a record as a wire row. Inverse of [`decode`](Self::decode).
    pub fn encode(&self, record: &SyncableRecord) -> Value {
        let mut row: Map<String, Value> = record.payload.clone();
        row.insert(self.fields.id.clone(), Value::String(record.id.to_string()));
        if let Some(tenant) = &record.tenant_id {
            row.insert(
                self.fields.tenant.clone(),
                Value::String(tenant.to_string()),
            );
        }
        row.insert(
            self.fields.modified_at.clone(),
            Value::String(format_timestamp(record.modified_at)),
        );
        row.insert(
            self.fields.deleted_at.clone(),
            record
                .deleted_at
                .map(|t| Value::String(format_timestamp(t)))
                .unwrap_or(Value::Null),
        );
        Value::Object(row)
    }

    fn timestamp(&self, value: &Value, id: Uuid) -> Result<DateTime<Utc>> {
        let Value::String(s) = value else {
            return Err(self.malformed(format!("record {} has a non-string timestamp", id)));
        };
        DateTime::parse_from_rfc3339(s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| self.malformed(format!("record {} timestamp {:?}: {}", id, s, e)))
    }

    fn malformed(&self, message: impl Into<String>) -> Error {
        Error::malformed(self.entity.clone(), message)
    }
}

/// Wire format for timestamps: RFC 3339, UTC, microsecond precision.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}
