//! Tenant identity and query scoping
//!
//! Tenant isolation is enforced at the adapter layer: both the local store
//! and the remote client resolve every request through [`Scope::resolve`]
//! and refuse to run an unscoped request against a tenant-scoped entity type.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::EntityDescriptor;
use crate::{Error, Result};

/// Identifier of an isolated farm account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id, rejecting empty or whitespace-padded values.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.trim() != id {
            return Err(Error::InvalidTenant { value: id });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// The scope a local query or remote request runs under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Only rows owned by this tenant are visible
    Tenant(TenantId),
    /// No tenant filter; only valid for global entity types
    Global,
}

impl Scope {
    /// The scope a sync on behalf of `tenant` uses for `descriptor`.
    pub fn for_entity(descriptor: &EntityDescriptor, tenant: &TenantId) -> Self {
        if descriptor.tenant_scoped {
            Scope::Tenant(tenant.clone())
        } else {
            Scope::Global
        }
    }

    /// Resolve this scope against an entity type.
    ///
    /// Returns `None` when the request is unscoped but the entity type is
    /// tenant scoped. Global entity types always resolve to [`Scope::Global`]
    /// since their rows carry no owner.
    pub fn resolve(&self, descriptor: &EntityDescriptor) -> Option<Scope> {
        match (self, descriptor.tenant_scoped) {
            (Scope::Tenant(tenant), true) => Some(Scope::Tenant(tenant.clone())),
            (Scope::Global, true) => None,
            (_, false) => Some(Scope::Global),
        }
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        match self {
            Scope::Tenant(tenant) => Some(tenant),
            Scope::Global => None,
        }
    }

    /// Whether a row owned by `owner` is visible in this scope.
    pub fn admits(&self, owner: Option<&TenantId>) -> bool {
        match self {
            Scope::Tenant(tenant) => owner == Some(tenant),
            Scope::Global => true,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Tenant(tenant) => write!(f, "tenant:{}", tenant),
            Scope::Global => f.write_str("global"),
        }
    }
}
