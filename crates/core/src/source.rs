use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type SourceId = Uuid;

/// Consuming identity (tenant account) a source is ingested for.
pub type TenantId = Uuid;

/// A chat channel registered for ingestion.
///
/// Owned by the source registry. The scheduler only ever writes back
/// `last_parsed_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    /// Upstream handle used to resolve the channel. `None` means the source
    /// can never be fetched.
    pub external_identity: Option<String>,
    pub active: bool,
    /// When the last fully successful attempt finished.
    pub last_parsed_at: Option<DateTime<Utc>>,
    /// Tenant that receives an association once records arrive.
    pub tenant_id: Option<TenantId>,
}

impl Source {
    pub fn new(id: SourceId, external_identity: impl Into<String>) -> Self {
        Self {
            id,
            external_identity: Some(external_identity.into()),
            active: true,
            last_parsed_at: None,
            tenant_id: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_last_parsed_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_parsed_at = Some(at);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Trimmed upstream identity, or `None` if missing or blank.
    pub fn identity(&self) -> Option<&str> {
        self.external_identity
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Link that lets a tenant read a source's records downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Association {
    pub tenant_id: TenantId,
    pub source_id: SourceId,
}
