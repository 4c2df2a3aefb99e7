//! Instance data model and registry wire DTOs
//!
//! Wire property naming is camelCase; unknown properties are ignored on
//! read. Instants are RFC 3339 UTC.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a registered instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    Unknown,
    Healthy,
    Unhealthy,
    Offline,
}

/// One running backend process at a specific host:port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub instance_id: Uuid,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    /// Free-form version string, e.g. "1.0.0"
    #[serde(rename = "version")]
    pub version_tag: String,
    #[serde(default)]
    pub metadata: FxHashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_url: Option<String>,
    pub weight: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: InstanceStatus,
}

impl InstanceRecord {
    /// Probe target: the configured URL, or the `/health` convention
    #[must_use]
    pub fn probe_url(&self) -> String {
        self.health_check_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}/health", self.host, self.port))
    }

    /// Upstream authority this instance serves on
    #[must_use]
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Heartbeat age relative to `now`
    #[must_use]
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

/// Kind of a change-feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Upsert,
    Remove,
}

/// One mutation of the registry state, keyed by the version it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceChangeEvent {
    pub instance_id: Uuid,
    pub service_name: String,
    pub kind: ChangeKind,
    pub version: u64,
    /// Present for `Upsert`, absent for `Remove`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<InstanceRecord>,
}

impl ServiceChangeEvent {
    #[must_use]
    pub fn upsert(version: u64, record: InstanceRecord) -> Self {
        Self {
            instance_id: record.instance_id,
            service_name: record.service_name.clone(),
            kind: ChangeKind::Upsert,
            version,
            record: Some(record),
        }
    }

    #[must_use]
    pub fn remove(version: u64, instance_id: Uuid, service_name: String) -> Self {
        Self {
            instance_id,
            service_name,
            kind: ChangeKind::Remove,
            version,
            record: None,
        }
    }
}

/// Body of `POST /api/registry/register`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    /// Version tag to publish for this instance
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub metadata: FxHashMap<String, String>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub weight: Option<u32>,
    /// Set on re-registration so retries stay idempotent
    #[serde(default)]
    pub instance_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default)]
    pub instance_id: Option<Uuid>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeregisterResponse {
    pub success: bool,
    pub message: String,
}

/// Body of `POST /api/registry/heartbeat`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub instance_id: Uuid,
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub success: bool,
}

/// Response of `GET /api/registry/discover/{serviceName}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverResponse {
    pub service_name: String,
    pub instances: Vec<InstanceRecord>,
}

/// Response of `GET /api/registry/changes?sinceVersion=`
///
/// Coalesced: one entry per id mutated since the cursor, carrying its
/// latest record or a removal marker. May be a full snapshot when the
/// cursor predates retention; callers must apply idempotently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
    pub version: u64,
    pub added_or_updated: Vec<InstanceRecord>,
    pub removed: Vec<Uuid>,
    /// True when the cursor predated retention and this response is a
    /// complete snapshot; the caller must drop local state first
    #[serde(default)]
    pub full_snapshot: bool,
}

/// JSON error body returned by the registry and the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}
