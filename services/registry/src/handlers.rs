//! HTTP handlers for the registry API
//!
//! Status mapping: 200 success, 400 validation failure, 404 unknown
//! instance or service, 5xx internal. A 5xx is indeterminate for the
//! caller; retrying `register` with the same instance id is idempotent.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use services_common::MeshError;
use services_common::constants::DEFAULT_WEIGHT;
use services_common::models::{
    ChangesResponse, DeregisterResponse, DiscoverResponse, ErrorResponse, HeartbeatRequest,
    HeartbeatResponse, InstanceRecord, InstanceStatus, RegisterRequest, RegisterResponse,
};

use crate::feed::{ChangeFeed, PullResult};
use crate::store::InstanceStore;

/// Shared state for all registry handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn InstanceStore>,
    pub feed: Arc<ChangeFeed>,
    pub started_at: Instant,
}

/// Error wrapper turning `MeshError` into the wire error body
pub struct ApiError(pub MeshError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse {
            error: self.0.kind().to_string(),
            message: self.0.to_string(),
            service: None,
        };
        (status, Json(body)).into_response()
    }
}

impl From<MeshError> for ApiError {
    fn from(err: MeshError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverQuery {
    pub version: Option<String>,
    #[serde(default)]
    pub healthy_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceQuery {
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesQuery {
    #[serde(default)]
    pub since_version: u64,
}

/// POST /api/registry/register
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    validate_register(&request)?;

    let now = Utc::now();
    let instance_id = request.instance_id.unwrap_or_else(Uuid::new_v4);
    let record = InstanceRecord {
        instance_id,
        service_name: request.service_name.clone(),
        host: request.host.clone(),
        port: request.port,
        version_tag: request.version.unwrap_or_default(),
        metadata: request.metadata,
        health_check_url: request.health_check_url,
        weight: request.weight.unwrap_or(DEFAULT_WEIGHT),
        registered_at: now,
        last_heartbeat: now,
        status: InstanceStatus::Healthy,
    };

    let version = state.store.upsert(record).await?;
    info!(%instance_id, service = %request.service_name, version, "Instance registered");
    Ok(Json(RegisterResponse {
        success: true,
        instance_id: Some(instance_id),
        message: "registered".to_string(),
    }))
}

/// POST /api/registry/deregister/{instanceId}
pub async fn deregister(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<DeregisterResponse>, ApiError> {
    let (removed, _version) = state.store.remove(instance_id).await;
    if !removed {
        return Err(MeshError::NotFound(format!("instance {instance_id} is not registered")).into());
    }
    Ok(Json(DeregisterResponse {
        success: true,
        message: "deregistered".to_string(),
    }))
}

/// POST /api/registry/heartbeat
///
/// Rejects a mismatched service name with 404 so a misconfigured agent
/// cannot keep a foreign instance alive.
pub async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let known = state
        .store
        .get(request.instance_id)
        .await
        .ok_or_else(|| MeshError::NotFound(format!("instance {} is not registered", request.instance_id)))?;
    if known.service_name != request.service_name {
        return Err(MeshError::NotFound(format!(
            "instance {} is not registered for service '{}'",
            request.instance_id, request.service_name
        ))
        .into());
    }

    state.store.touch(request.instance_id).await;
    debug!(instance_id = %request.instance_id, service = %request.service_name, "Heartbeat");
    Ok(Json(HeartbeatResponse { success: true }))
}

/// GET /api/registry/discover/{serviceName}
pub async fn discover(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
    Query(query): Query<DiscoverQuery>,
) -> Json<DiscoverResponse> {
    let instances = filtered(
        state.store.list_by_service(&service_name).await,
        query.version.as_deref(),
        query.healthy_only,
    );
    Json(DiscoverResponse {
        service_name,
        instances,
    })
}

/// GET /api/registry/instance/{serviceName}
///
/// Server-side uniform choice over the healthy candidates; callers with a
/// local cache normally prefer their own balancer.
pub async fn pick_instance(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
    Query(query): Query<InstanceQuery>,
) -> Result<Json<InstanceRecord>, ApiError> {
    let candidates = filtered(
        state.store.list_by_service(&service_name).await,
        query.version.as_deref(),
        true,
    );
    if candidates.is_empty() {
        return Err(MeshError::NotFound(format!(
            "no healthy instance of '{service_name}'"
        ))
        .into());
    }
    let index = rand::thread_rng().gen_range(0..candidates.len());
    Ok(Json(candidates[index].clone()))
}

/// GET /api/registry/services
pub async fn list_services(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.store.list_all_names().await)
}

/// GET /api/registry/instances
pub async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceRecord>> {
    Json(state.store.list_all().await)
}

/// GET /api/registry/changes?sinceVersion=
pub async fn changes(
    State(state): State<AppState>,
    Query(query): Query<ChangesQuery>,
) -> Json<ChangesResponse> {
    // Version is read before the log so a cursor can never run ahead of
    // events the caller has not seen; anything published in between is
    // simply re-delivered next pull.
    let version = state.store.version().await;
    let response = match state.feed.collect_since(query.since_version) {
        PullResult::Delta { upserts, removals } => ChangesResponse {
            version,
            added_or_updated: upserts,
            removed: removals,
            full_snapshot: false,
        },
        PullResult::Reset => {
            debug!(since = query.since_version, "Cursor predates retention, answering with snapshot");
            ChangesResponse {
                version,
                added_or_updated: state.store.list_all().await,
                removed: Vec::new(),
                full_snapshot: true,
            }
        }
    };
    Json(response)
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": state.store.version().await,
        "services": state.store.list_all_names().await.len(),
        "instances": state.store.list_all().await.len(),
        "subscribers": state.feed.subscriber_count(),
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

fn filtered(
    instances: Vec<InstanceRecord>,
    version: Option<&str>,
    healthy_only: bool,
) -> Vec<InstanceRecord> {
    instances
        .into_iter()
        .filter(|r| version.is_none_or(|v| r.version_tag == v))
        .filter(|r| !healthy_only || r.status == InstanceStatus::Healthy)
        .collect()
}

fn validate_register(request: &RegisterRequest) -> Result<(), MeshError> {
    if request.service_name.trim().is_empty() {
        return Err(MeshError::Validation("serviceName must not be empty".to_string()));
    }
    if request.host.trim().is_empty() {
        return Err(MeshError::Validation("host must not be empty".to_string()));
    }
    if request.port == 0 {
        return Err(MeshError::Validation("port must be in [1, 65535]".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RegisterRequest {
        RegisterRequest {
            service_name: "Orders".to_string(),
            host: "10.0.0.1".to_string(),
            port: 5001,
            version: None,
            metadata: rustc_hash::FxHashMap::default(),
            health_check_url: None,
            weight: None,
            instance_id: None,
        }
    }

    #[test]
    fn register_validation_rejects_bad_fields() {
        assert!(validate_register(&request()).is_ok());

        let mut empty_name = request();
        empty_name.service_name = "  ".to_string();
        assert!(validate_register(&empty_name).is_err());

        let mut empty_host = request();
        empty_host.host = String::new();
        assert!(validate_register(&empty_host).is_err());

        let mut zero_port = request();
        zero_port.port = 0;
        assert!(validate_register(&zero_port).is_err());
    }
}
