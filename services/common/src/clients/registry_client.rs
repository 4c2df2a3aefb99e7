//! Typed HTTP client for the registry API
//!
//! Used by the agent (register/heartbeat), the discovery cache
//! (changes/discover), and the test suites. Every outbound call carries
//! the ambient trace context when one is in scope.

use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

use crate::errors::MeshError;
use crate::models::{
    ChangesResponse, DeregisterResponse, DiscoverResponse, ErrorResponse, HeartbeatRequest,
    HeartbeatResponse, InstanceRecord, RegisterRequest, RegisterResponse,
};
use crate::trace;

/// Default deadline for registry control calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry API client
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    /// Create a new client for the registry at `base_url`
    pub fn new(base_url: &str) -> Result<Self, MeshError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| MeshError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Registry base URL
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket URL of the push channel
    #[must_use]
    pub fn ws_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{}", self.base_url)
        };
        format!("{ws_base}/ws/registry")
    }

    /// Register an instance; retries with the same `instance_id` are
    /// idempotent on the registry side
    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, MeshError> {
        debug!(service = %request.service_name, host = %request.host, port = request.port,
            "Sending register request");
        let response = self
            .traced(self.client.post(format!("{}/api/registry/register", self.base_url)))
            .json(request)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Deregister an instance; idempotent, a second call reports not-found
    pub async fn deregister(&self, instance_id: Uuid) -> Result<DeregisterResponse, MeshError> {
        debug!(%instance_id, "Sending deregister request");
        let response = self
            .traced(
                self.client
                    .post(format!("{}/api/registry/deregister/{instance_id}", self.base_url)),
            )
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Heartbeat for a registered instance
    pub async fn heartbeat(
        &self,
        instance_id: Uuid,
        service_name: &str,
    ) -> Result<HeartbeatResponse, MeshError> {
        let request = HeartbeatRequest {
            instance_id,
            service_name: service_name.to_string(),
        };
        let response = self
            .traced(self.client.post(format!("{}/api/registry/heartbeat", self.base_url)))
            .json(&request)
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Filtered snapshot of a service's instances
    pub async fn discover(
        &self,
        service_name: &str,
        version: Option<&str>,
        healthy_only: bool,
    ) -> Result<DiscoverResponse, MeshError> {
        let mut query: Vec<(&str, String)> = vec![("healthyOnly", healthy_only.to_string())];
        if let Some(v) = version {
            query.push(("version", v.to_string()));
        }
        let response = self
            .traced(
                self.client
                    .get(format!("{}/api/registry/discover/{service_name}", self.base_url))
                    .query(&query),
            )
            .send()
            .await?;
        Self::decode(response).await
    }

    /// A single healthy instance chosen server-side, or `None`
    pub async fn instance(
        &self,
        service_name: &str,
        version: Option<&str>,
    ) -> Result<Option<InstanceRecord>, MeshError> {
        let mut builder = self
            .client
            .get(format!("{}/api/registry/instance/{service_name}", self.base_url));
        if let Some(v) = version {
            builder = builder.query(&[("version", v)]);
        }
        let response = self.traced(builder).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    /// All known service names
    pub async fn services(&self) -> Result<Vec<String>, MeshError> {
        let response = self
            .traced(self.client.get(format!("{}/api/registry/services", self.base_url)))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// All instances across all services
    pub async fn instances(&self) -> Result<Vec<InstanceRecord>, MeshError> {
        let response = self
            .traced(self.client.get(format!("{}/api/registry/instances", self.base_url)))
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Coalesced changes since a version cursor
    pub async fn changes(&self, since_version: u64) -> Result<ChangesResponse, MeshError> {
        let response = self
            .traced(
                self.client
                    .get(format!("{}/api/registry/changes", self.base_url))
                    .query(&[("sinceVersion", since_version.to_string())]),
            )
            .send()
            .await?;
        Self::decode(response).await
    }

    /// Attach propagation headers for the current hop
    fn traced(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match trace::current() {
            Some(ctx) => {
                let child = ctx.child();
                let builder = builder.header(trace::TRACEPARENT_HEADER, child.to_traceparent());
                match child.to_baggage() {
                    Some(baggage) => builder.header(trace::BAGGAGE_HEADER, baggage),
                    None => builder,
                }
            }
            None => builder,
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, MeshError> {
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(|e| {
                error!("Failed to decode registry response: {}", e);
                MeshError::Internal(format!("invalid registry response: {e}"))
            });
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.message,
            Err(_) => format!("registry returned {status}"),
        };
        Err(match status {
            StatusCode::BAD_REQUEST => MeshError::Validation(message),
            StatusCode::NOT_FOUND => MeshError::NotFound(message),
            StatusCode::GATEWAY_TIMEOUT => MeshError::Timeout(message),
            s if s.is_server_error() => MeshError::Internal(message),
            _ => MeshError::Transient(message),
        })
    }
}
