//! Agent lifecycle: registration, supervision, shutdown
//!
//! Construction is two-phase: the identity is resolved first, then the
//! agent is built around a final immutable configuration. Every spawned
//! task lives in a supervised set and is stopped through the shared
//! shutdown signal.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use services_common::models::RegisterRequest;
use services_common::{MeshError, RegistryClient};

use crate::config::{AgentConfig, FailurePolicy};
use crate::health::HealthEndpoint;
use crate::heartbeat::{HeartbeatController, HeartbeatIntervals, LoadMetrics, LoadThresholds};
use crate::identity::{ServiceIdentity, ServiceInfoProvider, resolve_identity};

/// A running mesh agent
pub struct ServiceAgent {
    identity: ServiceIdentity,
    instance_id: Uuid,
    client: RegistryClient,
    metrics: Arc<LoadMetrics>,
    health: Option<Arc<HealthEndpoint>>,
    registered: Arc<watch::Sender<bool>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl ServiceAgent {
    /// Resolve identity and start the agent.
    ///
    /// With `auto_register` on, registration is attempted in the
    /// foreground up to `register_retry_count` times (0 = unbounded);
    /// exhaustion applies the configured failure policy.
    pub async fn start(
        config: AgentConfig,
        provider: Option<&dyn ServiceInfoProvider>,
    ) -> Result<Self> {
        let identity = resolve_identity(&config, provider)?;
        let client = RegistryClient::new(&config.registry_url)?;
        let instance_id = Uuid::new_v4();

        let register_request = RegisterRequest {
            service_name: identity.service_name.clone(),
            host: identity.host.clone(),
            port: identity.port,
            version: Some(config.version.clone()),
            metadata: config.metadata.clone(),
            health_check_url: config.health_check_url.clone(),
            weight: Some(config.weight),
            instance_id: Some(instance_id),
        };

        let health = config.enable_default_health_check.then(|| {
            Arc::new(HealthEndpoint::new(
                identity.service_name.clone(),
                config.health_check_path.clone(),
            ))
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (registered_tx, _) = watch::channel(false);
        let registered = Arc::new(registered_tx);

        let agent = Self {
            identity,
            instance_id,
            client: client.clone(),
            metrics: Arc::new(LoadMetrics::default()),
            health,
            registered: Arc::clone(&registered),
            shutdown: shutdown_tx,
            tasks: Mutex::new(JoinSet::new()),
        };

        if !config.auto_register {
            info!(service = %agent.identity.service_name, "Auto-registration disabled");
            return Ok(agent);
        }

        let retry_interval = Duration::from_secs(config.register_retry_interval_seconds);
        let outcome = foreground_register(
            &client,
            &register_request,
            config.register_retry_count,
            retry_interval,
        )
        .await;

        match outcome {
            Ok(()) => {
                let _ = registered.send(true);
                agent.spawn_heartbeat(&config, register_request, shutdown_rx);
            }
            Err(e) if matches!(e, MeshError::Validation(_) | MeshError::ServiceBindingChanged { .. }) => {
                // Configuration problems do not get better by retrying
                error!(error = %e, "Registration rejected, treating as fatal");
                return Err(e.into());
            }
            Err(e) => match config.failure_policy {
                FailurePolicy::FailFast => {
                    error!(error = %e, "Registration failed, failing fast");
                    return Err(e.into());
                }
                FailurePolicy::ContinueWithoutRegistration => {
                    warn!(error = %e,
                        "Registration failed, continuing unregistered (no heartbeats)");
                }
                FailurePolicy::ContinueAndRetry => {
                    warn!(error = %e, "Registration failed, retrying in the background");
                    agent.spawn_background_register(
                        &config,
                        register_request,
                        retry_interval,
                        shutdown_rx,
                    );
                }
            },
        }

        Ok(agent)
    }

    /// The resolved identity this agent publishes
    #[must_use]
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Instance id used for registration and heartbeats
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Whether the instance is currently registered
    #[must_use]
    pub fn is_registered(&self) -> bool {
        *self.registered.borrow()
    }

    /// Host instrumentation hook: record one completed request
    pub fn record_request(&self, duration: Duration, success: bool) {
        self.metrics.record_request(duration, success);
    }

    /// The built-in health endpoint, when enabled
    #[must_use]
    pub fn health_endpoint(&self) -> Option<&Arc<HealthEndpoint>> {
        self.health.as_ref()
    }

    /// Graceful shutdown: final heartbeat, deregister, stop all tasks
    pub async fn shutdown(&self) {
        info!(service = %self.identity.service_name, "Agent shutting down");
        let _ = self.shutdown.send(true);
        let mut tasks = {
            let mut held = self.tasks.lock();
            std::mem::take(&mut *held)
        };
        while tasks.join_next().await.is_some() {}
    }

    fn spawn_heartbeat(
        &self,
        config: &AgentConfig,
        register_request: RegisterRequest,
        shutdown: watch::Receiver<bool>,
    ) {
        let intervals = HeartbeatIntervals {
            normal: Duration::from_secs(config.heartbeat_interval_seconds),
            ..HeartbeatIntervals::default()
        };
        let controller = HeartbeatController {
            client: self.client.clone(),
            metrics: Arc::clone(&self.metrics),
            intervals,
            thresholds: LoadThresholds::default(),
            register_request,
        };
        self.tasks.lock().spawn(controller.run(shutdown));
    }

    fn spawn_background_register(
        &self,
        config: &AgentConfig,
        register_request: RegisterRequest,
        retry_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        let client = self.client.clone();
        let metrics = Arc::clone(&self.metrics);
        let registered = Arc::clone(&self.registered);
        let heartbeat_interval = config.heartbeat_interval_seconds;
        let mut register_shutdown = shutdown;

        self.tasks.lock().spawn(async move {
            loop {
                let attempt = tokio::select! {
                    result = client.register(&register_request) => Some(result),
                    _ = register_shutdown.changed() => None,
                };
                match attempt {
                    None => return,
                    Some(Ok(response)) => {
                        info!(instance_id = ?response.instance_id,
                            service = %register_request.service_name,
                            "Background registration succeeded");
                        let _ = registered.send(true);
                        let intervals = HeartbeatIntervals {
                            normal: Duration::from_secs(heartbeat_interval),
                            ..HeartbeatIntervals::default()
                        };
                        let controller = HeartbeatController {
                            client,
                            metrics,
                            intervals,
                            thresholds: LoadThresholds::default(),
                            register_request,
                        };
                        controller.run(register_shutdown).await;
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Background registration attempt failed");
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(retry_interval) => {}
                    _ = register_shutdown.changed() => return,
                }
            }
        });
    }
}

/// Foreground registration with bounded retries; `retry_count` 0 retries
/// until it succeeds
async fn foreground_register(
    client: &RegistryClient,
    request: &RegisterRequest,
    retry_count: u32,
    retry_interval: Duration,
) -> Result<(), MeshError> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match client.register(request).await {
            Ok(response) => {
                info!(instance_id = ?response.instance_id,
                    service = %request.service_name, attempt, "Registered");
                return Ok(());
            }
            Err(e @ (MeshError::Validation(_) | MeshError::ServiceBindingChanged { .. })) => {
                return Err(e);
            }
            Err(e) => {
                warn!(attempt, error = %e, "Registration attempt failed");
                if retry_count != 0 && attempt >= retry_count {
                    return Err(e);
                }
                tokio::time::sleep(retry_interval).await;
            }
        }
    }
}
