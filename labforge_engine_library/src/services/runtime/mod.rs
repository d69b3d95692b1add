use crate::engine_api::engine_config::RuntimeConfig;
use crate::services::instance::OwnerKey;
use crate::services::resources::ResourceLimits;
use crate::services::templates::LabTemplate;
use anyhow::Result;
use labforge_library::{transaction::TransactionId, types::ToAny, utils::port::Port};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[path = "./docker/docker.rs"]
pub mod docker;
#[path = "./simulation/simulator.rs"]
pub mod simulator;

/// Label put on every container this engine launches
pub const OWNER_LABEL_KEY: &str = "owner";
pub const OWNER_LABEL_VALUE: &str = "labforge_engine";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Opaque reference to a container in the runtime
pub struct RuntimeHandle(pub String);
impl RuntimeHandle {
    /// The deterministic container name for an instance
    pub fn for_instance(instance_id: &str) -> Self {
        RuntimeHandle(format!("labforge-{}", instance_id))
    }
}
impl std::fmt::Display for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything a backend needs to launch one lab container
pub struct LaunchSpec {
    pub instance_id: String,
    pub container_name: RuntimeHandle,
    pub owner: OwnerKey,
    pub template: Arc<LabTemplate>,
    /// Host port the template's container port is published on
    pub host_port: Port,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Healthy,
    Unhealthy(String),
    /// The runtime no longer knows the container
    Vanished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Classified runtime failure.
/// Backends raise these so the lifecycle manager can decide whether to retry.
pub enum RuntimeError {
    /// Timeouts, connection resets, daemon 5xx
    Transient(String),
    /// Missing image, invalid configuration, daemon 4xx
    Fatal(String),
    /// The container is gone
    Vanished(String),
}
impl RuntimeError {
    /// Errors that did not come from a backend classification are treated as fatal
    pub fn classify(e: &anyhow::Error) -> RuntimeError {
        match e.downcast_ref::<RuntimeError>() {
            Some(r) => r.clone(),
            None => RuntimeError::Fatal(e.to_string()),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RuntimeError::Transient(_))
    }
}
impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            RuntimeError::Transient(m) => write!(f, "transient runtime error: {}", m),
            RuntimeError::Fatal(m) => write!(f, "fatal runtime error: {}", m),
            RuntimeError::Vanished(m) => write!(f, "container vanished: {}", m),
        }
    }
}
impl std::error::Error for RuntimeError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    Docker,
    Simulation,
}

/// Launch, probe, and tear down lab containers.
/// This is the only place the engine talks to a container runtime.
#[async_trait::async_trait]
pub trait RuntimeClient: ToAny + Send + Sync {
    /// Create the container named by `spec.container_name` and start it
    async fn create_and_start(&self, spec: &LaunchSpec, tid: &TransactionId) -> Result<RuntimeHandle>;

    /// Run the template's health check inside the container
    async fn probe_health(
        &self,
        handle: &RuntimeHandle,
        template: &LabTemplate,
        tid: &TransactionId,
    ) -> Result<ProbeResult>;

    /// Ask the container to exit, killing it after `grace`
    async fn stop(&self, handle: &RuntimeHandle, grace: Duration, tid: &TransactionId) -> Result<()>;

    /// Remove the container and its resources.
    /// Removing a container that does not exist succeeds.
    async fn remove(&self, handle: &RuntimeHandle, tid: &TransactionId) -> Result<()>;

    /// Every container carrying this engine's owner label
    async fn list_managed(&self, tid: &TransactionId) -> Result<Vec<RuntimeHandle>>;

    fn backend(&self) -> RuntimeBackend;
}

pub struct RuntimeFactory {
    config: Arc<RuntimeConfig>,
}

impl RuntimeFactory {
    pub fn new(config: Arc<RuntimeConfig>) -> Self {
        RuntimeFactory { config }
    }

    pub async fn get_runtime(&self, tid: &TransactionId) -> Result<Arc<dyn RuntimeClient>> {
        match self.config.backend {
            RuntimeBackend::Simulation => {
                info!(tid = tid, "Creating 'simulation' runtime backend");
                Ok(Arc::new(simulator::SimulatedRuntime::new()))
            },
            RuntimeBackend::Docker => {
                if !docker::DockerRuntime::supported(tid).await {
                    anyhow::bail!("Docker runtime backend requested but Docker is not reachable");
                }
                info!(tid = tid, "Creating 'docker' runtime backend");
                Ok(Arc::new(docker::DockerRuntime::new(self.config.docker.clone(), tid)?))
            },
        }
    }
}
