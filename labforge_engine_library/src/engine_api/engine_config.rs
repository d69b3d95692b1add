use crate::services::runtime::{docker::DockerConfig, RuntimeBackend};
use crate::services::templates::LabTemplate;
use labforge_library::{logging::LoggingConfig, utils::port::Port};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const ENGINE_ENV_PREFIX: &str = "LABFORGE_ENGINE";

#[derive(Debug, Deserialize)]
pub struct Configuration {
    /// name for the server
    pub name: String,
    /// address to listen on
    pub address: String,
    /// port to listen on
    pub port: Port,
    /// Host name handed to learners in lab endpoints
    pub public_host: String,
    /// See documentation [here](https://docs.rs/tokio/latest/tokio/runtime/struct.Builder.html#method.event_interval) for details
    pub tokio_event_interval: u32,
    /// See documentation [here](https://docs.rs/tokio/latest/tokio/runtime/struct.Builder.html#method.global_queue_interval) for details
    pub tokio_queue_interval: u32,
    pub logging: Arc<LoggingConfig>,
    pub capacity: Arc<CapacityConfig>,
    pub runtime: Arc<RuntimeConfig>,
    pub health: Arc<HealthConfig>,
    pub reaper: Arc<ReaperConfig>,
    pub persistence: Arc<PersistenceConfig>,
    /// Lab templates keyed by profile id
    #[serde(default)]
    pub templates: HashMap<String, LabTemplate>,
    /// JSON file of additional templates, also the source for template reloads
    pub templates_file: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
/// Total host resources labs may be granted
pub struct CapacityConfig {
    pub cpu_shares: u64,
    pub memory_bytes: u64,
    /// First port of the inclusive range labs are published on
    pub port_range_start: Port,
    pub port_range_end: Port,
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    pub backend: RuntimeBackend,
    /// Upper bound on every single runtime call
    pub call_timeout_ms: u64,
    /// Additional create attempts after a transient failure
    pub create_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub docker: Option<DockerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// How often to sweep, in milliseconds.
    /// If 0, the background sweep is disabled.
    pub sweep_freq_ms: u64,
    /// Consecutive failed probes before a lab is marked Failed
    pub unhealthy_threshold: u32,
    /// Probes to try before a new lab is given up on
    pub startup_probe_attempts: u32,
    pub startup_probe_backoff_ms: u64,
    /// Inactivity before a running lab is marked Idle
    pub idle_threshold_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct ReaperConfig {
    /// How often to sweep, in milliseconds.
    /// If 0, the background sweep is disabled.
    pub sweep_freq_ms: u64,
    /// Time an Idle lab is kept before being torn down, unless its template overrides it
    pub idle_timeout_sec: u64,
    /// Hard cap on a lab's lifetime, regardless of activity
    pub absolute_ttl_sec: u64,
    /// Time a container is given to exit on a graceful stop
    pub stop_grace_sec: u64,
    /// A teardown not finished after this long is forced
    pub stuck_teardown_sec: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct PersistenceConfig {
    /// Directory for instance records.
    /// If empty, records are only kept in memory.
    #[serde(default)]
    pub directory: String,
}

pub type EngineConfig = Arc<Configuration>;

impl Configuration {
    pub fn new(config_fpath: Option<&str>, overrides: Option<Vec<(String, String)>>) -> anyhow::Result<Self> {
        labforge_library::load_config_default!(
            "labforge_engine/src/engine.json",
            config_fpath,
            overrides,
            ENGINE_ENV_PREFIX
        )
    }

    pub fn boxed(config_fpath: Option<&str>, overrides: Option<Vec<(String, String)>>) -> anyhow::Result<EngineConfig> {
        Ok(Arc::new(Configuration::new(config_fpath, overrides)?))
    }
}
