use super::{
    LaunchSpec, ProbeResult, RuntimeBackend, RuntimeClient, RuntimeError, RuntimeHandle, OWNER_LABEL_KEY,
    OWNER_LABEL_VALUE,
};
use crate::services::templates::LabTemplate;
use anyhow::Result;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use dashmap::DashSet;
use futures::StreamExt;
use labforge_library::transaction::TransactionId;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

const INSTANCE_LABEL_KEY: &str = "labforge.instance";
const OWNER_KEY_LABEL_KEY: &str = "labforge.owner";

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, Default)]
/// Authentication for a specific Docker repository
pub struct DockerAuth {
    pub username: String,
    pub password: String,
    pub repository: String,
}
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, Default)]
/// Optional configuration to modify or pass through to Docker
pub struct DockerConfig {
    pub auth: Option<DockerAuth>,
    #[serde(default)]
    /// Avoid pulling images if a matching <image:tag> is found locally.
    /// Can skip pulling an updated version of a tag, but saves time & avoids rate limiting.
    pub avoid_pull: bool,
}

/// Map a Docker API failure onto the engine's error classes.
/// `missing_is_vanished` decides what a 404 means: a vanished container, or a fatal missing image/config.
fn classify(e: &BollardError, missing_is_vanished: bool) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError { status_code, message } => match *status_code {
            404 if missing_is_vanished => RuntimeError::Vanished(message.clone()),
            s if s >= 500 => RuntimeError::Transient(message.clone()),
            _ => RuntimeError::Fatal(message.clone()),
        },
        BollardError::RequestTimeoutError | BollardError::IOError { .. } | BollardError::HyperResponseError { .. } => {
            RuntimeError::Transient(e.to_string())
        },
        _ => RuntimeError::Fatal(e.to_string()),
    }
}

fn status_code(e: &BollardError) -> Option<u16> {
    match e {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[derive(labforge_library::ToAny)]
pub struct DockerRuntime {
    docker_api: Docker,
    docker_config: Option<DockerConfig>,
    pulled_images: DashSet<String>,
}

impl DockerRuntime {
    pub async fn supported(tid: &TransactionId) -> bool {
        let docker = match Docker::connect_with_socket_defaults() {
            Ok(d) => d,
            Err(e) => {
                warn!(tid=tid, error=%e, "Failed to connect to docker");
                return false;
            },
        };
        match docker.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!(tid=tid, error=?e, "Failed to query docker version");
                false
            },
        }
    }

    pub fn new(docker_config: Option<DockerConfig>, tid: &TransactionId) -> Result<Self> {
        let docker = match Docker::connect_with_socket_defaults() {
            Ok(d) => d,
            Err(e) => labforge_library::bail_error!(tid=tid, error=%e, "Failed to connect to docker"),
        };
        Ok(DockerRuntime {
            docker_api: docker,
            docker_config,
            pulled_images: DashSet::new(),
        })
    }

    fn credentials(&self, image: &str) -> Option<DockerCredentials> {
        match self.docker_config.as_ref().and_then(|c| c.auth.as_ref()) {
            Some(a) if image.starts_with(a.repository.as_str()) => Some(DockerCredentials {
                username: Some(a.username.clone()),
                password: Some(a.password.clone()),
                ..Default::default()
            }),
            _ => None,
        }
    }

    /// Pull the image unless it was already pulled, or is present locally and pulls are avoided
    async fn ensure_image(&self, image: &str, tid: &TransactionId) -> Result<()> {
        if self.pulled_images.contains(image) {
            debug!(tid = tid, image = image, "Image already pulled");
            return Ok(());
        }
        if self.docker_config.as_ref().is_some_and(|c| c.avoid_pull) && self.docker_api.inspect_image(image).await.is_ok()
        {
            info!(tid = tid, image = image, "Image found locally, skipping pull");
            self.pulled_images.insert(image.to_string());
            return Ok(());
        }
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker_api.create_image(options, None, self.credentials(image));
        while let Some(res) = stream.next().await {
            match res {
                Ok(inf) => debug!(tid=tid, info=?inf, "pull info update"),
                Err(e) => {
                    warn!(tid=tid, error=%e, image=image, "Failed to pull image");
                    anyhow::bail!(classify(&e, false));
                },
            }
        }
        info!(tid = tid, image = image, "Docker image pulled successfully");
        self.pulled_images.insert(image.to_string());
        Ok(())
    }

    fn container_config(spec: &LaunchSpec) -> std::result::Result<Config<String>, RuntimeError> {
        let cpu_shares = i64::try_from(spec.limits.cpu_shares)
            .map_err(|_| RuntimeError::Fatal(format!("cpu shares {} out of range", spec.limits.cpu_shares)))?;
        let memory = i64::try_from(spec.limits.memory_bytes)
            .map_err(|_| RuntimeError::Fatal(format!("memory limit {} out of range", spec.limits.memory_bytes)))?;
        let container_port = format!("{}/tcp", spec.template.container_port);
        let port_bindings = HashMap::from([(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);
        let host_config = HostConfig {
            cpu_shares: Some(cpu_shares),
            memory: Some(memory),
            port_bindings: Some(port_bindings),
            ..Default::default()
        };
        let mut env: Vec<String> = spec.template.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.push(format!("LABFORGE_INSTANCE_ID={}", spec.instance_id));
        env.sort();
        let cmd = match spec.template.startup_command.is_empty() {
            true => None,
            false => Some(spec.template.startup_command.clone()),
        };
        Ok(Config {
            labels: Some(HashMap::from([
                (OWNER_LABEL_KEY.to_string(), OWNER_LABEL_VALUE.to_string()),
                (INSTANCE_LABEL_KEY.to_string(), spec.instance_id.clone()),
                (OWNER_KEY_LABEL_KEY.to_string(), spec.owner.to_string()),
            ])),
            image: Some(spec.template.image.clone()),
            host_config: Some(host_config),
            env: Some(env),
            exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
            cmd,
            ..Default::default()
        })
    }

    async fn exec_exit_code(&self, handle: &RuntimeHandle, cmd: &[String], tid: &TransactionId) -> Result<i64> {
        let exec = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = match self.docker_api.create_exec(&handle.0, exec).await {
            Ok(c) => c,
            Err(e) => anyhow::bail!(classify(&e, true)),
        };
        match self.docker_api.start_exec(&created.id, None).await {
            Ok(StartExecResults::Attached { mut output, .. }) => {
                while let Some(chunk) = output.next().await {
                    if let Err(e) = chunk {
                        warn!(tid=tid, error=%e, handle=%handle, "Error reading health check output");
                        break;
                    }
                }
            },
            Ok(StartExecResults::Detached) => (),
            Err(e) => anyhow::bail!(classify(&e, true)),
        };
        match self.docker_api.inspect_exec(&created.id).await {
            Ok(inspect) => Ok(inspect.exit_code.unwrap_or(-1)),
            Err(e) => anyhow::bail!(classify(&e, true)),
        }
    }
}

#[async_trait::async_trait]
impl RuntimeClient for DockerRuntime {
    #[cfg_attr(feature = "full_spans", tracing::instrument(skip(self, spec), fields(tid=tid)))]
    async fn create_and_start(&self, spec: &LaunchSpec, tid: &TransactionId) -> Result<RuntimeHandle> {
        self.ensure_image(&spec.template.image, tid).await?;
        let options = CreateContainerOptions {
            name: spec.container_name.0.as_str(),
            platform: None,
        };
        let config = match Self::container_config(spec) {
            Ok(c) => c,
            Err(e) => {
                warn!(tid=tid, error=%e, container=%spec.container_name, "Invalid container config");
                anyhow::bail!(e);
            },
        };
        debug!(tid=tid, container=%spec.container_name, config=?config, "Creating container");
        if let Err(e) = self.docker_api.create_container(Some(options), config).await {
            warn!(tid=tid, error=%e, container=%spec.container_name, "Error creating container");
            anyhow::bail!(classify(&e, false));
        }
        if let Err(e) = self
            .docker_api
            .start_container::<String>(&spec.container_name.0, None)
            .await
        {
            warn!(tid=tid, error=%e, container=%spec.container_name, "Error starting container");
            anyhow::bail!(classify(&e, false));
        }
        info!(tid=tid, container=%spec.container_name, port=spec.host_port, "Container started");
        Ok(spec.container_name.clone())
    }

    async fn probe_health(
        &self,
        handle: &RuntimeHandle,
        template: &LabTemplate,
        tid: &TransactionId,
    ) -> Result<ProbeResult> {
        let inspect = match self
            .docker_api
            .inspect_container(&handle.0, None::<InspectContainerOptions>)
            .await
        {
            Ok(i) => i,
            Err(e) => match classify(&e, true) {
                RuntimeError::Vanished(_) => return Ok(ProbeResult::Vanished),
                other => anyhow::bail!(other),
            },
        };
        let running = inspect.state.as_ref().and_then(|s| s.running).unwrap_or(false);
        if !running {
            return Ok(ProbeResult::Unhealthy("container is not running".to_string()));
        }
        match self.exec_exit_code(handle, &template.health_check_command, tid).await {
            Ok(0) => Ok(ProbeResult::Healthy),
            Ok(code) => Ok(ProbeResult::Unhealthy(format!("health check exited with {}", code))),
            Err(e) => match RuntimeError::classify(&e) {
                RuntimeError::Vanished(_) => Ok(ProbeResult::Vanished),
                other => Err(anyhow::Error::new(other)),
            },
        }
    }

    async fn stop(&self, handle: &RuntimeHandle, grace: Duration, tid: &TransactionId) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker_api.stop_container(&handle.0, Some(options)).await {
            Ok(_) => Ok(()),
            // already stopped
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => {
                warn!(tid=tid, error=%e, handle=%handle, "Failed to stop Docker container");
                anyhow::bail!(classify(&e, true))
            },
        }
    }

    async fn remove(&self, handle: &RuntimeHandle, tid: &TransactionId) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            link: false,
        };
        match self.docker_api.remove_container(&handle.0, Some(options)).await {
            Ok(_) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                debug!(tid=tid, handle=%handle, "Container to remove does not exist");
                Ok(())
            },
            Err(e) => {
                warn!(tid=tid, error=%e, handle=%handle, "Failed to remove Docker container");
                anyhow::bail!(classify(&e, false))
            },
        }
    }

    async fn list_managed(&self, tid: &TransactionId) -> Result<Vec<RuntimeHandle>> {
        let label = format!("{}={}", OWNER_LABEL_KEY, OWNER_LABEL_VALUE);
        let options = ListContainersOptions {
            all: true,
            limit: None,
            size: false,
            filters: HashMap::from_iter(vec![("label", vec![label.as_str()])]),
        };
        let list = match self.docker_api.list_containers(Some(options)).await {
            Ok(l) => l,
            Err(e) => {
                warn!(tid=tid, error=%e, "Failed to list Docker containers");
                anyhow::bail!(classify(&e, false))
            },
        };
        Ok(list
            .into_iter()
            .filter_map(|c| c.names.and_then(|n| n.into_iter().next()))
            .map(|n| RuntimeHandle(n.trim_start_matches('/').to_string()))
            .collect())
    }

    fn backend(&self) -> RuntimeBackend {
        RuntimeBackend::Docker
    }
}
