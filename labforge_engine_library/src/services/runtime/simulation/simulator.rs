use super::{LaunchSpec, ProbeResult, RuntimeBackend, RuntimeClient, RuntimeError, RuntimeHandle};
use crate::services::templates::LabTemplate;
use anyhow::Result;
use dashmap::DashMap;
use labforge_library::transaction::TransactionId;
use labforge_library::utils::port::Port;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SimulatedContainer {
    pub instance_id: String,
    pub image: String,
    pub host_port: Port,
    pub running: bool,
}

/// An in-memory container runtime.
/// Tests drive failures through the injection methods.
#[derive(labforge_library::ToAny, Default)]
pub struct SimulatedRuntime {
    containers: DashMap<RuntimeHandle, SimulatedContainer>,
    create_failures: Mutex<VecDeque<RuntimeError>>,
    create_delay: Mutex<Option<Duration>>,
    probe_overrides: DashMap<RuntimeHandle, ProbeResult>,
    failing_probes: AtomicU32,
    stops_fail: AtomicBool,
    create_calls: AtomicU32,
    stop_calls: AtomicU32,
    remove_calls: AtomicU32,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next creates fail with these errors, in order
    pub fn fail_next_creates(&self, errors: Vec<RuntimeError>) {
        self.create_failures.lock().extend(errors);
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    /// Every probe of `handle` returns `result` until cleared
    pub fn set_probe_result(&self, handle: &RuntimeHandle, result: ProbeResult) {
        self.probe_overrides.insert(handle.clone(), result);
    }

    pub fn clear_probe_result(&self, handle: &RuntimeHandle) {
        self.probe_overrides.remove(handle);
    }

    /// The next `count` probes of any container report unhealthy
    pub fn fail_next_probes(&self, count: u32) {
        self.failing_probes.store(count, Ordering::SeqCst);
    }

    /// Drop a container without the engine knowing
    pub fn vanish(&self, handle: &RuntimeHandle) {
        self.containers.remove(handle);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.stops_fail.store(fail, Ordering::SeqCst);
    }

    pub fn exists(&self, handle: &RuntimeHandle) -> bool {
        self.containers.contains_key(handle)
    }

    pub fn container(&self, handle: &RuntimeHandle) -> Option<SimulatedContainer> {
        self.containers.get(handle).map(|c| c.value().clone())
    }

    pub fn running_count(&self) -> usize {
        self.containers.iter().filter(|c| c.running).count()
    }

    /// Insert a container the engine has no record of
    pub fn inject_container(&self, handle: RuntimeHandle, container: SimulatedContainer) {
        self.containers.insert(handle, container);
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }
    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::SeqCst)
    }
    pub fn remove_calls(&self) -> u32 {
        self.remove_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RuntimeClient for SimulatedRuntime {
    async fn create_and_start(&self, spec: &LaunchSpec, tid: &TransactionId) -> Result<RuntimeHandle> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        // the delay stands in for the image pull, the container only exists after it
        let delay = *self.create_delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        let failure = self.create_failures.lock().pop_front();
        if let Some(err) = failure {
            debug!(tid=tid, error=%err, container=%spec.container_name, "Injected create failure");
            anyhow::bail!(err);
        }
        self.containers.insert(
            spec.container_name.clone(),
            SimulatedContainer {
                instance_id: spec.instance_id.clone(),
                image: spec.template.image.clone(),
                host_port: spec.host_port,
                running: true,
            },
        );
        debug!(tid=tid, container=%spec.container_name, port=spec.host_port, "Simulated container started");
        Ok(spec.container_name.clone())
    }

    async fn probe_health(
        &self,
        handle: &RuntimeHandle,
        _template: &LabTemplate,
        _tid: &TransactionId,
    ) -> Result<ProbeResult> {
        if let Some(r) = self.probe_overrides.get(handle) {
            return Ok(r.value().clone());
        }
        let running = match self.containers.get(handle) {
            Some(c) => c.running,
            None => return Ok(ProbeResult::Vanished),
        };
        if !running {
            return Ok(ProbeResult::Unhealthy("container is not running".to_string()));
        }
        let failing = self
            .failing_probes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match failing {
            Ok(_) => Ok(ProbeResult::Unhealthy("injected probe failure".to_string())),
            Err(_) => Ok(ProbeResult::Healthy),
        }
    }

    async fn stop(&self, handle: &RuntimeHandle, _grace: Duration, _tid: &TransactionId) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        if self.stops_fail.load(Ordering::SeqCst) {
            anyhow::bail!(RuntimeError::Transient("injected stop failure".to_string()));
        }
        match self.containers.get_mut(handle) {
            Some(mut c) => {
                c.running = false;
                Ok(())
            },
            None => anyhow::bail!(RuntimeError::Vanished(handle.to_string())),
        }
    }

    async fn remove(&self, handle: &RuntimeHandle, _tid: &TransactionId) -> Result<()> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.containers.remove(handle);
        Ok(())
    }

    async fn list_managed(&self, _tid: &TransactionId) -> Result<Vec<RuntimeHandle>> {
        Ok(self.containers.iter().map(|c| c.key().clone()).collect())
    }

    fn backend(&self) -> RuntimeBackend {
        RuntimeBackend::Simulation
    }
}
