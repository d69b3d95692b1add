use crate::engine_api::engine_config::EngineConfig;
use crate::services::instance::{LabInstance, LabStatus};
use crate::services::lifecycle::LifecycleManager;
use crate::services::registry::InstanceRegistry;
use crate::services::runtime::ProbeResult;
use crate::services::templates::TemplateRegistry;
use anyhow::Result;
use futures::future::join_all;
use labforge_library::threading::tokio_thread;
use labforge_library::transaction::{TransactionId, HEALTH_MONITOR_TID};
use labforge_library::bail_error;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthSweepReport {
    pub probed: usize,
    pub healthy: usize,
    pub failed: usize,
    pub idled: usize,
}

/// Periodically probes every Running and Idle lab, and marks inactive labs Idle.
pub struct HealthMonitor {
    config: EngineConfig,
    registry: Arc<InstanceRegistry>,
    templates: Arc<TemplateRegistry>,
    lifecycle: Arc<LifecycleManager>,
    _worker_thread: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn boxed(
        config: EngineConfig,
        registry: Arc<InstanceRegistry>,
        templates: Arc<TemplateRegistry>,
        lifecycle: Arc<LifecycleManager>,
        tid: &TransactionId,
    ) -> Result<Arc<Self>> {
        let (handle, tx) = match config.health.sweep_freq_ms {
            0 => (None, None),
            freq => {
                let (h, tx) = tokio_thread(freq, HEALTH_MONITOR_TID.clone(), HealthMonitor::monitor);
                (Some(h), Some(tx))
            },
        };
        let svc = Arc::new(HealthMonitor {
            config,
            registry,
            templates,
            lifecycle,
            _worker_thread: handle,
        });
        if let Some(tx) = tx {
            if tx.send(svc.clone()).is_err() {
                bail_error!(tid = tid, "Failed to send health monitor to its background loop");
            }
            info!(tid = tid, freq_ms = svc.config.health.sweep_freq_ms, "Health monitor started");
        }
        Ok(svc)
    }

    async fn monitor(self: Arc<Self>, tid: TransactionId) {
        let report = self.sweep(&tid).await;
        debug!(tid=tid, report=?report, "Health sweep complete");
    }

    /// Probe every Running and Idle lab once, then mark the inactive ones Idle
    pub async fn sweep(&self, tid: &TransactionId) -> HealthSweepReport {
        let targets = self.registry.list_matching(|i| i.status.has_endpoint());
        let results = join_all(targets.iter().map(|inst| self.probe_one(inst, tid))).await;
        let mut report = HealthSweepReport {
            probed: targets.len(),
            ..Default::default()
        };
        for (inst, result) in targets.iter().zip(results) {
            let result = match result {
                Some(r) => r,
                None => continue,
            };
            if result == ProbeResult::Healthy {
                report.healthy += 1;
            }
            match self.lifecycle.apply_probe_result(&inst.owner, &inst.id, result, tid) {
                Ok(true) => report.failed += 1,
                Ok(false) => (),
                Err(e) => warn!(tid=tid, error=%e, instance_id=%inst.id, "Failed to apply probe result"),
            }
        }
        report.idled = self.mark_idle(tid);
        report
    }

    /// Probe one lab. Errors and timeouts count as unhealthy.
    /// Returns [None] if the lab has no template to probe with.
    async fn probe_one(&self, inst: &LabInstance, tid: &TransactionId) -> Option<ProbeResult> {
        let template = match self.templates.resolve(&inst.owner.profile_id, tid) {
            Ok(t) => t,
            Err(_) => {
                warn!(tid=tid, instance_id=%inst.id, profile=%inst.owner.profile_id, "No template for lab, skipping health check");
                return None;
            },
        };
        let handle = inst.removal_handle();
        let timeout = Duration::from_millis(self.config.runtime.call_timeout_ms);
        let result = match tokio::time::timeout(
            timeout,
            self.lifecycle.runtime().probe_health(&handle, &template, tid),
        )
        .await
        {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => ProbeResult::Unhealthy(format!("probe failed: {}", e)),
            Err(_) => ProbeResult::Unhealthy(format!("probe timed out after {}ms", timeout.as_millis())),
        };
        Some(result)
    }

    fn mark_idle(&self, tid: &TransactionId) -> usize {
        let mut idled = 0;
        for inst in self.registry.list_by_status(LabStatus::Running) {
            let threshold = self
                .templates
                .resolve(&inst.owner.profile_id, tid)
                .ok()
                .and_then(|t| t.idle_threshold_sec)
                .unwrap_or(self.config.health.idle_threshold_sec);
            match self.lifecycle.mark_idle_if_inactive(&inst.owner, &inst.id, threshold, tid) {
                Ok(true) => idled += 1,
                Ok(false) => (),
                Err(e) => warn!(tid=tid, error=%e, instance_id=%inst.id, "Failed to check lab for inactivity"),
            }
        }
        idled
    }
}
