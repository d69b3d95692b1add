use crate::engine_api::engine_config::EngineConfig;
use crate::services::instance::{LabInstance, LabStatus};
use crate::services::lifecycle::LifecycleManager;
use crate::services::registry::InstanceRegistry;
use crate::services::templates::TemplateRegistry;
use anyhow::Result;
use futures::future::join_all;
use labforge_library::bail_error;
use labforge_library::clock::{seconds_between, Clock};
use labforge_library::threading::tokio_thread;
use labforge_library::transaction::{TransactionId, IDLE_REAPER_TID};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    IdleTimeout,
    TtlExpired,
    Failed,
    StuckTeardown,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub selected: usize,
    pub destroyed: usize,
    pub errors: usize,
}

/// Periodically reclaims idle, expired, failed, and stuck labs.
pub struct IdleReaper {
    config: EngineConfig,
    registry: Arc<InstanceRegistry>,
    templates: Arc<TemplateRegistry>,
    lifecycle: Arc<LifecycleManager>,
    clock: Clock,
    _worker_thread: Option<JoinHandle<()>>,
}

impl IdleReaper {
    pub fn boxed(
        config: EngineConfig,
        registry: Arc<InstanceRegistry>,
        templates: Arc<TemplateRegistry>,
        lifecycle: Arc<LifecycleManager>,
        clock: Clock,
        tid: &TransactionId,
    ) -> Result<Arc<Self>> {
        let (handle, tx) = match config.reaper.sweep_freq_ms {
            0 => (None, None),
            freq => {
                let (h, tx) = tokio_thread(freq, IDLE_REAPER_TID.clone(), IdleReaper::reap);
                (Some(h), Some(tx))
            },
        };
        let svc = Arc::new(IdleReaper {
            config,
            registry,
            templates,
            lifecycle,
            clock,
            _worker_thread: handle,
        });
        if let Some(tx) = tx {
            if tx.send(svc.clone()).is_err() {
                bail_error!(tid = tid, "Failed to send reaper to its background loop");
            }
            info!(tid = tid, freq_ms = svc.config.reaper.sweep_freq_ms, "Idle reaper started");
        }
        Ok(svc)
    }

    async fn reap(self: Arc<Self>, tid: TransactionId) {
        let report = self.sweep(&tid).await;
        if report.selected > 0 {
            info!(tid=tid, report=?report, "Reaper sweep complete");
        }
    }

    fn idle_timeout_sec(&self, inst: &LabInstance, tid: &TransactionId) -> u64 {
        self.templates
            .resolve(&inst.owner.profile_id, tid)
            .ok()
            .and_then(|t| t.idle_timeout_sec)
            .unwrap_or(self.config.reaper.idle_timeout_sec)
    }

    /// Why this instance should be reclaimed now, if it should
    fn reason(&self, inst: &LabInstance, now: OffsetDateTime, tid: &TransactionId) -> Option<ReapReason> {
        if inst.status.is_non_terminal() && seconds_between(inst.created_at, now) >= self.config.reaper.absolute_ttl_sec {
            return Some(ReapReason::TtlExpired);
        }
        match inst.status {
            LabStatus::Idle if seconds_between(inst.last_active_at, now) >= self.idle_timeout_sec(inst, tid) => {
                Some(ReapReason::IdleTimeout)
            },
            LabStatus::Failed => Some(ReapReason::Failed),
            LabStatus::Stopping | LabStatus::Stopped
                if seconds_between(inst.status_changed_at, now) >= self.config.reaper.stuck_teardown_sec =>
            {
                Some(ReapReason::StuckTeardown)
            },
            _ => None,
        }
    }

    /// Tear down every lab that is due, concurrently
    pub async fn sweep(&self, tid: &TransactionId) -> ReapReport {
        let now = self.clock.now();
        let due: Vec<(LabInstance, ReapReason)> = self
            .registry
            .list_matching(|i| !i.status.is_terminal())
            .into_iter()
            .filter_map(|i| self.reason(&i, now, tid).map(|r| (i, r)))
            .collect();
        let mut report = ReapReport {
            selected: due.len(),
            ..Default::default()
        };
        let teardowns = due.iter().map(|(inst, reason)| {
            let force = matches!(reason, ReapReason::Failed | ReapReason::StuckTeardown);
            debug!(tid=tid, instance_id=%inst.id, reason=?reason, force=force, "Reaping lab");
            self.lifecycle.teardown(&inst.owner, &inst.id, force, tid)
        });
        for ((inst, reason), res) in due.iter().zip(join_all(teardowns).await) {
            match res {
                Ok(d) if d.status == LabStatus::Destroyed => report.destroyed += 1,
                Ok(d) => debug!(tid=tid, instance_id=%inst.id, status=%d.status, "Lab not yet destroyed"),
                Err(e) => {
                    report.errors += 1;
                    warn!(tid=tid, error=%e, instance_id=%inst.id, reason=?reason, "Failed to reap lab");
                },
            }
        }
        report
    }
}
