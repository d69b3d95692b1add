use crate::engine_api::engine_config::EngineConfig;
use crate::services::instance::{LabDescriptor, LabInstance, LabNotFoundError, LabStatus, OwnerKey};
use crate::services::registry::InstanceRegistry;
use crate::services::resources::allocator::{AllocatorStats, ResourceAllocator};
use crate::services::resources::Allocation;
use crate::services::runtime::{LaunchSpec, ProbeResult, RuntimeBackend, RuntimeClient, RuntimeError, RuntimeHandle};
use crate::services::templates::{LabTemplate, TemplateRegistry};
use anyhow::Result;
use labforge_library::clock::{seconds_between, Clock};
use labforge_library::threading::tokio_sender_thread;
use labforge_library::transaction::{gen_tid, TransactionId, TEARDOWN_WORKER_TID};
use labforge_library::utils::backoff_delay;
use labforge_library::{bail_error, bail_typed};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
/// A lab teardown for the background worker
pub struct TeardownRequest {
    pub owner: OwnerKey,
    pub instance_id: String,
    /// Skip the graceful stop
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub backend: RuntimeBackend,
    pub allocator: AllocatorStats,
    /// Instance count for every status
    pub instances: BTreeMap<String, usize>,
    pub profiles: Vec<String>,
}

enum Admission {
    Existing(LabDescriptor),
    Admitted(Allocation),
}

enum StopPlan {
    Teardown { instance_id: String, force: bool },
    Done(LabDescriptor),
}

/// How long a graceful stop may take before removal is forced
fn stop_deadline(grace: Duration, call_timeout: Duration) -> Duration {
    grace.saturating_add(call_timeout)
}

/// Move an instance to Failed.
/// With `release`, its allocation is detached for release once the change is committed,
/// otherwise the allocation stays on the instance until its teardown removes the container.
/// Returns [None] if the instance can no longer fail.
fn fail_in_place(
    inst: &mut LabInstance,
    reason: &str,
    release: bool,
    now: OffsetDateTime,
) -> Result<Option<Option<Allocation>>> {
    if !inst.status.can_transition_to(LabStatus::Failed) {
        return Ok(None);
    }
    inst.transition(LabStatus::Failed, now)?;
    inst.failure_reason = Some(reason.to_string());
    match release {
        true => Ok(Some(inst.take_allocation())),
        false => Ok(Some(None)),
    }
}

/// Owns every lab state transition.
/// Registry changes happen under the owner's lock; runtime calls happen outside of it,
/// and their results are re-validated against the registry before being applied.
pub struct LifecycleManager {
    config: EngineConfig,
    templates: Arc<TemplateRegistry>,
    allocator: Arc<ResourceAllocator>,
    registry: Arc<InstanceRegistry>,
    runtime: Arc<dyn RuntimeClient>,
    clock: Clock,
    teardown_tx: UnboundedSender<TeardownRequest>,
    _teardown_worker: JoinHandle<()>,
}

impl LifecycleManager {
    pub fn boxed(
        config: EngineConfig,
        templates: Arc<TemplateRegistry>,
        allocator: Arc<ResourceAllocator>,
        registry: Arc<InstanceRegistry>,
        runtime: Arc<dyn RuntimeClient>,
        clock: Clock,
        tid: &TransactionId,
    ) -> Result<Arc<Self>> {
        let (handle, tx, teardown_tx) =
            tokio_sender_thread(TEARDOWN_WORKER_TID.clone(), Arc::new(LifecycleManager::teardown_worker));
        let svc = Arc::new(LifecycleManager {
            config,
            templates,
            allocator,
            registry,
            runtime,
            clock,
            teardown_tx,
            _teardown_worker: handle,
        });
        if tx.send(svc.clone()).is_err() {
            bail_error!(tid = tid, "Failed to send lifecycle manager to teardown worker");
        }
        Ok(svc)
    }

    async fn teardown_worker(self: Arc<Self>, tid: TransactionId, req: TeardownRequest) {
        if let Err(e) = self.teardown(&req.owner, &req.instance_id, req.force, &tid).await {
            warn!(tid=tid, error=%e, owner=%req.owner, instance_id=%req.instance_id, "Queued teardown failed, leaving it to the reaper");
        }
    }

    fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    fn public_host(&self) -> &str {
        &self.config.public_host
    }

    fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.config.runtime.call_timeout_ms)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        backoff_delay(
            attempt,
            self.config.runtime.backoff_base_ms,
            self.config.runtime.backoff_max_ms,
        )
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    /// Run a runtime call with the configured timeout.
    /// A timeout is reported as a transient [RuntimeError].
    async fn bounded<T, F>(&self, call: &str, fut: F, tid: &TransactionId) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.call_timeout(), fut).await {
            Ok(r) => r,
            Err(_) => {
                warn!(tid=tid, call=call, timeout_ms=self.config.runtime.call_timeout_ms, "Runtime call timed out");
                anyhow::bail!(RuntimeError::Transient(format!(
                    "{} timed out after {}ms",
                    call, self.config.runtime.call_timeout_ms
                )))
            },
        }
    }

    /// Best-effort removal of anything a failed or abandoned create left behind
    async fn compensating_remove(&self, handle: &RuntimeHandle, tid: &TransactionId) {
        match self.bounded("remove", self.runtime.remove(handle, tid), tid).await {
            Ok(_) => debug!(tid=tid, handle=%handle, "Compensating remove done"),
            Err(e) => error!(tid=tid, error=%e, handle=%handle, "Compensating remove failed"),
        }
    }

    /// Enqueue a teardown for the background worker
    pub fn enqueue_teardown(&self, owner: &OwnerKey, instance_id: &str, force: bool, tid: &TransactionId) {
        let req = TeardownRequest {
            owner: owner.clone(),
            instance_id: instance_id.to_string(),
            force,
        };
        if let Err(e) = self.teardown_tx.send(req) {
            warn!(tid=tid, error=%e, instance_id=instance_id, "Teardown worker is gone, leaving it to the reaper");
        }
    }

    /// Get a lab for the owner, provisioning one if they have none.
    /// Returns the existing lab's descriptor if one is already live or on its way up.
    ///
    /// # Errors
    /// [crate::services::templates::UnknownProfileError] or [crate::services::resources::CapacityExceededError],
    /// in both cases without creating an instance.
    /// Runtime failures are not errors; they yield a Failed descriptor.
    #[cfg_attr(feature = "full_spans", tracing::instrument(skip(self, owner), fields(tid=tid)))]
    pub async fn request_lab(&self, owner: &OwnerKey, tid: &TransactionId) -> Result<LabDescriptor> {
        let template = self.templates.resolve(&owner.profile_id, tid)?;
        let now = self.now();
        let instance_id = gen_tid();
        let mut reserved: Option<Allocation> = None;
        let admission = self.registry.update(owner, tid, |slot| {
            if let Some(existing) = slot.current() {
                return Ok(Admission::Existing(existing.describe(self.public_host())));
            }
            let alloc = self.allocator.reserve(template.limits, tid)?;
            reserved = Some(alloc);
            let mut inst = LabInstance::new(instance_id.clone(), owner.clone(), template.limits, now);
            inst.allocated_port = Some(alloc.port);
            inst.transition(LabStatus::Provisioning, now)?;
            slot.insert(inst);
            Ok(Admission::Admitted(alloc))
        });
        let alloc = match admission {
            Ok(Admission::Existing(d)) => {
                debug!(tid=tid, owner=%owner, instance_id=%d.instance_id, status=%d.status, "Owner already has a lab");
                return Ok(d);
            },
            Ok(Admission::Admitted(a)) => a,
            Err(e) => {
                if let Some(a) = reserved {
                    self.allocator.release(&a, tid);
                }
                return Err(e);
            },
        };
        info!(tid=tid, owner=%owner, instance_id=%instance_id, port=alloc.port, "Provisioning lab");
        self.provision(owner, &instance_id, template, alloc, tid).await
    }

    async fn provision(
        &self,
        owner: &OwnerKey,
        instance_id: &str,
        template: Arc<LabTemplate>,
        alloc: Allocation,
        tid: &TransactionId,
    ) -> Result<LabDescriptor> {
        let spec = LaunchSpec {
            instance_id: instance_id.to_string(),
            container_name: RuntimeHandle::for_instance(instance_id),
            owner: owner.clone(),
            template: template.clone(),
            host_port: alloc.port,
            limits: alloc.limits,
        };
        let handle = match self.create_with_retry(&spec, tid).await {
            Ok(h) => h,
            Err(e) => {
                if self.stop_requested(owner, instance_id) {
                    info!(tid=tid, instance_id=instance_id, "Lab stopped during provisioning");
                    return self.teardown(owner, instance_id, true, tid).await;
                }
                return self.fail_provisioning(owner, instance_id, &e.to_string(), tid);
            },
        };

        let status = self.registry.update_instance(owner, instance_id, tid, |inst| {
            inst.runtime_handle = Some(handle.clone());
            Ok(inst.status)
        })?;
        if status != LabStatus::Provisioning {
            return self.settle_interrupted(owner, instance_id, &handle, status, tid).await;
        }

        match self.startup_probe(&handle, &template, tid).await {
            Ok(_) => {
                let now = self.now();
                let status = self.registry.update_instance(owner, instance_id, tid, |inst| {
                    if inst.status == LabStatus::Provisioning {
                        inst.transition(LabStatus::Running, now)?;
                        inst.last_health_check_at = Some(now);
                        inst.last_active_at = now;
                        inst.failure_count = 0;
                    }
                    Ok(inst.status)
                })?;
                if status != LabStatus::Running {
                    return self.settle_interrupted(owner, instance_id, &handle, status, tid).await;
                }
                info!(tid=tid, owner=%owner, instance_id=instance_id, port=alloc.port, "Lab is running");
                self.status_by_id(owner, instance_id, tid)
            },
            Err(reason) => {
                if self.stop_requested(owner, instance_id) {
                    return self.teardown(owner, instance_id, true, tid).await;
                }
                // the port is only handed back once the container no longer holds it
                self.compensating_remove(&handle, tid).await;
                self.fail_provisioning(owner, instance_id, &reason, tid)
            },
        }
    }

    /// Provisioning found the instance changed underneath it, finish whatever was asked for.
    /// A container created for an instance that is already gone is removed here, nobody else knows of it.
    async fn settle_interrupted(
        &self,
        owner: &OwnerKey,
        instance_id: &str,
        handle: &RuntimeHandle,
        status: LabStatus,
        tid: &TransactionId,
    ) -> Result<LabDescriptor> {
        match status {
            LabStatus::Stopping => {
                info!(tid=tid, instance_id=instance_id, "Lab stopped during provisioning");
                self.teardown(owner, instance_id, true, tid).await
            },
            LabStatus::Failed => self.teardown(owner, instance_id, true, tid).await,
            s if s.is_terminal() => {
                warn!(tid=tid, instance_id=instance_id, handle=%handle, "Lab was destroyed while its container was being created");
                self.compensating_remove(handle, tid).await;
                self.status_by_id(owner, instance_id, tid)
            },
            _ => self.status_by_id(owner, instance_id, tid),
        }
    }

    fn stop_requested(&self, owner: &OwnerKey, instance_id: &str) -> bool {
        self.registry
            .get_by_id(owner, instance_id)
            .is_some_and(|i| i.status == LabStatus::Stopping)
    }

    async fn create_with_retry(&self, spec: &LaunchSpec, tid: &TransactionId) -> Result<RuntimeHandle> {
        let mut attempt = 0;
        loop {
            if self.stop_requested(&spec.owner, &spec.instance_id) {
                anyhow::bail!("lab was stopped before its container was created");
            }
            let err = match self
                .bounded("create_and_start", self.runtime.create_and_start(spec, tid), tid)
                .await
            {
                Ok(h) => return Ok(h),
                Err(e) => RuntimeError::classify(&e),
            };
            self.compensating_remove(&spec.container_name, tid).await;
            if err.is_transient() && attempt < self.config.runtime.create_retries {
                let delay = self.retry_delay(attempt);
                warn!(tid=tid, error=%err, attempt=attempt, delay_ms=delay.as_millis() as u64, container=%spec.container_name, "Transient create failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            error!(tid=tid, error=%err, attempts=attempt+1, container=%spec.container_name, "Failed to create lab container");
            anyhow::bail!(err);
        }
    }

    /// Probe a new container until it is healthy or the attempts run out.
    /// Returns the last failure reason on error.
    async fn startup_probe(
        &self,
        handle: &RuntimeHandle,
        template: &LabTemplate,
        tid: &TransactionId,
    ) -> std::result::Result<(), String> {
        let attempts = std::cmp::max(1, self.config.health.startup_probe_attempts);
        let mut reason = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(
                    attempt - 1,
                    self.config.health.startup_probe_backoff_ms,
                    self.config.runtime.backoff_max_ms,
                ))
                .await;
            }
            match self
                .bounded("probe_health", self.runtime.probe_health(handle, template, tid), tid)
                .await
            {
                Ok(ProbeResult::Healthy) => return Ok(()),
                Ok(ProbeResult::Vanished) => return Err("container vanished during startup".to_string()),
                Ok(ProbeResult::Unhealthy(r)) => reason = r,
                Err(e) => reason = e.to_string(),
            };
            debug!(tid=tid, handle=%handle, attempt=attempt, reason=%reason, "Startup probe failed");
        }
        Err(format!("startup health check failed after {} attempts: {}", attempts, reason))
    }

    fn fail_provisioning(
        &self,
        owner: &OwnerKey,
        instance_id: &str,
        reason: &str,
        tid: &TransactionId,
    ) -> Result<LabDescriptor> {
        error!(tid=tid, owner=%owner, instance_id=instance_id, reason=reason, "Lab failed to provision");
        self.mark_failed(owner, instance_id, reason, tid)?;
        self.status_by_id(owner, instance_id, tid)
    }

    fn status_by_id(&self, owner: &OwnerKey, instance_id: &str, tid: &TransactionId) -> Result<LabDescriptor> {
        match self.registry.get_by_id(owner, instance_id) {
            Some(i) => Ok(i.describe(self.public_host())),
            None => bail_typed!(
                LabNotFoundError { owner: owner.clone() },
                tid = tid,
                owner = %owner,
                instance_id = instance_id,
                "Lab record is gone"
            ),
        }
    }

    /// Move the instance to Failed and release its allocation.
    /// Returns `false` if it was already past the point of failing.
    pub fn mark_failed(&self, owner: &OwnerKey, instance_id: &str, reason: &str, tid: &TransactionId) -> Result<bool> {
        let now = self.now();
        let outcome = self
            .registry
            .update_instance(owner, instance_id, tid, |inst| fail_in_place(inst, reason, true, now))?;
        match outcome {
            Some(alloc) => {
                if let Some(a) = alloc {
                    self.allocator.release(&a, tid);
                }
                warn!(tid=tid, owner=%owner, instance_id=instance_id, reason=reason, "Lab marked failed");
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Record learner activity, waking an Idle lab
    ///
    /// # Errors
    /// [LabNotFoundError] if the owner has no live lab
    pub fn report_activity(&self, owner: &OwnerKey, tid: &TransactionId) -> Result<LabDescriptor> {
        let now = self.now();
        self.registry.update(owner, tid, |slot| match slot.current_mut() {
            Some(inst) => {
                if inst.status == LabStatus::Idle {
                    inst.transition(LabStatus::Running, now)?;
                    debug!(tid=tid, instance_id=%inst.id, "Idle lab is active again");
                }
                inst.last_active_at = now;
                Ok(inst.describe(self.public_host()))
            },
            None => bail_typed!(
                LabNotFoundError { owner: owner.clone() },
                tid = tid,
                owner = %owner,
                "Activity reported for owner without a live lab"
            ),
        })
    }

    /// Stop the owner's lab.
    /// Stopping a lab that is already being torn down, or is gone, returns its current descriptor.
    ///
    /// # Errors
    /// [LabNotFoundError] if the owner never had a lab
    pub async fn stop_lab(&self, owner: &OwnerKey, tid: &TransactionId) -> Result<LabDescriptor> {
        let now = self.now();
        let plan = self.registry.update(owner, tid, |slot| {
            if let Some(inst) = slot.current_mut() {
                let status = inst.status;
                inst.transition(LabStatus::Stopping, now)?;
                return Ok(match status {
                    LabStatus::Running | LabStatus::Idle => StopPlan::Teardown {
                        instance_id: inst.id.clone(),
                        force: false,
                    },
                    // the provisioning task notices and finishes the teardown
                    _ => StopPlan::Done(inst.describe(self.public_host())),
                });
            }
            match slot.latest() {
                Some(inst) if matches!(inst.status, LabStatus::Stopped | LabStatus::Failed) => Ok(StopPlan::Teardown {
                    instance_id: inst.id.clone(),
                    force: true,
                }),
                Some(inst) => Ok(StopPlan::Done(inst.describe(self.public_host()))),
                None => bail_typed!(
                    LabNotFoundError { owner: owner.clone() },
                    tid = tid,
                    owner = %owner,
                    "Stop requested for owner without a lab"
                ),
            }
        })?;
        match plan {
            StopPlan::Teardown { instance_id, force } => {
                info!(tid=tid, owner=%owner, instance_id=%instance_id, "Stopping lab");
                self.teardown(owner, &instance_id, force, tid).await
            },
            StopPlan::Done(d) => Ok(d),
        }
    }

    /// # Errors
    /// [LabNotFoundError] if the owner never had a lab
    pub fn get_lab_status(&self, owner: &OwnerKey, tid: &TransactionId) -> Result<LabDescriptor> {
        match self.registry.get(owner) {
            Some(i) => Ok(i.describe(self.public_host())),
            None => bail_typed!(
                LabNotFoundError { owner: owner.clone() },
                tid = tid,
                owner = %owner,
                "Status requested for owner without a lab"
            ),
        }
    }

    async fn stop_gracefully(&self, handle: &RuntimeHandle, tid: &TransactionId) {
        let grace = Duration::from_secs(self.config.reaper.stop_grace_sec);
        match tokio::time::timeout(stop_deadline(grace, self.call_timeout()), self.runtime.stop(handle, grace, tid)).await {
            Ok(Ok(_)) => debug!(tid=tid, handle=%handle, "Container stopped"),
            Ok(Err(e)) => warn!(tid=tid, error=%e, handle=%handle, "Graceful stop failed, forcing removal"),
            Err(_) => warn!(tid=tid, handle=%handle, "Graceful stop timed out, forcing removal"),
        }
    }

    async fn remove_with_retry(&self, handle: &RuntimeHandle, tid: &TransactionId) -> Result<()> {
        let mut attempt = 0;
        loop {
            let err = match self.bounded("remove", self.runtime.remove(handle, tid), tid).await {
                Ok(_) => return Ok(()),
                Err(e) => RuntimeError::classify(&e),
            };
            if err.is_transient() && attempt < self.config.runtime.create_retries {
                tokio::time::sleep(self.retry_delay(attempt)).await;
                attempt += 1;
                continue;
            }
            error!(tid=tid, error=%err, handle=%handle, "Failed to remove lab container");
            anyhow::bail!(err);
        }
    }

    /// Escalate an instance through Stopping, Stopped, and Destroyed, releasing its allocation.
    /// Failed instances skip straight to removal. `force` skips the graceful stop.
    /// Tearing down a Destroyed instance is a no-op.
    /// An instance still being provisioned is only marked Stopping, its provisioning task finishes the teardown.
    /// If removal fails the instance is left where it is, for the reaper to retry.
    #[cfg_attr(feature = "full_spans", tracing::instrument(skip(self, owner), fields(tid=tid)))]
    pub async fn teardown(
        &self,
        owner: &OwnerKey,
        instance_id: &str,
        force: bool,
        tid: &TransactionId,
    ) -> Result<LabDescriptor> {
        let now = self.now();
        let (snapshot, provisioning) = self.registry.update_instance(owner, instance_id, tid, |inst| {
            let provisioning = matches!(inst.status, LabStatus::Requested | LabStatus::Provisioning);
            if inst.status.is_non_terminal() {
                inst.transition(LabStatus::Stopping, now)?;
            }
            Ok((inst.clone(), provisioning))
        })?;
        if provisioning {
            info!(tid=tid, owner=%owner, instance_id=instance_id, "Lab is still provisioning, leaving the teardown to it");
            return Ok(snapshot.describe(self.public_host()));
        }
        match snapshot.status {
            LabStatus::Destroyed => return Ok(snapshot.describe(self.public_host())),
            LabStatus::Stopping => {
                match (&snapshot.runtime_handle, force) {
                    (Some(handle), false) => self.stop_gracefully(handle, tid).await,
                    _ => debug!(tid=tid, instance_id=instance_id, "Skipping graceful stop"),
                };
                let now = self.now();
                self.registry.update_instance(owner, instance_id, tid, |inst| {
                    if inst.status == LabStatus::Stopping {
                        inst.transition(LabStatus::Stopped, now)?;
                    }
                    Ok(())
                })?;
            },
            _ => (),
        };

        self.remove_with_retry(&snapshot.removal_handle(), tid).await?;

        let now = self.now();
        let (alloc, destroyed) = self.registry.update_instance(owner, instance_id, tid, |inst| {
            if inst.status.is_terminal() {
                return Ok((None, inst.clone()));
            }
            inst.transition(LabStatus::Destroyed, now)?;
            Ok((inst.take_allocation(), inst.clone()))
        })?;
        if let Some(a) = alloc {
            self.allocator.release(&a, tid);
        }
        info!(tid=tid, owner=%owner, instance_id=instance_id, "Lab destroyed");
        Ok(destroyed.describe(self.public_host()))
    }

    /// Apply a health probe result to a Running or Idle instance.
    /// Results for instances that have since moved on are dropped.
    /// Returns `true` if the instance was marked Failed, in which case a teardown has been queued.
    pub fn apply_probe_result(
        &self,
        owner: &OwnerKey,
        instance_id: &str,
        result: ProbeResult,
        tid: &TransactionId,
    ) -> Result<bool> {
        let now = self.now();
        let threshold = self.config.health.unhealthy_threshold;
        let outcome = self.registry.update_instance(owner, instance_id, tid, |inst| {
            if !inst.status.has_endpoint() {
                return Ok(None);
            }
            inst.last_health_check_at = Some(now);
            match &result {
                ProbeResult::Healthy => {
                    inst.failure_count = 0;
                    Ok(None)
                },
                ProbeResult::Unhealthy(reason) => {
                    inst.failure_count += 1;
                    debug!(tid=tid, instance_id=%inst.id, failures=inst.failure_count, reason=%reason, "Lab health check failed");
                    if inst.failure_count >= threshold {
                        let reason = format!("{} consecutive failed health checks: {}", inst.failure_count, reason);
                        fail_in_place(inst, &reason, false, now)
                    } else {
                        Ok(None)
                    }
                },
                ProbeResult::Vanished => fail_in_place(inst, "container vanished from the runtime", true, now),
            }
        })?;
        match outcome {
            Some(alloc) => {
                if let Some(a) = alloc {
                    self.allocator.release(&a, tid);
                }
                warn!(tid=tid, owner=%owner, instance_id=instance_id, result=?result, "Lab marked failed by health check");
                self.enqueue_teardown(owner, instance_id, true, tid);
                Ok(true)
            },
            None => Ok(false),
        }
    }

    /// Move a Running instance to Idle if it has seen no activity for `idle_threshold_sec`
    pub fn mark_idle_if_inactive(
        &self,
        owner: &OwnerKey,
        instance_id: &str,
        idle_threshold_sec: u64,
        tid: &TransactionId,
    ) -> Result<bool> {
        let now = self.now();
        self.registry.update_instance(owner, instance_id, tid, |inst| {
            if inst.status == LabStatus::Running && seconds_between(inst.last_active_at, now) >= idle_threshold_sec {
                inst.transition(LabStatus::Idle, now)?;
                debug!(tid=tid, instance_id=%inst.id, "Lab is idle");
                return Ok(true);
            }
            Ok(false)
        })
    }

    pub fn engine_status(&self) -> EngineStatus {
        EngineStatus {
            backend: self.runtime.backend(),
            allocator: self.allocator.stats(),
            instances: self.registry.counts_by_status(),
            profiles: self.templates.profiles(),
        }
    }

    /// Bring persisted instances back after a restart.
    /// Allocations are re-leased; labs that were mid-provisioning are failed and cleaned up;
    /// runtime containers no record owns are removed.
    pub async fn recover(&self, tid: &TransactionId) -> Result<()> {
        let restored = self.registry.restore(tid)?;
        for inst in restored {
            if let Some(alloc) = inst.allocation() {
                if let Err(e) = self.allocator.restore(&alloc, tid) {
                    warn!(tid=tid, error=%e, instance_id=%inst.id, port=alloc.port, "Could not re-lease allocation");
                    let now = self.now();
                    // the allocation was never re-leased, so it must not be released either
                    self.registry.update_instance(&inst.owner, &inst.id, tid, |i| {
                        i.allocated_port = None;
                        if i.status.can_transition_to(LabStatus::Failed) {
                            i.transition(LabStatus::Failed, now)?;
                            i.failure_reason = Some(format!("allocation could not be restored: {}", e));
                        }
                        Ok(())
                    })?;
                    continue;
                }
            }
            if matches!(inst.status, LabStatus::Requested | LabStatus::Provisioning) {
                self.mark_failed(&inst.owner, &inst.id, "engine restarted during provisioning", tid)?;
                self.enqueue_teardown(&inst.owner, &inst.id, true, tid);
            }
        }
        match self.reconcile_orphans(tid).await {
            Ok(n) if n > 0 => info!(tid = tid, removed = n, "Removed orphaned lab containers"),
            Ok(_) => (),
            Err(e) => warn!(tid=tid, error=%e, "Failed to reconcile runtime containers"),
        };
        Ok(())
    }

    /// Remove labelled runtime containers that no live or tearing-down instance owns
    pub async fn reconcile_orphans(&self, tid: &TransactionId) -> Result<usize> {
        let managed = self
            .bounded("list_managed", self.runtime.list_managed(tid), tid)
            .await?;
        let known: HashSet<RuntimeHandle> = self
            .registry
            .list_matching(|i| !i.status.is_terminal())
            .iter()
            .map(|i| i.removal_handle())
            .collect();
        let mut removed = 0;
        for handle in managed.into_iter().filter(|h| !known.contains(h)) {
            info!(tid=tid, handle=%handle, "Removing orphaned lab container");
            self.compensating_remove(&handle, tid).await;
            removed += 1;
        }
        Ok(removed)
    }
}
