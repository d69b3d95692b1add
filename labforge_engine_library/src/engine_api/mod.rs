use self::engine_config::EngineConfig;
use self::lab_engine::LabEngine;
use crate::services::health::HealthMonitor;
use crate::services::instance::{LabDescriptor, OwnerKey};
use crate::services::lifecycle::{EngineStatus, LifecycleManager};
use crate::services::reaper::IdleReaper;
use crate::services::registry::persistence::{InstanceStore, JsonFileStore, MemoryStore};
use crate::services::registry::InstanceRegistry;
use crate::services::resources::allocator::ResourceAllocator;
use crate::services::runtime::{RuntimeBackend, RuntimeFactory};
use crate::services::templates::TemplateRegistry;
use anyhow::Result;
use labforge_library::clock::{Clock, LocalTime, SimulatedTime};
use labforge_library::{bail_error, transaction::TransactionId};
use std::sync::Arc;
use tracing::info;

pub mod engine_config;
pub use engine_config as config;
pub mod http_client;
pub mod lab_engine;
pub mod local_api;

/// Build every engine service, restore persisted labs, and start the background loops
pub async fn create_engine(config: EngineConfig, tid: &TransactionId) -> Result<Arc<LabEngine>> {
    let clock: Clock = match config.runtime.backend {
        RuntimeBackend::Simulation => SimulatedTime::boxed(),
        RuntimeBackend::Docker => LocalTime::boxed(),
    };

    let templates = TemplateRegistry::boxed(&config.templates, config.templates_file.clone(), tid)
        .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to load lab templates"))?;
    if config.templates_file.as_ref().is_some_and(|f| !f.is_empty()) {
        templates
            .reload_from_file(tid)
            .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to load templates file"))?;
    }

    let allocator = ResourceAllocator::boxed(config.capacity.clone(), tid)
        .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to make resource allocator"))?;

    let store: Arc<dyn InstanceStore> = match config.persistence.directory.as_str() {
        "" => {
            info!(tid = tid, "Lab instances will not be persisted");
            MemoryStore::boxed()
        },
        dir => JsonFileStore::boxed(dir, tid)
            .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to make instance store"))?,
    };
    let registry = InstanceRegistry::boxed(store);

    let runtime = RuntimeFactory::new(config.runtime.clone())
        .get_runtime(tid)
        .await
        .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to make runtime client"))?;

    let lifecycle = LifecycleManager::boxed(
        config.clone(),
        templates.clone(),
        allocator.clone(),
        registry.clone(),
        runtime.clone(),
        clock.clone(),
        tid,
    )
    .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to make lifecycle manager"))?;
    lifecycle
        .recover(tid)
        .await
        .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to recover persisted labs"))?;

    let health = HealthMonitor::boxed(
        config.clone(),
        registry.clone(),
        templates.clone(),
        lifecycle.clone(),
        tid,
    )
    .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to make health monitor"))?;
    let reaper = IdleReaper::boxed(
        config.clone(),
        registry.clone(),
        templates.clone(),
        lifecycle.clone(),
        clock,
        tid,
    )
    .or_else(|e| bail_error!(tid=tid, error=%e, "Failed to make idle reaper"))?;

    Ok(Arc::new(LabEngine {
        config,
        templates,
        allocator,
        registry,
        runtime,
        lifecycle,
        health,
        reaper,
    }))
}

/// Operations exposed by a lab engine, wherever it lives
#[async_trait::async_trait]
pub trait LabEngineAPI {
    /// Check the engine is up and accessible.
    async fn ping(&mut self, tid: TransactionId) -> Result<String>;
    /// Get a lab for the owner, provisioning one if needed.
    async fn request_lab(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor>;
    /// Record learner activity on the owner's lab.
    async fn report_activity(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor>;
    /// Stop and destroy the owner's lab.
    async fn stop_lab(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor>;
    async fn get_lab_status(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor>;
    /// Capacity usage and lab counts.
    async fn engine_status(&mut self, tid: TransactionId) -> Result<EngineStatus>;
    /// Reload templates from the engine's templates file, returning how many are loaded.
    async fn reload_templates(&mut self, tid: TransactionId) -> Result<usize>;
}
