use crate::engine_api::engine_config::EngineConfig;
use crate::services::health::HealthMonitor;
use crate::services::instance::{LabDescriptor, OwnerKey};
use crate::services::lifecycle::{EngineStatus, LifecycleManager};
use crate::services::reaper::IdleReaper;
use crate::services::registry::InstanceRegistry;
use crate::services::resources::allocator::ResourceAllocator;
use crate::services::runtime::RuntimeClient;
use crate::services::templates::TemplateRegistry;
use anyhow::Result;
use labforge_library::transaction::TransactionId;
use std::sync::Arc;
use tracing::{debug, info};

/// The assembled engine, made by [crate::engine_api::create_engine].
/// Every external operation checks the owner key before reaching the lifecycle manager.
pub struct LabEngine {
    pub config: EngineConfig,
    pub templates: Arc<TemplateRegistry>,
    pub allocator: Arc<ResourceAllocator>,
    pub registry: Arc<InstanceRegistry>,
    pub runtime: Arc<dyn RuntimeClient>,
    pub lifecycle: Arc<LifecycleManager>,
    pub health: Arc<HealthMonitor>,
    pub reaper: Arc<IdleReaper>,
}

impl LabEngine {
    #[cfg_attr(feature = "full_spans", tracing::instrument(skip(self), fields(tid=tid)))]
    pub async fn request_lab(&self, owner: &OwnerKey, tid: &TransactionId) -> Result<LabDescriptor> {
        owner.validate(tid)?;
        info!(tid=tid, owner=%owner, "Lab requested");
        self.lifecycle.request_lab(owner, tid).await
    }

    pub fn report_activity(&self, owner: &OwnerKey, tid: &TransactionId) -> Result<LabDescriptor> {
        owner.validate(tid)?;
        debug!(tid=tid, owner=%owner, "Activity reported");
        self.lifecycle.report_activity(owner, tid)
    }

    #[cfg_attr(feature = "full_spans", tracing::instrument(skip(self), fields(tid=tid)))]
    pub async fn stop_lab(&self, owner: &OwnerKey, tid: &TransactionId) -> Result<LabDescriptor> {
        owner.validate(tid)?;
        info!(tid=tid, owner=%owner, "Lab stop requested");
        self.lifecycle.stop_lab(owner, tid).await
    }

    pub fn get_lab_status(&self, owner: &OwnerKey, tid: &TransactionId) -> Result<LabDescriptor> {
        owner.validate(tid)?;
        self.lifecycle.get_lab_status(owner, tid)
    }

    pub fn engine_status(&self, tid: &TransactionId) -> EngineStatus {
        let status = self.lifecycle.engine_status();
        debug!(tid=tid, status=?status, "Engine status");
        status
    }

    /// Returns the number of templates now loaded
    pub fn reload_templates(&self, tid: &TransactionId) -> Result<usize> {
        self.templates.reload_from_file(tid)
    }
}
