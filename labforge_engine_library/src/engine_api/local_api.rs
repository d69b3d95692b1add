use super::lab_engine::LabEngine;
use super::LabEngineAPI;
use crate::services::instance::{LabDescriptor, OwnerKey};
use crate::services::lifecycle::EngineStatus;
use anyhow::Result;
use labforge_library::transaction::TransactionId;
use std::sync::Arc;

/// An in-process version of [LabEngineAPI]
///   must match [super::http_client::HttpLabEngineAPI] in handling, etc.
pub struct LocalLabEngineAPI {
    engine: Arc<LabEngine>,
}
impl LocalLabEngineAPI {
    pub fn new(engine: Arc<LabEngine>) -> Self {
        LocalLabEngineAPI { engine }
    }
}

#[async_trait::async_trait]
impl LabEngineAPI for LocalLabEngineAPI {
    async fn ping(&mut self, _tid: TransactionId) -> Result<String> {
        Ok("pong".to_string())
    }

    async fn request_lab(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor> {
        self.engine.request_lab(&owner, &tid).await
    }

    async fn report_activity(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor> {
        self.engine.report_activity(&owner, &tid)
    }

    async fn stop_lab(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor> {
        self.engine.stop_lab(&owner, &tid).await
    }

    async fn get_lab_status(&mut self, owner: OwnerKey, tid: TransactionId) -> Result<LabDescriptor> {
        self.engine.get_lab_status(&owner, &tid)
    }

    async fn engine_status(&mut self, tid: TransactionId) -> Result<EngineStatus> {
        Ok(self.engine.engine_status(&tid))
    }

    async fn reload_templates(&mut self, tid: TransactionId) -> Result<usize> {
        self.engine.reload_templates(&tid)
    }
}
