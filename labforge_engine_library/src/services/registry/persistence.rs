use crate::services::instance::LabInstance;
use anyhow::Result;
use dashmap::DashMap;
use labforge_library::{
    bail_error,
    transaction::TransactionId,
    utils::file::{ensure_dir, read_json, try_remove_pth, write_json_atomic},
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Durable storage for [LabInstance] records.
/// Calls happen while the owner's registry lock is held, so implementations must not block for long.
pub trait InstanceStore: Send + Sync {
    fn save(&self, instance: &LabInstance, tid: &TransactionId) -> Result<()>;
    fn delete(&self, instance_id: &str, tid: &TransactionId) -> Result<()>;
    fn load_all(&self, tid: &TransactionId) -> Result<Vec<LabInstance>>;
}

/// One JSON document per instance, named `<instance id>.json`.
pub struct JsonFileStore {
    directory: PathBuf,
}

impl JsonFileStore {
    pub fn boxed(directory: &str, tid: &TransactionId) -> Result<Arc<Self>> {
        let directory = PathBuf::from(directory);
        if let Err(e) = ensure_dir(&directory) {
            bail_error!(tid=tid, error=%e, "Failed to create instance state directory");
        }
        info!(tid=tid, directory=%directory.display(), "Persisting lab instances as JSON");
        Ok(Arc::new(JsonFileStore { directory }))
    }

    fn path(&self, instance_id: &str) -> PathBuf {
        self.directory.join(format!("{}.json", instance_id))
    }
}

impl InstanceStore for JsonFileStore {
    fn save(&self, instance: &LabInstance, tid: &TransactionId) -> Result<()> {
        match write_json_atomic(self.path(&instance.id), instance) {
            Ok(_) => Ok(()),
            Err(e) => bail_error!(tid=tid, error=%e, instance_id=%instance.id, "Failed to persist lab instance"),
        }
    }

    fn delete(&self, instance_id: &str, tid: &TransactionId) -> Result<()> {
        try_remove_pth(self.path(instance_id), tid);
        Ok(())
    }

    fn load_all(&self, tid: &TransactionId) -> Result<Vec<LabInstance>> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(e) => e,
            Err(e) => bail_error!(tid=tid, error=%e, "Failed to list instance state directory"),
        };
        let mut ret = vec![];
        for entry in entries {
            let pth = entry?.path();
            if pth.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<LabInstance, _>(&pth) {
                Ok(instance) => ret.push(instance),
                Err(e) => warn!(tid=tid, error=%e, path=%pth.display(), "Skipping unreadable instance record"),
            }
        }
        debug!(tid = tid, count = ret.len(), "Loaded persisted lab instances");
        Ok(ret)
    }
}

/// Keeps records in memory only; state does not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, LabInstance>,
}

impl MemoryStore {
    pub fn boxed() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, instance_id: &str) -> Option<LabInstance> {
        self.records.get(instance_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl InstanceStore for MemoryStore {
    fn save(&self, instance: &LabInstance, _tid: &TransactionId) -> Result<()> {
        self.records.insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    fn delete(&self, instance_id: &str, _tid: &TransactionId) -> Result<()> {
        self.records.remove(instance_id);
        Ok(())
    }

    fn load_all(&self, _tid: &TransactionId) -> Result<Vec<LabInstance>> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }
}
