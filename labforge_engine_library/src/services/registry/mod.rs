use crate::services::instance::{LabInstance, LabNotFoundError, LabStatus, OwnerKey};
use anyhow::Result;
use dashmap::DashMap;
use labforge_library::{bail_error, bail_typed, transaction::TransactionId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub mod persistence;
use persistence::InstanceStore;

#[derive(Debug, Clone, Default)]
/// Every instance record kept for one owner.
/// Holds the current instance plus older ones still being torn down, and the most recent Destroyed record.
pub struct OwnerSlot {
    instances: Vec<LabInstance>,
}

impl OwnerSlot {
    /// The single non-terminal instance, if any
    pub fn current(&self) -> Option<&LabInstance> {
        self.instances.iter().find(|i| i.status.is_non_terminal())
    }

    pub fn current_mut(&mut self) -> Option<&mut LabInstance> {
        self.instances.iter_mut().find(|i| i.status.is_non_terminal())
    }

    pub fn by_id(&self, instance_id: &str) -> Option<&LabInstance> {
        self.instances.iter().find(|i| i.id == instance_id)
    }

    pub fn by_id_mut(&mut self, instance_id: &str) -> Option<&mut LabInstance> {
        self.instances.iter_mut().find(|i| i.id == instance_id)
    }

    /// The most recently created instance
    pub fn latest(&self) -> Option<&LabInstance> {
        self.instances.iter().rev().max_by_key(|i| i.created_at)
    }

    /// What a status lookup for this owner should see
    pub fn visible(&self) -> Option<&LabInstance> {
        self.current().or_else(|| self.latest())
    }

    /// Insert, or replace the record with the same id
    pub fn insert(&mut self, instance: LabInstance) {
        match self.by_id_mut(&instance.id) {
            Some(existing) => *existing = instance,
            None => self.instances.push(instance),
        }
    }

    pub fn instances(&self) -> &[LabInstance] {
        &self.instances
    }

    fn non_terminal_count(&self) -> usize {
        self.instances.iter().filter(|i| i.status.is_non_terminal()).count()
    }

    /// Drop all but the most recent Destroyed record, returning the ids dropped
    fn prune(&mut self) -> Vec<String> {
        let keep = self
            .instances
            .iter()
            .filter(|i| i.status.is_terminal())
            .max_by_key(|i| (i.status_changed_at, i.created_at))
            .map(|i| i.id.clone());
        let mut pruned = vec![];
        self.instances.retain(|i| {
            if i.status.is_terminal() && Some(&i.id) != keep.as_ref() {
                pruned.push(i.id.clone());
                false
            } else {
                true
            }
        });
        pruned
    }
}

/// All lab instances, keyed by owner.
/// Each owner has its own lock; every change to an owner's instances goes through [InstanceRegistry::update],
/// which persists the changed records before the change becomes visible.
pub struct InstanceRegistry {
    slots: DashMap<OwnerKey, Arc<Mutex<OwnerSlot>>>,
    store: Arc<dyn InstanceStore>,
}

impl InstanceRegistry {
    pub fn boxed(store: Arc<dyn InstanceStore>) -> Arc<Self> {
        Arc::new(InstanceRegistry {
            slots: DashMap::new(),
            store,
        })
    }

    fn slot(&self, owner: &OwnerKey) -> Arc<Mutex<OwnerSlot>> {
        self.slots.entry(owner.clone()).or_default().clone()
    }

    fn existing_slot(&self, owner: &OwnerKey) -> Option<Arc<Mutex<OwnerSlot>>> {
        self.slots.get(owner).map(|s| s.value().clone())
    }

    fn all_slots(&self) -> Vec<Arc<Mutex<OwnerSlot>>> {
        self.slots.iter().map(|s| s.value().clone()).collect()
    }

    /// Apply `f` to the owner's slot under its lock.
    /// Changed records are persisted, then the new slot is committed.
    /// If `f` or persistence fails, the slot is left exactly as it was.
    pub fn update<R, F>(&self, owner: &OwnerKey, tid: &TransactionId, f: F) -> Result<R>
    where
        F: FnOnce(&mut OwnerSlot) -> Result<R>,
    {
        let slot = self.slot(owner);
        let mut guard = slot.lock();
        let mut working = guard.clone();
        let ret = f(&mut working)?;
        if working.non_terminal_count() > 1 {
            bail_error!(tid=tid, owner=%owner, "Refusing update that leaves more than one live lab for owner");
        }
        let pruned = working.prune();
        for instance in working.instances() {
            if guard.by_id(&instance.id) != Some(instance) {
                self.store.save(instance, tid)?;
            }
        }
        let kept: HashSet<&str> = working.instances().iter().map(|i| i.id.as_str()).collect();
        for old in guard.instances() {
            if !kept.contains(old.id.as_str()) {
                if let Err(e) = self.store.delete(&old.id, tid) {
                    warn!(tid=tid, error=%e, instance_id=%old.id, "Failed to delete pruned instance record");
                }
            }
        }
        if !pruned.is_empty() {
            debug!(tid=tid, owner=%owner, pruned=?pruned, "Pruned destroyed instance records");
        }
        *guard = working;
        Ok(ret)
    }

    /// Apply `f` to one specific instance of the owner.
    ///
    /// # Errors
    /// [LabNotFoundError] if the owner has no instance with that id
    pub fn update_instance<R, F>(&self, owner: &OwnerKey, instance_id: &str, tid: &TransactionId, f: F) -> Result<R>
    where
        F: FnOnce(&mut LabInstance) -> Result<R>,
    {
        self.update(owner, tid, |slot| match slot.by_id_mut(instance_id) {
            Some(instance) => f(instance),
            None => bail_typed!(
                LabNotFoundError { owner: owner.clone() },
                tid = tid,
                owner = %owner,
                instance_id = instance_id,
                "Instance disappeared from registry"
            ),
        })
    }

    /// The owner's live instance, else its most recent one
    pub fn get(&self, owner: &OwnerKey) -> Option<LabInstance> {
        let slot = self.existing_slot(owner)?;
        let guard = slot.lock();
        guard.visible().cloned()
    }

    pub fn get_by_id(&self, owner: &OwnerKey, instance_id: &str) -> Option<LabInstance> {
        let slot = self.existing_slot(owner)?;
        let guard = slot.lock();
        guard.by_id(instance_id).cloned()
    }

    /// Insert or replace by instance id, persisting it
    pub fn upsert(&self, instance: LabInstance, tid: &TransactionId) -> Result<()> {
        let owner = instance.owner.clone();
        self.update(&owner, tid, |slot| {
            slot.insert(instance);
            Ok(())
        })
    }

    pub fn list_by_status(&self, status: LabStatus) -> Vec<LabInstance> {
        self.list_matching(|i| i.status == status)
    }

    pub fn list_matching<P: Fn(&LabInstance) -> bool>(&self, pred: P) -> Vec<LabInstance> {
        let mut ret = vec![];
        for slot in self.all_slots() {
            let guard = slot.lock();
            ret.extend(guard.instances().iter().filter(|i| pred(i)).cloned());
        }
        ret
    }

    pub fn list_all(&self) -> Vec<LabInstance> {
        self.list_matching(|_| true)
    }

    pub fn counts_by_status(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = LabStatus::ALL.iter().map(|s| (s.to_string(), 0)).collect();
        for i in self.list_all() {
            *counts.entry(i.status.to_string()).or_default() += 1;
        }
        counts
    }

    /// Load persisted instances into memory, without re-persisting them.
    /// Destroyed records are dropped from storage.
    pub fn restore(&self, tid: &TransactionId) -> Result<Vec<LabInstance>> {
        let mut loaded = vec![];
        for instance in self.store.load_all(tid)? {
            if instance.status.is_terminal() {
                self.store.delete(&instance.id, tid)?;
                continue;
            }
            let slot = self.slot(&instance.owner);
            let mut guard = slot.lock();
            if instance.status.is_non_terminal() && guard.current().is_some() {
                warn!(tid=tid, owner=%instance.owner, instance_id=%instance.id, "Second live instance found for owner, keeping the first");
                continue;
            }
            guard.insert(instance.clone());
            loaded.push(instance);
        }
        info!(tid = tid, count = loaded.len(), "Restored lab instances");
        Ok(loaded)
    }
}
