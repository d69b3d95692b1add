#[macro_use]
pub mod utils;

use crate::utils::{owner, sim_engine, sim_runtime, temp_dir};
use labforge_engine_library::services::instance::{LabInstance, LabNotFoundError, LabStatus};
use labforge_engine_library::services::registry::persistence::{InstanceStore, JsonFileStore};
use labforge_engine_library::services::resources::ResourceLimits;
use labforge_engine_library::services::runtime::simulator::SimulatedContainer;
use labforge_engine_library::services::runtime::RuntimeHandle;
use labforge_library::transaction::TEST_TID;
use std::path::Path;
use time::OffsetDateTime;

fn persisted(dir: &Path) -> Vec<(String, String)> {
    vec![(
        "persistence.directory".to_string(),
        dir.to_string_lossy().to_string(),
    )]
}

fn json_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .is_ok_and(|e| e.path().extension().is_some_and(|x| x == "json"))
        })
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_change_is_persisted() {
    let dir = temp_dir();
    let engine = sim_engine(persisted(&dir)).await;
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(json_files(&dir), 1);

    let store = JsonFileStore::boxed(&dir.to_string_lossy(), &TEST_TID).unwrap();
    let on_disk = store.load_all(&TEST_TID).unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].id, d.instance_id);
    assert_eq!(on_disk[0].status, LabStatus::Running);
    assert_eq!(on_disk[0].allocated_port, Some(d.endpoint.unwrap().port));
    assert_eq!(on_disk[0].owner, owner("s1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_restores_running_lab() {
    let dir = temp_dir();
    let first = sim_engine(persisted(&dir)).await;
    let before = first.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    let port = before.endpoint.as_ref().unwrap().port;

    let engine = sim_engine(persisted(&dir)).await;
    let after = engine.get_lab_status(&owner("s1"), &TEST_TID).unwrap();
    assert_eq!(after, before);
    assert!(engine.allocator.is_leased(port));
    assert_eq!(engine.allocator.stats().cpu_shares_used, 1024);

    let other = engine.request_lab(&owner("s2"), &TEST_TID).await.unwrap();
    assert_ne!(other.endpoint.unwrap().port, port);
    // the same owner gets the restored lab back, not a new one
    let again = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(again.instance_id, before.instance_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restored_lab_without_container_fails_health() {
    let dir = temp_dir();
    let first = sim_engine(persisted(&dir)).await;
    let before = first.request_lab(&owner("s1"), &TEST_TID).await.unwrap();

    // a new simulated runtime knows nothing of the first engine's containers
    let engine = sim_engine(persisted(&dir)).await;
    let report = engine.health.sweep(&TEST_TID).await;
    assert_eq!(report.failed, 1);
    assert!(!engine.allocator.is_leased(before.endpoint.unwrap().port));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroyed_records_are_dropped_on_restart() {
    let dir = temp_dir();
    let first = sim_engine(persisted(&dir)).await;
    first.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    first.stop_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(json_files(&dir), 1);

    let engine = sim_engine(persisted(&dir)).await;
    let err = engine.get_lab_status(&owner("s1"), &TEST_TID).unwrap_err();
    assert!(err.downcast_ref::<LabNotFoundError>().is_some());
    assert_eq!(json_files(&dir), 0);
    assert_eq!(engine.allocator.stats().ports_leased, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_provisioning_fails_on_restart() {
    let dir = temp_dir();
    let store = JsonFileStore::boxed(&dir.to_string_lossy(), &TEST_TID).unwrap();
    #[allow(clippy::disallowed_methods)]
    let now = OffsetDateTime::now_utc();
    let mut inst = LabInstance::new(
        "half-made".to_string(),
        owner("s1"),
        ResourceLimits {
            cpu_shares: 1024,
            memory_bytes: 1073741824,
        },
        now,
    );
    inst.transition(LabStatus::Provisioning, now).unwrap();
    inst.allocated_port = Some(21005);
    store.save(&inst, &TEST_TID).unwrap();

    let engine = sim_engine(persisted(&dir)).await;
    assert!(!engine.allocator.is_leased(21005));
    let d = engine.get_lab_status(&owner("s1"), &TEST_TID).unwrap();
    assert_eq!(d.instance_id, "half-made");
    assert!(matches!(d.status, LabStatus::Failed | LabStatus::Destroyed));
    assert_eq!(d.failure_reason.unwrap(), "engine restarted during provisioning");

    let fresh = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(fresh.status, LabStatus::Running);
    assert_ne!(fresh.instance_id, "half-made");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_allocation_fails_second_lab() {
    let dir = temp_dir();
    let store = JsonFileStore::boxed(&dir.to_string_lossy(), &TEST_TID).unwrap();
    #[allow(clippy::disallowed_methods)]
    let now = OffsetDateTime::now_utc();
    for (id, student) in [("a", "s1"), ("b", "s2")] {
        let mut inst = LabInstance::new(
            id.to_string(),
            owner(student),
            ResourceLimits {
                cpu_shares: 1024,
                memory_bytes: 1073741824,
            },
            now,
        );
        inst.transition(LabStatus::Provisioning, now).unwrap();
        inst.transition(LabStatus::Running, now).unwrap();
        inst.allocated_port = Some(21003);
        store.save(&inst, &TEST_TID).unwrap();
    }

    let engine = sim_engine(persisted(&dir)).await;
    assert!(engine.allocator.is_leased(21003));
    assert_eq!(engine.allocator.stats().ports_leased, 1);
    let statuses: Vec<LabStatus> = ["s1", "s2"]
        .iter()
        .map(|s| engine.get_lab_status(&owner(s), &TEST_TID).unwrap().status)
        .collect();
    assert_eq!(statuses.iter().filter(|s| **s == LabStatus::Running).count(), 1);
    assert_eq!(statuses.iter().filter(|s| **s == LabStatus::Failed).count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn orphaned_containers_are_removed() {
    let engine = sim_engine(vec![]).await;
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    let runtime = sim_runtime(&engine);
    let orphan = RuntimeHandle::for_instance("orphan");
    runtime.inject_container(
        orphan.clone(),
        SimulatedContainer {
            instance_id: "orphan".to_string(),
            image: "docker.io/labforge/python-lab:3.12".to_string(),
            host_port: 21009,
            running: true,
        },
    );

    assert_eq!(engine.lifecycle.reconcile_orphans(&TEST_TID).await.unwrap(), 1);
    assert!(!runtime.exists(&orphan));
    assert!(runtime.exists(&RuntimeHandle::for_instance(&d.instance_id)));
    assert_eq!(engine.lifecycle.reconcile_orphans(&TEST_TID).await.unwrap(), 0);
}
