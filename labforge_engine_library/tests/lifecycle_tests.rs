#[macro_use]
pub mod utils;

use crate::utils::{owner, sim_engine, sim_runtime};
use labforge_engine_library::services::instance::{InvalidOwnerError, LabNotFoundError, LabStatus, OwnerKey};
use labforge_engine_library::services::resources::{CapacityExceededError, ExhaustedResource};
use labforge_engine_library::services::runtime::{RuntimeClient, RuntimeError, RuntimeHandle};
use labforge_engine_library::services::templates::UnknownProfileError;
use labforge_library::transaction::{gen_tid, TEST_TID};
use more_asserts::{assert_ge, assert_le};
use rstest::rstest;
use std::collections::HashSet;
use std::time::Duration;

fn ovr(k: &str, v: &str) -> (String, String) {
    (k.to_string(), v.to_string())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_provisions_running_lab() {
    let engine = sim_engine(vec![]).await;
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Running);
    let endpoint = d.endpoint.expect("running lab should have an endpoint");
    assert_eq!(endpoint.host, "labs.test");
    assert_ge!(endpoint.port, 21000);
    assert_le!(endpoint.port, 21009);
    assert!(engine.allocator.is_leased(endpoint.port));
    let runtime = sim_runtime(&engine);
    let container = runtime
        .container(&RuntimeHandle::for_instance(&d.instance_id))
        .expect("container should exist");
    assert!(container.running);
    assert_eq!(container.host_port, endpoint.port);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeat_request_returns_same_lab() {
    let engine = sim_engine(vec![]).await;
    let first = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    let second = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(sim_runtime(&engine).create_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_instance() {
    let engine = sim_engine(vec![]).await;
    let mut handles = vec![];
    for _ in 0..4 {
        let e = engine.clone();
        handles.push(tokio::spawn(async move { e.request_lab(&owner("s1"), &gen_tid()).await }));
    }
    let mut ids = HashSet::new();
    for h in handles {
        ids.insert(h.await.unwrap().unwrap().instance_id);
    }
    assert_eq!(ids.len(), 1);
    assert_eq!(engine.registry.list_all().len(), 1);
    assert_eq!(sim_runtime(&engine).create_calls(), 1);
    assert_eq!(engine.allocator.stats().ports_leased, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_owners_get_distinct_ports() {
    let engine = sim_engine(vec![]).await;
    let mut handles = vec![];
    for i in 0..8 {
        let e = engine.clone();
        handles.push(tokio::spawn(async move {
            e.request_lab(&owner(&format!("s{}", i)), &gen_tid()).await
        }));
    }
    let mut ports = HashSet::new();
    for h in handles {
        let d = h.await.unwrap().unwrap();
        assert_eq!(d.status, LabStatus::Running);
        ports.insert(d.endpoint.unwrap().port);
    }
    assert_eq!(ports.len(), 8);
    let stats = engine.allocator.stats();
    assert_eq!(stats.cpu_shares_used, 8 * 1024);
    assert_le!(stats.cpu_shares_used, stats.cpu_shares_total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_profile_creates_nothing() {
    let engine = sim_engine(vec![]).await;
    let key = OwnerKey::new("s1", "c1", "cobol");
    let err = engine.request_lab(&key, &TEST_TID).await.unwrap_err();
    assert!(err.downcast_ref::<UnknownProfileError>().is_some());
    assert!(engine.registry.get(&key).is_none());
    assert_eq!(engine.allocator.stats().ports_leased, 0);
    assert_eq!(sim_runtime(&engine).create_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_ports_is_capacity_error() {
    let engine = sim_engine(vec![ovr("capacity.port_range_end", "21000")]).await;
    engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    let err = engine.request_lab(&owner("s2"), &TEST_TID).await.unwrap_err();
    let cap = err
        .downcast_ref::<CapacityExceededError>()
        .expect("should be a capacity error");
    assert_eq!(cap.resource, ExhaustedResource::Ports);
    assert!(engine.registry.get(&owner("s2")).is_none());
    assert_eq!(engine.registry.list_all().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_memory_is_capacity_error() {
    let engine = sim_engine(vec![ovr("capacity.memory_bytes", "1073741824")]).await;
    engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    let err = engine.request_lab(&owner("s2"), &TEST_TID).await.unwrap_err();
    let cap = err
        .downcast_ref::<CapacityExceededError>()
        .expect("should be a capacity error");
    assert_eq!(cap.resource, ExhaustedResource::Memory);
    assert_eq!(engine.allocator.stats().ports_leased, 1);
}

#[rstest]
#[case(OwnerKey::new("", "c1", "python"), "student_id")]
#[case(OwnerKey::new("s1", " ", "python"), "course_id")]
#[case(OwnerKey::new("s1", "c1", ""), "profile_id")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_owner_fields_rejected(#[case] key: OwnerKey, #[case] field: &str) {
    let engine = sim_engine(vec![]).await;
    let err = engine.request_lab(&key, &TEST_TID).await.unwrap_err();
    let e = err.downcast_ref::<InvalidOwnerError>().expect("should be an owner error");
    assert_eq!(e.field, field);
    assert!(engine.registry.list_all().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_create_failures_are_retried() {
    let engine = sim_engine(vec![]).await;
    let runtime = sim_runtime(&engine);
    runtime.fail_next_creates(vec![
        RuntimeError::Transient("daemon busy".to_string()),
        RuntimeError::Transient("connection reset".to_string()),
    ]);
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Running);
    assert_eq!(runtime.create_calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retries_run_out() {
    let engine = sim_engine(vec![ovr("runtime.create_retries", "1")]).await;
    let runtime = sim_runtime(&engine);
    runtime.fail_next_creates(vec![
        RuntimeError::Transient("one".to_string()),
        RuntimeError::Transient("two".to_string()),
        RuntimeError::Transient("three".to_string()),
    ]);
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Failed);
    assert_eq!(runtime.create_calls(), 2);
    assert_eq!(engine.allocator.stats().ports_leased, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fatal_create_fails_without_retry() {
    let engine = sim_engine(vec![]).await;
    let runtime = sim_runtime(&engine);
    runtime.fail_next_creates(vec![RuntimeError::Fatal("no such image".to_string())]);
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Failed);
    assert!(d.endpoint.is_none());
    assert!(d.failure_reason.unwrap().contains("no such image"));
    assert_eq!(runtime.create_calls(), 1);
    assert_eq!(engine.allocator.stats().ports_leased, 0);
    assert!(runtime.list_managed(&TEST_TID).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_startup_probe_removes_container() {
    let engine = sim_engine(vec![]).await;
    let runtime = sim_runtime(&engine);
    runtime.fail_next_probes(2);
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Failed);
    assert!(d.failure_reason.unwrap().contains("startup health check failed"));
    assert!(!runtime.exists(&RuntimeHandle::for_instance(&d.instance_id)));
    assert_eq!(engine.allocator.stats().ports_leased, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_probe_recovers_within_attempts() {
    let engine = sim_engine(vec![]).await;
    sim_runtime(&engine).fail_next_probes(1);
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_lab_does_not_block_new_request() {
    let engine = sim_engine(vec![]).await;
    sim_runtime(&engine).fail_next_creates(vec![RuntimeError::Fatal("bad".to_string())]);
    let failed = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(failed.status, LabStatus::Failed);
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Running);
    assert_ne!(d.instance_id, failed.instance_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_twice_is_idempotent() {
    let engine = sim_engine(vec![]).await;
    let started = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    let port = started.endpoint.unwrap().port;
    let first = engine.stop_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(first.status, LabStatus::Destroyed);
    assert_eq!(first.instance_id, started.instance_id);
    assert!(first.endpoint.is_none());
    let second = engine.stop_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(second, first);

    let runtime = sim_runtime(&engine);
    assert_eq!(runtime.stop_calls(), 1);
    assert!(!runtime.exists(&RuntimeHandle::for_instance(&started.instance_id)));
    assert!(!engine.allocator.is_leased(port));
    assert_eq!(
        engine.get_lab_status(&owner("s1"), &TEST_TID).unwrap().status,
        LabStatus::Destroyed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_graceful_stop_still_destroys() {
    let engine = sim_engine(vec![]).await;
    engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    sim_runtime(&engine).fail_stops(true);
    let d = engine.stop_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Destroyed);
    assert_eq!(engine.allocator.stats().ports_leased, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_failed_lab_destroys_it() {
    let engine = sim_engine(vec![]).await;
    sim_runtime(&engine).fail_next_creates(vec![RuntimeError::Fatal("bad".to_string())]);
    engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    let d = engine.stop_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Destroyed);
    assert_eq!(sim_runtime(&engine).stop_calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_after_destroy_makes_new_lab() {
    let engine = sim_engine(vec![]).await;
    let first = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    engine.stop_lab(&owner("s1"), &TEST_TID).await.unwrap();
    let second = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_ne!(first.instance_id, second.instance_id);
    assert_eq!(second.status, LabStatus::Running);
    assert_eq!(
        engine.get_lab_status(&owner("s1"), &TEST_TID).unwrap().instance_id,
        second.instance_id
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_lab_is_not_found() {
    let engine = sim_engine(vec![]).await;
    let err = engine.report_activity(&owner("nobody"), &TEST_TID).unwrap_err();
    assert!(err.downcast_ref::<LabNotFoundError>().is_some());
    let err = engine.stop_lab(&owner("nobody"), &TEST_TID).await.unwrap_err();
    assert!(err.downcast_ref::<LabNotFoundError>().is_some());
    assert_error!(
        engine.get_lab_status(&owner("nobody"), &TEST_TID),
        "No lab found for 'nobody/c1/python'",
        "status of a missing lab should fail"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn profiles_are_separate_labs() {
    let engine = sim_engine(vec![]).await;
    let py = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    let java = engine
        .request_lab(&OwnerKey::new("s1", "c1", "java"), &TEST_TID)
        .await
        .unwrap();
    assert_ne!(py.instance_id, java.instance_id);
    assert_eq!(engine.allocator.stats().cpu_shares_used, 1024 + 2048);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_status_counts_labs() {
    let engine = sim_engine(vec![]).await;
    engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    engine.request_lab(&owner("s2"), &TEST_TID).await.unwrap();
    engine.stop_lab(&owner("s2"), &TEST_TID).await.unwrap();
    let status = engine.engine_status(&TEST_TID);
    assert_eq!(status.instances.get("Running"), Some(&1));
    assert_eq!(status.instances.get("Destroyed"), Some(&1));
    assert_eq!(status.instances.get("Failed"), Some(&0));
    assert_eq!(status.allocator.ports_leased, 1);
    assert_eq!(status.profiles, vec!["java".to_string(), "python".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_create_fails_and_cleans_up() {
    let engine = sim_engine(vec![ovr("runtime.call_timeout_ms", "50")]).await;
    let runtime = sim_runtime(&engine);
    runtime.set_create_delay(Duration::from_millis(300));
    let d = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Failed);
    assert!(d.endpoint.is_none());
    let reason = d.failure_reason.unwrap();
    assert!(reason.contains("create_and_start timed out after 50ms"), "got '{}'", reason);
    // one attempt plus three retries, each followed by a remove
    assert_eq!(runtime.create_calls(), 4);
    assert_eq!(runtime.remove_calls(), 4);
    assert!(!runtime.exists(&RuntimeHandle::for_instance(&d.instance_id)));
    assert_eq!(engine.allocator.stats().ports_leased, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_provisioning_finishes_teardown() {
    let engine = sim_engine(vec![]).await;
    let runtime = sim_runtime(&engine);
    runtime.set_create_delay(Duration::from_millis(200));
    let e = engine.clone();
    let request = tokio::spawn(async move { e.request_lab(&owner("s1"), &gen_tid()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stopping = engine.stop_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(stopping.status, LabStatus::Stopping);
    assert!(stopping.endpoint.is_none());

    let d = request.await.unwrap().unwrap();
    assert_eq!(d.instance_id, stopping.instance_id);
    assert_eq!(d.status, LabStatus::Destroyed);
    assert_eq!(runtime.create_calls(), 1);
    assert!(!runtime.exists(&RuntimeHandle::for_instance(&d.instance_id)));
    assert_eq!(runtime.running_count(), 0);
    assert_eq!(engine.allocator.stats().ports_leased, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_startup_check_removes_before_releasing() {
    let engine = sim_engine(vec![ovr("capacity.port_range_end", "21000")]).await;
    let runtime = sim_runtime(&engine);
    runtime.fail_next_probes(2);
    let failed = engine.request_lab(&owner("s1"), &TEST_TID).await.unwrap();
    assert_eq!(failed.status, LabStatus::Failed);
    assert!(!runtime.exists(&RuntimeHandle::for_instance(&failed.instance_id)));

    // the only port goes straight to the next lab, with the old container gone
    let d = engine.request_lab(&owner("s2"), &TEST_TID).await.unwrap();
    assert_eq!(d.status, LabStatus::Running);
    assert_eq!(d.endpoint.unwrap().port, 21000);
    assert_eq!(runtime.running_count(), 1);
}
