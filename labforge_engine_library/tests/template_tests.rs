#[macro_use]
pub mod utils;

use crate::utils::{sim_engine, temp_dir};
use labforge_engine_library::services::instance::{LabStatus, OwnerKey};
use labforge_library::transaction::TEST_TID;
use labforge_library::utils::file::write_json_atomic;
use serde_json::json;
use std::path::{Path, PathBuf};

fn lab_template(image: &str) -> serde_json::Value {
    json!({
        "image": image,
        "limits": { "cpu_shares": 512, "memory_bytes": 536870912 },
        "health_check_command": ["true"],
        "container_port": 8080
    })
}

fn templates_file(dir: &Path, templates: serde_json::Value) -> PathBuf {
    let pth = dir.join("templates.json");
    write_json_atomic(&pth, &templates).unwrap();
    pth
}

fn with_file(pth: &Path) -> Vec<(String, String)> {
    vec![("templates_file".to_string(), pth.to_string_lossy().to_string())]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn templates_file_loaded_at_startup() {
    let dir = temp_dir();
    let pth = templates_file(&dir, json!({ "go": lab_template("docker.io/labforge/go-lab:1.22") }));
    let engine = sim_engine(with_file(&pth)).await;
    assert_eq!(
        engine.templates.profiles(),
        vec!["go".to_string(), "java".to_string(), "python".to_string()]
    );

    let d = engine
        .request_lab(&OwnerKey::new("s1", "c1", "go"), &TEST_TID)
        .await
        .unwrap();
    assert_eq!(d.status, LabStatus::Running);
    assert_eq!(engine.allocator.stats().cpu_shares_used, 512);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_picks_up_file_changes() {
    let dir = temp_dir();
    let pth = templates_file(&dir, json!({}));
    let engine = sim_engine(with_file(&pth)).await;
    assert_eq!(engine.templates.profiles().len(), 2);

    templates_file(
        &dir,
        json!({
            "go": lab_template("docker.io/labforge/go-lab:1.22"),
            "rust": lab_template("docker.io/labforge/rust-lab:1.80"),
        }),
    );
    assert_eq!(engine.reload_templates(&TEST_TID).unwrap(), 4);
    assert!(engine.templates.resolve("rust", &TEST_TID).is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_reload_keeps_current_templates() {
    let dir = temp_dir();
    let pth = templates_file(&dir, json!({ "go": lab_template("docker.io/labforge/go-lab:1.22") }));
    let engine = sim_engine(with_file(&pth)).await;
    let before = engine.templates.profiles();

    templates_file(
        &dir,
        json!({
            "rust": lab_template("docker.io/labforge/rust-lab:1.80"),
            "broken": lab_template(""),
        }),
    );
    assert!(engine.reload_templates(&TEST_TID).is_err());
    assert_eq!(engine.templates.profiles(), before);

    std::fs::write(&pth, "{ not json").unwrap();
    assert!(engine.reload_templates(&TEST_TID).is_err());
    assert_eq!(engine.templates.profiles(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_without_file_fails() {
    let engine = sim_engine(vec![]).await;
    assert_error!(
        engine.reload_templates(&TEST_TID),
        "No templates file configured to reload from",
        "Reload succeeded with no templates file"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_lab_keeps_its_template_after_reload() {
    let dir = temp_dir();
    let pth = templates_file(&dir, json!({ "go": lab_template("docker.io/labforge/go-lab:1.22") }));
    let engine = sim_engine(with_file(&pth)).await;
    let owner = OwnerKey::new("s1", "c1", "go");
    let d = engine.request_lab(&owner, &TEST_TID).await.unwrap();

    templates_file(&dir, json!({}));
    assert_eq!(engine.reload_templates(&TEST_TID).unwrap(), 2);
    assert!(engine.templates.resolve("go", &TEST_TID).is_err());
    let after = engine.get_lab_status(&owner, &TEST_TID).unwrap();
    assert_eq!(after.instance_id, d.instance_id);
    assert_eq!(after.status, LabStatus::Running);
}
