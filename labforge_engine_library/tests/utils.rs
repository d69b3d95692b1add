#![allow(dead_code)]
use labforge_engine_library::engine_api::config::{EngineConfig, ENGINE_ENV_PREFIX};
use labforge_engine_library::engine_api::create_engine;
use labforge_engine_library::engine_api::lab_engine::LabEngine;
use labforge_engine_library::services::instance::{LabDescriptor, LabStatus, OwnerKey};
use labforge_engine_library::services::runtime::simulator::SimulatedRuntime;
use labforge_engine_library::services::runtime::RuntimeClient;
use labforge_library::logging::{start_tracing, LoggingConfig};
use labforge_library::transaction::{gen_tid, TEST_TID};
use labforge_library::types::cast;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[macro_export]
macro_rules! assert_error {
    ($err:expr, $exp:expr, $noerr:expr) => {
        match $err {
            Ok(_) => panic!("{}", $noerr),
            Err(e) => {
                assert_eq!(e.to_string(), $exp);
            },
        };
    };
}

pub fn test_config(overrides: Vec<(String, String)>) -> EngineConfig {
    let overrides = Some(overrides);
    let config_pth: Option<&str> = None;
    let cfg: labforge_engine_library::engine_api::config::Configuration = labforge_library::load_config_default!(
        "labforge_engine_library/tests/resources/engine.json",
        config_pth,
        overrides,
        ENGINE_ENV_PREFIX
    )
    .unwrap_or_else(|e| panic!("Failed to load config file for test: {}", e));
    Arc::new(cfg)
}

/// Creates an engine on the simulation backend, with background loops disabled.
/// Passing [log] = Some("<level>") will enable logging to stdout, useful for test debugging.
pub async fn sim_engine_logged(
    overrides: Vec<(String, String)>,
    log: Option<&str>,
) -> (Option<impl Drop>, Arc<LabEngine>) {
    let cfg = test_config(overrides);
    let log = log.map(|level| {
        let fake_logging = LoggingConfig {
            level: level.to_string(),
            spanning: cfg.logging.spanning.clone(),
            stdout: Some(true),
            ..std::default::Default::default()
        };
        start_tracing(&fake_logging, &TEST_TID).unwrap_or_else(|e| panic!("Failed to start tracing for test: {}", e))
    });
    let engine = create_engine(cfg, &TEST_TID)
        .await
        .unwrap_or_else(|e| panic!("Error creating engine: {}", e));
    (log, engine)
}

pub async fn sim_engine(overrides: Vec<(String, String)>) -> Arc<LabEngine> {
    let (_log, engine) = sim_engine_logged(overrides, None).await;
    engine
}

pub fn sim_runtime(engine: &LabEngine) -> &SimulatedRuntime {
    cast::<SimulatedRuntime, dyn RuntimeClient>(engine.runtime.as_ref()).expect("engine is not on the simulation backend")
}

pub fn owner(student: &str) -> OwnerKey {
    OwnerKey::new(student, "c1", "python")
}

/// A fresh directory under the system temp dir
pub fn temp_dir() -> PathBuf {
    let pth = std::env::temp_dir().join("labforge_tests").join(gen_tid());
    std::fs::create_dir_all(&pth).unwrap();
    pth
}

/// Poll until the owner's lab reaches `status`, for changes made by the background teardown worker
pub async fn wait_for_status(engine: &LabEngine, owner: &OwnerKey, status: LabStatus) -> LabDescriptor {
    for _ in 0..200 {
        let d = engine
            .get_lab_status(owner, &TEST_TID)
            .unwrap_or_else(|e| panic!("Status lookup failed: {}", e));
        if d.status == status {
            return d;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Lab for '{}' never reached {}", owner, status);
}
