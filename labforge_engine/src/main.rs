use anyhow::Result;
use clap::Parser;
use labforge_engine_library::engine_api::config::{Configuration, EngineConfig};
use labforge_engine_library::engine_api::create_engine;
use labforge_engine_library::http::create_http_server;
use labforge_engine_library::services::runtime::RuntimeFactory;
use labforge_library::tokio_utils::build_tokio_runtime;
use labforge_library::transaction::{TransactionId, CLEAN_TID, STARTUP_TID};
use labforge_library::{bail_error, logging::start_tracing, utils::wait_for_exit_signal};
use tracing::{debug, error, info, warn};
use utils::Args;

pub mod utils;

async fn run(server_config: EngineConfig, tid: &TransactionId) -> Result<()> {
    debug!(tid=tid.as_str(), config=?server_config, "loaded configuration");

    let engine = match create_engine(server_config.clone(), tid).await {
        Ok(e) => e,
        Err(e) => bail_error!(tid=tid, error=%e, "Error creating engine on startup"),
    };

    let http_server = match create_http_server(&server_config.address, server_config.port, engine.clone()).await {
        Ok(s) => s,
        Err(e) => bail_error!(tid = tid, error = %e, "Error creating HTTP server on startup"),
    };
    info!(tid=tid, name=%server_config.name, address=%http_server.addr, "Starting HTTP server");
    tokio::spawn(async move {
        if let Err(e) = http_server.run().await {
            error!("HTTP server error: {}", e);
        }
    });

    wait_for_exit_signal(tid).await?;
    Ok(())
}

/// Remove every container carrying the engine's ownership label, whatever state it is in
async fn clean(server_config: EngineConfig, tid: &TransactionId) -> Result<()> {
    debug!(tid=?tid, config=?server_config, "loaded configuration");

    let runtime = RuntimeFactory::new(server_config.runtime.clone()).get_runtime(tid).await?;
    let managed = runtime.list_managed(tid).await?;
    info!(tid = tid, count = managed.len(), "Removing managed containers");
    for handle in managed.iter() {
        if let Err(e) = runtime.remove(handle, tid).await {
            warn!(tid=tid, error=%e, handle=%handle, "Failed to remove container");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let tid: &TransactionId = &STARTUP_TID;
    let cli = Args::parse();

    match cli.command {
        Some(c) => match c {
            utils::Commands::Clean => {
                let tid: &TransactionId = &CLEAN_TID;
                let server_config = Configuration::boxed(cli.config.as_deref(), None)?;
                let _guard = start_tracing(&server_config.logging, tid)?;
                let engine_rt = build_tokio_runtime(
                    &Some(server_config.tokio_event_interval),
                    &Some(server_config.tokio_queue_interval),
                    &None,
                    tid,
                )?;
                engine_rt.block_on(clean(server_config, tid))?;
            },
        },
        None => {
            let server_config = Configuration::boxed(cli.config.as_deref(), None)?;
            let _guard = start_tracing(&server_config.logging, tid)?;
            let engine_rt = build_tokio_runtime(
                &Some(server_config.tokio_event_interval),
                &Some(server_config.tokio_queue_interval),
                &None,
                tid,
            )?;
            engine_rt.block_on(run(server_config, tid))?;
        },
    }
    Ok(())
}
