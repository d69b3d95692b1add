use crate::args::OwnerArgs;
use anyhow::Result;
use labforge_engine_library::engine_api::http_client::HttpLabEngineAPI;
use labforge_engine_library::engine_api::LabEngineAPI;
use labforge_engine_library::services::instance::LabDescriptor;
use labforge_library::transaction::gen_tid;
use labforge_library::utils::port::Port;
use tracing::info;

fn print_descriptor(d: &LabDescriptor) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(d)?);
    Ok(())
}

pub async fn ping(host: String, port: Port) -> Result<()> {
    let tid = gen_tid();
    let mut api = HttpLabEngineAPI::new(&host, port, &tid)?;
    let ret = api.ping(tid).await?;
    info!("{}", ret);
    Ok(())
}

pub async fn request(host: String, port: Port, args: OwnerArgs) -> Result<()> {
    let tid = gen_tid();
    let mut api = HttpLabEngineAPI::new(&host, port, &tid)?;
    let ret = api.request_lab(args.into(), tid).await?;
    print_descriptor(&ret)
}

pub async fn activity(host: String, port: Port, args: OwnerArgs) -> Result<()> {
    let tid = gen_tid();
    let mut api = HttpLabEngineAPI::new(&host, port, &tid)?;
    let ret = api.report_activity(args.into(), tid).await?;
    print_descriptor(&ret)
}

pub async fn stop(host: String, port: Port, args: OwnerArgs) -> Result<()> {
    let tid = gen_tid();
    let mut api = HttpLabEngineAPI::new(&host, port, &tid)?;
    let ret = api.stop_lab(args.into(), tid).await?;
    print_descriptor(&ret)
}

pub async fn status(host: String, port: Port, args: OwnerArgs) -> Result<()> {
    let tid = gen_tid();
    let mut api = HttpLabEngineAPI::new(&host, port, &tid)?;
    let ret = api.get_lab_status(args.into(), tid).await?;
    print_descriptor(&ret)
}

pub async fn engine_status(host: String, port: Port) -> Result<()> {
    let tid = gen_tid();
    let mut api = HttpLabEngineAPI::new(&host, port, &tid)?;
    let ret = api.engine_status(tid).await?;
    info!("{}", serde_json::to_string_pretty(&ret)?);
    Ok(())
}

pub async fn reload_templates(host: String, port: Port) -> Result<()> {
    let tid = gen_tid();
    let mut api = HttpLabEngineAPI::new(&host, port, &tid)?;
    let loaded = api.reload_templates(tid).await?;
    info!("Engine now has {} templates", loaded);
    Ok(())
}
