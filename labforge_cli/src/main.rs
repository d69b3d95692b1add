pub mod args;
pub mod commands;

use anyhow::Result;
use args::Args;
use clap::Parser;
use labforge_library::bail_error;
use labforge_library::logging::{start_tracing, LoggingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let _drops = start_tracing(
        &LoggingConfig {
            level: "INFO".to_string(),
            stdout: Some(true),
            spanning: "NONE".to_string(),
            ..Default::default()
        },
        &"LABFORGE_CLI".to_string(),
    )?;
    let cli = match Args::try_parse() {
        Ok(arg) => arg,
        Err(e) => bail_error!("Failed to parse args with error '{}'", e),
    };
    if let Err(e) = match cli.command {
        args::Commands::Request(args) => commands::request(cli.host, cli.port, args).await,
        args::Commands::Activity(args) => commands::activity(cli.host, cli.port, args).await,
        args::Commands::Stop(args) => commands::stop(cli.host, cli.port, args).await,
        args::Commands::Status(args) => commands::status(cli.host, cli.port, args).await,
        args::Commands::EngineStatus => commands::engine_status(cli.host, cli.port).await,
        args::Commands::Ping => commands::ping(cli.host, cli.port).await,
        args::Commands::ReloadTemplates => commands::reload_templates(cli.host, cli.port).await,
    } {
        bail_error!("Command failed because of error {}", e);
    };
    Ok(())
}
