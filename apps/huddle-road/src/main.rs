use anyhow::Result;
use clap::Parser;
use huddle_road::cli::{run_watch_client, Cli, Command};
use huddle_road::config::ServerConfig;
use huddle_road::telemetry::Telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Command::Watch(args)) = cli.command {
        return run_watch_client(args).await;
    }

    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        persistent = config.database_url.is_some(),
        auth_bypass = config.auth_bypass,
        "starting huddle-road"
    );
    huddle_road::run(config, telemetry.metrics_handle()).await
}
