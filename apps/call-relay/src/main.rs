use anyhow::Result;
use call_relay::{
    cli::{self, Cli, Command, ServeArgs},
    config::RelayConfig,
    server,
    telemetry::Telemetry,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or_else(|| Command::Serve(ServeArgs::default())) {
        Command::Listen { url, user } => {
            tracing_subscriber::fmt::init();
            cli::run_listen_client(url, user).await
        }
        Command::Serve(args) => {
            let telemetry = Telemetry::init()?;
            let config = RelayConfig::try_from(args)?;
            info!(?config, "starting call-relay");
            server::run(config, Some(telemetry.metrics_handle())).await
        }
    }
}
