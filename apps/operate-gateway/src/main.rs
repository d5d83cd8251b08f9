use anyhow::Result;
use clap::Parser;
use operate_gateway::config::{Cli, GatewayConfig};
use operate_gateway::{server, telemetry};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::try_from(cli)?;
    let telemetry = telemetry::Telemetry::init(&config.log_filter)?;
    info!(
        listen_addr = %config.listen_addr,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        bridge_url = ?config.bridge_url.as_ref().map(|url| url.as_str()),
        "starting operate gateway"
    );

    server::run(config, telemetry.metrics_handle()).await
}
