use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use url::Url;

use crate::operate::{BridgeConfig, OperateConfig};
use crate::registry::RegistryConfig;

pub const DEFAULT_LOG_FILTER: &str = "info,operate_gateway=debug";

#[derive(Debug, Parser)]
#[command(
    name = "operate-gateway",
    author,
    version,
    about = "Routes automation commands from callers to remote execution agents"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "OPERATE_GATEWAY_LISTEN_ADDR", default_value = "127.0.0.1:8787")]
    pub listen_addr: String,

    /// tracing filter used when RUST_LOG is not set.
    #[arg(long, env = "OPERATE_GATEWAY_LOG_FILTER", default_value = DEFAULT_LOG_FILTER)]
    pub log_filter: String,

    /// Default deadline for a request sent to a remote agent.
    #[arg(long, env = "OPERATE_GATEWAY_REQUEST_TIMEOUT_MS", default_value_t = 60_000)]
    pub request_timeout_ms: u64,

    /// Time an agent has to send its register request after connecting.
    #[arg(long, env = "OPERATE_GATEWAY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    #[arg(long, env = "OPERATE_GATEWAY_HEARTBEAT_INTERVAL_SECS", default_value_t = 15)]
    pub heartbeat_interval_secs: u64,

    /// Agents silent for longer than this are dropped by the sweep.
    #[arg(long, env = "OPERATE_GATEWAY_HEARTBEAT_STALE_SECS", default_value_t = 45)]
    pub heartbeat_stale_secs: u64,

    #[arg(long, env = "OPERATE_GATEWAY_RECONNECT_INTERVAL_MS", default_value_t = 5_000)]
    pub reconnect_interval_ms: u64,

    #[arg(long, env = "OPERATE_GATEWAY_MAX_RECONNECT_ATTEMPTS", default_value_t = 5)]
    pub max_reconnect_attempts: u32,

    /// Pause between reconnecting and retrying a failed operation.
    #[arg(long, env = "OPERATE_GATEWAY_RETRY_DELAY_MS", default_value_t = 500)]
    pub retry_delay_ms: u64,

    /// WebSocket URL of the browser bridge. The `web` device is disabled when unset.
    #[arg(long, env = "OPERATE_GATEWAY_BRIDGE_URL")]
    pub bridge_url: Option<String>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "OPERATE_GATEWAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub log_filter: String,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_stale: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub retry_delay: Duration,
    pub bridge_url: Option<Url>,
    pub shutdown_grace: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            log_filter: DEFAULT_LOG_FILTER.into(),
            request_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_stale: Duration::from_secs(45),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            retry_delay: Duration::from_millis(500),
            bridge_url: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<Cli> for GatewayConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.request_timeout_ms == 0 {
            bail!("request timeout must be greater than zero");
        }
        if cli.heartbeat_interval_secs == 0 {
            bail!("heartbeat interval must be greater than zero");
        }
        if cli.heartbeat_stale_secs <= cli.heartbeat_interval_secs {
            bail!(
                "heartbeat stale threshold ({}s) must exceed the heartbeat interval ({}s)",
                cli.heartbeat_stale_secs,
                cli.heartbeat_interval_secs
            );
        }
        let bridge_url = cli
            .bridge_url
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| parse_bridge_url(&raw))
            .transpose()?;

        Ok(GatewayConfig {
            listen_addr,
            log_filter: cli.log_filter,
            request_timeout: Duration::from_millis(cli.request_timeout_ms),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            heartbeat_interval: Duration::from_secs(cli.heartbeat_interval_secs),
            heartbeat_stale: Duration::from_secs(cli.heartbeat_stale_secs),
            reconnect_interval: Duration::from_millis(cli.reconnect_interval_ms),
            max_reconnect_attempts: cli.max_reconnect_attempts,
            retry_delay: Duration::from_millis(cli.retry_delay_ms),
            bridge_url,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

fn parse_bridge_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid bridge url: {raw}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => bail!("bridge url must use ws:// or wss://, got {other}://"),
    }
}

impl GatewayConfig {
    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            request_timeout: self.request_timeout,
            heartbeat_interval: self.heartbeat_interval,
            stale_after: self.heartbeat_stale,
            ..RegistryConfig::default()
        }
    }

    pub fn operate(&self, device: &str) -> OperateConfig {
        OperateConfig {
            reconnect_interval: self.reconnect_interval,
            max_reconnect_attempts: self.max_reconnect_attempts,
            retry_delay: self.retry_delay,
            ..OperateConfig::new(device)
        }
    }

    pub fn bridge(&self) -> Option<BridgeConfig> {
        self.bridge_url.as_ref().map(|url| BridgeConfig {
            request_timeout: self.request_timeout,
            ..BridgeConfig::new(url.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["operate-gateway"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("cli parses")
    }

    #[test_timeout::timeout]
    fn defaults_convert_into_durations() {
        let config = GatewayConfig::try_from(cli(&[])).expect("valid");
        assert_eq!(config.listen_addr.port(), 8787);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.heartbeat_stale, Duration::from_secs(45));
        assert!(config.bridge().is_none());

        let registry = config.registry();
        assert_eq!(registry.heartbeat_interval, Duration::from_secs(15));
        let operate = config.operate("windows");
        assert_eq!(operate.name, "windows");
        assert_eq!(operate.max_reconnect_attempts, 5);
    }

    #[test_timeout::timeout]
    fn bridge_url_must_be_a_websocket() {
        let config =
            GatewayConfig::try_from(cli(&["--bridge-url", "ws://127.0.0.1:9222/bridge"])).expect("valid");
        let bridge = config.bridge().expect("bridge configured");
        assert_eq!(bridge.url, "ws://127.0.0.1:9222/bridge");

        let err = GatewayConfig::try_from(cli(&["--bridge-url", "http://127.0.0.1:9222"]))
            .expect_err("http rejected");
        assert!(err.to_string().contains("ws:// or wss://"));
    }

    #[test_timeout::timeout]
    fn rejects_inconsistent_heartbeats_and_bad_addresses() {
        assert!(GatewayConfig::try_from(cli(&[
            "--heartbeat-interval-secs",
            "30",
            "--heartbeat-stale-secs",
            "30"
        ]))
        .is_err());
        assert!(GatewayConfig::try_from(cli(&["--listen-addr", "not-an-addr"])).is_err());
    }
}
