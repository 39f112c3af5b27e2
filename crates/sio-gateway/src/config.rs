use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::warn;

use sio_proxy::{ConnectorConfig, EngineOptions, GatewayConfig, RelayConfig};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_origins")]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_control_event")]
    pub control_event: String,
    #[serde(default = "default_true")]
    pub forward_target_events: bool,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_max_payload")]
    pub max_payload: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
            path: default_path(),
            allowed_origins: default_origins(),
            control_event: default_control_event(),
            forward_target_events: default_true(),
            ping_interval_ms: default_ping_interval(),
            ping_timeout_ms: default_ping_timeout(),
            max_payload: default_max_payload(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TargetSection {
    #[serde(default = "default_engine_path")]
    pub engine_path: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            engine_path: default_engine_path(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Audit journal location. Auditing is off when unset.
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            audit_log_path: None,
        }
    }
}

impl Config {
    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let listen_addr: SocketAddr = self
            .gateway
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.gateway.listen_addr))?;

        Ok(GatewayConfig {
            listen_addr,
            path: self.gateway.path.clone(),
            allowed_origins: self.gateway.allowed_origins.clone(),
            engine: EngineOptions {
                ping_interval: Duration::from_millis(self.gateway.ping_interval_ms),
                ping_timeout: Duration::from_millis(self.gateway.ping_timeout_ms),
                max_payload: self.gateway.max_payload,
            },
            relay: RelayConfig {
                control_event: self.gateway.control_event.clone(),
                forward_target_events: self.gateway.forward_target_events,
            },
        })
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            engine_path: self.target.engine_path.clone(),
            connect_timeout: Duration::from_secs(self.target.connect_timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "127.0.0.1:9001".to_string()
}

fn default_path() -> String {
    "/socket.io/".to_string()
}

fn default_origins() -> Vec<String> {
    vec![sio_proxy::origin::ANY_ORIGIN.to_string()]
}

fn default_control_event() -> String {
    sio_proxy::DEFAULT_CONTROL_EVENT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

fn default_max_payload() -> u64 {
    1_000_000
}

fn default_engine_path() -> String {
    "/socket.io/".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// A missing file yields the defaults and a warning, so the gateway starts
/// without any configuration written.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;

    Ok(config)
}
