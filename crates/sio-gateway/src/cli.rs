use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sio-gateway",
    version,
    about = "Socket.IO proxy for browser clients"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Upgrade path (overrides config file setting)
    #[arg(long)]
    pub path: Option<String>,

    /// Log level filter (overrides config file setting)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_optional() {
        let cli = Cli::parse_from(["sio-gateway"]);
        assert_eq!(cli.config, PathBuf::from("config.yaml"));
        assert!(cli.listen.is_none());
        assert!(cli.path.is_none());
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::parse_from([
            "sio-gateway",
            "-c",
            "/etc/sio/gateway.yaml",
            "--listen",
            "0.0.0.0:9001",
            "--path",
            "/proxy/",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/sio/gateway.yaml"));
        assert_eq!(cli.listen.as_deref(), Some("0.0.0.0:9001"));
        assert_eq!(cli.path.as_deref(), Some("/proxy/"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
