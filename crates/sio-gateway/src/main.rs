mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use sio_proxy::{Gateway, SocketIoConnector};

use crate::cli::Cli;

/// How long the audit writer gets to flush after the gateway stops.
const AUDIT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Resolves on SIGINT (ctrl-c) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT (ctrl-c)"),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to register SIGTERM handler; ctrl-c only");
                ctrl_c.await.ok();
                info!("received SIGINT (ctrl-c)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT (ctrl-c)");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Parse CLI args.
    let cli = Cli::parse();

    // 2. Load config, then merge CLI overrides.
    let mut cfg = config::load(&cli.config)?;

    if let Some(ref listen) = cli.listen {
        cfg.gateway.listen_addr = listen.clone();
    }
    if let Some(ref path) = cli.path {
        cfg.gateway.path = path.clone();
    }
    if let Some(ref level) = cli.log_level {
        cfg.logging.level = level.clone();
    }

    // 3. Init tracing-subscriber with JSON format.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    // wss:// targets go through rustls; a second install only fails if a
    // provider is already in place.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let gateway_config = cfg.gateway_config()?;
    let connector_config = cfg.connector_config();

    info!(
        config_file = %cli.config.display(),
        listen = %gateway_config.listen_addr,
        path = %gateway_config.path,
        control_event = %gateway_config.relay.control_event,
        "sio-gateway starting"
    );

    // 4. Start audit logger, if configured.
    let (audit, audit_handle) = match &cfg.logging.audit_log_path {
        Some(path) => {
            let (sink, handle) = AuditSink::start(path)
                .await
                .context("failed to start audit logger")?;
            (sink, Some(handle))
        }
        None => {
            info!("audit journal disabled");
            (AuditSink::disabled(), None)
        }
    };

    audit
        .log(AuditEntry::new(
            AuditEventType::GatewayStarted,
            AuditSource::new("sio-gateway"),
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "config_file": cli.config.display().to_string(),
                "listen_addr": gateway_config.listen_addr.to_string(),
                "path": gateway_config.path,
            }),
        ))
        .await;

    // 5. Build the gateway around the Socket.IO connector.
    let connector = Arc::new(SocketIoConnector::new(connector_config));
    let gateway = Gateway::new(gateway_config, connector, audit.clone());

    // 6. Serve until the listener fails or a shutdown signal arrives.
    let gateway_result = tokio::select! {
        r = gateway.run() => {
            info!("gateway listener exited");
            r
        }
        _ = shutdown_signal() => Ok(()),
    };

    // 7. Log shutdown.
    let stats = gateway.stats();
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        active = stats.active,
        "sio-gateway shutting down"
    );

    audit
        .log(AuditEntry::new(
            AuditEventType::GatewayStopped,
            AuditSource::new("sio-gateway"),
            serde_json::json!({
                "result": format!("{:?}", gateway_result),
                "accepted": stats.accepted,
                "rejected": stats.rejected,
                "active": stats.active,
            }),
        ))
        .await;

    // Sessions still running hold sink clones; don't wait on them forever.
    drop(gateway);
    drop(audit);
    if let Some(handle) = audit_handle {
        if tokio::time::timeout(AUDIT_DRAIN_GRACE, handle).await.is_err() {
            warn!("audit writer did not drain before exit");
        }
    }

    gateway_result
}
