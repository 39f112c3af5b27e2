use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use http::StatusCode;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use uuid::Uuid;

use crate::connector::TargetConnector;
use crate::origin;
use crate::params::RawParams;
use crate::protocol::ENGINE_IO_VERSION;
use crate::relay::RelayConfig;
use crate::session::{run_session, ProxySession, SessionJournal};
use crate::transport::{accept_socket, EngineOptions};

const COMPONENT: &str = "sio-proxy";

/// Configuration for the gateway listener.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the dedicated listener binds to.
    pub listen_addr: SocketAddr,
    /// HTTP path accepting upgrades. A trailing slash is optional.
    pub path: String,
    /// Origin patterns (glob with `*`); `["*"]` admits every origin.
    pub allowed_origins: Vec<String>,
    pub engine: EngineOptions,
    pub relay: RelayConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9001)),
            path: "/socket.io/".to_string(),
            allowed_origins: vec![origin::ANY_ORIGIN.to_string()],
            engine: EngineOptions::default(),
            relay: RelayConfig::default(),
        }
    }
}

/// Process-wide connection counters.
#[derive(Debug, Default)]
pub struct GatewayStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub active: u64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the active-session gauge when the connection task ends,
/// however it ends.
struct ActiveGuard<'a>(&'a GatewayStats);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a GatewayStats) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Shared {
    config: GatewayConfig,
    connector: Arc<dyn TargetConnector>,
    audit: AuditSink,
    stats: GatewayStats,
}

/// The Socket.IO proxy gateway.
///
/// Built once at startup with its connector and audit sink injected. Every
/// accepted connection runs in its own task, so a failing session never
/// affects the others or the accept loop.
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<Shared>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn TargetConnector>,
        audit: AuditSink,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                audit,
                stats: GatewayStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Bind `listen_addr` and serve until the task is cancelled.
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.shared.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        tracing::info!(
            addr = %listener.local_addr()?,
            path = %self.shared.config.path,
            "socket.io gateway listening"
        );

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Usually descriptor exhaustion; back off instead of spinning.
                    tracing::error!(%err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let shared = Arc::clone(&self.shared);

            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, remote_addr, shared).await {
                    tracing::debug!(%remote_addr, %err, "connection ended before session start");
                }
            });
        }
    }
}

/// What the upgrade callback learned about the request.
#[derive(Debug, Default, Clone)]
struct Upgrade {
    origin: Option<String>,
    query: String,
    rejection: Option<&'static str>,
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

fn same_path(requested: &str, configured: &str) -> bool {
    requested.trim_end_matches('/') == configured.trim_end_matches('/')
}

/// Check path, origin and Engine.IO transport parameters of an upgrade.
fn screen_upgrade(
    req: &HsRequest,
    config: &GatewayConfig,
    upgrade: &mut Upgrade,
) -> Result<(), ErrorResponse> {
    upgrade.origin = req
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    upgrade.query = req.uri().query().unwrap_or_default().to_string();

    if !same_path(req.uri().path(), &config.path) {
        upgrade.rejection = Some("path");
        return Err(reject(StatusCode::NOT_FOUND, "Not Found"));
    }

    if let Err(rejection) = origin::validate_origin(upgrade.origin.as_deref(), &config.allowed_origins) {
        tracing::warn!(%rejection, "origin rejected");
        upgrade.rejection = Some("origin");
        return Err(reject(StatusCode::FORBIDDEN, "Origin not allowed"));
    }

    let mut eio = None;
    let mut transport = None;
    for (key, value) in url::form_urlencoded::parse(upgrade.query.as_bytes()) {
        match key.as_ref() {
            "EIO" => eio = Some(value.into_owned()),
            "transport" => transport = Some(value.into_owned()),
            _ => {}
        }
    }
    if eio.as_deref() != Some(ENGINE_IO_VERSION) || transport.as_deref() != Some("websocket") {
        upgrade.rejection = Some("transport");
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "only EIO=4 over transport=websocket is supported",
        ));
    }

    Ok(())
}

/// One TCP connection from accept to session teardown.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    shared: Arc<Shared>,
) -> anyhow::Result<()> {
    let captured: Arc<Mutex<Upgrade>> = Arc::new(Mutex::new(Upgrade::default()));
    let captured_cb = Arc::clone(&captured);
    let shared_cb = Arc::clone(&shared);

    let callback = move |req: &HsRequest, response: HsResponse| -> Result<HsResponse, ErrorResponse> {
        let mut upgrade = Upgrade::default();
        let verdict = screen_upgrade(req, &shared_cb.config, &mut upgrade);
        if let Ok(mut guard) = captured_cb.lock() {
            *guard = upgrade;
        }
        verdict.map(|()| response)
    };

    // Frames past the announced maxPayload fail the read and end the session.
    let max_payload = usize::try_from(shared.config.engine.max_payload).unwrap_or(usize::MAX);
    let ws_config = WebSocketConfig::default()
        .max_message_size(Some(max_payload))
        .max_frame_size(Some(max_payload));
    let upgrade_result =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await;
    let upgrade = captured.lock().map(|g| g.clone()).unwrap_or_default();

    let ws = match upgrade_result {
        Ok(ws) => ws,
        Err(err) => {
            shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            if upgrade.rejection == Some("origin") {
                shared
                    .audit
                    .log(AuditEntry::new(
                        AuditEventType::OriginRejected,
                        AuditSource::new(COMPONENT)
                            .with_remote_addr(remote_addr)
                            .with_origin(upgrade.origin.as_deref()),
                        serde_json::json!({ "error": err.to_string() }),
                    ))
                    .await;
            }
            tracing::debug!(%remote_addr, rejection = ?upgrade.rejection, "upgrade refused");
            return Err(err.into());
        }
    };

    let session_id = Uuid::new_v4();
    let inbound = accept_socket(ws, &session_id.to_string(), &shared.config.engine).await?;

    shared.stats.accepted.fetch_add(1, Ordering::Relaxed);
    let _active = ActiveGuard::enter(&shared.stats);

    tracing::info!(
        %session_id,
        %remote_addr,
        origin = upgrade.origin.as_deref().unwrap_or("<none>"),
        namespace = inbound.namespace(),
        "client connected"
    );

    let journal = SessionJournal::new(
        shared.audit.clone(),
        AuditSource::new(COMPONENT)
            .with_session(session_id)
            .with_remote_addr(remote_addr)
            .with_origin(upgrade.origin.as_deref()),
    );
    journal
        .record(
            AuditEventType::SessionOpened,
            serde_json::json!({ "client_namespace": inbound.namespace() }),
        )
        .await;

    let raw = RawParams::from_query(&upgrade.query);
    let report = run_session(
        ProxySession::new(session_id, inbound),
        &raw,
        shared.connector.as_ref(),
        &shared.config.relay,
        journal,
    )
    .await;

    tracing::info!(
        %session_id,
        %remote_addr,
        reason = %report.reason,
        to_target = report.relay.to_target,
        to_client = report.relay.to_client,
        "connection closed"
    );
    Ok(())
}
