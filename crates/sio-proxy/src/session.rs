//! One proxied connection pair and its lifecycle.
//!
//! ```text
//! Connecting --connector ok--> Active --any side gone--> Closing --> Closed
//!     |                                                               ^
//!     +---------------- bad params / target unreachable --------------+
//! ```

use std::fmt;

use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
use serde_json::json;
use uuid::Uuid;

use crate::connector::TargetConnector;
use crate::error::ProxyError;
use crate::params::{ConnectParams, RawParams};
use crate::relay::{self, RelayConfig, RelayStats};
use crate::transport::SocketHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session ended. Recorded by the first teardown only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    InvalidParameters,
    HeaderParse,
    TargetUnreachable,
    InboundDisconnected,
    TargetDisconnected,
    ControlEvent,
    ForwardingFailed,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParameters => "invalid_parameters",
            Self::HeaderParse => "header_parse",
            Self::TargetUnreachable => "target_unreachable",
            Self::InboundDisconnected => "inbound_disconnected",
            Self::TargetDisconnected => "target_disconnected",
            Self::ControlEvent => "control_event",
            Self::ForwardingFailed => "forwarding_failed",
        }
    }

    fn for_setup_error(err: &ProxyError) -> Self {
        match err {
            ProxyError::InvalidParameters(_) => Self::InvalidParameters,
            ProxyError::HeaderParse(_) => Self::HeaderParse,
            _ => Self::TargetUnreachable,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Both handles of one proxied connection plus where it is in its life.
///
/// The outbound handle exists only once the connector has succeeded. The
/// session owns both handles and [`teardown`](Self::teardown) releases both.
pub struct ProxySession {
    id: Uuid,
    params: Option<ConnectParams>,
    inbound: SocketHandle,
    outbound: Option<SocketHandle>,
    state: SessionState,
    close_reason: Option<CloseReason>,
}

impl ProxySession {
    pub fn new(id: Uuid, inbound: SocketHandle) -> Self {
        Self {
            id,
            params: None,
            inbound,
            outbound: None,
            state: SessionState::Connecting,
            close_reason: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn params(&self) -> Option<&ConnectParams> {
        self.params.as_ref()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn has_outbound(&self) -> bool {
        self.outbound.is_some()
    }

    pub(crate) fn activate(&mut self, params: ConnectParams, outbound: SocketHandle) {
        debug_assert_eq!(self.state, SessionState::Connecting);
        self.params = Some(params);
        self.outbound = Some(outbound);
        self.state = SessionState::Active;
    }

    /// Inbound and outbound handles of an active session.
    pub(crate) fn handles_mut(&mut self) -> Option<(&mut SocketHandle, &mut SocketHandle)> {
        match (self.state, self.outbound.as_mut()) {
            (SessionState::Active, Some(outbound)) => Some((&mut self.inbound, outbound)),
            _ => None,
        }
    }

    /// Disconnect both sides and wait until their sockets are released.
    ///
    /// Returns `true` for the call that performed the teardown; every later
    /// call is a no-op returning `false`.
    pub async fn teardown(&mut self, reason: CloseReason) -> bool {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return false;
        }
        if self.state == SessionState::Active {
            self.state = SessionState::Closing;
        }
        self.close_reason = Some(reason);

        // Released together so a stalled side cannot hold up the other.
        let inbound = &mut self.inbound;
        let outbound = self.outbound.as_mut();
        tokio::join!(inbound.close(), async {
            if let Some(outbound) = outbound {
                outbound.close().await;
            }
        });

        self.state = SessionState::Closed;
        tracing::debug!(session_id = %self.id, %reason, "session closed");
        true
    }
}

/// Audit context shared by everything that happens within one session.
#[derive(Clone)]
pub struct SessionJournal {
    audit: AuditSink,
    source: AuditSource,
}

impl SessionJournal {
    pub fn new(audit: AuditSink, source: AuditSource) -> Self {
        Self { audit, source }
    }

    pub fn disabled() -> Self {
        Self::new(AuditSink::disabled(), AuditSource::new("sio-proxy"))
    }

    pub(crate) fn set_target(&mut self, target_url: &str) {
        self.source = std::mem::take(&mut self.source).with_target(target_url);
    }

    pub async fn record(&self, event_type: AuditEventType, details: serde_json::Value) {
        self.audit
            .log(AuditEntry::new(event_type, self.source.clone(), details))
            .await;
    }
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub state: SessionState,
    pub reason: CloseReason,
    pub connect_attempted: bool,
    pub relay: RelayStats,
}

/// Drive one session from handshake parameters to `Closed`.
///
/// Parameter and connector failures close the inbound side straight away and
/// never reach the caller as errors: the report says what happened.
pub async fn run_session(
    mut session: ProxySession,
    raw: &RawParams,
    connector: &dyn TargetConnector,
    relay_config: &RelayConfig,
    mut journal: SessionJournal,
) -> SessionReport {
    let session_id = session.id();

    let params = match ConnectParams::parse(raw) {
        Ok(params) => params,
        Err(err) => {
            tracing::warn!(%session_id, kind = err.kind(), %err, "rejecting session");
            journal
                .record(
                    AuditEventType::SessionRejected,
                    json!({ "kind": err.kind(), "error": err.to_string() }),
                )
                .await;
            return finish(session, CloseReason::for_setup_error(&err), false, RelayStats::default())
                .await;
        }
    };

    journal.set_target(&params.target_url);
    tracing::info!(
        %session_id,
        target_url = %params.target_url,
        namespace = %params.namespace,
        headers = params.headers.len(),
        "connecting to target"
    );

    let outbound = match connector.connect(&params).await {
        Ok(outbound) => outbound,
        Err(err) => {
            tracing::warn!(%session_id, target_url = %params.target_url, %err, "target connection failed");
            journal
                .record(
                    AuditEventType::TargetConnectFailed,
                    json!({ "namespace": params.namespace, "error": err.to_string() }),
                )
                .await;
            return finish(session, CloseReason::for_setup_error(&err), true, RelayStats::default())
                .await;
        }
    };

    let namespace = params.namespace.clone();
    session.activate(params, outbound);
    tracing::info!(%session_id, %namespace, "session active");
    journal
        .record(AuditEventType::SessionActive, json!({ "namespace": namespace }))
        .await;

    let (reason, stats) = relay::run(&mut session, relay_config, &journal).await;

    journal
        .record(
            AuditEventType::SessionClosed,
            json!({
                "reason": reason.as_str(),
                "forwarded_to_target": stats.to_target,
                "forwarded_to_client": stats.to_client,
                "forwarding_failures": stats.failures,
            }),
        )
        .await;

    SessionReport {
        session_id,
        state: session.state(),
        reason,
        connect_attempted: true,
        relay: stats,
    }
}

async fn finish(
    mut session: ProxySession,
    reason: CloseReason,
    connect_attempted: bool,
    relay: RelayStats,
) -> SessionReport {
    session.teardown(reason).await;
    SessionReport {
        session_id: session.id(),
        state: session.state(),
        reason,
        connect_attempted,
        relay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SocketEvent;
    use crate::test_support::MockConnector;
    use crate::transport::Command;
    use serde_json::json;

    fn raw(target: &str, namespace: &str, headers: Option<&str>) -> RawParams {
        RawParams {
            target_url: Some(target.to_string()),
            namespace: Some(namespace.to_string()),
            headers: headers.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn missing_target_closes_inbound_without_dialing() {
        let connector = MockConnector::new();
        let (inbound, mut client) = SocketHandle::channel("/");
        let session = ProxySession::new(Uuid::new_v4(), inbound);

        assert!(session.params().is_none());
        let report = run_session(
            session,
            &raw("", "/chat", None),
            &connector,
            &RelayConfig::default(),
            SessionJournal::disabled(),
        )
        .await;

        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(report.reason, CloseReason::InvalidParameters);
        assert!(!report.connect_attempted);
        assert_eq!(connector.attempts(), 0);
        assert_eq!(client.commands.recv().await, Some(Command::Disconnect));
    }

    #[tokio::test]
    async fn malformed_headers_close_inbound_without_dialing() {
        let connector = MockConnector::new();
        let (inbound, mut client) = SocketHandle::channel("/");

        let report = run_session(
            ProxySession::new(Uuid::new_v4(), inbound),
            &raw("ws://target", "/chat", Some("not-json")),
            &connector,
            &RelayConfig::default(),
            SessionJournal::disabled(),
        )
        .await;

        assert_eq!(report.reason, CloseReason::HeaderParse);
        assert_eq!(connector.attempts(), 0);
        assert_eq!(client.commands.recv().await, Some(Command::Disconnect));
    }

    #[tokio::test]
    async fn connector_receives_namespace_and_headers() {
        let connector = MockConnector::new();
        let (inbound, client) = SocketHandle::channel("/");

        let task = {
            let connector = connector.clone();
            tokio::spawn(async move {
                run_session(
                    ProxySession::new(Uuid::new_v4(), inbound),
                    &raw(
                        "wss://echo.example.com",
                        "/chat",
                        Some(r#"[{"key":"Authorization","value":"Bearer abc"}]"#),
                    ),
                    &connector,
                    &RelayConfig::default(),
                    SessionJournal::disabled(),
                )
                .await
            })
        };

        let (params, _target) = connector.next_connection().await;
        assert_eq!(params.target_url, "wss://echo.example.com");
        assert_eq!(params.namespace, "/chat");
        assert_eq!(params.headers.get("Authorization"), Some("Bearer abc"));

        drop(client);
        let report = task.await.unwrap();
        assert_eq!(report.reason, CloseReason::InboundDisconnected);
    }

    #[tokio::test]
    async fn unreachable_target_closes_inbound() {
        let connector = MockConnector::new();
        let (inbound, mut client) = SocketHandle::channel("/");

        let report = run_session(
            ProxySession::new(Uuid::new_v4(), inbound),
            &raw("ws://unreachable.invalid", "/chat", None),
            &connector,
            &RelayConfig::default(),
            SessionJournal::disabled(),
        )
        .await;

        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(report.reason, CloseReason::TargetUnreachable);
        assert!(report.connect_attempted);
        assert_eq!(client.commands.recv().await, Some(Command::Disconnect));
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (inbound, mut client) = SocketHandle::channel("/");
        let (outbound, mut target) = SocketHandle::channel("/chat");
        let mut session = ProxySession::new(Uuid::new_v4(), inbound);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.has_outbound());

        let params = ConnectParams::parse(&raw("ws://t", "/chat", None)).unwrap();
        session.activate(params, outbound);
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.has_outbound());
        assert_eq!(session.params().map(|p| p.namespace.as_str()), Some("/chat"));

        assert!(session.teardown(CloseReason::InboundDisconnected).await);
        assert!(!session.teardown(CloseReason::TargetDisconnected).await);
        assert!(!session.teardown(CloseReason::ControlEvent).await);

        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.has_outbound());
        assert_eq!(session.close_reason(), Some(CloseReason::InboundDisconnected));
        assert_eq!(target.commands.recv().await, Some(Command::Disconnect));
        assert_eq!(client.commands.recv().await, Some(Command::Disconnect));
        // Nothing else was queued: both handles were released exactly once.
        drop(session);
        assert_eq!(target.commands.recv().await, None);
        assert_eq!(client.commands.recv().await, None);
    }

    #[tokio::test]
    async fn failing_session_does_not_disturb_another() {
        let connector = MockConnector::new();
        let relay = RelayConfig::default();

        let (inbound_b, client_b) = SocketHandle::channel("/");
        let healthy = {
            let connector = connector.clone();
            let relay = relay.clone();
            tokio::spawn(async move {
                run_session(
                    ProxySession::new(Uuid::new_v4(), inbound_b),
                    &raw("ws://healthy", "/chat", None),
                    &connector,
                    &relay,
                    SessionJournal::disabled(),
                )
                .await
            })
        };
        let (_, mut target_b) = connector.next_connection().await;

        let (inbound_a, _client_a) = SocketHandle::channel("/");
        let failed = run_session(
            ProxySession::new(Uuid::new_v4(), inbound_a),
            &raw("ws://unreachable.invalid", "/chat", None),
            &connector,
            &relay,
            SessionJournal::disabled(),
        )
        .await;
        assert_eq!(failed.reason, CloseReason::TargetUnreachable);

        client_b
            .events
            .try_send(SocketEvent::new("ping", vec![json!(1)]))
            .unwrap();
        assert_eq!(
            target_b.commands.recv().await,
            Some(Command::Emit(SocketEvent::new("ping", vec![json!(1)])))
        );
        assert!(!healthy.is_finished());

        drop(client_b);
        let report = healthy.await.unwrap();
        assert_eq!(report.relay.to_target, 1);
    }
}
