use audit_log::AuditEventType;
use serde_json::json;

use crate::error::ProxyError;
use crate::protocol::SocketEvent;
use crate::session::{CloseReason, ProxySession, SessionJournal};
use crate::transport::SocketHandle;

/// Default name of the event a client sends to end its session explicitly.
pub const DEFAULT_CONTROL_EVENT: &str = "internal_disconnect";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Inbound event that requests teardown instead of being forwarded.
    pub control_event: String,
    /// Relay target-originated events back to the client. When off, target
    /// events are dropped but a target disconnect still ends the session.
    pub forward_target_events: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            control_event: DEFAULT_CONTROL_EVENT.to_string(),
            forward_target_events: true,
        }
    }
}

/// What an inbound event means to the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Control,
    Forward(SocketEvent),
}

impl RelayConfig {
    pub fn classify(&self, event: SocketEvent) -> RelayEvent {
        if event.name == self.control_event {
            RelayEvent::Control
        } else {
            RelayEvent::Forward(event)
        }
    }
}

/// Per-session forwarding counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_target: u64,
    pub to_client: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    ToTarget,
    ToClient,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::ToTarget => "to_target",
            Self::ToClient => "to_client",
        }
    }
}

/// Forward events between the two handles of an active session until either
/// side goes away, then tear the session down.
///
/// Both directions are served by this one task, so each direction keeps its
/// arrival order.
pub async fn run(
    session: &mut ProxySession,
    config: &RelayConfig,
    journal: &SessionJournal,
) -> (CloseReason, RelayStats) {
    let session_id = session.id();
    let mut stats = RelayStats::default();

    let Some((inbound, outbound)) = session.handles_mut() else {
        let reason = session.close_reason().unwrap_or(CloseReason::InboundDisconnected);
        return (reason, stats);
    };

    let reason = loop {
        tokio::select! {
            event = inbound.recv() => {
                let Some(event) = event else {
                    break CloseReason::InboundDisconnected;
                };
                match config.classify(event) {
                    RelayEvent::Control => {
                        tracing::info!(%session_id, "client requested disconnect");
                        break CloseReason::ControlEvent;
                    }
                    RelayEvent::Forward(event) => {
                        match forward(outbound, event, Direction::ToTarget, journal, &mut stats).await {
                            Ok(()) => stats.to_target += 1,
                            Err(ProxyError::HandleClosed) => break CloseReason::ForwardingFailed,
                            // Target is behind; this event is dropped.
                            Err(_) => {}
                        }
                    }
                }
            }
            event = outbound.recv() => {
                let Some(event) = event else {
                    break CloseReason::TargetDisconnected;
                };
                if !config.forward_target_events {
                    tracing::trace!(%session_id, event = %event.name, "target event dropped");
                    continue;
                }
                match forward(inbound, event, Direction::ToClient, journal, &mut stats).await {
                    Ok(()) => stats.to_client += 1,
                    Err(ProxyError::HandleClosed) => break CloseReason::ForwardingFailed,
                    Err(_) => {}
                }
            }
        }
    };

    session.teardown(reason).await;
    tracing::info!(
        %session_id,
        %reason,
        to_target = stats.to_target,
        to_client = stats.to_client,
        failures = stats.failures,
        "session ended"
    );
    (reason, stats)
}

/// Emit one event. A full send queue drops the event and leaves the
/// handle usable; a closed handle is returned as `HandleClosed`.
async fn forward(
    to: &SocketHandle,
    event: SocketEvent,
    direction: Direction,
    journal: &SessionJournal,
    stats: &mut RelayStats,
) -> Result<(), ProxyError> {
    let name = event.name.clone();
    let Err(err) = to.emit(event) else {
        return Ok(());
    };

    stats.failures += 1;
    tracing::warn!(
        direction = direction.as_str(),
        event = %name,
        kind = err.kind(),
        %err,
        "forwarding failed"
    );
    journal
        .record(
            AuditEventType::ForwardingFailed,
            json!({
                "direction": direction.as_str(),
                "event": name,
                "kind": err.kind(),
                "error": err.to_string(),
            }),
        )
        .await;
    Err(err)
}
