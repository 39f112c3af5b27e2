//! Socket handles and the tasks that drive them.
//!
//! A [`SocketHandle`] is what a session owns for each side of the proxy. It
//! is a pair of channels: events arriving from the peer, and commands
//! (emit/disconnect) going to it. For a real connection, a driver task sits
//! on the other end of those channels and owns the WebSocket. The relay
//! never touches a socket directly.

use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::ProxyError;
use crate::protocol::{EnginePacket, OpenPayload, PacketKind, SocketEvent, SocketPacket};

/// Emits a handle queues for its peer before further emits are refused.
pub const COMMAND_BUFFER: usize = 64;

/// Events a driver queues for the session before it stops reading.
pub const EVENT_BUFFER: usize = 64;

/// How long [`SocketHandle::close`] waits for the driver to flush and say
/// goodbye before the socket is dropped.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Instruction sent from a session to whatever is behind a handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Emit(SocketEvent),
    Disconnect,
}

/// Session-owned endpoint of one connection.
#[derive(Debug)]
pub struct SocketHandle {
    namespace: String,
    events: mpsc::Receiver<SocketEvent>,
    commands: mpsc::Sender<Command>,
    driver: Option<JoinHandle<()>>,
    released: bool,
}

/// The far side of a [`SocketHandle`]'s channels.
///
/// Dropping `events` is how the far side reports that the connection is
/// gone.
pub struct SocketPeer {
    pub events: mpsc::Sender<SocketEvent>,
    pub commands: mpsc::Receiver<Command>,
}

impl SocketHandle {
    /// A handle with no driver attached. The returned [`SocketPeer`] stands
    /// in for the remote end.
    pub fn channel(namespace: impl Into<String>) -> (Self, SocketPeer) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = Self {
            namespace: namespace.into(),
            events: event_rx,
            commands: command_tx,
            driver: None,
            released: false,
        };
        let peer = SocketPeer {
            events: event_tx,
            commands: command_rx,
        };
        (handle, peer)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Next event from the peer; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<SocketEvent> {
        self.events.recv().await
    }

    /// Queue an event for the peer without waiting for delivery.
    ///
    /// A full queue refuses the event with [`ProxyError::Forwarding`]; the
    /// handle stays usable. A gone peer is [`ProxyError::HandleClosed`].
    pub fn emit(&self, event: SocketEvent) -> Result<(), ProxyError> {
        let name = event.name.clone();
        match self.commands.try_send(Command::Emit(event)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ProxyError::Forwarding {
                event: name,
                reason: format!("send queue full ({COMMAND_BUFFER} pending)"),
            }),
            Err(TrySendError::Closed(_)) => Err(ProxyError::HandleClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Ask the peer to disconnect and wait until the driver has released
    /// the socket. Calling it again is a no-op.
    ///
    /// A driver that cannot flush within [`CLOSE_GRACE`] (a peer that stopped
    /// reading) is aborted, which drops the socket without a goodbye.
    pub async fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.events.close();

        let Some(mut driver) = self.driver.take() else {
            let _ = self.commands.try_send(Command::Disconnect);
            return;
        };

        let commands = &self.commands;
        let graceful = tokio::time::timeout(CLOSE_GRACE, async {
            let _ = commands.send(Command::Disconnect).await;
            (&mut driver).await
        })
        .await;

        match graceful {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(namespace = %self.namespace, %err, "socket driver task failed");
            }
            Err(_) => {
                tracing::warn!(namespace = %self.namespace, "socket driver stalled on close; aborting");
                driver.abort();
                let _ = driver.await;
            }
        }
    }
}

/// Liveness rules for one connection.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    pub interval: Duration,
    pub timeout: Duration,
    /// The Engine.IO server side sends pings; the client side answers them.
    pub send_pings: bool,
}

impl Heartbeat {
    fn window(&self) -> Duration {
        self.interval + self.timeout
    }
}

/// Engine.IO settings announced to inbound clients.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_payload: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(20_000),
            max_payload: 1_000_000,
        }
    }
}

/// Start a driver for an already handshaken connection.
pub(crate) fn spawn_driver<S>(
    ws: WebSocketStream<S>,
    namespace: String,
    heartbeat: Heartbeat,
    side: &'static str,
) -> SocketHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut handle, peer) = SocketHandle::channel(namespace.clone());
    handle.driver = Some(tokio::spawn(drive(ws, namespace, heartbeat, peer, side)));
    handle
}

async fn drive<S>(
    ws: WebSocketStream<S>,
    namespace: String,
    heartbeat: Heartbeat,
    peer: SocketPeer,
    side: &'static str,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws.split();
    let SocketPeer {
        events,
        mut commands,
    } = peer;

    let period = heartbeat.interval.max(Duration::from_millis(100));
    // A peer that stops reading is as dead as one that stops talking.
    let write_limit = heartbeat.window().max(period);
    let mut deadline = Instant::now() + heartbeat.window();
    let mut pings = tokio::time::interval_at(Instant::now() + period, period);

    let reason = loop {
        tokio::select! {
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => {
                        tracing::debug!(side, len = data.len(), "binary frame dropped");
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => break "peer closed",
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::debug!(side, %err, "websocket read failed");
                        break "read error";
                    }
                };
                deadline = Instant::now() + heartbeat.window();

                match on_frame(text.as_str(), &namespace, side) {
                    FrameAction::None => {}
                    FrameAction::Reply(frame) => {
                        if let Err(why) = write_frame(&mut write, frame, write_limit).await {
                            break why;
                        }
                    }
                    FrameAction::Deliver(event) => {
                        if events.send(event).await.is_err() {
                            break "session gone";
                        }
                    }
                    FrameAction::Close(why) => break why,
                }
            }
            command = commands.recv() => match command {
                Some(Command::Emit(event)) => {
                    let frame = SocketPacket::event(&namespace, &event).to_frame();
                    if let Err(why) = write_frame(&mut write, frame, write_limit).await {
                        tracing::debug!(side, event = %event.name, why, "websocket write failed");
                        break why;
                    }
                }
                Some(Command::Disconnect) | None => {
                    let goodbye = SocketPacket::disconnect(&namespace).to_frame();
                    let _ = write_frame(&mut write, goodbye, write_limit).await;
                    break "disconnect requested";
                }
            },
            _ = pings.tick(), if heartbeat.send_pings => {
                let ping = EnginePacket::Ping(String::new()).encode();
                if let Err(why) = write_frame(&mut write, ping, write_limit).await {
                    break why;
                }
            }
            _ = tokio::time::sleep_until(deadline) => break "heartbeat timeout",
        }
    };

    let _ = tokio::time::timeout(write_limit, write.close()).await;
    tracing::debug!(side, %namespace, reason, "socket driver finished");
}

async fn write_frame<W>(write: &mut W, frame: String, limit: Duration) -> Result<(), &'static str>
where
    W: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    match tokio::time::timeout(limit, write.send(Message::text(frame))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err("write error"),
        Err(_) => Err("write stalled"),
    }
}

enum FrameAction {
    None,
    Reply(String),
    Deliver(SocketEvent),
    Close(&'static str),
}

fn on_frame(text: &str, namespace: &str, side: &'static str) -> FrameAction {
    let packet = match EnginePacket::decode(text) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::warn!(side, %err, "ignoring malformed engine.io frame");
            return FrameAction::None;
        }
    };

    let body = match packet {
        EnginePacket::Ping(data) => return FrameAction::Reply(EnginePacket::Pong(data).encode()),
        EnginePacket::Close => return FrameAction::Close("engine.io close"),
        EnginePacket::Message(body) => body,
        _ => return FrameAction::None,
    };

    let packet = match SocketPacket::decode(&body) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::warn!(side, %err, "ignoring malformed socket.io packet");
            return FrameAction::None;
        }
    };
    if packet.namespace != namespace {
        tracing::debug!(side, namespace = %packet.namespace, "packet for another namespace ignored");
        return FrameAction::None;
    }

    match packet.kind {
        PacketKind::Event => {
            if packet.ack_id.is_some() {
                tracing::trace!(side, "acknowledgement id not relayed");
            }
            match packet.into_event() {
                Ok(event) => FrameAction::Deliver(event),
                Err(err) => {
                    tracing::warn!(side, %err, "ignoring malformed event");
                    FrameAction::None
                }
            }
        }
        PacketKind::Disconnect => FrameAction::Close("namespace disconnect"),
        PacketKind::BinaryEvent | PacketKind::BinaryAck => {
            tracing::warn!(side, attachments = packet.attachments, "binary packets are not relayed");
            FrameAction::None
        }
        PacketKind::Connect | PacketKind::Ack | PacketKind::ConnectError => FrameAction::None,
    }
}

/// Read until a text frame arrives. `None` means the connection ended.
pub(crate) async fn next_text<S>(ws: &mut WebSocketStream<S>) -> Result<Option<String>, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = ws.next().await {
        match frame.map_err(|e| ProxyError::Protocol(e.to_string()))? {
            Message::Text(text) => return Ok(Some(text.as_str().to_string())),
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

/// Server half of the Engine.IO + Socket.IO handshake for an inbound client.
///
/// Sends the `open` packet, waits for the client's namespace CONNECT and
/// acknowledges it with `sid`. The returned handle pings the client every
/// `ping_interval`.
pub async fn accept_socket<S>(
    mut ws: WebSocketStream<S>,
    sid: &str,
    options: &EngineOptions,
) -> Result<SocketHandle, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let open = EnginePacket::Open(OpenPayload {
        sid: sid.to_string(),
        upgrades: Vec::new(),
        ping_interval: options.ping_interval.as_millis() as u64,
        ping_timeout: options.ping_timeout.as_millis() as u64,
        max_payload: options.max_payload,
    });
    ws.send(Message::text(open.encode()))
        .await
        .map_err(|e| ProxyError::Protocol(e.to_string()))?;

    let wait = options.ping_interval + options.ping_timeout;
    let namespace = tokio::time::timeout(wait, wait_for_connect(&mut ws))
        .await
        .map_err(|_| ProxyError::Protocol("client never joined a namespace".into()))??;

    let ack = SocketPacket::connect(&namespace, Some(serde_json::json!({ "sid": sid })));
    ws.send(Message::text(ack.to_frame()))
        .await
        .map_err(|e| ProxyError::Protocol(e.to_string()))?;

    let heartbeat = Heartbeat {
        interval: options.ping_interval,
        timeout: options.ping_timeout,
        send_pings: true,
    };
    Ok(spawn_driver(ws, namespace, heartbeat, "inbound"))
}

async fn wait_for_connect<S>(ws: &mut WebSocketStream<S>) -> Result<String, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(text) = next_text(ws).await? {
        if let EnginePacket::Message(body) = EnginePacket::decode(&text)? {
            let packet = SocketPacket::decode(&body)?;
            if packet.kind == PacketKind::Connect {
                return Ok(packet.namespace);
            }
        }
    }
    Err(ProxyError::Protocol("connection closed during handshake".into()))
}
