//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! Only the WebSocket transport is spoken, so every Engine.IO packet is one
//! text frame: a single type digit followed by its payload. Socket.IO packets
//! ride inside Engine.IO `message` packets with the layout
//!
//! ```text
//! <type>[<attachments>-][<namespace>,][<ack id>][<json>]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyError;

/// Engine.IO protocol revision spoken on both sides.
pub const ENGINE_IO_VERSION: &str = "4";

/// Namespace used when a packet carries none.
pub const DEFAULT_NAMESPACE: &str = "/";

// ---------------------------------------------------------------------------
// Engine.IO
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenPayload),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

/// Body of the Engine.IO `open` packet sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: u64,
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self, ProxyError> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| ProxyError::Protocol("empty engine.io frame".into()))?;
        let body = chars.as_str();

        Ok(match kind {
            '0' => {
                let open = serde_json::from_str(body)
                    .map_err(|e| ProxyError::Protocol(format!("bad open packet: {e}")))?;
                Self::Open(open)
            }
            '1' => Self::Close,
            '2' => Self::Ping(body.to_string()),
            '3' => Self::Pong(body.to_string()),
            '4' => Self::Message(body.to_string()),
            '5' => Self::Upgrade,
            '6' => Self::Noop,
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unknown engine.io packet type '{other}'"
                )))
            }
        })
    }

    pub fn encode(&self) -> String {
        match self {
            // OpenPayload only holds strings and integers.
            Self::Open(open) => format!("0{}", serde_json::to_string(open).unwrap_or_default()),
            Self::Close => "1".to_string(),
            Self::Ping(data) => format!("2{data}"),
            Self::Pong(data) => format!("3{data}"),
            Self::Message(data) => format!("4{data}"),
            Self::Upgrade => "5".to_string(),
            Self::Noop => "6".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Socket.IO
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect,
    Disconnect,
    Event,
    Ack,
    ConnectError,
    BinaryEvent,
    BinaryAck,
}

impl PacketKind {
    fn from_digit(c: char) -> Option<Self> {
        Some(match c {
            '0' => Self::Connect,
            '1' => Self::Disconnect,
            '2' => Self::Event,
            '3' => Self::Ack,
            '4' => Self::ConnectError,
            '5' => Self::BinaryEvent,
            '6' => Self::BinaryAck,
            _ => return None,
        })
    }

    fn digit(self) -> char {
        match self {
            Self::Connect => '0',
            Self::Disconnect => '1',
            Self::Event => '2',
            Self::Ack => '3',
            Self::ConnectError => '4',
            Self::BinaryEvent => '5',
            Self::BinaryAck => '6',
        }
    }

    pub fn is_binary(self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub kind: PacketKind,
    pub namespace: String,
    pub attachments: usize,
    pub ack_id: Option<u64>,
    pub data: Option<Value>,
}

/// A named application event and its arguments, exactly as they appeared on
/// the wire. The proxy never looks inside `args`.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketEvent {
    pub name: String,
    pub args: Vec<Value>,
}

impl SocketEvent {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

impl SocketPacket {
    fn new(kind: PacketKind, namespace: &str, data: Option<Value>) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            attachments: 0,
            ack_id: None,
            data,
        }
    }

    pub fn connect(namespace: &str, data: Option<Value>) -> Self {
        Self::new(PacketKind::Connect, namespace, data)
    }

    pub fn disconnect(namespace: &str) -> Self {
        Self::new(PacketKind::Disconnect, namespace, None)
    }

    pub fn connect_error(namespace: &str, message: &str) -> Self {
        Self::new(
            PacketKind::ConnectError,
            namespace,
            Some(serde_json::json!({ "message": message })),
        )
    }

    pub fn event(namespace: &str, event: &SocketEvent) -> Self {
        let mut array = Vec::with_capacity(event.args.len() + 1);
        array.push(Value::String(event.name.clone()));
        array.extend(event.args.iter().cloned());
        Self::new(PacketKind::Event, namespace, Some(Value::Array(array)))
    }

    /// Interpret an EVENT packet's data as `[name, ...args]`.
    pub fn into_event(self) -> Result<SocketEvent, ProxyError> {
        if self.kind != PacketKind::Event {
            return Err(ProxyError::Protocol(format!(
                "expected an event packet, got {:?}",
                self.kind
            )));
        }
        let Some(Value::Array(mut items)) = self.data else {
            return Err(ProxyError::Protocol("event payload is not an array".into()));
        };
        if items.is_empty() {
            return Err(ProxyError::Protocol("event payload is empty".into()));
        }
        match items.remove(0) {
            Value::String(name) => Ok(SocketEvent { name, args: items }),
            other => Err(ProxyError::Protocol(format!(
                "event name must be a string, got {other}"
            ))),
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProxyError> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .and_then(PacketKind::from_digit)
            .ok_or_else(|| ProxyError::Protocol(format!("bad socket.io packet type in {text:?}")))?;
        let mut rest = chars.as_str();

        let mut attachments = 0;
        if kind.is_binary() {
            let dash = rest
                .find('-')
                .ok_or_else(|| ProxyError::Protocol("binary packet without attachment count".into()))?;
            attachments = rest[..dash]
                .parse()
                .map_err(|_| ProxyError::Protocol("bad attachment count".into()))?;
            rest = &rest[dash + 1..];
        }

        let mut namespace = DEFAULT_NAMESPACE.to_string();
        if rest.starts_with('/') {
            let end = rest.find(',').unwrap_or(rest.len());
            namespace = rest[..end].to_string();
            rest = rest.get(end + 1..).unwrap_or("");
        }

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let ack_id = if digits > 0 {
            let id = rest[..digits]
                .parse()
                .map_err(|_| ProxyError::Protocol("ack id out of range".into()))?;
            rest = &rest[digits..];
            Some(id)
        } else {
            None
        };

        let data = if rest.is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(rest)
                    .map_err(|e| ProxyError::Protocol(format!("bad packet payload: {e}")))?,
            )
        };

        Ok(Self {
            kind,
            namespace,
            attachments,
            ack_id,
            data,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.kind.digit());
        if self.kind.is_binary() {
            out.push_str(&self.attachments.to_string());
            out.push('-');
        }
        if self.namespace != DEFAULT_NAMESPACE {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.ack_id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    /// Wrap in an Engine.IO message packet, ready for a text frame.
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

/// Normalise a user-supplied namespace so that it always starts with `/`.
pub fn normalize_namespace(namespace: &str) -> String {
    if namespace.starts_with('/') {
        namespace.to_string()
    } else {
        format!("/{namespace}")
    }
}
