use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::error::ProxyError;
use crate::params::{ConnectParams, ForwardedHeaderSet};
use crate::protocol::{EnginePacket, PacketKind, SocketPacket, ENGINE_IO_VERSION};
use crate::transport::{next_text, spawn_driver, Heartbeat, SocketHandle};

/// Opens the target-facing side of a session.
///
/// Implementations must either return a handle that is connected to the
/// requested namespace, or fail without leaving anything open.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<SocketHandle, ProxyError>;
}

/// Headers produced by the WebSocket handshake itself. Forwarding a caller's
/// copy of these would break the upgrade.
const HANDSHAKE_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
];

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Engine.IO endpoint used when the target URL has no path of its own.
    pub engine_path: String,
    /// Upper bound on TCP + TLS + WebSocket + namespace handshake.
    pub connect_timeout: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            engine_path: "/socket.io/".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Socket.IO v5 client over the Engine.IO WebSocket transport.
pub struct SocketIoConnector {
    config: ConnectorConfig,
}

impl SocketIoConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    async fn open(&self, params: &ConnectParams) -> Result<SocketHandle, ProxyError> {
        let target = params.target_url.as_str();
        let fail = |reason: String| ProxyError::target(target, reason);

        let url = target_ws_url(target, &self.config.engine_path)?;
        let request = upgrade_request(&url, &params.headers).map_err(fail)?;

        let (mut ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| fail(e.to_string()))?;

        let open = loop {
            let text = next_text(&mut ws)
                .await
                .map_err(|e| fail(e.to_string()))?
                .ok_or_else(|| fail("closed before engine.io open".into()))?;
            if let EnginePacket::Open(open) = EnginePacket::decode(&text).map_err(|e| fail(e.to_string()))? {
                break open;
            }
        };

        let namespace = params.namespace.as_str();
        ws.send(Message::text(SocketPacket::connect(namespace, None).to_frame()))
            .await
            .map_err(|e| fail(e.to_string()))?;

        loop {
            let text = next_text(&mut ws)
                .await
                .map_err(|e| fail(e.to_string()))?
                .ok_or_else(|| fail("closed before namespace ack".into()))?;

            match EnginePacket::decode(&text).map_err(|e| fail(e.to_string()))? {
                EnginePacket::Ping(data) => {
                    ws.send(Message::text(EnginePacket::Pong(data).encode()))
                        .await
                        .map_err(|e| fail(e.to_string()))?;
                }
                EnginePacket::Close => return Err(fail("closed before namespace ack".into())),
                EnginePacket::Message(body) => {
                    let packet = SocketPacket::decode(&body).map_err(|e| fail(e.to_string()))?;
                    if packet.namespace != namespace {
                        continue;
                    }
                    match packet.kind {
                        PacketKind::Connect => break,
                        PacketKind::ConnectError => {
                            let message = packet
                                .data
                                .as_ref()
                                .and_then(|d| d.get("message"))
                                .and_then(|m| m.as_str())
                                .unwrap_or("namespace rejected")
                                .to_string();
                            return Err(fail(format!("remote rejected namespace: {message}")));
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        tracing::debug!(
            target_url = target,
            %namespace,
            sid = %open.sid,
            ping_interval = open.ping_interval,
            "target namespace joined"
        );

        let heartbeat = Heartbeat {
            interval: Duration::from_millis(open.ping_interval),
            timeout: Duration::from_millis(open.ping_timeout),
            send_pings: false,
        };
        Ok(spawn_driver(ws, namespace.to_string(), heartbeat, "outbound"))
    }
}

#[async_trait]
impl TargetConnector for SocketIoConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<SocketHandle, ProxyError> {
        match tokio::time::timeout(self.config.connect_timeout, self.open(params)).await {
            Ok(result) => result,
            Err(_) => Err(ProxyError::target(
                &params.target_url,
                format!("no handshake within {:?}", self.config.connect_timeout),
            )),
        }
    }
}

/// Build the client upgrade request, layering forwarded headers over the
/// ones the WebSocket handshake needs.
fn upgrade_request(url: &Url, headers: &ForwardedHeaderSet) -> Result<Request, String> {
    let mut request = url.as_str().into_client_request().map_err(|e| e.to_string())?;

    for (key, value) in headers.iter() {
        if HANDSHAKE_HEADERS.contains(&key.to_ascii_lowercase().as_str()) {
            tracing::debug!(header = key, "handshake header not forwarded");
            continue;
        }
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| format!("invalid header name '{key}': {e}"))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| format!("invalid value for header '{key}': {e}"))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}

/// Turn a user-supplied target into the Engine.IO WebSocket URL.
///
/// `http`/`https` map to `ws`/`wss`, a bare `host:port` is taken as `ws`.
/// A URL with no path gets `engine_path`. The original query string is kept
/// and the Engine.IO transport parameters are appended.
pub fn target_ws_url(target: &str, engine_path: &str) -> Result<Url, ProxyError> {
    let absolute = if target.contains("://") {
        target.to_string()
    } else {
        format!("ws://{target}")
    };
    let mut url = Url::parse(&absolute).map_err(|e| ProxyError::target(target, e))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ProxyError::target(
                target,
                format!("unsupported scheme '{other}'"),
            ))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ProxyError::target(target, "cannot rewrite scheme"))?;

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(engine_path);
    }
    url.query_pairs_mut()
        .append_pair("EIO", ENGINE_IO_VERSION)
        .append_pair("transport", "websocket");

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::RawParams;

    #[test]
    fn maps_schemes_to_websocket() {
        let url = target_ws_url("https://echo.example.com", "/socket.io/").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://echo.example.com/socket.io/?EIO=4&transport=websocket"
        );

        let url = target_ws_url("http://localhost:3000", "/socket.io/").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(3000));

        let url = target_ws_url("127.0.0.1:9000", "/socket.io/").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/socket.io/");

        assert!(target_ws_url("ftp://example.com", "/socket.io/").is_err());
    }

    #[test]
    fn keeps_explicit_path_and_query() {
        let url = target_ws_url("wss://api.example.com/live/?token=t1", "/socket.io/").unwrap();
        assert_eq!(url.path(), "/live/");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("token".to_string(), "t1".to_string()),
                ("EIO".to_string(), "4".to_string()),
                ("transport".to_string(), "websocket".to_string()),
            ]
        );
    }

    #[test]
    fn forwarded_headers_skip_handshake_fields() {
        let url = target_ws_url("ws://target.internal:3000", "/socket.io/").unwrap();
        let headers: ForwardedHeaderSet = [
            ("Host".to_string(), "evil.example.com".to_string()),
            ("Sec-WebSocket-Key".to_string(), "forged".to_string()),
            ("Authorization".to_string(), "Bearer t1".to_string()),
        ]
        .into_iter()
        .collect();

        let request = upgrade_request(&url, &headers).unwrap();
        let get = |name: &str| request.headers().get(name).and_then(|v| v.to_str().ok());
        assert_eq!(get("host"), Some("target.internal:3000"));
        assert_ne!(get("sec-websocket-key"), Some("forged"));
        assert_eq!(get("authorization"), Some("Bearer t1"));
    }

    fn params(target: &str, headers: ForwardedHeaderSet) -> ConnectParams {
        let mut params = ConnectParams::parse(&RawParams {
            target_url: Some(target.to_string()),
            namespace: Some("/chat".to_string()),
            headers: None,
        })
        .unwrap();
        params.headers = headers;
        params
    }

    #[tokio::test]
    async fn illegal_header_name_fails_before_dialing() {
        let connector = SocketIoConnector::new(ConnectorConfig::default());
        let headers: ForwardedHeaderSet =
            [("bad header".to_string(), "x".to_string())].into_iter().collect();
        let err = connector
            .connect(&params("ws://127.0.0.1:9", headers))
            .await
            .unwrap_err();
        match err {
            ProxyError::TargetConnection { reason, .. } => assert!(reason.contains("bad header")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_target_is_a_connection_error() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = SocketIoConnector::new(ConnectorConfig {
            connect_timeout: Duration::from_secs(2),
            ..ConnectorConfig::default()
        });
        let err = connector
            .connect(&params(&format!("ws://127.0.0.1:{port}"), ForwardedHeaderSet::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::TargetConnection { .. }));
    }
}
