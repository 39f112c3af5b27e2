//! Socket.IO proxy gateway.
//!
//! A browser opens a Socket.IO connection to this gateway, naming in the
//! handshake query the real endpoint it wants (`targetUrl`), the namespace
//! on that endpoint (`namespace`) and the headers to present (`headers`).
//! The gateway opens the matching outbound connection and relays every
//! event between the two, so that the browser's origin policy never comes
//! into play.
//!
//! ```text
//! Browser <--socket.io--> Gateway <--socket.io--> Target
//!                            |
//!                     [ProxySession]
//!                   parse -> connect -> relay -> teardown
//! ```
//!
//! Each connection is a [`ProxySession`] owning both [`SocketHandle`]s.
//! Either side going away, or the client sending the control event, tears
//! down both.

pub mod connector;
pub mod error;
pub mod listener;
pub mod origin;
pub mod params;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use connector::{ConnectorConfig, SocketIoConnector, TargetConnector};
pub use error::ProxyError;
pub use listener::{Gateway, GatewayConfig, StatsSnapshot};
pub use params::{ConnectParams, ForwardedHeaderSet, RawParams};
pub use protocol::SocketEvent;
pub use relay::{RelayConfig, RelayEvent, DEFAULT_CONTROL_EVENT};
pub use session::{CloseReason, ProxySession, SessionReport, SessionState};
pub use transport::{accept_socket, Command, EngineOptions, SocketHandle, SocketPeer};
