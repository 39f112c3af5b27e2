use thiserror::Error;

/// Everything that can end (or dent) a single proxied session.
///
/// None of these are fatal to the gateway: each one is confined to the
/// session that produced it.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// `targetUrl` or `namespace` missing or empty.
    #[error("invalid connection parameters: {0}")]
    InvalidParameters(String),

    /// The `headers` query parameter is not a JSON array of `{key, value}`.
    #[error("malformed headers payload: {0}")]
    HeaderParse(String),

    /// The outbound connection could not be established.
    #[error("failed to connect to target {target}: {reason}")]
    TargetConnection { target: String, reason: String },

    /// A single event could not be relayed.
    #[error("failed to forward event '{event}': {reason}")]
    Forwarding { event: String, reason: String },

    /// A packet on the wire did not follow the Engine.IO / Socket.IO framing.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The handle's driver has exited; nothing more can be sent through it.
    #[error("socket handle closed")]
    HandleClosed,
}

impl ProxyError {
    pub(crate) fn target(target: &str, reason: impl ToString) -> Self {
        Self::TargetConnection {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short, stable label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::HeaderParse(_) => "header_parse",
            Self::TargetConnection { .. } => "target_connection",
            Self::Forwarding { .. } => "forwarding",
            Self::Protocol(_) => "protocol",
            Self::HandleClosed => "handle_closed",
        }
    }
}
