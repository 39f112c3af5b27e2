use serde::{Deserialize, Serialize};

/// One line of the session journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: uuid::Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event_type: AuditEventType,
    pub source: AuditSource,
    pub details: serde_json::Value,
}

impl AuditEntry {
    /// Create an entry stamped with a fresh UUID v4 and the current UTC time.
    pub fn new(
        event_type: AuditEventType,
        source: AuditSource,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            event_type,
            source,
            details,
        }
    }
}

/// The category of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    GatewayStarted,
    GatewayStopped,
    OriginRejected,
    SessionOpened,
    SessionRejected,
    TargetConnectFailed,
    SessionActive,
    ForwardingFailed,
    SessionClosed,
}

/// Who produced the entry, plus whatever session context is known.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSource {
    pub component: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

impl AuditSource {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl ToString) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn with_remote_addr(mut self, addr: impl ToString) -> Self {
        self.remote_addr = Some(addr.to_string());
        self
    }

    pub fn with_origin(mut self, origin: Option<&str>) -> Self {
        self.origin = origin.map(str::to_string);
        self
    }

    pub fn with_target(mut self, target_url: impl Into<String>) -> Self {
        self.target_url = Some(target_url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_string(&AuditEventType::TargetConnectFailed).unwrap();
        assert_eq!(json, "\"target_connect_failed\"");
    }

    #[test]
    fn empty_source_fields_are_omitted() {
        let entry = AuditEntry::new(
            AuditEventType::SessionOpened,
            AuditSource::new("gateway").with_session("abc"),
            serde_json::json!({}),
        );
        let value = serde_json::to_value(&entry).unwrap();
        let source = value.get("source").unwrap();
        assert_eq!(source["component"], "gateway");
        assert_eq!(source["session_id"], "abc");
        assert!(source.get("origin").is_none());
        assert!(source.get("target_url").is_none());
    }

    #[test]
    fn builders_fill_session_context() {
        let source = AuditSource::new("sio-proxy")
            .with_session("s-1")
            .with_remote_addr("127.0.0.1:5000")
            .with_origin(None)
            .with_target("wss://echo.example.com");
        assert_eq!(source.session_id.as_deref(), Some("s-1"));
        assert_eq!(source.remote_addr.as_deref(), Some("127.0.0.1:5000"));
        assert!(source.origin.is_none());
        assert_eq!(source.target_url.as_deref(), Some("wss://echo.example.com"));
    }
}
