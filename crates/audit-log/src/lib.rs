//! JSON-lines session journal for the Socket.IO gateway.
//!
//! Every noteworthy step of a proxied session (accepted, rejected, target
//! unreachable, forwarding failure, closed) is recorded as one JSON object
//! per line. Producers hold a cheap [`AuditSink`] clone; a background task
//! owns the file.
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/var/log/sio-gateway/audit.jsonl").await?;
//!
//! sink.log(AuditEntry::new(
//!     AuditEventType::GatewayStarted,
//!     AuditSource::new("sio-gateway"),
//!     serde_json::json!({ "version": "0.1.0" }),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, AuditSource};
pub use sink::AuditSink;
pub use writer::{AuditWriteError, AuditWriter};
