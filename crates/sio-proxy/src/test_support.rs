use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::connector::TargetConnector;
use crate::error::ProxyError;
use crate::params::ConnectParams;
use crate::transport::{SocketHandle, SocketPeer};

/// In-memory connector. Targets containing "unreachable" fail; every other
/// connect yields a channel handle whose far end is handed to the test.
#[derive(Clone)]
pub(crate) struct MockConnector {
    attempts: Arc<AtomicUsize>,
    opened_tx: mpsc::UnboundedSender<(ConnectParams, SocketPeer)>,
    opened_rx: Arc<Mutex<mpsc::UnboundedReceiver<(ConnectParams, SocketPeer)>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        Self {
            attempts: Arc::new(AtomicUsize::new(0)),
            opened_tx,
            opened_rx: Arc::new(Mutex::new(opened_rx)),
        }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) async fn next_connection(&self) -> (ConnectParams, SocketPeer) {
        self.opened_rx
            .lock()
            .await
            .recv()
            .await
            .expect("mock connector dropped")
    }
}

#[async_trait]
impl TargetConnector for MockConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<SocketHandle, ProxyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if params.target_url.contains("unreachable") {
            return Err(ProxyError::TargetConnection {
                target: params.target_url.clone(),
                reason: "connection refused".into(),
            });
        }
        let (handle, peer) = SocketHandle::channel(params.namespace.clone());
        let _ = self.opened_tx.send((params.clone(), peer));
        Ok(handle)
    }
}
