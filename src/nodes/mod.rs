//! Flow nodes backed by pooled store connections
//!
//! Every node borrows one connection from the [`ConnectionPool`] when it
//! starts and hands it back in [`FlowNode::close`]. While running, a node
//! mirrors the connection state onto its status indicator: green
//! "connected" or red "disconnected".

pub mod lookup;
pub mod publisher;
pub mod subscriber;

pub use lookup::{LookupNode, LookupSettings};
pub use publisher::{PublisherNode, PublisherSettings};
pub use subscriber::{SubscriberNode, SubscriberSettings};

use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{sanitize, RawEndpointConfig};
use crate::models::{FlowMessage, NodeEvent, NodeEventKind, NodeStatus};
use crate::pool::{ConnectionPool, SharedConnection};
use crate::store::{LinkState, StoreError};

/// Error types for node operations
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Publish to '{channel}' failed: {source}")]
    Publish { channel: String, source: StoreError },

    #[error("Subscribe to '{channel}' failed: {source}")]
    Subscribe { channel: String, source: StoreError },
}

/// Where a node reports to the host
pub trait NodeOutput: Send + Sync {
    /// Forward a message to the next nodes of the flow
    fn send(&self, msg: FlowMessage);

    /// Update the node's status indicator
    fn status(&self, status: NodeStatus);

    /// Report a node-level error, optionally with the message that caused it
    fn error(&self, message: String, msg: Option<FlowMessage>);
}

/// [`NodeOutput`] that turns everything into [`NodeEvent`]s on a channel
#[derive(Clone)]
pub struct ChannelOutput {
    node: String,
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl ChannelOutput {
    pub fn new(node: impl Into<String>, tx: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self {
            node: node.into(),
            tx,
        }
    }

    fn emit(&self, kind: NodeEventKind) {
        let event = NodeEvent {
            node: self.node.clone(),
            kind,
        };
        crate::log_node_event!(&event);
        // The host may already be gone during shutdown
        let _ = self.tx.send(event);
    }
}

impl NodeOutput for ChannelOutput {
    fn send(&self, msg: FlowMessage) {
        self.emit(NodeEventKind::Message { msg });
    }

    fn status(&self, status: NodeStatus) {
        self.emit(NodeEventKind::Status { status });
    }

    fn error(&self, message: String, msg: Option<FlowMessage>) {
        crate::log_warning!("Node '{}': {}", self.node, message);
        self.emit(NodeEventKind::Error { message, msg });
    }
}

/// A running node as seen by the host
#[async_trait]
pub trait FlowNode: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> &'static str;

    /// Status currently shown on the node
    fn current_status(&self) -> NodeStatus;

    /// Handle one inbound message
    async fn input(&self, msg: FlowMessage) -> crate::Result<()>;

    /// Stop the node and give its connection back to the pool. In-flight
    /// store calls are not waited for.
    async fn close(self: Box<Self>);
}

/// Fresh per-instance scope token
pub fn new_scope_token() -> String {
    Uuid::new_v4().to_string()
}

/// Borrow a connection for a starting node: sanitize the endpoint and scope
/// it to the node unless the host asked for a shared scope.
pub(crate) fn acquire_for_node(
    pool: &ConnectionPool,
    server: &RawEndpointConfig,
    scope: Option<&str>,
) -> SharedConnection {
    let endpoint = sanitize(server);
    let scope = scope.map(str::to_string).unwrap_or_else(new_scope_token);
    pool.acquire(&endpoint, &scope)
}

/// Keeps a node's status indicator in step with its connection
pub(crate) struct StatusMirror {
    current: Arc<Mutex<NodeStatus>>,
    task: JoinHandle<()>,
}

impl StatusMirror {
    /// Report the initial status and follow later transitions
    pub(crate) fn start(connection: &SharedConnection, output: Arc<dyn NodeOutput>) -> Self {
        let mut states = connection.watch_state();
        let initial = status_for(*states.borrow_and_update()).unwrap_or_else(NodeStatus::disconnected);
        output.status(initial.clone());

        let current = Arc::new(Mutex::new(initial));
        let shown = current.clone();
        let task = tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                let Some(status) = status_for(state) else {
                    continue;
                };
                let mut shown = shown.lock().unwrap_or_else(PoisonError::into_inner);
                if *shown != status {
                    *shown = status.clone();
                    output.status(status);
                }
            }
        });

        Self { current, task }
    }

    pub(crate) fn current(&self) -> NodeStatus {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}

// Only settled states are shown; connecting and closing keep the last status
fn status_for(state: LinkState) -> Option<NodeStatus> {
    match state {
        LinkState::Connected => Some(NodeStatus::connected()),
        LinkState::Disconnected => Some(NodeStatus::disconnected()),
        LinkState::Connecting | LinkState::Closing => None,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::store::memory::{MemoryBroker, MemoryConnector};

    pub(crate) fn memory_pool() -> (Arc<ConnectionPool>, MemoryBroker) {
        let broker = MemoryBroker::new();
        let pool = ConnectionPool::new(Arc::new(MemoryConnector::new(broker.clone())));
        (Arc::new(pool), broker)
    }

    pub(crate) fn output(node: &str) -> (Arc<dyn NodeOutput>, mpsc::UnboundedReceiver<NodeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelOutput::new(node, tx)), rx)
    }

    pub(crate) fn server() -> RawEndpointConfig {
        RawEndpointConfig {
            host: Some("localhost".to_string()),
            port: Some("6379".to_string()),
            ..Default::default()
        }
    }

    pub(crate) async fn next_event(rx: &mut mpsc::UnboundedReceiver<NodeEvent>) -> NodeEventKind {
        tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for node event")
            .expect("node output closed")
            .kind
    }
}
