//! Channel publisher node: publishes each inbound payload as JSON text

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{acquire_for_node, FlowNode, NodeError, NodeOutput, StatusMirror};
use crate::config::RawEndpointConfig;
use crate::models::{FlowMessage, NodeStatus};
use crate::pool::{ConnectionPool, SharedConnection};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherSettings {
    pub name: String,
    /// Name of the endpoint to connect to
    pub server: String,
    pub channel: String,
    /// Share the connection with other nodes using the same scope
    #[serde(default)]
    pub scope: Option<String>,
}

pub struct PublisherNode {
    name: String,
    channel: String,
    pool: Arc<ConnectionPool>,
    connection: SharedConnection,
    output: Arc<dyn NodeOutput>,
    status: StatusMirror,
}

impl PublisherNode {
    pub fn start(
        pool: Arc<ConnectionPool>,
        settings: &PublisherSettings,
        server: &RawEndpointConfig,
        output: Arc<dyn NodeOutput>,
    ) -> Self {
        let connection = acquire_for_node(&pool, server, settings.scope.as_deref());
        let status = StatusMirror::start(&connection, output.clone());

        Self {
            name: settings.name.clone(),
            channel: settings.channel.clone(),
            pool,
            connection,
            output,
            status,
        }
    }

    async fn publish(&self, msg: &FlowMessage) -> Result<u64, NodeError> {
        let payload = serde_json::to_string(&msg.payload)?;
        self.connection
            .publish(&self.channel, &payload)
            .await
            .map_err(|source| NodeError::Publish {
                channel: self.channel.clone(),
                source,
            })
    }
}

#[async_trait]
impl FlowNode for PublisherNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "publisher"
    }

    fn current_status(&self) -> NodeStatus {
        self.status.current()
    }

    /// Failures go to the node's error output; the message is dropped.
    async fn input(&self, msg: FlowMessage) -> crate::Result<()> {
        match self.publish(&msg).await {
            Ok(receivers) => {
                tracing::trace!("'{}' published to {} receiver(s)", self.name, receivers);
            }
            Err(e) => self.output.error(e.to_string(), Some(msg)),
        }
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.status.stop();
        let node = *self;
        node.pool.release(node.connection).await;
    }
}
