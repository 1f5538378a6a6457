//! Channel subscriber node: forwards every message published on a channel

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{acquire_for_node, FlowNode, NodeError, NodeOutput, StatusMirror};
use crate::config::RawEndpointConfig;
use crate::models::{FlowMessage, NodeStatus};
use crate::pool::{ConnectionPool, SharedConnection};
use crate::store::Subscription;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberSettings {
    pub name: String,
    /// Name of the endpoint to connect to
    pub server: String,
    pub channel: String,
    /// Share the connection with other nodes using the same scope
    #[serde(default)]
    pub scope: Option<String>,
}

pub struct SubscriberNode {
    name: String,
    channel: String,
    pool: Arc<ConnectionPool>,
    connection: SharedConnection,
    status: StatusMirror,
    forwarder: Option<JoinHandle<()>>,
}

/// Decode a channel payload as JSON, falling back to the raw text
pub fn decode_payload(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

impl SubscriberNode {
    pub async fn start(
        pool: Arc<ConnectionPool>,
        settings: &SubscriberSettings,
        server: &RawEndpointConfig,
        output: Arc<dyn NodeOutput>,
    ) -> Self {
        let connection = acquire_for_node(&pool, server, settings.scope.as_deref());
        let status = StatusMirror::start(&connection, output.clone());

        let forwarder = match connection.subscribe(&settings.channel).await {
            Ok(messages) => Some(tokio::spawn(forward(messages, output))),
            Err(source) => {
                let err = NodeError::Subscribe {
                    channel: settings.channel.clone(),
                    source,
                };
                output.error(err.to_string(), None);
                None
            }
        };

        debug!(
            "Subscriber '{}' listening on '{}' via {}",
            settings.name,
            settings.channel,
            connection.identity()
        );

        Self {
            name: settings.name.clone(),
            channel: settings.channel.clone(),
            pool,
            connection,
            status,
            forwarder,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

async fn forward(mut messages: Subscription, output: Arc<dyn NodeOutput>) {
    while let Some(message) = messages.recv().await {
        let msg = FlowMessage::new(decode_payload(&message.payload)).with_topic(message.channel);
        output.send(msg);
    }
}

#[async_trait]
impl FlowNode for SubscriberNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "subscriber"
    }

    fn current_status(&self) -> NodeStatus {
        self.status.current()
    }

    async fn input(&self, _msg: FlowMessage) -> crate::Result<()> {
        Err(crate::Error::InputNotAccepted {
            node: self.name.clone(),
        })
    }

    async fn close(self: Box<Self>) {
        self.status.stop();
        if let Some(forwarder) = &self.forwarder {
            forwarder.abort();
        }
        let node = *self;
        node.pool.release(node.connection).await;
    }
}
