//! Minimal flow host: starts the nodes of a [`FlowConfig`] against one pool,
//! routes inbound messages to them and collects what they report.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{FlowConfig, NodeConfig};
use crate::models::{FlowMessage, NodeEvent};
use crate::nodes::{ChannelOutput, FlowNode, LookupNode, PublisherNode, SubscriberNode};
use crate::pool::ConnectionPool;
use crate::{Error, Result};

/// A message addressed to one node of the flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub node: String,
    #[serde(flatten)]
    pub msg: FlowMessage,
}

pub struct Flow {
    pool: Arc<ConnectionPool>,
    nodes: Vec<Box<dyn FlowNode>>,
    by_name: HashMap<String, usize>,
    events: mpsc::UnboundedReceiver<NodeEvent>,
}

impl Flow {
    /// Validate `config` and start its nodes in declaration order
    pub async fn start(config: &FlowConfig, pool: Arc<ConnectionPool>) -> Result<Self> {
        config.validate()?;

        let (tx, events) = mpsc::unbounded_channel();
        let mut nodes: Vec<Box<dyn FlowNode>> = Vec::with_capacity(config.nodes.len());
        let mut by_name = HashMap::new();

        for node in &config.nodes {
            let server = config
                .endpoint(node.server())
                .ok_or_else(|| Error::Config(format!("unknown endpoint '{}'", node.server())))?;
            let output = Arc::new(ChannelOutput::new(node.name(), tx.clone()));

            let started: Box<dyn FlowNode> = match node {
                NodeConfig::Subscriber(settings) => Box::new(
                    SubscriberNode::start(pool.clone(), settings, server, output).await,
                ),
                NodeConfig::Publisher(settings) => {
                    Box::new(PublisherNode::start(pool.clone(), settings, server, output))
                }
                NodeConfig::Lookup(settings) => {
                    Box::new(LookupNode::start(pool.clone(), settings, server, output))
                }
            };

            by_name.insert(node.name().to_string(), nodes.len());
            nodes.push(started);
        }

        info!(
            "Flow started: {} node(s) on {} pooled connection(s)",
            nodes.len(),
            pool.len()
        );

        Ok(Self {
            pool,
            nodes,
            by_name,
            events,
        })
    }

    pub fn node(&self, name: &str) -> Option<&dyn FlowNode> {
        let index = *self.by_name.get(name)?;
        Some(self.nodes[index].as_ref())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Hand `msg` to the node called `node`
    pub async fn input(&self, node: &str, msg: FlowMessage) -> Result<()> {
        let target = self
            .node(node)
            .ok_or_else(|| Error::UnknownNode(node.to_string()))?;
        target.input(msg).await
    }

    pub async fn dispatch(&self, inbound: InboundMessage) -> Result<()> {
        self.input(&inbound.node, inbound.msg).await
    }

    /// Next event reported by any node
    pub async fn next_event(&mut self) -> Option<NodeEvent> {
        self.events.recv().await
    }

    /// Close every node, last started first, then close whatever the pool
    /// still holds.
    pub async fn stop(self) {
        let count = self.nodes.len();
        for node in self.nodes.into_iter().rev() {
            node.close().await;
        }
        self.pool.shutdown().await;
        info!("Flow stopped ({} node(s))", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeEventKind;
    use crate::store::memory::{MemoryBroker, MemoryConnector};
    use serde_json::json;
    use std::time::Duration;

    const FLOW: &str = r#"
endpoints:
  local:
    host: localhost
    port: 6379
    database: 0
nodes:
  - type: subscriber
    name: sub-a
    server: local
    channel: ch1
  - type: subscriber
    name: sub-b
    server: local
    channel: ch1
  - type: publisher
    name: pub
    server: local
    channel: ch1
"#;

    fn memory_pool() -> (Arc<ConnectionPool>, MemoryBroker) {
        let broker = MemoryBroker::new();
        let pool = ConnectionPool::new(Arc::new(MemoryConnector::new(broker.clone())));
        (Arc::new(pool), broker)
    }

    async fn next_message(flow: &mut Flow) -> NodeEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), flow.next_event())
                .await
                .expect("timed out waiting for a message")
                .expect("flow event channel closed");
            if matches!(event.kind, NodeEventKind::Message { .. }) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_over_separate_connections() {
        let (pool, broker) = memory_pool();
        let config = FlowConfig::from_yaml_str(FLOW).unwrap();
        let mut flow = Flow::start(&config, pool.clone()).await.unwrap();

        assert_eq!(pool.len(), 3);
        assert_eq!(broker.stats().links_opened, 3);

        flow.dispatch(InboundMessage {
            node: "pub".to_string(),
            msg: FlowMessage::new(json!({"a": 1})),
        })
        .await
        .unwrap();

        let mut receivers = Vec::new();
        for _ in 0..2 {
            let event = next_message(&mut flow).await;
            match event.kind {
                NodeEventKind::Message { msg } => assert_eq!(msg.payload, json!({"a": 1})),
                _ => unreachable!(),
            }
            receivers.push(event.node);
        }
        receivers.sort();
        assert_eq!(receivers, vec!["sub-a", "sub-b"]);

        flow.stop().await;
        assert!(pool.is_empty());
        assert_eq!(broker.stats().links_closed, 3);
    }

    #[tokio::test]
    async fn test_input_to_unknown_or_input_less_node() {
        let (pool, _) = memory_pool();
        let config = FlowConfig::from_yaml_str(FLOW).unwrap();
        let flow = Flow::start(&config, pool).await.unwrap();

        let msg = FlowMessage::new(json!(1));
        assert!(matches!(
            flow.input("missing", msg.clone()).await,
            Err(Error::UnknownNode(_))
        ));
        assert!(matches!(
            flow.input("sub-a", msg).await,
            Err(Error::InputNotAccepted { .. })
        ));
        flow.stop().await;
    }

    #[tokio::test]
    async fn test_shared_scope_shares_one_connection() {
        let (pool, broker) = memory_pool();
        let config = FlowConfig::from_yaml_str(
            r#"
endpoints:
  local: {}
nodes:
  - {type: publisher, name: p1, server: local, channel: c, scope: team}
  - {type: lookup, name: l1, server: local, hash: h, key: k, scope: team}
"#,
        )
        .unwrap();

        let flow = Flow::start(&config, pool.clone()).await.unwrap();
        assert_eq!(pool.len(), 1);
        assert_eq!(broker.stats().links_opened, 1);

        flow.stop().await;
        assert_eq!(broker.stats().links_closed, 1);
    }

    #[test]
    fn test_inbound_message_line() {
        let inbound: InboundMessage =
            serde_json::from_str(r#"{"node": "pub", "payload": {"a": 1}, "topic": "x"}"#).unwrap();

        assert_eq!(inbound.node, "pub");
        assert_eq!(inbound.msg.payload, json!({"a": 1}));
        assert_eq!(inbound.msg.topic.as_deref(), Some("x"));
    }
}
