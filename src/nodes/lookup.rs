//! Hash field lookup node
//!
//! For each inbound message whose payload has the configured key, the node
//! looks up `HGET <hash> <payload[key]>` and stores the answer in the payload
//! under `key + postfix` before forwarding the message. Lookups run
//! concurrently and may finish out of order; each one carries its own
//! message.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::{acquire_for_node, FlowNode, NodeOutput, StatusMirror};
use crate::config::RawEndpointConfig;
use crate::models::{FlowMessage, NodeStatus};
use crate::pool::{ConnectionPool, LookupClient, SharedConnection};

pub const DEFAULT_POSTFIX: &str = "Name";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupSettings {
    pub name: String,
    /// Name of the endpoint to connect to
    pub server: String,
    pub hash: String,
    /// Payload property holding the field to look up
    pub key: String,
    /// Appended to `key` to name the result property
    #[serde(default)]
    pub postfix: Option<String>,
    /// Share the connection with other nodes using the same scope
    #[serde(default)]
    pub scope: Option<String>,
}

impl LookupSettings {
    /// Property the lookup result is stored under
    pub fn output_key(&self) -> String {
        let postfix = match self.postfix.as_deref() {
            None | Some("") => DEFAULT_POSTFIX,
            Some(postfix) => postfix,
        };
        format!("{}{}", self.key, postfix)
    }
}

pub struct LookupNode {
    name: String,
    hash: String,
    key: String,
    output_key: String,
    pool: Arc<ConnectionPool>,
    connection: SharedConnection,
    output: Arc<dyn NodeOutput>,
    status: StatusMirror,
}

/// Field to look up for `payload`, if it carries `key`
fn lookup_field(payload: &Value, key: &str) -> Option<String> {
    match payload.as_object()?.get(key)? {
        Value::String(field) => Some(field.clone()),
        other => Some(other.to_string()),
    }
}

async fn resolve(
    client: LookupClient,
    hash: String,
    field: String,
    output_key: String,
    mut msg: FlowMessage,
) -> FlowMessage {
    let value = match client.hget(&hash, &field).await {
        Ok(Some(reply)) => Value::String(reply),
        Ok(None) => Value::Null,
        Err(e) => Value::String(e.to_string()),
    };

    if let Some(payload) = msg.payload.as_object_mut() {
        payload.insert(output_key, value);
    }
    msg
}

impl LookupNode {
    pub fn start(
        pool: Arc<ConnectionPool>,
        settings: &LookupSettings,
        server: &RawEndpointConfig,
        output: Arc<dyn NodeOutput>,
    ) -> Self {
        let connection = acquire_for_node(&pool, server, settings.scope.as_deref());
        let status = StatusMirror::start(&connection, output.clone());

        Self {
            name: settings.name.clone(),
            hash: settings.hash.clone(),
            key: settings.key.clone(),
            output_key: settings.output_key(),
            pool,
            connection,
            output,
            status,
        }
    }
}

#[async_trait]
impl FlowNode for LookupNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "lookup"
    }

    fn current_status(&self) -> NodeStatus {
        self.status.current()
    }

    async fn input(&self, msg: FlowMessage) -> crate::Result<()> {
        let Some(field) = lookup_field(&msg.payload, &self.key) else {
            self.output.send(msg);
            return Ok(());
        };

        let lookup = resolve(
            self.connection.lookup_client(),
            self.hash.clone(),
            field,
            self.output_key.clone(),
            msg,
        );
        let output = self.output.clone();
        tokio::spawn(async move {
            output.send(lookup.await);
        });
        Ok(())
    }

    async fn close(self: Box<Self>) {
        self.status.stop();
        let node = *self;
        node.pool.release(node.connection).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::models::NodeEventKind;
    use serde_json::json;
    use std::time::Duration;

    fn settings(postfix: Option<&str>) -> LookupSettings {
        LookupSettings {
            name: "lookup".to_string(),
            server: "local".to_string(),
            hash: "users".to_string(),
            key: "user".to_string(),
            postfix: postfix.map(str::to_string),
            scope: None,
        }
    }

    async fn next_message(
        events: &mut tokio::sync::mpsc::UnboundedReceiver<crate::models::NodeEvent>,
    ) -> FlowMessage {
        loop {
            match next_event(events).await {
                NodeEventKind::Message { msg } => return msg,
                NodeEventKind::Status { .. } => continue,
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_output_key() {
        assert_eq!(settings(None).output_key(), "userName");
        assert_eq!(settings(Some("")).output_key(), "userName");
        assert_eq!(settings(Some("Label")).output_key(), "userLabel");
    }

    #[test]
    fn test_lookup_field() {
        assert_eq!(lookup_field(&json!({"user": "u1"}), "user").as_deref(), Some("u1"));
        assert_eq!(lookup_field(&json!({"user": 7}), "user").as_deref(), Some("7"));
        assert_eq!(lookup_field(&json!({"other": "u1"}), "user"), None);
        assert_eq!(lookup_field(&json!("user"), "user"), None);
    }

    #[tokio::test]
    async fn test_attaches_lookup_result() {
        let (pool, broker) = memory_pool();
        broker.hset("users", "u1", "Alice");
        let (output, mut events) = output("lookup");
        let node = LookupNode::start(pool, &settings(None), &server(), output);

        node.input(FlowMessage::new(json!({"user": "u1"}))).await.unwrap();

        let msg = next_message(&mut events).await;
        assert_eq!(msg.payload, json!({"user": "u1", "userName": "Alice"}));
    }

    #[tokio::test]
    async fn test_missing_field_attaches_null() {
        let (pool, broker) = memory_pool();
        let (output, mut events) = output("lookup");
        let node = LookupNode::start(pool, &settings(Some("Label")), &server(), output);

        node.input(FlowMessage::new(json!({"user": "nobody"}))).await.unwrap();

        let msg = next_message(&mut events).await;
        assert_eq!(msg.payload, json!({"user": "nobody", "userLabel": null}));
        assert_eq!(broker.stats().lookups, 1);
    }

    #[tokio::test]
    async fn test_payload_without_key_passes_through_untouched() {
        let (pool, broker) = memory_pool();
        let (output, mut events) = output("lookup");
        let node = LookupNode::start(pool, &settings(None), &server(), output);

        let msg = FlowMessage::new(json!({"id": 3})).with_topic("t");
        node.input(msg.clone()).await.unwrap();

        assert_eq!(next_message(&mut events).await, msg);
        assert_eq!(broker.stats().lookups, 0);
    }

    #[tokio::test]
    async fn test_lookup_error_is_attached_and_forwarded() {
        let (pool, broker) = memory_pool();
        broker.set_available(false);
        let (output, mut events) = output("lookup");
        let node = LookupNode::start(pool, &settings(None), &server(), output);

        node.input(FlowMessage::new(json!({"user": "u1"}))).await.unwrap();

        let msg = next_message(&mut events).await;
        let attached = msg.payload["userName"].as_str().unwrap();
        assert!(attached.contains("Not connected"));
    }

    #[tokio::test]
    async fn test_concurrent_lookups_keep_their_own_messages() {
        let (pool, broker) = memory_pool();
        broker.hset("users", "slow", "Sloane");
        broker.hset("users", "fast", "Fay");
        broker.delay_lookup("users", "slow", Duration::from_millis(200));

        let (output, mut events) = output("lookup");
        let node = LookupNode::start(pool, &settings(None), &server(), output);

        node.input(FlowMessage::new(json!({"user": "slow", "seq": 1}))).await.unwrap();
        node.input(FlowMessage::new(json!({"user": "fast", "seq": 2}))).await.unwrap();

        let first = next_message(&mut events).await;
        let second = next_message(&mut events).await;

        assert_eq!(first.payload, json!({"user": "fast", "seq": 2, "userName": "Fay"}));
        assert_eq!(second.payload, json!({"user": "slow", "seq": 1, "userName": "Sloane"}));
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let (pool, broker) = memory_pool();
        let (output, _events) = output("lookup");
        let node = LookupNode::start(pool.clone(), &settings(None), &server(), output);
        assert_eq!(pool.len(), 1);

        Box::new(node).close().await;

        assert!(pool.is_empty());
        assert_eq!(broker.stats().links_closed, 1);
    }
}
