use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Message exchanged between the host flow and a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMessage {
    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    // Any other message properties travel with the message untouched
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl FlowMessage {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            topic: None,
            properties: Map::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFill {
    Green,
    Red,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusShape {
    Dot,
    Ring,
}

/// Connectivity indicator shown on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub fill: StatusFill,
    pub shape: StatusShape,
    pub text: String,
}

impl NodeStatus {
    pub fn connected() -> Self {
        Self {
            fill: StatusFill::Green,
            shape: StatusShape::Dot,
            text: "connected".to_string(),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            fill: StatusFill::Red,
            shape: StatusShape::Ring,
            text: "disconnected".to_string(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.fill == StatusFill::Green
    }
}

// What a node reports to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodeEventKind {
    Message { msg: FlowMessage },
    Status { status: NodeStatus },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg: Option<FlowMessage>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node: String,
    #[serde(flatten)]
    pub kind: NodeEventKind,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extra_message_properties_are_preserved() {
        let msg: FlowMessage =
            serde_json::from_value(json!({"payload": {"a": 1}, "topic": "t", "_msgid": "42"}))
                .unwrap();

        assert_eq!(msg.payload, json!({"a": 1}));
        assert_eq!(msg.topic.as_deref(), Some("t"));
        assert_eq!(msg.properties.get("_msgid"), Some(&json!("42")));

        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back["_msgid"], json!("42"));
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = NodeEvent {
            node: "sub-1".to_string(),
            kind: NodeEventKind::Status {
                status: NodeStatus::connected(),
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["node"], "sub-1");
        assert_eq!(value["kind"], "status");
        assert_eq!(value["status"]["fill"], "green");
        assert_eq!(value["status"]["text"], "connected");
    }
}
