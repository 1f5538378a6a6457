//! Flow definitions: named store endpoints and the nodes using them

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use super::RawEndpointConfig;
use crate::nodes::{LookupSettings, PublisherSettings, SubscriberSettings};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Store endpoints by name, as the host stores them
    #[serde(default)]
    pub endpoints: BTreeMap<String, RawEndpointConfig>,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeConfig {
    Subscriber(SubscriberSettings),
    Publisher(PublisherSettings),
    Lookup(LookupSettings),
}

impl NodeConfig {
    pub fn name(&self) -> &str {
        match self {
            NodeConfig::Subscriber(s) => &s.name,
            NodeConfig::Publisher(s) => &s.name,
            NodeConfig::Lookup(s) => &s.name,
        }
    }

    pub fn server(&self) -> &str {
        match self {
            NodeConfig::Subscriber(s) => &s.server,
            NodeConfig::Publisher(s) => &s.server,
            NodeConfig::Lookup(s) => &s.server,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            NodeConfig::Subscriber(_) => "subscriber",
            NodeConfig::Publisher(_) => "publisher",
            NodeConfig::Lookup(_) => "lookup",
        }
    }
}

impl FlowConfig {
    /// Load a flow from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read flow file: {}", path.as_ref().display()))?;

        Self::from_yaml_str(&contents)
            .with_context(|| format!("Failed to parse flow file: {}", path.as_ref().display()))
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn endpoint(&self, name: &str) -> Option<&RawEndpointConfig> {
        self.endpoints.get(name)
    }

    /// Check names and references. Endpoint field values are not checked:
    /// those are sanitized when a node starts.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for node in &self.nodes {
            if node.name().is_empty() {
                return Err(Error::Config(format!("a {} node has no name", node.kind())));
            }
            if !names.insert(node.name()) {
                return Err(Error::Config(format!("duplicate node name '{}'", node.name())));
            }
            if self.endpoint(node.server()).is_none() {
                return Err(Error::Config(format!(
                    "node '{}' uses unknown endpoint '{}'",
                    node.name(),
                    node.server()
                )));
            }

            let missing = match node {
                NodeConfig::Subscriber(s) if s.channel.is_empty() => Some("channel"),
                NodeConfig::Publisher(s) if s.channel.is_empty() => Some("channel"),
                NodeConfig::Lookup(s) if s.hash.is_empty() => Some("hash"),
                NodeConfig::Lookup(s) if s.key.is_empty() => Some("key"),
                _ => None,
            };
            if let Some(field) = missing {
                return Err(Error::Config(format!(
                    "node '{}' has no {}",
                    node.name(),
                    field
                )));
            }
        }

        Ok(())
    }
}
