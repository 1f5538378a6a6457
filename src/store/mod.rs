//! Store transport abstractions
//!
//! A [`StoreLink`] is one physical connection to the key-value store. The
//! pool owns links and lends them to nodes; only the pool calls
//! [`StoreLink::quit`]. Links reconnect on their own after transport errors
//! and report every transition on a watch channel, so any number of
//! observers can follow the state without a listener cap.

pub mod memory;

#[cfg(feature = "redis-support")]
pub mod redis_link;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::{EndpointConfig, StoreBackend, StoreConfig};

/// Lifecycle of a physical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Error types for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Connection closed")]
    Closed,

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A message delivered on a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// Receiving end of a channel subscription; messages arrive in store order
pub type Subscription = mpsc::UnboundedReceiver<ChannelMessage>;

/// One physical connection to the store
#[async_trait]
pub trait StoreLink: Send + Sync {
    /// Current lifecycle state
    fn state(&self) -> LinkState;

    /// Observe lifecycle transitions
    fn watch_state(&self) -> watch::Receiver<LinkState>;

    /// Start receiving messages published on `channel`
    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription>;

    /// PUBLISH `payload` on `channel`, returning the number of receivers
    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64>;

    /// HGET `field` from `hash`
    async fn hget(&self, hash: &str, field: &str) -> StoreResult<Option<String>>;

    /// Stop reconnecting and close the connection gracefully
    async fn quit(&self);
}

/// Opens physical connections for the pool
pub trait StoreConnector: Send + Sync {
    /// Open a link to `endpoint`. Connecting happens in the background:
    /// the link is returned at once and reports `Connected` when ready.
    fn open(&self, endpoint: &EndpointConfig) -> Arc<dyn StoreLink>;

    fn backend_name(&self) -> &'static str;
}

/// Create the connector selected by configuration
pub fn connector_for(config: &StoreConfig) -> crate::Result<Arc<dyn StoreConnector>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(memory::MemoryConnector::new(
            memory::MemoryBroker::new(),
        ))),
        #[cfg(feature = "redis-support")]
        StoreBackend::Redis => Ok(Arc::new(redis_link::RedisConnector::new(config))),
        #[cfg(not(feature = "redis-support"))]
        StoreBackend::Redis => Err(crate::Error::Config(
            "Redis store backend configured but redis-support feature not enabled".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_backend_selection() {
        let config = StoreConfig {
            backend: StoreBackend::Memory,
            ..Default::default()
        };

        let connector = connector_for(&config).unwrap();
        assert_eq!(connector.backend_name(), "memory");
    }
}
