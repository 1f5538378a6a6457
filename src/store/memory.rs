//! In-process store backend
//!
//! [`MemoryBroker`] plays the part of a store server: it keeps hashes, fans
//! published messages out to subscribers and can be taken offline to
//! exercise reconnect handling. Every [`MemoryLink`] opened against the same
//! broker sees the same data, whatever endpoint it was opened for.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use super::{
    ChannelMessage, LinkState, StoreConnector, StoreError, StoreLink, StoreResult, Subscription,
};
use crate::config::EndpointConfig;

/// Counters of what the broker has been asked to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub links_opened: u64,
    pub links_closed: u64,
    pub subscribes: u64,
    pub publishes: u64,
    pub lookups: u64,
}

impl BrokerStats {
    /// Links opened and not yet closed
    pub fn open_links(&self) -> u64 {
        self.links_opened - self.links_closed
    }
}

#[derive(Default)]
struct BrokerState {
    available: bool,
    hashes: HashMap<String, HashMap<String, String>>,
    lookup_delays: HashMap<(String, String), Duration>,
    channels: HashMap<String, Vec<(u64, mpsc::UnboundedSender<ChannelMessage>)>>,
    links: Vec<(u64, Weak<watch::Sender<LinkState>>)>,
    stats: BrokerStats,
}

/// Shared in-memory store; clones refer to the same broker
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_link_id: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                available: true,
                ..Default::default()
            })),
            next_link_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// HSET `field` of `hash`
    pub fn hset(&self, hash: &str, field: &str, value: &str) {
        self.lock()
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    /// Make lookups of `hash`/`field` take `delay` before answering
    pub fn delay_lookup(&self, hash: &str, field: &str, delay: Duration) {
        self.lock()
            .lookup_delays
            .insert((hash.to_string(), field.to_string()), delay);
    }

    /// Take the broker offline or bring it back; every open link follows.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.available = available;
        state.links.retain(|(_, link)| link.strong_count() > 0);

        let next = if available {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        for link in state.links.iter().filter_map(|(_, link)| link.upgrade()) {
            let current = *link.borrow();
            if matches!(current, LinkState::Connected | LinkState::Disconnected) {
                link.send_replace(next);
            }
        }
        debug!("Memory broker {}", if available { "online" } else { "offline" });
    }

    pub fn is_available(&self) -> bool {
        self.lock().available
    }

    /// Deliver `payload` to every subscriber of `channel`
    pub fn publish(&self, channel: &str, payload: &str) -> u64 {
        let mut state = self.lock();
        state.stats.publishes += 1;

        let Some(subscribers) = state.channels.get_mut(channel) else {
            return 0;
        };

        let message = ChannelMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        subscribers.retain(|(_, tx)| tx.send(message.clone()).is_ok());
        subscribers.len() as u64
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats
    }

    fn register_link(&self, state_tx: &Arc<watch::Sender<LinkState>>) -> u64 {
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.lock();
        state.stats.links_opened += 1;
        state.links.push((id, Arc::downgrade(state_tx)));
        id
    }

    fn subscribe(&self, link_id: u64, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.stats.subscribes += 1;
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .push((link_id, tx));
        rx
    }

    async fn hget(&self, hash: &str, field: &str) -> Option<String> {
        let delay = {
            let mut state = self.lock();
            state.stats.lookups += 1;
            state
                .lookup_delays
                .get(&(hash.to_string(), field.to_string()))
                .copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.lock()
            .hashes
            .get(hash)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    fn close_link(&self, link_id: u64) {
        let mut state = self.lock();
        state.stats.links_closed += 1;
        state.links.retain(|(id, _)| *id != link_id);
        for subscribers in state.channels.values_mut() {
            subscribers.retain(|(id, _)| *id != link_id);
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection to a [`MemoryBroker`]
pub struct MemoryLink {
    id: u64,
    address: String,
    broker: MemoryBroker,
    state: Arc<watch::Sender<LinkState>>,
    closed: AtomicBool,
}

impl MemoryLink {
    fn ready(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if *self.state.borrow() != LinkState::Connected {
            return Err(StoreError::NotConnected(self.address.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreLink for MemoryLink {
    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        // Like a real client, a subscription made while offline takes effect
        // once the link is back.
        Ok(self.broker.subscribe(self.id, channel))
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        self.ready()?;
        Ok(self.broker.publish(channel, payload))
    }

    async fn hget(&self, hash: &str, field: &str) -> StoreResult<Option<String>> {
        self.ready()?;
        Ok(self.broker.hget(hash, field).await)
    }

    async fn quit(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.send_replace(LinkState::Closing);
        self.broker.close_link(self.id);
        self.state.send_replace(LinkState::Disconnected);
        debug!("Memory link {} to {} closed", self.id, self.address);
    }
}

/// Opens [`MemoryLink`]s against one shared broker
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

impl StoreConnector for MemoryConnector {
    fn open(&self, endpoint: &EndpointConfig) -> Arc<dyn StoreLink> {
        let initial = if self.broker.is_available() {
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        let (state, _) = watch::channel(initial);
        let state = Arc::new(state);
        let id = self.broker.register_link(&state);

        debug!("Memory link {} opened for {}", id, endpoint);
        Arc::new(MemoryLink {
            id,
            address: endpoint.address(),
            broker: self.broker.clone(),
            state,
            closed: AtomicBool::new(false),
        })
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(connector: &MemoryConnector) -> Arc<dyn StoreLink> {
        connector.open(&EndpointConfig::default())
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let connector = MemoryConnector::new(MemoryBroker::new());
        let sub = open(&connector);
        let publisher = open(&connector);

        let mut messages = sub.subscribe("ch1").await.unwrap();
        assert_eq!(publisher.publish("ch1", "one").await.unwrap(), 1);
        assert_eq!(publisher.publish("ch1", "two").await.unwrap(), 1);
        assert_eq!(publisher.publish("other", "x").await.unwrap(), 0);

        assert_eq!(messages.recv().await.unwrap().payload, "one");
        assert_eq!(messages.recv().await.unwrap().payload, "two");
    }

    #[tokio::test]
    async fn test_hget() {
        let broker = MemoryBroker::new();
        broker.hset("users", "u1", "Alice");
        let link = open(&MemoryConnector::new(broker.clone()));

        assert_eq!(link.hget("users", "u1").await.unwrap().as_deref(), Some("Alice"));
        assert_eq!(link.hget("users", "u2").await.unwrap(), None);
        assert_eq!(broker.stats().lookups, 2);
    }

    #[tokio::test]
    async fn test_offline_broker_rejects_commands() {
        let broker = MemoryBroker::new();
        let link = open(&MemoryConnector::new(broker.clone()));
        let mut state = link.watch_state();

        broker.set_available(false);
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), LinkState::Disconnected);
        assert!(matches!(
            link.publish("ch", "x").await,
            Err(StoreError::NotConnected(_))
        ));

        broker.set_available(true);
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), LinkState::Connected);
        assert!(link.publish("ch", "x").await.is_ok());
    }

    #[tokio::test]
    async fn test_quit_ends_subscriptions() {
        let broker = MemoryBroker::new();
        let link = open(&MemoryConnector::new(broker.clone()));
        let mut messages = link.subscribe("ch").await.unwrap();

        link.quit().await;
        link.quit().await;

        assert!(messages.recv().await.is_none());
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(matches!(link.hget("h", "f").await, Err(StoreError::Closed)));
        assert_eq!(broker.stats().links_closed, 1);
        assert_eq!(broker.stats().open_links(), 0);
    }
}
