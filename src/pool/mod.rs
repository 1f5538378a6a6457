//! Reference-counted registry of shared store connections
//!
//! The pool keeps exactly one physical link per [`ConnectionIdentity`]. Every
//! [`ConnectionPool::acquire`] hands out a [`SharedConnection`] and bumps the
//! identity's reference count; [`ConnectionPool::release`] consumes the handle
//! and closes the link once the last handle for it comes back.
//!
//! The identity includes a caller-chosen scope token. Nodes use a fresh token
//! per instance, so two nodes pointed at the same `host:port` still get
//! separate links; nodes only share a link when they are given the same
//! scope token.
//!
//! Handles are move-only and carry the generation of the entry they were
//! issued from, so a handle can never be released twice and a handle that
//! outlived its entry (see [`ConnectionPool::shutdown`]) cannot decrement the
//! count of a newer entry for the same identity.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::store::{LinkState, StoreConnector, StoreLink, StoreResult, Subscription};

/// Registry key of a pooled connection: `host:port:scope`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    host: String,
    port: u16,
    scope: String,
}

impl ConnectionIdentity {
    pub fn new(endpoint: &EndpointConfig, scope: &str) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            scope: scope.to_string(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.host, self.port, self.scope)
    }
}

struct PoolEntry {
    link: Arc<dyn StoreLink>,
    ref_count: usize,
    generation: u64,
}

/// A lent store connection. Dropping it without [`ConnectionPool::release`]
/// leaks one reference and keeps the link open until pool shutdown.
pub struct SharedConnection {
    identity: ConnectionIdentity,
    generation: u64,
    link: Arc<dyn StoreLink>,
}

impl SharedConnection {
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.identity
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn is_connected(&self) -> bool {
        self.link.state() == LinkState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.link.watch_state()
    }

    pub async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.link.subscribe(channel).await
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        self.link.publish(channel, payload).await
    }

    pub async fn hget(&self, hash: &str, field: &str) -> StoreResult<Option<String>> {
        self.link.hget(hash, field).await
    }

    /// Link used by spawned work that must not hold the handle itself.
    /// The link stays owned by the pool; this never allows closing it.
    pub fn lookup_client(&self) -> LookupClient {
        LookupClient {
            link: self.link.clone(),
        }
    }

    /// Whether both handles share one physical connection
    pub fn same_link(&self, other: &SharedConnection) -> bool {
        Arc::ptr_eq(&self.link, &other.link)
    }
}

impl fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedConnection")
            .field("identity", &self.identity.to_string())
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish()
    }
}

/// Cloneable command access to a pooled link, for in-flight lookups
#[derive(Clone)]
pub struct LookupClient {
    link: Arc<dyn StoreLink>,
}

impl LookupClient {
    pub async fn hget(&self, hash: &str, field: &str) -> StoreResult<Option<String>> {
        self.link.hget(hash, field).await
    }
}

/// Process-wide connection registry, shared by `Arc` with every node
pub struct ConnectionPool {
    connector: Arc<dyn StoreConnector>,
    entries: Mutex<HashMap<ConnectionIdentity, PoolEntry>>,
    next_generation: AtomicU64,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        info!("Connection pool using {} store backend", connector.backend_name());
        Self {
            connector,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ConnectionIdentity, PoolEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lend the connection for `endpoint` scoped by `scope`, opening it on
    /// first use. Connect failures are not returned here: the handle reports
    /// them as state transitions while the transport keeps retrying.
    pub fn acquire(&self, endpoint: &EndpointConfig, scope: &str) -> SharedConnection {
        let identity = ConnectionIdentity::new(endpoint, scope);
        let mut entries = self.entries();

        let entry = entries.entry(identity.clone()).or_insert_with(|| {
            debug!("Opening pooled connection {} ({})", identity, endpoint);
            PoolEntry {
                link: self.connector.open(endpoint),
                ref_count: 0,
                generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            }
        });
        entry.ref_count += 1;
        debug!("Acquired {} (refs: {})", identity, entry.ref_count);

        SharedConnection {
            generation: entry.generation,
            link: entry.link.clone(),
            identity,
        }
    }

    /// Return a handle. The link is closed when this was its last handle.
    pub async fn release(&self, handle: SharedConnection) {
        let closing = {
            let mut entries = self.entries();
            let Some(entry) = entries
                .get_mut(&handle.identity)
                .filter(|entry| entry.generation == handle.generation)
            else {
                warn!(
                    "Ignoring release of {}: connection no longer pooled",
                    handle.identity
                );
                return;
            };

            entry.ref_count = entry.ref_count.saturating_sub(1);
            debug!("Released {} (refs: {})", handle.identity, entry.ref_count);
            if entry.ref_count > 0 {
                return;
            }
            entries.remove(&handle.identity)
        };

        if let Some(entry) = closing {
            debug!("Closing pooled connection {}", handle.identity);
            entry.link.quit().await;
        }
    }

    /// Close every pooled connection regardless of outstanding handles
    pub async fn shutdown(&self) {
        let drained: Vec<(ConnectionIdentity, PoolEntry)> = self.entries().drain().collect();
        if drained.is_empty() {
            return;
        }

        info!("Closing {} pooled connection(s)", drained.len());
        for (identity, entry) in drained {
            if entry.ref_count > 0 {
                warn!("Closing {} with {} handle(s) still out", identity, entry.ref_count);
            }
            entry.link.quit().await;
        }
    }

    /// Number of pooled connections
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, identity: &ConnectionIdentity) -> bool {
        self.entries().contains_key(identity)
    }

    /// Outstanding handles of `identity`, if pooled
    pub fn ref_count(&self, identity: &ConnectionIdentity) -> Option<usize> {
        self.entries().get(identity).map(|entry| entry.ref_count)
    }
}
