//! Redis-backed store links
//!
//! Each link runs a supervisor task that keeps one multiplexed command
//! connection alive. The connection counts as up once it answers PING, and
//! is PINGed every `health_check_interval` so a vanished server is noticed
//! without waiting for a command to fail. Subscriptions need a connection of
//! their own (a subscribed Redis connection accepts no other commands), so
//! every subscription runs its own task that resubscribes after a drop.
//!
//! A link reports `Connected` only while the command connection is up and
//! every subscription is live. A subscriber-only link therefore holds two
//! sockets: the command connection stays as its heartbeat and carries QUIT.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    ChannelMessage, LinkState, StoreConnector, StoreError, StoreLink, StoreResult, Subscription,
};
use crate::config::{EndpointConfig, StoreConfig};

/// Opens [`RedisLink`]s
pub struct RedisConnector {
    config: StoreConfig,
}

impl RedisConnector {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl StoreConnector for RedisConnector {
    fn open(&self, endpoint: &EndpointConfig) -> Arc<dyn StoreLink> {
        Arc::new(RedisLink::start(endpoint, &self.config))
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

/// Build the `redis://` URL of an endpoint; the password is percent-encoded
/// and only set when present, likewise the database index.
pub fn connection_url(endpoint: &EndpointConfig) -> StoreResult<Url> {
    let invalid = |what: &str| StoreError::Config(format!("invalid {} for {}", what, endpoint));

    // IPv6 literals must be bracketed in a URL
    let host = if endpoint.host.contains(':') && !endpoint.host.starts_with('[') {
        format!("[{}]", endpoint.host)
    } else {
        endpoint.host.clone()
    };

    let mut url = Url::parse("redis://localhost").map_err(|_| invalid("url"))?;
    url.set_host(Some(&host)).map_err(|_| invalid("host"))?;
    url.set_port(Some(endpoint.port))
        .map_err(|_| invalid("port"))?;
    if let Some(password) = &endpoint.password {
        url.set_password(Some(password))
            .map_err(|_| invalid("password"))?;
    }
    if let Some(db) = endpoint.database {
        url.set_path(&format!("/{}", db));
    }
    Ok(url)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandHealth {
    Down,
    Connecting,
    Up,
}

/// What the link state is derived from
struct Health {
    command: CommandHealth,
    /// Subscriptions currently without a live pub/sub connection
    subscriptions_down: usize,
}

impl Health {
    fn link_state(&self) -> LinkState {
        match self.command {
            CommandHealth::Up if self.subscriptions_down == 0 => LinkState::Connected,
            CommandHealth::Up | CommandHealth::Down => LinkState::Disconnected,
            CommandHealth::Connecting => LinkState::Connecting,
        }
    }
}

struct Shared {
    address: String,
    client: Option<redis::Client>,
    state: watch::Sender<LinkState>,
    health: Mutex<Health>,
    commands: Mutex<Option<MultiplexedConnection>>,
    lost: Notify,
    closed: AtomicBool,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    health_check_interval: Duration,
}

impl Shared {
    fn commands(&self) -> MutexGuard<'_, Option<MultiplexedConnection>> {
        self.commands.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LinkState) {
        if self.closed.load(Ordering::SeqCst) && state != LinkState::Disconnected {
            return;
        }
        let mut previous = state;
        let changed = self.state.send_if_modified(|current| {
            previous = *current;
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!("[redis] {} {} -> {}", self.address, previous, state);
        }
    }

    /// Apply `change` and publish the resulting link state. The state is sent
    /// under the health lock so concurrent updates cannot land out of order.
    fn update_health(&self, change: impl FnOnce(&mut Health)) {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        change(&mut health);
        self.set_state(health.link_state());
    }

    fn set_command_health(&self, command: CommandHealth) {
        self.update_health(|health| health.command = command);
    }

    /// Drop the command connection and wake the supervisor to reconnect
    fn connection_lost(&self) {
        if self.commands().take().is_some() {
            self.set_command_health(CommandHealth::Down);
            self.lost.notify_one();
        }
    }

    async fn ping(&self, connection: &mut MultiplexedConnection) -> StoreResult<()> {
        let reply = tokio::time::timeout(
            self.connect_timeout,
            redis::cmd("PING").query_async::<_, String>(connection),
        )
        .await
        .map_err(|_| StoreError::Command("PING timed out".to_string()))?;
        reply
            .map(|_| ())
            .map_err(|e| StoreError::Command(e.to_string()))
    }

    async fn connect(&self, client: &redis::Client) -> StoreResult<MultiplexedConnection> {
        let mut connection =
            tokio::time::timeout(self.connect_timeout, client.get_multiplexed_tokio_connection())
                .await
                .map_err(|_| {
                    StoreError::NotConnected(format!(
                        "{} (timed out after {:?})",
                        self.address, self.connect_timeout
                    ))
                })?
                .map_err(|e| StoreError::NotConnected(format!("{} ({})", self.address, e)))?;

        self.ping(&mut connection).await?;
        Ok(connection)
    }

    /// Returns once the command connection is gone
    async fn watch_command_connection(&self) {
        loop {
            tokio::select! {
                _ = self.lost.notified() => {
                    // A permit left over from an earlier connection is ignored
                    if self.commands().is_none() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.health_check_interval) => {
                    let Some(mut connection) = self.commands().clone() else {
                        return;
                    };
                    if let Err(e) = self.ping(&mut connection).await {
                        warn!("[redis] {} health check failed: {}", self.address, e);
                        self.commands().take();
                        return;
                    }
                }
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        let Some(client) = self.client.clone() else {
            return;
        };

        while !self.closed.load(Ordering::SeqCst) {
            self.set_command_health(CommandHealth::Connecting);

            match self.connect(&client).await {
                Ok(connection) => {
                    *self.commands() = Some(connection);
                    self.set_command_health(CommandHealth::Up);
                    info!("[redis] connected to {}", self.address);

                    self.watch_command_connection().await;
                    warn!("[redis] lost connection to {}", self.address);
                }
                Err(e) => error!("[redis] {}", e),
            }

            self.set_command_health(CommandHealth::Down);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn pump_subscription(
        self: Arc<Self>,
        channel: String,
        tx: mpsc::UnboundedSender<ChannelMessage>,
    ) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let mut health = SubscriptionHealth::new(self.clone());

        while !self.closed.load(Ordering::SeqCst) && !tx.is_closed() {
            let attempt =
                tokio::time::timeout(self.connect_timeout, client.get_async_connection()).await;

            match attempt {
                Ok(Ok(connection)) => {
                    let mut pubsub = connection.into_pubsub();
                    match pubsub.subscribe(&channel).await {
                        Ok(()) => {
                            health.set_live(true);
                            debug!("[redis] {} subscribed to '{}'", self.address, channel);

                            let mut messages = pubsub.on_message();
                            while let Some(msg) = messages.next().await {
                                let payload = match msg.get_payload::<Vec<u8>>() {
                                    Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                                    Err(e) => {
                                        warn!("[redis] unreadable message on '{}': {}", channel, e);
                                        continue;
                                    }
                                };
                                let message = ChannelMessage {
                                    channel: msg.get_channel_name().to_string(),
                                    payload,
                                };
                                if tx.send(message).is_err() {
                                    return;
                                }
                            }

                            health.set_live(false);
                            warn!("[redis] {} subscription to '{}' dropped", self.address, channel);
                        }
                        Err(e) => {
                            health.set_live(false);
                            error!("[redis] {}: subscribe '{}': {}", self.address, channel, e);
                        }
                    }
                }
                Ok(Err(e)) => {
                    health.set_live(false);
                    error!("[redis] {}: {}", self.address, e);
                }
                Err(_) => {
                    health.set_live(false);
                    error!(
                        "[redis] {}: subscriber connect timed out after {:?}",
                        self.address, self.connect_timeout
                    );
                }
            }

            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

/// A subscription's share of the link health. A new subscription counts as
/// live until an attempt fails, so subscribing does not flicker the status.
/// Dropping the guard (task ended or aborted) withdraws its share.
struct SubscriptionHealth {
    shared: Arc<Shared>,
    down: bool,
}

impl SubscriptionHealth {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            down: false,
        }
    }

    fn set_live(&mut self, live: bool) {
        let down = !live;
        if self.down == down {
            return;
        }
        self.down = down;
        self.shared.update_health(|health| {
            if down {
                health.subscriptions_down += 1;
            } else {
                health.subscriptions_down = health.subscriptions_down.saturating_sub(1);
            }
        });
    }
}

impl Drop for SubscriptionHealth {
    fn drop(&mut self) {
        self.set_live(true);
    }
}

/// One logical Redis connection: a command connection plus one pub/sub
/// connection per subscribed channel
pub struct RedisLink {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RedisLink {
    /// Begin connecting in the background. Must be called within a Tokio runtime.
    pub fn start(endpoint: &EndpointConfig, config: &StoreConfig) -> Self {
        let client = connection_url(endpoint).and_then(|url| {
            redis::Client::open(url.as_str()).map_err(|e| StoreError::Config(e.to_string()))
        });
        let client = match client {
            Ok(client) => Some(client),
            Err(e) => {
                error!("[redis] {}", e);
                None
            }
        };

        let (state, _) = watch::channel(LinkState::Disconnected);
        let shared = Arc::new(Shared {
            address: endpoint.address(),
            client,
            state,
            health: Mutex::new(Health {
                command: CommandHealth::Down,
                subscriptions_down: 0,
            }),
            commands: Mutex::new(None),
            lost: Notify::new(),
            closed: AtomicBool::new(false),
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
            health_check_interval: config.health_check_interval(),
        });

        let supervisor = tokio::spawn(shared.clone().supervise());
        Self {
            shared,
            tasks: Mutex::new(vec![supervisor]),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command_connection(&self) -> StoreResult<MultiplexedConnection> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.shared
            .commands()
            .clone()
            .ok_or_else(|| StoreError::NotConnected(self.shared.address.clone()))
    }

    fn command_failed(&self, e: redis::RedisError) -> StoreError {
        if e.is_io_error() || e.is_connection_dropped() {
            warn!("[redis] {} connection lost: {}", self.shared.address, e);
            self.shared.connection_lost();
        }
        StoreError::Command(e.to_string())
    }
}

#[async_trait]
impl StoreLink for RedisLink {
    fn state(&self) -> LinkState {
        *self.shared.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.shared.state.subscribe()
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        if self.shared.client.is_none() {
            return Err(StoreError::NotConnected(self.shared.address.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.shared.clone().pump_subscription(channel.to_string(), tx));
        self.tasks().push(task);
        Ok(rx)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<u64> {
        let mut connection = self.command_connection()?;
        connection
            .publish::<_, _, u64>(channel, payload)
            .await
            .map_err(|e| self.command_failed(e))
    }

    async fn hget(&self, hash: &str, field: &str) -> StoreResult<Option<String>> {
        let mut connection = self.command_connection()?;
        connection
            .hget::<_, _, Option<String>>(hash, field)
            .await
            .map_err(|e| self.command_failed(e))
    }

    async fn quit(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.state.send_replace(LinkState::Closing);

        for task in self.tasks().drain(..) {
            task.abort();
        }

        let connection = self.shared.commands().take();
        if let Some(mut connection) = connection {
            if let Err(e) = redis::cmd("QUIT").query_async::<_, ()>(&mut connection).await {
                debug!("[redis] QUIT to {} failed: {}", self.shared.address, e);
            }
        }

        self.shared.set_state(LinkState::Disconnected);
        info!("[redis] closed connection to {}", self.shared.address);
    }
}

impl Drop for RedisLink {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for task in self.tasks().drain(..) {
            task.abort();
        }
    }
}
