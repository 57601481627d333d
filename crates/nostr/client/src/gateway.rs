//! Agent-facing gateway to a set of relays.
//!
//! [`RelayGateway`] owns the transport, the subscription registry, the
//! connection health flag, one listener task per relay and the reconnect
//! supervisor. Agents only ever talk to the gateway.

use crate::error::{ClientError, Result};
use crate::health::{ConnectionHealth, HealthState};
use crate::message::Filter;
use crate::pool::RelayPool;
use crate::relay::{RelayConfig, RelayNotification};
use crate::router::NotificationRouter;
use crate::subscription::{
    EventHandler, RegisteredSubscription, SubscriptionRegistry, generate_subscription_id,
};
use crate::supervisor::{ReconnectSupervisor, Reconnectable};
use crate::transport::{EventVerifier, PublishOutput, RelayTransport, SignatureVerifier};
use async_trait::async_trait;
use nostr::{Event, EventBuilder, Keys, PublicKey, UnsignedEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Relays used when `connect` is called without any
    pub relays: Vec<String>,
    /// Start a reconnect supervisor after the first successful connect
    pub auto_reconnect: bool,
    /// How often the supervisor checks connection health
    pub reconnect_interval: Duration,
    /// How long to wait for relay OK answers when publishing
    pub publish_timeout: Duration,
    /// Per-relay settings
    pub relay: RelayConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            auto_reconnect: true,
            reconnect_interval: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(10),
            relay: RelayConfig::default(),
        }
    }
}

/// Outcome of [`RelayGateway::publish`].
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Private message delivered to the recipient
    pub direct: PublishOutput,
    /// Self-addressed archive copy, `None` if it could not be stored
    pub archive: Option<PublishOutput>,
}

/// Listener task draining one relay's notification stream.
struct Listener {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Listener {
    fn spawn(
        url: String,
        mut notifications: broadcast::Receiver<RelayNotification>,
        router: Arc<NotificationRouter>,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            debug!("Listener started for {}", url);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    received = notifications.recv() => match received {
                        Ok(notification) => router.on_notification(&url, notification).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Listener for {} lagged, skipped {} notifications", url, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("Listener stopped for {}", url);
        });

        Self { shutdown, handle }
    }

    async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            warn!("Listener task panicked: {}", e);
        }
    }
}

struct GatewayInner {
    transport: Arc<dyn RelayTransport>,
    registry: Arc<SubscriptionRegistry>,
    health: Arc<ConnectionHealth>,
    router: Arc<NotificationRouter>,
    config: GatewayConfig,
    relays: RwLock<Vec<String>>,
    auto_reconnect: AtomicBool,
    supervisor: Mutex<Option<ReconnectSupervisor>>,
    listeners: Mutex<HashMap<String, Listener>>,
    /// Held for the whole of a reconnect-and-replay cycle
    recovery: Mutex<()>,
}

impl GatewayInner {
    /// Add remembered relays, open links and refresh health.
    async fn connect_links(&self) -> bool {
        let relays = self.relays.read().await.clone();
        for url in &relays {
            if let Err(e) = self.transport.add_relay(url).await {
                warn!("Skipping relay {}: {}", url, e);
            }
        }
        // Listen before connecting so the first frames are not missed.
        self.ensure_listeners().await;

        if !self.transport.connect().await {
            warn!("No relay reachable out of {}", relays.len());
            self.health.mark_disconnected("no relay reachable").await;
            return false;
        }

        self.health
            .mark_connected(self.transport.connected_relays().await)
            .await;
        true
    }

    /// Open links. When the connection was down, also replay every
    /// registered subscription, whoever asked for the reconnect.
    async fn establish(&self) -> bool {
        let _cycle = self.recovery.lock().await;
        if self.health.is_connected().await {
            return self.connect_links().await;
        }
        ReconnectSupervisor::recover(self).await.is_some()
    }

    /// Make sure every relay in the transport has exactly one live listener.
    async fn ensure_listeners(&self) {
        let mut listeners = self.listeners.lock().await;
        for url in self.transport.relay_urls().await {
            if listeners
                .get(&url)
                .is_some_and(|listener| !listener.handle.is_finished())
            {
                continue;
            }
            let Some(notifications) = self.transport.notifications(&url).await else {
                continue;
            };
            let listener = Listener::spawn(url.clone(), notifications, Arc::clone(&self.router));
            listeners.insert(url, listener);
        }
    }
}

#[async_trait]
impl Reconnectable for GatewayInner {
    fn auto_reconnect(&self) -> bool {
        self.auto_reconnect.load(Ordering::SeqCst)
    }

    async fn is_healthy(&self) -> bool {
        self.health.is_connected().await
    }

    async fn reconnect(&self) -> bool {
        self.connect_links().await
    }

    async fn registered(&self) -> Vec<RegisteredSubscription> {
        self.registry.snapshot().await
    }

    async fn resubscribe(&self, entry: &RegisteredSubscription) -> Result<String> {
        let subscription_id = generate_subscription_id();
        // The gateway always registers with an id, so None means the entry is gone.
        let Some(previous) = self
            .registry
            .reassign(entry.key, subscription_id.clone())
            .await
        else {
            return Err(ClientError::Subscription(format!(
                "subscription {} is no longer registered",
                entry.key
            )));
        };

        if let Err(e) = self.transport.unsubscribe(&previous).await {
            debug!("Failed to close stale subscription {}: {}", previous, e);
        }
        self.transport
            .subscribe(&subscription_id, &entry.filter)
            .await?;
        Ok(subscription_id)
    }

    async fn restore(&self) -> bool {
        self.establish().await
    }
}

impl Drop for GatewayInner {
    fn drop(&mut self) {
        for listener in self.listeners.get_mut().values() {
            let _ = listener.shutdown.send(true);
        }
    }
}

/// Connects an agent to a set of relays.
///
/// Cloning is cheap; clones share the same connections and subscriptions.
#[derive(Clone)]
pub struct RelayGateway {
    inner: Arc<GatewayInner>,
}

impl RelayGateway {
    /// Create a gateway backed by a [`RelayPool`] signing with `keys`.
    pub fn new(keys: Keys, config: GatewayConfig) -> Self {
        let transport = Arc::new(RelayPool::with_config(keys, config.relay.clone()));
        Self::with_transport(transport, Arc::new(SignatureVerifier), config)
    }

    /// Create a gateway with an explicit transport and verifier.
    pub fn with_transport(
        transport: Arc<dyn RelayTransport>,
        verifier: Arc<dyn EventVerifier>,
        config: GatewayConfig,
    ) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new());
        let health = Arc::new(ConnectionHealth::new());
        let router = Arc::new(NotificationRouter::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            verifier,
        ));

        Self {
            inner: Arc::new(GatewayInner {
                transport,
                registry,
                health,
                router,
                relays: RwLock::new(config.relays.clone()),
                auto_reconnect: AtomicBool::new(config.auto_reconnect),
                supervisor: Mutex::new(None),
                listeners: Mutex::new(HashMap::new()),
                recovery: Mutex::new(()),
                config,
            }),
        }
    }

    /// Connect to `relays` in addition to the ones already known.
    ///
    /// Returns true when at least one relay is reachable. Relays that fail
    /// are logged and retried by the supervisor. Coming back from a lost
    /// connection replays every registered subscription.
    pub async fn connect(&self, relays: &[String]) -> bool {
        {
            let mut known = self.inner.relays.write().await;
            for url in relays {
                if !known.contains(url) {
                    known.push(url.clone());
                }
            }
        }

        let connected = self.inner.establish().await;
        if connected && self.inner.auto_reconnect() {
            self.start_supervisor().await;
        }
        connected
    }

    async fn start_supervisor(&self) {
        let mut slot = self.inner.supervisor.lock().await;
        if slot.as_ref().is_some_and(|s| !s.is_finished()) {
            return;
        }
        let target: Weak<GatewayInner> = Arc::downgrade(&self.inner);
        *slot = Some(ReconnectSupervisor::spawn(
            target,
            self.inner.config.reconnect_interval,
        ));
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.inner.health.is_connected().await || self.connect(&[]).await {
            Ok(())
        } else {
            Err(ClientError::Connection(
                "unable to reach any relay".to_string(),
            ))
        }
    }

    /// Subscribe with an optional filter and handler. Returns the subscription id.
    ///
    /// Connects first if needed. A missing filter subscribes to everything.
    pub async fn subscribe(
        &self,
        filter: Option<Filter>,
        handler: Option<EventHandler>,
    ) -> Result<String> {
        self.ensure_connected().await?;

        let filter = filter.unwrap_or_else(|| {
            warn!("Subscribing without a filter, every event will be delivered");
            Filter::new()
        });

        let subscription_id = generate_subscription_id();
        self.inner
            .registry
            .register(filter.clone(), handler, Some(subscription_id.clone()))
            .await;
        self.inner.ensure_listeners().await;

        if let Err(e) = self
            .inner
            .transport
            .subscribe(&subscription_id, &filter)
            .await
        {
            warn!("Subscribe {} failed: {}", subscription_id, e);
            self.inner
                .health
                .mark_disconnected("subscribe failed")
                .await;
            return Err(e);
        }

        info!("Subscribed {}", subscription_id);
        Ok(subscription_id)
    }

    /// Forget a subscription and close it on every relay.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        if self.inner.registry.remove(subscription_id).await == 0 {
            return Err(ClientError::Subscription(format!(
                "unknown subscription {}",
                subscription_id
            )));
        }
        if let Err(e) = self.inner.transport.unsubscribe(subscription_id).await {
            warn!("Failed to close {}: {}", subscription_id, e);
        }
        info!("Unsubscribed {}", subscription_id);
        Ok(())
    }

    /// Send a private message to `recipient` and keep an archive copy.
    ///
    /// The archive copy is gift-wrapped to the gateway's own key. Its failure
    /// shows up as `archive: None` and never fails the call. Waits
    /// `GatewayConfig::publish_timeout` for relay answers.
    pub async fn publish(&self, recipient: &PublicKey, plaintext: &str) -> Result<DeliveryReceipt> {
        self.publish_with_timeout(recipient, plaintext, self.inner.config.publish_timeout)
            .await
    }

    /// [`publish`](Self::publish) with an explicit deadline for relay answers.
    pub async fn publish_with_timeout(
        &self,
        recipient: &PublicKey,
        plaintext: &str,
        timeout: Duration,
    ) -> Result<DeliveryReceipt> {
        self.ensure_connected().await?;
        let transport = &self.inner.transport;

        let direct = transport
            .send_private_msg(recipient, plaintext, timeout)
            .await?;

        let own = transport.public_key();
        let rumor = EventBuilder::private_msg_rumor(*recipient, plaintext).build(own);
        let archive = match transport.gift_wrap(&own, rumor, timeout).await {
            Ok(output) => Some(output),
            Err(e) => {
                warn!("Archive copy of {} not stored: {}", direct.event_id, e);
                None
            }
        };

        Ok(DeliveryReceipt { direct, archive })
    }

    /// Query stored events once. Events that fail verification are dropped.
    pub async fn fetch(&self, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        self.ensure_connected().await?;
        let mut events = self.inner.transport.fetch(filter, timeout).await?;
        let verifier = self.inner.router.verifier();
        events.retain(|event| match verifier.verify(event) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping fetched event: {}", e);
                false
            }
        });
        Ok(events)
    }

    /// Unwrap a gift wrap addressed to this gateway's key.
    pub async fn unwrap_gift_wrap(&self, event: &Event) -> Result<(PublicKey, UnsignedEvent)> {
        self.inner.transport.unwrap_gift_wrap(event).await
    }

    /// Decrypt a legacy direct message addressed to this gateway's key.
    pub fn decrypt_direct_message(&self, event: &Event) -> Result<String> {
        self.inner.transport.decrypt_direct_message(event)
    }

    /// Tear everything down. Safe to call repeatedly.
    ///
    /// Once this returns no handler runs again. Must not be awaited from
    /// inside a handler, since it waits for the listener running it.
    pub async fn disconnect(&self) {
        self.inner.auto_reconnect.store(false, Ordering::SeqCst);

        let supervisor = self.inner.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }

        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .await
            .drain()
            .map(|(_, listener)| listener)
            .collect();
        for listener in listeners {
            listener.shutdown().await;
        }

        let dropped = self.inner.registry.clear().await;
        self.inner
            .health
            .mark_disconnected("disconnect requested")
            .await;

        if let Err(e) = self.inner.transport.disconnect().await {
            warn!("Error while closing relays: {}", e);
        }
        info!("Gateway disconnected ({} subscriptions dropped)", dropped);
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.health.is_connected().await
    }

    pub async fn health_state(&self) -> HealthState {
        self.inner.health.state().await
    }

    /// Current subscription ids in registration order.
    pub async fn subscription_ids(&self) -> Vec<String> {
        self.inner.registry.subscription_ids().await
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.transport.public_key()
    }

    /// Relays the gateway will connect and reconnect to.
    pub async fn relays(&self) -> Vec<String> {
        self.inner.relays.read().await.clone()
    }

    /// Turn automatic reconnection on or off.
    ///
    /// Turning it on starts a supervisor if none is running, which then
    /// restores the remembered relays when the connection is down.
    pub async fn set_auto_reconnect(&self, enabled: bool) {
        self.inner.auto_reconnect.store(enabled, Ordering::SeqCst);
        if enabled {
            self.start_supervisor().await;
        }
    }
}
