//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns one [`RelayConnection`] per relay URL and the agent's
//! signing keys. It is the production [`RelayTransport`]: it fans REQ, CLOSE
//! and EVENT frames out to every connected relay, collects per-relay OK
//! answers, and builds NIP-17 private messages and NIP-59 gift wraps.

use crate::error::{ClientError, Result};
use crate::message::{Filter, RelayMessage};
use crate::relay::{
    ConnectionState, PublishConfirmation, RelayConfig, RelayConnection, RelayNotification,
};
use crate::subscription::generate_subscription_id;
use crate::transport::{PublishOutput, RelayTransport};
use async_trait::async_trait;
use futures::future::join_all;
use nostr::nips::nip04;
use nostr::nips::nip59::UnwrappedGift;
use nostr::{Event, EventBuilder, Keys, PublicKey, Tag, UnsignedEvent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

/// A pool of Nostr relay connections.
pub struct RelayPool {
    /// Connections indexed by the URL they were added with
    relays: RwLock<HashMap<String, Arc<RelayConnection>>>,
    /// Signing identity
    keys: Keys,
    /// Configuration applied to every new connection
    config: RelayConfig,
}

impl RelayPool {
    /// Create a new relay pool.
    pub fn new(keys: Keys) -> Self {
        Self::with_config(keys, RelayConfig::default())
    }

    /// Create a new relay pool with custom per-relay configuration.
    pub fn with_config(keys: Keys, config: RelayConfig) -> Self {
        Self {
            relays: RwLock::new(HashMap::new()),
            keys,
            config,
        }
    }

    async fn snapshot(&self) -> Vec<(String, Arc<RelayConnection>)> {
        self.relays
            .read()
            .await
            .iter()
            .map(|(url, relay)| (url.clone(), Arc::clone(relay)))
            .collect()
    }

    async fn connected(&self) -> Vec<(String, Arc<RelayConnection>)> {
        let mut connected = Vec::new();
        for (url, relay) in self.snapshot().await {
            if relay.is_connected().await {
                connected.push((url, relay));
            }
        }
        connected
    }

    /// Collect stored events from one relay until EOSE.
    async fn fetch_from(
        url: String,
        relay: Arc<RelayConnection>,
        filter: Filter,
        timeout: Duration,
    ) -> Result<Vec<Event>> {
        let subscription_id = generate_subscription_id();
        // Subscribe to the stream before sending REQ so no answer is missed.
        let mut rx = relay.subscribe_messages();
        relay.subscribe(&subscription_id, &[filter]).await?;

        let collect = async {
            let mut events = Vec::new();
            loop {
                match rx.recv().await {
                    Ok(RelayNotification::Message(RelayMessage::Event {
                        subscription_id: id,
                        event,
                    })) if id == subscription_id => events.push(event),
                    Ok(RelayNotification::Message(RelayMessage::Eose { subscription_id: id }))
                        if id == subscription_id =>
                    {
                        return Ok(events);
                    }
                    Ok(RelayNotification::Message(RelayMessage::Closed {
                        subscription_id: id,
                        message,
                    })) if id == subscription_id => {
                        return Err(ClientError::Subscription(format!(
                            "{} closed fetch: {}",
                            url, message
                        )));
                    }
                    Ok(RelayNotification::Disconnected { reason }) => {
                        return Err(ClientError::Connection(format!("{}: {}", url, reason)));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Fetch on {} lagged, skipped {} notifications", url, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(ClientError::NotConnected);
                    }
                }
            }
        };

        let result = match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(format!(
                "{} sent no EOSE within {:?}",
                url, timeout
            ))),
        };

        if let Err(e) = relay.close_subscription(&subscription_id).await {
            debug!("Failed to close fetch subscription on {}: {}", url, e);
        }
        result
    }

    /// Fold per-relay publish results into a single outcome.
    fn summarize(
        event_id: String,
        results: Vec<(String, Result<PublishConfirmation>)>,
    ) -> PublishOutput {
        let mut output = PublishOutput::new(event_id);
        for (url, result) in results {
            match result {
                Ok(confirmation) if confirmation.accepted => {
                    output.success.insert(url);
                }
                Ok(confirmation) => {
                    output
                        .failed
                        .insert(url, format!("rejected: {}", confirmation.message));
                }
                Err(e) => {
                    output.failed.insert(url, e.to_string());
                }
            }
        }
        output
    }
}

#[async_trait]
impl RelayTransport for RelayPool {
    async fn add_relay(&self, url: &str) -> Result<()> {
        let mut relays = self.relays.write().await;
        if relays.contains_key(url) {
            return Ok(());
        }

        let relay = RelayConnection::with_config(url, self.config.clone())?;
        info!("Adding relay to pool: {}", url);
        relays.insert(url.to_string(), Arc::new(relay));
        Ok(())
    }

    async fn connect(&self) -> bool {
        let attempts = self.snapshot().await.into_iter().map(|(url, relay)| async move {
            if relay.state().await != ConnectionState::Disconnected {
                return;
            }
            if let Err(e) = relay.connect().await {
                warn!("Failed to connect to {}: {}", url, e);
            }
        });
        join_all(attempts).await;

        let connected = self.connected_relays().await;
        info!(
            "Connected to {}/{} relays",
            connected.len(),
            self.relays.read().await.len()
        );
        !connected.is_empty()
    }

    async fn disconnect(&self) -> Result<()> {
        for (url, relay) in self.snapshot().await {
            if let Err(e) = relay.disconnect().await {
                warn!("Error disconnecting {}: {}", url, e);
            }
        }
        Ok(())
    }

    async fn relay_urls(&self) -> Vec<String> {
        self.relays.read().await.keys().cloned().collect()
    }

    async fn connected_relays(&self) -> Vec<String> {
        self.connected()
            .await
            .into_iter()
            .map(|(url, _)| url)
            .collect()
    }

    async fn notifications(&self, url: &str) -> Option<broadcast::Receiver<RelayNotification>> {
        self.relays
            .read()
            .await
            .get(url)
            .map(|relay| relay.subscribe_messages())
    }

    async fn subscribe(&self, subscription_id: &str, filter: &Filter) -> Result<()> {
        let connected = self.connected().await;
        if connected.is_empty() {
            return Err(ClientError::NotConnected);
        }

        let mut sent = 0;
        let mut last_error = None;
        for (url, relay) in connected {
            match relay
                .subscribe(subscription_id, std::slice::from_ref(filter))
                .await
            {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("Failed to subscribe {} on {}: {}", subscription_id, url, e);
                    last_error = Some(e);
                }
            }
        }

        match (sent, last_error) {
            (0, Some(e)) => Err(e),
            _ => {
                debug!("Subscription {} sent to {} relays", subscription_id, sent);
                Ok(())
            }
        }
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        for (url, relay) in self.connected().await {
            if let Err(e) = relay.close_subscription(subscription_id).await {
                warn!("Failed to close {} on {}: {}", subscription_id, url, e);
            }
        }
        Ok(())
    }

    async fn publish(&self, event: &Event, timeout: Duration) -> Result<PublishOutput> {
        let connected = self.connected().await;
        if connected.is_empty() {
            return Err(ClientError::NotConnected);
        }

        let event_id = event.id.to_hex();
        let attempts = connected.into_iter().map(|(url, relay)| async move {
            (url, relay.publish_event(event, timeout).await)
        });
        let results = join_all(attempts).await;

        let timed_out = results
            .iter()
            .all(|(_, r)| matches!(r, Err(ClientError::Timeout(_))));
        let output = Self::summarize(event_id, results);

        if output.accepted() {
            info!(
                "Published {} (success: {}, failed: {})",
                output.event_id,
                output.success.len(),
                output.failed.len()
            );
            Ok(output)
        } else if timed_out {
            Err(ClientError::Timeout(format!(
                "no relay confirmed {} within {:?}",
                output.event_id, timeout
            )))
        } else {
            Err(ClientError::PublishFailed(format!(
                "no relay accepted {}: {:?}",
                output.event_id, output.failed
            )))
        }
    }

    async fn fetch(&self, filter: &Filter, timeout: Duration) -> Result<Vec<Event>> {
        let connected = self.connected().await;
        if connected.is_empty() {
            return Err(ClientError::NotConnected);
        }

        let fetches = connected
            .into_iter()
            .map(|(url, relay)| Self::fetch_from(url, relay, filter.clone(), timeout));
        let results = join_all(fetches).await;

        let mut finished = 0;
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        for result in results {
            match result {
                Ok(batch) => {
                    finished += 1;
                    for event in batch {
                        if seen.insert(event.id) {
                            events.push(event);
                        }
                    }
                }
                Err(e) => warn!("Fetch failed: {}", e),
            }
        }

        if finished == 0 {
            return Err(ClientError::Timeout(format!(
                "no relay completed the query within {:?}",
                timeout
            )));
        }
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }

    async fn send_private_msg(
        &self,
        receiver: &PublicKey,
        message: &str,
        timeout: Duration,
    ) -> Result<PublishOutput> {
        let rumor = EventBuilder::private_msg_rumor(*receiver, message)
            .build(self.keys.public_key());
        self.gift_wrap(receiver, rumor, timeout).await
    }

    async fn gift_wrap(
        &self,
        receiver: &PublicKey,
        rumor: UnsignedEvent,
        timeout: Duration,
    ) -> Result<PublishOutput> {
        let wrapped = EventBuilder::gift_wrap(&self.keys, receiver, rumor, Vec::<Tag>::new())
            .await
            .map_err(|e| ClientError::Crypto(e.to_string()))?;
        self.publish(&wrapped, timeout).await
    }

    async fn unwrap_gift_wrap(&self, event: &Event) -> Result<(PublicKey, UnsignedEvent)> {
        let unwrapped = UnwrappedGift::from_gift_wrap(&self.keys, event)
            .await
            .map_err(|e| ClientError::Crypto(e.to_string()))?;
        Ok((unwrapped.sender, unwrapped.rumor))
    }

    fn decrypt_direct_message(&self, event: &Event) -> Result<String> {
        nip04::decrypt(self.keys.secret_key(), &event.pubkey, &event.content)
            .map_err(|e| ClientError::Crypto(e.to_string()))
    }

    fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }
}
