//! Seams between the gateway and the protocol capability.
//!
//! The gateway never touches sockets or keys directly. It drives a
//! [`RelayTransport`] (relay set management, REQ/CLOSE, publishing, gift
//! wrapping) and checks inbound events through an [`EventVerifier`].
//! [`crate::RelayPool`] is the production transport; tests substitute
//! in-memory fakes.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use crate::relay::RelayNotification;
use async_trait::async_trait;
use nostr::{Event, PublicKey, UnsignedEvent};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::broadcast;

/// Per-relay outcome of a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutput {
    /// Id of the event that was sent
    pub event_id: String,
    /// Relays that accepted the event
    pub success: HashSet<String>,
    /// Relays that rejected it or failed, with the reason
    pub failed: HashMap<String, String>,
}

impl PublishOutput {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            ..Default::default()
        }
    }

    /// True when at least one relay accepted the event.
    pub fn accepted(&self) -> bool {
        !self.success.is_empty()
    }
}

/// Relay-facing half of the protocol capability.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Add a relay to the set. Adding a known relay is a no-op.
    async fn add_relay(&self, url: &str) -> Result<()>;

    /// Open every disconnected relay. Returns true when at least one link is up.
    async fn connect(&self) -> bool;

    /// Close every link.
    async fn disconnect(&self) -> Result<()>;

    /// URLs of all relays in the set.
    async fn relay_urls(&self) -> Vec<String>;

    /// URLs of relays whose link is currently up.
    async fn connected_relays(&self) -> Vec<String>;

    /// Notification stream of one relay, if it is in the set.
    async fn notifications(&self, url: &str) -> Option<broadcast::Receiver<RelayNotification>>;

    /// Send REQ with the given id to every connected relay.
    async fn subscribe(&self, subscription_id: &str, filter: &Filter) -> Result<()>;

    /// Send CLOSE for the given id to every connected relay.
    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;

    /// Publish a signed event and collect per-relay acknowledgements.
    async fn publish(&self, event: &Event, timeout: Duration) -> Result<PublishOutput>;

    /// Collect stored events matching a filter until every relay reports EOSE.
    async fn fetch(&self, filter: &Filter, timeout: Duration) -> Result<Vec<Event>>;

    /// Send a NIP-17 private message to a receiver.
    async fn send_private_msg(
        &self,
        receiver: &PublicKey,
        message: &str,
        timeout: Duration,
    ) -> Result<PublishOutput>;

    /// Seal an unsigned rumor for a receiver (NIP-59) and publish it.
    async fn gift_wrap(
        &self,
        receiver: &PublicKey,
        rumor: UnsignedEvent,
        timeout: Duration,
    ) -> Result<PublishOutput>;

    /// Unwrap a gift wrap addressed to the local key. Returns sender and rumor.
    async fn unwrap_gift_wrap(&self, event: &Event) -> Result<(PublicKey, UnsignedEvent)>;

    /// Decrypt the content of a legacy NIP-04 direct message sent to the local key.
    fn decrypt_direct_message(&self, event: &Event) -> Result<String>;

    /// Public key of the local identity.
    fn public_key(&self) -> PublicKey;
}

/// Checks the id and signature of an inbound event.
pub trait EventVerifier: Send + Sync {
    fn verify(&self, event: &Event) -> Result<()>;
}

/// Schnorr signature and id check using the protocol library.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureVerifier;

impl EventVerifier for SignatureVerifier {
    fn verify(&self, event: &Event) -> Result<()> {
        event
            .verify()
            .map_err(|e| ClientError::Verification(format!("event {}: {}", event.id.to_hex(), e)))
    }
}
