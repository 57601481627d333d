//! Inbound notification routing.
//!
//! Every frame a relay sends passes through [`NotificationRouter`]. Events
//! are verified first and classified second; only then are they handed to
//! the handlers registered under the subscription id the relay echoed back.

use crate::health::ConnectionHealth;
use crate::kind::EventClass;
use crate::message::RelayMessage;
use crate::relay::RelayNotification;
use crate::subscription::SubscriptionRegistry;
use crate::transport::EventVerifier;
use nostr::Event;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Verifies, classifies and dispatches inbound relay traffic.
pub struct NotificationRouter {
    registry: Arc<SubscriptionRegistry>,
    health: Arc<ConnectionHealth>,
    verifier: Arc<dyn EventVerifier>,
}

impl NotificationRouter {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        health: Arc<ConnectionHealth>,
        verifier: Arc<dyn EventVerifier>,
    ) -> Self {
        Self {
            registry,
            health,
            verifier,
        }
    }

    pub fn verifier(&self) -> &Arc<dyn EventVerifier> {
        &self.verifier
    }

    /// Handle one notification from a relay link.
    pub async fn on_notification(&self, relay_url: &str, notification: RelayNotification) {
        match notification {
            RelayNotification::Connected => self.health.link_up(relay_url).await,
            RelayNotification::Disconnected { reason } => {
                warn!("Link to {} dropped: {}", relay_url, reason);
                self.health.link_down(relay_url).await;
            }
            RelayNotification::Message(message) => {
                debug!("{} frame from {}", message.kind_name(), relay_url);
                self.on_relay_message(relay_url, message).await;
            }
        }
    }

    /// Handle one parsed relay frame.
    pub async fn on_relay_message(&self, relay_url: &str, message: RelayMessage) {
        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                self.on_event(relay_url, &subscription_id, &event).await;
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                // Echoes of our own CLOSE and finished fetches are not failures.
                if self.registry.matching(&subscription_id).await.is_empty() {
                    debug!(
                        "Ignoring CLOSED for inactive subscription {} from {}",
                        subscription_id, relay_url
                    );
                    return;
                }
                warn!(
                    "Subscription {} closed by {}: {}",
                    subscription_id, relay_url, message
                );
                self.health
                    .mark_disconnected(&format!("{} closed {}", relay_url, subscription_id))
                    .await;
            }
            RelayMessage::Notice { message } => {
                info!("Notice from {}: {}", relay_url, message);
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                debug!(
                    "OK from {} for {}: {} {}",
                    relay_url, event_id, success, message
                );
            }
            RelayMessage::Eose { subscription_id } => {
                debug!("EOSE from {} for {}", relay_url, subscription_id);
            }
            RelayMessage::Auth { challenge } => {
                debug!("AUTH challenge from {}: {}", relay_url, challenge);
            }
        }
    }

    /// Deliver one event. Returns the number of handlers that completed.
    pub async fn on_event(&self, relay_url: &str, subscription_id: &str, event: &Event) -> usize {
        if let Err(e) = self.verifier.verify(event) {
            warn!("Dropping event from {}: {}", relay_url, e);
            return 0;
        }

        let class = EventClass::of(event);
        if let EventClass::Unknown(kind) = class {
            info!(
                "Dropping event {} of unknown kind {} from {}",
                event.id.to_hex(),
                kind,
                relay_url
            );
            return 0;
        }

        let mut delivered = 0;
        for entry in self.registry.matching(subscription_id).await {
            let Some(handler) = entry.handler else {
                continue;
            };
            if !entry.filter.matches(event) {
                continue;
            }
            match handler.call(event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(
                    "Handler for {} failed on {:?} event {}: {}",
                    subscription_id,
                    class,
                    event.id.to_hex(),
                    e
                ),
            }
        }

        if delivered == 0 {
            debug!(
                "No handler took event {} on {}",
                event.id.to_hex(),
                subscription_id
            );
        }
        delivered
    }
}
