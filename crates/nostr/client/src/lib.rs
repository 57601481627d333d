//! Nostr relay gateway for OpenAgents.
//!
//! This crate provides:
//! - WebSocket connections to Nostr relays (NIP-01 relay protocol)
//! - A relay pool that publishes, fetches and gift-wraps with the agent's keys
//! - Verified, kind-aware dispatch of inbound events to subscription handlers
//! - Automatic reconnection that replays every subscription
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr::Keys;
//! use nostr_client::{EventHandler, Filter, GatewayConfig, RelayGateway};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let gateway = RelayGateway::new(Keys::generate(), GatewayConfig::default());
//!
//!     let relays = vec!["wss://relay.damus.io".to_string()];
//!     if !gateway.connect(&relays).await {
//!         anyhow::bail!("no relay reachable");
//!     }
//!
//!     let handler = EventHandler::sync(|event| {
//!         println!("Received note: {}", event.content);
//!         Ok(())
//!     });
//!     let filter = Filter::new().kinds([1]).limit(10);
//!     gateway.subscribe(Some(filter), Some(handler)).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     gateway.disconnect().await;
//!     Ok(())
//! }
//! ```

mod error;
mod gateway;
mod health;
mod kind;
mod message;
mod pool;
mod relay;
mod router;
mod subscription;
mod supervisor;
mod transport;

pub use error::{ClientError, Result};
pub use gateway::{DeliveryReceipt, GatewayConfig, RelayGateway};
pub use health::{ConnectionHealth, HealthState};
pub use kind::{EventClass, KIND_ENCRYPTED_DIRECT_MESSAGE, KIND_GIFT_WRAP, KIND_TEXT_NOTE};
pub use message::{ClientMessage, Filter, MessageError, RelayMessage};
pub use nostr::Event;
pub use pool::RelayPool;
pub use relay::{
    ConnectionState, PublishConfirmation, RelayConfig, RelayConnection, RelayNotification,
};
pub use router::NotificationRouter;
pub use subscription::{
    EventHandler, RegisteredSubscription, SubscriptionRegistry, generate_subscription_id,
};
pub use supervisor::{ReconnectSupervisor, Reconnectable};
pub use transport::{EventVerifier, PublishOutput, RelayTransport, SignatureVerifier};

/// Default relays for OpenAgents.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];
