//! Subscription bookkeeping.
//!
//! Every subscription the gateway has issued is recorded here together with
//! its filter and handler, so events can be routed by subscription id and
//! the whole set can be replayed after a reconnect.

use crate::error::{ClientError, Result};
use crate::message::Filter;
use futures::FutureExt;
use futures::future::BoxFuture;
use nostr::Event;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

type SyncFn = dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync;
type AsyncFn = dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

/// Callback invoked for each event delivered to a subscription.
#[derive(Clone)]
pub enum EventHandler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl EventHandler {
    /// Wrap a plain closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        EventHandler::Sync(Arc::new(f))
    }

    /// Wrap a closure returning a future. The future is awaited before the
    /// next event on the same relay is routed.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        EventHandler::Async(Arc::new(move |event| f(event).boxed()))
    }

    /// Run the handler. Errors and panics come back as [`ClientError::Dispatch`].
    pub async fn call(&self, event: &Event) -> Result<()> {
        let outcome = match self {
            EventHandler::Sync(f) => std::panic::catch_unwind(AssertUnwindSafe(|| f(event))),
            EventHandler::Async(f) => AssertUnwindSafe(f(event.clone())).catch_unwind().await,
        };

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ClientError::Dispatch(format!("{e:#}"))),
            Err(panic) => Err(ClientError::Dispatch(format!(
                "handler panicked: {}",
                panic_message(&*panic)
            ))),
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventHandler::Sync(_) => f.write_str("EventHandler::Sync"),
            EventHandler::Async(_) => f.write_str("EventHandler::Async"),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// One entry of the registry.
#[derive(Debug, Clone)]
pub struct RegisteredSubscription {
    /// Stable local key, survives id reassignment on replay
    pub key: u64,
    pub filter: Filter,
    pub handler: Option<EventHandler>,
    /// Id currently known to the relays
    pub subscription_id: Option<String>,
}

/// Ordered record of every subscription issued since the last disconnect.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<Vec<RegisteredSubscription>>,
    next_key: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its key.
    pub async fn register(
        &self,
        filter: Filter,
        handler: Option<EventHandler>,
        subscription_id: Option<String>,
    ) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.entries.write().await.push(RegisteredSubscription {
            key,
            filter,
            handler,
            subscription_id,
        });
        key
    }

    /// Point an entry at a new subscription id. Returns the previous id.
    ///
    /// Returns `None` both when the entry had no id and when the key is
    /// unknown (the registry was cleared in the meantime).
    pub async fn reassign(&self, key: u64, subscription_id: String) -> Option<String> {
        let mut entries = self.entries.write().await;
        let entry = entries.iter_mut().find(|e| e.key == key)?;
        entry.subscription_id.replace(subscription_id)
    }

    /// Copy of all entries in registration order.
    pub async fn snapshot(&self) -> Vec<RegisteredSubscription> {
        self.entries.read().await.clone()
    }

    /// Entries whose current id equals `subscription_id`.
    pub async fn matching(&self, subscription_id: &str) -> Vec<RegisteredSubscription> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.subscription_id.as_deref() == Some(subscription_id))
            .cloned()
            .collect()
    }

    /// Remove entries with the given id. Returns how many were removed.
    pub async fn remove(&self, subscription_id: &str) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| e.subscription_id.as_deref() != Some(subscription_id));
        before - entries.len()
    }

    /// Drop every entry. Returns how many were dropped.
    pub async fn clear(&self) -> usize {
        let mut entries = self.entries.write().await;
        let count = entries.len();
        entries.clear();
        count
    }

    /// Current subscription ids in registration order.
    pub async fn subscription_ids(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter_map(|e| e.subscription_id.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
