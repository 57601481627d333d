//! Background reconnection.
//!
//! [`ReconnectSupervisor`] wakes up once per interval. When the target
//! reports an unhealthy connection it reconnects and then replays every
//! registered subscription, oldest first.

use crate::error::Result;
use crate::subscription::RegisteredSubscription;
use async_trait::async_trait;
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the supervisor needs from the component it keeps alive.
#[async_trait]
pub trait Reconnectable: Send + Sync {
    /// Whether automatic reconnection is currently enabled.
    fn auto_reconnect(&self) -> bool;

    /// Whether the aggregate connection is healthy.
    async fn is_healthy(&self) -> bool;

    /// Re-open links. Returns true when at least one link is up.
    async fn reconnect(&self) -> bool;

    /// Registered subscriptions in registration order.
    async fn registered(&self) -> Vec<RegisteredSubscription>;

    /// Re-issue one subscription under a fresh id. Returns the new id.
    async fn resubscribe(&self, entry: &RegisteredSubscription) -> Result<String>;

    /// Run one recovery cycle unless the connection is already restored.
    ///
    /// Implementations serialize this with any other path that reconnects,
    /// so one outage leads to exactly one replay.
    async fn restore(&self) -> bool;
}

/// Handle on the background reconnect task.
pub struct ReconnectSupervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ReconnectSupervisor {
    /// Start supervising `target`. The task holds only a weak reference and
    /// exits by itself once the target is dropped.
    pub fn spawn(target: Weak<dyn Reconnectable>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!("Reconnect supervisor started (interval {:?})", interval);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let Some(target) = target.upgrade() else {
                    debug!("Supervised target dropped");
                    break;
                };
                if !target.auto_reconnect() {
                    debug!("Auto-reconnect disabled");
                    break;
                }
                if target.is_healthy().await {
                    continue;
                }

                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = target.restore() => {}
                }
            }
            info!("Reconnect supervisor stopped");
        });

        Self { shutdown, handle }
    }

    /// One recovery cycle: reconnect, then replay every subscription.
    ///
    /// Returns the number of subscriptions replayed, or `None` when no link
    /// came back.
    pub async fn recover<T: Reconnectable + ?Sized>(target: &T) -> Option<usize> {
        info!("Connection down, reconnecting");
        if !target.reconnect().await {
            warn!("Reconnect failed");
            return None;
        }

        let entries = target.registered().await;
        let mut replayed = 0;
        for entry in &entries {
            match target.resubscribe(entry).await {
                Ok(subscription_id) => {
                    debug!(
                        "Replayed subscription {} as {}",
                        entry.key, subscription_id
                    );
                    replayed += 1;
                }
                Err(e) => warn!("Failed to replay subscription {}: {}", entry.key, e),
            }
        }
        info!(
            "Reconnected, replayed {}/{} subscriptions",
            replayed,
            entries.len()
        );
        Some(replayed)
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await
            && e.is_panic()
        {
            warn!("Reconnect supervisor panicked: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
