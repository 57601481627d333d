//! Aggregate connectivity of the gateway.

use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Connectivity as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Connected,
    Disconnected,
}

/// Tracks whether the gateway currently has usable relay links.
///
/// The state is only `Connected` after a successful connect and goes back
/// to `Disconnected` on a closure notice, a failed subscribe, an explicit
/// disconnect, or when the last live link drops.
#[derive(Debug)]
pub struct ConnectionHealth {
    inner: RwLock<HealthInner>,
}

#[derive(Debug)]
struct HealthInner {
    state: HealthState,
    live_links: HashSet<String>,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHealth {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HealthInner {
                state: HealthState::Disconnected,
                live_links: HashSet::new(),
            }),
        }
    }

    /// Record a successful connect with the links that are up.
    pub async fn mark_connected(&self, links: impl IntoIterator<Item = String>) {
        let mut inner = self.inner.write().await;
        inner.live_links = links.into_iter().collect();
        inner.state = if inner.live_links.is_empty() {
            HealthState::Disconnected
        } else {
            HealthState::Connected
        };
        info!(
            "Connection health: {:?} ({} live links)",
            inner.state,
            inner.live_links.len()
        );
    }

    /// Force the state to disconnected.
    pub async fn mark_disconnected(&self, reason: &str) {
        let mut inner = self.inner.write().await;
        if inner.state == HealthState::Connected {
            info!("Connection health: Disconnected ({})", reason);
        }
        inner.state = HealthState::Disconnected;
        inner.live_links.clear();
    }

    /// A relay link came up.
    ///
    /// This does not flip the state back to connected; only a supervised
    /// reconnect does that.
    pub async fn link_up(&self, url: &str) {
        let mut inner = self.inner.write().await;
        if inner.state == HealthState::Connected {
            inner.live_links.insert(url.to_string());
        }
        debug!("Link up: {}", url);
    }

    /// A relay link dropped.
    pub async fn link_down(&self, url: &str) {
        let mut inner = self.inner.write().await;
        inner.live_links.remove(url);
        if inner.state == HealthState::Connected && inner.live_links.is_empty() {
            inner.state = HealthState::Disconnected;
            info!("Connection health: Disconnected (last link {} dropped)", url);
        } else {
            debug!("Link down: {}", url);
        }
    }

    pub async fn state(&self) -> HealthState {
        self.inner.read().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == HealthState::Connected
    }
}
