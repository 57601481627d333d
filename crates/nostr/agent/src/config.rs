//! Agent configuration

use anyhow::Context;
use nostr::Keys;
use nostr_client::GatewayConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub nostr: NostrConfig,
}

/// Relay and identity settings
#[derive(Debug, Clone, Deserialize)]
pub struct NostrConfig {
    /// Secret key, hex or nsec. An ephemeral key is generated when absent.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Relays to connect to
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,
    /// Reconnect and replay subscriptions when every link drops
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    /// Seconds between connection health checks
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Seconds to wait for relays to acknowledge a publish
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
}

fn default_relays() -> Vec<String> {
    nostr_client::DEFAULT_RELAYS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_interval() -> u64 {
    5
}

fn default_publish_timeout() -> u64 {
    10
}

impl Default for NostrConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            relays: default_relays(),
            auto_reconnect: default_auto_reconnect(),
            reconnect_interval_secs: default_reconnect_interval(),
            publish_timeout_secs: default_publish_timeout(),
        }
    }
}

impl AgentConfig {
    /// Load config from file, or defaults when the file does not exist
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config file {}", path.display()))
    }
}

impl NostrConfig {
    /// Signing keys for this agent
    pub fn keys(&self) -> anyhow::Result<Keys> {
        match self.private_key.as_deref() {
            Some(key) => Keys::parse(key).context("invalid private key, expected hex or nsec"),
            None => {
                warn!("No private key configured, using an ephemeral identity");
                Ok(Keys::generate())
            }
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            relays: self.relays.clone(),
            auto_reconnect: self.auto_reconnect,
            reconnect_interval: Duration::from_secs(self.reconnect_interval_secs.max(1)),
            publish_timeout: Duration::from_secs(self.publish_timeout_secs),
            ..Default::default()
        }
    }
}
