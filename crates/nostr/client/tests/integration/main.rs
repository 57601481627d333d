//! Integration tests for the relay gateway.
//!
//! `gateway` drives [`RelayGateway`] through an in-memory transport whose
//! links can be dropped and restored on demand. `relay_link` talks to a
//! small WebSocket relay running inside the test process.

mod relay_link;

use async_trait::async_trait;
use nostr::{Event, EventBuilder, JsonUtil, Keys, Kind, PublicKey, UnsignedEvent};
use nostr_client::{
    ClientError, Filter, PublishOutput, RelayMessage, RelayNotification, RelayTransport, Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn signed_event(kind: u16, content: &str) -> Event {
    EventBuilder::new(Kind::from(kind), content)
        .sign_with_keys(&Keys::generate())
        .unwrap()
}

/// Copy of `event` with its content replaced; id and signature no longer match.
pub fn tampered(event: &Event) -> Event {
    let mut value: serde_json::Value = serde_json::from_str(&event.as_json()).unwrap();
    value["content"] = serde_json::Value::String("tampered".to_string());
    serde_json::from_value(value).unwrap()
}

/// In-memory transport with one notification channel per relay.
pub struct FakeTransport {
    keys: Keys,
    channels: Mutex<HashMap<String, broadcast::Sender<RelayNotification>>>,
    order: Mutex<Vec<String>>,
    connected: Mutex<HashSet<String>>,
    stored: Mutex<Vec<Event>>,
    requests: Mutex<Vec<(String, Filter)>>,
    closes: Mutex<Vec<String>>,
    direct_messages: Mutex<Vec<(PublicKey, String)>>,
    publish_timeouts: Mutex<Vec<Duration>>,
    pub reachable: AtomicBool,
    pub fail_subscribe: AtomicBool,
    pub fail_private_msg: AtomicBool,
    pub fail_gift_wrap: AtomicBool,
    pub connects: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            keys: Keys::generate(),
            channels: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            connected: Mutex::new(HashSet::new()),
            stored: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            direct_messages: Mutex::new(Vec::new()),
            publish_timeouts: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            fail_subscribe: AtomicBool::new(false),
            fail_private_msg: AtomicBool::new(false),
            fail_gift_wrap: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        }
    }

    fn notify(&self, url: &str, notification: RelayNotification) {
        if let Some(tx) = self.channels.lock().unwrap().get(url) {
            let _ = tx.send(notification);
        }
    }

    /// Deliver a frame as if `url` had sent it.
    pub fn emit(&self, url: &str, message: RelayMessage) {
        self.notify(url, RelayNotification::Message(message));
    }

    pub fn emit_event(&self, url: &str, subscription_id: &str, event: Event) {
        self.emit(
            url,
            RelayMessage::Event {
                subscription_id: subscription_id.to_string(),
                event,
            },
        );
    }

    /// Drop every link, as a network outage would.
    pub fn drop_all_links(&self) {
        let urls: Vec<String> = self.connected.lock().unwrap().drain().collect();
        for url in urls {
            self.notify(
                &url,
                RelayNotification::Disconnected {
                    reason: "connection reset".to_string(),
                },
            );
        }
    }

    pub fn store(&self, event: Event) {
        self.stored.lock().unwrap().push(event);
    }

    pub fn requests(&self) -> Vec<(String, Filter)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.closes.lock().unwrap().clone()
    }

    pub fn direct_messages(&self) -> Vec<(PublicKey, String)> {
        self.direct_messages.lock().unwrap().clone()
    }

    pub fn publish_timeouts(&self) -> Vec<Duration> {
        self.publish_timeouts.lock().unwrap().clone()
    }

    fn output(&self, event_id: &str) -> PublishOutput {
        let mut output = PublishOutput::new(event_id);
        output.success = self.connected.lock().unwrap().clone();
        output
    }
}

#[async_trait]
impl RelayTransport for FakeTransport {
    async fn add_relay(&self, url: &str) -> Result<()> {
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ClientError::InvalidUrl(url.to_string()));
        }
        let mut channels = self.channels.lock().unwrap();
        if !channels.contains_key(url) {
            channels.insert(url.to_string(), broadcast::channel(256).0);
            self.order.lock().unwrap().push(url.to_string());
        }
        Ok(())
    }

    async fn connect(&self) -> bool {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return false;
        }
        let urls = self.order.lock().unwrap().clone();
        for url in &urls {
            if self.connected.lock().unwrap().insert(url.clone()) {
                self.notify(url, RelayNotification::Connected);
            }
        }
        !urls.is_empty()
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.lock().unwrap().clear();
        Ok(())
    }

    async fn relay_urls(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    async fn connected_relays(&self) -> Vec<String> {
        self.connected.lock().unwrap().iter().cloned().collect()
    }

    async fn notifications(&self, url: &str) -> Option<broadcast::Receiver<RelayNotification>> {
        self.channels.lock().unwrap().get(url).map(|tx| tx.subscribe())
    }

    async fn subscribe(&self, subscription_id: &str, filter: &Filter) -> Result<()> {
        if self.fail_subscribe.load(Ordering::SeqCst) || self.connected.lock().unwrap().is_empty() {
            return Err(ClientError::NotConnected);
        }
        self.requests
            .lock()
            .unwrap()
            .push((subscription_id.to_string(), filter.clone()));
        Ok(())
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        self.closes.lock().unwrap().push(subscription_id.to_string());
        Ok(())
    }

    async fn publish(&self, event: &Event, _timeout: Duration) -> Result<PublishOutput> {
        Ok(self.output(&event.id.to_hex()))
    }

    async fn fetch(&self, filter: &Filter, _timeout: Duration) -> Result<Vec<Event>> {
        Ok(self
            .stored
            .lock()
            .unwrap()
            .iter()
            .filter(|event| filter.matches(event))
            .cloned()
            .collect())
    }

    async fn send_private_msg(
        &self,
        receiver: &PublicKey,
        message: &str,
        timeout: Duration,
    ) -> Result<PublishOutput> {
        self.publish_timeouts.lock().unwrap().push(timeout);
        if self.fail_private_msg.load(Ordering::SeqCst) {
            return Err(ClientError::PublishFailed("no relay accepted".to_string()));
        }
        self.direct_messages
            .lock()
            .unwrap()
            .push((*receiver, message.to_string()));
        Ok(self.output("direct"))
    }

    async fn gift_wrap(
        &self,
        _receiver: &PublicKey,
        _rumor: UnsignedEvent,
        _timeout: Duration,
    ) -> Result<PublishOutput> {
        if self.fail_gift_wrap.load(Ordering::SeqCst) {
            return Err(ClientError::Crypto("sealing failed".to_string()));
        }
        Ok(self.output("archive"))
    }

    async fn unwrap_gift_wrap(&self, _event: &Event) -> Result<(PublicKey, UnsignedEvent)> {
        Err(ClientError::Crypto("not supported by fake".to_string()))
    }

    fn decrypt_direct_message(&self, _event: &Event) -> Result<String> {
        Err(ClientError::Crypto("not supported by fake".to_string()))
    }

    fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }
}
