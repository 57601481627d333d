//! Single relay connection management
//!
//! Provides an async WebSocket connection to one Nostr relay. Every parsed
//! frame and every link state change is published on a broadcast channel
//! that lives as long as the connection object, so a listener subscribes
//! once and keeps receiving across reconnects.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use nostr::Event;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Disconnected
    Disconnected,
    /// Currently connecting
    Connecting,
    /// Connected and ready
    Connected,
    /// Closing on request
    Closing,
}

/// Notification published by a relay connection.
#[derive(Debug, Clone)]
pub enum RelayNotification {
    /// The WebSocket handshake completed
    Connected,
    /// A frame was received and parsed
    Message(RelayMessage),
    /// The link dropped without being asked to
    Disconnected { reason: String },
}

/// Confirmation result for event publishing
#[derive(Debug, Clone)]
pub struct PublishConfirmation {
    /// Event ID that was published
    pub event_id: String,
    /// Whether the relay accepted the event
    pub accepted: bool,
    /// Message from the relay (empty if accepted, error message if rejected)
    pub message: String,
}

type ConfirmationSender = oneshot::Sender<PublishConfirmation>;

/// Relay connection configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Capacity of the notification broadcast channel
    pub notification_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            notification_capacity: 1024,
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Relay connection
pub struct RelayConnection {
    /// Relay URL
    url: Url,
    /// Configuration
    config: RelayConfig,
    /// Connection state
    state: Arc<RwLock<ConnectionState>>,
    /// Write half of the WebSocket
    sink: Arc<Mutex<Option<WsSink>>>,
    /// Parsed frames and state changes
    notifications: broadcast::Sender<RelayNotification>,
    /// Pending event confirmations (event_id -> oneshot sender)
    pending_confirmations: Arc<Mutex<HashMap<String, ConfirmationSender>>>,
    /// Receive loop task handle
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayConnection {
    /// Create a new relay connection (does not connect yet)
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        let url = Url::parse(url)?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }

        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));

        Ok(Self {
            url,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            sink: Arc::new(Mutex::new(None)),
            notifications,
            pending_confirmations: Arc::new(Mutex::new(HashMap::new())),
            recv_task: Mutex::new(None),
        })
    }

    /// Connect to the relay
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(ClientError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        info!("Connecting to relay: {}", self.url);

        let connect_start = Instant::now();
        let ws_stream = match timeout(
            self.config.connect_timeout,
            connect_async(self.url.as_str()),
        )
        .await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::WebSocket(e.to_string()));
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Timeout(format!(
                    "Connection timeout after {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let (sink, stream) = ws_stream.split();
        *self.sink.lock().await = Some(sink);
        *self.state.write().await = ConnectionState::Connected;

        info!(
            "Connected to relay: {} (took {:?})",
            self.url,
            connect_start.elapsed()
        );

        self.start_recv_loop(stream).await;
        let _ = self.notifications.send(RelayNotification::Connected);

        Ok(())
    }

    /// Start background receive loop to process incoming messages
    async fn start_recv_loop(&self, mut stream: SplitStream<WsStream>) {
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);
        let pending_confirmations = Arc::clone(&self.pending_confirmations);
        let notifications = self.notifications.clone();
        let url = self.url.to_string();

        let handle = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let text: &str = &text;
                        debug!("Received from {}: {}", url, text);
                        let msg = match RelayMessage::from_json(text) {
                            Ok(msg) => msg,
                            Err(e) => {
                                warn!("Dropping unparseable frame from {}: {}", url, e);
                                continue;
                            }
                        };

                        if let RelayMessage::Ok {
                            event_id,
                            success,
                            message,
                        } = &msg
                            && let Some(tx) = pending_confirmations.lock().await.remove(event_id)
                        {
                            let _ = tx.send(PublishConfirmation {
                                event_id: event_id.clone(),
                                accepted: *success,
                                message: message.clone(),
                            });
                        }

                        // No receivers is fine: nobody is listening yet.
                        let _ = notifications.send(RelayNotification::Message(msg));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Some(writer) = sink.lock().await.as_mut() {
                            let _ = writer.send(Message::Pong(data)).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) => break "relay closed the connection".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            };

            warn!("Relay {} disconnected: {}", url, reason);
            *state.write().await = ConnectionState::Disconnected;
            sink.lock().await.take();
            // Dropping the senders fails every publish still waiting for OK.
            pending_confirmations.lock().await.clear();
            let _ = notifications.send(RelayNotification::Disconnected { reason });
        });

        if let Some(previous) = self.recv_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Disconnect from the relay
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == ConnectionState::Disconnected {
                return Ok(());
            }
            *state = ConnectionState::Closing;
        }

        info!("Disconnecting from relay: {}", self.url);

        if let Some(handle) = self.recv_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }

        if let Some(mut writer) = self.sink.lock().await.take()
            && let Err(e) = writer.close().await
        {
            debug!("Error closing WebSocket to {}: {}", self.url, e);
        }

        self.pending_confirmations.lock().await.clear();
        *self.state.write().await = ConnectionState::Disconnected;
        info!("Disconnected from relay: {}", self.url);
        Ok(())
    }

    /// Get current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Check if connected
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Receive every frame and state change of this relay.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<RelayNotification> {
        self.notifications.subscribe()
    }

    /// Send an event without waiting for the relay's answer
    pub async fn send_event(&self, event: &Event) -> Result<()> {
        self.send(&ClientMessage::Event(event.clone())).await
    }

    /// Publish an event and wait for confirmation from the relay
    ///
    /// Returns PublishConfirmation indicating whether the relay accepted the event.
    pub async fn publish_event(
        &self,
        event: &Event,
        confirmation_timeout: Duration,
    ) -> Result<PublishConfirmation> {
        let (tx, rx) = oneshot::channel();
        let event_id = event.id.to_hex();

        self.pending_confirmations
            .lock()
            .await
            .insert(event_id.clone(), tx);

        if let Err(e) = self.send_event(event).await {
            self.pending_confirmations.lock().await.remove(&event_id);
            return Err(e);
        }

        match timeout(confirmation_timeout, rx).await {
            Ok(Ok(confirmation)) => Ok(confirmation),
            Ok(Err(_)) => Err(ClientError::PublishFailed(format!(
                "connection to {} lost before confirmation",
                self.url
            ))),
            Err(_) => {
                self.pending_confirmations.lock().await.remove(&event_id);
                Err(ClientError::Timeout(format!(
                    "Event confirmation timeout after {:?}",
                    confirmation_timeout
                )))
            }
        }
    }

    /// Subscribe to events matching filters
    pub async fn subscribe(&self, subscription_id: &str, filters: &[Filter]) -> Result<()> {
        self.send(&ClientMessage::Req {
            subscription_id: subscription_id.to_string(),
            filters: filters.to_vec(),
        })
        .await
    }

    /// Close a subscription
    pub async fn close_subscription(&self, subscription_id: &str) -> Result<()> {
        self.send(&ClientMessage::Close {
            subscription_id: subscription_id.to_string(),
        })
        .await
    }

    /// Send a protocol message to the relay
    pub async fn send(&self, msg: &ClientMessage) -> Result<()> {
        if !self.is_connected().await {
            return Err(ClientError::NotConnected);
        }

        let msg_text = msg
            .to_json()
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        debug!("Sending to {}: {}", self.url, msg_text);

        let mut sink = self.sink.lock().await;
        let Some(writer) = sink.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        writer
            .send(Message::Text(msg_text.into()))
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }

    /// Get relay URL
    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.recv_task.get_mut().take() {
            handle.abort();
        }
    }
}
