//! Client error types

use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// No relay could be reached or handshaken
    #[error("Connection error: {0}")]
    Connection(String),

    /// Event signature or id did not verify
    #[error("Verification error: {0}")]
    Verification(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// A subscription handler returned an error or panicked
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Already connected
    #[error("Already connected to relay")]
    AlreadyConnected,

    /// Event publish failed
    #[error("Event publish failed: {0}")]
    PublishFailed(String),

    /// Subscription error
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Key could not be parsed
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signing, encryption or gift-wrap failure in the protocol library
    #[error("Crypto error: {0}")]
    Crypto(String),
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
