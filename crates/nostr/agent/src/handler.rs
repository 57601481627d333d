//! Turns inbound relay events into messages the agent can act on.

use anyhow::Context;
use nostr_client::{Event, EventClass, EventHandler, RelayGateway};
use std::fmt;
use tracing::{info, warn};

/// Decoded inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Public text note
    Note { author: String, content: String },
    /// Legacy encrypted direct message
    DirectMessage { sender: String, plaintext: String },
    /// Gift-wrapped private message
    PrivateMessage { sender: String, content: String },
}

impl fmt::Display for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inbound::Note { author, content } => write!(f, "note from {author}: {content}"),
            Inbound::DirectMessage { sender, plaintext } => {
                write!(f, "direct message from {sender}: {plaintext}")
            }
            Inbound::PrivateMessage { sender, content } => {
                write!(f, "private message from {sender}: {content}")
            }
        }
    }
}

/// Decode `event` according to its kind.
pub async fn interpret(gateway: &RelayGateway, event: &Event) -> anyhow::Result<Inbound> {
    match EventClass::of(event) {
        EventClass::Note => Ok(Inbound::Note {
            author: event.pubkey.to_hex(),
            content: event.content.clone(),
        }),
        EventClass::DirectMessage => {
            let plaintext = gateway
                .decrypt_direct_message(event)
                .context("decrypting direct message")?;
            Ok(Inbound::DirectMessage {
                sender: event.pubkey.to_hex(),
                plaintext,
            })
        }
        EventClass::GiftWrap => {
            let (sender, rumor) = gateway
                .unwrap_gift_wrap(event)
                .await
                .context("unwrapping gift wrap")?;
            Ok(Inbound::PrivateMessage {
                sender: sender.to_hex(),
                content: rumor.content,
            })
        }
        EventClass::Unknown(kind) => anyhow::bail!("unsupported event kind {kind}"),
    }
}

/// Handler that logs every decodable event delivered to a subscription.
pub fn logging_handler(gateway: RelayGateway) -> EventHandler {
    EventHandler::from_async(move |event| {
        let gateway = gateway.clone();
        async move {
            match interpret(&gateway, &event).await {
                Ok(inbound) => info!("{}", inbound),
                Err(e) => warn!("Dropping event {}: {:#}", event.id, e),
            }
            Ok(())
        }
    })
}
