//! Event kind classification.
//!
//! Handlers treat inbound events according to their kind: plain notes are
//! readable as-is, legacy direct messages carry NIP-04 ciphertext, and gift
//! wraps (NIP-59) must be unwrapped before the inner rumor is usable. Every
//! other kind is unknown to the gateway and is never delivered.

use nostr::Event;

/// Short text note (NIP-01).
pub const KIND_TEXT_NOTE: u16 = 1;
/// Legacy encrypted direct message (NIP-04).
pub const KIND_ENCRYPTED_DIRECT_MESSAGE: u16 = 4;
/// Gift wrap (NIP-59).
pub const KIND_GIFT_WRAP: u16 = 1059;

/// Semantic class of an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    /// Plain note, content readable as-is
    Note,
    /// Legacy direct message, content is ciphertext
    DirectMessage,
    /// Sealed envelope, requires unwrapping
    GiftWrap,
    /// Any other kind
    Unknown(u16),
}

impl EventClass {
    /// Classify a raw kind number.
    pub fn from_kind(kind: u16) -> Self {
        match kind {
            KIND_TEXT_NOTE => EventClass::Note,
            KIND_ENCRYPTED_DIRECT_MESSAGE => EventClass::DirectMessage,
            KIND_GIFT_WRAP => EventClass::GiftWrap,
            other => EventClass::Unknown(other),
        }
    }

    /// Classify an event.
    pub fn of(event: &Event) -> Self {
        Self::from_kind(event.kind.as_u16())
    }

    /// Whether the gateway delivers events of this class to handlers.
    pub fn is_known(&self) -> bool {
        !matches!(self, EventClass::Unknown(_))
    }
}
