//! Nostr relay message types.
//!
//! This module implements the relay protocol messages as specified in NIP-01:
//! - Client to Relay: EVENT, REQ, CLOSE
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH
//!
//! It also holds [`Filter`], which is used both to request a subscription
//! from a relay and to test events locally.

use nostr::Event;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur when parsing relay messages.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(Event),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },
}

impl ClientMessage {
    /// Serialize to JSON array for sending to relay.
    pub fn to_json(&self) -> Result<String, MessageError> {
        let value = match self {
            ClientMessage::Event(event) => {
                serde_json::json!(["EVENT", event])
            }
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr: Vec<Value> = vec![
                    Value::String("REQ".to_string()),
                    Value::String(subscription_id.clone()),
                ];
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                Value::Array(arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::json!(["CLOSE", subscription_id])
            }
        };
        Ok(value.to_string())
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// Event matching a subscription: ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: Event,
    },

    /// Command result: ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// End of stored events: ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// Subscription closed by relay: ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: ["NOTICE", <message>]
    Notice { message: String },

    /// Authentication challenge (NIP-42): ["AUTH", <challenge>]
    Auth { challenge: String },
}

impl RelayMessage {
    /// Parse a JSON message from the relay.
    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        let arr: Vec<Value> =
            serde_json::from_str(json).map_err(|e| MessageError::InvalidFormat(e.to_string()))?;

        if arr.is_empty() {
            return Err(MessageError::InvalidFormat("empty array".to_string()));
        }

        let msg_type = arr[0]
            .as_str()
            .ok_or_else(|| MessageError::InvalidFormat("first element not a string".to_string()))?;

        match msg_type {
            "EVENT" => {
                if arr.len() < 3 {
                    return Err(MessageError::MissingField(
                        "event or subscription_id".to_string(),
                    ));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let event: Event = serde_json::from_value(arr[2].clone())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                if arr.len() < 4 {
                    return Err(MessageError::MissingField("OK fields".to_string()));
                }
                let event_id = string_at(&arr, 1, "event_id")?;
                let success = arr[2].as_bool().ok_or_else(|| {
                    MessageError::InvalidFormat("success not a boolean".to_string())
                })?;
                let message = arr[3].as_str().unwrap_or("").to_string();
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "EOSE" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("subscription_id".to_string()));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                Ok(RelayMessage::Eose { subscription_id })
            }
            "CLOSED" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("CLOSED fields".to_string()));
                }
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                // The reason is optional in practice even though NIP-01 lists it.
                let message = arr
                    .get(2)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                Ok(RelayMessage::Closed {
                    subscription_id,
                    message,
                })
            }
            "NOTICE" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("message".to_string()));
                }
                let message = string_at(&arr, 1, "message")?;
                Ok(RelayMessage::Notice { message })
            }
            "AUTH" => {
                if arr.len() < 2 {
                    return Err(MessageError::MissingField("challenge".to_string()));
                }
                let challenge = string_at(&arr, 1, "challenge")?;
                Ok(RelayMessage::Auth { challenge })
            }
            _ => Err(MessageError::UnknownType(msg_type.to_string())),
        }
    }

    /// Short name of the frame, used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            RelayMessage::Event { .. } => "EVENT",
            RelayMessage::Ok { .. } => "OK",
            RelayMessage::Eose { .. } => "EOSE",
            RelayMessage::Closed { .. } => "CLOSED",
            RelayMessage::Notice { .. } => "NOTICE",
            RelayMessage::Auth { .. } => "AUTH",
        }
    }
}

fn string_at(arr: &[Value], index: usize, field: &str) -> Result<String, MessageError> {
    arr[index]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| MessageError::InvalidFormat(format!("{} not a string", field)))
}

/// Filter for subscription requests.
///
/// Builder methods consume the filter; the `add_*` / `remove_*` combinators
/// borrow it and return a new value, so a filter shared by several
/// subscriptions is never changed underneath them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs (or prefixes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys or prefixes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Events since timestamp (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Events until timestamp (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of events
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Full-text search (NIP-50)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Generic tag queries (e.g., #e, #p)
    /// The key includes the # prefix, value is list of values
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// Create a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by event IDs.
    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by authors.
    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by kinds.
    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Filter by events since timestamp.
    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    /// Filter by events until timestamp.
    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    /// Limit number of results.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Full-text search on content.
    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Add a tag filter. The key may be given with or without the `#`.
    pub fn tag(mut self, key: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let key = if key.starts_with('#') {
            key.to_string()
        } else {
            format!("#{}", key)
        };
        self.tags
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Filter by #d (addressable identifier) tag.
    pub fn identifier(self, identifier: impl Into<String>) -> Self {
        self.tag("d", [identifier.into()])
    }

    /// Filter by #r (reference) tag.
    pub fn reference(self, reference: impl Into<String>) -> Self {
        self.tag("r", [reference.into()])
    }

    /// Return a copy with `kinds` added to the kind set.
    pub fn add_kinds(&self, kinds: impl IntoIterator<Item = u16>) -> Self {
        let mut next = self.clone();
        next.kinds = Some(merge(next.kinds.take(), kinds));
        next
    }

    /// Return a copy without `kinds`. An emptied set becomes unset.
    pub fn remove_kinds(&self, kinds: &[u16]) -> Self {
        let mut next = self.clone();
        next.kinds = subtract(next.kinds.take(), |k| kinds.contains(k));
        next
    }

    /// Return a copy with `authors` added to the author set.
    pub fn add_authors(&self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut next = self.clone();
        next.authors = Some(merge(next.authors.take(), authors.into_iter().map(Into::into)));
        next
    }

    /// Return a copy without `authors`. An emptied set becomes unset.
    pub fn remove_authors(&self, authors: &[&str]) -> Self {
        let mut next = self.clone();
        next.authors = subtract(next.authors.take(), |a| authors.contains(&a.as_str()));
        next
    }

    /// Return a copy with `ids` added to the id set.
    pub fn add_ids(&self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let mut next = self.clone();
        next.ids = Some(merge(next.ids.take(), ids.into_iter().map(Into::into)));
        next
    }

    /// Return a copy without `ids`. An emptied set becomes unset.
    pub fn remove_ids(&self, ids: &[&str]) -> Self {
        let mut next = self.clone();
        next.ids = subtract(next.ids.take(), |id| ids.contains(&id.as_str()));
        next
    }

    /// True when no constraint is set, i.e. the filter matches every event.
    pub fn is_empty(&self) -> bool {
        self == &Filter::default()
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids {
            let id = event.id.to_hex();
            if !ids.iter().any(|prefix| id.starts_with(prefix.as_str())) {
                return false;
            }
        }

        if let Some(ref authors) = self.authors {
            let pubkey = event.pubkey.to_hex();
            if !authors.iter().any(|prefix| pubkey.starts_with(prefix.as_str())) {
                return false;
            }
        }

        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind.as_u16())
        {
            return false;
        }

        let created_at = event.created_at.as_u64();
        if let Some(since) = self.since
            && created_at < since
        {
            return false;
        }
        if let Some(until) = self.until
            && created_at > until
        {
            return false;
        }

        if let Some(ref query) = self.search
            && !event
                .content
                .to_lowercase()
                .contains(&query.to_lowercase())
        {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            event.tags.iter().any(|tag| {
                let fields = tag.as_slice();
                fields.len() >= 2 && fields[0] == name && values.contains(&fields[1])
            })
        })
    }
}

fn merge<T: PartialEq>(existing: Option<Vec<T>>, extra: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut set = existing.unwrap_or_default();
    for item in extra {
        if !set.contains(&item) {
            set.push(item);
        }
    }
    set
}

fn subtract<T>(existing: Option<Vec<T>>, remove: impl Fn(&T) -> bool) -> Option<Vec<T>> {
    let mut set = existing?;
    set.retain(|item| !remove(item));
    if set.is_empty() { None } else { Some(set) }
}
