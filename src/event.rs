//! Domain events delivered by the realtime channels.
//!
//! Every frame or record a channel decodes ends up as one [`Event`]: a
//! recognized [`EventKind`] plus an opaque JSON payload. Kinds the client
//! does not know are never turned into events, which lets the server add new
//! ones without breaking older clients.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kinds of event the client understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new message was posted to a conversation.
    NewMessage,
    /// An existing message was edited.
    MessageUpdated,
    /// A message was removed.
    MessageDeleted,
    /// Someone reacted to an item.
    Reaction,
    /// Typing indicator for a conversation.
    Typing,
    /// Read receipt for a conversation.
    ReadReceipt,
    /// Conversation metadata (title, members, unread counts) changed.
    ConversationUpdated,
    /// User-facing notification.
    Notification,
    /// Online/offline presence change.
    Presence,
    /// Server accepted the authentication frame.
    Authenticated,
    /// Server-reported error.
    Error,
    /// Generic record without a type of its own (event stream only).
    Message,
}

impl EventKind {
    /// Every recognized kind, in declaration order.
    pub const ALL: [Self; 12] = [
        Self::NewMessage,
        Self::MessageUpdated,
        Self::MessageDeleted,
        Self::Reaction,
        Self::Typing,
        Self::ReadReceipt,
        Self::ConversationUpdated,
        Self::Notification,
        Self::Presence,
        Self::Authenticated,
        Self::Error,
        Self::Message,
    ];

    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::MessageUpdated => "message_updated",
            Self::MessageDeleted => "message_deleted",
            Self::Reaction => "reaction",
            Self::Typing => "typing",
            Self::ReadReceipt => "read_receipt",
            Self::ConversationUpdated => "conversation_updated",
            Self::Notification => "notification",
            Self::Presence => "presence",
            Self::Authenticated => "authenticated",
            Self::Error => "error",
            Self::Message => "message",
        }
    }

    /// Look up a kind by its wire name. Unknown names yield `None`.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable decoded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Event data as sent by the server.
    pub payload: serde_json::Value,
}

impl Event {
    /// Build an event.
    #[must_use]
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self { kind, payload }
    }
}
