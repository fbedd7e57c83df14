//! Domain primitives shared by the transport, engine and gateway crates.

use std::{
    fmt,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// Address suffix used by WhatsApp for one-to-one chats.
const USER_SUFFIX: &str = "@s.whatsapp.net";

/// Address suffix used by WhatsApp for group chats.
const GROUP_SUFFIX: &str = "@g.us";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Stable identifier for a sender's thread, derived from the transport
/// address (e.g. `15551234567@s.whatsapp.net`). Equality is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Whether the address belongs to a group conversation.
    pub fn is_group(&self) -> bool {
        self.0.ends_with(GROUP_SUFFIX)
    }

    /// The bare phone number: transport suffix removed, non-digits dropped.
    pub fn phone_digits(&self) -> String {
        let bare = self.0.strip_suffix(USER_SUFFIX).unwrap_or(&self.0);
        bare.chars().filter(char::is_ascii_digit).collect()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ConversationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of one logical inbound message.
///
/// Two events carrying the same key are the same message, whatever the
/// transport did to deliver them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn new(conversation: &ConversationId, timestamp: i64, message_id: &str) -> Self {
        Self(format!("{conversation}_{timestamp}_{message_id}"))
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Something the relay sends back to a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Text(String),
    /// A push-to-talk voice note read from a local file.
    Voice { path: PathBuf, mime_type: String },
}

impl OutboundPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Voice { .. } => "voice",
        }
    }
}

/// Chat-state indicator shown to the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Composing,
    Paused,
}
