use {
    async_trait::async_trait,
    bytes::Bytes,
    parley_common::{ConversationId, OutboundPayload, Presence},
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
};

use crate::error::{Result, SendError};

/// Sending half of a transport's event stream.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of a transport's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Everything a transport reports to the relay.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connection(ConnectionUpdate),
    Inbound(InboundMessage),
}

/// Connection progress as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// A session handshake is under way.
    Connecting,
    /// The device must be paired; `token` is rendered as a QR code.
    PairingRequired { token: String },
    /// The session is live.
    Open { user: Option<String> },
    Closed { reason: CloseReason },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The linked device was removed; only re-pairing can recover.
    LoggedOut,
    /// Network drop, server restart, stream error: worth reconnecting.
    Recoverable {
        message: String,
        status: Option<u16>,
    },
}

impl CloseReason {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
            status: None,
        }
    }
}

/// One message delivered by the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub conversation: ConversationId,
    pub message_id: String,
    /// Transport timestamp (seconds).
    pub timestamp: i64,
    pub from_self: bool,
    pub is_group: bool,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    /// Plain, extended or caption text.
    Text(String),
    Audio(AudioAttachment),
    /// Stickers, reactions, protocol messages and the like.
    Unsupported,
}

/// Metadata of an audio attachment; the bytes are fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioAttachment {
    /// Push-to-talk voice note, as opposed to a shared audio file.
    pub ptt: bool,
    pub mime_type: Option<String>,
    pub seconds: u32,
    pub file_length: Option<u64>,
}

/// Outbound primitives of a messaging transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start or restart a session. Progress is reported as
    /// [`ConnectionUpdate`] events; an `Err` means the attempt could not even
    /// be started.
    async fn connect(&self) -> Result<()>;

    async fn send(
        &self,
        to: &ConversationId,
        payload: &OutboundPayload,
    ) -> std::result::Result<(), SendError>;

    /// Update the chat-state indicator.
    async fn send_presence(&self, to: &ConversationId, presence: Presence) -> Result<()>;

    /// Send a read receipt for an inbound message.
    async fn mark_read(&self, to: &ConversationId, message_id: &str) -> Result<()>;

    /// Download the audio bytes of an inbound message.
    async fn download_audio(&self, to: &ConversationId, message_id: &str) -> Result<Bytes>;
}
