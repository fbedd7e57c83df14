//! Push-to-talk path: each voice note is answered on its own, never batched.

mod client;
mod handler;
pub mod messages;

use {async_trait::async_trait, bytes::Bytes, parley_common::ConversationId};

use crate::retry::RetryExhausted;

pub use {
    client::{VoiceClient, classify_reply},
    handler::{TempVoiceFile, VoiceContext, VoiceOutcome, VoicePipeline},
};

/// Mime type used when the backend does not name an audio type.
pub const DEFAULT_VOICE_MIME: &str = "audio/ogg; codecs=opus";

/// One voice note ready for the backend.
#[derive(Debug, Clone)]
pub struct VoiceJob {
    pub message_id: String,
    pub conversation: ConversationId,
    pub audio: Bytes,
    pub mime_type: String,
    pub duration_seconds: u32,
}

/// What the backend answered with, decided once from its declared
/// modality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendReply {
    Voice { audio: Bytes, mime_type: String },
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceResponse {
    pub reply: BackendReply,
    /// What the backend heard, if it said.
    pub transcription: Option<String>,
}

#[async_trait]
pub trait VoiceBackend: Send + Sync {
    async fn submit(&self, job: &VoiceJob) -> Result<VoiceResponse, RetryExhausted>;

    /// Liveness check; `false` on any failure.
    async fn probe(&self) -> bool;
}
