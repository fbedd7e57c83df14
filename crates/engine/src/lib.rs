//! Relay core: turns inbound WhatsApp events into backend replies.
//!
//! Text messages are deduplicated, batched per conversation and answered
//! once the sender goes quiet. Voice notes bypass batching. Replies that
//! cannot be delivered are queued on disk and flushed when the session
//! comes back.

pub mod batch;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod pending;
pub mod retry;
pub mod snapshot;
pub mod supervisor;
pub mod text;
pub mod voice;

pub use {
    engine::{APOLOGY, Delivery, Engine, EngineStats, EngineStatus, FlushReport},
    error::{AiServiceError, Error, Result},
    supervisor::{ConnectionState, ConnectionStatus, ReconnectRequest},
    text::{AiClient, Responder},
    voice::{VoiceBackend, VoiceClient},
};
