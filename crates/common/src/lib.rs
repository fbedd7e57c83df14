//! Error-context helpers and domain primitives shared by the parley crates.

pub mod error;
pub mod types;

pub use {
    error::FromMessage,
    types::{ConversationId, DedupKey, OutboundPayload, Presence, now_ms},
};
