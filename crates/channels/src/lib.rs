//! Messaging-transport boundary.
//!
//! The relay consumes a transport as an opaque event source
//! ([`TransportEvent`]) plus a handful of outbound primitives
//! ([`Transport`]). Session crypto, device sync and pairing live behind
//! this trait.

pub mod error;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use {
    error::{Error, Result, SendError},
    transport::{
        AudioAttachment, CloseReason, ConnectionUpdate, EventReceiver, EventSender,
        InboundMessage, MessageContent, Transport, TransportEvent,
    },
};
