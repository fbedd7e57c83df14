use std::error::Error as StdError;

use crate::retry::FailureKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No live session. Replies are queued instead.
    #[error("transport disconnected")]
    TransportDisconnected,

    #[error("duplicate event {key}")]
    DuplicateEvent { key: String },

    #[error("backend unreachable: {message}")]
    BackendUnreachable { message: String },

    #[error("backend returned {status}: {body}")]
    BackendError { status: u16, body: String },

    #[error("audio payload too small: {size} bytes, minimum is {min}")]
    PayloadTooSmall { size: usize, min: usize },

    #[error("persistence failed: {context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The linked device was removed. Only re-pairing recovers.
    #[error("transport logged out")]
    LoggedOut,

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error(transparent)]
    Transport(#[from] parley_channels::Error),

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn persistence(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Persistence {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

impl parley_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

parley_common::impl_context!();

impl From<FailureKind> for Error {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Api { status, body } => Self::BackendError { status, body },
            FailureKind::Network { message } => Self::BackendUnreachable { message },
            FailureKind::Other { message } => Self::Message { message },
        }
    }
}

/// The text backend could not produce a reply within the retry bound.
#[derive(Debug, thiserror::Error)]
#[error("AI service failed after {attempts} attempt(s): {cause}")]
pub struct AiServiceError {
    pub attempts: u32,
    pub cause: String,
}
