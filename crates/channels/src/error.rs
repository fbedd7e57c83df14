use std::error::Error as StdError;

/// Crate-wide result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed transport errors shared across transport implementations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Operation needs a live session and there is none.
    #[error("transport not connected")]
    NotConnected,

    /// Operation is currently unavailable (not configured/ready).
    #[error("transport operation unavailable: {message}")]
    Unavailable { message: String },

    /// The remote side answered but refused the request.
    #[error("transport rejected request: {message}")]
    Rejected { message: String },

    /// Wrapped source error from an external dependency.
    #[error("transport operation failed: {context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn unavailable(message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn rejected(message: impl std::fmt::Display) -> Self {
        Self::Rejected {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

/// Why an outbound send did not go through.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No live session; the caller should queue the payload instead of waiting.
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Transport(#[from] Error),
}

impl SendError {
    /// Whether the failure was caused by a missing session.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Transport(Error::NotConnected))
    }
}
