use crate::chat::ChatError;
use crate::platform::PlatformError;
use crate::storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the delivery pipeline.
///
/// Cloneable so a coalesced failure can be handed to every waiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The chat platform kept rate limiting after every allowed attempt
    #[error("max retries exceeded after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        /// Attempts performed
        attempts: u32,
        /// Error of the last attempt
        last: ChatError,
    },
    /// Network failure, timeout or broken download
    #[error("transient failure: {0}")]
    Transient(String),
    /// The upload queue is full
    #[error("upload queue is full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity
        capacity: usize,
    },
    /// The caller canceled the operation
    #[error("operation canceled")]
    Canceled,
    /// A background component has shut down
    #[error("pipeline is shutting down")]
    Closed,
    /// Upstream music platform failure
    #[error(transparent)]
    Upstream(#[from] PlatformError),
    /// Chat platform failure that is not a rate limit
    #[error(transparent)]
    Chat(#[from] ChatError),
    /// Song cache failure
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Local file system failure
    #[error("I/O error: {0}")]
    Io(String),
    /// Invalid pipeline settings
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Coarse classification used by handlers to pick a reaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable later, with a server-provided delay
    RateLimited,
    /// Network, timeout or I/O failure
    Transient,
    /// Bounded queue saturated
    CapacityExceeded,
    /// Caller-initiated cancellation or shutdown
    Canceled,
    /// Upstream says no: not found, unsupported, auth, unavailable
    Permanent,
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl PipelineError {
    /// Classify the error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MaxRetriesExceeded { .. }
            | Self::Upstream(PlatformError::RateLimited { .. })
            | Self::Chat(ChatError::RateLimited { .. }) => ErrorKind::RateLimited,
            Self::Transient(_)
            | Self::Io(_)
            | Self::Storage(_)
            | Self::Upstream(PlatformError::Network(_))
            | Self::Chat(_) => ErrorKind::Transient,
            Self::QueueFull { .. } => ErrorKind::CapacityExceeded,
            Self::Canceled | Self::Closed => ErrorKind::Canceled,
            Self::Upstream(_) | Self::Config(_) => ErrorKind::Permanent,
        }
    }

    /// Server-provided delay, when the error carries one
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::MaxRetriesExceeded {
                last: ChatError::RateLimited { retry_after },
                ..
            }
            | Self::Chat(ChatError::RateLimited { retry_after }) => Some(*retry_after),
            Self::Upstream(PlatformError::RateLimited { wait_secs }) => {
                wait_secs.map(Duration::from_secs)
            }
            _ => None,
        }
    }

    /// Short status text shown to the user instead of the raw error
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Upstream(PlatformError::NotFound(_)) => "❌ Track not found",
            Self::Upstream(PlatformError::Unsupported(_)) => "❌ This link is not supported",
            Self::Upstream(PlatformError::AuthRequired(_)) => {
                "🔒 The platform requires authorization for this track"
            }
            Self::Upstream(PlatformError::Unavailable(_)) => {
                "⚠️ The track is unavailable right now, try later"
            }
            _ => match self.kind() {
                ErrorKind::RateLimited => "⏳ Too many requests, try later",
                ErrorKind::CapacityExceeded => "📦 Task queue is full, try later",
                ErrorKind::Canceled => "🚫 Canceled",
                ErrorKind::Transient | ErrorKind::Permanent => {
                    "⚠️ Something went wrong, try again"
                }
            },
        }
    }
}
