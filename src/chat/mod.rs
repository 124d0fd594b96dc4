//! Chat-platform client abstraction
//!
//! The pipeline talks to the chat platform only through [`ChatClient`], so the
//! delivery core can be exercised without a live bot token.

/// Telegram implementation of [`ChatClient`].
pub mod telegram;

pub use telegram::TelegramChat;

use async_trait::async_trait;
use lazy_regex::lazy_regex;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Fallback delay when a rate-limit message carries no explicit duration.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(3);

static RE_RETRY_AFTER: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?i)retry after (\d+)");
static RE_TOO_MANY: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?i)too many requests|flood");

/// Errors returned by chat-platform operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Flood control: the request may be repeated after the given delay
    #[error("Too Many Requests: retry after {}", retry_after.as_secs())]
    RateLimited {
        /// Server-provided delay before the next attempt
        retry_after: Duration,
    },
    /// The edit would not change the message
    #[error("message is not modified")]
    NotModified,
    /// The message to edit or delete no longer exists
    #[error("message not found")]
    MessageNotFound,
    /// Connectivity failure
    #[error("Network error: {0}")]
    Network(String),
    /// Any other API failure
    #[error("API error: {0}")]
    Api(String),
}

/// Reference to a message inside a chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    /// Chat the message belongs to
    pub chat_id: i64,
    /// Message identifier within the chat
    pub message_id: i32,
}

impl MessageRef {
    /// Create a new message reference
    #[must_use]
    pub const fn new(chat_id: i64, message_id: i32) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

/// Where the audio payload comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioSource {
    /// Freshly downloaded local file
    File(PathBuf),
    /// File already stored on the chat platform (cache hit)
    FileId(String),
}

/// Audio payload with its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioUpload {
    /// Payload source
    pub source: AudioSource,
    /// Track title
    pub title: String,
    /// Track performer
    pub performer: String,
    /// Duration in seconds, if known
    pub duration_secs: Option<u32>,
    /// Optional HTML caption
    pub caption: Option<String>,
}

/// Result of a successful audio delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredAudio {
    /// Message that carries the audio
    pub message: MessageRef,
    /// Platform file id, reusable for later resends
    pub file_id: Option<String>,
}

/// Interface for chat-platform clients
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send an HTML text message
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<MessageRef, ChatError>;
    /// Replace the text of an existing message
    async fn edit_message_text(&self, message: MessageRef, text: &str) -> Result<(), ChatError>;
    /// Replace the media of an existing message with an audio file
    async fn edit_message_media(
        &self,
        message: MessageRef,
        audio: &AudioUpload,
    ) -> Result<DeliveredAudio, ChatError>;
    /// Delete a message
    async fn delete_message(&self, message: MessageRef) -> Result<(), ChatError>;
    /// Send an audio file to a chat
    async fn send_audio(&self, chat_id: i64, audio: &AudioUpload)
        -> Result<DeliveredAudio, ChatError>;
}

/// Decoded "too many requests" indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySignal {
    /// Delay to honour before retrying
    pub retry_after: Duration,
}

impl RetrySignal {
    /// Extract a retry signal from a chat error.
    ///
    /// Structured [`ChatError::RateLimited`] errors are used directly; other
    /// errors fall back to matching the message text.
    #[must_use]
    pub fn from_error(err: &ChatError) -> Option<Self> {
        match err {
            ChatError::RateLimited { retry_after } => Some(Self {
                retry_after: *retry_after,
            }),
            ChatError::Api(msg) | ChatError::Network(msg) => Self::from_message(msg),
            ChatError::NotModified | ChatError::MessageNotFound => None,
        }
    }

    /// Match an error message such as `Too Many Requests: retry after 7`.
    #[must_use]
    pub fn from_message(msg: &str) -> Option<Self> {
        if let Some(secs) = RE_RETRY_AFTER
            .captures(msg)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        {
            return Some(Self {
                retry_after: Duration::from_secs(secs),
            });
        }
        RE_TOO_MANY.is_match(msg).then_some(Self {
            retry_after: DEFAULT_RETRY_AFTER,
        })
    }
}
