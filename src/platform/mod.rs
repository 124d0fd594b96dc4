//! Music platform clients
//!
//! Provides a unified interface to the upstream platforms that supply track
//! metadata and download URLs.

/// Direct-link platform: plain http(s) audio URLs.
pub mod direct;

pub use direct::DirectLinkPlatform;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during platform operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The track does not exist
    #[error("Track not found: {0}")]
    NotFound(String),
    /// The request cannot be served by this platform
    #[error("Unsupported: {0}")]
    Unsupported(String),
    /// Upstream rate limit, optionally with a wait time
    #[error("Rate limit exceeded (wait: {wait_secs:?}s)")]
    RateLimited {
        /// Retry-After duration in seconds, if provided by the server
        wait_secs: Option<u64>,
    },
    /// The track exists but cannot be downloaded right now
    #[error("Unavailable: {0}")]
    Unavailable(String),
    /// Credentials are missing or rejected
    #[error("Authorization required: {0}")]
    AuthRequired(String),
    /// Connectivity failure or timeout
    #[error("Network error: {0}")]
    Network(String),
}

impl PlatformError {
    /// Whether the platform client's own retry policy should try again.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Requested audio quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Quality {
    /// Smallest available stream
    Low,
    /// Platform default
    #[default]
    Standard,
    /// Highest lossy bitrate
    High,
    /// Lossless stream
    Lossless,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Standard => "standard",
            Self::High => "high",
            Self::Lossless => "lossless",
        };
        f.write_str(s)
    }
}

/// Track metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Platform name
    pub platform: String,
    /// Platform-specific track id
    pub id: String,
    /// Track title
    pub title: String,
    /// Track artist
    pub artist: String,
    /// Duration in seconds, if known
    pub duration_secs: Option<u32>,
}

/// Where and how to fetch the audio stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadInfo {
    /// Direct download URL
    pub url: String,
    /// Headers required by the upstream CDN
    pub headers: HashMap<String, String>,
    /// File extension for the temporary file
    pub extension: String,
    /// Content length, if known
    pub size: Option<u64>,
}

/// Interface for music platforms
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MusicPlatform: Send + Sync {
    /// Platform name used in request keys
    fn name(&self) -> &str;
    /// Fetch track metadata
    async fn get_track(&self, track_id: &str) -> Result<Track, PlatformError>;
    /// Resolve a download URL for the given quality
    async fn get_download_info(
        &self,
        track_id: &str,
        quality: Quality,
    ) -> Result<DownloadInfo, PlatformError>;
    /// Search tracks by free text
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Track>, PlatformError>;
    /// List the tracks of a playlist
    async fn get_playlist(&self, playlist_id: &str) -> Result<Vec<Track>, PlatformError>;
}

/// Registry of configured platforms, looked up by name
#[derive(Default, Clone)]
pub struct PlatformRegistry {
    platforms: HashMap<String, Arc<dyn MusicPlatform>>,
}

impl PlatformRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a platform under its own name
    pub fn register(&mut self, platform: Arc<dyn MusicPlatform>) {
        self.platforms.insert(platform.name().to_string(), platform);
    }

    /// Look up a platform by name
    ///
    /// # Errors
    ///
    /// Returns `PlatformError::Unsupported` when no platform has that name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn MusicPlatform>, PlatformError> {
        self.platforms
            .get(name)
            .cloned()
            .ok_or_else(|| PlatformError::Unsupported(format!("unknown platform {name}")))
    }

    /// Number of registered platforms
    #[must_use]
    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    /// Whether no platform is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}
