//! Song cache repository
//!
//! Remembers which tracks were already uploaded to the chat platform so a
//! repeated request can be answered by resending the stored file id.

use crate::platform::Quality;
use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The referenced song is not stored
    #[error("Song not cached: {0}")]
    Missing(String),
    /// Backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Lookup key of a cached song
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SongKey {
    /// Platform name
    pub platform: String,
    /// Platform-specific track id
    pub track_id: String,
    /// Quality the file was downloaded in
    pub quality: Quality,
}

impl SongKey {
    /// Create a new key
    #[must_use]
    pub fn new(platform: impl Into<String>, track_id: impl Into<String>, quality: Quality) -> Self {
        Self {
            platform: platform.into(),
            track_id: track_id.into(),
            quality,
        }
    }
}

/// A previously delivered track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedSong {
    /// Lookup key
    pub key: SongKey,
    /// Chat-platform file id of the uploaded audio
    pub file_id: String,
    /// Track title
    pub title: String,
    /// Track artist
    pub artist: String,
    /// Duration in seconds, if known
    pub duration_secs: Option<u32>,
    /// How many times the file was sent
    pub send_count: u64,
}

/// Interface for song cache repositories
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SongCache: Send + Sync {
    /// Find a delivered song by platform, track id and quality
    async fn find_by_key(
        &self,
        platform: &str,
        track_id: &str,
        quality: Quality,
    ) -> Result<Option<CachedSong>, StorageError>;
    /// Store a newly delivered song
    async fn create(&self, song: CachedSong) -> Result<(), StorageError>;
    /// Increment the send counter of a stored song
    async fn increment_send_count(&self, key: &SongKey) -> Result<(), StorageError>;
}

/// In-process song cache with a bounded number of entries
#[derive(Clone)]
pub struct MemorySongCache {
    cache: Cache<SongKey, CachedSong>,
}

impl MemorySongCache {
    /// Creates a cache holding at most `max_capacity` songs
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder().max_capacity(max_capacity).build(),
        }
    }

    /// Returns the current number of entries in the cache
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl SongCache for MemorySongCache {
    async fn find_by_key(
        &self,
        platform: &str,
        track_id: &str,
        quality: Quality,
    ) -> Result<Option<CachedSong>, StorageError> {
        Ok(self
            .cache
            .get(&SongKey::new(platform, track_id, quality))
            .await)
    }

    async fn create(&self, song: CachedSong) -> Result<(), StorageError> {
        debug!(platform = %song.key.platform, track_id = %song.key.track_id, "Caching delivered song");
        self.cache.insert(song.key.clone(), song).await;
        Ok(())
    }

    async fn increment_send_count(&self, key: &SongKey) -> Result<(), StorageError> {
        let entry = self
            .cache
            .entry(key.clone())
            .and_compute_with(|existing| async move {
                match existing {
                    Some(entry) => {
                        let mut song = entry.into_value();
                        song.send_count += 1;
                        moka::ops::compute::Op::Put(song)
                    }
                    None => moka::ops::compute::Op::Nop,
                }
            })
            .await;

        match entry {
            moka::ops::compute::CompResult::StillNone(_) => {
                Err(StorageError::Missing(format!("{}:{}", key.platform, key.track_id)))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn song(track_id: &str) -> CachedSong {
        CachedSong {
            key: SongKey::new("direct", track_id, Quality::Standard),
            file_id: format!("file-{track_id}"),
            title: "Title".to_string(),
            artist: "Artist".to_string(),
            duration_secs: Some(180),
            send_count: 1,
        }
    }

    #[tokio::test]
    async fn create_then_find() -> Result<(), StorageError> {
        let cache = MemorySongCache::new(100);
        cache.create(song("a")).await?;

        let found = cache.find_by_key("direct", "a", Quality::Standard).await?;
        assert_eq!(found.map(|s| s.file_id), Some("file-a".to_string()));

        let other_quality = cache.find_by_key("direct", "a", Quality::High).await?;
        assert!(other_quality.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn send_count_increments() -> Result<(), StorageError> {
        let cache = MemorySongCache::new(100);
        let s = song("b");
        let key = s.key.clone();
        cache.create(s).await?;

        cache.increment_send_count(&key).await?;
        cache.increment_send_count(&key).await?;

        let found = cache.find_by_key("direct", "b", Quality::Standard).await?;
        assert_eq!(found.map(|s| s.send_count), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn increment_missing_song_fails() {
        let cache = MemorySongCache::new(100);
        let key = SongKey::new("direct", "missing", Quality::Standard);
        assert!(matches!(
            cache.increment_send_count(&key).await,
            Err(StorageError::Missing(_))
        ));
    }
}
