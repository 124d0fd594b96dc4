//! Request coalescing: concurrent identical upstream calls share one execution.

use super::PipelineError;
use crate::platform::Quality;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

/// Upstream operation being coalesced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOp {
    /// Track metadata lookup
    Track,
    /// Download URL resolution
    DownloadInfo,
    /// Download of a prepared audio file
    Prepared,
}

/// Identity of an upstream call
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    /// Operation
    pub op: CallOp,
    /// Platform name
    pub platform: String,
    /// Track id on the platform
    pub track_id: String,
    /// Requested quality, for quality-dependent operations
    pub quality: Option<Quality>,
}

impl CallKey {
    /// Key of a metadata lookup
    #[must_use]
    pub fn track(platform: &str, track_id: &str) -> Self {
        Self {
            op: CallOp::Track,
            platform: platform.to_string(),
            track_id: track_id.to_string(),
            quality: None,
        }
    }

    /// Key of a download URL resolution
    #[must_use]
    pub fn download_info(platform: &str, track_id: &str, quality: Quality) -> Self {
        Self {
            op: CallOp::DownloadInfo,
            platform: platform.to_string(),
            track_id: track_id.to_string(),
            quality: Some(quality),
        }
    }

    /// Key of a file download
    #[must_use]
    pub fn prepared(platform: &str, track_id: &str, quality: Quality) -> Self {
        Self {
            op: CallOp::Prepared,
            platform: platform.to_string(),
            track_id: track_id.to_string(),
            quality: Some(quality),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}:{}", self.op, self.platform, self.track_id)?;
        if let Some(q) = self.quality {
            write!(f, ":{q}")?;
        }
        Ok(())
    }
}

type SharedCall<T> = Shared<BoxFuture<'static, Result<T, PipelineError>>>;

/// Table of in-flight calls keyed by their identity.
///
/// Every awaiter receives its own clone of the result, so callers may mutate
/// what they get back without affecting each other.
pub struct Coalescer<K, T>
where
    T: Clone,
{
    in_flight: Arc<Mutex<HashMap<K, SharedCall<T>>>>,
}

impl<K, T> Default for Coalescer<K, T>
where
    T: Clone,
{
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, T> Coalescer<K, T>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `call` for `key`, or join the execution already in flight.
    ///
    /// Only the first caller's closure runs, on its own task, so it finishes
    /// even when every awaiter goes away. The entry is removed when the
    /// execution completes, so a later call with the same key starts afresh.
    ///
    /// # Errors
    ///
    /// Returns the shared execution's error.
    pub async fn run<F, Fut>(&self, key: K, call: F) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        let shared = {
            let mut table = self.in_flight.lock();
            if let Some(existing) = table.get(&key) {
                debug!(key = %key, "Joining in-flight call");
                existing.clone()
            } else {
                let entry = EntryGuard {
                    table: Arc::clone(&self.in_flight),
                    key: key.clone(),
                };
                let fut = call();
                // the entry is inserted before the lock is released, so the
                // guard can never remove it early
                let handle = tokio::spawn(async move {
                    let _entry = entry;
                    fut.await
                });
                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        if e.is_cancelled() {
                            Err(PipelineError::Closed)
                        } else {
                            Err(PipelineError::Transient(format!("coalesced call panicked: {e}")))
                        }
                    })
                }
                .boxed()
                .shared();
                table.insert(key, shared.clone());
                shared
            }
        };
        shared.await
    }

    /// Number of executions in flight
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Removes an in-flight entry when its execution ends, however it ends
struct EntryGuard<K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    table: Arc<Mutex<HashMap<K, SharedCall<T>>>>,
    key: K,
}

impl<K, T> Drop for EntryGuard<K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    fn drop(&mut self) {
        self.table.lock().remove(&self.key);
    }
}
