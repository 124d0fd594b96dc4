//! Rate-limited retry governor for outbound chat API calls.
//!
//! Every call first takes a token from the optional global bucket, then from
//! the destination's own bucket. Rate-limit responses are either retried
//! after the server-provided delay or, for droppable updates, discarded.

use super::PipelineError;
use crate::chat::{ChatError, RetrySignal};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default per-destination rate (messages per second).
pub const DEFAULT_CHAT_RATE: f64 = 1.0;
/// Default per-destination burst.
pub const DEFAULT_CHAT_BURST: u32 = 1;
/// Default global rate (messages per second).
pub const DEFAULT_GLOBAL_RATE: f64 = 30.0;
/// Default global burst.
pub const DEFAULT_GLOBAL_BURST: u32 = 30;
/// Idle time after which a destination bucket is forgotten.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(30 * 60);
/// Interval between idle-bucket sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Attempts per call before giving up on a rate-limited destination.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Token bucket parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Sustained rate in tokens per second
    pub rate_per_sec: f64,
    /// Bucket size
    pub burst: u32,
}

impl BucketConfig {
    /// Build a governor quota; `None` for a non-positive rate or zero burst.
    #[must_use]
    pub fn quota(&self) -> Option<Quota> {
        if !self.rate_per_sec.is_finite() || self.rate_per_sec <= 0.0 {
            return None;
        }
        let burst = NonZeroU32::new(self.burst)?;
        let period = Duration::from_secs_f64(1.0 / self.rate_per_sec);
        Quota::with_period(period).map(|q| q.allow_burst(burst))
    }
}

/// Governor settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GovernorConfig {
    /// Bucket applied to each destination
    pub per_chat: BucketConfig,
    /// Bucket shared by all destinations, if any
    pub global: Option<BucketConfig>,
    /// Inactivity after which a destination bucket is evicted
    pub idle_ttl: Duration,
    /// Interval of the eviction sweep
    pub sweep_interval: Duration,
    /// Attempts per call (first try included)
    pub max_attempts: u32,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            per_chat: BucketConfig {
                rate_per_sec: DEFAULT_CHAT_RATE,
                burst: DEFAULT_CHAT_BURST,
            },
            global: Some(BucketConfig {
                rate_per_sec: DEFAULT_GLOBAL_RATE,
                burst: DEFAULT_GLOBAL_BURST,
            }),
            idle_ttl: DEFAULT_IDLE_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// What happened to a governed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    /// The operation succeeded
    Done(T),
    /// The platform reported the edit as a no-op
    NotModified,
    /// A best-effort call hit the rate limit and was discarded
    Dropped,
}

impl<T> CallOutcome<T> {
    /// The value of a successful call
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Done(v) => Some(v),
            Self::NotModified | Self::Dropped => None,
        }
    }

    /// The value of a successful call, or an error for calls that must produce one
    ///
    /// # Errors
    ///
    /// Returns `ChatError::NotModified` for a no-op outcome and `PipelineError::Canceled`
    /// for a dropped call.
    pub fn into_result(self) -> Result<T, PipelineError> {
        match self {
            Self::Done(v) => Ok(v),
            Self::NotModified => Err(PipelineError::Chat(ChatError::NotModified)),
            Self::Dropped => Err(PipelineError::Canceled),
        }
    }
}

struct ThrottleEntry {
    limiter: Arc<DefaultDirectRateLimiter>,
    last_used: Instant,
}

/// Per-destination token buckets plus an optional global bucket
pub struct RateGovernor {
    per_chat: Quota,
    global: Option<DefaultDirectRateLimiter>,
    entries: Mutex<HashMap<i64, ThrottleEntry>>,
    idle_ttl: Duration,
    sweep_interval: Duration,
    max_attempts: u32,
}

impl RateGovernor {
    /// Create a governor from its settings
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Config` if the per-destination bucket is invalid.
    pub fn new(config: GovernorConfig) -> Result<Self, PipelineError> {
        let per_chat = config.per_chat.quota().ok_or_else(|| {
            PipelineError::Config(format!("invalid per-chat bucket: {:?}", config.per_chat))
        })?;
        let global = config
            .global
            .and_then(|g| g.quota())
            .map(RateLimiter::direct);

        Ok(Self {
            per_chat,
            global,
            entries: Mutex::new(HashMap::new()),
            idle_ttl: config.idle_ttl,
            sweep_interval: config.sweep_interval,
            max_attempts: config.max_attempts.max(1),
        })
    }

    fn limiter_for(&self, destination: i64) -> Arc<DefaultDirectRateLimiter> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(destination).or_insert_with(|| ThrottleEntry {
            limiter: Arc::new(RateLimiter::direct(self.per_chat)),
            last_used: now,
        });
        entry.last_used = now;
        Arc::clone(&entry.limiter)
    }

    /// Block until both the global and the destination bucket grant a token.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Canceled` as soon as `cancel` fires.
    pub async fn wait(
        &self,
        destination: i64,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if let Some(global) = &self.global {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PipelineError::Canceled),
                () = global.until_ready() => {}
            }
        }

        let limiter = self.limiter_for(destination);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PipelineError::Canceled),
            () = limiter.until_ready() => Ok(()),
        }
    }

    /// Run a call, delaying and retrying on rate-limit responses.
    ///
    /// # Errors
    ///
    /// Returns `MaxRetriesExceeded` once every attempt was rate limited,
    /// `Canceled` if `cancel` fires, or the operation's own error.
    pub async fn with_retry<T, F, Fut>(
        &self,
        destination: i64,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<CallOutcome<T>, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChatError>>,
    {
        self.call(destination, cancel, false, operation).await
    }

    /// Run a droppable call once; a rate-limit response discards it silently.
    ///
    /// # Errors
    ///
    /// Returns `Canceled` if `cancel` fires, or the operation's non rate-limit error.
    pub async fn best_effort<T, F, Fut>(
        &self,
        destination: i64,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<CallOutcome<T>, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChatError>>,
    {
        self.call(destination, cancel, true, operation).await
    }

    /// Shared wait-call-retry loop; only the rate-limit reaction differs.
    ///
    /// # Errors
    ///
    /// See [`Self::with_retry`] and [`Self::best_effort`].
    pub async fn call<T, F, Fut>(
        &self,
        destination: i64,
        cancel: &CancellationToken,
        drop_on_rate_limit: bool,
        mut operation: F,
    ) -> Result<CallOutcome<T>, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChatError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.wait(destination, cancel).await?;

            let err = match operation().await {
                Ok(value) => return Ok(CallOutcome::Done(value)),
                Err(ChatError::NotModified) => return Ok(CallOutcome::NotModified),
                Err(err) => err,
            };

            let Some(signal) = RetrySignal::from_error(&err) else {
                return Err(PipelineError::Chat(err));
            };

            if drop_on_rate_limit {
                debug!(
                    chat_id = destination,
                    retry_after = ?signal.retry_after,
                    "Dropping best-effort update due to rate limit"
                );
                return Ok(CallOutcome::Dropped);
            }

            if attempt >= self.max_attempts {
                warn!(
                    chat_id = destination,
                    attempts = attempt,
                    "Chat API still rate limited, giving up"
                );
                return Err(PipelineError::MaxRetriesExceeded {
                    attempts: attempt,
                    last: err,
                });
            }

            warn!(
                chat_id = destination,
                attempt,
                retry_after = ?signal.retry_after,
                "Chat API rate limited, delaying"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(PipelineError::Canceled),
                () = tokio::time::sleep(signal.retry_after) => {}
            }
        }
    }

    /// Forget destination buckets idle for longer than the TTL.
    ///
    /// Returns the number of evicted buckets.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.last_used) <= self.idle_ttl);
        before - entries.len()
    }

    /// Number of destinations with a live bucket
    #[must_use]
    pub fn tracked_destinations(&self) -> usize {
        self.entries.lock().len()
    }

    /// Spawn the periodic idle-bucket sweeper
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(governor.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = governor.sweep();
                        if evicted > 0 {
                            debug!(evicted, "Evicted idle throttle buckets");
                        }
                    }
                }
            }
            info!("Throttle sweeper stopped");
        })
    }
}
