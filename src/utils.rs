//! Utility functions for status text formatting and upstream retries.

use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

/// Initial backoff between upstream platform retries.
pub const UPSTREAM_INITIAL_BACKOFF_MS: u64 = 500;
/// Upper bound for a single upstream backoff step.
pub const UPSTREAM_MAX_BACKOFF_MS: u64 = 4000;
/// Number of retries for transient upstream failures.
pub const UPSTREAM_MAX_RETRIES: usize = 3;

/// Truncates a string to a maximum number of characters, respecting UTF-8 boundaries.
///
/// # Examples
///
/// ```
/// use oxide_music::utils::truncate_str;
/// let s = "Привет, мир!";
/// assert_eq!(truncate_str(s, 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Renders "artist - title" as escaped HTML, truncated for status messages.
#[must_use]
pub fn track_label(artist: &str, title: &str) -> String {
    let label = if artist.is_empty() {
        title.to_string()
    } else {
        format!("{artist} - {title}")
    };
    html_escape::encode_text(&truncate_str(label, 80)).into_owned()
}

/// Retry an upstream platform call with exponential backoff.
///
/// Only errors for which `is_transient` returns `true` are retried; permanent
/// failures (not found, unsupported, ...) are returned on the first attempt.
///
/// # Errors
///
/// Returns the last error once retries are exhausted or a permanent error occurs.
pub async fn retry_upstream_operation<F, Fut, T, E, P>(operation: F, is_transient: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let retry_strategy = ExponentialBackoff::from_millis(UPSTREAM_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(UPSTREAM_MAX_BACKOFF_MS))
        .map(jitter)
        .take(UPSTREAM_MAX_RETRIES);

    RetryIf::start(retry_strategy, operation, is_transient)
        .await
        .map_err(|e| {
            warn!(error = %e, "Upstream operation failed after retries");
            e
        })
}
