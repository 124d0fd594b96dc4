#![warn(missing_docs)]
//! Oxide Music core library.
//!
//! Resolves chat requests into music tracks, downloads them from upstream
//! platforms and delivers them back through the chat API, with rate limiting,
//! request coalescing, bounded downloads and a serialized upload queue.

/// Telegram transport: handlers and dispatcher wiring.
pub mod bot;
/// Chat-platform client abstraction.
pub mod chat;
/// Configuration management.
pub mod config;
/// Asynchronous delivery pipeline.
pub mod pipeline;
/// Music-platform client abstraction.
pub mod platform;
/// TTL-bounded interaction state.
pub mod state;
/// Song cache repository.
pub mod storage;
/// Utility functions.
pub mod utils;

/// In-memory fakes shared by unit tests.
#[cfg(test)]
pub mod testing;
