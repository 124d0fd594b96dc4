//! Interaction state for paginated and callback-driven views
//!
//! Three independent stores, each with its own lock and expiry window:
//! pagination state per message, cross-reference tokens for paged inline
//! results, and the last page a message displayed.

mod ttl;

pub use ttl::{TtlPolicy, TtlStore};

use crate::chat::MessageRef;
use crate::platform::Track;
use std::time::Duration;

/// Default window for pagination state.
pub const PAGINATION_TTL: Duration = Duration::from_secs(30 * 60);
/// Default window for cross-reference tokens.
pub const CROSS_REF_TTL: Duration = Duration::from_secs(10 * 60);
/// Default cap on live cross-reference tokens.
pub const CROSS_REF_MAX_ENTRIES: usize = 1000;
/// Default window for last-shown-page markers.
pub const PAGE_MARKER_TTL: Duration = Duration::from_secs(30 * 60);

/// Expiry settings for the interaction stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Pagination state window (sliding)
    pub pagination_ttl: Duration,
    /// Cross-reference window (sliding)
    pub cross_ref_ttl: Duration,
    /// Cross-reference entry cap
    pub cross_ref_max_entries: usize,
    /// Page marker window (fixed)
    pub page_marker_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pagination_ttl: PAGINATION_TTL,
            cross_ref_ttl: CROSS_REF_TTL,
            cross_ref_max_entries: CROSS_REF_MAX_ENTRIES,
            page_marker_ttl: PAGE_MARKER_TTL,
        }
    }
}

/// Browsing state of a search or playlist result message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationState {
    /// Platform the results came from
    pub platform: String,
    /// Query or playlist id that produced the results
    pub query: String,
    /// All result tracks
    pub tracks: Vec<Track>,
    /// Zero-based page currently shown
    pub page: usize,
    /// Tracks per page
    pub page_size: usize,
}

impl PaginationState {
    /// Number of pages, at least one
    #[must_use]
    pub fn page_count(&self) -> usize {
        if self.page_size == 0 {
            return 1;
        }
        self.tracks.len().div_ceil(self.page_size).max(1)
    }

    /// Tracks of the current page
    #[must_use]
    pub fn current_page(&self) -> &[Track] {
        let start = self.page.saturating_mul(self.page_size).min(self.tracks.len());
        let end = start.saturating_add(self.page_size).min(self.tracks.len());
        &self.tracks[start..end]
    }

    /// Copy of this state moved to another page, clamped to the valid range
    #[must_use]
    pub fn with_page(&self, page: usize) -> Self {
        let mut next = self.clone();
        next.page = page.min(self.page_count() - 1);
        next
    }
}

/// Target of a cross-reference token used by paged inline results
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedResultRef {
    /// Platform to query
    pub platform: String,
    /// Query text
    pub query: String,
    /// Result offset of the referenced page
    pub offset: usize,
}

/// Which paged view a message showed last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageMarker {
    /// View identifier (e.g. "search", "playlist")
    pub view: String,
    /// Page shown
    pub page: usize,
}

/// Pagination state keyed by the message showing it
pub struct PaginationStore {
    inner: TtlStore<MessageRef, PaginationState>,
}

impl PaginationStore {
    /// Create a store with a sliding window
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: TtlStore::new(TtlPolicy::sliding(ttl)),
        }
    }

    /// Store the state of a message
    pub fn put(&self, message: MessageRef, state: PaginationState) {
        self.inner.put(message, state);
    }

    /// Fetch the state of a message, renewing it
    #[must_use]
    pub fn get(&self, message: &MessageRef) -> Option<PaginationState> {
        self.inner.get(message)
    }

    /// Move a message to another page, returning the new state
    pub fn turn_page(&self, message: &MessageRef, page: usize) -> Option<PaginationState> {
        let mut turned = None;
        self.inner.modify(message, |state| {
            let next = state.with_page(page);
            turned = Some(next.clone());
            next
        });
        turned
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Short tokens standing in for paged inline queries
pub struct CrossRefStore {
    inner: TtlStore<String, PagedResultRef>,
}

impl CrossRefStore {
    /// Create a store with a sliding window and an entry cap
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: TtlStore::new(TtlPolicy::sliding(ttl).with_max_entries(max_entries)),
        }
    }

    /// Store a reference under a fresh token and return the token
    pub fn insert(&self, target: PagedResultRef) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string()[..16].to_string();
        self.inner.put(token.clone(), target);
        token
    }

    /// Resolve a token, renewing it
    #[must_use]
    pub fn resolve(&self, token: &str) -> Option<PagedResultRef> {
        self.inner.get(&token.to_string())
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Last page shown by a message
pub struct PageMarkerStore {
    inner: TtlStore<MessageRef, PageMarker>,
}

impl PageMarkerStore {
    /// Create a store with a fixed window
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: TtlStore::new(TtlPolicy::fixed(ttl)),
        }
    }

    /// Record the page a message shows
    pub fn mark(&self, message: MessageRef, marker: PageMarker) {
        self.inner.put(message, marker);
    }

    /// Last page recorded for a message
    #[must_use]
    pub fn last(&self, message: &MessageRef) -> Option<PageMarker> {
        self.inner.get(message)
    }

    /// Whether the message already shows exactly this page
    #[must_use]
    pub fn is_showing(&self, message: &MessageRef, marker: &PageMarker) -> bool {
        self.last(message).as_ref() == Some(marker)
    }
}

/// The interaction stores used by paginated and callback surfaces
pub struct InteractionState {
    /// Pagination state per result message
    pub pagination: PaginationStore,
    /// Tokens for paged inline results
    pub cross_refs: CrossRefStore,
    /// Last page shown per message
    pub page_markers: PageMarkerStore,
}

impl InteractionState {
    /// Build all stores from their settings
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            pagination: PaginationStore::new(config.pagination_ttl),
            cross_refs: CrossRefStore::new(config.cross_ref_ttl, config.cross_ref_max_entries),
            page_markers: PageMarkerStore::new(config.page_marker_ttl),
        }
    }
}

impl Default for InteractionState {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks(n: usize) -> Vec<Track> {
        (0..n)
            .map(|i| Track {
                platform: "direct".to_string(),
                id: i.to_string(),
                title: format!("Track {i}"),
                artist: String::new(),
                duration_secs: None,
            })
            .collect()
    }

    fn pagination(n: usize) -> PaginationState {
        PaginationState {
            platform: "direct".to_string(),
            query: "q".to_string(),
            tracks: tracks(n),
            page: 0,
            page_size: 5,
        }
    }

    #[test]
    fn pages_are_clamped() {
        let state = pagination(12);
        assert_eq!(state.page_count(), 3);
        assert_eq!(state.with_page(2).current_page().len(), 2);
        assert_eq!(state.with_page(99).page, 2);
        assert_eq!(pagination(0).page_count(), 1);
        assert!(pagination(0).current_page().is_empty());
    }

    #[test]
    fn turn_page_replaces_stored_state() {
        let store = PaginationStore::new(PAGINATION_TTL);
        let msg = MessageRef::new(1, 10);
        store.put(msg, pagination(12));

        let turned = store.turn_page(&msg, 1);
        assert_eq!(turned.map(|s| s.page), Some(1));
        assert_eq!(store.get(&msg).map(|s| s.page), Some(1));
        assert!(store.turn_page(&MessageRef::new(1, 11), 1).is_none());
    }

    #[test]
    fn cross_ref_tokens_resolve() {
        let store = CrossRefStore::new(CROSS_REF_TTL, 10);
        let target = PagedResultRef {
            platform: "direct".to_string(),
            query: "song".to_string(),
            offset: 20,
        };
        let token = store.insert(target.clone());

        assert_eq!(token.len(), 16);
        assert_eq!(store.resolve(&token), Some(target));
        assert_eq!(store.resolve("unknown"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn page_marker_expires_even_when_read() {
        let store = PageMarkerStore::new(PAGE_MARKER_TTL);
        let msg = MessageRef::new(1, 1);
        let marker = PageMarker {
            view: "search".to_string(),
            page: 3,
        };
        store.mark(msg, marker.clone());

        tokio::time::advance(PAGE_MARKER_TTL / 2).await;
        assert!(store.is_showing(&msg, &marker));
        tokio::time::advance(PAGE_MARKER_TTL / 2 + Duration::from_secs(1)).await;
        assert!(store.last(&msg).is_none());
    }
}
