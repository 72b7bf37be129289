//! Cached concept index.
//!
//! The similarity phase reads the full active-concept projection many times
//! per session; this cache bounds that to one storage read per TTL window.
//! Time is injected through [`Clock`] so expiry is testable without waiting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use conceptforge_shared::{ConceptIndexEntry, Result};
use conceptforge_storage::Storage;

/// Injected time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> std::time::Instant;
}

/// Wall-clock implementation used outside tests.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }
}

struct CacheState {
    entries: Vec<ConceptIndexEntry>,
    fetched_at: std::time::Instant,
}

/// TTL cache over [`Storage::concept_index`]. Owned by the manager; there
/// are no globals.
pub struct ConceptIndexCache {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    state: Mutex<Option<CacheState>>,
}

impl ConceptIndexCache {
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            storage,
            clock,
            ttl,
            state: Mutex::new(None),
        }
    }

    /// Return the index, refreshing from storage when the cached copy is
    /// missing, expired, or `force_refresh` is set.
    pub async fn get(&self, force_refresh: bool) -> Result<Vec<ConceptIndexEntry>> {
        let mut state = self.state.lock().await;

        let fresh = match state.as_ref() {
            Some(cached) if !force_refresh => {
                self.clock.now().duration_since(cached.fetched_at) < self.ttl
            }
            _ => false,
        };

        if !fresh {
            let entries = self.storage.concept_index().await?;
            tracing::debug!(count = entries.len(), "refreshed concept index");
            *state = Some(CacheState {
                entries,
                fetched_at: self.clock.now(),
            });
        }

        Ok(state.as_ref().map(|s| s.entries.clone()).unwrap_or_default())
    }

    /// Drop the cached copy. Called after any concept write.
    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}
