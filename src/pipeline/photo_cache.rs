//! Time-bounded cache of encoded chat avatars.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Default freshness window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    fetched_at: Instant,
}

/// Chat id to encoded avatar, fresh for `ttl` after each fetch.
///
/// Only successful fetches are stored, so a chat without a photo is looked
/// up again on its next message.
#[derive(Debug)]
pub struct PhotoCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for PhotoCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl PhotoCache {
    /// Create an empty cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh cached value for `chat_id`, if any.
    pub fn get(&self, chat_id: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(chat_id)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Return the cached value, or run `fetch` and cache a non-empty result.
    /// An empty result is treated as no photo.
    ///
    /// Expired entries are never returned. The lock is not held while
    /// `fetch` runs.
    pub async fn get_or_fetch<F, Fut>(&self, chat_id: &str, fetch: F) -> Option<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<String>>,
    {
        if let Some(hit) = self.get(chat_id) {
            debug!(chat_id, "profile photo cache hit");
            return Some(hit);
        }

        let value = fetch().await.filter(|value| !value.is_empty())?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                chat_id.to_owned(),
                CacheEntry {
                    value: value.clone(),
                    fetched_at: Instant::now(),
                },
            );
        }
        Some(value)
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, entry| entry.fetched_at.elapsed() < self.ttl);
        before.saturating_sub(entries.len())
    }

    /// Number of stored entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
