use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::readers::ParsedFile;

const DEFAULT_TTL: Duration = Duration::from_secs(300);
const DEFAULT_CAPACITY: usize = 16;

/// A process-wide parse cache keyed by file fingerprint.
///
/// A failed mapping retried with a corrected config hits this cache and skips
/// the re-parse. Entries expire after five minutes and the cache holds at most
/// `capacity` entries, evicting least-recently-used. This is an injected
/// dependency, not a singleton; tests construct a disabled one.
pub struct ParseCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    capacity: usize,
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    // most-recently-used at the back
    order: Vec<String>,
}

struct Entry {
    parsed: Arc<ParsedFile>,
    inserted_at: Instant,
}

impl Default for ParseCache {
    fn default() -> ParseCache {
        ParseCache::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl ParseCache {
    pub fn new(capacity: usize, ttl: Duration) -> ParseCache {
        ParseCache {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            ttl,
            capacity,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> ParseCache {
        ParseCache::new(0, Duration::ZERO)
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<ParsedFile>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let expired = match inner.entries.get(fingerprint) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => return None,
        };

        if expired {
            inner.entries.remove(fingerprint);
            inner.order.retain(|k| k != fingerprint);
            return None;
        }

        // refresh recency
        inner.order.retain(|k| k != fingerprint);
        inner.order.push(fingerprint.to_string());
        inner.entries.get(fingerprint).map(|e| Arc::clone(&e.parsed))
    }

    pub fn insert(&self, fingerprint: &str, parsed: ParsedFile) -> Arc<ParsedFile> {
        let parsed = Arc::new(parsed);
        if self.capacity == 0 {
            return parsed;
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        while inner.order.len() >= self.capacity {
            let oldest = inner.order.remove(0);
            inner.entries.remove(&oldest);
        }

        inner.order.retain(|k| k != fingerprint);
        inner.order.push(fingerprint.to_string());
        inner.entries.insert(
            fingerprint.to_string(),
            Entry {
                parsed: Arc::clone(&parsed),
                inserted_at: Instant::now(),
            },
        );

        parsed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readers::ParsedFile;

    fn parsed() -> ParsedFile {
        ParsedFile {
            headers: vec!["a".to_string()],
            rows: vec![],
        }
    }

    #[test]
    fn hit_after_insert() {
        let cache = ParseCache::default();
        cache.insert("fp1", parsed());
        assert!(cache.get("fp1").is_some());
        assert!(cache.get("fp2").is_none());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = ParseCache::disabled();
        cache.insert("fp1", parsed());
        assert!(cache.get("fp1").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_evicts_oldest_entry() {
        let cache = ParseCache::new(2, Duration::from_secs(60));
        cache.insert("a", parsed());
        cache.insert("b", parsed());
        // touch a so b becomes the eviction candidate
        cache.get("a");
        cache.insert("c", parsed());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let cache = ParseCache::new(4, Duration::ZERO);
        cache.insert("a", parsed());
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get("a").is_none());
    }
}
