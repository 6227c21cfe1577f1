use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Bounded in-process cache of presigned read URLs.
///
/// Entries expire after a fixed TTL, which callers keep below the URL expiry.
/// When full, expired entries are purged first, then the entry closest to
/// expiry is evicted.
pub struct UrlCache {
    entries: Mutex<HashMap<String, CachedUrl>>,
    capacity: usize,
    ttl: Duration,
}

struct CachedUrl {
    url: String,
    expires_at: Instant,
}

impl UrlCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(capacity.min(1024))),
            capacity,
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.url.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, url: impl Into<String>) {
        if self.capacity == 0 || self.ttl.is_zero() {
            return;
        }

        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            entries.retain(|_, entry| entry.expires_at > now);

            if entries.len() >= self.capacity {
                let soonest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at)
                    .map(|(key, _)| key.clone());
                if let Some(soonest) = soonest {
                    entries.remove(&soonest);
                }
            }
        }

        entries.insert(
            key,
            CachedUrl {
                url: url.into(),
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
