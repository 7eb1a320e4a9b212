//! Per-host server configurations kept between tunnels

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use rustls::ServerConfig;

const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

const DEFAULT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

struct Entry {
    config: Arc<ServerConfig>,
    created_at: Instant,
}

/// LRU of minted server configs with a time-to-live
///
/// The TTL is shorter than the leaf certificate lifetime so a cached config
/// never serves an expired certificate.
pub struct CertificateCache {
    entries: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl CertificateCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(DEFAULT_CAPACITY);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live entry for `host`; expired entries are evicted on lookup
    pub fn get(&self, host: &str) -> Option<Arc<ServerConfig>> {
        let mut entries = self.lock();
        match entries.get(host) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => Some(Arc::clone(&entry.config)),
            Some(_) => {
                entries.pop(host);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, host: impl Into<String>, config: Arc<ServerConfig>) {
        self.lock().put(
            host.into(),
            Entry {
                config,
                created_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CertificateCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY.get(), DEFAULT_TTL)
    }
}
