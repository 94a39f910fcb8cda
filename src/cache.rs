//! DNS response cache
//!
//! Bounded map from query fingerprint to a previously seen response.
//! Expired entries are still returned, marked stale and carrying a short
//! TTL, so the caller can answer immediately and refresh in the background.
//!
//! Eviction balances recency and frequency with two segments: new keys
//! enter the recent segment, keys seen again are promoted to the frequent
//! segment, and the frequent segment demotes its coldest key back instead
//! of dropping it outright.

use crate::error::{DnsError, Result};
use hickory_proto::op::Message;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

/// Upper bound on how long any response may be cached.
const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL stamped on answers served from an expired entry.
const STALE_TTL: u32 = 60;

/// Cache key for a DNS query.
///
/// Built from the first question record only (name, class, type), with the
/// name lowercased. Queries carrying several questions alias to the first
/// one; multi-question queries are deprecated in practice and are not
/// distinguished here. Returns `None` for a message with no question.
pub fn fingerprint(msg: &Message) -> Option<String> {
    let q = msg.queries().first()?;
    Some(format!(
        "{} {} {}",
        q.name().to_lowercase(),
        q.query_class(),
        q.query_type()
    ))
}

/// Copy a response into its cacheable form: the truncated bit is cleared
/// so a stored TCP answer can be replayed over UDP. Name compression is
/// applied by the wire encoder whenever the message is serialized.
pub fn canonicalize(msg: &Message) -> Message {
    let mut m = msg.clone();
    m.set_truncated(false);
    m
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum Lookup {
    /// No entry for this fingerprint.
    Miss,
    /// Entry present and not expired.
    Hit(Message),
    /// Entry present but expired; the caller should schedule a refresh.
    Stale(Message),
}

/// Eviction counters, exposed by the debug endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Clone)]
struct CachedResponse {
    msg: Arc<Message>,
    expires_at: Instant,
}

struct Segments {
    recent: LruCache<String, CachedResponse>,
    frequent: LruCache<String, CachedResponse>,
}

impl Segments {
    /// Fetch an entry handle, promoting re-accessed keys to the frequent
    /// segment. The frequent segment's coldest key is demoted into the slot
    /// the promotion freed, so a lookup never evicts.
    fn lookup(&mut self, key: &str) -> Option<CachedResponse> {
        if let Some(e) = self.frequent.get(key) {
            return Some(e.clone());
        }
        let e = self.recent.pop(key)?;
        if let Some((demoted_key, demoted)) = self.frequent.push(key.to_string(), e.clone()) {
            self.recent.push(demoted_key, demoted);
        }
        Some(e)
    }

    /// Insert or replace. Replacement happens in whichever segment already
    /// holds the key; new keys enter the recent segment and may push out
    /// its least recently used entry.
    fn insert(&mut self, key: String, value: CachedResponse, evictions: &AtomicU64) {
        if self.frequent.contains(&key) {
            self.frequent.put(key, value);
            return;
        }
        if self.recent.contains(&key) {
            self.recent.put(key, value);
            return;
        }
        if self.recent.push(key, value).is_some() {
            evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn len(&self) -> usize {
        self.recent.len() + self.frequent.len()
    }
}

/// Bounded, concurrency-safe response cache.
///
/// One mutex guards both segments; message copies for callers are made
/// after the entry handle has left the critical section.
pub struct MessageCache {
    inner: Mutex<Segments>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MessageCache {
    /// Create a cache holding at most `capacity` entries, split between the
    /// recent and frequent segments.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 {
            return Err(DnsError::InvalidCacheCapacity(capacity));
        }
        let recent = capacity / 2;
        let frequent = capacity - recent;
        Ok(Self {
            inner: Mutex::new(Segments {
                recent: LruCache::new(NonZeroUsize::new(recent).expect("capacity checked")),
                frequent: LruCache::new(NonZeroUsize::new(frequent).expect("capacity checked")),
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Look up the response for `query` as of `now`.
    ///
    /// The returned message is a copy: its transaction id is rewritten to
    /// match `query`, and every answer TTL is rewritten to the seconds
    /// remaining until expiration (fresh) or forced to a short value
    /// (stale) so downstream resolvers come back soon.
    pub fn get(&self, query: &Message, now: Instant) -> Lookup {
        let Some(key) = fingerprint(query) else {
            return Lookup::Miss;
        };

        let entry = {
            let mut segments = self.inner.lock();
            segments.lookup(&key)
        };
        let Some(entry) = entry else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            trace!("cache miss for {}", key);
            return Lookup::Miss;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);

        let mut msg = (*entry.msg).clone();
        msg.set_id(query.id());

        if entry.expires_at <= now {
            debug!("cache stale hit for {}, scheduling refresh", key);
            for record in msg.answers_mut() {
                record.set_ttl(STALE_TTL);
            }
            return Lookup::Stale(msg);
        }

        trace!("cache hit for {}", key);
        let remaining = entry.expires_at.saturating_duration_since(now);
        let remaining_secs = remaining.as_secs().max(1) as u32;
        for record in msg.answers_mut() {
            record.set_ttl(remaining_secs);
        }
        Lookup::Hit(msg)
    }

    /// Store `response` under the fingerprint of `query`.
    ///
    /// The entry expires after the minimum TTL across answer records,
    /// never more than 24 hours out. Responses without answer records are
    /// not cached at all.
    pub fn put(&self, query: &Message, response: &Message, now: Instant) {
        let Some(key) = fingerprint(query) else {
            return;
        };
        let Some(min_ttl) = response.answers().iter().map(|r| r.ttl()).min() else {
            debug!("not caching empty answer for {}", key);
            return;
        };

        let ttl = Duration::from_secs(u64::from(min_ttl)).min(MAX_TTL);
        let entry = CachedResponse {
            msg: Arc::new(canonicalize(response)),
            expires_at: now + ttl,
        };

        let mut segments = self.inner.lock();
        segments.insert(key, entry, &self.evictions);
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn cap(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the hit/miss/eviction counters.
    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
