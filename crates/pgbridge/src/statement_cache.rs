//! Prepared statement LRU cache.
//!
//! Maps SQL text to a compiled statement handle together with its result
//! columns and the timestamp the entry was built at. An entry is only handed
//! out if it was built after the invalidation timestamp supplied by the
//! caller; older entries count as misses and get rebuilt by the connection.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::clock::{self, Timestamp};
use crate::driver::Attribute;

/// Default per-connection capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// A compiled statement and what is known about it.
#[derive(Debug, Clone)]
pub struct CachedStatement<S> {
    /// Driver statement handle.
    pub statement: S,
    /// Result columns, in order.
    pub attributes: Arc<[Attribute]>,
    /// When the entry was built.
    pub created_at: Timestamp,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Maximum number of entries.
    pub capacity: usize,
    /// Current number of entries.
    pub len: usize,
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that were absent or stale.
    pub misses: u64,
    /// Entries pushed out by newer ones.
    pub evictions: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, `0.0` before the first lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Bounded LRU of prepared statements for one connection.
#[derive(Debug)]
pub struct PreparedStatementCache<S> {
    cache: LruCache<String, CachedStatement<S>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<S: Clone> PreparedStatementCache<S> {
    /// Create a cache; `None` when `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Option<Self> {
        let capacity = NonZeroUsize::new(capacity)?;
        Some(Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
            evictions: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub const fn hits(&self) -> u64 {
        self.hits
    }

    pub const fn misses(&self) -> u64 {
        self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }

    /// Returns true if `sql` has an entry, fresh or not. Does not touch recency.
    pub fn contains(&self, sql: &str) -> bool {
        self.cache.peek(sql).is_some()
    }

    /// Look up `sql`, accepting only entries built after `invalidated_at`.
    ///
    /// Any entry found is marked most recently used, even a stale one, since
    /// the caller is about to replace it.
    pub fn lookup(&mut self, sql: &str, invalidated_at: Timestamp) -> Option<CachedStatement<S>> {
        match self.cache.get(sql) {
            Some(entry) if entry.created_at > invalidated_at => {
                self.hits += 1;
                tracing::debug!(sql, "statement cache hit");
                Some(entry.clone())
            }
            Some(_) => {
                self.misses += 1;
                tracing::debug!(sql, "statement cache entry is stale");
                None
            }
            None => {
                self.misses += 1;
                tracing::debug!(sql, "statement cache miss");
                None
            }
        }
    }

    /// Store a freshly compiled statement stamped with the current time.
    ///
    /// Returns the least recently used entry if it had to be evicted.
    pub fn insert(
        &mut self,
        sql: impl Into<String>,
        statement: S,
        attributes: Arc<[Attribute]>,
    ) -> Option<(String, CachedStatement<S>)> {
        let sql = sql.into();
        let entry = CachedStatement {
            statement,
            attributes,
            created_at: clock::now(),
        };
        match self.cache.push(sql.clone(), entry) {
            Some((old_sql, _)) if old_sql == sql => None,
            Some(evicted) => {
                self.evictions += 1;
                tracing::debug!(sql = %evicted.0, "statement evicted from cache");
                Some(evicted)
            }
            None => None,
        }
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity: self.capacity(),
            len: self.len(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}
