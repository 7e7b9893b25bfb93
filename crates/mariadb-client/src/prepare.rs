//! Server-side prepared statements and their per-connection cache.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lru::LruCache;

use crate::column::ColumnDefinition;

/// A statement prepared on one connection.
///
/// Handles are cheap to clone. The use count tracks executions in
/// flight; a handle evicted from the cache is closed on the server once
/// its use count drops to zero.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    statement_id: u32,
    /// Connection the id belongs to
    owner: u64,
    sql: String,
    params: Vec<ColumnDefinition>,
    columns: Arc<[ColumnDefinition]>,
    uses: AtomicUsize,
    cached: AtomicBool,
    closed: AtomicBool,
}

impl PreparedStatement {
    pub(crate) fn new(
        statement_id: u32,
        owner: u64,
        sql: String,
        params: Vec<ColumnDefinition>,
        columns: Vec<ColumnDefinition>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                statement_id,
                owner,
                sql,
                params,
                columns: columns.into(),
                uses: AtomicUsize::new(0),
                cached: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn statement_id(&self) -> u32 {
        self.inner.statement_id
    }

    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    pub fn param_count(&self) -> usize {
        self.inner.params.len()
    }

    pub fn params(&self) -> &[ColumnDefinition] {
        &self.inner.params
    }

    pub fn columns(&self) -> &Arc<[ColumnDefinition]> {
        &self.inner.columns
    }

    /// Still usable on connection `owner`.
    pub(crate) fn is_valid_on(&self, owner: u64) -> bool {
        self.inner.owner == owner && !self.inner.closed.load(Ordering::Acquire)
    }

    pub fn use_count(&self) -> usize {
        self.inner.uses.load(Ordering::Acquire)
    }

    pub fn is_cached(&self) -> bool {
        self.inner.cached.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.inner.uses.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one use. Returns the id to close when the handle is neither
    /// used nor cached any more.
    pub(crate) fn release(&self) -> Option<u32> {
        let previous = self
            .inner
            .uses
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        (previous <= 1 && !self.is_cached()).then(|| self.mark_closed()).flatten()
    }

    /// Mark closed; returns the id the first time only.
    pub(crate) fn mark_closed(&self) -> Option<u32> {
        (!self.inner.closed.swap(true, Ordering::AcqRel)).then_some(self.inner.statement_id)
    }

    fn set_cached(&self, cached: bool) {
        self.inner.cached.store(cached, Ordering::Release);
    }
}

type CacheKey = (Option<String>, String);

/// LRU cache of prepared statements keyed by `(database, sql)`.
#[derive(Debug)]
pub struct PrepareCache {
    entries: Option<LruCache<CacheKey, PreparedStatement>>,
}

impl PrepareCache {
    /// A cache of `capacity` entries; disabled when the capacity is 0.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    pub fn disabled() -> Self {
        Self { entries: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a statement and count a use of it.
    pub fn get(&mut self, database: Option<&str>, sql: &str) -> Option<PreparedStatement> {
        let entries = self.entries.as_mut()?;
        let key = (database.map(str::to_string), sql.to_string());
        let stmt = entries.get(&key)?.clone();
        stmt.acquire();
        Some(stmt)
    }

    /// Insert a statement. Returns the ids of statements that must be
    /// closed on the server (evicted and unused).
    pub fn put(&mut self, database: Option<&str>, stmt: &PreparedStatement) -> Vec<u32> {
        let Some(entries) = self.entries.as_mut() else {
            return Vec::new();
        };
        stmt.set_cached(true);
        let key = (database.map(str::to_string), stmt.sql().to_string());
        let mut to_close = Vec::new();
        if let Some((_, evicted)) = entries.push(key, stmt.clone()) {
            if !Arc::ptr_eq(&evicted.inner, &stmt.inner) {
                evicted.set_cached(false);
                if evicted.use_count() == 0 {
                    to_close.extend(evicted.mark_closed());
                }
            }
        }
        to_close
    }

    /// Forget every statement without contacting the server.
    ///
    /// Used when the session the ids belong to is gone or replaced.
    pub fn clear(&mut self) {
        if let Some(entries) = self.entries.as_mut() {
            for (_, stmt) in entries.iter() {
                stmt.set_cached(false);
                stmt.mark_closed();
            }
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(id: u32, sql: &str) -> PreparedStatement {
        PreparedStatement::new(id, 1, sql.to_string(), Vec::new(), Vec::new())
    }

    #[test]
    fn test_hit_counts_a_use() {
        let mut cache = PrepareCache::new(4);
        let s = stmt(1, "SELECT 1");
        assert!(cache.put(Some("db"), &s).is_empty());
        assert!(cache.get(None, "SELECT 1").is_none());
        let hit = cache.get(Some("db"), "SELECT 1").unwrap();
        assert_eq!(hit.statement_id(), 1);
        assert_eq!(s.use_count(), 1);
        // cached statements stay open when released
        assert_eq!(hit.release(), None);
        assert_eq!(s.use_count(), 0);
    }

    #[test]
    fn test_eviction_closes_unused_statement() {
        let mut cache = PrepareCache::new(1);
        let first = stmt(1, "SELECT 1");
        cache.put(None, &first);
        let second = stmt(2, "SELECT 2");
        assert_eq!(cache.put(None, &second), vec![1]);
        assert!(!first.is_cached());
        assert!(!first.is_valid_on(1));
        assert!(second.is_valid_on(1));
    }

    #[test]
    fn test_eviction_defers_close_while_in_use() {
        let mut cache = PrepareCache::new(1);
        let first = stmt(1, "SELECT 1");
        cache.put(None, &first);
        first.acquire();
        assert!(cache.put(None, &stmt(2, "SELECT 2")).is_empty());
        assert_eq!(first.release(), Some(1));
        // closing happens once
        assert_eq!(first.release(), None);
    }

    #[test]
    fn test_clear_and_disabled() {
        let mut cache = PrepareCache::new(2);
        let s = stmt(5, "SELECT 5");
        cache.put(None, &s);
        cache.clear();
        assert!(cache.is_empty());
        assert!(!s.is_valid_on(1));

        let mut disabled = PrepareCache::new(0);
        assert!(!disabled.is_enabled());
        assert!(disabled.put(None, &stmt(6, "SELECT 6")).is_empty());
        assert!(disabled.get(None, "SELECT 6").is_none());
    }
}
