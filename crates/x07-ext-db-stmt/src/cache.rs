use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lru::LruCache;
use tracing::{debug, warn};

use crate::tokenizer::Shape;
use crate::transport::{StatementId, Transport};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResultSetType {
    #[default]
    ForwardOnly,
    ScrollInsensitive,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Concurrency {
    #[default]
    ReadOnly,
    Updatable,
}

/// Options that change what the server compiles, hence part of the cache key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PrepareOptions {
    pub result_set_type: ResultSetType,
    pub concurrency: Concurrency,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    sql: String,
    options: PrepareOptions,
}

impl CacheKey {
    pub fn new(sql: &str, options: PrepareOptions) -> Self {
        CacheKey {
            sql: sql.trim().to_string(),
            options,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[derive(Debug, Clone)]
pub struct CompiledStatement {
    pub id: StatementId,
    pub sql: Arc<str>,
    pub shape: Arc<Shape>,
}

impl CompiledStatement {
    pub fn param_count(&self) -> usize {
        self.shape.param_count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub physical_closes: u64,
    pub entries: usize,
    pub pinned: usize,
}

#[derive(Debug)]
struct Entry {
    stmt: CompiledStatement,
    refs: usize,
}

struct CacheState {
    entries: LruCache<CacheKey, Entry>,
    // Entries dropped from the map while still referenced; closed on last release.
    detached: HashMap<StatementId, Entry>,
    stats: CacheStats,
    // Set by `clear`; later releases close instead of pooling.
    closed: bool,
}

/// Per-connection pool of server-side prepared statements.
///
/// Entries carry a reference count; a referenced entry is never evicted.
/// Physical closes always run after the lock is released.
pub struct PreparedStatementCache {
    capacity: usize,
    transport: Arc<dyn Transport>,
    state: Mutex<CacheState>,
}

impl PreparedStatementCache {
    pub fn new(capacity: usize, transport: Arc<dyn Transport>) -> Self {
        PreparedStatementCache {
            capacity,
            transport,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                detached: HashMap::new(),
                stats: CacheStats::default(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains(key)
    }

    pub fn ref_count(&self, key: &CacheKey) -> Option<usize> {
        self.lock().entries.peek(key).map(|e| e.refs)
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.lock();
        let mut stats = st.stats;
        stats.entries = st.entries.len();
        stats.pinned = st.entries.iter().filter(|(_, e)| e.refs > 0).count() + st.detached.len();
        stats
    }

    pub fn acquire(&self, key: &CacheKey) -> Option<CompiledStatement> {
        let mut guard = self.lock();
        let st = &mut *guard;
        if st.closed {
            return None;
        }
        match st.entries.get_mut(key) {
            Some(entry) => {
                entry.refs += 1;
                let stmt = entry.stmt.clone();
                st.stats.hits += 1;
                debug!(sql = key.sql(), id = %stmt.id, "prepared statement cache hit");
                Some(stmt)
            }
            None => {
                st.stats.misses += 1;
                None
            }
        }
    }

    /// Hands a statement back. Either keeps it for reuse or closes it.
    pub fn release(&self, key: &CacheKey, stmt: &CompiledStatement, poolable: bool) {
        let to_close = {
            let mut st = self.lock();
            let poolable = poolable && !st.closed;
            let to_close = release_locked(&mut st, self.capacity, key, stmt, poolable);
            st.stats.physical_closes += to_close.len() as u64;
            to_close
        };
        self.close_physical(to_close);
    }

    /// Drops every entry: unreferenced ones are closed now, referenced ones
    /// when their last holder releases them. Nothing is pooled afterwards.
    pub fn clear(&self) {
        let to_close = {
            let mut st = self.lock();
            st.closed = true;
            let mut to_close = Vec::new();
            while let Some((_, entry)) = st.entries.pop_lru() {
                if entry.refs == 0 {
                    to_close.push(entry.stmt);
                } else {
                    st.detached.insert(entry.stmt.id, entry);
                }
            }
            st.stats.physical_closes += to_close.len() as u64;
            to_close
        };
        self.close_physical(to_close);
    }

    fn close_physical(&self, stmts: Vec<CompiledStatement>) {
        for stmt in stmts {
            debug!(id = %stmt.id, sql = &*stmt.sql, "closing server-side statement");
            if let Err(err) = self.transport.close_prepared(stmt.id) {
                warn!(id = %stmt.id, error = %err, "failed to close server-side statement");
            }
        }
    }
}

fn release_locked(
    st: &mut CacheState,
    capacity: usize,
    key: &CacheKey,
    stmt: &CompiledStatement,
    poolable: bool,
) -> Vec<CompiledStatement> {
    let cached_here = st.entries.peek(key).is_some_and(|e| e.stmt.id == stmt.id);
    if cached_here {
        let refs = match st.entries.peek_mut(key) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs
            }
            None => 0,
        };
        if poolable {
            st.entries.promote(key);
            return vec![];
        }
        let Some(entry) = st.entries.pop(key) else {
            return vec![];
        };
        if refs == 0 {
            return vec![entry.stmt];
        }
        st.detached.insert(stmt.id, entry);
        return vec![];
    }

    if let Some(entry) = st.detached.get_mut(&stmt.id) {
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            return vec![];
        }
        return st
            .detached
            .remove(&stmt.id)
            .map(|e| vec![e.stmt])
            .unwrap_or_default();
    }

    if !poolable || capacity == 0 || st.entries.contains(key) {
        return vec![stmt.clone()];
    }

    let mut to_close = Vec::new();
    if st.entries.len() >= capacity {
        let victim = st
            .entries
            .iter()
            .rev()
            .find(|(_, e)| e.refs == 0)
            .map(|(k, _)| k.clone());
        match victim {
            Some(victim) => {
                if let Some(evicted) = st.entries.pop(&victim) {
                    debug!(sql = victim.sql(), id = %evicted.stmt.id, "evicting prepared statement");
                    st.stats.evictions += 1;
                    to_close.push(evicted.stmt);
                }
            }
            None => {
                debug!(sql = key.sql(), "cache fully pinned, closing statement unpooled");
                return vec![stmt.clone()];
            }
        }
    }
    st.entries.put(
        key.clone(),
        Entry {
            stmt: stmt.clone(),
            refs: 0,
        },
    );
    to_close
}
