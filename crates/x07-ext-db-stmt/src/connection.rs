use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheStats, CompiledStatement, PrepareOptions, PreparedStatementCache};
use crate::cancel::TimeoutSupervisor;
use crate::config::{LifecyclePolicy, StmtConfig};
use crate::error::{Error, HandleKind, Result, TransportError};
use crate::rewrite::BatchRewriter;
use crate::statement::{StatementHandle, StatementInner};
use crate::tokenizer::classify;
use crate::transport::{ExecutionId, Transport};

/// Client-side view of one server session.
///
/// Cloning shares the session; `close` on any clone closes it for all.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) config: StmtConfig,
    pub(crate) policy: LifecyclePolicy,
    pub(crate) rewriter: BatchRewriter,
    pub(crate) supervisor: TimeoutSupervisor,
    cache: Option<PreparedStatementCache>,
    closed: Arc<AtomicBool>,
    next_exec: AtomicU64,
    next_handle: AtomicU64,
    statements: Mutex<HashMap<u64, Weak<StatementInner>>>,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, config: StmtConfig) -> Result<Self> {
        config.validate()?;
        let closed = Arc::new(AtomicBool::new(false));
        let capacity = config.effective_cache_size();
        let cache = config
            .cache_prepared_statements
            .then(|| PreparedStatementCache::new(capacity, transport.clone()));
        let inner = ConnectionInner {
            supervisor: TimeoutSupervisor::new(transport.clone(), closed.clone()),
            rewriter: BatchRewriter::new(config.max_packet_bytes as usize),
            policy: config.lifecycle_policy(),
            transport,
            config,
            cache,
            closed,
            next_exec: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
            statements: Mutex::new(HashMap::new()),
        };
        debug!(policy = ?inner.policy, cache_capacity = capacity, "connection opened");
        Ok(Connection {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &StmtConfig {
        &self.inner.config
    }

    pub fn policy(&self) -> LifecyclePolicy {
        self.inner.policy
    }

    pub fn create_statement(&self) -> Result<StatementHandle> {
        self.inner.ensure_open()?;
        Ok(StatementInner::plain(self.inner.clone()))
    }

    pub fn prepare(&self, sql: &str) -> Result<StatementHandle> {
        self.prepare_with(sql, PrepareOptions::default())
    }

    pub fn prepare_with(&self, sql: &str, options: PrepareOptions) -> Result<StatementHandle> {
        self.inner.ensure_open()?;
        let shape = classify(sql);
        if shape.statement_count > 1 && !self.inner.config.allow_multi_queries {
            return Err(Error::illegal(
                "multiple statements in one prepare require allowMultiQueries",
            ));
        }
        let (key, compiled) = self
            .inner
            .compile(sql, options)
            .map_err(|e| Error::from_transport(e, sql, None))?;
        Ok(StatementInner::prepared(self.inner.clone(), key, compiled))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.inner.cache.as_ref().map(PreparedStatementCache::stats)
    }

    pub fn open_statement_count(&self) -> usize {
        self.inner
            .registry()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl ConnectionInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<u64, Weak<StatementInner>>> {
        self.statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::stale(HandleKind::Connection));
        }
        Ok(())
    }

    pub(crate) fn next_exec_id(&self) -> ExecutionId {
        ExecutionId(self.next_exec.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_handle_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, stmt: &Arc<StatementInner>) {
        if !self.policy.tracks_results() {
            return;
        }
        self.registry().insert(stmt.id, Arc::downgrade(stmt));
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.registry().remove(&id);
    }

    /// Looks `sql` up in the cache, preparing it on the server on a miss.
    pub(crate) fn compile(
        &self,
        sql: &str,
        options: PrepareOptions,
    ) -> std::result::Result<(CacheKey, CompiledStatement), TransportError> {
        let key = CacheKey::new(sql, options);
        if let Some(hit) = self.cache.as_ref().and_then(|c| c.acquire(&key)) {
            return Ok((key, hit));
        }
        let id = self.transport.prepare(sql)?;
        let compiled = CompiledStatement {
            id,
            sql: Arc::from(sql),
            shape: Arc::new(classify(sql)),
        };
        Ok((key, compiled))
    }

    pub(crate) fn release_compiled(&self, key: &CacheKey, stmt: &CompiledStatement, poolable: bool) {
        match &self.cache {
            Some(cache) => cache.release(key, stmt, poolable),
            None => {
                if let Err(err) = self.transport.close_prepared(stmt.id) {
                    warn!(id = %stmt.id, error = %err, "failed to close server-side statement");
                }
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.supervisor.shutdown();
        let open: Vec<Arc<StatementInner>> = {
            let mut reg = self.registry();
            reg.drain().filter_map(|(_, w)| w.upgrade()).collect()
        };
        debug!(statements = open.len(), "closing connection");
        for stmt in open {
            stmt.close();
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.supervisor.shutdown();
    }
}
