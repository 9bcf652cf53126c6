use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::cache::{CacheKey, CompiledStatement, PrepareOptions};
use crate::cancel::CancellationToken;
use crate::connection::ConnectionInner;
use crate::error::{
    sql_excerpt, BatchFailure, CancelReason, Error, HandleKind, ItemFailure, Result,
    TransportError,
};
use crate::keys::GeneratedKeySequence;
use crate::result_set::{ResultSetHandle, ResultSetInner};
use crate::rewrite::{
    BatchItem, BatchRewriter, PhysicalSql, PhysicalStatement, EXECUTE_FAILED, SUCCESS_NO_INFO,
};
use crate::tokenizer::{classify, Shape, StatementKind};
use crate::transport::{ExecutionId, Outcome, Response, StatementId, Value, Warning};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoreResults {
    CloseCurrent,
    KeepCurrent,
    CloseAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Any,
    Rows,
    Update,
}

enum Template {
    Plain,
    Prepared {
        key: CacheKey,
        compiled: CompiledStatement,
    },
}

/// A statement bound to one connection.
///
/// Clones share the statement. The statement closes when `close` is called,
/// when its connection closes, or when the last clone is dropped.
#[derive(Clone)]
pub struct StatementHandle {
    inner: Arc<StatementInner>,
}

pub(crate) struct StatementInner {
    pub(crate) id: u64,
    me: Weak<StatementInner>,
    conn: Arc<ConnectionInner>,
    template: Template,
    closed: AtomicBool,
    in_flight: Mutex<Option<Arc<CancellationToken>>>,
    state: Mutex<State>,
}

struct State {
    poolable: bool,
    close_on_completion: bool,
    max_rows: u64,
    fetch_size: u32,
    query_timeout: Duration,
    params: Vec<Option<Value>>,
    batch: Vec<BatchItem>,
    open_results: Vec<Arc<ResultSetInner>>,
    current: Current,
    pending: VecDeque<Outcome>,
    keys: Option<GeneratedKeySequence>,
    warnings: Vec<Warning>,
}

enum Current {
    Nothing,
    Rows(Arc<ResultSetInner>),
    Update(u64),
}

struct Execution<'a> {
    stmt: &'a StatementInner,
    token: Arc<CancellationToken>,
}

impl Execution<'_> {
    fn exec(&self) -> ExecutionId {
        self.token.exec()
    }

    fn finish(&self) -> std::result::Result<(), CancelReason> {
        self.token.complete()
    }
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        let _ = self.token.complete();
        let mut slot = self.stmt.in_flight();
        if slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, &self.token)) {
            *slot = None;
        }
    }
}

impl StatementInner {
    pub(crate) fn plain(conn: Arc<ConnectionInner>) -> StatementHandle {
        Self::build(conn, Template::Plain)
    }

    pub(crate) fn prepared(
        conn: Arc<ConnectionInner>,
        key: CacheKey,
        compiled: CompiledStatement,
    ) -> StatementHandle {
        Self::build(conn, Template::Prepared { key, compiled })
    }

    fn build(conn: Arc<ConnectionInner>, template: Template) -> StatementHandle {
        let params = match &template {
            Template::Prepared { compiled, .. } => vec![None; compiled.param_count()],
            Template::Plain => Vec::new(),
        };
        let state = State {
            poolable: true,
            close_on_completion: false,
            max_rows: 0,
            fetch_size: 0,
            query_timeout: Duration::from_millis(u64::from(conn.config.default_query_timeout_ms)),
            params,
            batch: Vec::new(),
            open_results: Vec::new(),
            current: Current::Nothing,
            pending: VecDeque::new(),
            keys: None,
            warnings: Vec::new(),
        };
        let id = conn.next_handle_id();
        let inner = Arc::new_cyclic(|me| StatementInner {
            id,
            me: me.clone(),
            conn: conn.clone(),
            template,
            closed: AtomicBool::new(false),
            in_flight: Mutex::new(None),
            state: Mutex::new(state),
        });
        conn.register(&inner);
        trace!(stmt = id, "statement opened");
        StatementHandle { inner }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<Arc<CancellationToken>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::stale(HandleKind::Statement));
        }
        self.conn.ensure_open()
    }

    fn compiled(&self) -> Result<&CompiledStatement> {
        match &self.template {
            Template::Prepared { compiled, .. } => Ok(compiled),
            Template::Plain => Err(Error::illegal(
                "plain statements take their SQL at execute time",
            )),
        }
    }

    fn template_sql(&self) -> &str {
        match &self.template {
            Template::Prepared { compiled, .. } => &compiled.sql,
            Template::Plain => "",
        }
    }

    fn bound_params(&self) -> Result<Vec<Value>> {
        self.state()
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| {
                p.clone().ok_or_else(|| {
                    Error::illegal(format!("no value specified for parameter {}", i + 1))
                })
            })
            .collect()
    }

    fn begin(&self) -> Result<Execution<'_>> {
        self.ensure_open()?;
        let token = {
            let mut slot = self.in_flight();
            if slot.is_some() {
                return Err(Error::illegal("statement already has an execution in flight"));
            }
            let token = Arc::new(CancellationToken::new(self.conn.next_exec_id()));
            *slot = Some(token.clone());
            token
        };
        let timeout = self.state().query_timeout;
        if !timeout.is_zero() {
            self.conn.supervisor.arm(token.clone(), timeout);
        }
        trace!(stmt = self.id, exec = %token.exec(), "execution started");
        Ok(Execution { stmt: self, token })
    }

    fn reset_results(&self) {
        let victims = {
            let mut st = self.state();
            st.pending.clear();
            st.current = Current::Nothing;
            st.keys = None;
            st.warnings.clear();
            if self.conn.policy.closes_results_with_statement() {
                std::mem::take(&mut st.open_results)
            } else {
                Vec::new()
            }
        };
        for rs in victims {
            rs.mark_closed();
        }
    }

    fn run(&self, expect: Expect, literal: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let (sql, shape, target): (&str, Arc<Shape>, Option<(StatementId, Vec<Value>)>) =
            match (&self.template, literal) {
                (Template::Plain, Some(sql)) => {
                    let shape = classify(sql);
                    if shape.statement_count > 1 && !self.conn.config.allow_multi_queries {
                        return Err(Error::illegal(
                            "multiple statements in one call require allowMultiQueries",
                        ));
                    }
                    (sql, Arc::new(shape), None)
                }
                (Template::Prepared { compiled, .. }, None) => (
                    &*compiled.sql,
                    compiled.shape.clone(),
                    Some((compiled.id, self.bound_params()?)),
                ),
                (Template::Plain, None) => {
                    return Err(Error::illegal("no SQL given to a plain statement"))
                }
                (Template::Prepared { .. }, Some(_)) => {
                    return Err(Error::illegal("prepared statements cannot run other SQL"))
                }
            };
        check_expect(&shape, expect)?;

        let exec = self.begin()?;
        self.reset_results();
        let res = match &target {
            Some((id, params)) => self.conn.transport.execute(exec.exec(), *id, params),
            None => self.conn.transport.query(exec.exec(), sql),
        };
        let finished = exec.finish();
        drop(exec);
        if let Err(reason) = finished {
            debug!(stmt = self.id, %reason, "execution cancelled");
            return Err(Error::cancelled(reason, sql));
        }
        let response = res.map_err(|e| Error::from_transport(e, sql, None))?;
        self.absorb(response, &shape, sql)?;

        let st = self.state();
        match (expect, &st.current) {
            (Expect::Rows, Current::Rows(_)) | (Expect::Any, _) => Ok(()),
            (Expect::Rows, _) => Err(Error::illegal("statement did not produce a result set")),
            (Expect::Update, Current::Rows(_)) => {
                Err(Error::illegal("statement produced a result set"))
            }
            (Expect::Update, _) => Ok(()),
        }
    }

    fn absorb(&self, response: Response, shape: &Shape, sql: &str) -> Result<()> {
        let Response { outcomes, warnings } = response;
        let mut keys = expected_keys(shape, 1);
        for o in &outcomes {
            if let Outcome::Update(u) = o {
                keys.ingest(&u.generated_keys);
            }
        }
        let truncation = log_warnings(&warnings, sql);
        {
            let mut st = self.state();
            if self.is_closed() {
                return Err(Error::stale(HandleKind::Statement));
            }
            st.keys = Some(keys);
            st.warnings.extend(warnings);
            st.pending = outcomes.into();
            self.open_next(&mut st);
        }
        match truncation {
            Some(message) if self.conn.config.strict_truncation => Err(Error::Truncation {
                message,
                sql: sql_excerpt(sql),
            }),
            _ => Ok(()),
        }
    }

    /// Makes the next pending outcome current. True when it is a result set.
    fn open_next(&self, st: &mut State) -> bool {
        match st.pending.pop_front() {
            Some(Outcome::Rows(set)) => {
                let tracked = self.conn.policy.tracks_results();
                let rs = ResultSetInner::new(
                    self.conn.next_handle_id(),
                    self.me.clone(),
                    set,
                    st.max_rows,
                    st.fetch_size,
                    false,
                    tracked,
                );
                if tracked {
                    st.open_results.push(rs.clone());
                }
                st.current = Current::Rows(rs);
                true
            }
            Some(Outcome::Update(u)) => {
                st.current = Current::Update(u.affected_rows);
                false
            }
            None => {
                st.current = Current::Nothing;
                false
            }
        }
    }

    fn execute_batch(&self) -> Result<Vec<i64>> {
        let exec = self.begin()?;
        self.reset_results();
        let items = std::mem::take(&mut self.state().batch);
        let sql = self.template_sql();
        if items.is_empty() {
            self.state().keys = Some(GeneratedKeySequence::new());
            return Ok(Vec::new());
        }

        let cfg = &self.conn.config;
        let (plan, shape) = match &self.template {
            Template::Prepared { compiled, .. } => {
                let plan = if cfg.rewrite_batched_statements {
                    self.conn.rewriter.plan(&compiled.sql, &compiled.shape, &items)
                } else {
                    BatchRewriter::unmerged(&items)
                };
                (plan, Some(compiled.shape.as_ref()))
            }
            Template::Plain => (BatchRewriter::unmerged(&items), None),
        };
        let mut run = BatchRun {
            counts: vec![EXECUTE_FAILED; items.len()],
            keys: shape.map_or_else(GeneratedKeySequence::new, |s| expected_keys(s, items.len())),
            failures: Vec::new(),
            fatal: None,
            warnings: Vec::new(),
            continue_on_error: cfg.continue_batch_on_error,
            strict_truncation: cfg.strict_truncation,
        };
        debug!(
            stmt = self.id,
            items = items.len(),
            statements = plan.len(),
            "executing batch"
        );

        let all_template = plan.iter().all(|p| p.sql == PhysicalSql::Template);
        match &self.template {
            Template::Prepared { compiled, .. } if all_template => {
                let params: Vec<Vec<Value>> = plan.iter().map(|p| p.params.clone()).collect();
                let results = self.conn.transport.execute_batch(
                    exec.exec(),
                    compiled.id,
                    &params,
                    run.continue_on_error,
                    &|| exec.token.is_finished(),
                );
                for (phys, res) in plan.iter().zip(results) {
                    if run.record(phys, &compiled.sql, res).is_break() {
                        break;
                    }
                }
            }
            _ => {
                for phys in &plan {
                    if exec.token.is_finished() {
                        break;
                    }
                    let flow = match &phys.sql {
                        PhysicalSql::Literal(text) => {
                            run.record(phys, text, self.conn.transport.query(exec.exec(), text))
                        }
                        PhysicalSql::Merged(text) => {
                            run.record(phys, text, self.run_merged(exec.exec(), text, &phys.params))
                        }
                        PhysicalSql::Template => match &self.template {
                            Template::Prepared { compiled, .. } => run.record(
                                phys,
                                &compiled.sql,
                                self.conn.transport.execute(exec.exec(), compiled.id, &phys.params),
                            ),
                            Template::Plain => run.fail(
                                phys,
                                Error::illegal("parameter batch item on a plain statement"),
                            ),
                        },
                    };
                    if flow.is_break() {
                        break;
                    }
                }
            }
        }

        let finished = exec.finish();
        drop(exec);
        let BatchRun {
            counts,
            keys,
            failures,
            fatal,
            warnings,
            ..
        } = run;
        {
            let mut st = self.state();
            st.keys = Some(keys);
            st.warnings.extend(warnings);
        }
        if let Err(reason) = finished {
            debug!(stmt = self.id, %reason, "batch cancelled");
            return Err(Error::cancelled(reason, sql));
        }
        if let Some(err) = fatal {
            return Err(err);
        }
        if !failures.is_empty() {
            debug!(stmt = self.id, failed = failures.len(), "batch finished with failures");
            return Err(Error::BatchPartialFailure(BatchFailure { counts, failures }));
        }
        Ok(counts)
    }

    fn run_merged(
        &self,
        exec: ExecutionId,
        sql: &str,
        params: &[Value],
    ) -> std::result::Result<Response, TransportError> {
        let (key, compiled) = self.conn.compile(sql, PrepareOptions::default())?;
        let res = self.conn.transport.execute(exec, compiled.id, params);
        self.conn.release_compiled(&key, &compiled, true);
        res
    }

    fn send_cancel(&self, token: &CancellationToken) {
        if !self.conn.transport.is_open() {
            return;
        }
        if let Err(err) = self.conn.transport.cancel(token.exec()) {
            warn!(stmt = self.id, exec = %token.exec(), error = %err, "out-of-band cancel failed");
        }
    }

    fn cancel(&self) {
        if self.conn.is_closed() || self.is_closed() {
            return;
        }
        let Some(token) = self.in_flight().clone() else {
            return;
        };
        if token.cancel(CancelReason::Explicit) {
            debug!(stmt = self.id, exec = %token.exec(), "cancelling execution");
            self.send_cancel(&token);
        }
    }

    pub(crate) fn on_result_closed(&self, rs_id: u64, generated_keys: bool) {
        if self.is_closed() {
            return;
        }
        let close_now = {
            let mut st = self.state();
            st.open_results.retain(|r| r.id != rs_id);
            !generated_keys
                && st.close_on_completion
                && !st.open_results.iter().any(|r| !r.is_generated_keys())
        };
        if close_now {
            trace!(stmt = self.id, "last result closed; closing statement");
            self.close();
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let in_flight = self.in_flight().clone();
        if let Some(token) = in_flight {
            if token.cancel(CancelReason::Explicit) {
                self.send_cancel(&token);
            }
        }
        let (results, poolable) = {
            let mut st = self.state();
            st.batch.clear();
            st.pending.clear();
            st.keys = None;
            st.current = Current::Nothing;
            (std::mem::take(&mut st.open_results), st.poolable)
        };
        if self.conn.policy.closes_results_with_statement() {
            for rs in &results {
                rs.mark_closed();
            }
        }
        if let Template::Prepared { key, compiled } = &self.template {
            self.conn.release_compiled(key, compiled, poolable);
        }
        self.conn.unregister(self.id);
        trace!(stmt = self.id, results = results.len(), "statement closed");
    }
}

impl Drop for StatementInner {
    fn drop(&mut self) {
        self.close();
    }
}

struct BatchRun {
    counts: Vec<i64>,
    keys: GeneratedKeySequence,
    failures: Vec<ItemFailure>,
    fatal: Option<Error>,
    warnings: Vec<Warning>,
    continue_on_error: bool,
    strict_truncation: bool,
}

impl BatchRun {
    fn record(
        &mut self,
        phys: &PhysicalStatement,
        sql: &str,
        res: std::result::Result<Response, TransportError>,
    ) -> ControlFlow<()> {
        let index = Some(phys.items.start);
        let Response { outcomes, warnings } = match res {
            Ok(r) => r,
            Err(err @ TransportError::Server { .. }) => {
                return self.fail(phys, Error::from_transport(err, sql, index));
            }
            Err(err) => {
                self.fatal = Some(Error::from_transport(err, sql, index));
                return ControlFlow::Break(());
            }
        };
        let truncation = log_warnings(&warnings, sql);
        self.warnings.extend(warnings);
        if outcomes.iter().any(|o| matches!(o, Outcome::Rows(_))) {
            return self.fail(phys, Error::illegal("batch statements must not produce result sets"));
        }
        let mut affected = 0u64;
        for o in &outcomes {
            if let Outcome::Update(u) = o {
                self.keys.ingest(&u.generated_keys);
                affected += u.affected_rows;
            }
        }
        if let Some(message) = truncation.filter(|_| self.strict_truncation) {
            return self.fail(
                phys,
                Error::Truncation {
                    message,
                    sql: sql_excerpt(sql),
                },
            );
        }
        let count = if phys.is_merged() {
            SUCCESS_NO_INFO
        } else {
            i64::try_from(affected).unwrap_or(i64::MAX)
        };
        for i in phys.items.clone() {
            self.counts[i] = count;
        }
        ControlFlow::Continue(())
    }

    fn fail(&mut self, phys: &PhysicalStatement, error: Error) -> ControlFlow<()> {
        for i in phys.items.clone() {
            self.counts[i] = EXECUTE_FAILED;
        }
        self.failures.push(ItemFailure {
            index: phys.items.start,
            error,
        });
        if self.continue_on_error {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }
}

fn check_expect(shape: &Shape, expect: Expect) -> Result<()> {
    match expect {
        Expect::Update if shape.is_select_like => Err(Error::illegal(
            "cannot run a result-producing statement with execute_update",
        )),
        Expect::Rows
            if matches!(
                shape.kind,
                StatementKind::Insert
                    | StatementKind::Replace
                    | StatementKind::Update
                    | StatementKind::Delete
            ) =>
        {
            Err(Error::illegal(
                "cannot run a data-modifying statement with execute_query",
            ))
        }
        _ => Ok(()),
    }
}

fn expected_keys(shape: &Shape, items: usize) -> GeneratedKeySequence {
    if shape.is_insert_or_replace() && !shape.has_on_duplicate_key_update() {
        GeneratedKeySequence::with_expected(items * shape.values_row_count.max(1))
    } else {
        GeneratedKeySequence::new()
    }
}

fn log_warnings(warnings: &[Warning], sql: &str) -> Option<String> {
    let mut truncation = None;
    for w in warnings {
        if w.is_truncation() {
            warn!(code = w.code, message = %w.message, sql = %sql_excerpt(sql), "data truncated");
            truncation.get_or_insert_with(|| w.message.clone());
        } else {
            debug!(code = w.code, level = %w.level, message = %w.message, "server warning");
        }
    }
    truncation
}

impl StatementHandle {
    pub(crate) fn from_inner(inner: Arc<StatementInner>) -> Self {
        StatementHandle { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn sql(&self) -> Option<&str> {
        self.inner.compiled().ok().map(|c| &*c.sql)
    }

    pub fn param_count(&self) -> usize {
        self.inner.compiled().map_or(0, CompiledStatement::param_count)
    }

    pub fn set_param(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.inner.ensure_open()?;
        let n = self.inner.compiled()?.param_count();
        if index == 0 || index > n {
            return Err(Error::illegal(format!(
                "parameter index {index} out of range (1..={n})"
            )));
        }
        self.inner.state().params[index - 1] = Some(value.into());
        Ok(())
    }

    pub fn clear_params(&self) -> Result<()> {
        self.inner.ensure_open()?;
        let mut st = self.inner.state();
        st.params.iter_mut().for_each(|p| *p = None);
        Ok(())
    }

    pub fn execute_query(&self) -> Result<ResultSetHandle> {
        self.inner.run(Expect::Rows, None)?;
        self.current_rows()
    }

    pub fn execute_update(&self) -> Result<u64> {
        self.inner.run(Expect::Update, None)?;
        Ok(self.update_count()?.max(0) as u64)
    }

    pub fn execute(&self) -> Result<bool> {
        self.inner.run(Expect::Any, None)?;
        Ok(self.result_set()?.is_some())
    }

    pub fn execute_query_sql(&self, sql: &str) -> Result<ResultSetHandle> {
        self.inner.run(Expect::Rows, Some(sql))?;
        self.current_rows()
    }

    pub fn execute_update_sql(&self, sql: &str) -> Result<u64> {
        self.inner.run(Expect::Update, Some(sql))?;
        Ok(self.update_count()?.max(0) as u64)
    }

    pub fn execute_sql(&self, sql: &str) -> Result<bool> {
        self.inner.run(Expect::Any, Some(sql))?;
        Ok(self.result_set()?.is_some())
    }

    fn current_rows(&self) -> Result<ResultSetHandle> {
        self.result_set()?
            .ok_or_else(|| Error::illegal("statement did not produce a result set"))
    }

    pub fn add_batch(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.compiled()?;
        let params = self.inner.bound_params()?;
        self.inner.state().batch.push(BatchItem::params(params));
        Ok(())
    }

    /// Queues literal SQL. Literal items always run on their own.
    pub fn add_batch_sql(&self, sql: &str) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.state().batch.push(BatchItem::literal(sql));
        Ok(())
    }

    pub fn clear_batch(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.state().batch.clear();
        Ok(())
    }

    pub fn batch_len(&self) -> usize {
        self.inner.state().batch.len()
    }

    /// Runs every queued item and returns one count per item, in order.
    ///
    /// Merged items report [`SUCCESS_NO_INFO`]. Failed or skipped items
    /// report [`EXECUTE_FAILED`] inside [`Error::BatchPartialFailure`].
    pub fn execute_batch(&self) -> Result<Vec<i64>> {
        self.inner.execute_batch()
    }

    /// Keys generated by the last execution, as a one-column result set.
    pub fn generated_keys(&self) -> Result<ResultSetHandle> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let tracked = inner.conn.policy.tracks_results();
        let mut st = inner.state();
        let keys = st
            .keys
            .as_ref()
            .ok_or_else(|| Error::stale(HandleKind::GeneratedKeys))?;
        let rs = ResultSetInner::generated_keys(
            inner.conn.next_handle_id(),
            inner.me.clone(),
            keys.cursor(),
            tracked,
        );
        if tracked {
            st.open_results.push(rs.clone());
        }
        Ok(ResultSetHandle::from_inner(rs))
    }

    pub fn result_set(&self) -> Result<Option<ResultSetHandle>> {
        self.inner.ensure_open()?;
        let st = self.inner.state();
        Ok(match &st.current {
            Current::Rows(rs) if !rs.is_closed() => Some(ResultSetHandle::from_inner(rs.clone())),
            _ => None,
        })
    }

    /// Affected rows of the current result; -1 when it is not an update.
    pub fn update_count(&self) -> Result<i64> {
        self.inner.ensure_open()?;
        Ok(match self.inner.state().current {
            Current::Update(n) => i64::try_from(n).unwrap_or(i64::MAX),
            _ => -1,
        })
    }

    /// Advances to the next chained result. True when it is a result set.
    pub fn more_results(&self, mode: MoreResults) -> Result<bool> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let (has_rows, victims) = {
            let mut st = inner.state();
            let current = match &st.current {
                Current::Rows(rs) => Some(rs.clone()),
                _ => None,
            };
            let mut victims = Vec::new();
            match mode {
                MoreResults::KeepCurrent => {}
                MoreResults::CloseCurrent => {
                    if let Some(rs) = current {
                        st.open_results.retain(|r| r.id != rs.id);
                        victims.push(rs);
                    }
                }
                MoreResults::CloseAll => {
                    let (keys, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut st.open_results)
                        .into_iter()
                        .partition(|r| r.is_generated_keys());
                    st.open_results = keys;
                    victims = rest;
                    if let Some(rs) = current {
                        if !victims.iter().any(|r| r.id == rs.id) {
                            victims.push(rs);
                        }
                    }
                }
            }
            (inner.open_next(&mut st), victims)
        };
        for rs in victims {
            rs.mark_closed();
        }
        Ok(has_rows)
    }

    pub fn open_result_count(&self) -> usize {
        self.inner
            .state()
            .open_results
            .iter()
            .filter(|r| !r.is_closed())
            .count()
    }

    pub fn set_max_rows(&self, max_rows: i64) -> Result<()> {
        self.inner.ensure_open()?;
        let max_rows = u64::try_from(max_rows)
            .map_err(|_| Error::illegal(format!("max rows must be >= 0, got {max_rows}")))?;
        self.inner.state().max_rows = max_rows;
        Ok(())
    }

    pub fn set_fetch_size(&self, rows: i32) -> Result<()> {
        self.inner.ensure_open()?;
        let rows = u32::try_from(rows)
            .map_err(|_| Error::illegal(format!("fetch size must be >= 0, got {rows}")))?;
        self.inner.state().fetch_size = rows;
        Ok(())
    }

    pub fn set_query_timeout(&self, timeout: Duration) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.state().query_timeout = timeout;
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        self.inner.state().query_timeout
    }

    pub fn set_poolable(&self, poolable: bool) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.state().poolable = poolable;
        Ok(())
    }

    pub fn is_poolable(&self) -> bool {
        self.inner.state().poolable
    }

    pub fn close_on_completion(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.state().close_on_completion = true;
        Ok(())
    }

    pub fn is_close_on_completion(&self) -> bool {
        self.inner.state().close_on_completion
    }

    pub fn warnings(&self) -> Result<Vec<Warning>> {
        self.inner.ensure_open()?;
        Ok(self.inner.state().warnings.clone())
    }

    pub fn clear_warnings(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.state().warnings.clear();
        Ok(())
    }

    /// Cancels the in-flight execution, if any. A no-op once the execution
    /// finished or the connection closed.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_executing(&self) -> bool {
        self.inner.in_flight().is_some()
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

impl std::fmt::Debug for StatementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementHandle")
            .field("id", &self.inner.id)
            .field("sql", &self.inner.template_sql())
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}
