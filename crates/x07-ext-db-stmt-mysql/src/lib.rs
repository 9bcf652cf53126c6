//! [`Transport`] over a live MySQL session, built on `mysql_async`.
//!
//! Every call blocks on a private current-thread runtime. Cancellation opens
//! a side connection and issues `KILL QUERY` for the session's thread id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context as _, Result};
use mysql_async::prelude::{Protocol, Queryable as _};
use mysql_async::{Conn, Params, QueryResult, Statement};
use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;
use tracing::{debug, warn};
use x07_ext_db_stmt::{
    classify, keys_from_last_insert_id, ExecutionId, Outcome, Response, Row, RowSet, StatementId,
    Transport, TransportError, UpdateResult, Value, Warning,
};

mod config;

pub use config::MysqlConfig;

const ER_QUERY_INTERRUPTED: u16 = 1317;
const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;

static CANCEL_RT: OnceCell<Runtime> = OnceCell::new();

fn cancel_runtime() -> std::io::Result<&'static Runtime> {
    CANCEL_RT.get_or_try_init(|| {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    })
}

enum Failure {
    Closed,
    Mysql(mysql_async::Error),
}

impl From<mysql_async::Error> for Failure {
    fn from(e: mysql_async::Error) -> Self {
        Failure::Mysql(e)
    }
}

/// How to turn `LAST_INSERT_ID()` into per-row keys for one statement.
#[derive(Debug, Clone, Copy)]
struct KeyShape {
    is_insert: bool,
    row_count: u64,
    odku: bool,
    increment: u64,
}

impl KeyShape {
    fn of(sql: &str, increment: u64) -> Self {
        let shape = classify(sql);
        KeyShape {
            is_insert: shape.is_insert_or_replace(),
            row_count: shape.values_row_count.max(1) as u64,
            odku: shape.has_on_duplicate_key_update(),
            increment,
        }
    }

    fn keys(&self, last_insert_id: Option<u64>, affected_rows: u64) -> Vec<u64> {
        match last_insert_id {
            Some(first) if first > 0 && self.is_insert => keys_from_last_insert_id(
                first,
                affected_rows,
                self.row_count,
                self.increment,
                self.odku,
            ),
            _ => Vec::new(),
        }
    }
}

struct Prepared {
    stmt: Statement,
    keys: KeyShape,
}

struct Running<'a> {
    slot: &'a Mutex<Option<ExecutionId>>,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub struct MysqlTransport {
    config: MysqlConfig,
    rt: Runtime,
    conn: tokio::sync::Mutex<Option<Conn>>,
    connection_id: u32,
    auto_increment_increment: u64,
    prepared: Mutex<HashMap<StatementId, Prepared>>,
    running: Mutex<Option<ExecutionId>>,
    open: AtomicBool,
}

impl MysqlTransport {
    pub fn connect(config: MysqlConfig) -> Result<Self> {
        config.validate()?;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build mysql runtime")?;
        let timeout = Duration::from_millis(u64::from(config.connect_timeout_ms));
        let opts = config.opts();
        let (conn, increment) = rt.block_on(async move {
            let mut conn = tokio::time::timeout(timeout, Conn::new(opts))
                .await
                .context("mysql connect timed out")?
                .context("mysql connect failed")?;
            let increment: Option<u64> = conn
                .query_first("SELECT @@auto_increment_increment")
                .await
                .context("failed to read @@auto_increment_increment")?;
            Ok::<(Conn, u64), anyhow::Error>((conn, increment.unwrap_or(1).max(1)))
        })?;
        let connection_id = conn.id();
        debug!(
            host = %config.host,
            port = config.port,
            connection_id,
            "mysql session opened"
        );
        Ok(MysqlTransport {
            config,
            rt,
            conn: tokio::sync::Mutex::new(Some(conn)),
            connection_id,
            auto_increment_increment: increment,
            prepared: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
            open: AtomicBool::new(true),
        })
    }

    pub fn from_env() -> Result<Self> {
        let config = MysqlConfig::from_env().context("invalid X07_DB_MYSQL_* configuration")?;
        Self::connect(config)
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn disconnect(&self) {
        self.open.store(false, Ordering::Release);
        self.rt.block_on(async {
            let Some(conn) = self.conn.lock().await.take() else {
                return;
            };
            if let Err(err) = conn.disconnect().await {
                debug!(error = %err, "mysql disconnect failed");
            }
        });
    }

    fn prepared(&self) -> MutexGuard<'_, HashMap<StatementId, Prepared>> {
        self.prepared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self, exec: ExecutionId) -> Running<'_> {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(exec);
        Running {
            slot: &self.running,
        }
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(TransportError::Communications(
                "mysql session is closed".to_string(),
            ))
        }
    }

    fn map_failure(&self, failure: Failure) -> TransportError {
        match failure {
            Failure::Closed => {
                TransportError::Communications("mysql session is closed".to_string())
            }
            Failure::Mysql(mysql_async::Error::Server(e)) if e.code == ER_QUERY_INTERRUPTED => {
                TransportError::Interrupted
            }
            Failure::Mysql(mysql_async::Error::Server(e)) => {
                TransportError::server(e.code, &e.state, e.message)
            }
            Failure::Mysql(other) => {
                self.open.store(false, Ordering::Release);
                warn!(error = %other, "mysql session failed");
                TransportError::Communications(other.to_string())
            }
        }
    }
}

impl Transport for MysqlTransport {
    fn prepare(&self, sql: &str) -> Result<StatementId, TransportError> {
        self.ensure_open()?;
        let stmt = self
            .rt
            .block_on(async {
                let mut guard = self.conn.lock().await;
                let c = guard.as_mut().ok_or(Failure::Closed)?;
                Ok::<Statement, Failure>(c.prep(sql).await?)
            })
            .map_err(|f| self.map_failure(f))?;
        let id = StatementId(stmt.id());
        let keys = KeyShape::of(sql, self.auto_increment_increment);
        self.prepared().insert(id, Prepared { stmt, keys });
        Ok(id)
    }

    fn execute(
        &self,
        exec: ExecutionId,
        stmt: StatementId,
        params: &[Value],
    ) -> Result<Response, TransportError> {
        self.ensure_open()?;
        let (statement, keys) = {
            let map = self.prepared();
            let p = map.get(&stmt).ok_or_else(|| {
                TransportError::server(
                    ER_UNKNOWN_STMT_HANDLER,
                    "HY000",
                    format!("unknown prepared statement {stmt}"),
                )
            })?;
            (p.stmt.clone(), p.keys)
        };
        let params = to_params(params);
        let _running = self.start(exec);
        self.rt
            .block_on(async {
                let mut guard = self.conn.lock().await;
                let c = guard.as_mut().ok_or(Failure::Closed)?;
                let mut result = c.exec_iter(statement, params).await?;
                let outcomes = drain(&mut result, keys).await?;
                drop(result);
                let warnings = fetch_warnings(c).await?;
                Ok::<Response, Failure>(Response { outcomes, warnings })
            })
            .map_err(|f| self.map_failure(f))
    }

    fn query(&self, exec: ExecutionId, sql: &str) -> Result<Response, TransportError> {
        self.ensure_open()?;
        let keys = KeyShape::of(sql, self.auto_increment_increment);
        let _running = self.start(exec);
        self.rt
            .block_on(async {
                let mut guard = self.conn.lock().await;
                let c = guard.as_mut().ok_or(Failure::Closed)?;
                let mut result = c.query_iter(sql).await?;
                let outcomes = drain(&mut result, keys).await?;
                drop(result);
                let warnings = fetch_warnings(c).await?;
                Ok::<Response, Failure>(Response { outcomes, warnings })
            })
            .map_err(|f| self.map_failure(f))
    }

    fn close_prepared(&self, stmt: StatementId) -> Result<(), TransportError> {
        let Some(p) = self.prepared().remove(&stmt) else {
            return Ok(());
        };
        if !self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        self.rt
            .block_on(async {
                let mut guard = self.conn.lock().await;
                let c = guard.as_mut().ok_or(Failure::Closed)?;
                c.close(p.stmt).await?;
                Ok::<(), Failure>(())
            })
            .map_err(|f| self.map_failure(f))
    }

    fn cancel(&self, exec: ExecutionId) -> Result<(), TransportError> {
        let running = *self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running != Some(exec) {
            return Ok(());
        }
        let rt = cancel_runtime().map_err(|e| TransportError::Communications(e.to_string()))?;
        let opts = self.config.opts();
        let id = self.connection_id;
        rt.block_on(async move {
            let mut side = Conn::new(opts).await?;
            side.query_drop(format!("KILL QUERY {id}")).await?;
            side.disconnect().await
        })
        .map_err(|e| TransportError::Communications(format!("KILL QUERY {id} failed: {e}")))?;
        debug!(%exec, connection_id = id, "sent KILL QUERY");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for MysqlTransport {
    fn drop(&mut self) {
        if self.open.load(Ordering::Acquire) {
            self.disconnect();
        }
    }
}

async fn drain<P: Protocol>(
    result: &mut QueryResult<'_, 'static, P>,
    keys: KeyShape,
) -> mysql_async::Result<Vec<Outcome>> {
    let mut outcomes = Vec::new();
    while !result.is_empty() {
        let columns: Vec<String> = result
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        let affected_rows = result.affected_rows();
        let last_insert_id = result.last_insert_id();
        let rows: Vec<mysql_async::Row> = result.collect().await?;
        if columns.is_empty() {
            outcomes.push(Outcome::Update(UpdateResult {
                affected_rows,
                generated_keys: keys.keys(last_insert_id, affected_rows),
            }));
        } else {
            outcomes.push(Outcome::Rows(RowSet {
                columns,
                rows: rows.into_iter().map(from_mysql_row).collect(),
            }));
        }
    }
    Ok(outcomes)
}

async fn fetch_warnings(c: &mut Conn) -> mysql_async::Result<Vec<Warning>> {
    if c.get_warnings() == 0 {
        return Ok(Vec::new());
    }
    let rows: Vec<(String, u16, String)> = c.query("SHOW WARNINGS").await?;
    Ok(rows
        .into_iter()
        .map(|(level, code, message)| Warning {
            level,
            code,
            message,
        })
        .collect())
}

fn to_params(params: &[Value]) -> Params {
    if params.is_empty() {
        return Params::Empty;
    }
    Params::Positional(params.iter().map(to_mysql).collect())
}

fn to_mysql(v: &Value) -> mysql_async::Value {
    match v {
        Value::Null => mysql_async::Value::NULL,
        Value::Int(n) => mysql_async::Value::Int(*n),
        Value::UInt(n) => mysql_async::Value::UInt(*n),
        Value::Double(n) => mysql_async::Value::Double(*n),
        Value::Bytes(b) => mysql_async::Value::Bytes(b.clone()),
    }
}

fn from_mysql_row(mut row: mysql_async::Row) -> Row {
    (0..row.len())
        .map(|i| {
            row.take::<mysql_async::Value, usize>(i)
                .map_or(Value::Null, from_mysql)
        })
        .collect()
}

fn from_mysql(v: mysql_async::Value) -> Value {
    match v {
        mysql_async::Value::NULL => Value::Null,
        mysql_async::Value::Bytes(b) => Value::Bytes(b),
        mysql_async::Value::Int(n) => Value::Int(n),
        mysql_async::Value::UInt(n) => Value::UInt(n),
        mysql_async::Value::Float(n) => Value::Double(f64::from(n)),
        mysql_async::Value::Double(n) => Value::Double(n),
        other => Value::Bytes(other.as_sql(true).into_bytes()),
    }
}
