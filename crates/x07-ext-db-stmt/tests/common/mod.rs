#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use x07_ext_db_stmt::{
    classify, Connection, ExecutionId, Outcome, Response, RowSet, StatementId, StatementKind,
    StmtConfig, Transport, TransportError, UpdateResult, Value, Warning,
};

pub const POISON: &str = "boom";
pub const DEFAULT_COLUMN_WIDTH: usize = 255;
const MAX_SLEEP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Prepare(String),
    Execute(StatementId, usize),
    Query(String),
    Close(StatementId),
    Cancel(ExecutionId),
}

/// In-memory server with one auto-increment table `t (id, v)`.
///
/// Inserts honour `ON DUPLICATE KEY UPDATE`, a `"boom"` parameter fails the
/// whole statement, strings wider than the column width warn as truncated,
/// and `SLEEP(n)` blocks until the execution is cancelled.
pub struct FakeServer {
    state: Mutex<FakeState>,
    wake: Condvar,
    open: AtomicBool,
}

struct FakeState {
    next_stmt: u32,
    prepared: HashMap<StatementId, String>,
    calls: Vec<Call>,
    double_closes: Vec<StatementId>,
    cancelled: HashSet<ExecutionId>,
    running: HashSet<ExecutionId>,
    table: BTreeMap<u64, Value>,
    next_id: u64,
    column_width: usize,
    comm_failure: Option<String>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeServer {
            state: Mutex::new(FakeState {
                next_stmt: 0,
                prepared: HashMap::new(),
                calls: Vec::new(),
                double_closes: Vec::new(),
                cancelled: HashSet::new(),
                running: HashSet::new(),
                table: BTreeMap::new(),
                next_id: 1,
                column_width: DEFAULT_COLUMN_WIDTH,
                comm_failure: None,
            }),
            wake: Condvar::new(),
            open: AtomicBool::new(true),
        })
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn seed_row(&self, id: u64, v: impl Into<Value>) {
        let mut st = self.lock();
        st.table.insert(id, v.into());
        st.next_id = st.next_id.max(id + 1);
    }

    pub fn set_column_width(&self, width: usize) {
        self.lock().column_width = width;
    }

    /// Statements whose SQL contains `needle` fail with a communications error.
    pub fn fail_communications_on(&self, needle: &str) {
        self.lock().comm_failure = Some(needle.to_string());
    }

    pub fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn prepares(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Prepare(sql) => Some(sql),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> Vec<StatementId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Close(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn cancels(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Cancel(_)))
            .count()
    }

    pub fn executes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Execute(..) | Call::Query(_)))
            .count()
    }

    pub fn double_closes(&self) -> Vec<StatementId> {
        self.lock().double_closes.clone()
    }

    pub fn open_server_statements(&self) -> usize {
        self.lock().prepared.len()
    }

    pub fn is_running(&self) -> bool {
        !self.lock().running.is_empty()
    }

    pub fn table_ids(&self) -> Vec<u64> {
        self.lock().table.keys().copied().collect()
    }

    pub fn table_value(&self, id: u64) -> Option<Value> {
        self.lock().table.get(&id).cloned()
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Communications("connection reset by peer".to_string()))
        }
    }

    fn run(&self, exec: ExecutionId, sql: &str, params: &[Value]) -> Result<Response, TransportError> {
        let mut st = self.lock();
        if let Some(needle) = &st.comm_failure {
            if sql.contains(needle.as_str()) {
                return Err(TransportError::Communications("lost packet".to_string()));
            }
        }
        let mut response = Response::default();
        let mut offset = 0usize;
        for piece in sql.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let shape = classify(piece);
            let n = shape.param_count();
            let piece_params = params.get(offset..offset + n).unwrap_or(&[]);
            offset += n;
            if let Some(seconds) = sleep_seconds(piece) {
                st = self.sleep(st, exec, seconds)?;
                response.outcomes.push(Outcome::Rows(RowSet {
                    columns: vec!["SLEEP".to_string()],
                    rows: vec![vec![Value::Int(0)]],
                }));
                continue;
            }
            match shape.kind {
                StatementKind::Insert | StatementKind::Replace => {
                    let (update, warnings) = insert(&mut st, piece, &shape, piece_params)?;
                    response.outcomes.push(Outcome::Update(update));
                    response.warnings.extend(warnings);
                }
                StatementKind::Update => {
                    let n = st.table.len() as u64;
                    response.outcomes.push(update(n));
                }
                StatementKind::Delete => {
                    let n = st.table.len() as u64;
                    st.table.clear();
                    response.outcomes.push(update(n));
                }
                _ if shape.is_select_like => response.outcomes.push(select(&st, piece)),
                _ => response.outcomes.push(update(0)),
            }
        }
        Ok(response)
    }

    fn sleep<'a>(
        &'a self,
        mut st: MutexGuard<'a, FakeState>,
        exec: ExecutionId,
        seconds: f64,
    ) -> Result<MutexGuard<'a, FakeState>, TransportError> {
        let deadline = Instant::now() + Duration::from_secs_f64(seconds).min(MAX_SLEEP);
        st.running.insert(exec);
        loop {
            if st.cancelled.contains(&exec) {
                st.running.remove(&exec);
                return Err(TransportError::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                st.running.remove(&exec);
                return Ok(st);
            }
            st = self.wake.wait_timeout(st, deadline - now).unwrap().0;
        }
    }
}

fn update(affected_rows: u64) -> Outcome {
    Outcome::Update(UpdateResult {
        affected_rows,
        generated_keys: vec![],
    })
}

fn select(st: &FakeState, sql: &str) -> Outcome {
    if sql.to_ascii_uppercase().contains(" FROM T") {
        return Outcome::Rows(RowSet {
            columns: vec!["id".to_string(), "v".to_string()],
            rows: st
                .table
                .iter()
                .map(|(id, v)| vec![Value::UInt(*id), v.clone()])
                .collect(),
        });
    }
    Outcome::Rows(RowSet {
        columns: vec!["1".to_string()],
        rows: vec![vec![Value::Int(1)]],
    })
}

fn sleep_seconds(sql: &str) -> Option<f64> {
    let upper = sql.to_ascii_uppercase();
    let start = upper.find("SLEEP(")? + "SLEEP(".len();
    let end = start + upper[start..].find(')')?;
    upper[start..end].trim().parse().ok()
}

fn insert(
    st: &mut FakeState,
    sql: &str,
    shape: &x07_ext_db_stmt::Shape,
    params: &[Value],
) -> Result<(UpdateResult, Vec<Warning>), TransportError> {
    if params.iter().any(|p| p.as_str() == Some(POISON)) {
        return Err(TransportError::server(
            1366,
            "HY000",
            format!("Incorrect string value: '{POISON}'"),
        ));
    }
    let rows = shape.values_row_count.max(1);
    let per_row = params.len() / rows;
    let upper = sql.to_ascii_uppercase();
    let explicit_id = upper.contains("(ID,") || upper.contains("(ID)");
    let odku = shape.has_on_duplicate_key_update();

    let row_values: Vec<(Option<u64>, Value)> = (0..rows)
        .map(|r| {
            let row = params.get(r * per_row..(r + 1) * per_row).unwrap_or(&[]);
            if explicit_id {
                let id = row.first().and_then(Value::as_u64);
                (id, row.get(1).cloned().unwrap_or(Value::Null))
            } else {
                (None, row.first().cloned().unwrap_or(Value::Null))
            }
        })
        .collect();

    if !odku {
        let mut seen = HashSet::new();
        for (id, _) in &row_values {
            if let Some(id) = id {
                if st.table.contains_key(id) || !seen.insert(*id) {
                    return Err(TransportError::server(
                        1062,
                        "23000",
                        format!("Duplicate entry '{id}' for key 'PRIMARY'"),
                    ));
                }
            }
        }
    }

    let mut result = UpdateResult::default();
    let mut warnings = Vec::new();
    for (row_no, (id, v)) in row_values.into_iter().enumerate() {
        let v = match v {
            Value::Bytes(b) if b.len() > st.column_width => {
                warnings.push(Warning {
                    level: "Warning".to_string(),
                    code: 1265,
                    message: format!("Data truncated for column 'v' at row {}", row_no + 1),
                });
                Value::Bytes(b[..st.column_width].to_vec())
            }
            v => v,
        };
        match id {
            Some(id) if st.table.contains_key(&id) => {
                st.table.insert(id, v);
                result.affected_rows += 2;
            }
            _ => {
                let key = id.unwrap_or(st.next_id);
                st.next_id = st.next_id.max(key + 1);
                st.table.insert(key, v);
                result.affected_rows += 1;
                result.generated_keys.push(key);
            }
        }
    }
    Ok((result, warnings))
}

impl Transport for FakeServer {
    fn prepare(&self, sql: &str) -> Result<StatementId, TransportError> {
        self.check_open()?;
        let mut st = self.lock();
        st.next_stmt += 1;
        let id = StatementId(st.next_stmt);
        st.prepared.insert(id, sql.to_string());
        st.calls.push(Call::Prepare(sql.to_string()));
        Ok(id)
    }

    fn execute(
        &self,
        exec: ExecutionId,
        stmt: StatementId,
        params: &[Value],
    ) -> Result<Response, TransportError> {
        self.check_open()?;
        let sql = {
            let mut st = self.lock();
            st.calls.push(Call::Execute(stmt, params.len()));
            st.prepared.get(&stmt).cloned()
        };
        let Some(sql) = sql else {
            return Err(TransportError::server(
                1243,
                "HY000",
                format!("Unknown prepared statement handler ({stmt})"),
            ));
        };
        self.run(exec, &sql, params)
    }

    fn query(&self, exec: ExecutionId, sql: &str) -> Result<Response, TransportError> {
        self.check_open()?;
        self.lock().calls.push(Call::Query(sql.to_string()));
        self.run(exec, sql, &[])
    }

    fn close_prepared(&self, stmt: StatementId) -> Result<(), TransportError> {
        let mut st = self.lock();
        st.calls.push(Call::Close(stmt));
        if st.prepared.remove(&stmt).is_none() {
            st.double_closes.push(stmt);
        }
        Ok(())
    }

    fn cancel(&self, exec: ExecutionId) -> Result<(), TransportError> {
        self.check_open()?;
        let mut st = self.lock();
        st.calls.push(Call::Cancel(exec));
        st.cancelled.insert(exec);
        self.wake.notify_all();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

pub fn connect(config: StmtConfig) -> (Arc<FakeServer>, Connection) {
    let server = FakeServer::new();
    let conn = Connection::new(server.clone(), config).unwrap();
    (server, conn)
}

pub fn rewrite_config() -> StmtConfig {
    StmtConfig {
        rewrite_batched_statements: true,
        ..StmtConfig::default()
    }
}

pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn key_column(rs: &x07_ext_db_stmt::ResultSetHandle) -> Vec<u64> {
    let mut out = Vec::new();
    while rs.next().unwrap() {
        out.push(rs.get(1).unwrap().as_u64().unwrap());
    }
    out
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
