use std::fmt;

use crate::error::TransportError;

pub const WARN_DATA_TRUNCATED: u16 = 1265;
pub const WARN_DATA_TOO_LONG: u16 = 1406;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(pub u32);

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stmt#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Value {
    /// Bytes this value occupies in a binary-protocol parameter block.
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Int(_) | Value::UInt(_) | Value::Double(_) => 8,
            Value::Bytes(b) => lenenc_len(b.len()) + b.len(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::UInt(n) => i64::try_from(*n).ok(),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            Value::Int(n) => u64::try_from(*n).ok(),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}

fn lenenc_len(n: usize) -> usize {
    if n < 251 {
        1
    } else if n < 1 << 16 {
        3
    } else if n < 1 << 24 {
        4
    } else {
        9
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(if v { 1 } else { 0 })
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(v.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Bytes(v.into_bytes())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

pub type Row = Vec<Value>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub affected_rows: u64,
    /// Keys in server order, one per row actually inserted.
    pub generated_keys: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rows(RowSet),
    Update(UpdateResult),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub level: String,
    pub code: u16,
    pub message: String,
}

impl Warning {
    pub fn is_truncation(&self) -> bool {
        self.code == WARN_DATA_TRUNCATED || self.code == WARN_DATA_TOO_LONG
    }
}

/// Everything one round-trip produced: one outcome per chained statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub outcomes: Vec<Outcome>,
    pub warnings: Vec<Warning>,
}

impl Response {
    pub fn update(affected_rows: u64, generated_keys: Vec<u64>) -> Self {
        Response {
            outcomes: vec![Outcome::Update(UpdateResult {
                affected_rows,
                generated_keys,
            })],
            warnings: vec![],
        }
    }

    pub fn rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Response {
            outcomes: vec![Outcome::Rows(RowSet { columns, rows })],
            warnings: vec![],
        }
    }

    pub fn with_warning(mut self, warning: Warning) -> Self {
        self.warnings.push(warning);
        self
    }
}

/// Wire-level collaborator. Implementations own encoding, the socket and any
/// retry policy; this crate only sequences calls.
pub trait Transport: Send + Sync {
    fn prepare(&self, sql: &str) -> Result<StatementId, TransportError>;

    fn execute(
        &self,
        exec: ExecutionId,
        stmt: StatementId,
        params: &[Value],
    ) -> Result<Response, TransportError>;

    /// Runs `params_list` against one prepared statement, in order.
    ///
    /// May return fewer results than parameter sets when it stops early; the
    /// caller treats missing slots as not executed. `stopped` is polled before
    /// each parameter set.
    fn execute_batch(
        &self,
        exec: ExecutionId,
        stmt: StatementId,
        params_list: &[Vec<Value>],
        continue_on_error: bool,
        stopped: &dyn Fn() -> bool,
    ) -> Vec<Result<Response, TransportError>> {
        let mut out = Vec::with_capacity(params_list.len());
        for params in params_list {
            if stopped() {
                break;
            }
            let res = self.execute(exec, stmt, params);
            let stop = match &res {
                Ok(_) => false,
                Err(TransportError::Server { .. }) => !continue_on_error,
                Err(_) => true,
            };
            out.push(res);
            if stop {
                break;
            }
        }
        out
    }

    fn query(&self, exec: ExecutionId, sql: &str) -> Result<Response, TransportError>;

    fn close_prepared(&self, stmt: StatementId) -> Result<(), TransportError>;

    fn cancel(&self, exec: ExecutionId) -> Result<(), TransportError>;

    fn is_open(&self) -> bool {
        true
    }
}
