use std::fmt;

use thiserror::Error;

pub const DB_ERR_STALE_HANDLE: u32 = 53_264;
pub const DB_ERR_ILLEGAL_ARGUMENT: u32 = 53_265;
pub const DB_ERR_TRUNCATION: u32 = 53_266;
pub const DB_ERR_BATCH_PARTIAL: u32 = 53_267;
pub const DB_ERR_CANCELLED: u32 = 53_268;
pub const DB_ERR_COMMUNICATIONS: u32 = 53_269;
pub const DB_ERR_SERVER: u32 = 53_270;

const SQL_EXCERPT_MAX: usize = 120;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Connection,
    Statement,
    ResultSet,
    GeneratedKeys,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::Connection => "connection",
            HandleKind::Statement => "statement",
            HandleKind::ResultSet => "result set",
            HandleKind::GeneratedKeys => "generated keys",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    Timeout,
    Explicit,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Timeout => f.write_str("query timeout"),
            CancelReason::Explicit => f.write_str("cancelled by caller"),
        }
    }
}

/// Failure reported by a [`crate::Transport`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("server error {code} ({sql_state}): {message}")]
    Server {
        code: u16,
        sql_state: String,
        message: String,
    },
    #[error("communications link failure: {0}")]
    Communications(String),
    #[error("execution interrupted")]
    Interrupted,
}

impl TransportError {
    pub fn server(code: u16, sql_state: &str, message: impl Into<String>) -> Self {
        TransportError::Server {
            code,
            sql_state: sql_state.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("batch item {index}: {error}")]
pub struct ItemFailure {
    pub index: usize,
    pub error: Error,
}

/// Per-item outcome of a batch that did not fully succeed.
///
/// `counts` always has one slot per queued item, whatever grouping was used
/// on the wire.
#[derive(Debug)]
pub struct BatchFailure {
    pub counts: Vec<i64>,
    pub failures: Vec<ItemFailure>,
}

impl BatchFailure {
    pub fn first(&self) -> Option<&ItemFailure> {
        self.failures.first()
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} batch items failed",
            self.failures.len(),
            self.counts.len()
        )?;
        if let Some(first) = self.first() {
            write!(f, " (first: {first})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("operation on closed {what}")]
    StaleHandle { what: HandleKind },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("data truncated running {sql:?}: {message}")]
    Truncation { message: String, sql: String },

    #[error("{0}")]
    BatchPartialFailure(BatchFailure),

    #[error("statement cancelled ({reason}) running {sql:?}")]
    Cancelled { reason: CancelReason, sql: String },

    #[error("communications failure running {sql:?}: {message}")]
    Communications { message: String, sql: String },

    #[error("server rejected {sql:?}{}: error {code} ({sql_state}): {message}", batch_suffix(.batch_index))]
    Server {
        code: u16,
        sql_state: String,
        message: String,
        sql: String,
        batch_index: Option<usize>,
    },
}

fn batch_suffix(index: &Option<usize>) -> String {
    match index {
        Some(i) => format!(" (batch item {i})"),
        None => String::new(),
    }
}

impl Error {
    pub fn stale(what: HandleKind) -> Self {
        Error::StaleHandle { what }
    }

    pub fn illegal(msg: impl Into<String>) -> Self {
        Error::IllegalArgument(msg.into())
    }

    pub fn cancelled(reason: CancelReason, sql: &str) -> Self {
        Error::Cancelled {
            reason,
            sql: sql_excerpt(sql),
        }
    }

    pub fn from_transport(err: TransportError, sql: &str, batch_index: Option<usize>) -> Self {
        match err {
            TransportError::Server {
                code,
                sql_state,
                message,
            } => Error::Server {
                code,
                sql_state,
                message,
                sql: sql_excerpt(sql),
                batch_index,
            },
            TransportError::Communications(message) => Error::Communications {
                message,
                sql: sql_excerpt(sql),
            },
            TransportError::Interrupted => Error::cancelled(CancelReason::Explicit, sql),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Error::StaleHandle { .. } => DB_ERR_STALE_HANDLE,
            Error::IllegalArgument(_) => DB_ERR_ILLEGAL_ARGUMENT,
            Error::Truncation { .. } => DB_ERR_TRUNCATION,
            Error::BatchPartialFailure(_) => DB_ERR_BATCH_PARTIAL,
            Error::Cancelled { .. } => DB_ERR_CANCELLED,
            Error::Communications { .. } => DB_ERR_COMMUNICATIONS,
            Error::Server { .. } => DB_ERR_SERVER,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Error::StaleHandle { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::Cancelled {
                reason: CancelReason::Timeout,
                ..
            }
        )
    }

    pub fn batch_counts(&self) -> Option<&[i64]> {
        match self {
            Error::BatchPartialFailure(b) => Some(&b.counts),
            _ => None,
        }
    }
}

pub(crate) fn sql_excerpt(sql: &str) -> String {
    let sql = sql.trim();
    if sql.len() <= SQL_EXCERPT_MAX {
        return sql.to_string();
    }
    let mut end = SQL_EXCERPT_MAX;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &sql[..end])
}
