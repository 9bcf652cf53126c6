use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::trace;

use crate::error::{Error, HandleKind, Result};
use crate::statement::{StatementHandle, StatementInner};
use crate::transport::{Row, RowSet, Value};

pub const GENERATED_KEY_COLUMN: &str = "GENERATED_KEY";

/// Forward-only cursor over one result produced by a statement.
#[derive(Clone)]
pub struct ResultSetHandle {
    inner: Arc<ResultSetInner>,
}

pub(crate) struct ResultSetInner {
    pub(crate) id: u64,
    owner: Weak<StatementInner>,
    generated_keys: bool,
    tracked: bool,
    closed: AtomicBool,
    cursor: Mutex<Cursor>,
}

struct Cursor {
    columns: Vec<String>,
    rows: VecDeque<Row>,
    current: Option<Row>,
    row_number: u64,
    fetch_size: u32,
}

impl ResultSetInner {
    pub(crate) fn new(
        id: u64,
        owner: Weak<StatementInner>,
        set: RowSet,
        max_rows: u64,
        fetch_size: u32,
        generated_keys: bool,
        tracked: bool,
    ) -> Arc<Self> {
        let RowSet { columns, mut rows } = set;
        if max_rows > 0 && rows.len() as u64 > max_rows {
            rows.truncate(max_rows as usize);
        }
        Arc::new(ResultSetInner {
            id,
            owner,
            generated_keys,
            tracked,
            closed: AtomicBool::new(false),
            cursor: Mutex::new(Cursor {
                columns,
                rows: rows.into(),
                current: None,
                row_number: 0,
                fetch_size,
            }),
        })
    }

    pub(crate) fn generated_keys(
        id: u64,
        owner: Weak<StatementInner>,
        keys: impl Iterator<Item = u64>,
        tracked: bool,
    ) -> Arc<Self> {
        let set = RowSet {
            columns: vec![GENERATED_KEY_COLUMN.to_string()],
            rows: keys.map(|k| vec![Value::UInt(k)]).collect(),
        };
        Self::new(id, owner, set, 0, 0, true, tracked)
    }

    pub(crate) fn is_generated_keys(&self) -> bool {
        self.generated_keys
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes without telling the owner. Used when the owner itself is
    /// closing or advancing. Returns false if already closed.
    pub(crate) fn mark_closed(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut c = self.cursor();
        c.rows.clear();
        c.current = None;
        true
    }

    fn close(&self) {
        if !self.mark_closed() {
            return;
        }
        trace!(id = self.id, generated_keys = self.generated_keys, "result set closed");
        if !self.tracked {
            return;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.on_result_closed(self.id, self.generated_keys);
        }
    }

    fn kind(&self) -> HandleKind {
        if self.generated_keys {
            HandleKind::GeneratedKeys
        } else {
            HandleKind::ResultSet
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::stale(self.kind()));
        }
        Ok(())
    }

    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ResultSetHandle {
    pub(crate) fn from_inner(inner: Arc<ResultSetInner>) -> Self {
        ResultSetHandle { inner }
    }

    pub fn next(&self) -> Result<bool> {
        self.inner.ensure_open()?;
        let mut c = self.inner.cursor();
        c.current = c.rows.pop_front();
        if c.current.is_some() {
            c.row_number += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn get(&self, column: usize) -> Result<Value> {
        self.inner.ensure_open()?;
        let c = self.inner.cursor();
        let row = c
            .current
            .as_ref()
            .ok_or_else(|| Error::illegal("no current row; call next() first"))?;
        if column == 0 || column > row.len() {
            return Err(Error::illegal(format!(
                "column index {column} out of range (1..={})",
                row.len()
            )));
        }
        Ok(row[column - 1].clone())
    }

    pub fn get_by_label(&self, label: &str) -> Result<Value> {
        let idx = {
            self.inner.ensure_open()?;
            let c = self.inner.cursor();
            c.columns
                .iter()
                .position(|name| name.eq_ignore_ascii_case(label))
                .ok_or_else(|| Error::illegal(format!("unknown column {label:?}")))?
        };
        self.get(idx + 1)
    }

    pub fn columns(&self) -> Result<Vec<String>> {
        self.inner.ensure_open()?;
        Ok(self.inner.cursor().columns.clone())
    }

    pub fn row_number(&self) -> Result<u64> {
        self.inner.ensure_open()?;
        Ok(self.inner.cursor().row_number)
    }

    pub fn fetch_size(&self) -> Result<u32> {
        self.inner.ensure_open()?;
        Ok(self.inner.cursor().fetch_size)
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_generated_keys(&self) -> bool {
        self.inner.generated_keys
    }

    pub fn statement(&self) -> Option<StatementHandle> {
        self.inner.owner.upgrade().map(StatementHandle::from_inner)
    }
}

impl std::fmt::Debug for ResultSetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultSetHandle")
            .field("id", &self.inner.id)
            .field("generated_keys", &self.inner.generated_keys)
            .field("closed", &self.inner.is_closed())
            .finish()
    }
}
