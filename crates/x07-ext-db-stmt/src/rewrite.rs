//! Coalescing of queued batch items into multi-row statements.

use std::ops::Range;

use tracing::debug;

use crate::tokenizer::Shape;
use crate::transport::Value;

/// Item ran, but the server cannot attribute an affected-row count to it.
pub const SUCCESS_NO_INFO: i64 = -2;
pub const EXECUTE_FAILED: i64 = -3;

// Command byte plus the 4-byte packet header.
const PACKET_OVERHEAD: usize = 5;
// Server limit on placeholders in one prepared statement.
const MAX_PLACEHOLDERS: usize = 65_535;
// Separator between two row lists: ", ".
const ROW_SEPARATOR: &str = ", ";

#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub params: Vec<Value>,
    /// Set when the caller queued literal SQL instead of parameters.
    pub sql: Option<String>,
}

impl BatchItem {
    pub fn params(params: Vec<Value>) -> Self {
        BatchItem { params, sql: None }
    }

    pub fn literal(sql: impl Into<String>) -> Self {
        BatchItem {
            params: vec![],
            sql: Some(sql.into()),
        }
    }

    pub fn is_literal(&self) -> bool {
        self.sql.is_some()
    }

    fn params_len(&self) -> usize {
        self.params.iter().map(Value::encoded_len).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalSql {
    /// Run the statement's own prepared template.
    Template,
    /// Run this literal text.
    Literal(String),
    /// Run this merged multi-row text.
    Merged(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalStatement {
    pub sql: PhysicalSql,
    pub params: Vec<Value>,
    /// Indices into the original batch covered by this statement.
    pub items: Range<usize>,
}

impl PhysicalStatement {
    pub fn is_merged(&self) -> bool {
        matches!(self.sql, PhysicalSql::Merged(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchRewriter {
    max_packet_bytes: usize,
}

impl BatchRewriter {
    pub fn new(max_packet_bytes: usize) -> Self {
        BatchRewriter { max_packet_bytes }
    }

    /// True when `items` may be merged under `shape`.
    pub fn can_rewrite(shape: &Shape, items: &[BatchItem]) -> bool {
        shape.is_rewritable
            && shape.values_clause_span.is_some()
            && items.len() > 1
            && items.iter().all(|i| !i.is_literal())
    }

    /// Splits `items` into physical statements, in item order.
    pub fn plan(&self, sql: &str, shape: &Shape, items: &[BatchItem]) -> Vec<PhysicalStatement> {
        let span = match &shape.values_clause_span {
            Some(span) if Self::can_rewrite(shape, items) => span.clone(),
            _ => return Self::unmerged(items),
        };
        let per_row = shape
            .placeholders
            .iter()
            .filter(|&&p| span.contains(&p))
            .count()
            .max(1);
        let max_rows = (MAX_PLACEHOLDERS / per_row).max(1);
        let Some((prefix, rows, suffix)) = split_template(sql, span) else {
            return Self::unmerged(items);
        };

        let fixed = PACKET_OVERHEAD + prefix.len() + suffix.len();
        let mut out = Vec::new();
        let mut start = 0usize;
        while start < items.len() {
            let mut size = fixed + rows.len() + items[start].params_len();
            let mut end = start + 1;
            while end < items.len() && end - start < max_rows {
                let next = ROW_SEPARATOR.len() + rows.len() + items[end].params_len();
                if size + next > self.max_packet_bytes {
                    break;
                }
                size += next;
                end += 1;
            }
            out.push(physical(prefix, rows, suffix, &items[start..end], start));
            start = end;
        }

        debug!(
            items = items.len(),
            statements = out.len(),
            max_packet_bytes = self.max_packet_bytes,
            "rewrote batch"
        );
        out
    }

    /// One physical statement per item.
    pub fn unmerged(items: &[BatchItem]) -> Vec<PhysicalStatement> {
        items
            .iter()
            .enumerate()
            .map(|(i, item)| PhysicalStatement {
                sql: match &item.sql {
                    Some(sql) => PhysicalSql::Literal(sql.clone()),
                    None => PhysicalSql::Template,
                },
                params: item.params.clone(),
                items: i..i + 1,
            })
            .collect()
    }
}

fn split_template(sql: &str, span: Range<usize>) -> Option<(&str, &str, &str)> {
    let prefix = sql.get(..span.start)?;
    let rows = sql.get(span.clone())?;
    let suffix = sql.get(span.end..)?;
    Some((prefix, rows, suffix))
}

fn physical(
    prefix: &str,
    rows: &str,
    suffix: &str,
    chunk: &[BatchItem],
    first: usize,
) -> PhysicalStatement {
    let items = first..first + chunk.len();
    if chunk.len() == 1 {
        return PhysicalStatement {
            sql: PhysicalSql::Template,
            params: chunk[0].params.clone(),
            items,
        };
    }
    let mut sql = String::with_capacity(
        prefix.len() + suffix.len() + chunk.len() * (rows.len() + ROW_SEPARATOR.len()),
    );
    sql.push_str(prefix);
    for i in 0..chunk.len() {
        if i > 0 {
            sql.push_str(ROW_SEPARATOR);
        }
        sql.push_str(rows);
    }
    sql.push_str(suffix);
    PhysicalStatement {
        sql: PhysicalSql::Merged(sql),
        params: chunk.iter().flat_map(|i| i.params.iter().cloned()).collect(),
        items,
    }
}
