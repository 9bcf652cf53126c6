use std::sync::Arc;

/// Auto-increment values produced by one execution, in row order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedKeySequence {
    keys: Vec<u64>,
    expected: Option<usize>,
}

impl GeneratedKeySequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expected(expected: usize) -> Self {
        GeneratedKeySequence {
            keys: Vec::with_capacity(expected),
            expected: Some(expected),
        }
    }

    pub fn ingest(&mut self, keys: &[u64]) {
        self.keys.extend_from_slice(keys);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn expected_hint(&self) -> Option<usize> {
        self.expected
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.keys
    }

    pub fn cursor(&self) -> KeyCursor {
        KeyCursor {
            keys: Arc::from(self.keys.as_slice()),
            pos: 0,
        }
    }
}

/// Forward-only view over a key snapshot; every key is yielded once.
#[derive(Debug, Clone)]
pub struct KeyCursor {
    keys: Arc<[u64]>,
    pos: usize,
}

impl KeyCursor {
    pub fn remaining(&self) -> usize {
        self.keys.len() - self.pos
    }
}

impl Iterator for KeyCursor {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let k = self.keys.get(self.pos).copied()?;
        self.pos += 1;
        Some(k)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

impl ExactSizeIterator for KeyCursor {}

/// Derives per-row keys for servers that only report `LAST_INSERT_ID()` and
/// an affected-row count.
///
/// `first_id` is the id generated for the first inserted row; consecutive
/// rows step by `increment` (`@@auto_increment_increment`). With
/// `ON DUPLICATE KEY UPDATE` an updated row counts two affected rows, an
/// inserted one counts one and an unchanged one counts zero. The count alone
/// cannot separate those three cases, so the result is an estimate:
/// - above `row_count` affected rows, unchanged rows are assumed absent;
/// - at or below it, updated rows are assumed absent and every affected row
///   is taken as an insert. One insert, one update and one unchanged row
///   (3 affected of 3) therefore yield 3 keys, not 1.
///
/// Transports that know the real inserted ids should report those instead.
pub fn keys_from_last_insert_id(
    first_id: u64,
    affected_rows: u64,
    row_count: u64,
    increment: u64,
    on_duplicate_key: bool,
) -> Vec<u64> {
    if first_id == 0 || affected_rows == 0 {
        return vec![];
    }
    let inserted = if on_duplicate_key {
        if affected_rows > row_count {
            (2 * row_count).saturating_sub(affected_rows)
        } else {
            affected_rows
        }
    } else {
        affected_rows.min(row_count.max(1))
    };
    let step = increment.max(1);
    (0..inserted)
        .map(|i| first_id.saturating_add(i.saturating_mul(step)))
        .collect()
}
