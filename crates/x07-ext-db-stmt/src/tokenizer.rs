//! Lexical classification of SQL text.
//!
//! This is not a parser. It walks the text once, skipping string literals,
//! quoted identifiers and comments, and reports just enough structure for the
//! batch rewriter and the statement layer: what kind of statement it is,
//! where the `VALUES` row list sits, where `ON DUPLICATE KEY UPDATE` starts and
//! where the `?` placeholders are. Malformed input never fails; anything
//! unrecognized classifies as "not rewritable, not select-like".

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Call,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub kind: StatementKind,
    pub is_select_like: bool,
    pub is_rewritable: bool,
    /// Byte offset of the `ON` in `ON DUPLICATE KEY UPDATE`.
    pub on_duplicate_key_offset: Option<usize>,
    /// Byte range covering every row tuple after `VALUES`, parentheses included.
    pub values_clause_span: Option<Range<usize>>,
    pub values_row_count: usize,
    /// Byte offsets of `?` placeholders outside literals and comments.
    pub placeholders: Vec<usize>,
    pub has_limit: bool,
    pub statement_count: usize,
}

impl Shape {
    pub fn param_count(&self) -> usize {
        self.placeholders.len()
    }

    pub fn is_insert_or_replace(&self) -> bool {
        matches!(self.kind, StatementKind::Insert | StatementKind::Replace)
    }

    pub fn has_on_duplicate_key_update(&self) -> bool {
        self.on_duplicate_key_offset.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok {
    Word(usize, usize),
    Placeholder(usize),
    Open(usize),
    Close(usize),
    Comma(usize),
    Semi(usize),
    Other(usize),
}

impl Tok {
    fn pos(self) -> usize {
        match self {
            Tok::Word(s, _) => s,
            Tok::Placeholder(p)
            | Tok::Open(p)
            | Tok::Close(p)
            | Tok::Comma(p)
            | Tok::Semi(p)
            | Tok::Other(p) => p,
        }
    }
}

pub fn classify(sql: &str) -> Shape {
    let toks = lex(sql);
    let statements = split_statements(&toks);
    let first: &[Tok] = statements.first().copied().unwrap_or(&[]);

    let placeholders: Vec<usize> = toks
        .iter()
        .filter_map(|t| match t {
            Tok::Placeholder(p) => Some(*p),
            _ => None,
        })
        .collect();

    let (kind, is_select_like) = leading_kind(sql, first);
    let has_limit = toks.iter().any(|t| is_kw(sql, *t, "LIMIT"));
    let odku = find_on_duplicate_key(sql, first);

    let mut shape = Shape {
        kind,
        is_select_like,
        is_rewritable: false,
        on_duplicate_key_offset: odku.map(|i| first[i].pos()),
        values_clause_span: None,
        values_row_count: 0,
        placeholders,
        has_limit,
        statement_count: statements.len(),
    };

    if matches!(kind, StatementKind::Insert | StatementKind::Replace) {
        if let Some(rows) = values_rows(sql, first) {
            shape.values_clause_span = Some(rows.span.clone());
            shape.values_row_count = rows.count;
            shape.is_rewritable = shape.statement_count == 1 && rewritable_tail(sql, first, &rows);
        }
    }

    shape
}

fn is_word_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || c >= 0x80
}

fn lex(sql: &str) -> Vec<Tok> {
    let b = sql.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < b.len() {
        let c = b[i];
        match c {
            b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c => i += 1,
            b'\'' | b'"' => {
                out.push(Tok::Other(i));
                i = skip_quoted(b, i, c, true);
            }
            b'`' => {
                out.push(Tok::Other(i));
                i = skip_quoted(b, i, c, false);
            }
            b'#' => i = skip_line(b, i),
            b'-' if b.get(i + 1) == Some(&b'-')
                && b
                    .get(i + 2)
                    .map_or(true, |n| n.is_ascii_whitespace() || n.is_ascii_control()) =>
            {
                i = skip_line(b, i)
            }
            b'/' if b.get(i + 1) == Some(&b'*') => i = skip_block_comment(b, i),
            b'?' => {
                out.push(Tok::Placeholder(i));
                i += 1;
            }
            b'(' => {
                out.push(Tok::Open(i));
                i += 1;
            }
            b')' => {
                out.push(Tok::Close(i));
                i += 1;
            }
            b',' => {
                out.push(Tok::Comma(i));
                i += 1;
            }
            b';' => {
                out.push(Tok::Semi(i));
                i += 1;
            }
            c if is_word_byte(c) => {
                let start = i;
                while i < b.len() && is_word_byte(b[i]) {
                    i += 1;
                }
                out.push(Tok::Word(start, i));
            }
            _ => {
                out.push(Tok::Other(i));
                i += 1;
            }
        }
    }
    out
}

fn skip_quoted(b: &[u8], start: usize, quote: u8, backslash: bool) -> usize {
    let mut i = start + 1;
    while i < b.len() {
        let c = b[i];
        if backslash && c == b'\\' {
            i += 2;
            continue;
        }
        if c == quote {
            if b.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    b.len()
}

fn skip_line(b: &[u8], start: usize) -> usize {
    match b[start..].iter().position(|&c| c == b'\n') {
        Some(off) => start + off + 1,
        None => b.len(),
    }
}

fn skip_block_comment(b: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < b.len() {
        if b[i] == b'*' && b[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    b.len()
}

fn split_statements(toks: &[Tok]) -> Vec<&[Tok]> {
    toks.split(|t| matches!(t, Tok::Semi(_)))
        .filter(|s| !s.is_empty())
        .collect()
}

fn word<'a>(sql: &'a str, t: Tok) -> Option<&'a str> {
    match t {
        Tok::Word(s, e) => sql.get(s..e),
        _ => None,
    }
}

fn is_kw(sql: &str, t: Tok, kw: &str) -> bool {
    word(sql, t).is_some_and(|w| w.eq_ignore_ascii_case(kw))
}

fn leading_kind(sql: &str, stmt: &[Tok]) -> (StatementKind, bool) {
    let Some(first) = stmt
        .iter()
        .copied()
        .find(|t| !matches!(t, Tok::Open(_)))
        .and_then(|t| word(sql, t))
    else {
        return (StatementKind::Other, false);
    };
    let upper = first.to_ascii_uppercase();
    match upper.as_str() {
        "SELECT" => (StatementKind::Select, true),
        "WITH" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "DESC" | "TABLE" | "VALUES" => {
            (StatementKind::Other, true)
        }
        "INSERT" => (StatementKind::Insert, false),
        "REPLACE" => (StatementKind::Replace, false),
        "UPDATE" => (StatementKind::Update, false),
        "DELETE" => (StatementKind::Delete, false),
        "CALL" => (StatementKind::Call, false),
        _ => (StatementKind::Other, false),
    }
}

fn find_on_duplicate_key(sql: &str, stmt: &[Tok]) -> Option<usize> {
    let mut depth = 0i32;
    for (i, t) in stmt.iter().enumerate() {
        match t {
            Tok::Open(_) => depth += 1,
            Tok::Close(_) => depth -= 1,
            _ => {}
        }
        if depth != 0 || i + 3 >= stmt.len() {
            continue;
        }
        if is_kw(sql, *t, "ON")
            && is_kw(sql, stmt[i + 1], "DUPLICATE")
            && is_kw(sql, stmt[i + 2], "KEY")
            && is_kw(sql, stmt[i + 3], "UPDATE")
        {
            return Some(i);
        }
    }
    None
}

struct ValuesRows {
    keyword: usize,
    last_close: usize,
    span: Range<usize>,
    count: usize,
}

fn values_rows(sql: &str, stmt: &[Tok]) -> Option<ValuesRows> {
    let mut depth = 0i32;
    let mut keyword = None;
    for (i, t) in stmt.iter().enumerate() {
        match t {
            Tok::Open(_) => depth += 1,
            Tok::Close(_) => depth -= 1,
            _ => {
                if depth == 0 && (is_kw(sql, *t, "VALUES") || is_kw(sql, *t, "VALUE")) {
                    keyword = Some(i);
                    break;
                }
            }
        }
    }
    let keyword = keyword?;

    let mut open = keyword + 1;
    let first_open = match stmt.get(open)? {
        Tok::Open(p) => *p,
        _ => return None,
    };
    let mut count = 0usize;
    loop {
        let close = matching_close(stmt, open)?;
        count += 1;
        match (stmt.get(close + 1), stmt.get(close + 2)) {
            (Some(Tok::Comma(_)), Some(Tok::Open(_))) => open = close + 2,
            _ => {
                let close_pos = stmt[close].pos();
                return Some(ValuesRows {
                    keyword,
                    last_close: close,
                    span: first_open..close_pos + 1,
                    count,
                });
            }
        }
    }
}

fn matching_close(stmt: &[Tok], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    for (i, t) in stmt.iter().enumerate().skip(open) {
        match t {
            Tok::Open(_) => depth += 1,
            Tok::Close(_) => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn rewritable_tail(sql: &str, stmt: &[Tok], rows: &ValuesRows) -> bool {
    if stmt[rows.keyword..].iter().any(|t| is_kw(sql, *t, "SELECT")) {
        return false;
    }
    let tail = &stmt[rows.last_close + 1..];
    if tail.iter().any(|t| matches!(t, Tok::Placeholder(_))) {
        return false;
    }
    let calls_last_insert_id = tail.windows(2).any(|w| {
        is_kw(sql, w[0], "LAST_INSERT_ID") && matches!(w[1], Tok::Open(_))
    });
    !calls_last_insert_id
}
