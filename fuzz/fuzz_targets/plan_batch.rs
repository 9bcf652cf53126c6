#![no_main]

use libfuzzer_sys::fuzz_target;
use x07_ext_db_stmt::rewrite::{BatchItem, BatchRewriter};
use x07_ext_db_stmt::{classify, Value};

const TEMPLATES: [&str; 4] = [
    "INSERT INTO t (v) VALUES (?)",
    "INSERT INTO t (id, v) VALUES (?, ?) ON DUPLICATE KEY UPDATE v = VALUES(v)",
    "REPLACE INTO t (v) VALUES (?)",
    "UPDATE t SET v = ? WHERE id = 1",
];

fuzz_target!(|data: &[u8]| {
    let Some((&head, rest)) = data.split_first() else {
        return;
    };
    let sql = TEMPLATES[usize::from(head) % TEMPLATES.len()];
    let shape = classify(sql);
    let width = shape.param_count().max(1);

    let items: Vec<BatchItem> = rest
        .chunks(width)
        .take(512)
        .map(|chunk| {
            let mut params: Vec<Value> = chunk
                .iter()
                .map(|&b| Value::Bytes(vec![b'x'; usize::from(b)]))
                .collect();
            params.resize(shape.param_count(), Value::Null);
            BatchItem::params(params)
        })
        .collect();

    let max_packet = 256 + usize::from(head) * 64;
    let plan = BatchRewriter::new(max_packet).plan(sql, &shape, &items);

    let mut next = 0;
    for stmt in &plan {
        assert_eq!(stmt.items.start, next);
        assert!(stmt.items.end > stmt.items.start);
        next = stmt.items.end;
    }
    assert_eq!(next, items.len());
});
