#![no_main]

use libfuzzer_sys::fuzz_target;
use x07_ext_db_stmt::classify;

fuzz_target!(|data: &[u8]| {
    let data = if data.len() > 64 * 1024 {
        &data[..64 * 1024]
    } else {
        data
    };

    let Ok(sql) = std::str::from_utf8(data) else {
        return;
    };

    let shape = classify(sql);
    for &pos in &shape.placeholders {
        assert_eq!(sql.as_bytes()[pos], b'?');
    }
    if let Some(span) = shape.values_clause_span.clone() {
        assert!(span.end <= sql.len());
        assert!(sql.is_char_boundary(span.start) && sql.is_char_boundary(span.end));
    }
});
