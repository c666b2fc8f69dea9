#![no_main]

use libfuzzer_sys::fuzz_target;
use tf_expr::{parse, serialize};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(tree) = parse(text) else {
        return;
    };
    let canonical = serialize(&tree);
    let reparsed = parse(&canonical).expect("canonical text parses");
    assert!(reparsed.semantic_eq(&tree));
    assert_eq!(serialize(&reparsed), canonical);
});
