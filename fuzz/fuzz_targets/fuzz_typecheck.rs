#![no_main]

use libfuzzer_sys::fuzz_target;
use tf_expr::parse;
use tf_formula::{Registry, unknown_operators};
use tf_formula::analysis::infer_type;

// Analysis must reject, never panic, on arbitrary trees.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(tree) = parse(text) else {
        return;
    };
    let registry = Registry::builtin();
    let _ = unknown_operators(&tree, &registry);
    let _ = infer_type(&tree, &registry);
});
