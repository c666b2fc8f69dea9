#![no_main]

use libfuzzer_sys::fuzz_target;
use tf_expr::{leaf_names, parse, rename_series, serialize};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(tree) = parse(text) else {
        return;
    };
    let names = leaf_names(&tree, "series");
    let Some(old) = names.iter().find(|name| *name != "__renamed__") else {
        return;
    };

    let same = rename_series(&tree, old, old);
    assert_eq!(serialize(&same), serialize(&tree));

    let renamed = serialize(&rename_series(&tree, old, "__renamed__"));
    assert!(parse(&renamed).is_ok());
});
