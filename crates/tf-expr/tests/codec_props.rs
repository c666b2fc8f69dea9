use proptest::prelude::*;
use tf_expr::{Node, parse, rename_series, serialize};
use tf_types::Literal;

fn atom_strategy() -> impl Strategy<Value = Node> {
    prop_oneof![
        "[a-zA-Z0-9 _.\"\\\\-]{0,10}".prop_map(Node::str),
        any::<i64>().prop_map(Node::int),
        (-1.0e12..1.0e12_f64).prop_map(Node::float),
        "[a-z][a-z0-9-]{0,6}".prop_map(|name| Node::keyword(&name)),
    ]
}

fn operator_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("series".to_owned()),
        Just("add".to_owned()),
        Just("+".to_owned()),
        Just("*".to_owned()),
        "[a-z][a-z0-9-]{0,6}",
    ]
}

fn tree_strategy() -> impl Strategy<Value = Node> {
    atom_strategy().prop_recursive(4, 48, 5, |inner| {
        (operator_strategy(), prop::collection::vec(inner, 0..5)).prop_map(|(op, args)| {
            let mut items = vec![Node::Atom(Literal::Symbol(op))];
            items.extend(args);
            Node::List(items)
        })
    })
}

fn list_strategy() -> impl Strategy<Value = Node> {
    (operator_strategy(), prop::collection::vec(tree_strategy(), 0..4)).prop_map(|(op, args)| {
        let mut items = vec![Node::Atom(Literal::Symbol(op))];
        items.extend(args);
        Node::List(items)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_parse_inverts_serialize(tree in list_strategy()) {
        let text = serialize(&tree);
        let reparsed = parse(&text);
        prop_assert!(reparsed.is_ok(), "failed to reparse {text}: {reparsed:?}");
        prop_assert_eq!(reparsed.unwrap(), tree);
    }

    #[test]
    fn prop_rename_to_self_keeps_text(tree in list_strategy(), name in "[a-z]{1,4}") {
        let renamed = rename_series(&tree, &name, &name);
        prop_assert_eq!(serialize(&renamed), serialize(&tree));
    }
}
