//! Structural tree rewrites. Both passes rebuild the tree; inputs are never
//! modified in place.

use std::collections::BTreeSet;

use tf_types::Literal;

use crate::{ExprError, Node, SERIES};

/// Operator used to carry a leaf's keyword options across an expansion.
pub const OPTIONS: &str = "options";

/// Replaces `old` with `new` wherever it sits in name position, i.e. right
/// after a `series` symbol. Literals elsewhere, keyword values included,
/// are left alone.
#[must_use]
pub fn rename_series(tree: &Node, old: &str, new: &str) -> Node {
    match tree {
        Node::Atom(_) => tree.clone(),
        Node::List(items) => {
            let mut after_series = false;
            let rebuilt = items
                .iter()
                .map(|item| {
                    let out = match item {
                        Node::List(_) => rename_series(item, old, new),
                        Node::Atom(Literal::Str(name)) if after_series && name == old => {
                            Node::str(new)
                        }
                        Node::Atom(_) => item.clone(),
                    };
                    after_series = matches!(
                        item,
                        Node::Atom(Literal::Symbol(symbol)) if symbol == SERIES
                    );
                    out
                })
                .collect();
            Node::List(rebuilt)
        }
    }
}

/// Names appearing as the first argument of `operator` leaves.
#[must_use]
pub fn leaf_names(tree: &Node, operator: &str) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    tree.walk(&mut |node| {
        if node.operator() == Some(operator) {
            if let Some(name) = node.args().first().and_then(Node::as_str) {
                names.insert(name.to_owned());
            }
        }
    });
    names
}

/// Inlines every `series` leaf that names a formula.
///
/// `resolve` returns the parsed formula for a name, or `None` for stored
/// series. Names in `stop` are never inlined. A leaf carrying keyword
/// options is wrapped as `(options <expansion> #:kw value ...)` so the
/// options still reach the consuming operator.
pub fn expand(
    tree: &Node,
    resolve: &mut impl FnMut(&str) -> Result<Option<Node>, ExprError>,
    stop: &BTreeSet<String>,
    max_depth: usize,
) -> Result<Node, ExprError> {
    let mut stack = Vec::new();
    expand_inner(tree, resolve, stop, max_depth, &mut stack)
}

fn expand_inner(
    tree: &Node,
    resolve: &mut impl FnMut(&str) -> Result<Option<Node>, ExprError>,
    stop: &BTreeSet<String>,
    max_depth: usize,
    stack: &mut Vec<String>,
) -> Result<Node, ExprError> {
    let Node::List(items) = tree else {
        return Ok(tree.clone());
    };

    if let Some(name) = tree.series_name() {
        if stop.contains(name) {
            return Ok(tree.clone());
        }
        if stack.iter().any(|seen| seen == name) {
            let mut cycle = stack.clone();
            cycle.push(name.to_owned());
            return Err(ExprError::Cycle(cycle));
        }
        if stack.len() >= max_depth {
            return Err(ExprError::TooDeep(max_depth));
        }
        let Some(formula) = resolve(name)? else {
            return Ok(tree.clone());
        };

        stack.push(name.to_owned());
        let expanded = expand_inner(&formula, resolve, stop, max_depth, stack);
        stack.pop();
        let expanded = expanded?;

        let options = &items[2..];
        if options.is_empty() {
            return Ok(expanded);
        }
        let mut wrapped = vec![Node::symbol(OPTIONS), expanded];
        wrapped.extend(options.iter().cloned());
        return Ok(Node::List(wrapped));
    }

    let rebuilt = items
        .iter()
        .map(|item| expand_inner(item, resolve, stop, max_depth, stack))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Node::List(rebuilt))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::{expand, leaf_names, rename_series};
    use crate::{ExprError, Node, parse, serialize};

    fn formulas(defs: &[(&str, &str)]) -> BTreeMap<String, Node> {
        defs.iter()
            .map(|(name, text)| ((*name).to_owned(), parse(text).expect("formula")))
            .collect()
    }

    #[test]
    fn rename_touches_only_name_position() {
        let tree = parse(r#"(add (series "a" #:fill "a") (+ 1 (series "b")) (group "a"))"#)
            .expect("parse");
        let renamed = rename_series(&tree, "a", "z");
        assert_eq!(
            serialize(&renamed),
            r#"(add (series "z" #:fill "a") (+ 1 (series "b")) (group "a"))"#
        );
        assert_eq!(
            serialize(&tree),
            r#"(add (series "a" #:fill "a") (+ 1 (series "b")) (group "a"))"#,
            "input tree is untouched"
        );
    }

    #[test]
    fn rename_to_self_is_identity() {
        let tree = parse(r#"(priority (series "a") (series "b" #:prune 1))"#).expect("parse");
        assert_eq!(rename_series(&tree, "a", "a"), tree);
    }

    #[test]
    fn leaf_names_collects_distinct_names() {
        let tree = parse(r#"(add (series "b") (series "a") (series "b"))"#).expect("parse");
        let names = leaf_names(&tree, "series");
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn expand_inlines_nested_formulas_and_honours_stop_names() {
        let defs = formulas(&[
            ("f1", r#"(add (series "f2") (series "raw"))"#),
            ("f2", r#"(* 2 (series "g"))"#),
            ("g", r#"(series "deep")"#),
        ]);
        let mut resolve = |name: &str| Ok(defs.get(name).cloned());

        let full = expand(&defs["f1"], &mut resolve, &BTreeSet::new(), 16).expect("expand");
        assert_eq!(
            serialize(&full),
            r#"(add (* 2 (series "deep")) (series "raw"))"#
        );

        let stop = BTreeSet::from(["g".to_owned()]);
        let partial = expand(&defs["f1"], &mut resolve, &stop, 16).expect("expand");
        assert_eq!(
            serialize(&partial),
            r#"(add (* 2 (series "g")) (series "raw"))"#
        );
    }

    #[test]
    fn expand_wraps_leaf_options() {
        let defs = formulas(&[("f", r#"(series "raw")"#)]);
        let mut resolve = |name: &str| Ok(defs.get(name).cloned());
        let tree = parse(r#"(add (series "f" #:fill "ffill") (series "x"))"#).expect("parse");
        let out = expand(&tree, &mut resolve, &BTreeSet::new(), 16).expect("expand");
        assert_eq!(
            serialize(&out),
            r#"(add (options (series "raw") #:fill "ffill") (series "x"))"#
        );
    }

    #[test]
    fn expand_detects_cycles() {
        let defs = formulas(&[("a", r#"(series "b")"#), ("b", r#"(series "a")"#)]);
        let mut resolve = |name: &str| Ok(defs.get(name).cloned());
        let err = expand(&Node::series("a"), &mut resolve, &BTreeSet::new(), 16)
            .expect_err("cycle");
        assert_eq!(
            err,
            ExprError::Cycle(vec!["a".to_owned(), "b".to_owned(), "a".to_owned()])
        );
    }
}
