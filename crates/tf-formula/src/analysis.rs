//! Registration-time passes over a parsed formula: operator existence,
//! typing, series references and timezone consistency.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tf_expr::{ExprError, Node, OPTIONS, SERIES};
use tf_types::{Literal, TypeError, TypeTag, accepts_any, broadcast_type, describe_types};

use crate::FormulaError;
use crate::registry::{Descriptor, Registry, Returns};

/// Every distinct operator missing from `registry`, in first-seen order.
#[must_use]
pub fn unknown_operators(tree: &Node, registry: &Registry) -> Vec<String> {
    tree.operators()
        .into_iter()
        .filter(|operator| !registry.contains(operator))
        .map(str::to_owned)
        .collect()
}

pub fn check_operators(tree: &Node, registry: &Registry) -> Result<(), FormulaError> {
    let unknown = unknown_operators(tree, registry);
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(FormulaError::UnknownOperators(unknown))
    }
}

/// Static type of `node`, checking every call against its signature.
///
/// Operators missing from the registry type as `Any`; they are reported by
/// [`unknown_operators`] instead.
pub fn infer_type(node: &Node, registry: &Registry) -> Result<TypeTag, TypeError> {
    let Node::List(_) = node else {
        return Ok(node.as_literal().map_or(TypeTag::Any, Literal::type_tag));
    };
    let Some(operator) = node.operator() else {
        return Ok(TypeTag::Any);
    };
    let Some(descriptor) = registry.lookup(operator) else {
        return Ok(TypeTag::Any);
    };
    let call = node.call_args().map_err(|err| dangling(operator, err))?;
    let signature = descriptor.signature();

    if !signature.arity.admits(call.positional.len()) {
        return Err(TypeError::Arity {
            operator: operator.to_owned(),
            expected: signature.arity.describe(),
            actual: call.positional.len(),
        });
    }

    let mut types = Vec::with_capacity(call.positional.len());
    for (position, arg) in call.positional.iter().enumerate() {
        let actual = infer_type(arg, registry)?;
        let expected = signature.expected_at(position);
        if !accepts_any(expected, actual) {
            return Err(TypeError::ArgumentMismatch {
                operator: operator.to_owned(),
                position,
                expected: describe_types(expected),
                actual,
            });
        }
        types.push(actual);
    }

    if signature.scalar_operand
        && let [left, right] = types[..]
        && !TypeTag::Number.accepts(left)
        && !TypeTag::Number.accepts(right)
    {
        return Err(TypeError::NoScalarOperand {
            operator: operator.to_owned(),
            left,
            right,
        });
    }

    for (keyword, arg) in &call.keywords {
        let Some(expected) = signature.keyword(keyword) else {
            return Err(TypeError::UnknownKeyword {
                operator: operator.to_owned(),
                keyword: (*keyword).to_owned(),
            });
        };
        let actual = infer_type(arg, registry)?;
        if !accepts_any(expected, actual) {
            return Err(TypeError::KeywordMismatch {
                operator: operator.to_owned(),
                keyword: (*keyword).to_owned(),
                expected: describe_types(expected),
                actual,
            });
        }
    }

    Ok(match signature.returns {
        Returns::Fixed(tag) => tag,
        Returns::Broadcast => broadcast_type(&types),
    })
}

/// Infers the type of `tree` and requires it to fit `expected`.
pub fn typecheck(tree: &Node, registry: &Registry, expected: TypeTag) -> Result<TypeTag, TypeError> {
    let actual = infer_type(tree, registry)?;
    if expected.accepts(actual) {
        Ok(actual)
    } else {
        Err(TypeError::RootMismatch { expected, actual })
    }
}

fn dangling(operator: &str, err: ExprError) -> TypeError {
    match err {
        ExprError::DanglingKeyword { operator, keyword } => {
            TypeError::DanglingKeyword { operator, keyword }
        }
        other => TypeError::DanglingKeyword {
            operator: operator.to_owned(),
            keyword: other.to_string(),
        },
    }
}

/// Names of the stored series `tree` refers to, through every operator
/// that declares a finder.
#[must_use]
pub fn series_references(tree: &Node, registry: &Registry) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_references(tree, registry, &mut names);
    names
}

fn collect_references(node: &Node, registry: &Registry, names: &mut BTreeSet<String>) {
    if let Some(found) = finder(node, registry) {
        names.extend(found);
        return;
    }
    for arg in node.args() {
        collect_references(arg, registry, names);
    }
}

fn finder(node: &Node, registry: &Registry) -> Option<Vec<String>> {
    node.operator()
        .and_then(|operator| registry.lookup(operator))
        .and_then(|descriptor| descriptor.find(node.args()))
}

/// Each referenced series with whether it currently exists.
pub fn find_series(
    tree: &Node,
    registry: &Registry,
    exists: &mut impl FnMut(&str) -> bool,
) -> BTreeMap<String, bool> {
    series_references(tree, registry)
        .into_iter()
        .map(|name| {
            let found = exists(&name);
            (name, found)
        })
        .collect()
}

/// Timezone status of one series reference, with the path of operators
/// leading to it (`operator@depth`, outermost first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafMeta {
    pub series: String,
    pub path: String,
    pub tzaware: Option<bool>,
}

impl LeafMeta {
    #[must_use]
    pub fn describe(&self) -> String {
        let status = match self.tzaware {
            Some(true) => "tzaware",
            Some(false) => "naive",
            None => "unknown",
        };
        format!("({}, {}): {status}", self.series, self.path)
    }
}

/// Resolves the timezone status of every series reference. The nearest
/// ancestor declaring a `tzaware` meta overrides what `lookup` reports.
pub fn find_metas(
    tree: &Node,
    registry: &Registry,
    lookup: &mut impl FnMut(&str) -> Option<bool>,
) -> Vec<LeafMeta> {
    let mut leaves = Vec::new();
    let mut path = Vec::new();
    collect_metas(tree, registry, 0, None, &mut path, lookup, &mut leaves);
    leaves
}

fn collect_metas(
    node: &Node,
    registry: &Registry,
    depth: usize,
    forced: Option<bool>,
    path: &mut Vec<String>,
    lookup: &mut impl FnMut(&str) -> Option<bool>,
    leaves: &mut Vec<LeafMeta>,
) {
    let Some(operator) = node.operator() else {
        return;
    };
    let descriptor = registry.lookup(operator);
    let forced = descriptor
        .and_then(Descriptor::metas)
        .and_then(|metas| metas.tzaware)
        .or(forced);

    path.push(format!("{operator}@{depth}"));
    match descriptor.and_then(|descriptor| descriptor.find(node.args())) {
        Some(names) => {
            for name in names {
                let tzaware = forced.or_else(|| lookup(&name));
                leaves.push(LeafMeta {
                    series: name,
                    path: path.join("/"),
                    tzaware,
                });
            }
        }
        None => {
            for arg in node.args() {
                collect_metas(arg, registry, depth + 1, forced, path, lookup, leaves);
            }
        }
    }
    path.pop();
}

/// The common timezone status of `leaves`; `None` when nothing is known.
pub fn check_tz(formula: &str, leaves: &[LeafMeta]) -> Result<Option<bool>, FormulaError> {
    let mut known = leaves.iter().filter_map(|leaf| leaf.tzaware);
    let Some(first) = known.next() else {
        return Ok(None);
    };
    if known.all(|tzaware| tzaware == first) {
        return Ok(Some(first));
    }
    Err(FormulaError::TimezoneMismatch {
        formula: formula.to_owned(),
        statuses: leaves.iter().map(LeafMeta::describe).collect(),
    })
}

/// What the history machinery reads: stored series, plus the autotrophic
/// calls it must not descend into.
#[derive(Debug, Default)]
pub(crate) struct HistoryLeaves<'a> {
    pub series: BTreeSet<String>,
    pub autotrophic: Vec<&'a Node>,
}

pub(crate) fn history_leaves<'a>(tree: &'a Node, registry: &Registry) -> HistoryLeaves<'a> {
    let mut leaves = HistoryLeaves::default();
    collect_history_leaves(tree, registry, &mut leaves);
    leaves
}

fn collect_history_leaves<'a>(node: &'a Node, registry: &Registry, leaves: &mut HistoryLeaves<'a>) {
    let Some(descriptor) = node.operator().and_then(|operator| registry.lookup(operator)) else {
        return;
    };
    if descriptor.autotrophic() {
        leaves.autotrophic.push(node);
        return;
    }
    if let Some(names) = descriptor.find(node.args()) {
        leaves.series.extend(names);
        return;
    }
    for arg in node.args() {
        collect_history_leaves(arg, registry, leaves);
    }
}

/// Whether a staircase of `tree` can be assembled from per-leaf staircases.
///
/// Every operator must work point by point, and no leaf may carry `fill`
/// or `prune`: both read neighbouring points of the whole version.
#[must_use]
pub fn fast_staircase_safe(tree: &Node, registry: &Registry) -> bool {
    let mut safe = true;
    tree.walk(&mut |node| {
        let Some(operator) = node.operator() else {
            return;
        };
        let pointwise = registry
            .lookup(operator)
            .is_some_and(Descriptor::fast_staircase_safe);
        if !pointwise || reads_neighbours(node) {
            safe = false;
        }
    });
    safe
}

fn reads_neighbours(node: &Node) -> bool {
    if !matches!(node.operator(), Some(SERIES | OPTIONS)) {
        return false;
    }
    node.call_args().map_or(true, |args| {
        args.keyword("fill").is_some() || args.keyword("prune").is_some()
    })
}
