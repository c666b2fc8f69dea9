//! Operator descriptors.
//!
//! Builtin operators form a closed enum. Anything else plugs in through the
//! [`Operator`] trait. A [`Registry`] maps names to descriptors once, before
//! any formula is analysed, and is read-only afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tf_expr::Node;
use tf_frame::History;
use tf_index::Window;
use tf_types::TypeTag;

use crate::{Args, FormulaError, HistoryQuery, IDate, Query, Value, builtins};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(usize),
    Variadic { min: usize },
}

impl Arity {
    #[must_use]
    pub fn admits(self, count: usize) -> bool {
        match self {
            Self::Fixed(n) => count == n,
            Self::Variadic { min } => count >= min,
        }
    }

    #[must_use]
    pub fn describe(self) -> String {
        match self {
            Self::Fixed(n) => n.to_string(),
            Self::Variadic { min } => format!("at least {min}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returns {
    Fixed(TypeTag),
    /// The widest argument type wins (see [`tf_types::broadcast_type`]).
    Broadcast,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    /// Admissible types per position. For variadic arities the last entry
    /// covers every extra argument.
    pub positional: Vec<Vec<TypeTag>>,
    pub arity: Arity,
    pub keywords: Vec<(String, Vec<TypeTag>)>,
    pub returns: Returns,
    /// At least one positional argument must be a number.
    pub scalar_operand: bool,
}

impl Signature {
    #[must_use]
    pub fn fixed(positional: Vec<Vec<TypeTag>>, returns: TypeTag) -> Self {
        Self {
            arity: Arity::Fixed(positional.len()),
            positional,
            keywords: Vec::new(),
            returns: Returns::Fixed(returns),
            scalar_operand: false,
        }
    }

    #[must_use]
    pub fn variadic(min: usize, each: Vec<TypeTag>, returns: Returns) -> Self {
        Self {
            positional: vec![each],
            arity: Arity::Variadic { min },
            keywords: Vec::new(),
            returns,
            scalar_operand: false,
        }
    }

    #[must_use]
    pub fn with_returns(mut self, returns: Returns) -> Self {
        self.returns = returns;
        self
    }

    #[must_use]
    pub fn with_scalar_operand(mut self) -> Self {
        self.scalar_operand = true;
        self
    }

    #[must_use]
    pub fn with_keyword(mut self, name: &str, types: Vec<TypeTag>) -> Self {
        self.keywords.push((name.to_owned(), types));
        self
    }

    #[must_use]
    pub fn expected_at(&self, position: usize) -> &[TypeTag] {
        self.positional
            .get(position)
            .or_else(|| self.positional.last())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    #[must_use]
    pub fn keyword(&self, name: &str) -> Option<&[TypeTag]> {
        self.keywords
            .iter()
            .find(|(keyword, _)| keyword == name)
            .map(|(_, types)| types.as_slice())
    }
}

/// Static attributes an operator imposes on every series beneath it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metas {
    /// Forces the timezone awareness of descendant leaves.
    pub tzaware: Option<bool>,
}

/// Extension point for operators outside the builtin set.
///
/// Only `name`, `signature` and `evaluate` are required. An operator that
/// reports `autotrophic() == true` owns its versioning: history queries call
/// `history`/`insertion_dates` instead of descending into its arguments.
pub trait Operator: Send + Sync {
    fn name(&self) -> &str;

    fn signature(&self) -> Signature;

    fn evaluate(&self, args: Args, query: &Query) -> Result<Value, FormulaError>;

    /// Stored series named by a call, given its raw arguments.
    fn find(&self, _args: &[Node]) -> Option<Vec<String>> {
        None
    }

    fn metas(&self) -> Option<Metas> {
        None
    }

    fn autotrophic(&self) -> bool {
        false
    }

    fn history(&self, _args: &Args, _query: &HistoryQuery) -> Result<History, FormulaError> {
        Ok(History::new())
    }

    fn insertion_dates(
        &self,
        _args: &Args,
        _idates: &Window<IDate>,
    ) -> Result<Vec<IDate>, FormulaError> {
        Ok(Vec::new())
    }

    /// Whether the operator works point by point, so that a staircase can
    /// be computed from per-leaf staircases.
    fn fast_staircase_safe(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Builtin {
    Series,
    Group,
    Options,
    Plus,
    Times,
    Divide,
    Add,
    Priority,
    Min,
    Max,
    RowMean,
    Abs,
    Round,
    Clip,
    Slice,
    Cumsum,
    Naive,
    Date,
    Constant,
    GroupAdd,
}

impl Builtin {
    pub const ALL: [Self; 20] = [
        Self::Series,
        Self::Group,
        Self::Options,
        Self::Plus,
        Self::Times,
        Self::Divide,
        Self::Add,
        Self::Priority,
        Self::Min,
        Self::Max,
        Self::RowMean,
        Self::Abs,
        Self::Round,
        Self::Clip,
        Self::Slice,
        Self::Cumsum,
        Self::Naive,
        Self::Date,
        Self::Constant,
        Self::GroupAdd,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Series => tf_expr::SERIES,
            Self::Group => "group",
            Self::Options => tf_expr::OPTIONS,
            Self::Plus => "+",
            Self::Times => "*",
            Self::Divide => "/",
            Self::Add => "add",
            Self::Priority => "priority",
            Self::Min => "min",
            Self::Max => "max",
            Self::RowMean => "row-mean",
            Self::Abs => "abs",
            Self::Round => "round",
            Self::Clip => "clip",
            Self::Slice => "slice",
            Self::Cumsum => "cumsum",
            Self::Naive => "naive",
            Self::Date => "date",
            Self::Constant => "constant",
            Self::GroupAdd => "group-add",
        }
    }

    #[must_use]
    pub fn signature(self) -> Signature {
        use TypeTag::{Int, Number, Series, Str, Table, Timestamp};

        let leaf_options = |signature: Signature| {
            signature
                .with_keyword("fill", vec![Str, Number])
                .with_keyword("prune", vec![Int])
                .with_keyword("weight", vec![Number])
        };
        let operand = || vec![Number, Series, Table];
        let date = || vec![Timestamp, Str];

        match self {
            Self::Series => leaf_options(Signature::fixed(vec![vec![Str]], Series)),
            Self::Group => Signature::fixed(vec![vec![Str]], Table),
            Self::Options => leaf_options(Signature::fixed(vec![vec![Series]], Series)),
            Self::Plus => Signature::fixed(vec![operand(), operand()], Number)
                .with_returns(Returns::Broadcast)
                .with_scalar_operand(),
            Self::Times | Self::Divide => {
                Signature::fixed(vec![operand(), operand()], Number)
                    .with_returns(Returns::Broadcast)
            }
            Self::Add | Self::Priority | Self::Min | Self::Max | Self::RowMean => {
                Signature::variadic(1, vec![Series], Returns::Fixed(Series))
            }
            Self::Abs | Self::Cumsum => Signature::fixed(vec![vec![Series]], Series),
            Self::Round => {
                Signature::fixed(vec![vec![Series]], Series).with_keyword("decimals", vec![Int])
            }
            Self::Clip => Signature::fixed(vec![vec![Series]], Series)
                .with_keyword("min", vec![Number])
                .with_keyword("max", vec![Number]),
            Self::Slice => Signature::fixed(vec![vec![Series]], Series)
                .with_keyword("fromdate", date())
                .with_keyword("todate", date()),
            Self::Naive => Signature::fixed(vec![vec![Series], vec![Str]], Series),
            Self::Date => Signature::fixed(vec![vec![Str]], Timestamp).with_keyword("tz", vec![Str]),
            Self::Constant => Signature::fixed(
                vec![vec![Number], date(), date(), vec![Str], date()],
                Series,
            ),
            Self::GroupAdd => {
                Signature::variadic(1, vec![Table, Series, Number], Returns::Fixed(Table))
            }
        }
    }

    #[must_use]
    pub fn fast_staircase_safe(self) -> bool {
        // naive shifts stamps, so a leaf stair no longer lines up with its
        // insertion dates
        !matches!(
            self,
            Self::Group | Self::Cumsum | Self::Naive | Self::Constant | Self::GroupAdd
        )
    }

    #[must_use]
    pub fn autotrophic(self) -> bool {
        matches!(self, Self::Constant)
    }

    #[must_use]
    pub fn metas(self) -> Option<Metas> {
        match self {
            Self::Naive => Some(Metas {
                tzaware: Some(false),
            }),
            _ => None,
        }
    }

    #[must_use]
    pub fn find(self, args: &[Node]) -> Option<Vec<String>> {
        match self {
            Self::Series => args
                .first()
                .and_then(Node::as_str)
                .map(|name| vec![name.to_owned()]),
            _ => None,
        }
    }
}

/// One registry entry.
#[derive(Clone)]
pub enum Descriptor {
    Builtin(Builtin),
    Extension(Arc<dyn Operator>),
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Builtin(builtin) => f.debug_tuple("Builtin").field(builtin).finish(),
            Self::Extension(operator) => f.debug_tuple("Extension").field(&operator.name()).finish(),
        }
    }
}

impl Descriptor {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(builtin) => builtin.name(),
            Self::Extension(operator) => operator.name(),
        }
    }

    #[must_use]
    pub fn signature(&self) -> Signature {
        match self {
            Self::Builtin(builtin) => builtin.signature(),
            Self::Extension(operator) => operator.signature(),
        }
    }

    #[must_use]
    pub fn fast_staircase_safe(&self) -> bool {
        match self {
            Self::Builtin(builtin) => builtin.fast_staircase_safe(),
            Self::Extension(operator) => operator.fast_staircase_safe(),
        }
    }

    #[must_use]
    pub fn autotrophic(&self) -> bool {
        match self {
            Self::Builtin(builtin) => builtin.autotrophic(),
            Self::Extension(operator) => operator.autotrophic(),
        }
    }

    #[must_use]
    pub fn metas(&self) -> Option<Metas> {
        match self {
            Self::Builtin(builtin) => builtin.metas(),
            Self::Extension(operator) => operator.metas(),
        }
    }

    #[must_use]
    pub fn find(&self, args: &[Node]) -> Option<Vec<String>> {
        match self {
            Self::Builtin(builtin) => builtin.find(args),
            Self::Extension(operator) => operator.find(args),
        }
    }

    /// Versions produced by an autotrophic call.
    pub fn history(&self, args: &Args, query: &HistoryQuery) -> Result<History, FormulaError> {
        match self {
            Self::Builtin(Builtin::Constant) => builtins::constant_history(args, query),
            Self::Builtin(_) => Ok(History::new()),
            Self::Extension(operator) => operator.history(args, query),
        }
    }

    pub fn insertion_dates(
        &self,
        args: &Args,
        idates: &Window<IDate>,
    ) -> Result<Vec<IDate>, FormulaError> {
        match self {
            Self::Builtin(Builtin::Constant) => builtins::constant_insertion_dates(args, idates),
            Self::Builtin(_) => Ok(Vec::new()),
            Self::Extension(operator) => operator.insertion_dates(args, idates),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    operators: BTreeMap<String, Descriptor>,
}

impl Registry {
    /// A registry with no operators at all.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn builtin() -> Self {
        let operators = Builtin::ALL
            .into_iter()
            .map(|builtin| (builtin.name().to_owned(), Descriptor::Builtin(builtin)))
            .collect();
        Self { operators }
    }

    /// Adds or replaces an operator; the last registration of a name wins.
    pub fn register(&mut self, operator: Arc<dyn Operator>) {
        let name = operator.name().to_owned();
        #[cfg(feature = "tracing")]
        tracing::debug!(operator = %name, "registering extension operator");
        self.operators.insert(name, Descriptor::Extension(operator));
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Descriptor> {
        self.operators.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.operators.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tf_types::TypeTag;

    use super::{Arity, Builtin, Descriptor, Operator, Registry, Returns, Signature};
    use crate::{Args, FormulaError, Query, Value};

    struct Twice;

    impl Operator for Twice {
        fn name(&self) -> &str {
            "twice"
        }

        fn signature(&self) -> Signature {
            Signature::fixed(vec![vec![TypeTag::Number]], TypeTag::Number)
        }

        fn evaluate(&self, args: Args, _query: &Query) -> Result<Value, FormulaError> {
            Ok(Value::Number(2.0 * args.at(0, "twice")?.as_f64("twice")?))
        }
    }

    #[test]
    fn builtin_registry_knows_every_builtin() {
        let registry = Registry::builtin();
        for builtin in Builtin::ALL {
            assert!(registry.contains(builtin.name()), "{}", builtin.name());
        }
        assert!(!registry.contains("foo"));
        assert_eq!(registry.names().count(), Builtin::ALL.len());
    }

    #[test]
    fn registries_are_independent() {
        let mut extended = Registry::builtin();
        extended.register(Arc::new(Twice));
        assert!(extended.contains("twice"));
        assert!(!Registry::builtin().contains("twice"));
        assert!(!Registry::empty().contains("series"));
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = Registry::builtin();
        registry.register(Arc::new(Twice));
        registry.register(Arc::new(Twice));
        assert!(matches!(
            registry.lookup("twice"),
            Some(Descriptor::Extension(_))
        ));
        assert_eq!(registry.names().count(), Builtin::ALL.len() + 1);
    }

    #[test]
    fn variadic_signatures_repeat_their_last_slot() {
        let signature = Builtin::Add.signature();
        assert_eq!(signature.arity, Arity::Variadic { min: 1 });
        assert!(!signature.arity.admits(0));
        assert_eq!(signature.expected_at(5), &[TypeTag::Series]);
        assert_eq!(Builtin::Plus.signature().returns, Returns::Broadcast);
        assert_eq!(
            Builtin::Series.signature().keyword("fill"),
            Some([TypeTag::Str, TypeTag::Number].as_slice())
        );
    }

    #[test]
    fn staircase_safety_excludes_history_dependent_operators() {
        assert!(Builtin::Add.fast_staircase_safe());
        assert!(!Builtin::Cumsum.fast_staircase_safe());
        assert!(Builtin::Constant.autotrophic());
        assert_eq!(
            Builtin::Naive.metas().and_then(|metas| metas.tzaware),
            Some(false)
        );
    }
}
