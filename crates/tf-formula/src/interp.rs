//! One recursive evaluator shared by every evaluation mode.
//!
//! The walk itself never changes; what a `series` or `group` leaf resolves
//! to is delegated to a [`Resolve`] implementation. Plain reads, history
//! replays, staircases and scenario evaluation each supply their own.

use std::collections::BTreeMap;

use tf_expr::{ExprError, Node};
use tf_frame::{Frame, Series, SeriesOptions};

use crate::registry::{Builtin, Descriptor, Registry};
use crate::{Args, FormulaError, Query, Value, builtins};

/// Leaf resolution strategy.
pub trait Resolve {
    fn series(&mut self, name: &str, query: &Query) -> Result<Series, FormulaError>;

    fn group(&mut self, name: &str, query: &Query) -> Result<Frame, FormulaError>;

    /// Value of an autotrophic call computed by the strategy itself, or
    /// `None` to evaluate the operator directly.
    fn autotrophic(&mut self, _call: &Node, _query: &Query) -> Result<Option<Value>, FormulaError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Interpreter<'r> {
    registry: &'r Registry,
}

impl<'r> Interpreter<'r> {
    #[must_use]
    pub fn new(registry: &'r Registry) -> Self {
        Self { registry }
    }

    pub fn evaluate<R: Resolve + ?Sized>(
        &self,
        resolver: &mut R,
        node: &Node,
        query: &Query,
    ) -> Result<Value, FormulaError> {
        match node {
            Node::Atom(literal) => Ok(Value::from_literal(literal)),
            Node::List(_) => self.call(resolver, node, query),
        }
    }

    /// Evaluates the arguments of `call` without applying its operator.
    pub fn arguments<R: Resolve + ?Sized>(
        &self,
        resolver: &mut R,
        call: &Node,
        query: &Query,
    ) -> Result<Args, FormulaError> {
        let keywords = self.keywords(resolver, call, query)?;
        let positional = self.positional(resolver, call, query)?;
        Ok(Args {
            positional,
            keywords,
        })
    }

    fn call<R: Resolve + ?Sized>(
        &self,
        resolver: &mut R,
        node: &Node,
        query: &Query,
    ) -> Result<Value, FormulaError> {
        let operator = node.operator().ok_or(ExprError::MalformedList(0))?;
        let descriptor = self
            .registry
            .lookup(operator)
            .ok_or_else(|| FormulaError::UnknownOperators(vec![operator.to_owned()]))?;

        if descriptor.autotrophic() {
            if let Some(value) = resolver.autotrophic(node, query)? {
                return Ok(value);
            }
        }

        match descriptor {
            Descriptor::Builtin(Builtin::Series) => {
                let name = node.series_name().ok_or_else(|| {
                    FormulaError::invalid_argument(operator, "expects a series name")
                })?;
                let keywords = self.keywords(resolver, node, query)?;
                let options = builtins::series_options(operator, &keywords, SeriesOptions::default())?;
                let series = resolver.series(name, query)?;
                Ok(Value::Series(series.with_options(options)))
            }
            Descriptor::Builtin(Builtin::Group) => {
                let name = node.args().first().and_then(Node::as_str).ok_or_else(|| {
                    FormulaError::invalid_argument(operator, "expects a group name")
                })?;
                Ok(Value::Table(resolver.group(name, query)?))
            }
            Descriptor::Builtin(builtin) => {
                let keywords = self.keywords(resolver, node, query)?;
                let inner = builtins::child_query(*builtin, &keywords, query)?;
                let positional = self.positional(resolver, node, &inner)?;
                builtins::evaluate(
                    *builtin,
                    Args {
                        positional,
                        keywords,
                    },
                    query,
                )
            }
            Descriptor::Extension(extension) => {
                let args = self.arguments(resolver, node, query)?;
                extension.evaluate(args, query)
            }
        }
    }

    fn positional<R: Resolve + ?Sized>(
        &self,
        resolver: &mut R,
        node: &Node,
        query: &Query,
    ) -> Result<Vec<Value>, FormulaError> {
        node.call_args()?
            .positional
            .into_iter()
            .map(|arg| self.evaluate(resolver, arg, query))
            .collect()
    }

    fn keywords<R: Resolve + ?Sized>(
        &self,
        resolver: &mut R,
        node: &Node,
        query: &Query,
    ) -> Result<BTreeMap<String, Value>, FormulaError> {
        node.call_args()?
            .keywords
            .into_iter()
            .map(|(name, arg)| -> Result<_, FormulaError> {
                Ok((name.to_owned(), self.evaluate(resolver, arg, query)?))
            })
            .collect()
    }
}
