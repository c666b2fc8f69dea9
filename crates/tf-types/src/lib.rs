#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix marking a symbol as a keyword argument (`#:fill "ffill"`).
pub const KEYWORD_PREFIX: &str = "#:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    Int,
    Number,
    Str,
    Timestamp,
    Series,
    Table,
    Any,
}

impl TypeTag {
    /// Whether a slot declared as `self` admits a value typed `actual`.
    ///
    /// `Int` is a subtype of `Number`; `Any` is compatible both ways so that
    /// extension operators with loose signatures do not poison inference.
    #[must_use]
    pub fn accepts(self, actual: Self) -> bool {
        self == actual
            || matches!(self, Self::Any)
            || matches!(actual, Self::Any)
            || (matches!(self, Self::Number) && matches!(actual, Self::Int))
    }

    #[must_use]
    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Int | Self::Number)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Number => "number",
            Self::Str => "str",
            Self::Timestamp => "timestamp",
            Self::Series => "series",
            Self::Table => "table",
            Self::Any => "any",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renders a set of admissible types as `a|b|c`.
#[must_use]
pub fn describe_types(types: &[TypeTag]) -> String {
    types
        .iter()
        .map(|tag| tag.as_str())
        .collect::<Vec<_>>()
        .join("|")
}

#[must_use]
pub fn accepts_any(expected: &[TypeTag], actual: TypeTag) -> bool {
    expected.iter().any(|tag| tag.accepts(actual))
}

/// Result type of a broadcasting arithmetic operator.
///
/// Tables dominate series, series dominate scalars. Two integers stay
/// integral, anything else numeric widens to `Number`.
#[must_use]
pub fn broadcast_type(args: &[TypeTag]) -> TypeTag {
    if args.iter().any(|tag| matches!(tag, TypeTag::Any)) {
        return TypeTag::Any;
    }
    if args.iter().any(|tag| matches!(tag, TypeTag::Table)) {
        return TypeTag::Table;
    }
    if args.iter().any(|tag| matches!(tag, TypeTag::Series)) {
        return TypeTag::Series;
    }
    if !args.is_empty() && args.iter().all(|tag| matches!(tag, TypeTag::Int)) {
        return TypeTag::Int;
    }
    TypeTag::Number
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Symbol(String),
}

impl Literal {
    #[must_use]
    pub fn keyword(name: &str) -> Self {
        Self::Symbol(format!("{KEYWORD_PREFIX}{name}"))
    }

    /// Static type of the literal when it appears as an argument.
    ///
    /// Bare symbols only occur in operator position; as arguments they are
    /// treated as strings.
    #[must_use]
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Str(_) | Self::Symbol(_) => TypeTag::Str,
            Self::Int(_) => TypeTag::Int,
            Self::Float(_) => TypeTag::Number,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_keyword(&self) -> bool {
        self.keyword_name().is_some()
    }

    /// Keyword name without its `#:` prefix.
    #[must_use]
    pub fn keyword_name(&self) -> Option<&str> {
        self.as_symbol()
            .and_then(|sym| sym.strip_prefix(KEYWORD_PREFIX))
    }

    pub fn to_f64(&self) -> Result<f64, TypeError> {
        match self {
            Self::Int(v) => Ok(*v as f64),
            Self::Float(v) => Ok(*v),
            Self::Str(v) | Self::Symbol(v) => Err(TypeError::NonNumericValue {
                value: v.clone(),
                tag: self.type_tag(),
            }),
        }
    }

    /// Structural equality that treats two NaN floats as equal.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float(a), Self::Float(b)) => (a.is_nan() && b.is_nan()) || a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Symbol(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TypeError {
    #[error("operator `{operator}` argument {position} expects {expected}, got {actual}")]
    ArgumentMismatch {
        operator: String,
        position: usize,
        expected: String,
        actual: TypeTag,
    },
    #[error("operator `{operator}` keyword `{keyword}` expects {expected}, got {actual}")]
    KeywordMismatch {
        operator: String,
        keyword: String,
        expected: String,
        actual: TypeTag,
    },
    #[error("operator `{operator}` expects {expected} positional arguments, got {actual}")]
    Arity {
        operator: String,
        expected: String,
        actual: usize,
    },
    #[error("operator `{operator}` has no keyword `{keyword}`")]
    UnknownKeyword { operator: String, keyword: String },
    #[error("keyword `{keyword}` of operator `{operator}` has no value")]
    DanglingKeyword { operator: String, keyword: String },
    #[error("formula has type {actual}, expected {expected}")]
    RootMismatch { expected: TypeTag, actual: TypeTag },
    #[error("value {value:?} has non-numeric type {tag}")]
    NonNumericValue { value: String, tag: TypeTag },
    #[error("operator `{operator}` needs a number on one side, got {left} and {right}")]
    NoScalarOperand {
        operator: String,
        left: TypeTag,
        right: TypeTag,
    },
}

#[cfg(test)]
mod tests {
    use super::{Literal, TypeError, TypeTag, accepts_any, broadcast_type, describe_types};

    #[test]
    fn number_slot_admits_int_but_not_the_reverse() {
        assert!(TypeTag::Number.accepts(TypeTag::Int));
        assert!(!TypeTag::Int.accepts(TypeTag::Number));
        assert!(TypeTag::Any.accepts(TypeTag::Table));
        assert!(accepts_any(
            &[TypeTag::Number, TypeTag::Series],
            TypeTag::Series
        ));
    }

    #[test]
    fn broadcast_prefers_tables_then_series() {
        assert_eq!(
            broadcast_type(&[TypeTag::Number, TypeTag::Series]),
            TypeTag::Series
        );
        assert_eq!(
            broadcast_type(&[TypeTag::Series, TypeTag::Table]),
            TypeTag::Table
        );
        assert_eq!(broadcast_type(&[TypeTag::Int, TypeTag::Int]), TypeTag::Int);
        assert_eq!(
            broadcast_type(&[TypeTag::Int, TypeTag::Number]),
            TypeTag::Number
        );
    }

    #[test]
    fn keyword_symbols_strip_their_prefix() {
        let kw = Literal::keyword("fill");
        assert_eq!(kw, Literal::Symbol("#:fill".to_owned()));
        assert_eq!(kw.keyword_name(), Some("fill"));
        assert!(!Literal::Symbol("series".to_owned()).is_keyword());
    }

    #[test]
    fn strings_are_not_numeric() {
        let err = Literal::Str("x".to_owned())
            .to_f64()
            .expect_err("must fail");
        assert_eq!(
            err,
            TypeError::NonNumericValue {
                value: "x".to_owned(),
                tag: TypeTag::Str
            }
        );
        assert_eq!(describe_types(&[TypeTag::Number, TypeTag::Series]), "number|series");
    }

    #[test]
    fn literal_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Literal::Int(3)).expect("serialize");
        assert_eq!(json, r#"{"kind":"int","value":3}"#);
    }
}
