use std::collections::BTreeMap;

use tf_frame::{Frame, Series};
use tf_index::{Stamp, parse_stamp};
use tf_types::{Literal, TypeTag};

use crate::FormulaError;

/// What an operator call evaluates to.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Number(f64),
    Str(String),
    Timestamp(Stamp),
    Series(Series),
    Table(Frame),
}

impl Value {
    #[must_use]
    pub fn from_literal(literal: &Literal) -> Self {
        match literal {
            Literal::Int(v) => Self::Int(*v),
            Literal::Float(v) => Self::Number(*v),
            Literal::Str(v) | Literal::Symbol(v) => Self::Str(v.clone()),
        }
    }

    #[must_use]
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Int(_) => TypeTag::Int,
            Self::Number(_) => TypeTag::Number,
            Self::Str(_) => TypeTag::Str,
            Self::Timestamp(_) => TypeTag::Timestamp,
            Self::Series(_) => TypeTag::Series,
            Self::Table(_) => TypeTag::Table,
        }
    }

    pub fn as_f64(&self, operator: &str) -> Result<f64, FormulaError> {
        match self {
            Self::Int(v) => Ok(*v as f64),
            Self::Number(v) => Ok(*v),
            other => Err(other.mismatch(operator, TypeTag::Number)),
        }
    }

    /// Integral value; a float with no fractional part is accepted.
    pub fn as_int(&self, operator: &str) -> Result<i64, FormulaError> {
        match self {
            Self::Int(v) => Ok(*v),
            Self::Number(v) if v.fract() == 0.0 && v.is_finite() => Ok(*v as i64),
            other => Err(other.mismatch(operator, TypeTag::Int)),
        }
    }

    pub fn as_str(&self, operator: &str) -> Result<&str, FormulaError> {
        match self {
            Self::Str(v) => Ok(v),
            other => Err(other.mismatch(operator, TypeTag::Str)),
        }
    }

    /// Timestamps, or strings in one of the accepted stamp layouts.
    pub fn as_timestamp(&self, operator: &str) -> Result<Stamp, FormulaError> {
        match self {
            Self::Timestamp(v) => Ok(*v),
            Self::Str(v) => Ok(parse_stamp(v)?),
            other => Err(other.mismatch(operator, TypeTag::Timestamp)),
        }
    }

    pub fn into_series(self, operator: &str) -> Result<Series, FormulaError> {
        match self {
            Self::Series(series) => Ok(series),
            other => Err(other.mismatch(operator, TypeTag::Series)),
        }
    }

    /// Tables pass through; a lone series becomes a one-column table.
    pub fn into_table(self, operator: &str) -> Result<Frame, FormulaError> {
        match self {
            Self::Table(frame) => Ok(frame),
            Self::Series(series) => Ok(Frame::from_series(vec![series])?),
            other => Err(other.mismatch(operator, TypeTag::Table)),
        }
    }

    fn mismatch(&self, operator: &str, expected: TypeTag) -> FormulaError {
        FormulaError::InvalidValue {
            operator: operator.to_owned(),
            expected,
            actual: self.type_tag(),
        }
    }
}

/// Evaluated arguments of one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    pub positional: Vec<Value>,
    pub keywords: BTreeMap<String, Value>,
}

impl Args {
    #[must_use]
    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keywords.get(name)
    }

    pub fn at(&self, position: usize, operator: &str) -> Result<&Value, FormulaError> {
        self.positional.get(position).ok_or_else(|| {
            FormulaError::invalid_argument(operator, format!("missing argument {position}"))
        })
    }

    pub fn take(&mut self, position: usize, operator: &str) -> Result<Value, FormulaError> {
        if position >= self.positional.len() {
            return Err(FormulaError::invalid_argument(
                operator,
                format!("missing argument {position}"),
            ));
        }
        Ok(std::mem::replace(
            &mut self.positional[position],
            Value::Int(0),
        ))
    }
}
