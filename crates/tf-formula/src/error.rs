use tf_expr::ExprError;
use tf_frame::FrameError;
use tf_index::IndexError;
use tf_runtime::RuntimeError;
use tf_types::{TypeError, TypeTag};
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum FormulaError {
    #[error("formula uses unknown operators: {}", .0.join(", "))]
    UnknownOperators(Vec<String>),
    #[error("formula `{formula}` refers to unknown series {}", quoted(.names))]
    UnknownSeries { formula: String, names: Vec<String> },
    #[error("formula `{formula}` refers to unknown groups {}", quoted(.names))]
    UnknownGroups { formula: String, names: Vec<String> },
    #[error("formula `{formula}` mixes tz-aware and naive series: {}", .statuses.join(", "))]
    TimezoneMismatch {
        formula: String,
        statuses: Vec<String>,
    },
    #[error("`{0}` is a primary series and cannot be turned into a formula")]
    PrimaryExists(String),
    #[error("formula `{0}` already exists")]
    FormulaExists(String),
    #[error("`{0}` is already taken")]
    NameTaken(String),
    #[error("`{0}` is not a registered formula")]
    NotAFormula(String),
    #[error("`{0}` is a formula and cannot be updated with raw values")]
    FormulaUpdate(String),
    #[error("new name `{new}` is already referenced by {}", quoted(.referenced_by))]
    RenameConflict {
        new: String,
        referenced_by: Vec<String>,
    },
    #[error("unknown series `{0}`")]
    UnknownName(String),
    #[error("unknown group `{0}`")]
    UnknownGroup(String),
    #[error("malformed binding: {0}")]
    MalformedBinding(String),
    #[error("group `{group}` has no scenario `{scenario}`")]
    MissingScenario { group: String, scenario: String },
    #[error("formula `{0}` resolves no group mappings")]
    NoGroupMappings(String),
    #[error("metadata key `{0}` is managed by the engine")]
    ProtectedMetadata(String),
    #[error("operator `{operator}` expected a {expected} value, got {actual}")]
    InvalidValue {
        operator: String,
        expected: TypeTag,
        actual: TypeTag,
    },
    #[error("operator `{operator}`: {message}")]
    InvalidArgument { operator: String, message: String },
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl FormulaError {
    pub(crate) fn invalid_argument(operator: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operator: operator.to_owned(),
            message: message.into(),
        }
    }
}

fn quoted(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("`{name}`"))
        .collect::<Vec<_>>()
        .join(", ")
}
