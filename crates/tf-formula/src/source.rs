//! Secondary read-only sources consulted when a name is not known locally.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tf_frame::{History, IDate, Series};
use tf_index::Window;

use crate::metadata::Metadata;
use crate::{FormulaError, HistoryQuery, Query};

/// What a formula reads, broken down by reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Components {
    pub name: String,
    pub parts: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Component {
    Series(String),
    Formula(Components),
}

impl Component {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Series(name) => name,
            Self::Formula(components) => &components.name,
        }
    }
}

/// A namespace the engine can read through when a name is absent locally.
pub trait Source: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str;

    fn exists(&self, name: &str) -> bool;

    fn get(&self, name: &str, query: &Query) -> Result<Option<Series>, FormulaError>;

    fn history(&self, name: &str, query: &HistoryQuery) -> Result<Option<History>, FormulaError>;

    fn insertion_dates(
        &self,
        name: &str,
        idates: &Window<IDate>,
    ) -> Result<Vec<IDate>, FormulaError>;

    fn formula(&self, name: &str, expanded: bool) -> Result<Option<String>, FormulaError>;

    fn formula_components(
        &self,
        name: &str,
        expanded: bool,
    ) -> Result<Option<Components>, FormulaError>;

    fn metadata(&self, name: &str) -> Result<Option<Metadata>, FormulaError>;
}

/// Secondary sources in priority order.
#[derive(Clone, Default)]
pub struct Sources {
    sources: Vec<Arc<dyn Source>>,
}

impl fmt::Debug for Sources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|source| source.name()))
            .finish()
    }
}

impl Sources {
    pub fn push(&mut self, source: Arc<dyn Source>) {
        self.sources.push(source);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// The first source knowing `name`.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<&dyn Source> {
        self.sources
            .iter()
            .find(|source| source.exists(name))
            .map(|source| source.as_ref())
    }
}
