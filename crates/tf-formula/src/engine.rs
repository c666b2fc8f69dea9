//! The formula engine: registration, naming and lifecycle of formulas,
//! group formulas and bindings over a [`SeriesStore`].
//!
//! Every mutating call validates first and writes last, so a failed call
//! leaves the engine untouched.

mod eval;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tf_expr::{ExprError, Node, expand, leaf_names, parse, rename_series, serialize};
use tf_frame::{Frame, IDate, Series};
use tf_runtime::{DecisionAction, EngineConfig, EvidenceLedger, IssueKind};
use tf_types::TypeTag;

use crate::analysis::{check_operators, check_tz, find_metas, find_series, series_references, typecheck};
use crate::binder::{Binding, BindingRow};
use crate::metadata::{self, Metadata, apply_update, default_metadata, merge_preserved};
use crate::registry::Registry;
use crate::source::{Component, Components, Source, Sources};
use crate::store::SeriesStore;
use crate::FormulaError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterOptions {
    /// Overrides the policy on references to unknown series.
    pub reject_unknown: Option<bool>,
    /// Replace an existing formula of the same name.
    pub update: bool,
}

impl RegisterOptions {
    #[must_use]
    pub fn updating() -> Self {
        Self {
            update: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn allow_unknown(mut self) -> Self {
        self.reject_unknown = Some(false);
        self
    }
}

/// Persisted shape of a formula: `(name, text, metadata)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaRecord {
    pub name: String,
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesType {
    Primary,
    Formula,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Primary,
    Formula,
    Bound,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum CacheKey {
    Series(String),
    Group(String),
}

#[derive(Debug)]
pub struct FormulaEngine<S> {
    config: EngineConfig,
    registry: Arc<Registry>,
    store: S,
    formulas: BTreeMap<String, FormulaRecord>,
    group_formulas: BTreeMap<String, FormulaRecord>,
    /// Bound group name to its binding.
    bindings: BTreeMap<String, Binding>,
    sources: Sources,
    /// Parsed formula text; dropped on every registration, rename or delete.
    cache: RwLock<BTreeMap<CacheKey, Arc<Node>>>,
    ledger: EvidenceLedger,
}

impl<S: SeriesStore> FormulaEngine<S> {
    pub fn new(store: S, config: EngineConfig) -> Result<Self, FormulaError> {
        Self::with_registry(store, config, Arc::new(Registry::builtin()))
    }

    pub fn with_registry(
        store: S,
        config: EngineConfig,
        registry: Arc<Registry>,
    ) -> Result<Self, FormulaError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            store,
            formulas: BTreeMap::new(),
            group_formulas: BTreeMap::new(),
            bindings: BTreeMap::new(),
            sources: Sources::default(),
            cache: RwLock::new(BTreeMap::new()),
            ledger: EvidenceLedger::new(),
        })
    }

    /// Appends a secondary source; sources are consulted in insertion order.
    pub fn add_source(&mut self, source: Arc<dyn Source>) {
        self.sources.push(source);
        self.invalidate();
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn formula_names(&self) -> impl Iterator<Item = &str> {
        self.formulas.keys().map(String::as_str)
    }

    // registration

    pub fn register_formula(
        &mut self,
        name: &str,
        text: &str,
        options: RegisterOptions,
    ) -> Result<(), FormulaError> {
        let tree = parse(text)?;
        if self.store.exists(name) {
            let error = FormulaError::PrimaryExists(name.to_owned());
            return Err(self.rejected(IssueKind::PrimaryConflict, name, error));
        }
        if self.formulas.contains_key(name) && !options.update {
            let error = FormulaError::FormulaExists(name.to_owned());
            return Err(self.rejected(IssueKind::PrimaryConflict, name, error));
        }

        let tzaware = self.validate(name, &tree, TypeTag::Series, options)?;
        let metadata = merge_preserved(
            default_metadata(tzaware.unwrap_or(false)),
            self.formulas.get(name).map(|record| &record.metadata),
        );
        self.formulas.insert(
            name.to_owned(),
            FormulaRecord {
                name: name.to_owned(),
                text: serialize(&tree),
                metadata,
            },
        );
        self.registered(name, "formula");
        Ok(())
    }

    /// Registers a formula evaluating to a table of scenario columns.
    pub fn register_group_formula(
        &mut self,
        name: &str,
        text: &str,
        options: RegisterOptions,
    ) -> Result<(), FormulaError> {
        let tree = parse(text)?;
        if self.store.group_exists(name) || self.bindings.contains_key(name) {
            let error = FormulaError::NameTaken(name.to_owned());
            return Err(self.rejected(IssueKind::PrimaryConflict, name, error));
        }
        if self.group_formulas.contains_key(name) && !options.update {
            let error = FormulaError::FormulaExists(name.to_owned());
            return Err(self.rejected(IssueKind::PrimaryConflict, name, error));
        }

        let tzaware = self.validate(name, &tree, TypeTag::Table, options)?;
        let metadata = merge_preserved(
            default_metadata(tzaware.unwrap_or(false)),
            self.group_formulas.get(name).map(|record| &record.metadata),
        );
        self.group_formulas.insert(
            name.to_owned(),
            FormulaRecord {
                name: name.to_owned(),
                text: serialize(&tree),
                metadata,
            },
        );
        self.registered(name, "group formula");
        Ok(())
    }

    /// Binds the series references of `formula` to groups, making `group`
    /// readable as one column per scenario combination.
    pub fn register_formula_bindings(
        &mut self,
        group: &str,
        formula: &str,
        rows: Vec<BindingRow>,
    ) -> Result<(), FormulaError> {
        self.bind(group, formula, |formula| Binding::new(formula, rows))
    }

    /// Same as [`Self::register_formula_bindings`] for rows read from
    /// loosely typed records with the columns `series`, `group` and
    /// `family`.
    pub fn register_formula_binding_records(
        &mut self,
        group: &str,
        formula: &str,
        records: &[Json],
    ) -> Result<(), FormulaError> {
        self.bind(group, formula, |formula| Binding::from_records(formula, records))
    }

    fn bind(
        &mut self,
        group: &str,
        formula: &str,
        build: impl FnOnce(&str) -> Result<Binding, FormulaError>,
    ) -> Result<(), FormulaError> {
        if !self.formulas.contains_key(formula) {
            let error = FormulaError::NotAFormula(formula.to_owned());
            return Err(self.rejected(IssueKind::MalformedBinding, group, error));
        }
        if self.store.group_exists(group) || self.group_formulas.contains_key(group) {
            let error = FormulaError::NameTaken(group.to_owned());
            return Err(self.rejected(IssueKind::MalformedBinding, group, error));
        }
        let binding = match build(formula) {
            Ok(binding) => binding,
            Err(error) => return Err(self.rejected(IssueKind::MalformedBinding, group, error)),
        };
        self.bindings.insert(group.to_owned(), binding);
        self.registered(group, "bindings");
        Ok(())
    }

    #[must_use]
    pub fn bindings(&self, group: &str) -> Option<&Binding> {
        self.bindings.get(group)
    }

    /// Runs the registration passes in order and returns the common
    /// timezone awareness of the formula's leaves.
    fn validate(
        &mut self,
        name: &str,
        tree: &Node,
        expected: TypeTag,
        options: RegisterOptions,
    ) -> Result<Option<bool>, FormulaError> {
        let text = serialize(tree);

        if let Err(error) = check_operators(tree, &self.registry) {
            return Err(self.rejected(IssueKind::UnknownOperator, name, error));
        }
        if let Err(error) = typecheck(tree, &self.registry, expected) {
            return Err(self.rejected(IssueKind::TypeMismatch, name, error.into()));
        }
        if let Err(error) = self.expand_pending(tree, name, expected) {
            return Err(self.rejected(IssueKind::Cycle, name, error));
        }

        let missing = find_series(tree, &self.registry, &mut |series| self.exists(series))
            .into_iter()
            .filter(|(_, exists)| !exists)
            .map(|(series, _)| series)
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            let action = self.config.policy.decide_unknown_series(
                name,
                &missing,
                options.reject_unknown,
                &mut self.ledger,
            );
            if action == DecisionAction::Reject {
                let error = FormulaError::UnknownSeries {
                    formula: text,
                    names: missing,
                };
                trace_rejection(name, &error);
                return Err(error);
            }
        }

        let missing_groups = leaf_names(tree, "group")
            .into_iter()
            .filter(|group| !self.group_exists(group))
            .collect::<Vec<_>>();
        let reject_unknown = options
            .reject_unknown
            .unwrap_or(self.config.policy.reject_unknown_series);
        if !missing_groups.is_empty() && reject_unknown {
            let error = FormulaError::UnknownGroups {
                formula: text,
                names: missing_groups,
            };
            return Err(self.rejected(IssueKind::UnknownSeries, name, error));
        }

        let leaves = find_metas(tree, &self.registry, &mut |series| self.tzaware(series));
        match check_tz(&text, &leaves) {
            Ok(tzaware) => Ok(tzaware),
            Err(error) => Err(self.rejected(IssueKind::TimezoneMismatch, name, error)),
        }
    }

    /// Expands `tree` as if it were already registered under `name`, which
    /// surfaces reference cycles before anything is written.
    fn expand_pending(&self, tree: &Node, name: &str, expected: TypeTag) -> Result<Node, FormulaError> {
        let mut resolve = |series: &str| -> Result<Option<Node>, ExprError> {
            if series == name && expected == TypeTag::Series {
                return Ok(Some(tree.clone()));
            }
            self.formulas
                .get(series)
                .map(|record| parse(&record.text))
                .transpose()
        };
        Ok(expand(tree, &mut resolve, &BTreeSet::new(), self.config.max_depth)?)
    }

    /// Inlines every formula reference of `tree` except names in `stop`.
    fn expand_tree(&self, tree: &Node, stop: &BTreeSet<String>) -> Result<Node, FormulaError> {
        let mut resolve = |series: &str| -> Result<Option<Node>, ExprError> {
            self.formulas
                .get(series)
                .map(|record| parse(&record.text))
                .transpose()
        };
        Ok(expand(tree, &mut resolve, stop, self.config.max_depth)?)
    }

    fn rejected(&mut self, kind: IssueKind, subject: &str, error: FormulaError) -> FormulaError {
        self.config
            .policy
            .reject(kind, subject, error.to_string(), &mut self.ledger);
        trace_rejection(subject, &error);
        error
    }

    fn registered(&mut self, name: &str, what: &str) {
        self.invalidate();
        self.config
            .policy
            .allow(IssueKind::Registered, name, what, &mut self.ledger);
        #[cfg(feature = "tracing")]
        tracing::info!(name, kind = what, "registered");
    }

    fn invalidate(&self) {
        self.cache.write().clear();
        #[cfg(feature = "tracing")]
        tracing::debug!("formula cache cleared");
    }

    fn cached(&self, key: CacheKey, record: Option<&FormulaRecord>) -> Result<Option<Arc<Node>>, FormulaError> {
        let Some(record) = record else {
            return Ok(None);
        };
        if let Some(tree) = self.cache.read().get(&key) {
            return Ok(Some(Arc::clone(tree)));
        }
        let tree = Arc::new(parse(&record.text)?);
        self.cache.write().insert(key, Arc::clone(&tree));
        Ok(Some(tree))
    }

    fn series_tree(&self, name: &str) -> Result<Option<Arc<Node>>, FormulaError> {
        self.cached(CacheKey::Series(name.to_owned()), self.formulas.get(name))
    }

    fn group_tree(&self, name: &str) -> Result<Option<Arc<Node>>, FormulaError> {
        self.cached(CacheKey::Group(name.to_owned()), self.group_formulas.get(name))
    }

    // formula text and metadata

    /// Formula text, fully inlined when `expanded`. Remote formulas are
    /// read through the first source knowing them.
    pub fn formula(&self, name: &str, expanded: bool) -> Result<Option<String>, FormulaError> {
        if let Some(record) = self.formulas.get(name) {
            if !expanded {
                return Ok(Some(record.text.clone()));
            }
            return self.expanded_formula(name, &BTreeSet::new());
        }
        if self.store.exists(name) {
            return Ok(None);
        }
        match self.sources.find(name) {
            Some(source) => source.formula(name, expanded),
            None => Ok(None),
        }
    }

    /// Formula text with every reference inlined except names in `stop`.
    pub fn expanded_formula(
        &self,
        name: &str,
        stop: &BTreeSet<String>,
    ) -> Result<Option<String>, FormulaError> {
        let Some(tree) = self.series_tree(name)? else {
            return Ok(None);
        };
        Ok(Some(serialize(&self.expand_tree(&tree, stop)?)))
    }

    #[must_use]
    pub fn group_formula(&self, name: &str) -> Option<&str> {
        self.group_formulas
            .get(name)
            .map(|record| record.text.as_str())
    }

    /// The series a formula reads. Nested formulas are broken down when
    /// `expanded`; remote names are always replaced by their source's
    /// breakdown.
    pub fn formula_components(
        &self,
        name: &str,
        expanded: bool,
    ) -> Result<Option<Components>, FormulaError> {
        self.components(name, expanded, 0)
    }

    fn components(
        &self,
        name: &str,
        expanded: bool,
        depth: usize,
    ) -> Result<Option<Components>, FormulaError> {
        if depth > self.config.max_depth {
            return Err(ExprError::TooDeep(self.config.max_depth).into());
        }
        let Some(tree) = self.series_tree(name)? else {
            if self.store.exists(name) {
                return Ok(None);
            }
            return match self.sources.find(name) {
                Some(source) => source.formula_components(name, expanded),
                None => Ok(None),
            };
        };

        let mut parts = Vec::new();
        for reference in series_references(&tree, &self.registry) {
            let part = if self.formulas.contains_key(&reference) {
                if expanded {
                    match self.components(&reference, true, depth + 1)? {
                        Some(components) => Component::Formula(components),
                        None => Component::Series(reference),
                    }
                } else {
                    Component::Series(reference)
                }
            } else if self.store.exists(&reference) {
                Component::Series(reference)
            } else if let Some(source) = self.sources.find(&reference) {
                match source.formula_components(&reference, expanded)? {
                    Some(components) => Component::Formula(components),
                    None => Component::Series(reference),
                }
            } else {
                Component::Series(reference)
            };
            parts.push(part);
        }
        Ok(Some(Components {
            name: name.to_owned(),
            parts,
        }))
    }

    pub fn metadata(&self, name: &str) -> Result<Option<Metadata>, FormulaError> {
        if let Some(record) = self.formulas.get(name) {
            return Ok(Some(record.metadata.clone()));
        }
        if let Some(tzaware) = self.store.tzaware(name) {
            return Ok(Some(default_metadata(tzaware)));
        }
        match self.sources.find(name) {
            Some(source) => source.metadata(name),
            None => Ok(None),
        }
    }

    /// Adds user keys to a formula's metadata. Engine-derived keys are
    /// refused.
    pub fn update_metadata(&mut self, name: &str, updates: Metadata) -> Result<(), FormulaError> {
        let record = self
            .formulas
            .get_mut(name)
            .ok_or_else(|| FormulaError::NotAFormula(name.to_owned()))?;
        apply_update(&mut record.metadata, updates)
    }

    fn tzaware(&self, name: &str) -> Option<bool> {
        if let Some(record) = self.formulas.get(name) {
            return metadata::tzaware(&record.metadata);
        }
        if let Some(tzaware) = self.store.tzaware(name) {
            return Some(tzaware);
        }
        self.sources
            .find(name)
            .and_then(|source| source.metadata(name).ok().flatten())
            .and_then(|meta| metadata::tzaware(&meta))
    }

    #[must_use]
    pub fn type_of(&self, name: &str) -> Option<SeriesType> {
        if self.formulas.contains_key(name) {
            Some(SeriesType::Formula)
        } else if self.store.exists(name) {
            Some(SeriesType::Primary)
        } else {
            None
        }
    }

    /// Known locally, as primary or formula, or through a source.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.formulas.contains_key(name)
            || self.store.exists(name)
            || self.sources.find(name).is_some()
    }

    #[must_use]
    pub fn group_type(&self, name: &str) -> Option<GroupType> {
        if self.bindings.contains_key(name) {
            Some(GroupType::Bound)
        } else if self.group_formulas.contains_key(name) {
            Some(GroupType::Formula)
        } else if self.store.group_exists(name) {
            Some(GroupType::Primary)
        } else {
            None
        }
    }

    #[must_use]
    pub fn group_exists(&self, name: &str) -> bool {
        self.group_type(name).is_some()
    }

    // lifecycle

    /// Renames a series or formula and rewrites every formula referring to
    /// it. Refused before any write when `new` is already referenced.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), FormulaError> {
        let is_primary = self.store.exists(old);
        if !is_primary && !self.formulas.contains_key(old) {
            return Err(FormulaError::UnknownName(old.to_owned()));
        }
        if old == new {
            return Ok(());
        }
        if self.store.exists(new) || self.formulas.contains_key(new) {
            let error = FormulaError::NameTaken(new.to_owned());
            return Err(self.rejected(IssueKind::RenameConflict, old, error));
        }

        let mut rewrites = Vec::new();
        let mut referenced_by = Vec::new();
        for (group, records) in [(false, &self.formulas), (true, &self.group_formulas)] {
            for record in records.values() {
                let tree = parse(&record.text)?;
                let references = series_references(&tree, &self.registry);
                if references.contains(new) {
                    referenced_by.push(record.name.clone());
                }
                if references.contains(old) {
                    rewrites.push((group, record.name.clone(), tree));
                }
            }
        }
        if !referenced_by.is_empty() {
            let error = FormulaError::RenameConflict {
                new: new.to_owned(),
                referenced_by,
            };
            return Err(self.rejected(IssueKind::RenameConflict, old, error));
        }

        if is_primary {
            self.store.rename(old, new)?;
        } else if let Some(mut record) = self.formulas.remove(old) {
            record.name = new.to_owned();
            self.formulas.insert(new.to_owned(), record);
        }
        for (group, name, tree) in rewrites {
            let records = if group {
                &mut self.group_formulas
            } else {
                &mut self.formulas
            };
            if let Some(record) = records.get_mut(&name) {
                record.text = serialize(&rename_series(&tree, old, new));
            }
        }
        for binding in self.bindings.values_mut() {
            if binding.formula == old {
                new.clone_into(&mut binding.formula);
            }
            for row in &mut binding.rows {
                if row.series == old {
                    new.clone_into(&mut row.series);
                }
            }
        }

        self.invalidate();
        self.config.policy.allow(
            IssueKind::Renamed,
            old,
            format!("renamed to {new}"),
            &mut self.ledger,
        );
        #[cfg(feature = "tracing")]
        tracing::info!(old, new, "renamed");
        Ok(())
    }

    /// Deletes a formula, dropping the bindings built on it, or a primary
    /// series.
    pub fn delete(&mut self, name: &str) -> Result<(), FormulaError> {
        if self.formulas.remove(name).is_some() {
            self.bindings.retain(|_, binding| binding.formula != name);
        } else {
            self.store.delete(name)?;
        }
        self.invalidate();
        self.config
            .policy
            .allow(IssueKind::Deleted, name, "series", &mut self.ledger);
        Ok(())
    }

    pub fn delete_group(&mut self, name: &str) -> Result<(), FormulaError> {
        if self.bindings.remove(name).is_none() && self.group_formulas.remove(name).is_none() {
            self.store.group_delete(name)?;
        }
        self.invalidate();
        self.config
            .policy
            .allow(IssueKind::Deleted, name, "group", &mut self.ledger);
        Ok(())
    }

    /// Inserts raw values into a primary series. Formulas cannot be updated
    /// this way.
    pub fn update_series(
        &mut self,
        name: &str,
        series: &Series,
        idate: IDate,
        tzaware: bool,
    ) -> Result<Option<Series>, FormulaError> {
        if self.formulas.contains_key(name) {
            return Err(FormulaError::FormulaUpdate(name.to_owned()));
        }
        Ok(self.store.update(name, series, idate, tzaware)?)
    }

    pub fn update_group(&mut self, name: &str, frame: &Frame, idate: IDate) -> Result<(), FormulaError> {
        if self.group_formulas.contains_key(name) || self.bindings.contains_key(name) {
            return Err(FormulaError::FormulaUpdate(name.to_owned()));
        }
        Ok(self.store.group_update(name, frame, idate)?)
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn trace_rejection(name: &str, error: &FormulaError) {
    #[cfg(feature = "tracing")]
    tracing::warn!(name, %error, "formula rejected");
}
