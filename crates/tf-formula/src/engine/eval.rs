//! Read paths. Every evaluation mode is a [`Resolve`] strategy handed to
//! the same [`Interpreter`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::TimeDelta;
use tf_expr::{ExprError, Node, serialize};
use tf_frame::{
    Frame, History, IDate, Series, diff_history, history_as_of, staircase_from_history,
};
use tf_index::{Stamp, Window};

use super::FormulaEngine;
use crate::analysis::{fast_staircase_safe, history_leaves, series_references};
use crate::binder::{BindingRow, combinations};
use crate::interp::{Interpreter, Resolve};
use crate::metadata::Metadata;
use crate::registry::Descriptor;
use crate::source::{Components, Source};
use crate::store::SeriesStore;
use crate::{FormulaError, HistoryQuery, Query, Value};

type MemoKey = (String, Option<IDate>, Option<Stamp>, Option<Stamp>);

fn memo_key(name: &str, query: &Query) -> MemoKey {
    (
        name.to_owned(),
        query.revision_date,
        query.window.from,
        query.window.to,
    )
}

/// Reads leaves at the query's revision and evaluates nested formulas in
/// place. The memo lives as long as one public call.
struct PlainResolver<'e, S> {
    engine: &'e FormulaEngine<S>,
    memo: BTreeMap<MemoKey, Series>,
    stack: Vec<String>,
}

impl<'e, S: SeriesStore> PlainResolver<'e, S> {
    fn new(engine: &'e FormulaEngine<S>) -> Self {
        Self {
            engine,
            memo: BTreeMap::new(),
            stack: Vec::new(),
        }
    }

    fn enter(&mut self, label: String) -> Result<(), FormulaError> {
        if self.stack.contains(&label) {
            let mut cycle = self.stack.clone();
            cycle.push(label);
            return Err(ExprError::Cycle(cycle).into());
        }
        let max_depth = self.engine.config.max_depth;
        if self.stack.len() >= max_depth {
            return Err(ExprError::TooDeep(max_depth).into());
        }
        self.stack.push(label);
        Ok(())
    }

    fn nested(&mut self, label: String, tree: &Node, query: &Query) -> Result<Value, FormulaError> {
        self.enter(label)?;
        let engine = self.engine;
        let value = Interpreter::new(&engine.registry).evaluate(self, tree, query);
        self.stack.pop();
        value
    }
}

impl<S: SeriesStore> Resolve for PlainResolver<'_, S> {
    fn series(&mut self, name: &str, query: &Query) -> Result<Series, FormulaError> {
        let key = memo_key(name, query);
        if let Some(series) = self.memo.get(&key) {
            return Ok(series.clone());
        }
        let series = match self.engine.series_tree(name)? {
            Some(tree) => self
                .nested(name.to_owned(), &tree, query)?
                .into_series(name)?
                .with_name(name),
            None => self.engine.primary(name, query)?,
        };
        self.memo.insert(key, series.clone());
        Ok(series)
    }

    fn group(&mut self, name: &str, query: &Query) -> Result<Frame, FormulaError> {
        let engine = self.engine;
        if let Some(tree) = engine.group_tree(name)? {
            return self
                .nested(format!("group {name}"), &tree, query)?
                .into_table(name);
        }
        if engine.bindings.contains_key(name) {
            self.enter(format!("group {name}"))?;
            let frame = engine.bound_group(name, query, self);
            self.stack.pop();
            return frame;
        }
        engine
            .store
            .group_get(name, query.revision_date, &query.window)
            .ok_or_else(|| FormulaError::UnknownGroup(name.to_owned()))
    }
}

/// Replays precomputed histories: a leaf resolves to its version as of the
/// query's revision date.
struct HistoryResolver<'p, 'e, S> {
    histories: &'p BTreeMap<String, History>,
    autotrophic: &'p BTreeMap<String, History>,
    plain: &'p mut PlainResolver<'e, S>,
}

fn as_of(history: &History, name: &str, query: &Query) -> Series {
    query
        .revision_date
        .and_then(|idate| history_as_of(history, &idate))
        .map_or_else(|| Series::empty(name), |series| series.window(&query.window))
}

impl<S: SeriesStore> Resolve for HistoryResolver<'_, '_, S> {
    fn series(&mut self, name: &str, query: &Query) -> Result<Series, FormulaError> {
        match self.histories.get(name) {
            Some(history) => Ok(as_of(history, name, query).with_name(name)),
            None => self.plain.series(name, query),
        }
    }

    fn group(&mut self, name: &str, query: &Query) -> Result<Frame, FormulaError> {
        self.plain.group(name, query)
    }

    fn autotrophic(&mut self, call: &Node, query: &Query) -> Result<Option<Value>, FormulaError> {
        let key = serialize(call);
        Ok(self
            .autotrophic
            .get(&key)
            .map(|history| Value::Series(as_of(history, &key, query))))
    }
}

/// Leaves resolve to their own staircase.
struct StaircaseResolver<'p, 'e, S> {
    stairs: &'p BTreeMap<String, Series>,
    plain: &'p mut PlainResolver<'e, S>,
}

impl<S: SeriesStore> Resolve for StaircaseResolver<'_, '_, S> {
    fn series(&mut self, name: &str, query: &Query) -> Result<Series, FormulaError> {
        match self.stairs.get(name) {
            Some(stair) => Ok(stair.window(&query.window)),
            None => self.plain.series(name, query),
        }
    }

    fn group(&mut self, name: &str, query: &Query) -> Result<Frame, FormulaError> {
        self.plain.group(name, query)
    }
}

/// Bound series resolve to one scenario column of their group.
struct BridgeResolver<'p, 'e, S> {
    bound: BTreeMap<String, Series>,
    plain: &'p mut PlainResolver<'e, S>,
}

impl<S: SeriesStore> Resolve for BridgeResolver<'_, '_, S> {
    fn series(&mut self, name: &str, query: &Query) -> Result<Series, FormulaError> {
        match self.bound.get(name) {
            Some(column) => Ok(column.window(&query.window)),
            None => self.plain.series(name, query),
        }
    }

    fn group(&mut self, name: &str, query: &Query) -> Result<Frame, FormulaError> {
        self.plain.group(name, query)
    }
}

impl<S: SeriesStore> FormulaEngine<S> {
    /// Value of a series or formula; `None` when the name is unknown
    /// everywhere.
    pub fn get(&self, name: &str, query: &Query) -> Result<Option<Series>, FormulaError> {
        if self.formulas.contains_key(name) {
            return PlainResolver::new(self).series(name, query).map(Some);
        }
        if let Some(series) = self
            .store
            .get(name, query.revision_date, &query.window)
        {
            return Ok(Some(series));
        }
        match self.sources.find(name) {
            Some(source) => source.get(name, query),
            None => Ok(None),
        }
    }

    /// Value of a primary, group formula or bound group.
    pub fn group_get(&self, name: &str, query: &Query) -> Result<Option<Frame>, FormulaError> {
        if !self.group_exists(name) {
            return Ok(None);
        }
        PlainResolver::new(self).group(name, query).map(Some)
    }

    fn primary(&self, name: &str, query: &Query) -> Result<Series, FormulaError> {
        if let Some(series) = self
            .store
            .get(name, query.revision_date, &query.window)
        {
            return Ok(series);
        }
        if let Some(series) = match self.sources.find(name) {
            Some(source) => source.get(name, query)?,
            None => None,
        } {
            return Ok(series);
        }
        Err(FormulaError::UnknownName(name.to_owned()))
    }

    /// Evaluates the formula bound to `group` once per scenario
    /// combination.
    fn bound_group(
        &self,
        group: &str,
        query: &Query,
        plain: &mut PlainResolver<'_, S>,
    ) -> Result<Frame, FormulaError> {
        let binding = self
            .bindings
            .get(group)
            .ok_or_else(|| FormulaError::UnknownGroup(group.to_owned()))?;
        let tree = self
            .series_tree(&binding.formula)?
            .ok_or_else(|| FormulaError::NotAFormula(binding.formula.clone()))?;
        let tree = self.expand_tree(&tree, &binding.series_names())?;
        let referenced = series_references(&tree, &self.registry);
        let rows = binding
            .rows
            .iter()
            .filter(|row| referenced.contains(&row.series))
            .collect::<Vec<&BindingRow>>();

        let mut tables: BTreeMap<&str, Frame> = BTreeMap::new();
        let mut families: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in &rows {
            if !tables.contains_key(row.group.as_str()) {
                let frame = plain.group(&row.group, query)?;
                tables.insert(row.group.as_str(), frame);
            }
            if !families.contains_key(&row.family) {
                let scenarios = tables[row.group.as_str()]
                    .column_names()
                    .map(str::to_owned)
                    .collect();
                families.insert(row.family.clone(), scenarios);
            }
        }
        if families.is_empty() {
            return Err(FormulaError::NoGroupMappings(binding.formula.clone()));
        }

        let combos = combinations(&families);
        #[cfg(feature = "tracing")]
        tracing::debug!(
            group,
            families = families.len(),
            scenarios = combos.len(),
            "evaluating bound formula"
        );

        let interpreter = Interpreter::new(&self.registry);
        let mut columns = Vec::with_capacity(combos.len());
        for combo in &combos {
            let mut bound = BTreeMap::new();
            for row in &rows {
                let scenario = combo.scenario(&row.family).unwrap_or_default();
                let column = tables[row.group.as_str()].column(scenario).ok_or_else(|| {
                    FormulaError::MissingScenario {
                        group: row.group.clone(),
                        scenario: scenario.to_owned(),
                    }
                })?;
                bound.insert(row.series.clone(), column.with_name(row.series.as_str()));
            }
            let mut resolver = BridgeResolver {
                bound,
                plain: &mut *plain,
            };
            let value = interpreter.evaluate(&mut resolver, &tree, query)?;
            columns.push(value.into_series(&binding.formula)?.with_name(combo.label()));
        }
        Ok(Frame::from_series(columns)?)
    }

    /// Versions of a series or formula inserted within the query's
    /// insertion window.
    pub fn history(
        &self,
        name: &str,
        query: &HistoryQuery,
    ) -> Result<Option<History>, FormulaError> {
        if self.formulas.contains_key(name) {
            return self.formula_history(name, query).map(Some);
        }
        if let Some(history) = self.store.history(name, &query.idates, &query.window) {
            if !query.diff {
                return Ok(Some(history));
            }
            let before = self.before_first(name, &history, query)?;
            return Ok(Some(diff_history(&history, before.as_ref())));
        }
        match self.sources.find(name) {
            Some(source) => source.history(name, query),
            None => Ok(None),
        }
    }

    /// The value one instant before the first version of `history`.
    fn before_first(
        &self,
        name: &str,
        history: &History,
        query: &HistoryQuery,
    ) -> Result<Option<Series>, FormulaError> {
        let Some(first) = history.keys().next() else {
            return Ok(None);
        };
        let instant = *first - TimeDelta::microseconds(1);
        self.get(name, &query.at(instant))
    }

    fn formula_history(&self, name: &str, query: &HistoryQuery) -> Result<History, FormulaError> {
        let tree = self
            .series_tree(name)?
            .ok_or_else(|| FormulaError::NotAFormula(name.to_owned()))?;
        let tree = self.expand_tree(&tree, &BTreeSet::new())?;
        let leaves = history_leaves(&tree, &self.registry);
        // leaves are read over every value date: operators such as `naive`
        // look past the caller's window, and the resolver cuts each read to
        // the window its operator asks for
        let absolute = HistoryQuery {
            diff: false,
            window: Window::unbounded(),
            ..*query
        };

        let mut histories = BTreeMap::new();
        for leaf in &leaves.series {
            let history = self
                .history(leaf, &absolute)?
                .ok_or_else(|| FormulaError::UnknownName(leaf.clone()))?;
            histories.insert(leaf.clone(), history);
        }

        let interpreter = Interpreter::new(&self.registry);
        let mut plain = PlainResolver::new(self);
        let mut own = BTreeMap::new();
        for call in &leaves.autotrophic {
            let history = self.autotrophic_history(call, &absolute, &mut plain)?;
            own.insert(serialize(call), (*call, history));
        }

        let idates = histories
            .values()
            .chain(own.values().map(|(_, history)| history))
            .flat_map(|history| history.keys().copied())
            .collect::<BTreeSet<IDate>>();

        // a dependency with nothing at or before the earliest date starts
        // from its value as of that date
        if let Some(first) = idates.first().copied() {
            let at_first = absolute.at(first);
            for (leaf, history) in &mut histories {
                if history.range(..=first).next().is_none()
                    && let Some(series) = self.get(leaf, &at_first)?
                    && !series.is_empty()
                {
                    history.insert(first, series);
                }
            }
            for (call, history) in own.values_mut() {
                if history.range(..=first).next().is_none() {
                    let series = interpreter
                        .evaluate(&mut plain, *call, &at_first)?
                        .into_series(name)?;
                    if !series.is_empty() {
                        history.insert(first, series);
                    }
                }
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            formula = name,
            leaves = histories.len(),
            autotrophic = own.len(),
            idates = idates.len(),
            "history fan-out"
        );

        let own = own
            .into_iter()
            .map(|(key, (_, history))| (key, history))
            .collect::<BTreeMap<_, _>>();
        let mut resolver = HistoryResolver {
            histories: &histories,
            autotrophic: &own,
            plain: &mut plain,
        };
        let mut out = History::new();
        for idate in idates {
            let value = interpreter.evaluate(&mut resolver, &tree, &query.at(idate))?;
            out.insert(idate, value.into_series(name)?.with_name(name));
        }

        if query.diff {
            let before = self.before_first(name, &out, query)?;
            out = diff_history(&out, before.as_ref());
        }
        Ok(out)
    }

    fn autotrophic_history(
        &self,
        call: &Node,
        query: &HistoryQuery,
        plain: &mut PlainResolver<'_, S>,
    ) -> Result<History, FormulaError> {
        let descriptor = self.descriptor(call)?;
        let args = Interpreter::new(&self.registry).arguments(
            plain,
            call,
            &Query::latest().with_window(query.window),
        )?;
        descriptor.history(&args, query)
    }

    fn descriptor(&self, call: &Node) -> Result<&Descriptor, FormulaError> {
        let operator = call.operator().unwrap_or_default();
        self.registry
            .lookup(operator)
            .ok_or_else(|| FormulaError::UnknownOperators(vec![operator.to_owned()]))
    }

    /// Insertion dates of a series, or the union of those of a formula's
    /// dependencies.
    pub fn insertion_dates(
        &self,
        name: &str,
        idates: &Window<IDate>,
    ) -> Result<Vec<IDate>, FormulaError> {
        if let Some(tree) = self.series_tree(name)? {
            let tree = self.expand_tree(&tree, &BTreeSet::new())?;
            let leaves = history_leaves(&tree, &self.registry);
            let mut union = BTreeSet::new();
            for leaf in &leaves.series {
                union.extend(self.insertion_dates(leaf, idates)?);
            }
            let mut plain = PlainResolver::new(self);
            let interpreter = Interpreter::new(&self.registry);
            for call in &leaves.autotrophic {
                let descriptor = self.descriptor(call)?;
                let args = interpreter.arguments(&mut plain, call, &Query::latest())?;
                union.extend(descriptor.insertion_dates(&args, idates)?);
            }
            return Ok(union.into_iter().collect());
        }
        if self.store.exists(name) {
            return Ok(self.store.insertion_dates(name, idates));
        }
        match self.sources.find(name) {
            Some(source) => source.insertion_dates(name, idates),
            None => Err(FormulaError::UnknownName(name.to_owned())),
        }
    }

    /// For each value date, the latest value known `delta` before it.
    ///
    /// Formulas built only from pointwise operators combine the staircases
    /// of their leaves; anything else replays the full history.
    pub fn staircase(
        &self,
        name: &str,
        delta: TimeDelta,
        window: &Window<Stamp>,
    ) -> Result<Option<Series>, FormulaError> {
        let Some(tree) = self.series_tree(name)? else {
            let query = HistoryQuery::all().with_window(*window);
            return match self.history(name, &query)? {
                Some(history) => Ok(Some(staircase_from_history(name, &history, delta, window)?)),
                None => Ok(None),
            };
        };

        let tree = self.expand_tree(&tree, &BTreeSet::new())?;
        if self.config.fast_staircase && fast_staircase_safe(&tree, &self.registry) {
            #[cfg(feature = "tracing")]
            tracing::debug!(formula = name, "fast staircase");
            let mut stairs = BTreeMap::new();
            for leaf in series_references(&tree, &self.registry) {
                let stair = self
                    .staircase(&leaf, delta, window)?
                    .ok_or_else(|| FormulaError::UnknownName(leaf.clone()))?;
                stairs.insert(leaf, stair);
            }
            let mut plain = PlainResolver::new(self);
            let mut resolver = StaircaseResolver {
                stairs: &stairs,
                plain: &mut plain,
            };
            let value = Interpreter::new(&self.registry).evaluate(
                &mut resolver,
                &tree,
                &Query::latest().with_window(*window),
            )?;
            return Ok(Some(value.into_series(name)?.with_name(name)));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(formula = name, "slow staircase from full history");
        let history = self.formula_history(name, &HistoryQuery::all().with_window(*window))?;
        Ok(Some(staircase_from_history(name, &history, delta, window)?))
    }
}

/// An engine is itself a valid secondary source for another engine.
impl<S: SeriesStore> Source for FormulaEngine<S> {
    fn name(&self) -> &str {
        &self.config.namespace
    }

    fn exists(&self, name: &str) -> bool {
        FormulaEngine::exists(self, name)
    }

    fn get(&self, name: &str, query: &Query) -> Result<Option<Series>, FormulaError> {
        FormulaEngine::get(self, name, query)
    }

    fn history(&self, name: &str, query: &HistoryQuery) -> Result<Option<History>, FormulaError> {
        FormulaEngine::history(self, name, query)
    }

    fn insertion_dates(
        &self,
        name: &str,
        idates: &Window<IDate>,
    ) -> Result<Vec<IDate>, FormulaError> {
        FormulaEngine::insertion_dates(self, name, idates)
    }

    fn formula(&self, name: &str, expanded: bool) -> Result<Option<String>, FormulaError> {
        FormulaEngine::formula(self, name, expanded)
    }

    fn formula_components(
        &self,
        name: &str,
        expanded: bool,
    ) -> Result<Option<Components>, FormulaError> {
        FormulaEngine::formula_components(self, name, expanded)
    }

    fn metadata(&self, name: &str) -> Result<Option<Metadata>, FormulaError> {
        FormulaEngine::metadata(self, name)
    }
}
