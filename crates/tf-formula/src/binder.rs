//! Formula bindings and scenario combinations.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::FormulaError;

/// Wherever the formula reads `series`, read the group `group` instead,
/// as one axis of the scenario family `family`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRow {
    pub series: String,
    pub group: String,
    pub family: String,
}

impl BindingRow {
    #[must_use]
    pub fn new(series: &str, group: &str, family: &str) -> Self {
        Self {
            series: series.to_owned(),
            group: group.to_owned(),
            family: family.to_owned(),
        }
    }
}

/// The binding table of one formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub formula: String,
    pub rows: Vec<BindingRow>,
}

impl Binding {
    /// Validates `rows`: the table is non-empty, no field is empty and each
    /// series is bound exactly once.
    pub fn new(formula: &str, rows: Vec<BindingRow>) -> Result<Self, FormulaError> {
        if rows.is_empty() {
            return Err(FormulaError::MalformedBinding(format!(
                "binding of `{formula}` has no rows"
            )));
        }
        let mut seen = BTreeSet::new();
        for row in &rows {
            if row.series.is_empty() || row.group.is_empty() || row.family.is_empty() {
                return Err(FormulaError::MalformedBinding(format!(
                    "binding of `{formula}` has an empty field in {row:?}"
                )));
            }
            if !seen.insert(row.series.as_str()) {
                return Err(FormulaError::MalformedBinding(format!(
                    "series `{}` is bound more than once",
                    row.series
                )));
            }
        }
        Ok(Self {
            formula: formula.to_owned(),
            rows,
        })
    }

    /// Builds a binding from loosely typed records, each of which must hold
    /// exactly the string fields `series`, `group` and `family`.
    pub fn from_records(formula: &str, records: &[Json]) -> Result<Self, FormulaError> {
        let rows = records
            .iter()
            .map(|record| {
                let object = record.as_object().ok_or_else(|| {
                    FormulaError::MalformedBinding(format!("row {record} is not a record"))
                })?;
                let mut columns = object.keys().map(String::as_str).collect::<Vec<_>>();
                columns.sort_unstable();
                if columns != ["family", "group", "series"] {
                    return Err(FormulaError::MalformedBinding(format!(
                        "expected columns family, group, series; got {}",
                        columns.join(", ")
                    )));
                }
                let field = |key: &str| {
                    object.get(key).and_then(Json::as_str).ok_or_else(|| {
                        FormulaError::MalformedBinding(format!("column `{key}` must hold strings"))
                    })
                };
                Ok(BindingRow::new(field("series")?, field("group")?, field("family")?))
            })
            .collect::<Result<Vec<_>, FormulaError>>()?;
        Self::new(formula, rows)
    }

    #[must_use]
    pub fn series_names(&self) -> BTreeSet<String> {
        self.rows.iter().map(|row| row.series.clone()).collect()
    }
}

/// One scenario per family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combination {
    pub picks: Vec<(String, String)>,
}

impl Combination {
    #[must_use]
    pub fn scenario(&self, family: &str) -> Option<&str> {
        self.picks
            .iter()
            .find(|(name, _)| name == family)
            .map(|(_, scenario)| scenario.as_str())
    }

    /// Column label: scenario names joined by `-`, in family order.
    #[must_use]
    pub fn label(&self) -> String {
        self.picks
            .iter()
            .map(|(_, scenario)| scenario.as_str())
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// Cartesian product of the scenarios of every family. A family with no
/// scenario yields no combination at all.
#[must_use]
pub fn combinations(families: &BTreeMap<String, Vec<String>>) -> Vec<Combination> {
    let mut out = vec![Combination { picks: Vec::new() }];
    for (family, scenarios) in families {
        out = out
            .iter()
            .flat_map(|partial| {
                scenarios.iter().map(move |scenario| {
                    let mut picks = partial.picks.clone();
                    picks.push((family.clone(), scenario.clone()));
                    Combination { picks }
                })
            })
            .collect();
    }
    out
}
