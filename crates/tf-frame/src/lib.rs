#![forbid(unsafe_code)]

pub mod combine;
pub mod history;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tf_index::{
    IndexError, Stamp, TimeIndex, Window, align_union, positions_in, validate_alignment_plan,
};
use thiserror::Error;

pub use combine::{add_series, priority_series, row_max, row_mean, row_min};
pub use history::{History, IDate, diff_history, diff_series, history_as_of, staircase_from_history};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("index length ({index_len}) does not match value length ({value_len})")]
    LengthMismatch { index_len: usize, value_len: usize },
    #[error("duplicate column `{0}`")]
    DuplicateColumn(String),
    #[error("tables have mismatched columns: {left:?} vs {right:?}")]
    ColumnMismatch {
        left: Vec<String>,
        right: Vec<String>,
    },
    #[error("invalid fill policy `{0}`")]
    InvalidFill(String),
    #[error("`{0}` needs at least one input")]
    EmptyInput(&'static str),
    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithmeticOp {
    #[must_use]
    pub fn apply(self, lhs: f64, rhs: f64) -> f64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
            Self::Div => lhs / rhs,
        }
    }

    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "value", rename_all = "snake_case")]
pub enum FillMethod {
    Forward,
    Backward,
    Value(f64),
}

/// Ordered fill methods, applied left to right (`"ffill,bfill"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FillPolicy {
    methods: Vec<FillMethod>,
}

impl FillPolicy {
    #[must_use]
    pub fn new(methods: Vec<FillMethod>) -> Self {
        Self { methods }
    }

    #[must_use]
    pub fn value(value: f64) -> Self {
        Self::new(vec![FillMethod::Value(value)])
    }

    #[must_use]
    pub fn methods(&self) -> &[FillMethod] {
        &self.methods
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl FromStr for FillPolicy {
    type Err = FrameError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let methods = text
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part {
                "ffill" | "pad" => Ok(FillMethod::Forward),
                "bfill" | "backfill" => Ok(FillMethod::Backward),
                other => other
                    .parse::<f64>()
                    .map(FillMethod::Value)
                    .map_err(|_| FrameError::InvalidFill(text.to_owned())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if methods.is_empty() {
            return Err(FrameError::InvalidFill(text.to_owned()));
        }
        Ok(Self { methods })
    }
}

/// Per-reference options carried from a `series` leaf to the combinator
/// that consumes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesOptions {
    pub fill: Option<FillPolicy>,
    pub prune: Option<usize>,
    /// Weight of the series in a weighted row mean.
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    name: String,
    index: TimeIndex,
    values: Vec<f64>,
    #[serde(default)]
    options: SeriesOptions,
}

impl Series {
    pub fn new(
        name: impl Into<String>,
        index: TimeIndex,
        values: Vec<f64>,
    ) -> Result<Self, FrameError> {
        if index.len() != values.len() {
            return Err(FrameError::LengthMismatch {
                index_len: index.len(),
                value_len: values.len(),
            });
        }

        Ok(Self {
            name: name.into(),
            index,
            values,
            options: SeriesOptions::default(),
        })
    }

    /// Builds from `(stamp, value)` pairs; stamps must be strictly increasing.
    pub fn from_pairs(
        name: impl Into<String>,
        pairs: impl IntoIterator<Item = (Stamp, f64)>,
    ) -> Result<Self, FrameError> {
        let (stamps, values): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
        Self::new(name, TimeIndex::new(stamps)?, values)
    }

    #[must_use]
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: TimeIndex::empty(),
            values: Vec::new(),
            options: SeriesOptions::default(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn index(&self) -> &TimeIndex {
        &self.index
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn options(&self) -> &SeriesOptions {
        &self.options
    }

    #[must_use]
    pub fn with_options(mut self, options: SeriesOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stamp, f64)> + '_ {
        self.index
            .stamps()
            .iter()
            .copied()
            .zip(self.values.iter().copied())
    }

    #[must_use]
    pub fn value_at(&self, stamp: &Stamp) -> Option<f64> {
        self.index.position(stamp).map(|pos| self.values[pos])
    }

    #[must_use]
    pub fn window(&self, window: &Window<Stamp>) -> Self {
        if window.is_unbounded() {
            return self.clone();
        }
        let range = self.index.window_range(window);
        Self {
            name: self.name.clone(),
            index: self.index.slice(range.clone()),
            values: self.values[range].to_vec(),
            options: self.options.clone(),
        }
    }

    /// Values at each stamp of `target`, missing where `self` has none.
    #[must_use]
    pub fn reindex(&self, target: &TimeIndex) -> Self {
        let values = positions_in(&self.index, target)
            .into_iter()
            .map(|slot| slot.map_or(f64::NAN, |pos| self.values[pos]))
            .collect();
        Self {
            name: self.name.clone(),
            index: target.clone(),
            values,
            options: self.options.clone(),
        }
    }

    #[must_use]
    pub fn fill(&self, policy: &FillPolicy) -> Self {
        let mut values = self.values.clone();
        for method in policy.methods() {
            fill_values(&mut values, *method);
        }
        Self {
            values,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn dropna(&self) -> Self {
        let (stamps, values): (Vec<_>, Vec<_>) =
            self.iter().filter(|(_, value)| !value.is_nan()).unzip();
        Self {
            name: self.name.clone(),
            index: TimeIndex::from_unsorted(stamps),
            values,
            options: self.options.clone(),
        }
    }

    /// Drops the last `count` points.
    #[must_use]
    pub fn prune_last(&self, count: usize) -> Self {
        let keep = self.len().saturating_sub(count);
        Self {
            name: self.name.clone(),
            index: self.index.slice(0..keep),
            values: self.values[..keep].to_vec(),
            options: self.options.clone(),
        }
    }

    #[must_use]
    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            values: self.values.iter().map(|value| f(*value)).collect(),
            ..self.clone()
        }
    }

    /// `self op scalar`, or `scalar op self` when `scalar_first`.
    #[must_use]
    pub fn scalar_op(&self, op: ArithmeticOp, scalar: f64, scalar_first: bool) -> Self {
        self.map_values(|value| {
            if scalar_first {
                op.apply(scalar, value)
            } else {
                op.apply(value, scalar)
            }
        })
    }

    pub fn binary_op(&self, other: &Self, op: ArithmeticOp) -> Result<Self, FrameError> {
        let plan = align_union(&self.index, &other.index);
        validate_alignment_plan(&plan)?;

        let values = plan
            .left_positions
            .iter()
            .zip(&plan.right_positions)
            .map(|(left, right)| match (left, right) {
                (Some(l), Some(r)) => op.apply(self.values[*l], other.values[*r]),
                _ => f64::NAN,
            })
            .collect();

        let name = if self.name == other.name {
            self.name.clone()
        } else {
            format!("{}{}{}", self.name, op.symbol(), other.name)
        };

        Self::new(name, plan.union_index, values)
    }

    /// Running sum skipping missing points.
    #[must_use]
    pub fn cumsum(&self) -> Self {
        let mut total = 0.0;
        let values = self
            .values
            .iter()
            .map(|value| {
                if value.is_nan() {
                    f64::NAN
                } else {
                    total += value;
                    total
                }
            })
            .collect();
        Self {
            values,
            ..self.clone()
        }
    }

    /// Index and values equal, NaN matching NaN. Names and options are ignored.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| (a.is_nan() && b.is_nan()) || a == b)
    }
}

fn fill_values(values: &mut [f64], method: FillMethod) {
    match method {
        FillMethod::Forward => {
            let mut last = None;
            for value in values.iter_mut() {
                if value.is_nan() {
                    if let Some(previous) = last {
                        *value = previous;
                    }
                } else {
                    last = Some(*value);
                }
            }
        }
        FillMethod::Backward => {
            let mut next = None;
            for value in values.iter_mut().rev() {
                if value.is_nan() {
                    if let Some(following) = next {
                        *value = following;
                    }
                } else {
                    next = Some(*value);
                }
            }
        }
        FillMethod::Value(fill) => {
            for value in values.iter_mut().filter(|value| value.is_nan()) {
                *value = fill;
            }
        }
    }
}

/// A table of named columns sharing one time index, used for group
/// (scenario) values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    index: TimeIndex,
    columns: Vec<(String, Vec<f64>)>,
}

impl Frame {
    pub fn new(index: TimeIndex, columns: Vec<(String, Vec<f64>)>) -> Result<Self, FrameError> {
        for (position, (name, values)) in columns.iter().enumerate() {
            if values.len() != index.len() {
                return Err(FrameError::LengthMismatch {
                    index_len: index.len(),
                    value_len: values.len(),
                });
            }
            if columns[..position].iter().any(|(other, _)| other == name) {
                return Err(FrameError::DuplicateColumn(name.clone()));
            }
        }

        Ok(Self { index, columns })
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            index: TimeIndex::empty(),
            columns: Vec::new(),
        }
    }

    /// Outer-joins the series on their indexes, one column per series.
    pub fn from_series(series_list: Vec<Series>) -> Result<Self, FrameError> {
        let union = tf_index::union_all(series_list.iter().map(Series::index));
        let columns = series_list
            .into_iter()
            .map(|series| {
                let aligned = series.reindex(&union);
                (series.name, aligned.values)
            })
            .collect();
        Self::new(union, columns)
    }

    #[must_use]
    pub fn index(&self) -> &TimeIndex {
        &self.index
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<Series> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(column, values)| Series {
                name: column.clone(),
                index: self.index.clone(),
                values: values.clone(),
                options: SeriesOptions::default(),
            })
    }

    pub fn series(&self) -> impl Iterator<Item = Series> + '_ {
        self.columns.iter().map(|(name, values)| Series {
            name: name.clone(),
            index: self.index.clone(),
            values: values.clone(),
            options: SeriesOptions::default(),
        })
    }

    #[must_use]
    pub fn window(&self, window: &Window<Stamp>) -> Self {
        let range = self.index.window_range(window);
        Self {
            index: self.index.slice(range.clone()),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), values[range.clone()].to_vec()))
                .collect(),
        }
    }

    /// Drops every row holding at least one missing value.
    #[must_use]
    pub fn dropna_rows(&self) -> Self {
        let keep: Vec<usize> = (0..self.len())
            .filter(|row| self.columns.iter().all(|(_, values)| !values[*row].is_nan()))
            .collect();
        let stamps = keep.iter().map(|row| self.index.stamps()[*row]).collect();
        Self {
            index: TimeIndex::from_unsorted(stamps),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| (name.clone(), keep.iter().map(|row| values[*row]).collect()))
                .collect(),
        }
    }

    /// Folds each row into one value; `reduce` sees the row's values in
    /// column order.
    pub fn reduce_rows(&self, name: &str, reduce: impl Fn(&[f64]) -> f64) -> Series {
        let mut row = Vec::with_capacity(self.width());
        let values = (0..self.len())
            .map(|position| {
                row.clear();
                row.extend(self.columns.iter().map(|(_, values)| values[position]));
                reduce(&row)
            })
            .collect();
        Series {
            name: name.to_owned(),
            index: self.index.clone(),
            values,
            options: SeriesOptions::default(),
        }
    }

    #[must_use]
    pub fn scalar_op(&self, op: ArithmeticOp, scalar: f64, scalar_first: bool) -> Self {
        Self {
            index: self.index.clone(),
            columns: self
                .columns
                .iter()
                .map(|(name, values)| {
                    let out = values
                        .iter()
                        .map(|value| {
                            if scalar_first {
                                op.apply(scalar, *value)
                            } else {
                                op.apply(*value, scalar)
                            }
                        })
                        .collect();
                    (name.clone(), out)
                })
                .collect(),
        }
    }

    /// Applies `op` between every column and `series`, aligned on the union
    /// of both indexes.
    pub fn series_op(
        &self,
        series: &Series,
        op: ArithmeticOp,
        series_first: bool,
    ) -> Result<Self, FrameError> {
        let columns = self
            .series()
            .map(|column| {
                let out = if series_first {
                    series.binary_op(&column, op)?
                } else {
                    column.binary_op(series, op)?
                };
                Ok(out.with_name(column.name))
            })
            .collect::<Result<Vec<_>, FrameError>>()?;
        if columns.is_empty() {
            return Ok(self.clone());
        }
        Self::from_series(columns)
    }

    /// Column-wise `op` between two tables holding the same column names.
    pub fn frame_op(&self, other: &Self, op: ArithmeticOp) -> Result<Self, FrameError> {
        let mut left_names: Vec<String> = self.column_names().map(str::to_owned).collect();
        let mut right_names: Vec<String> = other.column_names().map(str::to_owned).collect();
        left_names.sort();
        right_names.sort();
        if left_names != right_names {
            return Err(FrameError::ColumnMismatch {
                left: left_names,
                right: right_names,
            });
        }

        let columns = self
            .series()
            .map(|column| {
                let peer = other
                    .column(column.name())
                    .ok_or_else(|| FrameError::ColumnMismatch {
                        left: left_names.clone(),
                        right: right_names.clone(),
                    })?;
                Ok(column.binary_op(&peer, op)?.with_name(column.name))
            })
            .collect::<Result<Vec<_>, FrameError>>()?;
        Self::from_series(columns)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stamp")?;
        for name in self.column_names() {
            write!(f, "\t{name}")?;
        }
        writeln!(f)?;
        for (row, stamp) in self.index.stamps().iter().enumerate() {
            write!(f, "{stamp}")?;
            for (_, values) in &self.columns {
                write!(f, "\t{}", values[row])?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
