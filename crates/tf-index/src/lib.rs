#![forbid(unsafe_code)]

use std::ops::Range;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A value date. Timezone-aware series keep their stamps in UTC; whether a
/// series is aware lives in its metadata, not in the index.
pub type Stamp = NaiveDateTime;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("index stamps must be strictly increasing (offending position {position})")]
    Unsorted { position: usize },
    #[error("alignment vectors must have equal lengths")]
    InvalidAlignmentVectors,
    #[error("cannot parse `{0}` as a timestamp")]
    InvalidStamp(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeIndex {
    stamps: Vec<Stamp>,
}

impl TimeIndex {
    pub fn new(stamps: Vec<Stamp>) -> Result<Self, IndexError> {
        if let Some(position) = stamps.windows(2).position(|pair| pair[0] >= pair[1]) {
            return Err(IndexError::Unsorted {
                position: position + 1,
            });
        }
        Ok(Self { stamps })
    }

    /// Sorts and deduplicates, keeping the first occurrence.
    #[must_use]
    pub fn from_unsorted(mut stamps: Vec<Stamp>) -> Self {
        stamps.sort_unstable();
        stamps.dedup();
        Self { stamps }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self { stamps: Vec::new() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stamps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stamps.is_empty()
    }

    #[must_use]
    pub fn stamps(&self) -> &[Stamp] {
        &self.stamps
    }

    #[must_use]
    pub fn first(&self) -> Option<Stamp> {
        self.stamps.first().copied()
    }

    #[must_use]
    pub fn last(&self) -> Option<Stamp> {
        self.stamps.last().copied()
    }

    #[must_use]
    pub fn position(&self, needle: &Stamp) -> Option<usize> {
        self.stamps.binary_search(needle).ok()
    }

    /// Positions of the stamps falling inside `window` (bounds inclusive).
    #[must_use]
    pub fn window_range(&self, window: &Window<Stamp>) -> Range<usize> {
        let start = match window.from {
            Some(from) => self.stamps.partition_point(|stamp| *stamp < from),
            None => 0,
        };
        let end = match window.to {
            Some(to) => self.stamps.partition_point(|stamp| *stamp <= to),
            None => self.stamps.len(),
        };
        start..end.max(start)
    }

    #[must_use]
    pub fn slice(&self, range: Range<usize>) -> Self {
        Self {
            stamps: self.stamps[range].to_vec(),
        }
    }
}

/// Inclusive, optionally open-ended bounds over an ordered domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window<T> {
    pub from: Option<T>,
    pub to: Option<T>,
}

impl<T> Default for Window<T> {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
        }
    }
}

impl<T: Ord + Copy> Window<T> {
    #[must_use]
    pub fn new(from: Option<T>, to: Option<T>) -> Self {
        Self { from, to }
    }

    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.from.is_none_or(|from| *value >= from) && self.to.is_none_or(|to| *value <= to)
    }

    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.to.is_none()
    }

    /// Narrows `self` by `other`: the latest lower bound and the earliest
    /// upper bound win.
    #[must_use]
    pub fn intersect(&self, other: &Self) -> Self {
        let from = match (self.from, other.from) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let to = match (self.to, other.to) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self { from, to }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentPlan {
    pub union_index: TimeIndex,
    pub left_positions: Vec<Option<usize>>,
    pub right_positions: Vec<Option<usize>>,
}

/// Sorted merge of two indexes. Both inputs are sorted, so the union is
/// produced in a single pass without hashing.
#[must_use]
pub fn align_union(left: &TimeIndex, right: &TimeIndex) -> AlignmentPlan {
    let capacity = left.len() + right.len();
    let mut union_stamps = Vec::with_capacity(capacity);
    let mut left_positions = Vec::with_capacity(capacity);
    let mut right_positions = Vec::with_capacity(capacity);

    let (mut i, mut j) = (0, 0);
    while i < left.len() || j < right.len() {
        match (left.stamps.get(i), right.stamps.get(j)) {
            (Some(l), Some(r)) if l == r => {
                union_stamps.push(*l);
                left_positions.push(Some(i));
                right_positions.push(Some(j));
                i += 1;
                j += 1;
            }
            (Some(l), Some(r)) if l < r => {
                union_stamps.push(*l);
                left_positions.push(Some(i));
                right_positions.push(None);
                i += 1;
            }
            (Some(_), Some(r)) | (None, Some(r)) => {
                union_stamps.push(*r);
                left_positions.push(None);
                right_positions.push(Some(j));
                j += 1;
            }
            (Some(l), None) => {
                union_stamps.push(*l);
                left_positions.push(Some(i));
                right_positions.push(None);
                i += 1;
            }
            (None, None) => break,
        }
    }

    AlignmentPlan {
        union_index: TimeIndex {
            stamps: union_stamps,
        },
        left_positions,
        right_positions,
    }
}

pub fn validate_alignment_plan(plan: &AlignmentPlan) -> Result<(), IndexError> {
    if plan.left_positions.len() != plan.right_positions.len()
        || plan.left_positions.len() != plan.union_index.len()
    {
        return Err(IndexError::InvalidAlignmentVectors);
    }

    Ok(())
}

/// Union of any number of indexes.
#[must_use]
pub fn union_all<'a>(indexes: impl IntoIterator<Item = &'a TimeIndex>) -> TimeIndex {
    let stamps = indexes
        .into_iter()
        .flat_map(|index| index.stamps.iter().copied())
        .collect();
    TimeIndex::from_unsorted(stamps)
}

/// Positions of each stamp of `target` inside `source`.
#[must_use]
pub fn positions_in(source: &TimeIndex, target: &TimeIndex) -> Vec<Option<usize>> {
    target
        .stamps
        .iter()
        .map(|stamp| source.position(stamp))
        .collect()
}

/// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM[:SS]` and the `T`-separated forms.
pub fn parse_stamp(text: &str) -> Result<Stamp, IndexError> {
    let trimmed = text.trim();
    const FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    for format in FORMATS {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(stamp);
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| IndexError::InvalidStamp(text.to_owned()))
}
