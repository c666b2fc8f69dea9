//! The versioned series store the formula layer reads primary data from.

use std::collections::BTreeMap;

use tf_frame::{Frame, FrameError, History, IDate, Series, diff_series, history_as_of};
use tf_index::{Stamp, Window};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("unknown series `{0}`")]
    UnknownSeries(String),
    #[error("unknown group `{0}`")]
    UnknownGroup(String),
    #[error("`{0}` already exists in the store")]
    NameTaken(String),
    #[error("insertion date {idate} of `{name}` is not after its latest revision")]
    StaleInsertion { name: String, idate: IDate },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Primary (stored) series and groups.
///
/// Implementations are expected to apply each mutating call atomically.
pub trait SeriesStore: Send + Sync {
    fn exists(&self, name: &str) -> bool;

    /// Timezone awareness recorded at the first insertion.
    fn tzaware(&self, name: &str) -> Option<bool>;

    /// The version visible at `revision_date` (latest when `None`), cut to
    /// `window`. `None` only when the series is unknown.
    fn get(&self, name: &str, revision_date: Option<IDate>, window: &Window<Stamp>)
    -> Option<Series>;

    /// Full versions inserted within `idates`, each cut to `window`.
    fn history(
        &self,
        name: &str,
        idates: &Window<IDate>,
        window: &Window<Stamp>,
    ) -> Option<History>;

    fn insertion_dates(&self, name: &str, idates: &Window<IDate>) -> Vec<IDate>;

    /// Stores a new version; returns the effective diff, or `None` when the
    /// update changes nothing.
    fn update(
        &mut self,
        name: &str,
        series: &Series,
        idate: IDate,
        tzaware: bool,
    ) -> Result<Option<Series>, StoreError>;

    fn rename(&mut self, old: &str, new: &str) -> Result<(), StoreError>;

    fn delete(&mut self, name: &str) -> Result<(), StoreError>;

    fn group_exists(&self, name: &str) -> bool;

    fn group_get(
        &self,
        name: &str,
        revision_date: Option<IDate>,
        window: &Window<Stamp>,
    ) -> Option<Frame>;

    fn group_update(&mut self, name: &str, frame: &Frame, idate: IDate) -> Result<(), StoreError>;

    fn group_delete(&mut self, name: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct StoredSeries {
    tzaware: bool,
    versions: History,
}

/// Append-only in-memory store keeping one full snapshot per revision.
///
/// A missing value in an update erases the point; an update that changes
/// nothing creates no revision.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    series: BTreeMap<String, StoredSeries>,
    groups: BTreeMap<String, BTreeMap<IDate, Frame>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeriesStore for MemoryStore {
    fn exists(&self, name: &str) -> bool {
        self.series.contains_key(name)
    }

    fn tzaware(&self, name: &str) -> Option<bool> {
        self.series.get(name).map(|stored| stored.tzaware)
    }

    fn get(
        &self,
        name: &str,
        revision_date: Option<IDate>,
        window: &Window<Stamp>,
    ) -> Option<Series> {
        let stored = self.series.get(name)?;
        let version = match revision_date {
            Some(idate) => history_as_of(&stored.versions, &idate),
            None => stored.versions.values().next_back(),
        };
        Some(version.map_or_else(|| Series::empty(name), |series| series.window(window)))
    }

    fn history(
        &self,
        name: &str,
        idates: &Window<IDate>,
        window: &Window<Stamp>,
    ) -> Option<History> {
        let stored = self.series.get(name)?;
        Some(
            stored
                .versions
                .iter()
                .filter(|(idate, _)| idates.contains(idate))
                .map(|(idate, series)| (*idate, series.window(window)))
                .collect(),
        )
    }

    fn insertion_dates(&self, name: &str, idates: &Window<IDate>) -> Vec<IDate> {
        self.series.get(name).map_or_else(Vec::new, |stored| {
            stored
                .versions
                .keys()
                .filter(|idate| idates.contains(idate))
                .copied()
                .collect()
        })
    }

    fn update(
        &mut self,
        name: &str,
        series: &Series,
        idate: IDate,
        tzaware: bool,
    ) -> Result<Option<Series>, StoreError> {
        let current = self
            .series
            .get(name)
            .and_then(|stored| stored.versions.values().next_back());
        if let Some(last) = self
            .series
            .get(name)
            .and_then(|stored| stored.versions.keys().next_back())
            && idate <= *last
        {
            return Err(StoreError::StaleInsertion {
                name: name.to_owned(),
                idate,
            });
        }

        let diff = match current {
            Some(_) => diff_series(current, series),
            None => series.dropna(),
        }
        .with_name(name);
        if diff.is_empty() {
            return Ok(None);
        }

        let mut points = current
            .map(|series| series.iter().collect::<BTreeMap<_, _>>())
            .unwrap_or_default();
        for (stamp, value) in diff.iter() {
            if value.is_nan() {
                points.remove(&stamp);
            } else {
                points.insert(stamp, value);
            }
        }
        let snapshot = Series::from_pairs(name, points)?;

        self.series
            .entry(name.to_owned())
            .or_insert_with(|| StoredSeries {
                tzaware,
                versions: History::new(),
            })
            .versions
            .insert(idate, snapshot);
        Ok(Some(diff))
    }

    fn rename(&mut self, old: &str, new: &str) -> Result<(), StoreError> {
        if self.series.contains_key(new) {
            return Err(StoreError::NameTaken(new.to_owned()));
        }
        let stored = self
            .series
            .remove(old)
            .ok_or_else(|| StoreError::UnknownSeries(old.to_owned()))?;
        let versions = stored
            .versions
            .into_iter()
            .map(|(idate, series)| (idate, series.with_name(new)))
            .collect();
        self.series.insert(
            new.to_owned(),
            StoredSeries {
                tzaware: stored.tzaware,
                versions,
            },
        );
        Ok(())
    }

    fn delete(&mut self, name: &str) -> Result<(), StoreError> {
        self.series
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::UnknownSeries(name.to_owned()))
    }

    fn group_exists(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    fn group_get(
        &self,
        name: &str,
        revision_date: Option<IDate>,
        window: &Window<Stamp>,
    ) -> Option<Frame> {
        let versions = self.groups.get(name)?;
        let version = match revision_date {
            Some(idate) => versions.range(..=idate).next_back().map(|(_, frame)| frame),
            None => versions.values().next_back(),
        };
        Some(version.map_or_else(Frame::empty, |frame| frame.window(window)))
    }

    fn group_update(&mut self, name: &str, frame: &Frame, idate: IDate) -> Result<(), StoreError> {
        let versions = self.groups.entry(name.to_owned()).or_default();
        if versions.keys().next_back().is_some_and(|last| idate <= *last) {
            return Err(StoreError::StaleInsertion {
                name: name.to_owned(),
                idate,
            });
        }
        versions.insert(idate, frame.clone());
        Ok(())
    }

    fn group_delete(&mut self, name: &str) -> Result<(), StoreError> {
        self.groups
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::UnknownGroup(name.to_owned()))
    }
}
