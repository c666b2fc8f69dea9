//! Insertion-date keyed versions of a series.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use tf_index::{Stamp, Window};

use crate::{FrameError, Series, SeriesOptions};

/// An insertion (revision) date.
pub type IDate = DateTime<Utc>;

/// Every known version of a series, keyed by the date it was inserted.
pub type History = BTreeMap<IDate, Series>;

/// The version visible at `idate`: the latest one inserted at or before it.
#[must_use]
pub fn history_as_of<'a>(history: &'a History, idate: &IDate) -> Option<&'a Series> {
    history.range(..=*idate).next_back().map(|(_, series)| series)
}

/// Points of `next` that are new or changed relative to `base`.
///
/// A missing value in `next` where `base` had one is kept: it records an
/// erasure.
#[must_use]
pub fn diff_series(base: Option<&Series>, next: &Series) -> Series {
    let Some(base) = base else {
        return next.clone();
    };
    let (stamps, values): (Vec<_>, Vec<_>) = next
        .iter()
        .filter(|(stamp, value)| match base.value_at(stamp) {
            None => !value.is_nan(),
            Some(old) if old.is_nan() => !value.is_nan(),
            Some(old) => value.is_nan() || old != *value,
        })
        .unzip();
    // a filtered sorted index stays sorted and aligned with its values
    Series {
        name: next.name.clone(),
        index: tf_index::TimeIndex::from_unsorted(stamps),
        values,
        options: SeriesOptions::default(),
    }
}

/// Turns each version into its delta against the previous one. The first
/// version is compared to `before`, typically the state one instant before
/// the first insertion date.
#[must_use]
pub fn diff_history(history: &History, before: Option<&Series>) -> History {
    let mut previous = before;
    let mut out = History::new();
    for (idate, series) in history {
        out.insert(*idate, diff_series(previous, series));
        previous = Some(series);
    }
    out
}

/// Rebuilds a staircase from a full history.
///
/// The version inserted at `idate` contributes its points whose value date
/// falls in `[idate + delta, next_idate + delta)`; the last version has no
/// upper bound.
pub fn staircase_from_history(
    name: &str,
    history: &History,
    delta: TimeDelta,
    window: &Window<Stamp>,
) -> Result<Series, FrameError> {
    let idates = history.keys().copied().collect::<Vec<_>>();
    let mut points = BTreeMap::new();
    for (position, (idate, series)) in history.iter().enumerate() {
        let lower = idate.naive_utc() + delta;
        let upper = idates
            .get(position + 1)
            .map(|next| next.naive_utc() + delta);
        for (stamp, value) in series.iter() {
            if stamp < lower || upper.is_some_and(|upper| stamp >= upper) {
                continue;
            }
            if value.is_nan() || !window.contains(&stamp) {
                continue;
            }
            points.insert(stamp, value);
        }
    }
    Series::from_pairs(name, points)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone, Utc};
    use tf_index::{Window, parse_stamp};

    use super::{History, diff_history, history_as_of, staircase_from_history};
    use crate::Series;

    fn day(d: u32) -> tf_index::Stamp {
        parse_stamp(&format!("2024-01-{d:02}")).expect("stamp")
    }

    fn idate(d: u32) -> super::IDate {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0)
            .single()
            .expect("idate")
    }

    fn series(points: &[(u32, f64)]) -> Series {
        Series::from_pairs("s", points.iter().map(|(d, v)| (day(*d), *v))).expect("series")
    }

    #[test]
    fn as_of_picks_nearest_prior_version() {
        let mut history = History::new();
        history.insert(idate(1), series(&[(1, 1.0)]));
        history.insert(idate(3), series(&[(1, 3.0)]));

        assert!(history_as_of(&history, &idate(1)).is_some());
        assert_eq!(
            history_as_of(&history, &idate(2)).expect("v1").values(),
            &[1.0]
        );
        assert_eq!(
            history_as_of(&history, &idate(5)).expect("v3").values(),
            &[3.0]
        );
        assert!(history_as_of(&history, &day_before()).is_none());
    }

    fn day_before() -> super::IDate {
        Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0)
            .single()
            .expect("idate")
    }

    #[test]
    fn diff_history_keeps_only_changes() {
        let mut history = History::new();
        history.insert(idate(1), series(&[(1, 1.0), (2, 2.0)]));
        history.insert(idate(2), series(&[(1, 1.0), (2, 5.0), (3, 3.0)]));

        let diffs = diff_history(&history, None);
        assert_eq!(diffs[&idate(1)].len(), 2);
        assert_eq!(diffs[&idate(2)].index().stamps(), &[day(2), day(3)]);
        assert_eq!(diffs[&idate(2)].values(), &[5.0, 3.0]);
    }

    #[test]
    fn erasures_survive_the_diff() {
        let base = series(&[(1, 1.0), (2, 2.0), (3, 3.0)]);
        let next = series(&[(1, 1.0), (2, f64::NAN), (3, 4.0)]);
        let diff = super::diff_series(Some(&base), &next);
        assert_eq!(diff.index().stamps(), &[day(2), day(3)]);
        assert!(diff.values()[0].is_nan());
        assert_eq!(diff.values()[1], 4.0);
        assert_eq!(diff.name(), "s");
    }

    #[test]
    fn staircase_takes_each_version_over_its_delta_slice() {
        let mut history = History::new();
        history.insert(idate(1), series(&[(1, 10.0), (2, 10.0), (3, 10.0), (4, 10.0)]));
        history.insert(idate(3), series(&[(3, 30.0), (4, 30.0), (5, 30.0)]));

        let out = staircase_from_history("s", &history, TimeDelta::days(1), &Window::unbounded())
            .expect("staircase");
        assert_eq!(out.index().stamps(), &[day(2), day(3), day(4), day(5)]);
        assert_eq!(out.values(), &[10.0, 10.0, 30.0, 30.0]);
    }
}
