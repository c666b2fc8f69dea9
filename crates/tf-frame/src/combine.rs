//! Row-wise combinators over several series.
//!
//! Every combinator aligns its inputs on the union of their indexes before
//! folding rows, so inputs never need to share stamps.

use tf_index::union_all;

use crate::{Frame, FrameError, Series};

fn aligned_frame(inputs: &[Series], apply_fill: bool) -> Result<Frame, FrameError> {
    let union = union_all(inputs.iter().map(Series::index));
    let columns = inputs
        .iter()
        .enumerate()
        .map(|(position, series)| {
            let mut aligned = series.reindex(&union);
            if apply_fill {
                if let Some(fill) = &series.options().fill {
                    aligned = aligned.fill(fill);
                }
            }
            // positional names: the same series may appear twice
            aligned.with_name(position.to_string())
        })
        .collect();
    Frame::from_series(columns)
}

/// Outer join, per-input fill, drop rows still missing, then row sum.
pub fn add_series(name: &str, inputs: &[Series]) -> Result<Series, FrameError> {
    if inputs.is_empty() {
        return Err(FrameError::EmptyInput("add"));
    }
    let frame = aligned_frame(inputs, true)?;

    #[cfg(feature = "tracing")]
    tracing::trace!(inputs = inputs.len(), rows = frame.len(), "add: aligned inputs");

    Ok(frame
        .dropna_rows()
        .reduce_rows(name, |row| row.iter().sum()))
}

/// At each stamp, the value of the first input (in argument order) that has
/// one. Inputs carrying a prune option lose their last points first.
pub fn priority_series(name: &str, inputs: &[Series]) -> Result<Series, FrameError> {
    if inputs.is_empty() {
        return Err(FrameError::EmptyInput("priority"));
    }
    let pruned = inputs
        .iter()
        .map(|series| {
            let cut = match series.options().prune {
                Some(count) => series.prune_last(count),
                None => series.clone(),
            };
            cut.dropna()
        })
        .collect::<Vec<_>>();
    let frame = aligned_frame(&pruned, false)?;
    Ok(frame
        .reduce_rows(name, |row| {
            row.iter()
                .copied()
                .find(|value| !value.is_nan())
                .unwrap_or(f64::NAN)
        })
        .dropna())
}

fn present(row: &[f64]) -> impl Iterator<Item = f64> + '_ {
    row.iter().copied().filter(|value| !value.is_nan())
}

pub fn row_min(name: &str, inputs: &[Series]) -> Result<Series, FrameError> {
    if inputs.is_empty() {
        return Err(FrameError::EmptyInput("min"));
    }
    let frame = aligned_frame(inputs, true)?;
    Ok(frame
        .reduce_rows(name, |row| present(row).fold(f64::NAN, f64::min))
        .dropna())
}

pub fn row_max(name: &str, inputs: &[Series]) -> Result<Series, FrameError> {
    if inputs.is_empty() {
        return Err(FrameError::EmptyInput("max"));
    }
    let frame = aligned_frame(inputs, true)?;
    Ok(frame
        .reduce_rows(name, |row| present(row).fold(f64::NAN, f64::max))
        .dropna())
}

/// Weighted mean of the values present in each row; inputs without a
/// weight count once.
pub fn row_mean(name: &str, inputs: &[Series]) -> Result<Series, FrameError> {
    if inputs.is_empty() {
        return Err(FrameError::EmptyInput("row-mean"));
    }
    let weights = inputs
        .iter()
        .map(|series| series.options().weight.unwrap_or(1.0))
        .collect::<Vec<_>>();
    let frame = aligned_frame(inputs, true)?;
    Ok(frame
        .reduce_rows(name, |row| {
            let (sum, total) = row
                .iter()
                .zip(&weights)
                .filter(|(value, _)| !value.is_nan())
                .fold((0.0, 0.0), |(sum, total), (value, weight)| {
                    (sum + value * weight, total + weight)
                });
            if total == 0.0 { f64::NAN } else { sum / total }
        })
        .dropna())
}

#[cfg(test)]
mod tests {
    use tf_index::parse_stamp;

    use super::{add_series, priority_series, row_max, row_mean, row_min};
    use crate::{FrameError, Series, SeriesOptions};

    fn day(d: u32) -> tf_index::Stamp {
        parse_stamp(&format!("2024-01-{d:02}")).expect("stamp")
    }

    fn series(name: &str, points: &[(u32, f64)]) -> Series {
        Series::from_pairs(name, points.iter().map(|(d, v)| (day(*d), *v))).expect("series")
    }

    #[test]
    fn add_drops_rows_missing_after_fill() {
        let a = series("a", &[(1, 1.0), (2, 2.0), (3, 3.0)]);
        let b = series("b", &[(2, 10.0)]);

        let plain = add_series("out", &[a.clone(), b.clone()]).expect("add");
        assert_eq!(plain.index().stamps(), &[day(2)]);
        assert_eq!(plain.values(), &[12.0]);

        let filled_b = b.with_options(SeriesOptions {
            fill: Some("ffill".parse().expect("fill")),
            ..SeriesOptions::default()
        });
        let filled = add_series("out", &[a, filled_b]).expect("add");
        assert_eq!(filled.index().stamps(), &[day(2), day(3)]);
        assert_eq!(filled.values(), &[12.0, 13.0]);
    }

    #[test]
    fn add_accepts_the_same_series_twice() {
        let a = series("a", &[(1, 1.0)]);
        let out = add_series("out", &[a.clone(), a]).expect("add");
        assert_eq!(out.values(), &[2.0]);
    }

    #[test]
    fn priority_takes_first_available_value() {
        let main = series("main", &[(2, 20.0), (3, 30.0)]);
        let backup = series("backup", &[(1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0)]);

        let out = priority_series("out", &[main.clone(), backup.clone()]).expect("priority");
        assert_eq!(out.values(), &[1.0, 20.0, 30.0, 4.0]);

        let pruned_main = main.with_options(SeriesOptions {
            prune: Some(1),
            ..SeriesOptions::default()
        });
        let out = priority_series("out", &[pruned_main, backup]).expect("priority");
        assert_eq!(out.values(), &[1.0, 20.0, 3.0, 4.0]);
    }

    #[test]
    fn empty_inputs_are_rejected() {
        assert_eq!(
            priority_series("out", &[]).expect_err("empty"),
            FrameError::EmptyInput("priority")
        );
    }

    #[test]
    fn row_reductions_skip_missing_values() {
        let a = series("a", &[(1, 1.0), (2, 5.0)]);
        let b = series("b", &[(2, 3.0), (3, 7.0)]);
        let inputs = [a, b];

        assert_eq!(row_min("m", &inputs).expect("min").values(), &[1.0, 3.0, 7.0]);
        assert_eq!(row_max("m", &inputs).expect("max").values(), &[1.0, 5.0, 7.0]);
        assert_eq!(
            row_mean("m", &inputs).expect("mean").values(),
            &[1.0, 4.0, 7.0]
        );
    }

    #[test]
    fn row_mean_honours_weights() {
        let a = series("a", &[(1, 1.0), (2, 4.0)]).with_options(SeriesOptions {
            weight: Some(3.0),
            ..SeriesOptions::default()
        });
        let b = series("b", &[(2, 8.0)]);

        let out = row_mean("m", &[a, b]).expect("mean");
        assert_eq!(out.values(), &[1.0, 5.0]);
    }
}
