//! Evaluation of the builtin operators, once their arguments are values.

use std::collections::BTreeMap;

use chrono::{TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use tf_frame::{
    ArithmeticOp, FillPolicy, History, IDate, Series, SeriesOptions, add_series,
    priority_series, row_max, row_mean, row_min,
};
use tf_index::{Stamp, TimeIndex, Window, parse_stamp};

use crate::registry::Builtin;
use crate::{Args, FormulaError, HistoryQuery, Query, Value};

pub(crate) fn evaluate(builtin: Builtin, mut args: Args, query: &Query) -> Result<Value, FormulaError> {
    let name = builtin.name();
    let value = match builtin {
        Builtin::Series | Builtin::Group => {
            return Err(FormulaError::invalid_argument(
                name,
                "leaves are resolved by the interpreter",
            ));
        }
        Builtin::Options => {
            let series = first_series(&mut args, name)?;
            let options = series_options(name, &args.keywords, series.options().clone())?;
            Value::Series(series.with_options(options))
        }
        Builtin::Plus => arithmetic(ArithmeticOp::Add, args)?,
        Builtin::Times => arithmetic(ArithmeticOp::Mul, args)?,
        Builtin::Divide => arithmetic(ArithmeticOp::Div, args)?,
        Builtin::Add => Value::Series(add_series(name, &all_series(args, name)?)?),
        Builtin::Priority => Value::Series(priority_series(name, &all_series(args, name)?)?),
        Builtin::Min => Value::Series(row_min(name, &all_series(args, name)?)?),
        Builtin::Max => Value::Series(row_max(name, &all_series(args, name)?)?),
        Builtin::RowMean => Value::Series(row_mean(name, &all_series(args, name)?)?),
        Builtin::Abs => Value::Series(first_series(&mut args, name)?.map_values(f64::abs)),
        Builtin::Round => {
            let decimals = optional(&args, "decimals", |v| v.as_int(name))?.unwrap_or(0);
            let factor = 10_f64.powi(decimals.clamp(-15, 15) as i32);
            Value::Series(
                first_series(&mut args, name)?
                    .map_values(|value| (value * factor).round() / factor),
            )
        }
        Builtin::Clip => {
            let lower = optional(&args, "min", |v| v.as_f64(name))?;
            let upper = optional(&args, "max", |v| v.as_f64(name))?;
            Value::Series(first_series(&mut args, name)?.map_values(|value| {
                if value.is_nan() {
                    return value;
                }
                let value = lower.map_or(value, |lower| value.max(lower));
                upper.map_or(value, |upper| value.min(upper))
            }))
        }
        Builtin::Slice => {
            let bounds = slice_bounds(&args.keywords)?;
            Value::Series(first_series(&mut args, name)?.window(&bounds))
        }
        Builtin::Cumsum => Value::Series(first_series(&mut args, name)?.cumsum()),
        Builtin::Naive => {
            let zone = parse_zone(name, args.at(1, name)?.as_str(name)?)?;
            Value::Series(naive(&first_series(&mut args, name)?, zone, &query.window)?)
        }
        Builtin::Date => {
            let tz = optional(&args, "tz", |v| v.as_str(name).map(str::to_owned))?;
            date(args.at(0, name)?.as_str(name)?, tz.as_deref())?
        }
        Builtin::Constant => {
            let constant = Constant::from_args(&args)?;
            if query
                .revision_date
                .is_some_and(|revision| revision < constant.revdate)
            {
                Value::Series(Series::empty(name))
            } else {
                Value::Series(constant.series(&query.window)?)
            }
        }
        Builtin::GroupAdd => {
            let mut values = args.positional.into_iter();
            let first = values
                .next()
                .ok_or_else(|| FormulaError::invalid_argument(name, "needs at least one operand"))?;
            let total = values.try_fold(first, |acc, value| combine(ArithmeticOp::Add, acc, value))?;
            Value::Table(total.into_table(name)?)
        }
    };
    Ok(value)
}

/// Query handed to the arguments of `builtin`. Slices narrow the value
/// window; `naive` widens it so that shifted stamps near the edges are
/// still fetched.
pub(crate) fn child_query(
    builtin: Builtin,
    keywords: &BTreeMap<String, Value>,
    query: &Query,
) -> Result<Query, FormulaError> {
    match builtin {
        Builtin::Slice => Ok(Query {
            window: query.window.intersect(&slice_bounds(keywords)?),
            ..*query
        }),
        Builtin::Naive => {
            let slack = TimeDelta::days(1);
            Ok(Query {
                window: Window::new(
                    query.window.from.map(|from| from - slack),
                    query.window.to.map(|to| to + slack),
                ),
                ..*query
            })
        }
        _ => Ok(*query),
    }
}

/// Applies the `#:fill`, `#:prune` and `#:weight` keywords over `options`.
pub(crate) fn series_options(
    operator: &str,
    keywords: &BTreeMap<String, Value>,
    mut options: SeriesOptions,
) -> Result<SeriesOptions, FormulaError> {
    if let Some(fill) = keywords.get("fill") {
        options.fill = Some(match fill {
            Value::Str(text) => text.parse::<FillPolicy>()?,
            other => FillPolicy::value(other.as_f64(operator)?),
        });
    }
    if let Some(prune) = keywords.get("prune") {
        let count = usize::try_from(prune.as_int(operator)?)
            .map_err(|_| FormulaError::invalid_argument(operator, "prune must not be negative"))?;
        options.prune = Some(count);
    }
    if let Some(weight) = keywords.get("weight") {
        options.weight = Some(weight.as_f64(operator)?);
    }
    Ok(options)
}

pub(crate) fn constant_history(args: &Args, query: &HistoryQuery) -> Result<History, FormulaError> {
    let constant = Constant::from_args(args)?;
    let mut history = History::new();
    if query.idates.contains(&constant.revdate) {
        history.insert(constant.revdate, constant.series(&query.window)?);
    }
    Ok(history)
}

pub(crate) fn constant_insertion_dates(
    args: &Args,
    idates: &Window<IDate>,
) -> Result<Vec<IDate>, FormulaError> {
    let constant = Constant::from_args(args)?;
    Ok(if idates.contains(&constant.revdate) {
        vec![constant.revdate]
    } else {
        Vec::new()
    })
}

fn arithmetic(op: ArithmeticOp, mut args: Args) -> Result<Value, FormulaError> {
    let rhs = args.take(1, op.symbol())?;
    let lhs = args.take(0, op.symbol())?;
    combine(op, lhs, rhs)
}

/// Broadcasting `lhs op rhs`: tables over series over scalars.
fn combine(op: ArithmeticOp, lhs: Value, rhs: Value) -> Result<Value, FormulaError> {
    let symbol = op.symbol();
    let value = match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) if op != ArithmeticOp::Div => {
            let exact = match op {
                ArithmeticOp::Add => a.checked_add(b),
                ArithmeticOp::Sub => a.checked_sub(b),
                ArithmeticOp::Mul => a.checked_mul(b),
                ArithmeticOp::Div => None,
            };
            exact.map_or_else(|| Value::Number(op.apply(a as f64, b as f64)), Value::Int)
        }
        (Value::Series(left), Value::Series(right)) => Value::Series(left.binary_op(&right, op)?),
        (Value::Table(left), Value::Table(right)) => Value::Table(left.frame_op(&right, op)?),
        (Value::Table(table), Value::Series(series)) => {
            Value::Table(table.series_op(&series, op, false)?)
        }
        (Value::Series(series), Value::Table(table)) => {
            Value::Table(table.series_op(&series, op, true)?)
        }
        (Value::Series(series), scalar) => {
            Value::Series(series.scalar_op(op, scalar.as_f64(symbol)?, false))
        }
        (scalar, Value::Series(series)) => {
            Value::Series(series.scalar_op(op, scalar.as_f64(symbol)?, true))
        }
        (Value::Table(table), scalar) => {
            Value::Table(table.scalar_op(op, scalar.as_f64(symbol)?, false))
        }
        (scalar, Value::Table(table)) => {
            Value::Table(table.scalar_op(op, scalar.as_f64(symbol)?, true))
        }
        (lhs, rhs) => Value::Number(op.apply(lhs.as_f64(symbol)?, rhs.as_f64(symbol)?)),
    };
    Ok(value)
}

fn first_series(args: &mut Args, operator: &str) -> Result<Series, FormulaError> {
    args.take(0, operator)?.into_series(operator)
}

fn all_series(args: Args, operator: &str) -> Result<Vec<Series>, FormulaError> {
    args.positional
        .into_iter()
        .map(|value| value.into_series(operator))
        .collect()
}

fn optional<T>(
    args: &Args,
    keyword: &str,
    convert: impl FnOnce(&Value) -> Result<T, FormulaError>,
) -> Result<Option<T>, FormulaError> {
    args.keyword(keyword).map(convert).transpose()
}

fn slice_bounds(keywords: &BTreeMap<String, Value>) -> Result<Window<Stamp>, FormulaError> {
    let bound = |keyword: &str| {
        keywords
            .get(keyword)
            .map(|value| value.as_timestamp(Builtin::Slice.name()))
            .transpose()
    };
    Ok(Window::new(bound("fromdate")?, bound("todate")?))
}

fn parse_zone(operator: &str, name: &str) -> Result<Tz, FormulaError> {
    name.parse::<Tz>()
        .map_err(|_| FormulaError::invalid_argument(operator, format!("unknown timezone `{name}`")))
}

/// Re-expresses UTC stamps as wall-clock time in `zone`. When a wall-clock
/// hour repeats, the later point wins.
fn naive(series: &Series, zone: Tz, window: &Window<Stamp>) -> Result<Series, FormulaError> {
    let points = series
        .iter()
        .map(|(stamp, value)| {
            let local = Utc.from_utc_datetime(&stamp).with_timezone(&zone);
            (local.naive_local(), value)
        })
        .filter(|(stamp, _)| window.contains(stamp))
        .collect::<BTreeMap<_, _>>();
    Ok(Series::from_pairs(series.name(), points)?)
}

/// A timestamp literal; with a timezone it is converted to UTC.
fn date(text: &str, tz: Option<&str>) -> Result<Value, FormulaError> {
    let stamp = parse_stamp(text)?;
    let Some(tz) = tz else {
        return Ok(Value::Timestamp(stamp));
    };
    let zone = parse_zone(Builtin::Date.name(), tz)?;
    let local = zone.from_local_datetime(&stamp).earliest().ok_or_else(|| {
        FormulaError::invalid_argument(
            Builtin::Date.name(),
            format!("`{text}` does not exist in {tz}"),
        )
    })?;
    Ok(Value::Timestamp(local.naive_utc()))
}

/// Upper bound on the points a single `constant` call may produce.
const MAX_CONSTANT_POINTS: usize = 1_000_000;

/// `(constant value fromdate todate freq revdate)`
struct Constant {
    value: f64,
    from: Stamp,
    to: Stamp,
    step: TimeDelta,
    revdate: IDate,
}

impl Constant {
    fn from_args(args: &Args) -> Result<Self, FormulaError> {
        let name = Builtin::Constant.name();
        Ok(Self {
            value: args.at(0, name)?.as_f64(name)?,
            from: args.at(1, name)?.as_timestamp(name)?,
            to: args.at(2, name)?.as_timestamp(name)?,
            step: parse_freq(args.at(3, name)?.as_str(name)?)?,
            revdate: Utc.from_utc_datetime(&args.at(4, name)?.as_timestamp(name)?),
        })
    }

    fn series(&self, window: &Window<Stamp>) -> Result<Series, FormulaError> {
        let name = Builtin::Constant.name();
        let bounds = window.intersect(&Window::new(Some(self.from), Some(self.to)));
        let (Some(lower), Some(upper)) = (bounds.from, bounds.to) else {
            return Ok(Series::empty(name));
        };
        if upper < lower {
            return Ok(Series::empty(name));
        }
        let too_long = || {
            FormulaError::invalid_argument(
                name,
                format!("more than {MAX_CONSTANT_POINTS} points between {lower} and {upper}"),
            )
        };
        let step = self.step.num_microseconds().ok_or_else(too_long)?;
        let offset = |steps: i64| {
            steps
                .checked_mul(step)
                .map(TimeDelta::microseconds)
                .and_then(|shift| self.from.checked_add_signed(shift))
                .ok_or_else(too_long)
        };
        let skipped = (lower - self.from).num_microseconds().ok_or_else(too_long)?;
        let first_step = (skipped + step - 1) / step;
        let first = offset(first_step)?;
        if first > upper {
            return Ok(Series::empty(name));
        }
        let span = (upper - first).num_microseconds().ok_or_else(too_long)?;
        let count = usize::try_from(span / step + 1).map_err(|_| too_long())?;
        if count > MAX_CONSTANT_POINTS {
            return Err(too_long());
        }

        let stamps = (first_step..)
            .take(count)
            .map(offset)
            .collect::<Result<Vec<_>, _>>()?;
        let values = vec![self.value; stamps.len()];
        Ok(Series::new(name, TimeIndex::new(stamps)?, values)?)
    }
}

/// Frequencies such as `D`, `H`, `15min` or `2W`.
fn parse_freq(text: &str) -> Result<TimeDelta, FormulaError> {
    let invalid = || {
        FormulaError::invalid_argument(
            Builtin::Constant.name(),
            format!("invalid frequency `{text}`"),
        )
    };
    let digits = text.chars().take_while(char::is_ascii_digit).count();
    let (count, unit) = text.split_at(digits);
    let count = if count.is_empty() {
        1
    } else {
        count.parse::<i32>().map_err(|_| invalid())?
    };
    let unit = match unit {
        "D" => TimeDelta::days(1),
        "H" | "h" => TimeDelta::hours(1),
        "min" | "T" => TimeDelta::minutes(1),
        "S" | "s" => TimeDelta::seconds(1),
        "W" => TimeDelta::weeks(1),
        _ => return Err(invalid()),
    };
    if count <= 0 {
        return Err(invalid());
    }
    unit.checked_mul(count).ok_or_else(invalid)
}
