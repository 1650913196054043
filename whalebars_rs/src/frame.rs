//! Columnar layout of the persisted tables.
//!
//! Every table carries a `schema_version` column. Readers refuse tables
//! written under a different version instead of guessing at their layout.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use polars::prelude::*;

use crate::bars::Bar;
use crate::config::SweepParams;
use crate::error::PipelineError;
use crate::labels::LabeledBars;
use crate::sweep::{LabelColumn, SweepResult, SweepTable};

pub const SCHEMA_VERSION: u32 = 1;

pub const COL_SCHEMA_VERSION: &str = "schema_version";
pub const COL_PAIR: &str = "pair";
pub const COL_WINDOW_START: &str = "window_start";
pub const COL_WHALE_IMBALANCE: &str = "whale_imbalance";
pub const COL_WHALE_BUY_COUNT: &str = "whale_buy_count";

pub fn fut_close_ret_column(tag: &str) -> String {
    format!("fut_close_ret_{tag}")
}

pub fn fut_max_ret_column(tag: &str) -> String {
    format!("fut_max_ret_{tag}")
}

pub fn fwd_dd_column(tag: &str) -> String {
    format!("fwd_dd_{tag}")
}

pub fn bars_to_frame(bars: &[Bar]) -> Result<DataFrame> {
    let float = |f: fn(&Bar) -> f64| bars.iter().map(f).collect::<Vec<f64>>();
    let count = |f: fn(&Bar) -> u64| bars.iter().map(f).collect::<Vec<u64>>();

    let window_ms: Vec<i64> = bars
        .iter()
        .map(|b| b.window_start.timestamp_millis())
        .collect();
    let window_start = Series::new(COL_WINDOW_START, window_ms)
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
        .context("Failed to build window_start column")?;

    let columns = vec![
        Series::new(
            COL_PAIR,
            bars.iter().map(|b| b.pair.as_str()).collect::<Vec<&str>>(),
        ),
        window_start,
        Series::new("open", float(|b| b.open)),
        Series::new("high", float(|b| b.high)),
        Series::new("low", float(|b| b.low)),
        Series::new("close", float(|b| b.close)),
        Series::new("total_count", count(|b| b.total_count)),
        Series::new("total_size", float(|b| b.total_size)),
        Series::new("total_notional", float(|b| b.total_notional)),
        Series::new("buy_count", count(|b| b.buy_count)),
        Series::new("sell_count", count(|b| b.sell_count)),
        Series::new("buy_notional", float(|b| b.buy_notional)),
        Series::new("sell_notional", float(|b| b.sell_notional)),
        Series::new(COL_WHALE_BUY_COUNT, count(|b| b.whale_buy_count)),
        Series::new("whale_sell_count", count(|b| b.whale_sell_count)),
        Series::new("whale_buy_notional", float(|b| b.whale_buy_notional)),
        Series::new("whale_sell_notional", float(|b| b.whale_sell_notional)),
        Series::new(COL_WHALE_IMBALANCE, float(|b| b.whale_imbalance)),
        version_column(bars.len()),
    ];
    DataFrame::new(columns).context("Failed to assemble bars frame")
}

pub fn bars_from_frame(df: &DataFrame) -> Result<Vec<Bar>> {
    const STAGE: &str = "build";
    check_version(df, STAGE)?;

    let pair = string_values(df, COL_PAIR, STAGE)?;
    let window_start = datetime_values(df, COL_WINDOW_START, STAGE)?;
    let float = |name: &str| f64_values(df, name, STAGE);
    let open = float("open")?;
    let high = float("high")?;
    let low = float("low")?;
    let close = float("close")?;
    let total_size = float("total_size")?;
    let total_notional = float("total_notional")?;
    let buy_notional = float("buy_notional")?;
    let sell_notional = float("sell_notional")?;
    let whale_buy_notional = float("whale_buy_notional")?;
    let whale_sell_notional = float("whale_sell_notional")?;
    let whale_imbalance = float(COL_WHALE_IMBALANCE)?;
    let total_count = u64_values(df, "total_count", STAGE)?;
    let buy_count = u64_values(df, "buy_count", STAGE)?;
    let sell_count = u64_values(df, "sell_count", STAGE)?;
    let whale_buy_count = u64_values(df, COL_WHALE_BUY_COUNT, STAGE)?;
    let whale_sell_count = u64_values(df, "whale_sell_count", STAGE)?;

    let bars = (0..df.height())
        .map(|i| Bar {
            pair: pair[i].clone(),
            window_start: window_start[i],
            open: open[i],
            high: high[i],
            low: low[i],
            close: close[i],
            total_count: total_count[i],
            total_size: total_size[i],
            total_notional: total_notional[i],
            buy_count: buy_count[i],
            sell_count: sell_count[i],
            buy_notional: buy_notional[i],
            sell_notional: sell_notional[i],
            whale_buy_count: whale_buy_count[i],
            whale_sell_count: whale_sell_count[i],
            whale_buy_notional: whale_buy_notional[i],
            whale_sell_notional: whale_sell_notional[i],
            whale_imbalance: whale_imbalance[i],
        })
        .collect();
    Ok(bars)
}

/// Bars columns followed by, per horizon, `fut_close_ret_{H}`,
/// `fut_max_ret_{H}`, `fwd_dd_{H}` and the label column. The undefined tail
/// of each pair is stored as nulls.
pub fn labeled_to_frame(labeled: &LabeledBars) -> Result<DataFrame> {
    let mut df = bars_to_frame(&labeled.bars)?;
    let _ = df
        .drop_in_place(COL_SCHEMA_VERSION)
        .context("Failed to reorder schema_version column")?;
    for h in &labeled.horizons {
        let tag = h.horizon.tag.as_str();
        df.with_column(Series::new(&fut_close_ret_column(tag), h.fut_close_ret.clone()))?;
        df.with_column(Series::new(&fut_max_ret_column(tag), h.fut_max_ret.clone()))?;
        df.with_column(Series::new(&fwd_dd_column(tag), h.fwd_dd.clone()))?;
        df.with_column(Series::new(&h.label_column, h.label_bull.clone()))?;
    }
    df.with_column(version_column(labeled.len()))?;
    Ok(df)
}

/// Pull the columns one horizon's sweep needs out of a labels table.
///
/// `fut_max_ret_{H}` is required. `fwd_dd_{H}` and the label column matching
/// `params` are loaded when present; the sweep decides whether it can
/// recompute a missing label.
pub fn sweep_table_from_frame(df: &DataFrame, params: &SweepParams) -> Result<SweepTable> {
    const STAGE: &str = "label";
    check_version(df, STAGE)?;
    let tag = params.horizon.tag.as_str();

    let fwd_dd_name = fwd_dd_column(tag);
    let fwd_dd = if df.column(&fwd_dd_name).is_ok() {
        Some(opt_f64_values(df, &fwd_dd_name, STAGE)?)
    } else {
        None
    };
    let label_name = params.label_column();
    let label = if df.column(&label_name).is_ok() {
        Some(LabelColumn {
            values: opt_bool_values(df, &label_name, STAGE)?,
            name: label_name,
        })
    } else {
        None
    };

    Ok(SweepTable {
        horizon_tag: tag.to_string(),
        pair: string_values(df, COL_PAIR, STAGE)?,
        window_start: datetime_values(df, COL_WINDOW_START, STAGE)?,
        whale_imbalance: f64_values(df, COL_WHALE_IMBALANCE, STAGE)?,
        whale_buy_count: u64_values(df, COL_WHALE_BUY_COUNT, STAGE)?,
        fut_max_ret: opt_f64_values(df, &fut_max_ret_column(tag), STAGE)?,
        fwd_dd,
        label,
    })
}

/// Ranked sweep cells; `rank` is 1-based in the order given.
pub fn sweep_results_to_frame(results: &[SweepResult]) -> Result<DataFrame> {
    let columns = vec![
        Series::new("rank", (1..=results.len() as u64).collect::<Vec<u64>>()),
        Series::new(
            COL_PAIR,
            results.iter().map(|r| r.pair.as_str()).collect::<Vec<&str>>(),
        ),
        Series::new(
            "horizon",
            results.iter().map(|r| r.horizon.as_str()).collect::<Vec<&str>>(),
        ),
        Series::new(
            "imb_threshold",
            results.iter().map(|r| r.imb_threshold).collect::<Vec<f64>>(),
        ),
        Series::new(
            "min_count",
            results.iter().map(|r| r.min_count).collect::<Vec<u64>>(),
        ),
        Series::new("fired", results.iter().map(|r| r.fired).collect::<Vec<u64>>()),
        Series::new("signals", results.iter().map(|r| r.signals).collect::<Vec<u64>>()),
        Series::new(
            "coverage",
            results.iter().map(|r| r.coverage).collect::<Vec<f64>>(),
        ),
        Series::new(
            "precision",
            results.iter().map(|r| r.precision).collect::<Vec<f64>>(),
        ),
        Series::new(
            "avg_gross_return",
            results
                .iter()
                .map(|r| r.avg_gross_return)
                .collect::<Vec<Option<f64>>>(),
        ),
        Series::new(
            "avg_net_return",
            results
                .iter()
                .map(|r| r.avg_net_return)
                .collect::<Vec<Option<f64>>>(),
        ),
        version_column(results.len()),
    ];
    DataFrame::new(columns).context("Failed to assemble sweep results frame")
}

fn version_column(rows: usize) -> Series {
    Series::new(COL_SCHEMA_VERSION, vec![SCHEMA_VERSION; rows])
}

fn check_version(df: &DataFrame, stage: &'static str) -> Result<()> {
    let versions = column(df, COL_SCHEMA_VERSION, stage)?
        .cast(&DataType::UInt32)
        .context("schema_version column is not an integer")?;
    let found = versions
        .u32()?
        .into_iter()
        .find(|v| *v != Some(SCHEMA_VERSION));
    if let Some(other) = found {
        let shown = other.map_or_else(|| "null".to_string(), |v| v.to_string());
        return Err(PipelineError::data(format!(
            "table has schema_version {shown}, this build reads {SCHEMA_VERSION}; rerun the `{stage}` stage"
        ))
        .into());
    }
    Ok(())
}

fn column<'a>(df: &'a DataFrame, name: &str, stage: &'static str) -> Result<&'a Series> {
    df.column(name)
        .map_err(|_| PipelineError::missing(format!("column {name}"), stage).into())
}

fn casted(df: &DataFrame, name: &str, stage: &'static str, dtype: &DataType) -> Result<Series> {
    column(df, name, stage)?
        .cast(dtype)
        .with_context(|| format!("Column '{name}' cannot be read as {dtype}"))
}

fn null_error(name: &str, row: usize) -> anyhow::Error {
    PipelineError::data(format!("column {name} has a null at row {row}")).into()
}

fn f64_values(df: &DataFrame, name: &str, stage: &'static str) -> Result<Vec<f64>> {
    let series = casted(df, name, stage, &DataType::Float64)?;
    series
        .f64()?
        .into_iter()
        .enumerate()
        .map(|(row, v)| v.ok_or_else(|| null_error(name, row)))
        .collect()
}

fn opt_f64_values(df: &DataFrame, name: &str, stage: &'static str) -> Result<Vec<Option<f64>>> {
    let series = casted(df, name, stage, &DataType::Float64)?;
    Ok(series.f64()?.into_iter().collect())
}

fn u64_values(df: &DataFrame, name: &str, stage: &'static str) -> Result<Vec<u64>> {
    let series = casted(df, name, stage, &DataType::UInt64)?;
    series
        .u64()?
        .into_iter()
        .enumerate()
        .map(|(row, v)| v.ok_or_else(|| null_error(name, row)))
        .collect()
}

fn opt_bool_values(df: &DataFrame, name: &str, stage: &'static str) -> Result<Vec<Option<bool>>> {
    let series = casted(df, name, stage, &DataType::Boolean)?;
    Ok(series.bool()?.into_iter().collect())
}

fn string_values(df: &DataFrame, name: &str, stage: &'static str) -> Result<Vec<String>> {
    let series = casted(df, name, stage, &DataType::String)?;
    series
        .str()?
        .into_iter()
        .enumerate()
        .map(|(row, v)| v.map(str::to_string).ok_or_else(|| null_error(name, row)))
        .collect()
}

fn datetime_values(df: &DataFrame, name: &str, stage: &'static str) -> Result<Vec<DateTime<Utc>>> {
    let series = column(df, name, stage)?;
    let per_ms: i64 = match series.dtype() {
        DataType::Datetime(TimeUnit::Nanoseconds, _) => 1_000_000,
        DataType::Datetime(TimeUnit::Microseconds, _) => 1_000,
        _ => 1,
    };
    let raw = series
        .cast(&DataType::Int64)
        .with_context(|| format!("Column '{name}' is not a timestamp"))?;
    raw.i64()?
        .into_iter()
        .enumerate()
        .map(|(row, v)| {
            let ms = v.ok_or_else(|| null_error(name, row))?.div_euclid(per_ms);
            DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
                anyhow::Error::from(PipelineError::data(format!(
                    "column {name} row {row} is out of range"
                )))
            })
        })
        .collect()
}
