use std::collections::BTreeMap;

use rayon::prelude::*;
use tracing::debug;

use crate::bars::Bar;
use crate::config::{Horizon, LabelMode, LabelParams};
use crate::error::{PipelineError, StageResult};
use crate::rolling::{forward_max, forward_min};

/// Forward columns for one horizon, aligned row-for-row with
/// [`LabeledBars::bars`]. `None` marks rows whose forward window runs past
/// the pair's last bar; those rows must not be scored.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizonLabels {
    pub horizon: Horizon,
    pub label_column: String,
    pub fut_close_ret: Vec<Option<f64>>,
    pub fut_max_ret: Vec<Option<f64>>,
    pub fwd_dd: Vec<Option<f64>>,
    pub label_bull: Vec<Option<bool>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledBars {
    pub bars: Vec<Bar>,
    pub horizons: Vec<HorizonLabels>,
    pub tp_pct: f64,
    pub dd_guard: f64,
    pub mode: LabelMode,
}

/// One row's outcome for a single horizon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForwardOutcome {
    pub fut_close_ret: f64,
    pub fut_max_ret: f64,
    pub fwd_dd: f64,
    pub label_bull: bool,
}

impl LabeledBars {
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn horizon(&self, tag: &str) -> Option<&HorizonLabels> {
        self.horizons.iter().find(|h| h.horizon.tag == tag)
    }

    /// `None` when the horizon is unknown or the row is in the undefined tail.
    pub fn outcome(&self, tag: &str, row: usize) -> Option<ForwardOutcome> {
        let h = self.horizon(tag)?;
        Some(ForwardOutcome {
            fut_close_ret: (*h.fut_close_ret.get(row)?)?,
            fut_max_ret: (*h.fut_max_ret.get(row)?)?,
            fwd_dd: (*h.fwd_dd.get(row)?)?,
            label_bull: (*h.label_bull.get(row)?)?,
        })
    }
}

/// Attach forward returns and bull-breakout labels for every horizon.
///
/// Per pair and horizon `H`, with baseline `close[i]`:
/// - `fut_close_ret = close[i + H] / close[i] - 1`
/// - `fut_max_ret = max(high[i + 1 ..= i + H]) / close[i] - 1`
/// - `fwd_dd = min(low[i + 1 ..= i + H]) / close[i] - 1`
///
/// The last `H` bars of each pair are undefined. Steps count rows, so a gap
/// in trading widens the wall-clock span of a horizon.
pub fn label(bars: &[Bar], params: &LabelParams) -> StageResult<LabeledBars> {
    params.validate()?;
    let groups = pair_groups(bars)?;

    let mut horizons = Vec::with_capacity(params.horizons.len());
    for horizon in &params.horizons {
        let mut columns = HorizonLabels {
            horizon: horizon.clone(),
            label_column: params.label_column(horizon),
            fut_close_ret: vec![None; bars.len()],
            fut_max_ret: vec![None; bars.len()],
            fwd_dd: vec![None; bars.len()],
            label_bull: vec![None; bars.len()],
        };

        let per_pair: Vec<PairColumns> = groups
            .par_iter()
            .map(|rows| label_pair(bars, rows, horizon.steps, params))
            .collect();

        for (rows, computed) in groups.iter().zip(per_pair) {
            for (k, &row) in rows.iter().enumerate() {
                columns.fut_close_ret[row] = computed.fut_close_ret[k];
                columns.fut_max_ret[row] = computed.fut_max_ret[k];
                columns.fwd_dd[row] = computed.fwd_dd[k];
                columns.label_bull[row] = computed.label_bull[k];
            }
        }

        let defined = columns.label_bull.iter().flatten().count();
        let bullish = columns.label_bull.iter().flatten().filter(|v| **v).count();
        debug!(
            horizon = %horizon.tag,
            steps = horizon.steps,
            defined,
            bullish,
            column = %columns.label_column,
            "Forward labels computed"
        );
        horizons.push(columns);
    }

    Ok(LabeledBars {
        bars: bars.to_vec(),
        horizons,
        tp_pct: params.tp_pct,
        dd_guard: params.dd_guard,
        mode: params.mode,
    })
}

struct PairColumns {
    fut_close_ret: Vec<Option<f64>>,
    fut_max_ret: Vec<Option<f64>>,
    fwd_dd: Vec<Option<f64>>,
    label_bull: Vec<Option<bool>>,
}

fn label_pair(bars: &[Bar], rows: &[usize], steps: usize, params: &LabelParams) -> PairColumns {
    let close: Vec<f64> = rows.iter().map(|&r| bars[r].close).collect();
    let high: Vec<f64> = rows.iter().map(|&r| bars[r].high).collect();
    let low: Vec<f64> = rows.iter().map(|&r| bars[r].low).collect();
    let len = close.len();

    let fwd_high = forward_max(&high, steps);
    let fwd_low = forward_min(&low, steps);

    let mut out = PairColumns {
        fut_close_ret: vec![None; len],
        fut_max_ret: vec![None; len],
        fwd_dd: vec![None; len],
        label_bull: vec![None; len],
    };

    for i in 0..len {
        let (Some(max_high), Some(min_low)) = (fwd_high[i], fwd_low[i]) else {
            continue;
        };
        let base = close[i];
        let max_ret = max_high / base - 1.0;
        let dd = min_low / base - 1.0;

        out.fut_close_ret[i] = Some(close[i + steps] / base - 1.0);
        out.fut_max_ret[i] = Some(max_ret);
        out.fwd_dd[i] = Some(dd);
        out.label_bull[i] = Some(match params.mode {
            LabelMode::Window => window_label(max_ret, dd, params.tp_pct, params.dd_guard),
            LabelMode::FirstTouch => first_touch_label(
                &high[i + 1..=i + steps],
                &low[i + 1..=i + steps],
                base,
                params.tp_pct,
                params.dd_guard,
            ),
        });
    }
    out
}

/// Window-level condition: best case reaches the target and worst case stays
/// within the guard.
pub fn window_label(fut_max_ret: f64, fwd_dd: f64, tp_pct: f64, dd_guard: f64) -> bool {
    fut_max_ret >= tp_pct && fwd_dd >= dd_guard
}

/// Path-dependent variant. The guard is checked before the target on every
/// bar, so a bar that spans both resolves as a breach.
fn first_touch_label(highs: &[f64], lows: &[f64], base: f64, tp_pct: f64, dd_guard: f64) -> bool {
    for (high, low) in highs.iter().zip(lows) {
        if low / base - 1.0 < dd_guard {
            return false;
        }
        if high / base - 1.0 >= tp_pct {
            return true;
        }
    }
    false
}

/// Row indices per pair, in input order. Each pair's bars must have strictly
/// increasing `window_start` and a positive, finite close.
fn pair_groups(bars: &[Bar]) -> StageResult<Vec<Vec<usize>>> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (row, bar) in bars.iter().enumerate() {
        if !(bar.close.is_finite() && bar.close > 0.0) {
            return Err(PipelineError::data(format!(
                "bar {} of {} has non-positive close {}",
                bar.window_start, bar.pair, bar.close
            )));
        }
        if !(bar.high.is_finite() && bar.low.is_finite()) {
            return Err(PipelineError::data(format!(
                "bar {} of {} has non-finite high/low",
                bar.window_start, bar.pair
            )));
        }
        let rows = groups.entry(bar.pair.as_str()).or_default();
        if let Some(&prev) = rows.last() {
            let prev_start = bars[prev].window_start;
            if bar.window_start <= prev_start {
                return Err(PipelineError::data(format!(
                    "bars for {} are not strictly time-ordered ({} follows {})",
                    bar.pair, bar.window_start, prev_start
                )));
            }
        }
        rows.push(row);
    }
    Ok(groups.into_values().collect())
}
