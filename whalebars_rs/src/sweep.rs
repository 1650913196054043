use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{LabelMode, SweepParams};
use crate::error::{PipelineError, StageResult};
use crate::labels::{LabeledBars, window_label};

/// Label column carried by a sweep table, with the name it was written under.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelColumn {
    pub name: String,
    pub values: Vec<Option<bool>>,
}

/// Columns the sweep reads for one horizon, row-aligned.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepTable {
    pub horizon_tag: String,
    pub pair: Vec<String>,
    pub window_start: Vec<DateTime<Utc>>,
    pub whale_imbalance: Vec<f64>,
    pub whale_buy_count: Vec<u64>,
    pub fut_max_ret: Vec<Option<f64>>,
    pub fwd_dd: Option<Vec<Option<f64>>>,
    pub label: Option<LabelColumn>,
}

impl SweepTable {
    pub fn from_labeled(labeled: &LabeledBars, horizon_tag: &str) -> StageResult<Self> {
        let h = labeled.horizon(horizon_tag).ok_or_else(|| {
            PipelineError::missing(format!("fut_max_ret_{horizon_tag}"), "label")
        })?;
        Ok(Self {
            horizon_tag: horizon_tag.to_string(),
            pair: labeled.bars.iter().map(|b| b.pair.clone()).collect(),
            window_start: labeled.bars.iter().map(|b| b.window_start).collect(),
            whale_imbalance: labeled.bars.iter().map(|b| b.whale_imbalance).collect(),
            whale_buy_count: labeled.bars.iter().map(|b| b.whale_buy_count).collect(),
            fut_max_ret: h.fut_max_ret.clone(),
            fwd_dd: Some(h.fwd_dd.clone()),
            label: Some(LabelColumn {
                name: h.label_column.clone(),
                values: h.label_bull.clone(),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pair.is_empty()
    }

    fn check_lengths(&self) -> StageResult<()> {
        let len = self.len();
        let mut lengths = vec![
            ("window_start", self.window_start.len()),
            ("whale_imbalance", self.whale_imbalance.len()),
            ("whale_buy_count", self.whale_buy_count.len()),
            ("fut_max_ret", self.fut_max_ret.len()),
        ];
        if let Some(dd) = &self.fwd_dd {
            lengths.push(("fwd_dd", dd.len()));
        }
        if let Some(label) = &self.label {
            lengths.push((label.name.as_str(), label.values.len()));
        }
        match lengths.into_iter().find(|(_, n)| *n != len) {
            Some((name, n)) => Err(PipelineError::data(format!(
                "sweep column {name} has {n} rows, expected {len}"
            ))),
            None => Ok(()),
        }
    }

    /// The realised label per row: the stored column when it was built with
    /// the requested target/guard/mode, otherwise the window-level condition
    /// recomputed from `fut_max_ret` and `fwd_dd`.
    fn resolve_labels(&self, params: &SweepParams) -> StageResult<Vec<Option<bool>>> {
        let wanted = params.label_column();
        if let Some(label) = self.label.as_ref().filter(|l| l.name == wanted) {
            return Ok(label.values.clone());
        }
        let fwd_dd = match (&self.fwd_dd, params.label_mode) {
            (Some(dd), LabelMode::Window) => dd,
            _ => return Err(PipelineError::missing(wanted, "label")),
        };
        Ok(self
            .fut_max_ret
            .iter()
            .zip(fwd_dd)
            .map(|(max_ret, dd)| match (max_ret, dd) {
                (Some(m), Some(d)) => Some(window_label(*m, *d, params.tp_pct, params.dd_guard)),
                _ => None,
            })
            .collect())
    }
}

/// Performance of one `(pair, imbalance threshold, minimum whale buys)` cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepResult {
    pub pair: String,
    pub horizon: String,
    pub imb_threshold: f64,
    pub min_count: u64,
    /// Bars where the condition holds, label-valid or not.
    pub fired: u64,
    /// Fired bars whose forward window is defined.
    pub signals: u64,
    pub coverage: f64,
    pub precision: f64,
    pub avg_gross_return: Option<f64>,
    pub avg_net_return: Option<f64>,
}

/// Grid every `(imb, min_count)` combination per pair and rank the cells.
///
/// A bar fires when `whale_imbalance >= imb` and `whale_buy_count >=
/// min_count`. Coverage is the fire rate over all of the pair's bars; every
/// other statistic only uses fired bars with a defined forward window.
/// Net return charges `2 * fee_per_side` against the forward max excursion.
pub fn sweep(table: &SweepTable, params: &SweepParams) -> StageResult<Vec<SweepResult>> {
    params.validate()?;
    if table.horizon_tag != params.horizon.tag {
        return Err(PipelineError::config(format!(
            "sweep table holds horizon '{}' but '{}' was requested",
            table.horizon_tag, params.horizon.tag
        )));
    }
    table.check_lengths()?;
    let labels = table.resolve_labels(params)?;

    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (row, pair) in table.pair.iter().enumerate() {
        groups.entry(pair.as_str()).or_default().push(row);
    }
    let groups: Vec<(&str, Vec<usize>)> = groups.into_iter().collect();

    let mut cells = Vec::with_capacity(groups.len() * params.imb_grid.len() * params.count_grid.len());
    for (group, _) in groups.iter().enumerate() {
        for &imb in &params.imb_grid {
            for &min_count in &params.count_grid {
                cells.push((group, imb, min_count));
            }
        }
    }

    let mut results = cells
        .par_iter()
        .map(|&(group, imb, min_count)| {
            let (pair, rows) = &groups[group];
            evaluate_cell(table, &labels, pair, rows, imb, min_count, params)
        })
        .collect::<StageResult<Vec<_>>>()?;

    rank_results(&mut results);
    Ok(results)
}

/// One threshold pair, reported per pair in ranked order.
pub fn evaluate_signal(
    table: &SweepTable,
    params: &SweepParams,
    imb: f64,
    min_count: u64,
) -> StageResult<Vec<SweepResult>> {
    let single = SweepParams {
        imb_grid: vec![imb],
        count_grid: vec![min_count],
        ..params.clone()
    };
    sweep(table, &single)
}

/// Stable sort by precision, then net return (undefined last), then signal
/// count, all descending. Equal keys keep grid order.
pub fn rank_results(results: &mut [SweepResult]) {
    results.sort_by(|a, b| {
        b.precision
            .total_cmp(&a.precision)
            .then_with(|| desc_defined_first(a.avg_net_return, b.avg_net_return))
            .then_with(|| b.signals.cmp(&a.signals))
    });
}

fn desc_defined_first(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn evaluate_cell(
    table: &SweepTable,
    labels: &[Option<bool>],
    pair: &str,
    rows: &[usize],
    imb: f64,
    min_count: u64,
    params: &SweepParams,
) -> StageResult<SweepResult> {
    let mut fired = 0u64;
    let mut signals = 0u64;
    let mut hits = 0u64;
    let mut gross_sum = 0.0f64;

    for &row in rows {
        if table.whale_imbalance[row] < imb || table.whale_buy_count[row] < min_count {
            continue;
        }
        fired += 1;
        let Some(max_ret) = table.fut_max_ret[row] else {
            continue;
        };
        let label = labels[row].ok_or_else(|| {
            PipelineError::data(format!(
                "label undefined on scorable row {row} of {pair} ({})",
                table.window_start[row]
            ))
        })?;
        signals += 1;
        gross_sum += max_ret;
        if label {
            hits += 1;
        }
    }

    let coverage = if rows.is_empty() {
        0.0
    } else {
        fired as f64 / rows.len() as f64
    };
    let (precision, avg_gross_return, avg_net_return) = if signals == 0 {
        (0.0, None, None)
    } else {
        let gross = gross_sum / signals as f64;
        (
            hits as f64 / signals as f64,
            Some(gross),
            Some(gross - 2.0 * params.fee_per_side),
        )
    };

    Ok(SweepResult {
        pair: pair.to_string(),
        horizon: params.horizon.tag.clone(),
        imb_threshold: imb,
        min_count,
        fired,
        signals,
        coverage,
        precision,
        avg_gross_return,
        avg_net_return,
    })
}

/// Bars closest to firing, for tuning thresholds when a signal never fires.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearMiss {
    pub pair: String,
    pub window_start: DateTime<Utc>,
    pub whale_imbalance: f64,
    pub whale_buy_count: u64,
}

/// Top `limit` rows by whale imbalance, descending; ties keep table order.
pub fn near_misses(table: &SweepTable, limit: usize) -> Vec<NearMiss> {
    let mut order: Vec<usize> = (0..table.len()).collect();
    order.sort_by(|&a, &b| table.whale_imbalance[b].total_cmp(&table.whale_imbalance[a]));
    order
        .into_iter()
        .take(limit)
        .map(|row| NearMiss {
            pair: table.pair[row].clone(),
            window_start: table.window_start[row],
            whale_imbalance: table.whale_imbalance[row],
            whale_buy_count: table.whale_buy_count[row],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Horizon;
    use chrono::{Duration, TimeZone};

    fn params(imb_grid: Vec<f64>, count_grid: Vec<u64>) -> SweepParams {
        SweepParams {
            horizon: Horizon {
                tag: "1h".to_string(),
                steps: 4,
            },
            imb_grid,
            count_grid,
            fee_per_side: 0.001,
            tp_pct: 0.02,
            dd_guard: -0.05,
            label_mode: LabelMode::Window,
        }
    }

    /// Rows: (imbalance, whale buys, fut_max_ret, fwd_dd).
    fn table(rows: &[(f64, u64, Option<f64>, Option<f64>)]) -> SweepTable {
        let t0 = Utc.with_ymd_and_hms(2025, 9, 7, 0, 0, 0).unwrap();
        let p = params(vec![0.0], vec![0]);
        let fut: Vec<Option<f64>> = rows.iter().map(|r| r.2).collect();
        let dd: Vec<Option<f64>> = rows.iter().map(|r| r.3).collect();
        let label = fut
            .iter()
            .zip(&dd)
            .map(|(m, d)| match (m, d) {
                (Some(m), Some(d)) => Some(window_label(*m, *d, p.tp_pct, p.dd_guard)),
                _ => None,
            })
            .collect();
        SweepTable {
            horizon_tag: "1h".to_string(),
            pair: vec!["BTC-USD".to_string(); rows.len()],
            window_start: (0..rows.len() as i64)
                .map(|i| t0 + Duration::minutes(15 * i))
                .collect(),
            whale_imbalance: rows.iter().map(|r| r.0).collect(),
            whale_buy_count: rows.iter().map(|r| r.1).collect(),
            fut_max_ret: fut,
            fwd_dd: Some(dd),
            label: Some(LabelColumn {
                name: p.label_column(),
                values: label,
            }),
        }
    }

    fn sample() -> SweepTable {
        table(&[
            (0.50, 3, Some(0.030), Some(-0.010)), // fires, bullish
            (0.40, 1, Some(0.010), Some(-0.010)), // fires at count 1, not bullish
            (0.10, 5, Some(0.050), Some(-0.020)), // only at low imbalance
            (0.60, 4, Some(0.025), Some(-0.080)), // fires, guard broken
            (0.90, 6, None, None),                // fires but undefined tail
        ])
    }

    #[test]
    fn single_cell_statistics() {
        let results = evaluate_signal(&sample(), &params(vec![0.3], vec![1]), 0.3, 3).unwrap();
        assert_eq!(results.len(), 1);
        let r = &results[0];
        assert_eq!(r.fired, 3);
        assert_eq!(r.signals, 2);
        assert!((r.coverage - 3.0 / 5.0).abs() < 1e-12);
        assert!((r.precision - 0.5).abs() < 1e-12);
        let gross = (0.030 + 0.025) / 2.0;
        assert!((r.avg_gross_return.unwrap() - gross).abs() < 1e-12);
        assert!((r.avg_net_return.unwrap() - (gross - 0.002)).abs() < 1e-12);
    }

    #[test]
    fn zero_fire_cells_report_undefined_returns() {
        let results = evaluate_signal(&sample(), &params(vec![0.0], vec![0]), 0.95, 1).unwrap();
        let r = &results[0];
        assert_eq!(r.signals, 0);
        assert_eq!(r.fired, 0);
        assert_eq!(r.precision, 0.0);
        assert_eq!(r.coverage, 0.0);
        assert_eq!(r.avg_gross_return, None);
        assert_eq!(r.avg_net_return, None);
    }

    #[test]
    fn tail_only_fires_count_toward_coverage_not_signals() {
        let results = evaluate_signal(&sample(), &params(vec![0.0], vec![0]), 0.85, 1).unwrap();
        let r = &results[0];
        assert_eq!(r.fired, 1);
        assert_eq!(r.signals, 0);
        assert!((r.coverage - 0.2).abs() < 1e-12);
        assert_eq!(r.avg_net_return, None);
    }

    #[test]
    fn coverage_is_monotone_in_imbalance_threshold() {
        let grid: Vec<f64> = (0..=20).map(|i| i as f64 * 0.05).collect();
        let results = sweep(&sample(), &params(grid, vec![0, 1, 3, 5])).unwrap();
        for min_count in [0u64, 1, 3, 5] {
            let mut cells: Vec<&SweepResult> =
                results.iter().filter(|r| r.min_count == min_count).collect();
            cells.sort_by(|a, b| a.imb_threshold.total_cmp(&b.imb_threshold));
            for pair in cells.windows(2) {
                assert!(
                    pair[0].coverage >= pair[1].coverage,
                    "coverage rose from imb {} to {}",
                    pair[0].imb_threshold,
                    pair[1].imb_threshold
                );
            }
        }
    }

    #[test]
    fn fallback_matches_stored_label_column() {
        let with_label = sample();
        let mut without = with_label.clone();
        without.label = None;

        let p = params(vec![0.0, 0.2, 0.45], vec![1, 2, 4]);
        assert_eq!(sweep(&with_label, &p).unwrap(), sweep(&without, &p).unwrap());
    }

    #[test]
    fn stale_label_column_is_ignored_for_other_targets() {
        let mut p = params(vec![0.3], vec![1]);
        p.tp_pct = 0.028;
        // Stored column was built with tp=0.02; the 0.028 target is recomputed.
        let results = sweep(&sample(), &p).unwrap();
        let r = &results[0];
        assert_eq!(r.signals, 3);
        assert!((r.precision - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn missing_label_and_drawdown_is_a_missing_dependency() {
        let mut t = sample();
        t.label = None;
        t.fwd_dd = None;
        let err = sweep(&t, &params(vec![0.3], vec![1])).expect_err("no label source");
        match err {
            PipelineError::MissingDependency { artifact, stage } => {
                assert_eq!(artifact, "label_bull_1h_2pct_dd5pct");
                assert_eq!(stage, "label");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn first_touch_sweep_never_falls_back_to_window_labels() {
        let mut p = params(vec![0.3], vec![1]);
        p.label_mode = LabelMode::FirstTouch;
        assert!(matches!(
            sweep(&sample(), &p),
            Err(PipelineError::MissingDependency { .. })
        ));
    }

    #[test]
    fn ranking_orders_by_precision_then_net_then_signals() {
        let results = sweep(&sample(), &params(vec![0.05, 0.3, 0.45, 0.95], vec![1, 3])).unwrap();
        for pair in results.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(a.precision >= b.precision);
            if a.precision == b.precision {
                match (a.avg_net_return, b.avg_net_return) {
                    (Some(x), Some(y)) => assert!(x >= y),
                    (None, Some(_)) => panic!("undefined net ranked above defined"),
                    _ => {}
                }
            }
        }
        let last = results.last().unwrap();
        assert_eq!(last.signals, 0);
    }

    #[test]
    fn ranking_ties_keep_grid_order() {
        let mut rows = vec![
            SweepResult {
                pair: "X".into(),
                horizon: "1h".into(),
                imb_threshold: 0.1,
                min_count: 1,
                fired: 0,
                signals: 0,
                coverage: 0.0,
                precision: 0.0,
                avg_gross_return: None,
                avg_net_return: None,
            };
            3
        ];
        rows[1].imb_threshold = 0.2;
        rows[2].imb_threshold = 0.3;
        rank_results(&mut rows);
        let order: Vec<f64> = rows.iter().map(|r| r.imb_threshold).collect();
        assert_eq!(order, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn rejects_empty_grids_and_horizon_mismatch() {
        assert!(matches!(
            sweep(&sample(), &params(vec![], vec![1])),
            Err(PipelineError::Config(_))
        ));
        let mut p = params(vec![0.1], vec![1]);
        p.horizon.tag = "4h".to_string();
        assert!(matches!(sweep(&sample(), &p), Err(PipelineError::Config(_))));
    }

    #[test]
    fn near_misses_rank_by_imbalance() {
        let peek = near_misses(&sample(), 2);
        let imbs: Vec<f64> = peek.iter().map(|p| p.whale_imbalance).collect();
        assert_eq!(imbs, vec![0.90, 0.60]);
    }
}
