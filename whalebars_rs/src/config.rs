use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, StageResult};

pub const DEFAULT_PAIR: &str = "BTC-USD";
pub const DEFAULT_WHALE_USD: f64 = 2_000.0;
pub const DEFAULT_TP_PCT: f64 = 0.05;
pub const DEFAULT_DD_GUARD: f64 = -0.015;
pub const DEFAULT_FEE_PER_SIDE: f64 = 0.0005;
pub const DEFAULT_HORIZONS: &str = "2h,4h,8h,24h";

/// Fixed bar width, stored in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BarWidth {
    secs: i64,
}

impl BarWidth {
    pub fn from_secs(secs: i64) -> StageResult<Self> {
        if secs <= 0 {
            return Err(PipelineError::config(format!(
                "bar width must be positive (got {secs}s)"
            )));
        }
        Ok(Self { secs })
    }

    /// Accepts `30s`, `15m`, `15min`, `1h`, `4h`, `1d`.
    pub fn parse(raw: &str) -> StageResult<Self> {
        Self::from_secs(parse_duration_secs(raw)?)
    }

    pub fn secs(self) -> i64 {
        self.secs
    }

    pub fn millis(self) -> i64 {
        self.secs * 1_000
    }

    pub fn tag(self) -> String {
        duration_tag(self.secs)
    }
}

impl Default for BarWidth {
    fn default() -> Self {
        Self { secs: 15 * 60 }
    }
}

impl fmt::Display for BarWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Forward horizon measured in bar steps.
///
/// `tag` is the canonical wall-clock name (`4h` for 16 steps of 15m) and is
/// what label and return columns are keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Horizon {
    pub tag: String,
    pub steps: usize,
}

impl Horizon {
    pub fn from_steps(steps: usize, bar: BarWidth) -> StageResult<Self> {
        if steps == 0 {
            return Err(PipelineError::config("horizon step count must be positive"));
        }
        let secs = i64::try_from(steps)
            .ok()
            .and_then(|s| s.checked_mul(bar.secs()))
            .ok_or_else(|| PipelineError::config(format!("horizon of {steps} steps overflows")))?;
        Ok(Self {
            tag: duration_tag(secs),
            steps,
        })
    }

    /// A bare integer is a step count; anything else is a duration that must
    /// be a whole multiple of the bar width.
    pub fn parse(raw: &str, bar: BarWidth) -> StageResult<Self> {
        let token = raw.trim();
        if !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
            let steps: usize = token
                .parse()
                .map_err(|_| PipelineError::config(format!("invalid horizon step count '{token}'")))?;
            return Self::from_steps(steps, bar);
        }
        let secs = parse_duration_secs(token)?;
        if secs % bar.secs() != 0 {
            return Err(PipelineError::config(format!(
                "horizon '{token}' is not a whole number of {bar} bars"
            )));
        }
        let steps = usize::try_from(secs / bar.secs())
            .map_err(|_| PipelineError::config(format!("invalid horizon '{token}'")))?;
        Self::from_steps(steps, bar)
    }
}

pub fn parse_horizons(list: &str, bar: BarWidth) -> StageResult<Vec<Horizon>> {
    let mut out: Vec<Horizon> = Vec::new();
    for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let horizon = Horizon::parse(token, bar)?;
        if out.iter().any(|h| h.tag == horizon.tag) {
            return Err(PipelineError::config(format!(
                "horizon '{}' listed more than once",
                horizon.tag
            )));
        }
        out.push(horizon);
    }
    if out.is_empty() {
        return Err(PipelineError::config("at least one horizon is required"));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMode {
    /// Target and guard are checked against the forward window's extremes
    /// independently. A bar can label bullish even if price broke the guard
    /// after the target was reached.
    #[default]
    Window,
    /// Walk the forward window in time order; the guard only has to hold
    /// until the first bar whose high reaches the target. A bar touching both
    /// counts as a guard breach.
    FirstTouch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub pair: String,
    pub bar_width: BarWidth,
    /// Trades with notional (price * size) at or above this are whales.
    pub whale_usd: f64,
    pub horizons: Vec<Horizon>,
    pub tp_pct: f64,
    /// Forward drawdown guard, a negative fraction.
    pub dd_guard: f64,
    pub fee_per_side: f64,
    pub imb_grid: Vec<f64>,
    pub count_grid: Vec<u64>,
    #[serde(default)]
    pub label_mode: LabelMode,
    #[serde(default = "default_report_top")]
    pub report_top: usize,
}

impl Default for Config {
    fn default() -> Self {
        let bar_width = BarWidth::default();
        Self {
            data_dir: PathBuf::from("data"),
            pair: DEFAULT_PAIR.to_string(),
            bar_width,
            whale_usd: DEFAULT_WHALE_USD,
            horizons: [8usize, 16, 32, 96]
                .iter()
                .filter_map(|steps| Horizon::from_steps(*steps, bar_width).ok())
                .collect(),
            tp_pct: DEFAULT_TP_PCT,
            dd_guard: DEFAULT_DD_GUARD,
            fee_per_side: DEFAULT_FEE_PER_SIDE,
            imb_grid: vec![0.10, 0.15, 0.20, 0.25, 0.30, 0.35],
            count_grid: vec![1, 2, 3, 4, 5],
            label_mode: LabelMode::Window,
            report_top: default_report_top(),
        }
    }
}

impl Config {
    pub fn aggregate_params(&self) -> AggregateParams {
        AggregateParams {
            bar_width: self.bar_width,
            whale_usd: self.whale_usd,
        }
    }

    pub fn label_params(&self) -> LabelParams {
        LabelParams {
            horizons: self.horizons.clone(),
            tp_pct: self.tp_pct,
            dd_guard: self.dd_guard,
            mode: self.label_mode,
        }
    }

    pub fn horizon(&self, tag: &str) -> StageResult<&Horizon> {
        self.horizons.iter().find(|h| h.tag == tag).ok_or_else(|| {
            PipelineError::config(format!(
                "horizon '{tag}' is not configured (available: {})",
                self.horizons
                    .iter()
                    .map(|h| h.tag.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })
    }

    pub fn sweep_params(&self, horizon_tag: &str) -> StageResult<SweepParams> {
        Ok(SweepParams {
            horizon: self.horizon(horizon_tag)?.clone(),
            imb_grid: self.imb_grid.clone(),
            count_grid: self.count_grid.clone(),
            fee_per_side: self.fee_per_side,
            tp_pct: self.tp_pct,
            dd_guard: self.dd_guard,
            label_mode: self.label_mode,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateParams {
    pub bar_width: BarWidth,
    pub whale_usd: f64,
}

impl AggregateParams {
    pub fn validate(&self) -> StageResult<()> {
        if self.bar_width.secs() <= 0 {
            return Err(PipelineError::config("bar width must be positive"));
        }
        if !self.whale_usd.is_finite() || self.whale_usd < 0.0 {
            return Err(PipelineError::config(format!(
                "whale threshold must be a finite, non-negative USD amount (got {})",
                self.whale_usd
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelParams {
    pub horizons: Vec<Horizon>,
    pub tp_pct: f64,
    pub dd_guard: f64,
    pub mode: LabelMode,
}

impl LabelParams {
    pub fn validate(&self) -> StageResult<()> {
        if self.horizons.is_empty() {
            return Err(PipelineError::config("at least one horizon is required"));
        }
        if let Some(h) = self.horizons.iter().find(|h| h.steps == 0) {
            return Err(PipelineError::config(format!(
                "horizon '{}' has a non-positive step count",
                h.tag
            )));
        }
        validate_target(self.tp_pct, self.dd_guard)
    }

    pub fn label_column(&self, horizon: &Horizon) -> String {
        label_column_name(&horizon.tag, self.tp_pct, self.dd_guard, self.mode)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepParams {
    pub horizon: Horizon,
    pub imb_grid: Vec<f64>,
    pub count_grid: Vec<u64>,
    pub fee_per_side: f64,
    pub tp_pct: f64,
    pub dd_guard: f64,
    pub label_mode: LabelMode,
}

impl SweepParams {
    pub fn validate(&self) -> StageResult<()> {
        if self.horizon.steps == 0 {
            return Err(PipelineError::config("horizon step count must be positive"));
        }
        if self.imb_grid.is_empty() {
            return Err(PipelineError::config("imbalance grid is empty"));
        }
        if self.count_grid.is_empty() {
            return Err(PipelineError::config("minimum whale count grid is empty"));
        }
        if let Some(v) = self.imb_grid.iter().find(|v| !v.is_finite()) {
            return Err(PipelineError::config(format!(
                "imbalance grid contains a non-finite value ({v})"
            )));
        }
        if !self.fee_per_side.is_finite() || self.fee_per_side < 0.0 {
            return Err(PipelineError::config(format!(
                "fee per side must be a finite, non-negative fraction (got {})",
                self.fee_per_side
            )));
        }
        validate_target(self.tp_pct, self.dd_guard)
    }

    pub fn label_column(&self) -> String {
        label_column_name(&self.horizon.tag, self.tp_pct, self.dd_guard, self.label_mode)
    }
}

pub fn validate_target(tp_pct: f64, dd_guard: f64) -> StageResult<()> {
    if !tp_pct.is_finite() || tp_pct <= 0.0 {
        return Err(PipelineError::config(format!(
            "take-profit fraction must be positive (got {tp_pct})"
        )));
    }
    if !dd_guard.is_finite() || dd_guard >= 0.0 {
        return Err(PipelineError::config(format!(
            "drawdown guard must be negative (got {dd_guard})"
        )));
    }
    Ok(())
}

/// `label_bull_4h_5pct_dd1p5pct` for tp=0.05, dd=-0.015 in window mode;
/// first-touch labels use the `label_bull_ft_` prefix.
pub fn label_column_name(horizon_tag: &str, tp_pct: f64, dd_guard: f64, mode: LabelMode) -> String {
    let prefix = match mode {
        LabelMode::Window => "label_bull",
        LabelMode::FirstTouch => "label_bull_ft",
    };
    format!(
        "{prefix}_{horizon_tag}_{}pct_dd{}pct",
        pct_tag(tp_pct),
        pct_tag(dd_guard)
    )
}

fn pct_tag(fraction: f64) -> String {
    let pct = (fraction.abs() * 100.0 * 10_000.0).round() / 10_000.0;
    format!("{pct}").replace('.', "p")
}

fn parse_duration_secs(raw: &str) -> StageResult<i64> {
    let token = raw.trim();
    let split = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    let (number, unit) = token.split_at(split);
    let value: i64 = number
        .parse()
        .map_err(|_| PipelineError::config(format!("invalid duration '{token}'")))?;
    let scale = match unit.trim() {
        "s" | "sec" => 1,
        "m" | "min" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => {
            return Err(PipelineError::config(format!(
                "unknown duration unit in '{token}' (use s, m/min, h or d)"
            )))
        }
    };
    if value <= 0 {
        return Err(PipelineError::config(format!(
            "duration must be positive (got '{token}')"
        )));
    }
    value
        .checked_mul(scale)
        .ok_or_else(|| PipelineError::config(format!("duration '{token}' overflows")))
}

fn duration_tag(secs: i64) -> String {
    if secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

const fn default_report_top() -> usize {
    15
}
