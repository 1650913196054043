use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};

use whalebars_rs::config::{
    BarWidth, Config, DEFAULT_DD_GUARD, DEFAULT_FEE_PER_SIDE, DEFAULT_HORIZONS, DEFAULT_PAIR,
    DEFAULT_TP_PCT, DEFAULT_WHALE_USD, LabelMode, parse_horizons,
};

/// The single-signal baseline charges taker fees unless told otherwise.
const DEFAULT_BASELINE_FEE_PER_SIDE: f64 = 0.001;

#[derive(Parser, Debug)]
#[command(
    name = "whalebars",
    version,
    about = "Whale order-flow bars, forward breakout labels and threshold sweeps"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Root directory holding raw/, parquet/, features/ and reports/
    #[arg(
        long = "data-dir",
        global = true,
        default_value = "data",
        value_hint = clap::ValueHint::DirPath
    )]
    pub data_dir: PathBuf,

    /// Disable writing whalebars.log into the data directory. When set,
    /// logs are only emitted to stdout.
    #[arg(long = "no-file-log", global = true, default_value_t = false)]
    pub no_file_log: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Deduplicate raw JSONL trade captures into partitioned Parquet
    Ingest(IngestArgs),
    /// Aggregate one pair's trades into fixed-width bars
    Build(StageArgs),
    /// Attach forward returns and bull-breakout labels to the bars
    Label(StageArgs),
    /// Score a single (imbalance, whale count) signal
    Baseline(BaselineArgs),
    /// Grid-search signal thresholds and rank them
    Sweep(SweepArgs),
    /// build, label, then sweep every horizon
    Run(StageArgs),
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Directory of *.jsonl capture files (defaults to <data-dir>/raw)
    #[arg(long = "raw-dir", value_hint = clap::ValueHint::DirPath)]
    pub raw_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StageArgs {
    /// Product id, e.g. BTC-USD
    #[arg(long, default_value = DEFAULT_PAIR)]
    pub pair: String,

    /// Bar width (30s, 15m, 15min, 1h, 1d)
    #[arg(long, default_value = "15m")]
    pub bar: String,

    /// Notional (price * size, USD) at or above which a print is a whale
    #[arg(long = "whale-usd", default_value_t = DEFAULT_WHALE_USD)]
    pub whale_usd: f64,

    /// Comma-separated forward horizons; durations or bare bar-step counts
    #[arg(long, default_value = DEFAULT_HORIZONS)]
    pub horizons: String,

    /// Take-profit target as a fraction (0.05 = 5%)
    #[arg(long = "tp-pct", default_value_t = DEFAULT_TP_PCT)]
    pub tp_pct: f64,

    /// Forward drawdown guard as a negative fraction
    #[arg(long = "dd-guard", default_value_t = DEFAULT_DD_GUARD, allow_hyphen_values = true)]
    pub dd_guard: f64,

    /// Fee per side as a fraction; a round trip pays it twice
    #[arg(long)]
    pub fee: Option<f64>,

    /// Imbalance thresholds to sweep
    #[arg(
        long = "imb-grid",
        value_delimiter = ',',
        default_value = "0.10,0.15,0.20,0.25,0.30,0.35"
    )]
    pub imb_grid: Vec<f64>,

    /// Minimum whale buy counts to sweep
    #[arg(long = "count-grid", value_delimiter = ',', default_value = "1,2,3,4,5")]
    pub count_grid: Vec<u64>,

    /// How a bar's forward window is turned into a label
    #[arg(long = "label-mode", value_enum, default_value = "window")]
    pub label_mode: LabelModeValue,

    /// Number of ranked sweep rows printed per horizon
    #[arg(long = "top-k", alias = "report-top", default_value_t = 15)]
    pub top_k: usize,
}

#[derive(Args, Debug)]
pub struct BaselineArgs {
    #[command(flatten)]
    pub stage: StageArgs,

    /// Forward horizon to score against
    #[arg(long, default_value = "4h")]
    pub horizon: String,

    /// Whale imbalance threshold
    #[arg(long, default_value_t = 0.30, allow_hyphen_values = true)]
    pub imb: f64,

    /// Minimum whale buy count
    #[arg(long = "min-count", default_value_t = 3)]
    pub min_count: u64,

    /// Bars to show by imbalance when the signal never fires
    #[arg(long, default_value_t = 5)]
    pub peek: usize,
}

#[derive(Args, Debug)]
pub struct SweepArgs {
    #[command(flatten)]
    pub stage: StageArgs,

    /// Single horizon to sweep (all configured horizons when omitted)
    #[arg(long)]
    pub horizon: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LabelModeValue {
    Window,
    #[value(name = "first-touch")]
    FirstTouch,
}

impl LabelModeValue {
    fn to_mode(self) -> LabelMode {
        match self {
            LabelModeValue::Window => LabelMode::Window,
            LabelModeValue::FirstTouch => LabelMode::FirstTouch,
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Cli as Parser>::parse()
    }
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Ingest(_) => "ingest",
            Commands::Build(_) => "build",
            Commands::Label(_) => "label",
            Commands::Baseline(_) => "baseline",
            Commands::Sweep(_) => "sweep",
            Commands::Run(_) => "run",
        }
    }
}

impl GlobalArgs {
    pub fn log_file(&self) -> Option<PathBuf> {
        if self.no_file_log {
            None
        } else {
            Some(self.data_dir.join("whalebars.log"))
        }
    }
}

impl StageArgs {
    pub fn into_config(self, global: &GlobalArgs) -> Result<Config> {
        self.into_config_with_fee(global, DEFAULT_FEE_PER_SIDE)
    }

    fn into_config_with_fee(self, global: &GlobalArgs, default_fee: f64) -> Result<Config> {
        let pair = self.pair.trim().to_string();
        if pair.is_empty() {
            return Err(anyhow!("--pair must not be empty"));
        }
        let bar_width = BarWidth::parse(&self.bar)
            .with_context(|| format!("Invalid --bar value '{}'", self.bar))?;
        let horizons = parse_horizons(&self.horizons, bar_width)
            .with_context(|| format!("Invalid --horizons value '{}'", self.horizons))?;

        let config = Config {
            data_dir: global.data_dir.clone(),
            pair,
            bar_width,
            whale_usd: self.whale_usd,
            horizons,
            tp_pct: self.tp_pct,
            dd_guard: self.dd_guard,
            fee_per_side: self.fee.unwrap_or(default_fee),
            imb_grid: self.imb_grid,
            count_grid: self.count_grid,
            label_mode: self.label_mode.to_mode(),
            report_top: self.top_k,
        };
        config.aggregate_params().validate()?;
        config.label_params().validate()?;
        Ok(config)
    }
}

impl BaselineArgs {
    pub fn into_config(self, global: &GlobalArgs) -> Result<(Config, BaselineSignal)> {
        let signal = BaselineSignal {
            horizon: self.horizon,
            imb: self.imb,
            min_count: self.min_count,
            peek: self.peek,
        };
        let config = self
            .stage
            .into_config_with_fee(global, DEFAULT_BASELINE_FEE_PER_SIDE)?;
        config.horizon(&signal.horizon)?;
        Ok((config, signal))
    }
}

#[derive(Debug, Clone)]
pub struct BaselineSignal {
    pub horizon: String,
    pub imb: f64,
    pub min_count: u64,
    pub peek: usize,
}
