//! Stage entry points: one bulk read, one call into the pure core, one bulk
//! write.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::bars::aggregate;
use crate::config::Config;
use crate::frame::{
    bars_from_frame, bars_to_frame, labeled_to_frame, sweep_results_to_frame,
    sweep_table_from_frame,
};
use crate::ingest::{IngestSummary, ingest_jsonl, load_trades};
use crate::labels::label;
use crate::storage::{TableReceipt, TableStore};
use crate::sweep::{NearMiss, SweepResult, evaluate_signal, near_misses, sweep};

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub horizon: String,
    pub table: TableReceipt,
    pub csv: TableReceipt,
    /// Ranked best first.
    pub results: Vec<SweepResult>,
}

/// Sidecar written next to each sweep table.
#[derive(Debug, Serialize)]
struct SweepManifest<'a> {
    config: &'a Config,
    horizon: &'a str,
    label_column: String,
    label_source: &'static str,
    table: &'a TableReceipt,
    csv: &'a TableReceipt,
}

#[derive(Debug, Clone, Serialize)]
pub struct BaselineReport {
    pub horizon: String,
    pub imb_threshold: f64,
    pub min_count: u64,
    /// One row per pair.
    pub results: Vec<SweepResult>,
    /// Filled only when the signal never fires on a scorable bar.
    pub near_misses: Vec<NearMiss>,
}

pub fn run_ingest(config: &Config, raw_dir: &Path) -> Result<IngestSummary> {
    let store = TableStore::new(&config.data_dir);
    ingest_jsonl(raw_dir, &store.parquet_root())
}

pub fn run_build_bars(config: &Config) -> Result<TableReceipt> {
    let start = Instant::now();
    let store = TableStore::new(&config.data_dir);
    let trades = load_trades(&store.parquet_root(), &config.pair)?;
    let bars = aggregate(&trades, &config.aggregate_params())?;
    if bars.is_empty() {
        warn!(pair = %config.pair, "No trades for pair; writing an empty bars table");
    }
    let mut df = bars_to_frame(&bars)?;
    let receipt = store.write_parquet(&store.bars_path(&config.pair, config.bar_width), &mut df)?;
    info!(
        pair = %config.pair,
        bar = %config.bar_width,
        whale_usd = config.whale_usd,
        trades = trades.len(),
        bars = bars.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Bars built"
    );
    Ok(receipt)
}

pub fn run_label(config: &Config) -> Result<TableReceipt> {
    let start = Instant::now();
    let store = TableStore::new(&config.data_dir);
    let bars_path = store.bars_path(&config.pair, config.bar_width);
    let bars = bars_from_frame(&store.read_parquet(&bars_path, "build")?)
        .with_context(|| format!("Unable to decode bars table {}", bars_path.display()))?;
    let labeled = label(&bars, &config.label_params())?;
    let mut df = labeled_to_frame(&labeled)?;
    let receipt = store.write_parquet(&store.labels_path(&config.pair, config.bar_width), &mut df)?;
    info!(
        pair = %config.pair,
        mode = ?config.label_mode,
        horizons = labeled.horizons.len(),
        rows = labeled.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Labels written"
    );
    Ok(receipt)
}

pub fn run_sweep(config: &Config, horizon_tag: &str) -> Result<SweepReport> {
    let start = Instant::now();
    let store = TableStore::new(&config.data_dir);
    let params = config.sweep_params(horizon_tag)?;
    let labels_path = store.labels_path(&config.pair, config.bar_width);
    let table = sweep_table_from_frame(&store.read_parquet(&labels_path, "label")?, &params)
        .with_context(|| format!("Unable to decode labels table {}", labels_path.display()))?;
    let label_source = if table.label.is_some() {
        "stored"
    } else {
        info!(
            column = %params.label_column(),
            "Label column not stored for these targets; recomputing from forward extremes"
        );
        "recomputed"
    };

    let results = sweep(&table, &params)?;
    let mut df = sweep_results_to_frame(&results)?;
    let table_receipt = store.write_parquet(&store.sweep_path(&config.pair, horizon_tag), &mut df)?;
    let csv_receipt = store.write_csv(&store.sweep_csv_path(&config.pair, horizon_tag), &mut df)?;
    store.write_json(
        &store.sweep_manifest_path(&config.pair, horizon_tag),
        &SweepManifest {
            config,
            horizon: horizon_tag,
            label_column: params.label_column(),
            label_source,
            table: &table_receipt,
            csv: &csv_receipt,
        },
    )?;
    info!(
        pair = %config.pair,
        horizon = horizon_tag,
        cells = results.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Sweep complete"
    );
    Ok(SweepReport {
        horizon: horizon_tag.to_string(),
        table: table_receipt,
        csv: csv_receipt,
        results,
    })
}

/// Score one `(imb, min_count)` signal; nothing is written.
pub fn run_baseline(
    config: &Config,
    horizon_tag: &str,
    imb: f64,
    min_count: u64,
    peek: usize,
) -> Result<BaselineReport> {
    let store = TableStore::new(&config.data_dir);
    let params = config.sweep_params(horizon_tag)?;
    let labels_path = store.labels_path(&config.pair, config.bar_width);
    let table = sweep_table_from_frame(&store.read_parquet(&labels_path, "label")?, &params)
        .with_context(|| format!("Unable to decode labels table {}", labels_path.display()))?;

    let results = evaluate_signal(&table, &params, imb, min_count)?;
    let fired_on_nothing = results.iter().all(|r| r.signals == 0);
    let near = if fired_on_nothing {
        warn!(
            horizon = horizon_tag,
            imb,
            min_count,
            "Signal never fired on a scorable bar"
        );
        near_misses(&table, peek)
    } else {
        Vec::new()
    };
    for r in &results {
        info!(
            pair = %r.pair,
            horizon = %r.horizon,
            signals = r.signals,
            coverage = r.coverage,
            precision = r.precision,
            avg_net = ?r.avg_net_return,
            "Baseline evaluated"
        );
    }
    Ok(BaselineReport {
        horizon: horizon_tag.to_string(),
        imb_threshold: imb,
        min_count,
        results,
        near_misses: near,
    })
}

/// Build, label and sweep every configured horizon from the ingested trades.
pub fn run_all(config: &Config) -> Result<Vec<SweepReport>> {
    run_build_bars(config)?;
    run_label(config)?;
    config
        .horizons
        .iter()
        .map(|h| run_sweep(config, &h.tag))
        .collect()
}
