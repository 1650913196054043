use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::{Duration, SecondsFormat, TimeZone, Utc};
use serde_json::json;
use tempfile::tempdir;
use whalebars_rs::config::{BarWidth, Config, LabelMode, parse_horizons};
use whalebars_rs::frame::bars_from_frame;
use whalebars_rs::pipeline::{run_all, run_baseline, run_build_bars, run_ingest, run_label, run_sweep};
use whalebars_rs::{PipelineError, TableStore};

const BARS: i64 = 48;

/// Twelve hours of 15m bars: a slow sine drift, one small buy and one small
/// sell per bar, a whale buy every third bar and a whale sell every fifth.
fn write_session(raw_dir: &Path) -> Result<()> {
    fs::create_dir_all(raw_dir)?;
    let t0 = Utc.with_ymd_and_hms(2025, 9, 7, 0, 0, 0).unwrap();
    let mut lines = Vec::new();
    let mut id = 0i64;
    let mut push = |minute: i64, price: f64, size: f64, side: &str| {
        id += 1;
        let time = t0 + Duration::minutes(minute);
        lines.push(
            json!({
                "pair": "BTC-USD",
                "time": time.to_rfc3339_opts(SecondsFormat::Micros, true),
                "trade_id": id,
                "price": price,
                "size": size,
                "side": side,
            })
            .to_string(),
        );
    };
    for bar in 0..BARS {
        let base = 100.0 + 4.0 * (bar as f64 / 5.0).sin();
        let m = bar * 15;
        push(m + 1, base, 0.5, "buy");
        push(m + 4, base * 1.004, 0.3, "sell");
        if bar % 3 == 0 {
            push(m + 7, base * 0.998, 30.0, "buy");
        }
        if bar % 5 == 0 {
            push(m + 10, base * 1.001, 25.0, "sell");
        }
        push(m + 14, base * 1.002, 0.2, "buy");
    }
    fs::write(raw_dir.join("session.jsonl"), lines.join("\n") + "\n")?;
    Ok(())
}

fn config(data_dir: &Path) -> Config {
    let bar_width = BarWidth::parse("15m").unwrap();
    Config {
        data_dir: data_dir.to_path_buf(),
        bar_width,
        horizons: parse_horizons("1h,2h", bar_width).unwrap(),
        tp_pct: 0.01,
        dd_guard: -0.02,
        ..Config::default()
    }
}

#[test]
fn stages_chain_from_capture_to_ranked_sweep() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    write_session(&dir.path().join("raw"))?;

    let ingest = run_ingest(&config, &dir.path().join("raw"))?;
    assert_eq!(ingest.unique_rows, ingest.raw_rows);

    let bars_receipt = run_build_bars(&config)?;
    assert_eq!(bars_receipt.rows, BARS as usize);

    let store = TableStore::new(dir.path());
    let bars = bars_from_frame(&store.read_parquet(&bars_receipt.path, "build")?)?;
    assert!(bars.windows(2).all(|w| w[0].window_start < w[1].window_start));
    assert_eq!(bars[0].whale_buy_count, 1);
    assert_eq!(bars[0].whale_sell_count, 1);
    assert_eq!(bars[1].whale_buy_count, 0);
    assert_eq!(bars[1].whale_imbalance, 0.0);

    let labels_receipt = run_label(&config)?;
    assert_eq!(labels_receipt.rows, BARS as usize);
    let labels = store.read_parquet(&labels_receipt.path, "label")?;
    assert_eq!(labels.column("fut_max_ret_1h")?.null_count(), 4);
    assert_eq!(labels.column("fwd_dd_2h")?.null_count(), 8);
    assert_eq!(labels.column("label_bull_2h_1pct_dd2pct")?.null_count(), 8);

    let report = run_sweep(&config, "1h")?;
    assert_eq!(report.results.len(), 6 * 5);
    assert!(report.csv.path.exists());
    assert!(store.sweep_manifest_path("BTC-USD", "1h").exists());
    for pair in report.results.windows(2) {
        assert!(pair[0].precision >= pair[1].precision);
    }
    for r in &report.results {
        assert!(r.signals <= r.fired);
        assert!((0.0..=1.0).contains(&r.coverage));
        match r.avg_gross_return {
            Some(gross) => {
                let net = r.avg_net_return.expect("net defined with gross");
                assert!((gross - net - 2.0 * config.fee_per_side).abs() < 1e-12);
            }
            None => assert_eq!(r.signals, 0),
        }
    }
    Ok(())
}

#[test]
fn reruns_reproduce_identical_fingerprints() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    write_session(&dir.path().join("raw"))?;
    run_ingest(&config, &dir.path().join("raw"))?;

    let first = run_all(&config)?;
    let bars_first = run_build_bars(&config)?;
    let labels_first = run_label(&config)?;

    run_ingest(&config, &dir.path().join("raw"))?;
    let second = run_all(&config)?;
    assert_eq!(run_build_bars(&config)?, bars_first);
    assert_eq!(run_label(&config)?, labels_first);

    let fingerprints = |reports: &[whalebars_rs::pipeline::SweepReport]| {
        reports
            .iter()
            .map(|r| r.table.sha256.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(fingerprints(&first), fingerprints(&second));
    assert_eq!(first.len(), 2);
    Ok(())
}

#[test]
fn changed_targets_are_recomputed_from_stored_extremes() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    write_session(&dir.path().join("raw"))?;
    run_ingest(&config, &dir.path().join("raw"))?;
    run_build_bars(&config)?;
    run_label(&config)?;

    // Label table was built for tp=1%; sweep a 0.5% target without relabeling.
    let looser = Config {
        tp_pct: 0.005,
        ..config.clone()
    };
    let recomputed = run_sweep(&looser, "2h")?;

    run_label(&looser)?;
    let stored = run_sweep(&looser, "2h")?;
    assert_eq!(recomputed.results, stored.results);
    Ok(())
}

#[test]
fn first_touch_sweep_needs_first_touch_labels() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    write_session(&dir.path().join("raw"))?;
    run_ingest(&config, &dir.path().join("raw"))?;
    run_build_bars(&config)?;
    run_label(&config)?;

    let first_touch = Config {
        label_mode: LabelMode::FirstTouch,
        ..config.clone()
    };
    let err = run_sweep(&first_touch, "1h").expect_err("only window labels stored");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MissingDependency { stage: "label", .. })
    ));

    run_label(&first_touch)?;
    let report = run_sweep(&first_touch, "1h")?;
    assert_eq!(report.results.len(), 30);
    Ok(())
}

#[test]
fn stages_run_out_of_order_name_their_upstream() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());

    let err = run_build_bars(&config).expect_err("nothing ingested");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MissingDependency { stage: "ingest", .. })
    ));
    let err = run_label(&config).expect_err("no bars table");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MissingDependency { stage: "build", .. })
    ));
    let err = run_sweep(&config, "1h").expect_err("no labels table");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::MissingDependency { stage: "label", .. })
    ));
    let err = run_sweep(&config, "3h").expect_err("horizon not configured");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::Config(_))
    ));
    Ok(())
}

#[test]
fn baseline_peeks_when_signal_never_fires() -> Result<()> {
    let dir = tempdir()?;
    let config = config(dir.path());
    write_session(&dir.path().join("raw"))?;
    run_ingest(&config, &dir.path().join("raw"))?;
    run_build_bars(&config)?;
    run_label(&config)?;

    let quiet = run_baseline(&config, "1h", 0.99, 50, 5)?;
    assert_eq!(quiet.results.len(), 1);
    assert_eq!(quiet.results[0].signals, 0);
    assert_eq!(quiet.results[0].avg_net_return, None);
    assert_eq!(quiet.near_misses.len(), 5);
    assert!(quiet
        .near_misses
        .windows(2)
        .all(|w| w[0].whale_imbalance >= w[1].whale_imbalance));

    let active = run_baseline(&config, "1h", 0.10, 1, 5)?;
    assert!(active.results[0].signals > 0);
    assert!(active.near_misses.is_empty());
    Ok(())
}
