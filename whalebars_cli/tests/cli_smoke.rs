use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use anyhow::Result;
use chrono::{Duration, SecondsFormat, TimeZone, Utc};
use tempfile::tempdir;

fn whalebars(data_dir: &Path, args: &[&str]) -> Result<Output> {
    let output = Command::new(env!("CARGO_BIN_EXE_whalebars"))
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--no-file-log")
        .args(args)
        .env("RUST_LOG", "warn")
        .output()?;
    Ok(output)
}

fn write_capture(raw_dir: &Path) -> Result<()> {
    fs::create_dir_all(raw_dir)?;
    let t0 = Utc.with_ymd_and_hms(2025, 9, 8, 0, 0, 0).unwrap();
    let mut lines = Vec::new();
    for i in 0..96i64 {
        let price = 100.0 + (i % 12) as f64 * 0.4;
        let (size, side) = if i % 4 == 0 { (25.0, "buy") } else { (0.3, "sell") };
        let time = (t0 + Duration::minutes(i * 5)).to_rfc3339_opts(SecondsFormat::Micros, true);
        lines.push(format!(
            r#"{{"pair":"BTC-USD","time":"{time}","trade_id":{id},"price":{price},"size":{size},"side":"{side}"}}"#,
            id = i + 1
        ));
    }
    fs::write(raw_dir.join("capture.jsonl"), lines.join("\n") + "\n")?;
    Ok(())
}

#[test]
fn cli_ingests_and_runs_the_full_chain() -> Result<()> {
    let dir = tempdir()?;
    write_capture(&dir.path().join("raw"))?;

    let ingest = whalebars(dir.path(), &["ingest"])?;
    assert!(
        ingest.status.success(),
        "ingest failed: {}",
        String::from_utf8_lossy(&ingest.stderr)
    );
    assert!(dir.path().join("parquet").join("pair=BTC-USD").is_dir());

    let run = whalebars(dir.path(), &["run", "--horizons", "1h,2h", "--tp-pct", "0.01"])?;
    assert!(
        run.status.success(),
        "run failed: {}",
        String::from_utf8_lossy(&run.stderr)
    );
    let reports = dir.path().join("reports");
    assert!(reports.join("BTC-USD_sweep_1h.csv").is_file());
    assert!(reports.join("BTC-USD_sweep_2h.parquet").is_file());
    assert!(dir.path().join("features").join("BTC-USD_labels_15m.parquet").is_file());
    assert!(!dir.path().join("whalebars.log").exists());

    let csv = fs::read_to_string(reports.join("BTC-USD_sweep_1h.csv"))?;
    let header = csv.lines().next().unwrap_or_default();
    assert!(header.starts_with("rank,pair,horizon,imb_threshold,min_count"));
    assert_eq!(csv.lines().count(), 1 + 6 * 5);

    let baseline = whalebars(
        dir.path(),
        &["baseline", "--horizons", "1h,2h", "--tp-pct", "0.01", "--horizon", "1h", "--imb", "0.5"],
    )?;
    assert!(
        baseline.status.success(),
        "baseline failed: {}",
        String::from_utf8_lossy(&baseline.stderr)
    );
    Ok(())
}

#[test]
fn cli_reports_missing_upstream_stage() -> Result<()> {
    let dir = tempdir()?;
    let output = whalebars(dir.path(), &["label"])?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("run the `build` stage first"),
        "unexpected stderr: {stderr}"
    );
    Ok(())
}

#[test]
fn cli_rejects_misaligned_horizons() -> Result<()> {
    let dir = tempdir()?;
    let output = whalebars(dir.path(), &["build", "--horizons", "20m"])?;
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--horizons"), "unexpected stderr: {stderr}");
    Ok(())
}
