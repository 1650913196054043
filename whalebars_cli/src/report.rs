use std::fmt::Write as _;

use whalebars_rs::ingest::IngestSummary;
use whalebars_rs::pipeline::{BaselineReport, SweepReport};
use whalebars_rs::sweep::SweepResult;

fn opt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.3}%", v * 100.0))
}

pub fn format_ingest(summary: &IngestSummary) -> String {
    format!(
        "Ingested {} file(s): {} raw rows, {} unique, {} duplicate(s) dropped, {} partition(s)",
        summary.files,
        summary.raw_rows,
        summary.unique_rows,
        summary.duplicates(),
        summary.partitions
    )
}

fn write_row(buffer: &mut String, rank: usize, row: &SweepResult) {
    let _ = writeln!(
        buffer,
        "  {:>4}  {:<10}  {:>6.2}  {:>5}  {:>7}  {:>7}  {:>8.3}%  {:>9.2}%  {:>10}  {:>10}",
        rank,
        row.pair,
        row.imb_threshold,
        row.min_count,
        row.fired,
        row.signals,
        row.coverage * 100.0,
        row.precision * 100.0,
        opt_pct(row.avg_gross_return),
        opt_pct(row.avg_net_return),
    );
}

fn write_header(buffer: &mut String) {
    let _ = writeln!(
        buffer,
        "  {:>4}  {:<10}  {:>6}  {:>5}  {:>7}  {:>7}  {:>9}  {:>10}  {:>10}  {:>10}",
        "Rank", "Pair", "Imb", "MinN", "Fired", "Signals", "Coverage", "Precision", "AvgGross", "AvgNet",
    );
}

pub fn format_sweep(report: &SweepReport, top: usize) -> String {
    let mut buffer = String::new();
    if report.results.is_empty() {
        let _ = writeln!(buffer, "\nNo bars to sweep for horizon {}", report.horizon);
        return buffer;
    }
    let shown = report.results.len().min(top);
    let _ = writeln!(
        buffer,
        "\nTOP {} OF {} SIGNALS ({} horizon) - precision, then net return, then signals:",
        shown,
        report.results.len(),
        report.horizon
    );
    let _ = writeln!(
        buffer,
        "======================================================================"
    );
    write_header(&mut buffer);
    for (idx, row) in report.results.iter().take(shown).enumerate() {
        write_row(&mut buffer, idx + 1, row);
    }
    let _ = writeln!(
        buffer,
        "Saved {} ({} rows, sha256 {})",
        report.csv.path.display(),
        report.csv.rows,
        report.table.sha256
    );
    buffer
}

pub fn format_baseline(report: &BaselineReport) -> String {
    let mut buffer = String::new();
    let _ = writeln!(
        buffer,
        "\nBASELINE imb >= {:.2} and whale buys >= {} ({} horizon):",
        report.imb_threshold, report.min_count, report.horizon
    );
    write_header(&mut buffer);
    for (idx, row) in report.results.iter().enumerate() {
        write_row(&mut buffer, idx + 1, row);
    }
    if !report.near_misses.is_empty() {
        let _ = writeln!(
            buffer,
            "No scorable signals. Highest-imbalance bars for threshold tuning:"
        );
        for miss in &report.near_misses {
            let _ = writeln!(
                buffer,
                "  {:<10}  {}  imb {:>7.4}  whale buys {}",
                miss.pair,
                miss.window_start.to_rfc3339(),
                miss.whale_imbalance,
                miss.whale_buy_count
            );
        }
    }
    buffer
}
