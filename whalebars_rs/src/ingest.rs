//! Raw trade capture to a deduplicated, partitioned Parquet dataset, and the
//! per-pair loader the bar stage reads from.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use duckdb::Connection;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::trade::{Side, Trade};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub files: usize,
    pub raw_rows: u64,
    pub unique_rows: u64,
    /// Distinct `(pair, date)` partitions written.
    pub partitions: u64,
}

impl IngestSummary {
    pub fn duplicates(&self) -> u64 {
        self.raw_rows.saturating_sub(self.unique_rows)
    }
}

/// Load every `*.jsonl` file in `raw_dir` and replace the dataset at
/// `parquet_root` with one row per `(pair, date, trade_id)`.
///
/// Each line is `{pair, time, trade_id, price, size, side}`. When the same
/// trade id shows up more than once on a day the latest `time` wins. The
/// previous dataset is swapped out only after the new one is fully written.
pub fn ingest_jsonl(raw_dir: &Path, parquet_root: &Path) -> Result<IngestSummary> {
    let files = list_jsonl(raw_dir)?;
    if files.is_empty() {
        warn!(raw_dir = %raw_dir.display(), "No .jsonl trade files found; nothing to ingest");
        return Ok(IngestSummary::default());
    }

    let conn = Connection::open_in_memory().context("Unable to open in-memory DuckDB")?;
    let file_list = files
        .iter()
        .map(|p| sql_literal(&p.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute_batch(&format!(
        "CREATE TEMP TABLE raw_trades AS
         SELECT * FROM read_json([{file_list}],
             format = 'newline_delimited',
             columns = {{pair: 'VARCHAR', time: 'VARCHAR', trade_id: 'BIGINT',
                         price: 'DOUBLE', size: 'DOUBLE', side: 'VARCHAR'}});"
    ))
    .with_context(|| format!("Failed to read trade files under {}", raw_dir.display()))?;

    let raw_rows = count(&conn, "SELECT count(*) FROM raw_trades")?;
    let incomplete = count(
        &conn,
        "SELECT count(*) FROM raw_trades
         WHERE pair IS NULL OR time IS NULL OR trade_id IS NULL
            OR price IS NULL OR size IS NULL OR side IS NULL",
    )?;
    if incomplete > 0 {
        return Err(PipelineError::data(format!(
            "{incomplete} of {raw_rows} raw trade rows are missing required fields"
        ))
        .into());
    }

    conn.execute_batch(
        "CREATE TEMP TABLE trades AS
         SELECT pair, ts, CAST(ts AS DATE) AS date, trade_id, price, size, side
         FROM (
             SELECT pair, CAST(time AS TIMESTAMP) AS ts, trade_id, price, size, side,
                    row_number() OVER (
                        PARTITION BY pair, CAST(CAST(time AS TIMESTAMP) AS DATE), trade_id
                        ORDER BY CAST(time AS TIMESTAMP) DESC
                    ) AS rn
             FROM raw_trades
         )
         WHERE rn = 1;",
    )
    .context("Failed to deduplicate trades")?;

    let unique_rows = count(&conn, "SELECT count(*) FROM trades")?;
    let partitions = count(
        &conn,
        "SELECT count(*) FROM (SELECT DISTINCT pair, date FROM trades)",
    )?;

    let staging = sibling_with_suffix(parquet_root, ".staging");
    remove_dir_if_present(&staging)?;
    if unique_rows > 0 {
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Unable to create {}", parent.display()))?;
        }
        conn.execute_batch(&format!(
            "COPY (SELECT pair, date, ts, trade_id, price, size, side
                   FROM trades ORDER BY pair, ts, trade_id)
             TO {} (FORMAT PARQUET, PARTITION_BY (pair, date));",
            sql_literal(&staging.to_string_lossy())
        ))
        .with_context(|| format!("Failed to write partitions to {}", staging.display()))?;
    } else {
        fs::create_dir_all(&staging)
            .with_context(|| format!("Unable to create {}", staging.display()))?;
    }
    remove_dir_if_present(parquet_root)?;
    fs::rename(&staging, parquet_root).with_context(|| {
        format!(
            "Unable to move {} into place at {}",
            staging.display(),
            parquet_root.display()
        )
    })?;

    let summary = IngestSummary {
        files: files.len(),
        raw_rows,
        unique_rows,
        partitions,
    };
    info!(
        files = summary.files,
        raw_rows = summary.raw_rows,
        unique_rows = summary.unique_rows,
        duplicates = summary.duplicates(),
        partitions = summary.partitions,
        root = %parquet_root.display(),
        "Trades ingested"
    );
    Ok(summary)
}

/// All deduplicated trades of one pair, ordered by `(timestamp, trade_id)`.
pub fn load_trades(parquet_root: &Path, pair: &str) -> Result<Vec<Trade>> {
    let pair_dir = parquet_root.join(format!("pair={pair}"));
    if !pair_dir.is_dir() {
        return Err(PipelineError::missing(
            format!("trade partitions {}", pair_dir.display()),
            "ingest",
        )
        .into());
    }

    let conn = Connection::open_in_memory().context("Unable to open in-memory DuckDB")?;
    let pattern = pair_dir.join("*").join("*.parquet");
    let sql = format!(
        "SELECT epoch_us(ts), trade_id, price, size, side
         FROM read_parquet({}, hive_partitioning = false)
         ORDER BY ts, trade_id",
        sql_literal(&pattern.to_string_lossy())
    );
    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("Failed to scan {}", pair_dir.display()))?;
    let mut rows = stmt.query([])?;

    let mut trades = Vec::new();
    while let Some(row) = rows.next()? {
        let ts_us: i64 = row.get(0)?;
        let trade_id: i64 = row.get(1)?;
        let side: String = row.get(4)?;
        let timestamp = DateTime::<Utc>::from_timestamp_micros(ts_us).ok_or_else(|| {
            PipelineError::data(format!("trade {trade_id} has an out-of-range timestamp"))
        })?;
        trades.push(Trade {
            pair: pair.to_string(),
            trade_id,
            timestamp,
            price: row.get(2)?,
            size: row.get(3)?,
            side: side.parse::<Side>()?,
        });
    }

    info!(pair, rows = trades.len(), root = %parquet_root.display(), "Trades loaded");
    Ok(trades)
}

fn list_jsonl(raw_dir: &Path) -> Result<Vec<PathBuf>> {
    if !raw_dir.is_dir() {
        return Err(PipelineError::missing(
            format!("raw trade directory {}", raw_dir.display()),
            "capture",
        )
        .into());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(raw_dir)
        .with_context(|| format!("Unable to list {}", raw_dir.display()))?
    {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "jsonl") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    let n: i64 = conn
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("Count query failed: {sql}"))?;
    Ok(u64::try_from(n).unwrap_or(0))
}

fn sql_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path)
            .with_context(|| format!("Unable to remove {}", path.display()))?;
    }
    Ok(())
}
