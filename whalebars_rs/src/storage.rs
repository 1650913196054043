use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use polars::io::parquet::write::{ParquetCompression, ParquetWriter};
use polars::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::BarWidth;
use crate::error::PipelineError;

/// Path conventions and whole-table writes under one data directory.
///
/// ```text
/// <data_dir>/parquet/pair=<P>/date=<D>/*.parquet   deduplicated trades
/// <data_dir>/features/<P>_bars_<bar>.parquet
/// <data_dir>/features/<P>_labels_<bar>.parquet
/// <data_dir>/reports/<P>_sweep_<H>.{parquet,csv}
/// ```
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

/// What a stage wrote: enough to confirm a rerun reproduced the same table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReceipt {
    pub path: PathBuf,
    pub rows: usize,
    /// SHA-256 of the table rendered as CSV with a header.
    pub sha256: String,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn parquet_root(&self) -> PathBuf {
        self.root.join("parquet")
    }

    pub fn features_dir(&self) -> PathBuf {
        self.root.join("features")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn bars_path(&self, pair: &str, bar: BarWidth) -> PathBuf {
        self.features_dir()
            .join(format!("{pair}_bars_{}.parquet", bar.tag()))
    }

    pub fn labels_path(&self, pair: &str, bar: BarWidth) -> PathBuf {
        self.features_dir()
            .join(format!("{pair}_labels_{}.parquet", bar.tag()))
    }

    pub fn sweep_path(&self, pair: &str, horizon_tag: &str) -> PathBuf {
        self.reports_dir()
            .join(format!("{pair}_sweep_{horizon_tag}.parquet"))
    }

    pub fn sweep_csv_path(&self, pair: &str, horizon_tag: &str) -> PathBuf {
        self.reports_dir()
            .join(format!("{pair}_sweep_{horizon_tag}.csv"))
    }

    pub fn sweep_manifest_path(&self, pair: &str, horizon_tag: &str) -> PathBuf {
        self.reports_dir()
            .join(format!("{pair}_sweep_{horizon_tag}.meta.json"))
    }

    pub fn write_parquet(&self, path: &Path, df: &mut DataFrame) -> Result<TableReceipt> {
        let sha256 = fingerprint(df)?;
        replace_file(path, |file| {
            ParquetWriter::new(file)
                .with_compression(ParquetCompression::Zstd(None))
                .finish(df)
                .map(|_| ())
                .context("Failed to write Parquet table")
        })?;
        let receipt = TableReceipt {
            path: path.to_path_buf(),
            rows: df.height(),
            sha256,
        };
        info!(
            path = %receipt.path.display(),
            rows = receipt.rows,
            sha256 = %receipt.sha256,
            "Table written"
        );
        Ok(receipt)
    }

    pub fn write_csv(&self, path: &Path, df: &mut DataFrame) -> Result<TableReceipt> {
        let sha256 = fingerprint(df)?;
        replace_file(path, |file| {
            CsvWriter::new(file)
                .include_header(true)
                .finish(df)
                .context("Failed to write CSV table")
        })?;
        debug!(path = %path.display(), rows = df.height(), "CSV table written");
        Ok(TableReceipt {
            path: path.to_path_buf(),
            rows: df.height(),
            sha256,
        })
    }

    /// Pretty-printed JSON sidecar describing how a table was produced.
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let body = serde_json::to_vec_pretty(value).context("Failed to serialize manifest")?;
        replace_file(path, |file| {
            file.write_all(&body)
                .with_context(|| format!("Unable to write {}", path.display()))
        })
    }

    /// Read a whole Parquet table. An absent file is a missing dependency on
    /// `stage`, the stage that writes it.
    pub fn read_parquet(&self, path: &Path, stage: &'static str) -> Result<DataFrame> {
        if !path.is_file() {
            return Err(PipelineError::missing(path.display().to_string(), stage).into());
        }
        let file =
            File::open(path).with_context(|| format!("Unable to open {}", path.display()))?;
        let df = ParquetReader::new(file)
            .finish()
            .with_context(|| format!("Failed to read Parquet table {}", path.display()))?;
        debug!(path = %path.display(), rows = df.height(), "Table loaded");
        Ok(df)
    }
}

/// Write through `<path>.tmp` and rename over the target, so readers only
/// ever see a complete previous or complete new table.
fn replace_file(path: &Path, write: impl FnOnce(&mut File) -> Result<()>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Unable to create {}", parent.display()))?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path)
        .with_context(|| format!("Unable to create {}", tmp_path.display()))?;
    let outcome = write(&mut file).and_then(|()| {
        file.sync_all()
            .with_context(|| format!("Unable to sync {}", tmp_path.display()))
    });
    drop(file);
    if let Err(err) = outcome {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Unable to move {} into place at {}",
            tmp_path.display(),
            path.display()
        )
    })
}

/// SHA-256 of the frame's CSV rendering, header included.
pub fn fingerprint(df: &mut DataFrame) -> Result<String> {
    let mut writer = HashingWriter::new(io::sink());
    CsvWriter::new(&mut writer)
        .include_header(true)
        .finish(df)
        .context("Failed to hash table")?;
    Ok(writer.finalize_hex())
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finalize_hex(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
