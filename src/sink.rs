//! Streaming destinations for collected results.
//!
//! Sinks receive every [`CollectedResult`] in completion order and flush on
//! [`ResultSink::finish`]. Sink failures are contained by the batch layer:
//! they are logged and reported in the batch report, never allowed to
//! disturb scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::collect::CollectedResult;
use crate::error::SinkError;
use crate::params::display_value;

/// A destination for collected results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Record one collected result.
    async fn write(&self, collected: &CollectedResult) -> Result<(), SinkError>;

    /// Flush and close. Called once, after the last result.
    async fn finish(&self) -> Result<(), SinkError>;
}

// ── JSON lines ──────────────────────────────────────────────────────

/// One JSON object per line, in completion order.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl JsonLinesSink {
    /// Create (or truncate) the target file.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::create(&path).await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn write(&self, collected: &CollectedResult) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(collected)?;
        line.push(b'\n');
        self.file.lock().await.write_all(&line).await?;
        Ok(())
    }

    async fn finish(&self) -> Result<(), SinkError> {
        self.file.lock().await.flush().await?;
        debug!(path = %self.path.display(), "json lines sink flushed");
        Ok(())
    }
}

// ── CSV ─────────────────────────────────────────────────────────────

/// Job columns every CSV row starts with, before parameter and data columns.
const CSV_FIXED_COLUMNS: &[&str] =
    &["job", "state", "exit_code", "attempts", "duration_ms", "reason"];

/// Tabular results: fixed job columns, then configured parameter and parsed
/// data columns. The header row is written with the first record.
pub struct CsvSink {
    path: PathBuf,
    param_columns: Vec<String>,
    data_columns: Vec<String>,
    inner: Mutex<CsvInner>,
}

struct CsvInner {
    file: fs::File,
    header_written: bool,
}

impl CsvSink {
    /// Create (or truncate) the target file. `param_columns` select values
    /// from each result's parameter set, `data_columns` from its parsed data.
    pub async fn create(
        path: impl AsRef<Path>,
        param_columns: impl IntoIterator<Item = impl Into<String>>,
        data_columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = fs::File::create(&path).await?;
        Ok(Self {
            path,
            param_columns: param_columns.into_iter().map(Into::into).collect(),
            data_columns: data_columns.into_iter().map(Into::into).collect(),
            inner: Mutex::new(CsvInner {
                file,
                header_written: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn header(&self) -> Vec<String> {
        CSV_FIXED_COLUMNS
            .iter()
            .map(|c| c.to_string())
            .chain(self.param_columns.iter().cloned())
            .chain(self.data_columns.iter().cloned())
            .collect()
    }

    fn row(&self, collected: &CollectedResult) -> Vec<String> {
        let result = &collected.result;
        let mut row = vec![
            result.id.to_string(),
            result.state.to_string(),
            result.exit_code.map(|c| c.to_string()).unwrap_or_default(),
            result.attempts.to_string(),
            result.duration.as_millis().to_string(),
            result
                .reason
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default(),
        ];
        for column in &self.param_columns {
            row.push(
                result
                    .params
                    .get(column)
                    .map(display_value)
                    .unwrap_or_default(),
            );
        }
        for column in &self.data_columns {
            row.push(
                collected
                    .data
                    .as_ref()
                    .and_then(|d| d.get(column))
                    .map(display_value)
                    .unwrap_or_default(),
            );
        }
        row
    }
}

/// Quote a field if it contains a delimiter, quote or line break.
fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn csv_line(fields: &[String]) -> String {
    let mut line = fields
        .iter()
        .map(|f| csv_field(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

#[async_trait]
impl ResultSink for CsvSink {
    async fn write(&self, collected: &CollectedResult) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().await;
        if !inner.header_written {
            let header = csv_line(&self.header());
            inner.file.write_all(header.as_bytes()).await?;
            inner.header_written = true;
        }
        let line = csv_line(&self.row(collected));
        inner.file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn finish(&self) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().await;
        // Empty batches still get their header.
        if !inner.header_written {
            let header = csv_line(&self.header());
            inner.file.write_all(header.as_bytes()).await?;
            inner.header_written = true;
        }
        inner.file.flush().await?;
        debug!(path = %self.path.display(), "csv sink flushed");
        Ok(())
    }
}

// ── In-memory ───────────────────────────────────────────────────────

/// Buffers every result in memory. For tests and small batches.
#[derive(Default)]
pub struct MemorySink {
    results: std::sync::Mutex<Vec<CollectedResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn results(&self) -> Vec<CollectedResult> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CollectedResult>> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn write(&self, collected: &CollectedResult) -> Result<(), SinkError> {
        self.lock().push(collected.clone());
        Ok(())
    }

    async fn finish(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

// ── Fan-out ─────────────────────────────────────────────────────────

/// Fans every write out to all inner sinks. Keeps going past individual
/// failures and reports the last error, so one broken sink does not starve
/// the others.
pub struct MultiSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl MultiSink {
    pub fn new(sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        Self { sinks }
    }

    fn fold(outcomes: Vec<Result<(), SinkError>>, what: &str) -> Result<(), SinkError> {
        let mut last_error = None;
        for outcome in outcomes {
            if let Err(error) = outcome {
                warn!(%error, "sink {what} failed");
                last_error = Some(error);
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ResultSink for MultiSink {
    async fn write(&self, collected: &CollectedResult) -> Result<(), SinkError> {
        let outcomes = join_all(self.sinks.iter().map(|s| s.write(collected))).await;
        Self::fold(outcomes, "write")
    }

    async fn finish(&self) -> Result<(), SinkError> {
        let outcomes = join_all(self.sinks.iter().map(|s| s.finish())).await;
        Self::fold(outcomes, "finish")
    }
}
