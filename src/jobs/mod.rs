//! Batch stages: derive rows for every symbol, stage them in a CSV, then
//! bulk-load the CSV into the store.
//!
//! ## Modes
//!
//! Each stage looks at the latest persisted date of its own output table.
//! Nothing persisted ⇒ full mode (every symbol from its first bar).
//! Otherwise incremental mode: carry-forward state is rebuilt per symbol and
//! only newer data is computed. Re-running with no new input writes nothing.

mod basic;
mod factor;

pub use basic::run_basic_stage;
pub use factor::run_factor_stage;

use crate::error::EngineError;
use crate::pipeline::{Pipeline, PipelineOutput, PipelineResult};
use crate::sink::CsvSink;
use crate::storage::SharedStore;
use anyhow::{Result, bail};
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a stage needs; built once by the CLI.
#[derive(Clone)]
pub struct StageContext {
    pub store: SharedStore,
    pub pipeline: Pipeline,
    pub output_dir: PathBuf,
    /// Import partial output when some symbols failed
    pub tolerate_errors: bool,
    pub keep_csv: bool,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Full,
    /// Continue after the latest persisted date
    Incremental(NaiveDate),
    UpToDate,
}

#[derive(Debug)]
pub struct StageReport {
    pub stage: &'static str,
    pub mode: RunMode,
    /// `None` when the stage had nothing to do
    pub result: Option<PipelineResult>,
    pub imported_rows: usize,
}

impl StageReport {
    fn up_to_date(stage: &'static str) -> Self {
        Self { stage, mode: RunMode::UpToDate, result: None, imported_rows: 0 }
    }

    pub fn error_count(&self) -> usize {
        self.result.as_ref().map_or(0, |r| r.errors.len())
    }

    /// `Cancelled` when symbols were skipped. The rows of completed symbols
    /// have still been imported; the skipped ones resume on the next run.
    pub fn terminal_error(&self) -> Option<EngineError> {
        self.result.as_ref().and_then(PipelineResult::terminal_error)
    }
}

impl std::fmt::Display for StageReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.mode, &self.result) {
            (RunMode::UpToDate, _) | (_, None) => write!(f, "{}: up to date", self.stage),
            (mode, Some(r)) => {
                write!(
                    f,
                    "{} ({:?}): {}/{} symbols | {} skipped | {} rows imported | {} errors | {:.2?}",
                    self.stage,
                    mode,
                    r.processed_items,
                    r.total_items,
                    r.skipped_items,
                    self.imported_rows,
                    r.errors.len(),
                    r.duration,
                )?;
                if r.cancelled {
                    write!(f, " | cancelled")?;
                }
                Ok(())
            }
        }
    }
}

/// Close the CSV, apply the error policy, import, clean up.
///
/// A cancelled run still imports what completed symbols produced: every
/// staged symbol is whole, and skipped symbols are picked up by the next
/// incremental run. The caller sees the cancellation via
/// [`StageReport::terminal_error`].
fn finish_stage<T: serde::Serialize>(
    ctx: &StageContext,
    stage: &'static str,
    mode: RunMode,
    out: PipelineOutput<CsvSink<T>>,
    import: impl FnOnce(&Path) -> Result<usize>,
) -> Result<StageReport> {
    let PipelineOutput { result, sink } = out;
    let (path, rows) = sink.finish().map_err(EngineError::SinkWrite)?;

    if result.cancelled {
        warn!("{}: cancelled, importing {} rows from completed symbols", stage, rows);
    }

    let imported = import_staged(ctx, stage, &result, rows, &path, import);

    if !ctx.keep_csv {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("Could not remove {:?}: {}", path, e);
        }
    }

    let imported_rows = imported?;
    Ok(StageReport { stage, mode, result: Some(result), imported_rows })
}

fn import_staged(
    ctx: &StageContext,
    stage: &str,
    result: &PipelineResult,
    rows: usize,
    path: &Path,
    import: impl FnOnce(&Path) -> Result<usize>,
) -> Result<usize> {
    if result.has_errors() {
        let summary = result.error_summary().unwrap_or_default();
        warn!("{}: {}", stage, summary);
        if !ctx.tolerate_errors {
            bail!("{} stage failed: {}", stage, summary);
        }
    }

    let imported_rows = if rows > 0 { import(path)? } else { 0 };
    info!("{}: {} rows staged, {} imported", stage, rows, imported_rows);
    Ok(imported_rows)
}

/// Reject rows that would poison downstream arithmetic.
fn ensure_finite(symbol: &str, values: impl IntoIterator<Item = f64>) -> Result<(), EngineError> {
    if values.into_iter().all(f64::is_finite) {
        Ok(())
    } else {
        Err(EngineError::calculation(symbol, anyhow::anyhow!("non-finite value in output")))
    }
}
