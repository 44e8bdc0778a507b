//! Bounded fan-out / single-consumer execution of per-symbol work.
//!
//! ## Shape
//!
//!   driver ──(semaphore, N permits)──▶ spawn_blocking(transform) ×N
//!                                           │ rows
//!                                           ▼
//!                              bounded mpsc (4×N by default)
//!                                           │
//!                                           ▼
//!                         spawn_blocking(consumer) ──▶ RowSink
//!
//! A failing or panicking transform is recorded and the run continues. The
//! cancellation token is checked before each admission: already admitted
//! work finishes and its rows are flushed, the rest is counted as skipped.

use crate::error::EngineError;
use crate::sink::RowSink;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    concurrency: usize,
    buffer_size: usize,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl Pipeline {
    /// Zero selects the default for either setting.
    pub fn new(concurrency: usize, buffer_size: usize) -> Self {
        let concurrency = if concurrency == 0 { default_concurrency() } else { concurrency };
        let buffer_size = if buffer_size == 0 { concurrency * 4 } else { buffer_size };
        Self { concurrency, buffer_size }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Run `transform` over every input and feed the rows to `sink`.
    ///
    /// Per-input failures are collected in the result. The only `Err` is a
    /// panic inside the sink, which leaves nothing to return.
    pub async fn run<I, T, F, S>(
        &self,
        inputs: Vec<I>,
        cancel: &CancellationToken,
        transform: F,
        sink: S,
    ) -> Result<PipelineOutput<S>, EngineError>
    where
        I: Display + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Result<Vec<T>, EngineError> + Send + Sync + 'static,
        S: RowSink<T> + 'static,
    {
        let started = Instant::now();
        let total = inputs.len();
        let shared = Arc::new(Shared::default());
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let (tx, rx) = mpsc::channel::<Vec<T>>(self.buffer_size);

        let consumer = {
            let shared = Arc::clone(&shared);
            tokio::task::spawn_blocking(move || consume(rx, sink, &shared))
        };

        let transform = Arc::new(transform);
        let mut handles = Vec::with_capacity(total);

        for input in inputs {
            if cancel.is_cancelled() {
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&sem).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            let label = input.to_string();
            let tx = tx.clone();
            let transform = Arc::clone(&transform);
            let shared = Arc::clone(&shared);

            let handle = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                match transform(input) {
                    Ok(rows) if rows.is_empty() => {
                        shared.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(rows) => {
                        shared.processed.fetch_add(1, Ordering::Relaxed);
                        if tx.blocking_send(rows).is_err() {
                            warn!("consumer closed, dropping rows");
                        }
                    }
                    Err(e) => {
                        warn!("{}", e);
                        shared.push_error(e);
                    }
                }
            });
            handles.push((label, handle));
        }
        drop(tx);

        let admitted = handles.len();
        for (label, handle) in handles {
            if let Err(e) = handle.await {
                let message = panic_message(e);
                error!("Worker for {} panicked: {}", label, message);
                shared.push_error(EngineError::Panic { item: label, message });
            }
        }

        let sink = consumer.await.map_err(|e| EngineError::Panic {
            item: "sink".into(),
            message: panic_message(e),
        })?;

        let cancelled = admitted < total;
        if cancelled {
            warn!("Cancelled: {} of {} inputs skipped", total - admitted, total);
        }

        let errors = std::mem::take(&mut *shared.errors.lock().unwrap_or_else(|p| p.into_inner()));
        let result = PipelineResult {
            total_items: total,
            processed_items: shared.processed.load(Ordering::Relaxed) as usize,
            output_rows: shared.output_rows.load(Ordering::Relaxed) as usize,
            skipped_items: total - admitted,
            errors,
            cancelled,
            duration: started.elapsed(),
        };
        info!(
            "Pipeline: {}/{} processed | {} rows | {} errors | {:.2?}",
            result.processed_items,
            result.total_items,
            result.output_rows,
            result.errors.len(),
            result.duration,
        );

        Ok(PipelineOutput { result, sink })
    }
}

#[derive(Default)]
struct Shared {
    processed: AtomicU64,
    output_rows: AtomicU64,
    errors: Mutex<Vec<EngineError>>,
}

impl Shared {
    fn push_error(&self, e: EngineError) {
        self.errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(e);
    }
}

fn consume<T, S: RowSink<T>>(mut rx: mpsc::Receiver<Vec<T>>, mut sink: S, shared: &Shared) -> S {
    while let Some(rows) = rx.blocking_recv() {
        match sink.write(&rows) {
            Ok(()) => {
                shared.output_rows.fetch_add(rows.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                warn!("Sink write of {} rows failed: {:#}", rows.len(), e);
                shared.push_error(EngineError::SinkWrite(e));
            }
        }
    }
    debug!("Consumer drained");
    sink
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PipelineResult {
    pub total_items: usize,
    /// Inputs whose transform succeeded
    pub processed_items: usize,
    pub output_rows: usize,
    /// Inputs never admitted because the run was cancelled
    pub skipped_items: usize,
    pub errors: Vec<EngineError>,
    pub cancelled: bool,
    pub duration: Duration,
}

impl PipelineResult {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn first_error(&self) -> Option<&EngineError> {
        self.errors.first()
    }

    pub fn error_summary(&self) -> Option<String> {
        let first = self.first_error()?;
        Some(format!("{} errors, first: {}", self.errors.len(), first))
    }

    /// `Cancelled` when inputs were skipped; per-input errors are not terminal.
    pub fn terminal_error(&self) -> Option<EngineError> {
        self.cancelled.then_some(EngineError::Cancelled)
    }
}

pub struct PipelineOutput<S> {
    pub result: PipelineResult,
    pub sink: S,
}
