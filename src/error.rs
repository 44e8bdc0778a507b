use thiserror::Error;

/// Per-unit failures collected by the pipeline. None of these abort a run on
/// their own; the caller inspects the aggregate.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A storage query failed for one symbol
    #[error("data access failed for {symbol}: {cause:#}")]
    DataAccess { symbol: String, cause: anyhow::Error },

    /// Inputs for one symbol could not be turned into rows
    #[error("calculation failed for {symbol}: {cause:#}")]
    Calculation { symbol: String, cause: anyhow::Error },

    /// The consumer could not persist a batch
    #[error("sink write failed: {0:#}")]
    SinkWrite(anyhow::Error),

    /// A transform panicked; captured from the worker's join handle
    #[error("worker for {item} panicked: {message}")]
    Panic { item: String, message: String },

    /// The shared cancellation token fired before all inputs were admitted
    #[error("run cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn data_access(symbol: &str, cause: anyhow::Error) -> Self {
        Self::DataAccess { symbol: symbol.to_string(), cause }
    }

    pub fn calculation(symbol: &str, cause: anyhow::Error) -> Self {
        Self::Calculation { symbol: symbol.to_string(), cause }
    }
}
