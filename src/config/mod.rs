use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct PipelineConfig {
    /// Concurrent transforms; 0 = number of CPUs
    #[serde(default)]
    pub concurrency: usize,

    /// Row-batch channel capacity; 0 = 4 × concurrency
    #[serde(default)]
    pub buffer_size: usize,

    /// Import partial results when some symbols fail
    #[serde(default)]
    pub tolerate_errors: bool,
}

/// Staging CSV output
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    #[serde(default)]
    pub keep_csv: bool,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_db_path() -> PathBuf {
    PathBuf::from("data/market.duckdb")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("data/out")
}
fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { db_path: default_db_path(), run_migrations: true }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { dir: default_output_dir(), keep_csv: false }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    /// (`XDXR__PIPELINE__CONCURRENCY=8`).
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("XDXR").separator("__"))
            .build()?;

        let app_cfg: AppConfig = cfg.try_deserialize().unwrap_or_else(|e| {
            tracing::warn!("Invalid configuration ({}), using defaults", e);
            AppConfig::default()
        });
        Ok(app_cfg)
    }
}
