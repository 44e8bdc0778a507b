mod calc;
mod config;
mod error;
mod jobs;
mod loader;
mod models;
mod pipeline;
mod sink;
mod storage;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::AppConfig;
use crate::jobs::{StageContext, StageReport, run_basic_stage, run_factor_stage};
use crate::loader::{discover_csv_files, load_bars_csv, load_gbbq_csv};
use crate::pipeline::Pipeline;
use crate::storage::schema::{ADJUST_FACTORS, BASIC_METRICS, DAILY_BARS, GBBQ, SchemaRegistry};
use crate::storage::{MarketDataStore, Repository};

#[derive(Parser)]
#[command(name = "xdxr-engine", about = "Ex-rights adjusted daily metrics and factors", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Concurrent symbols (overrides pipeline.concurrency)
    #[arg(short = 'j', long, global = true, env = "XDXR_CONCURRENCY")]
    concurrency: Option<usize>,
}

#[derive(Subcommand)]
enum Command {
    /// Load decoded daily-bar CSV files from a directory
    LoadBars {
        #[arg(short, long, default_value = "data/bars")]
        dir: PathBuf,
    },

    /// Replace the GBBQ reference table from a CSV snapshot
    LoadGbbq {
        #[arg(short, long, default_value = "data/gbbq.csv")]
        file: PathBuf,
    },

    /// Compute basic metrics (pre-close, change, turnover, market value)
    Basic,

    /// Compute qfq/hfq adjustment factors
    Factor,

    /// Basic metrics, then adjustment factors
    Run,

    /// Show database statistics
    Stats,

    /// List all stored symbols
    Symbols,

    /// Apply schema migrations without loading data
    Migrate,
}

fn open_repo(config: &AppConfig) -> Result<Arc<Repository>> {
    let repo = Repository::open(&config.storage.db_path, SchemaRegistry::standard())
        .context("Failed to open DuckDB")?;
    if config.storage.run_migrations {
        repo.run_migrations()?;
    }
    Ok(Arc::new(repo))
}

fn stage_context(config: &AppConfig, repo: Arc<Repository>, cancel: CancellationToken) -> StageContext {
    let pipeline = Pipeline::new(config.pipeline.concurrency, config.pipeline.buffer_size);
    info!("{} workers, channel capacity {}", pipeline.concurrency(), pipeline.buffer_size());
    StageContext {
        store: repo,
        pipeline,
        output_dir: config.output.dir.clone(),
        tolerate_errors: config.pipeline.tolerate_errors,
        keep_csv: config.output.keep_csv,
        cancel,
    }
}

/// Ctrl-C stops admitting new symbols; work in flight still completes.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing in-flight symbols…");
            on_signal.cancel();
        }
    });
    token
}

/// Completed symbols are already imported; exit non-zero so the run is retried.
fn stop_if_cancelled(report: &StageReport) -> Result<()> {
    match report.terminal_error() {
        Some(e) => Err(anyhow::Error::new(e).context(format!("{} stage", report.stage))),
        None => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "xdxr_engine=info,warn",
        1 => "xdxr_engine=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::new(filter))
        .init();

    let mut config = AppConfig::load()?;
    if let Some(n) = cli.concurrency {
        config.pipeline.concurrency = n;
    }

    match cli.command {
        Command::LoadBars { dir } => {
            let _t = utils::Timer::start("bar CSV load");
            let repo = open_repo(&config)?;

            let files = discover_csv_files(&dir)?;
            info!("Found {} CSV files in {:?}", files.len(), dir);

            let mut total_bars = 0usize;
            let mut errors = 0usize;
            for path in &files {
                match load_bars_csv(path) {
                    Ok(bars) => total_bars += repo.upsert_trading_bars(&bars)?,
                    Err(e) => {
                        warn!("Error loading {:?}: {:#}", path, e);
                        errors += 1;
                    }
                }
            }
            info!("Done: {} bars upserted, {} files failed", total_bars, errors);
        }

        Command::LoadGbbq { file } => {
            let _t = utils::Timer::start("GBBQ load");
            let repo = open_repo(&config)?;
            let events = load_gbbq_csv(&file)?;
            let n = repo.replace_corporate_actions(&events)?;
            info!("Done: {} corporate actions", n);
        }

        Command::Basic => {
            let ctx = stage_context(&config, open_repo(&config)?, cancel_on_ctrl_c());
            let report = run_basic_stage(&ctx).await?;
            info!("{}", report);
            stop_if_cancelled(&report)?;
        }

        Command::Factor => {
            let ctx = stage_context(&config, open_repo(&config)?, cancel_on_ctrl_c());
            let report = run_factor_stage(&ctx).await?;
            info!("{}", report);
            stop_if_cancelled(&report)?;
        }

        Command::Run => {
            let _t = utils::Timer::start("full run");
            let ctx = stage_context(&config, open_repo(&config)?, cancel_on_ctrl_c());
            let basic = run_basic_stage(&ctx).await?;
            info!("{}", basic);
            stop_if_cancelled(&basic)?;
            let factor = run_factor_stage(&ctx).await?;
            info!("{}", factor);
            stop_if_cancelled(&factor)?;
            let errors = basic.error_count() + factor.error_count();
            if errors > 0 {
                warn!("{} symbols failed; rerun to retry them", errors);
            }
        }

        Command::Stats => {
            let repo = open_repo(&config)?;
            let symbols = repo.list_all_symbols()?.len() as i64;
            let (min, max) = repo.date_range(DAILY_BARS.name).unwrap_or((None, None));
            let show = |d: Option<chrono::NaiveDate>| d.map(|d| d.to_string()).unwrap_or("—".into());
            println!("─────────────────────────────────");
            println!("  xdxr-engine — Database Stats");
            println!("─────────────────────────────────");
            println!("  Symbols  : {}", utils::fmt_number(symbols));
            println!("  Bars     : {}", utils::fmt_number(repo.row_count(DAILY_BARS.name)?));
            println!("  GBBQ     : {}", utils::fmt_number(repo.row_count(GBBQ.name)?));
            println!("  Basics   : {}", utils::fmt_number(repo.row_count(BASIC_METRICS.name)?));
            println!("  Factors  : {}", utils::fmt_number(repo.row_count(ADJUST_FACTORS.name)?));
            println!("  From     : {}", show(min));
            println!("  To       : {}", show(max));
            println!("  Basic to : {}", show(repo.latest_basic_date()?));
            println!("  Factor to: {}", show(repo.latest_factor_date()?));
            println!("─────────────────────────────────");
        }

        Command::Symbols => {
            let syms = open_repo(&config)?.list_all_symbols()?;
            if syms.is_empty() {
                println!("No symbols — run `xdxr-engine load-bars` first.");
            } else {
                println!("{} symbols:", syms.len());
                for s in &syms {
                    println!("  {}", s);
                }
            }
        }

        Command::Migrate => {
            Repository::open(&config.storage.db_path, SchemaRegistry::standard())?.run_migrations()?;
            println!("Migrations applied.");
        }
    }

    Ok(())
}
