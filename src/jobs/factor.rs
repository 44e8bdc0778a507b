use super::{RunMode, StageContext, StageReport, ensure_finite, finish_stage};
use crate::calc::factor::{full_factors, incremental_factors};
use crate::calc::index::CorporateActionIndex;
use crate::calc::state::FactorStateResolver;
use crate::error::EngineError;
use crate::models::FactorRecord;
use crate::sink::CsvSink;
use crate::storage::MarketDataStore;
use crate::utils::Timer;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub async fn run_factor_stage(ctx: &StageContext) -> Result<StageReport> {
    let _t = Timer::start("adjust factors");
    let store = Arc::clone(&ctx.store);

    let boundary = store.latest_factor_date().context("latest factor date")?;
    if let Some(f) = boundary {
        let lagging = lagging_symbols(store.as_ref())?;
        if lagging.is_empty() {
            info!("Factors up to date for every symbol (latest {})", f);
            return Ok(StageReport::up_to_date("factor"));
        }
        info!(
            "{} symbols have basics past their last factor: {}{}",
            lagging.len(),
            lagging.iter().take(5).cloned().collect::<Vec<_>>().join(", "),
            if lagging.len() > 5 { ", …" } else { "" },
        );
    }
    let mode = boundary.map_or(RunMode::Full, RunMode::Incremental);
    info!("=== Adjust factors: {:?} ===", mode);

    let index = Arc::new(CorporateActionIndex::build(
        store.query_corporate_actions().context("load corporate actions")?,
    ));
    let resolver = match boundary {
        Some(b) => Some(Arc::new(FactorStateResolver::build(Arc::clone(&store), b)?)),
        None => None,
    };

    let symbols = store.list_all_symbols().context("list symbols")?;
    let sink = CsvSink::<FactorRecord>::create(&ctx.output_dir.join("factor.csv"))?;
    let worker_store = Arc::clone(&store);
    let out = ctx
        .pipeline
        .run(
            symbols,
            &ctx.cancel,
            move |symbol: String| {
                factors_for_symbol(worker_store.as_ref(), &index, resolver.as_deref(), &symbol)
            },
            sink,
        )
        .await?;

    finish_stage(ctx, "factor", mode, out, |path| store.import_factors_csv(path))
}

/// Symbols whose latest basic row is newer than their latest factor row,
/// including symbols with basics but no factors at all.
fn lagging_symbols(store: &dyn MarketDataStore) -> Result<Vec<String>> {
    let factors: HashMap<String, NaiveDate> = store
        .query_latest_factor_per_symbol()
        .context("latest factor per symbol")?
        .into_iter()
        .map(|f| (f.symbol, f.date))
        .collect();
    // the default date predates every listing
    let basics = store
        .query_latest_basics_since(NaiveDate::default())
        .context("latest basic per symbol")?;

    let mut lagging: Vec<String> = basics
        .into_iter()
        .filter(|b| factors.get(&b.symbol).is_none_or(|f| *f < b.date))
        .map(|b| b.symbol)
        .collect();
    lagging.sort();
    Ok(lagging)
}

fn factors_for_symbol(
    store: &dyn MarketDataStore,
    index: &CorporateActionIndex,
    resolver: Option<&FactorStateResolver>,
    symbol: &str,
) -> Result<Vec<FactorRecord>, EngineError> {
    let seed = match resolver {
        Some(r) => r.resolve(symbol)?,
        None => None,
    };

    let rows = match seed {
        Some(seed) => {
            if seed.pending.is_empty() {
                debug!("{}: no basics after {}", symbol, seed.as_of);
                return Ok(Vec::new());
            }
            let (ex_rights, _) = index.events_after(symbol, Some(seed.as_of));
            incremental_factors(&seed.pending, ex_rights, seed.last_hfq, seed.prev_close)
        }
        None => {
            let bars = store
                .query_trading_bars(symbol, None, None)
                .map_err(|e| EngineError::data_access(symbol, e))?;
            let (ex_rights, _) = index.events_for(symbol);
            full_factors(&bars, ex_rights)
        }
    };

    ensure_finite(symbol, rows.iter().flat_map(|r| [r.qfq_factor, r.hfq_factor]))?;
    debug!("{}: {} factor rows", symbol, rows.len());
    Ok(rows)
}
