use super::{RunMode, StageContext, StageReport, ensure_finite, finish_stage};
use crate::calc::basic::compute_basic_metrics;
use crate::calc::index::CorporateActionIndex;
use crate::calc::state::BasicStateResolver;
use crate::error::EngineError;
use crate::models::BasicMetricsRecord;
use crate::sink::CsvSink;
use crate::storage::MarketDataStore;
use crate::utils::Timer;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

pub async fn run_basic_stage(ctx: &StageContext) -> Result<StageReport> {
    let _t = Timer::start("basic metrics");
    let store = Arc::clone(&ctx.store);

    let boundary = store.latest_basic_date().context("latest basic date")?;
    let mode = boundary.map_or(RunMode::Full, RunMode::Incremental);
    info!("=== Basic metrics: {:?} ===", mode);

    let index = Arc::new(CorporateActionIndex::build(
        store.query_corporate_actions().context("load corporate actions")?,
    ));
    let resolver = match boundary {
        Some(b) => Some(Arc::new(BasicStateResolver::build(Arc::clone(&store), b)?)),
        None => None,
    };

    let symbols = store.list_all_symbols().context("list symbols")?;
    info!("{} symbols, {} with corporate actions", symbols.len(), index.symbol_count());

    let sink = CsvSink::<BasicMetricsRecord>::create(&ctx.output_dir.join("basic.csv"))?;
    let worker_store = Arc::clone(&store);
    let out = ctx
        .pipeline
        .run(
            symbols,
            &ctx.cancel,
            move |symbol: String| {
                basic_for_symbol(worker_store.as_ref(), &index, resolver.as_deref(), &symbol)
            },
            sink,
        )
        .await?;

    finish_stage(ctx, "basic", mode, out, |path| store.import_basics_csv(path))
}

fn basic_for_symbol(
    store: &dyn MarketDataStore,
    index: &CorporateActionIndex,
    resolver: Option<&BasicStateResolver>,
    symbol: &str,
) -> Result<Vec<BasicMetricsRecord>, EngineError> {
    let seed = match resolver {
        Some(r) => r.resolve(symbol)?,
        None => None,
    };
    let as_of = seed.map(|s| s.as_of);

    let bars = store
        .query_trading_bars(symbol, as_of.and_then(|d| d.succ_opt()), None)
        .map_err(|e| EngineError::data_access(symbol, e))?;
    if bars.is_empty() {
        debug!("{}: no new bars", symbol);
        return Ok(Vec::new());
    }

    let (ex_rights, capital) = index.events_after(symbol, as_of);
    let rows = compute_basic_metrics(&bars, ex_rights, capital, seed.as_ref());

    ensure_finite(
        symbol,
        rows.iter().flat_map(|r| {
            [r.close, r.pre_close, r.change_percent, r.amplitude, r.turnover, r.float_mv, r.total_mv]
        }),
    )?;
    debug!("{}: {} rows (from {:?})", symbol, rows.len(), as_of);
    Ok(rows)
}
