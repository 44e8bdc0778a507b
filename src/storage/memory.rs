//! In-process store for stage and resolver tests. Mirrors the DuckDB
//! repository's keying: rows are replaced on (symbol, date).

use super::MarketDataStore;
use crate::models::{BasicMetricsRecord, CorporateActionEvent, FactorRecord, TradingBar};
use anyhow::{Result, bail};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::RwLock;
use tokio_util::sync::CancellationToken;

type Keyed<T> = RwLock<BTreeMap<(String, NaiveDate), T>>;

#[derive(Default)]
pub struct MemoryStore {
    bars: Keyed<TradingBar>,
    actions: RwLock<Vec<CorporateActionEvent>>,
    basics: Keyed<BasicMetricsRecord>,
    factors: Keyed<FactorRecord>,
    failing: RwLock<HashSet<String>>,
    cancel_on: RwLock<Option<(String, CancellationToken)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bars(&self, bars: Vec<TradingBar>) {
        let mut map = self.bars.write().unwrap();
        for b in bars {
            map.insert((b.symbol.clone(), b.date), b);
        }
    }

    pub fn put_actions(&self, events: Vec<CorporateActionEvent>) {
        *self.actions.write().unwrap() = events;
    }

    pub fn put_basics(&self, rows: Vec<BasicMetricsRecord>) {
        let mut map = self.basics.write().unwrap();
        for r in rows {
            map.insert((r.symbol.clone(), r.date), r);
        }
    }

    pub fn put_factors(&self, rows: Vec<FactorRecord>) {
        let mut map = self.factors.write().unwrap();
        for r in rows {
            map.insert((r.symbol.clone(), r.date), r);
        }
    }

    /// Per-symbol queries for `symbol` fail from now on.
    pub fn fail_symbol(&self, symbol: &str) {
        self.failing.write().unwrap().insert(symbol.to_string());
    }

    /// Cancel `token` whenever bars for `symbol` are read, i.e. while that
    /// symbol is in flight.
    pub fn cancel_on(&self, symbol: &str, token: CancellationToken) {
        *self.cancel_on.write().unwrap() = Some((symbol.to_string(), token));
    }

    /// All basic rows ordered by (symbol, date).
    pub fn basics(&self) -> Vec<BasicMetricsRecord> {
        self.basics.read().unwrap().values().cloned().collect()
    }

    pub fn factors(&self) -> Vec<FactorRecord> {
        self.factors.read().unwrap().values().cloned().collect()
    }

    fn check(&self, symbol: &str) -> Result<()> {
        if self.failing.read().unwrap().contains(symbol) {
            bail!("injected failure for {}", symbol);
        }
        Ok(())
    }

    fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let rows = rdr.deserialize().collect::<Result<Vec<T>, _>>()?;
        Ok(rows)
    }
}

fn latest_per_symbol<T: Clone>(map: &BTreeMap<(String, NaiveDate), T>, keep: impl Fn(&NaiveDate) -> bool) -> Vec<T> {
    let mut out: BTreeMap<&str, &T> = BTreeMap::new();
    for ((symbol, date), row) in map {
        if keep(date) {
            // ascending keys: later dates overwrite
            out.insert(symbol.as_str(), row);
        }
    }
    out.into_values().cloned().collect()
}

impl MarketDataStore for MemoryStore {
    fn list_all_symbols(&self) -> Result<Vec<String>> {
        let map = self.bars.read().unwrap();
        let mut syms: Vec<String> = map.keys().map(|(s, _)| s.clone()).collect();
        syms.dedup();
        Ok(syms)
    }

    fn query_trading_bars(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<TradingBar>> {
        self.check(symbol)?;
        if let Some((target, token)) = &*self.cancel_on.read().unwrap() {
            if target == symbol {
                token.cancel();
            }
        }
        let map = self.bars.read().unwrap();
        Ok(map
            .values()
            .filter(|b| b.symbol == symbol)
            .filter(|b| from.is_none_or(|f| b.date >= f))
            .filter(|b| to.is_none_or(|t| b.date <= t))
            .cloned()
            .collect())
    }

    fn query_corporate_actions(&self) -> Result<Vec<CorporateActionEvent>> {
        Ok(self.actions.read().unwrap().clone())
    }

    fn query_latest_basics_since(&self, boundary: NaiveDate) -> Result<Vec<BasicMetricsRecord>> {
        Ok(latest_per_symbol(&self.basics.read().unwrap(), |d| *d >= boundary))
    }

    fn query_latest_basic_for_symbol(&self, symbol: &str) -> Result<Option<BasicMetricsRecord>> {
        self.check(symbol)?;
        let map = self.basics.read().unwrap();
        Ok(map.values().filter(|r| r.symbol == symbol).last().cloned())
    }

    fn query_basics_since(&self, boundary: NaiveDate) -> Result<Vec<BasicMetricsRecord>> {
        let map = self.basics.read().unwrap();
        Ok(map.values().filter(|r| r.date >= boundary).cloned().collect())
    }

    fn query_basics_for_symbol(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<BasicMetricsRecord>> {
        self.check(symbol)?;
        let map = self.basics.read().unwrap();
        Ok(map
            .values()
            .filter(|r| r.symbol == symbol && from.is_none_or(|f| r.date >= f))
            .cloned()
            .collect())
    }

    fn query_latest_factor_per_symbol(&self) -> Result<Vec<FactorRecord>> {
        Ok(latest_per_symbol(&self.factors.read().unwrap(), |_| true))
    }

    fn latest_basic_date(&self) -> Result<Option<NaiveDate>> {
        Ok(self.basics.read().unwrap().keys().map(|(_, d)| *d).max())
    }

    fn latest_factor_date(&self) -> Result<Option<NaiveDate>> {
        Ok(self.factors.read().unwrap().keys().map(|(_, d)| *d).max())
    }

    fn import_basics_csv(&self, path: &Path) -> Result<usize> {
        let rows: Vec<BasicMetricsRecord> = Self::read_csv(path)?;
        let n = rows.len();
        self.put_basics(rows);
        Ok(n)
    }

    fn import_factors_csv(&self, path: &Path) -> Result<usize> {
        let rows: Vec<FactorRecord> = Self::read_csv(path)?;
        let n = rows.len();
        self.put_factors(rows);
        Ok(n)
    }
}
