//! Rebuild carry-forward state from persisted rows so an incremental run can
//! continue each symbol where the previous run stopped.

use crate::error::EngineError;
use crate::models::{BasicMetricsRecord, FactorRecord, FactorSeed, IncrementState};
use crate::storage::{MarketDataStore, SharedStore};
use anyhow::{Context, anyhow};
use chrono::NaiveDate;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Seed from the last persisted basic row. Share counts are recovered by
/// inverting the market values, so they carry the rounding of `float_mv`.
///
/// A non-positive close cannot be inverted: the close is still carried as the
/// next pre-close, and share counts restart at zero until the next snapshot.
pub fn seed_from_record(record: &BasicMetricsRecord) -> IncrementState {
    let (float_shares, total_shares) = if record.close > 0.0 {
        (record.float_mv / record.close / 10000.0, record.total_mv / record.close / 10000.0)
    } else {
        warn!("{}: close {} on {}, share counts reset", record.symbol, record.close, record.date);
        (0.0, 0.0)
    };
    IncrementState {
        prev_close: record.close,
        last_post_float_shares: float_shares,
        last_post_total_shares: total_shares,
        as_of: record.date,
    }
}

// ── Basic metrics ─────────────────────────────────────────────────────────────

pub struct BasicStateResolver {
    store: SharedStore,
    latest: HashMap<String, BasicMetricsRecord>,
}

impl BasicStateResolver {
    /// One bulk query for every symbol that has rows on/after `boundary`.
    pub fn build(store: SharedStore, boundary: NaiveDate) -> anyhow::Result<Self> {
        let rows = store
            .query_latest_basics_since(boundary)
            .context("bulk load of basic state")?;

        let mut latest: HashMap<String, BasicMetricsRecord> = HashMap::with_capacity(rows.len());
        for row in rows {
            match latest.get(&row.symbol) {
                Some(existing) if existing.date >= row.date => {}
                _ => {
                    latest.insert(row.symbol.clone(), row);
                }
            }
        }
        info!("Basic state: {} symbols preloaded since {}", latest.len(), boundary);
        Ok(Self { store, latest })
    }

    /// `Ok(None)` means the symbol has no persisted history.
    pub fn resolve(&self, symbol: &str) -> Result<Option<IncrementState>, EngineError> {
        if let Some(row) = self.latest.get(symbol) {
            return Ok(Some(seed_from_record(row)));
        }

        debug!("{}: not in bulk state, querying latest row", symbol);
        let row = self
            .store
            .query_latest_basic_for_symbol(symbol)
            .map_err(|e| EngineError::data_access(symbol, e))?;
        Ok(row.as_ref().map(seed_from_record))
    }
}

// ── Adjustment factors ────────────────────────────────────────────────────────

pub struct FactorStateResolver {
    store: SharedStore,
    boundary: NaiveDate,
    latest: HashMap<String, FactorRecord>,
    basics: HashMap<String, Vec<BasicMetricsRecord>>,
}

impl FactorStateResolver {
    pub fn build(store: SharedStore, boundary: NaiveDate) -> anyhow::Result<Self> {
        let latest: HashMap<String, FactorRecord> = store
            .query_latest_factor_per_symbol()
            .context("bulk load of latest factors")?
            .into_iter()
            .map(|f| (f.symbol.clone(), f))
            .collect();

        let mut basics: HashMap<String, Vec<BasicMetricsRecord>> = HashMap::new();
        for row in store
            .query_basics_since(boundary)
            .context("bulk load of basics since boundary")?
        {
            basics.entry(row.symbol.clone()).or_default().push(row);
        }
        for rows in basics.values_mut() {
            rows.sort_by_key(|r| r.date);
        }

        info!(
            "Factor state: {} symbols with factors, {} with basics since {}",
            latest.len(),
            basics.len(),
            boundary
        );
        Ok(Self { store, boundary, latest, basics })
    }

    /// `Ok(None)` means no factor history: recompute the symbol in full.
    pub fn resolve(&self, symbol: &str) -> Result<Option<FactorSeed>, EngineError> {
        let Some(last) = self.latest.get(symbol) else {
            return Ok(None);
        };
        let as_of = last.date;

        let fetched;
        let rows: &[BasicMetricsRecord] = if as_of == self.boundary {
            self.basics.get(symbol).map(Vec::as_slice).unwrap_or(&[])
        } else {
            debug!("{}: factors stop at {}, querying basics", symbol, as_of);
            fetched = self
                .store
                .query_basics_for_symbol(symbol, Some(as_of))
                .map_err(|e| EngineError::data_access(symbol, e))?;
            &fetched
        };

        let anchor = match rows.first() {
            Some(first) if first.date == as_of => first,
            _ => {
                return Err(EngineError::data_access(
                    symbol,
                    anyhow!("no basic row on {} to anchor the factor chain", as_of),
                ));
            }
        };

        Ok(Some(FactorSeed {
            last_hfq: last.hfq_factor,
            prev_close: anchor.close,
            as_of,
            pending: rows[1..].to_vec(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::preclose::tests::d;
    use crate::storage::memory::MemoryStore;
    use std::sync::Arc;

    fn basic(symbol: &str, date: NaiveDate, close: f64, float_mv: f64, total_mv: f64) -> BasicMetricsRecord {
        BasicMetricsRecord {
            date,
            symbol: symbol.into(),
            close,
            pre_close: close,
            change_percent: 0.0,
            amplitude: 0.0,
            turnover: 0.0,
            float_mv,
            total_mv,
        }
    }

    fn factor(symbol: &str, date: NaiveDate, hfq: f64) -> FactorRecord {
        FactorRecord { date, symbol: symbol.into(), qfq_factor: 1.0, hfq_factor: hfq }
    }

    #[test]
    fn test_seed_inverts_market_values() {
        let seed = seed_from_record(&basic("sh600000", d(2024, 1, 2), 10.0, 10_000_000.0, 25_000_000.0));
        assert_eq!(seed.prev_close, 10.0);
        assert_eq!(seed.last_post_float_shares, 100.0);
        assert_eq!(seed.last_post_total_shares, 250.0);
        assert_eq!(seed.as_of, d(2024, 1, 2));
    }

    #[test]
    fn test_seed_with_zero_close_keeps_history() {
        let seed = seed_from_record(&basic("sz000003", d(2024, 1, 2), 0.0, 5e6, 5e6));
        assert_eq!(seed.prev_close, 0.0);
        assert_eq!(seed.last_post_float_shares, 0.0);
        assert_eq!(seed.last_post_total_shares, 0.0);
        assert_eq!(seed.as_of, d(2024, 1, 2));

        // resumes after the row instead of recomputing from the first bar
        let store = Arc::new(MemoryStore::new());
        store.put_basics(vec![basic("sz000003", d(2024, 1, 2), 0.0, 0.0, 0.0)]);
        let resolver = BasicStateResolver::build(store, d(2024, 1, 2)).unwrap();
        let resolved = resolver.resolve("sz000003").unwrap().unwrap();
        assert_eq!(resolved.as_of, d(2024, 1, 2));
        assert_eq!(resolved.prev_close, 0.0);
    }

    #[test]
    fn test_basic_resolver_bulk_then_fallback() {
        let store = Arc::new(MemoryStore::new());
        store.put_basics(vec![
            basic("sh600000", d(2024, 1, 2), 10.0, 1e7, 2e7),
            basic("sh600000", d(2024, 1, 3), 20.0, 2e7, 4e7),
            // suspended before the boundary
            basic("sz000001", d(2023, 12, 29), 5.0, 5e6, 5e6),
        ]);

        let resolver = BasicStateResolver::build(store.clone(), d(2024, 1, 3)).unwrap();
        let sh = resolver.resolve("sh600000").unwrap().unwrap();
        assert_eq!(sh.prev_close, 20.0);
        assert_eq!(sh.as_of, d(2024, 1, 3));

        let sz = resolver.resolve("sz000001").unwrap().unwrap();
        assert_eq!(sz.as_of, d(2023, 12, 29));
        assert_eq!(sz.last_post_float_shares, 100.0);

        assert!(resolver.resolve("bj430047").unwrap().is_none());
    }

    #[test]
    fn test_basic_resolver_reports_fallback_failure() {
        let store = Arc::new(MemoryStore::new());
        store.fail_symbol("sz000002");
        let resolver = BasicStateResolver::build(store, d(2024, 1, 3)).unwrap();
        let err = resolver.resolve("sz000002").unwrap_err();
        assert!(matches!(err, EngineError::DataAccess { ref symbol, .. } if symbol == "sz000002"));
    }

    #[test]
    fn test_factor_resolver_uses_bulk_group_at_boundary() {
        let store = Arc::new(MemoryStore::new());
        store.put_basics(vec![
            basic("sh600000", d(2024, 1, 3), 10.0, 0.0, 0.0),
            basic("sh600000", d(2024, 1, 4), 10.5, 0.0, 0.0),
            basic("sh600000", d(2024, 1, 5), 11.0, 0.0, 0.0),
        ]);
        store.put_factors(vec![factor("sh600000", d(2024, 1, 3), 1.25)]);

        let resolver = FactorStateResolver::build(store, d(2024, 1, 3)).unwrap();
        let seed = resolver.resolve("sh600000").unwrap().unwrap();
        assert_eq!(seed.last_hfq, 1.25);
        assert_eq!(seed.prev_close, 10.0);
        assert_eq!(seed.as_of, d(2024, 1, 3));
        let pending: Vec<_> = seed.pending.iter().map(|r| r.date).collect();
        assert_eq!(pending, vec![d(2024, 1, 4), d(2024, 1, 5)]);

        assert!(resolver.resolve("sz000001").unwrap().is_none());
    }

    #[test]
    fn test_factor_resolver_falls_back_for_lagging_symbol() {
        let store = Arc::new(MemoryStore::new());
        store.put_basics(vec![
            basic("sz000001", d(2023, 12, 28), 4.0, 0.0, 0.0),
            basic("sz000001", d(2023, 12, 29), 5.0, 0.0, 0.0),
            basic("sz000001", d(2024, 1, 4), 5.5, 0.0, 0.0),
            basic("sh600000", d(2024, 1, 3), 10.0, 0.0, 0.0),
        ]);
        store.put_factors(vec![
            factor("sz000001", d(2023, 12, 29), 2.0),
            factor("sh600000", d(2024, 1, 3), 1.0),
        ]);

        let resolver = FactorStateResolver::build(store, d(2024, 1, 3)).unwrap();
        let seed = resolver.resolve("sz000001").unwrap().unwrap();
        assert_eq!(seed.prev_close, 5.0);
        assert_eq!(seed.pending.len(), 1);
        assert_eq!(seed.pending[0].date, d(2024, 1, 4));
    }

    #[test]
    fn test_factor_resolver_missing_anchor_is_data_access_error() {
        let store = Arc::new(MemoryStore::new());
        store.put_factors(vec![factor("sh600000", d(2024, 1, 3), 1.0)]);
        let resolver = FactorStateResolver::build(store, d(2024, 1, 3)).unwrap();
        assert!(matches!(
            resolver.resolve("sh600000"),
            Err(EngineError::DataAccess { .. })
        ));
    }
}
