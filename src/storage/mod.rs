pub mod schema;

#[cfg(test)]
pub mod memory;

use crate::models::{BasicMetricsRecord, CorporateActionEvent, FactorRecord, TradingBar};
use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use duckdb::{Connection, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use self::schema::{ADJUST_FACTORS, BASIC_METRICS, DAILY_BARS, GBBQ, SchemaRegistry, TableSchema};

// ── Store abstraction ─────────────────────────────────────────────────────────

/// Typed queries the engine runs against persisted market data. All methods
/// are blocking; workers call them from `spawn_blocking`.
pub trait MarketDataStore: Send + Sync {
    fn list_all_symbols(&self) -> Result<Vec<String>>;

    /// Bars ascending by date, bounds inclusive.
    fn query_trading_bars(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<TradingBar>>;

    fn query_corporate_actions(&self) -> Result<Vec<CorporateActionEvent>>;

    /// Latest basic row per symbol among rows dated on/after `boundary`.
    fn query_latest_basics_since(&self, boundary: NaiveDate) -> Result<Vec<BasicMetricsRecord>>;

    fn query_latest_basic_for_symbol(&self, symbol: &str) -> Result<Option<BasicMetricsRecord>>;

    /// All basic rows dated on/after `boundary`, ordered by symbol then date.
    fn query_basics_since(&self, boundary: NaiveDate) -> Result<Vec<BasicMetricsRecord>>;

    fn query_basics_for_symbol(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<BasicMetricsRecord>>;

    fn query_latest_factor_per_symbol(&self) -> Result<Vec<FactorRecord>>;

    fn latest_basic_date(&self) -> Result<Option<NaiveDate>>;

    fn latest_factor_date(&self) -> Result<Option<NaiveDate>>;

    /// Bulk-load a CSV written by `CsvSink<BasicMetricsRecord>`.
    fn import_basics_csv(&self, path: &Path) -> Result<usize>;

    /// Bulk-load a CSV written by `CsvSink<FactorRecord>`.
    fn import_factors_csv(&self, path: &Path) -> Result<usize>;
}

pub type SharedStore = Arc<dyn MarketDataStore>;

// ── Views ─────────────────────────────────────────────────────────────────────

const VIEWS: &str = r#"
CREATE OR REPLACE VIEW v_bfq_daily AS
SELECT
    s.date,
    s.symbol,
    s.open,
    s.high,
    s.low,
    s.close,
    b.pre_close,
    b.change_percent,
    b.amplitude,
    s.volume,
    s.amount,
    b.turnover,
    b.float_mv,
    b.total_mv
FROM raw_stocks_daily s
LEFT JOIN raw_basic b ON s.symbol = b.symbol AND s.date = b.date;

CREATE OR REPLACE VIEW v_hfq_daily AS
SELECT
    s.date,
    s.symbol,
    ROUND(s.open  * f.hfq_factor, 2) AS open,
    ROUND(s.high  * f.hfq_factor, 2) AS high,
    ROUND(s.low   * f.hfq_factor, 2) AS low,
    ROUND(s.close * f.hfq_factor, 2) AS close,
    b.pre_close,
    s.volume,
    s.amount,
    b.turnover,
    b.float_mv,
    b.total_mv
FROM raw_stocks_daily s
LEFT JOIN raw_adjust_factor f ON s.symbol = f.symbol AND s.date = f.date
LEFT JOIN raw_basic b         ON s.symbol = b.symbol AND s.date = b.date;

CREATE OR REPLACE VIEW v_qfq_daily AS
WITH q AS (
    SELECT
        symbol,
        date,
        hfq_factor / LAST_VALUE(hfq_factor) OVER (
            PARTITION BY symbol ORDER BY date
            ROWS BETWEEN UNBOUNDED PRECEDING AND UNBOUNDED FOLLOWING
        ) AS qfq_factor
    FROM raw_adjust_factor
)
SELECT
    s.date,
    s.symbol,
    ROUND(s.open  * q.qfq_factor, 2) AS open,
    ROUND(s.high  * q.qfq_factor, 2) AS high,
    ROUND(s.low   * q.qfq_factor, 2) AS low,
    ROUND(s.close * q.qfq_factor, 2) AS close,
    b.pre_close,
    s.volume,
    s.amount,
    b.turnover,
    b.float_mv,
    b.total_mv
FROM raw_stocks_daily s
LEFT JOIN q           ON s.symbol = q.symbol AND s.date = q.date
LEFT JOIN raw_basic b ON s.symbol = b.symbol AND s.date = b.date;
"#;

const BASIC_COLUMNS: &str =
    "date, symbol, close, pre_close, change_percent, amplitude, turnover, float_mv, total_mv";

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Mutex<Connection>,
    registry: SchemaRegistry,
}

impl Repository {
    pub fn open(path: &Path, registry: SchemaRegistry) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn: Mutex::new(conn), registry })
    }

    pub fn open_in_memory(registry: SchemaRegistry) -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            registry,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("DuckDB connection mutex poisoned"))
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.lock()?;
        for table in self.registry.tables() {
            conn.execute_batch(&table.create_sql())
                .with_context(|| format!("DDL failed for {}", table.name))?;
        }
        conn.execute_batch(VIEWS).context("View creation failed")?;
        info!("Migrations done ({} tables).", self.registry.tables().len());
        Ok(())
    }

    fn import_csv(&self, table: &TableSchema, path: &Path) -> Result<usize> {
        let path_str = path.to_string_lossy().replace('\'', "''");
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) SELECT * FROM read_csv('{}', header=true, columns={}, dateformat='%Y-%m-%d')",
            table.name,
            table.column_names().join(", "),
            path_str,
            table.read_csv_columns(),
        );
        let n = self
            .lock()?
            .execute(&sql, [])
            .with_context(|| format!("import {:?} into {}", path, table.name))?;
        info!("{}: {} rows imported from {:?}", table.name, n, path);
        Ok(n)
    }

    // ── Bars ──────────────────────────────────────────────────────────────────

    /// Upsert bars, keyed by (symbol, date).
    pub fn upsert_trading_bars(&self, bars: &[TradingBar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"INSERT OR REPLACE INTO raw_stocks_daily
                   (symbol, date, open, high, low, close, amount, volume)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
            )?;
            for bar in bars {
                stmt.execute(params![
                    bar.symbol, bar.date,
                    bar.open, bar.high, bar.low, bar.close,
                    bar.amount, bar.volume,
                ])
                .with_context(|| format!("insert bar {} {}", bar.symbol, bar.date))?;
            }
        }
        tx.commit()?;
        Ok(bars.len())
    }

    // ── GBBQ ──────────────────────────────────────────────────────────────────

    /// The reference file is a full snapshot, so the table is replaced.
    pub fn replace_corporate_actions(&self, events: &[CorporateActionEvent]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", GBBQ.name), [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO raw_gbbq (category, symbol, date, c1, c2, c3, c4) VALUES (?, ?, ?, ?, ?, ?, ?)",
            )?;
            for e in events {
                stmt.execute(params![e.category, e.symbol, e.date, e.c1, e.c2, e.c3, e.c4])
                    .with_context(|| format!("insert gbbq {} {}", e.symbol, e.date))?;
            }
        }
        tx.commit()?;
        Ok(events.len())
    }

    // ── Stats ─────────────────────────────────────────────────────────────────

    pub fn row_count(&self, table: &str) -> Result<i64> {
        let schema = self
            .registry
            .get(table)
            .with_context(|| format!("unknown table {}", table))?;
        let conn = self.lock()?;
        let n = conn.query_row(&format!("SELECT COUNT(*) FROM {}", schema.name), [], |r| r.get(0))?;
        Ok(n)
    }

    pub fn date_range(&self, table: &str) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let schema = self
            .registry
            .get(table)
            .with_context(|| format!("unknown table {}", table))?;
        let conn = self.lock()?;
        let range = conn.query_row(
            &format!("SELECT MIN(date), MAX(date) FROM {}", schema.name),
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(range)
    }

    fn max_date(&self, table: &TableSchema) -> Result<Option<NaiveDate>> {
        let conn = self.lock()?;
        let date = conn.query_row(&format!("SELECT MAX(date) FROM {}", table.name), [], |r| r.get(0))?;
        Ok(date)
    }

    fn query_basics(&self, sql: &str, args: &[&dyn duckdb::ToSql]) -> Result<Vec<BasicMetricsRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, |r| {
                Ok(BasicMetricsRecord {
                    date: r.get(0)?,
                    symbol: r.get(1)?,
                    close: r.get(2)?,
                    pre_close: r.get(3)?,
                    change_percent: r.get(4)?,
                    amplitude: r.get(5)?,
                    turnover: r.get(6)?,
                    float_mv: r.get(7)?,
                    total_mv: r.get(8)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

impl MarketDataStore for Repository {
    fn list_all_symbols(&self) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT symbol FROM {} ORDER BY symbol",
            DAILY_BARS.name
        ))?;
        let syms = stmt
            .query_map([], |r| r.get(0))?
            .collect::<duckdb::Result<Vec<String>>>()?;
        Ok(syms)
    }

    fn query_trading_bars(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<TradingBar>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT symbol, date, open, high, low, close, amount, volume
               FROM raw_stocks_daily
               WHERE symbol = ?
                 AND (CAST(? AS DATE) IS NULL OR date >= ?)
                 AND (CAST(? AS DATE) IS NULL OR date <= ?)
               ORDER BY date"#,
        )?;
        let bars = stmt
            .query_map(params![symbol, from, from, to, to], |r| {
                Ok(TradingBar {
                    symbol: r.get(0)?,
                    date: r.get(1)?,
                    open: r.get(2)?,
                    high: r.get(3)?,
                    low: r.get(4)?,
                    close: r.get(5)?,
                    amount: r.get(6)?,
                    volume: r.get(7)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()
            .with_context(|| format!("query bars for {}", symbol))?;
        Ok(bars)
    }

    fn query_corporate_actions(&self) -> Result<Vec<CorporateActionEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT category, symbol, date, c1, c2, c3, c4 FROM raw_gbbq ORDER BY symbol, date",
        )?;
        let events = stmt
            .query_map([], |r| {
                Ok(CorporateActionEvent {
                    category: r.get(0)?,
                    symbol: r.get(1)?,
                    date: r.get(2)?,
                    c1: r.get(3)?,
                    c2: r.get(4)?,
                    c3: r.get(5)?,
                    c4: r.get(6)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(events)
    }

    fn query_latest_basics_since(&self, boundary: NaiveDate) -> Result<Vec<BasicMetricsRecord>> {
        let sql = format!(
            r#"SELECT {BASIC_COLUMNS} FROM raw_basic
               WHERE date >= ?
               QUALIFY ROW_NUMBER() OVER (PARTITION BY symbol ORDER BY date DESC) = 1"#
        );
        self.query_basics(&sql, &[&boundary])
            .with_context(|| format!("query latest basics since {}", boundary))
    }

    fn query_latest_basic_for_symbol(&self, symbol: &str) -> Result<Option<BasicMetricsRecord>> {
        let sql = format!(
            "SELECT {BASIC_COLUMNS} FROM raw_basic WHERE symbol = ? ORDER BY date DESC LIMIT 1"
        );
        let rows = self
            .query_basics(&sql, &[&symbol])
            .with_context(|| format!("query latest basic for {}", symbol))?;
        Ok(rows.into_iter().next())
    }

    fn query_basics_since(&self, boundary: NaiveDate) -> Result<Vec<BasicMetricsRecord>> {
        let sql = format!(
            "SELECT {BASIC_COLUMNS} FROM raw_basic WHERE date >= ? ORDER BY symbol, date"
        );
        self.query_basics(&sql, &[&boundary])
            .with_context(|| format!("query basics since {}", boundary))
    }

    fn query_basics_for_symbol(
        &self,
        symbol: &str,
        from: Option<NaiveDate>,
    ) -> Result<Vec<BasicMetricsRecord>> {
        let sql = format!(
            r#"SELECT {BASIC_COLUMNS} FROM raw_basic
               WHERE symbol = ? AND (CAST(? AS DATE) IS NULL OR date >= ?)
               ORDER BY date"#
        );
        self.query_basics(&sql, &[&symbol, &from, &from])
            .with_context(|| format!("query basics for {}", symbol))
    }

    fn query_latest_factor_per_symbol(&self) -> Result<Vec<FactorRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"SELECT date, symbol, qfq_factor, hfq_factor FROM raw_adjust_factor
               QUALIFY ROW_NUMBER() OVER (PARTITION BY symbol ORDER BY date DESC) = 1"#,
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok(FactorRecord {
                    date: r.get(0)?,
                    symbol: r.get(1)?,
                    qfq_factor: r.get(2)?,
                    hfq_factor: r.get(3)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()
            .context("query latest factors")?;
        Ok(rows)
    }

    fn latest_basic_date(&self) -> Result<Option<NaiveDate>> {
        self.max_date(&BASIC_METRICS)
    }

    fn latest_factor_date(&self) -> Result<Option<NaiveDate>> {
        self.max_date(&ADJUST_FACTORS)
    }

    fn import_basics_csv(&self, path: &Path) -> Result<usize> {
        self.import_csv(&BASIC_METRICS, path)
    }

    fn import_factors_csv(&self, path: &Path) -> Result<usize> {
        self.import_csv(&ADJUST_FACTORS, path)
    }
}
