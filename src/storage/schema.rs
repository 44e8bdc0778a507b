//! Table descriptions. Column order is the CSV column order used for bulk
//! loads, so it must match the field order of the row structs.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Varchar,
    Double,
    BigInt,
    Integer,
    Date,
}

impl ColumnType {
    pub fn sql(self) -> &'static str {
        match self {
            ColumnType::Varchar => "VARCHAR",
            ColumnType::Double => "DOUBLE",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Date => "DATE",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

#[derive(Debug)]
pub struct TableSchema {
    pub name: &'static str,
    pub columns: &'static [Column],
    /// Primary key; empty for append-only reference tables.
    pub key: &'static [&'static str],
}

impl TableSchema {
    pub fn create_sql(&self) -> String {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.ty.sql()))
            .collect();
        if !self.key.is_empty() {
            defs.push(format!("PRIMARY KEY ({})", self.key.join(", ")));
        }
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.name, defs.join(", "))
    }

    /// `columns={...}` argument for DuckDB `read_csv`.
    pub fn read_csv_columns(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("'{}': '{}'", c.name, c.ty.sql()))
            .collect();
        format!("{{{}}}", cols.join(", "))
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}

use ColumnType::*;

pub static DAILY_BARS: TableSchema = TableSchema {
    name: "raw_stocks_daily",
    columns: &[
        col("symbol", Varchar),
        col("date", Date),
        col("open", Double),
        col("high", Double),
        col("low", Double),
        col("close", Double),
        col("amount", Double),
        col("volume", BigInt),
    ],
    key: &["symbol", "date"],
};

pub static GBBQ: TableSchema = TableSchema {
    name: "raw_gbbq",
    columns: &[
        col("category", Integer),
        col("symbol", Varchar),
        col("date", Date),
        col("c1", Double),
        col("c2", Double),
        col("c3", Double),
        col("c4", Double),
    ],
    key: &[],
};

pub static BASIC_METRICS: TableSchema = TableSchema {
    name: "raw_basic",
    columns: &[
        col("date", Date),
        col("symbol", Varchar),
        col("close", Double),
        col("pre_close", Double),
        col("change_percent", Double),
        col("amplitude", Double),
        col("turnover", Double),
        col("float_mv", Double),
        col("total_mv", Double),
    ],
    key: &["symbol", "date"],
};

pub static ADJUST_FACTORS: TableSchema = TableSchema {
    name: "raw_adjust_factor",
    columns: &[
        col("date", Date),
        col("symbol", Varchar),
        col("qfq_factor", Double),
        col("hfq_factor", Double),
    ],
    key: &["symbol", "date"],
};

/// The set of tables a repository manages. Built once in `main` and handed
/// to the repository.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    tables: Vec<&'static TableSchema>,
}

impl SchemaRegistry {
    pub fn standard() -> Self {
        Self {
            tables: vec![&DAILY_BARS, &GBBQ, &BASIC_METRICS, &ADJUST_FACTORS],
        }
    }

    pub fn tables(&self) -> &[&'static TableSchema] {
        &self.tables
    }

    pub fn get(&self, name: &str) -> Option<&'static TableSchema> {
        self.tables.iter().copied().find(|t| t.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BasicMetricsRecord, FactorRecord};
    use chrono::NaiveDate;

    fn csv_header<T: serde::Serialize>(row: &T) -> Vec<String> {
        let mut w = csv::Writer::from_writer(Vec::new());
        w.serialize(row).unwrap();
        let bytes = w.into_inner().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        text.lines().next().unwrap().split(',').map(str::to_string).collect()
    }

    #[test]
    fn test_create_sql() {
        assert_eq!(
            ADJUST_FACTORS.create_sql(),
            "CREATE TABLE IF NOT EXISTS raw_adjust_factor (date DATE, symbol VARCHAR, \
             qfq_factor DOUBLE, hfq_factor DOUBLE, PRIMARY KEY (symbol, date))"
        );
        assert!(!GBBQ.create_sql().contains("PRIMARY KEY"));
    }

    #[test]
    fn test_read_csv_columns() {
        assert_eq!(
            ADJUST_FACTORS.read_csv_columns(),
            "{'date': 'DATE', 'symbol': 'VARCHAR', 'qfq_factor': 'DOUBLE', 'hfq_factor': 'DOUBLE'}"
        );
    }

    #[test]
    fn test_row_structs_match_column_order() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let basic = BasicMetricsRecord {
            date,
            symbol: "sh600000".into(),
            close: 1.0,
            pre_close: 1.0,
            change_percent: 0.0,
            amplitude: 0.0,
            turnover: 0.0,
            float_mv: 0.0,
            total_mv: 0.0,
        };
        assert_eq!(csv_header(&basic), BASIC_METRICS.column_names());

        let factor = FactorRecord { date, symbol: "sh600000".into(), qfq_factor: 1.0, hfq_factor: 1.0 };
        assert_eq!(csv_header(&factor), ADJUST_FACTORS.column_names());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = SchemaRegistry::standard();
        assert_eq!(registry.tables().len(), 4);
        assert_eq!(registry.get("raw_basic").map(|t| t.key.len()), Some(2));
        assert!(registry.get("raw_stocks_1min").is_none());
    }
}
