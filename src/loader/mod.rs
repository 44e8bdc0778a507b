//! CSV loaders for decoded daily bars and the GBBQ reference table.
//!
//! Bars:  `symbol,date,open,high,low,close,amount,volume`
//! GBBQ:  `category,symbol,date,c1,c2,c3,c4`
//!
//! Dates are `YYYY-MM-DD`. Rows that fail to parse or validate are dropped
//! with a warning; the rest of the file still loads.

use crate::models::{CorporateActionEvent, TradingBar};
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

fn read_rows<T: DeserializeOwned>(path: &Path, validate: impl Fn(&T) -> Option<&'static str>) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Could not open {:?}", path))?;

    let mut rows = Vec::new();
    let mut dropped = 0usize;
    for (i, result) in reader.deserialize::<T>().enumerate() {
        match result {
            Ok(row) => match validate(&row) {
                None => rows.push(row),
                Some(reason) => {
                    warn!("Row {} in {:?}: {}", i + 1, path, reason);
                    dropped += 1;
                }
            },
            Err(e) => {
                warn!("Row {} in {:?}: {}", i + 1, path, e);
                dropped += 1;
            }
        }
    }
    if dropped > 0 {
        debug!("{:?}: {} rows dropped", path, dropped);
    }
    Ok(rows)
}

fn validate_bar(bar: &TradingBar) -> Option<&'static str> {
    if bar.symbol.is_empty() {
        Some("empty symbol")
    } else if bar.close <= 0.0 || bar.open <= 0.0 {
        Some("non-positive price")
    } else if bar.high < bar.low {
        Some("high below low")
    } else if bar.volume < 0 {
        Some("negative volume")
    } else {
        None
    }
}

/// Load one file of decoded bars; symbols are normalised to lower case.
pub fn load_bars_csv(path: &Path) -> Result<Vec<TradingBar>> {
    let mut bars = read_rows(path, validate_bar)?;
    for bar in &mut bars {
        bar.symbol = bar.symbol.to_lowercase();
    }
    info!("{:?}: {} bars loaded", path.file_name().unwrap_or_default(), bars.len());
    Ok(bars)
}

/// Load the GBBQ snapshot.
pub fn load_gbbq_csv(path: &Path) -> Result<Vec<CorporateActionEvent>> {
    let mut events = read_rows(path, |e: &CorporateActionEvent| {
        if e.symbol.is_empty() { Some("empty symbol") } else { None }
    })?;
    for e in &mut events {
        e.symbol = e.symbol.to_lowercase();
    }
    info!("{:?}: {} corporate actions loaded", path, events.len());
    Ok(events)
}

/// `*.csv` files directly under `dir`, sorted by name.
pub fn discover_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(vec![]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|e| e.eq_ignore_ascii_case("csv")) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
