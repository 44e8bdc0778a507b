//! Ex-rights adjusted previous close.
//!
//! An ex-rights event attaches to the trading day with the same date, or to
//! the first trading day after it when the security was suspended on the
//! event date. Events with no later trading day are dropped.

use crate::models::{ExRightsEvent, TradingBar};
use crate::utils::round_to;
use chrono::NaiveDate;
use std::collections::BTreeMap;
use tracing::warn;

/// Ex-rights fields merged onto one trading day.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct XdxrInfo {
    pub fenhong: f64,
    pub peigu: f64,
    pub peigujia: f64,
    pub songzhuangu: f64,
}

impl XdxrInfo {
    /// Quantities add up; the rights price is a price, so the last non-zero
    /// one wins.
    pub fn merge(&mut self, event: &ExRightsEvent) {
        self.fenhong += event.fenhong;
        self.peigu += event.peigu;
        self.songzhuangu += event.songzhuangu;
        if event.peigujia > 0.0 {
            self.peigujia = event.peigujia;
        }
    }
}

/// Map every event onto an index of `dates` (ascending).
pub fn align_ex_rights(dates: &[NaiveDate], events: &[ExRightsEvent]) -> BTreeMap<usize, XdxrInfo> {
    let mut merged: BTreeMap<usize, XdxrInfo> = BTreeMap::new();
    for event in events {
        let idx = dates.partition_point(|d| *d < event.date);
        if idx < dates.len() {
            merged.entry(idx).or_default().merge(event);
        }
    }
    merged
}

/// Apply the A-share ex-rights formula to one previous close.
pub fn adjusted_pre_close(prev_close: f64, info: Option<&XdxrInfo>) -> f64 {
    let Some(info) = info else {
        return prev_close;
    };
    let denominator = 10.0 + info.peigu + info.songzhuangu;
    if denominator == 0.0 {
        warn!(
            "Malformed ex-rights data (peigu={}, songzhuangu={}); keeping previous close",
            info.peigu, info.songzhuangu
        );
        return prev_close;
    }
    (prev_close * 10.0 - info.fenhong + info.peigu * info.peigujia) / denominator
}

/// Pre-close for every bar. `seed_prev_close` is the last persisted close of
/// a continuation run; a brand-new security uses its own first close.
pub fn pre_close_series(
    bars: &[TradingBar],
    events: &[ExRightsEvent],
    seed_prev_close: Option<f64>,
) -> Vec<f64> {
    let dates: Vec<NaiveDate> = bars.iter().map(|b| b.date).collect();
    let merged = align_ex_rights(&dates, events);

    bars.iter()
        .enumerate()
        .map(|(i, bar)| {
            let prev_close = match i {
                0 => seed_prev_close.unwrap_or(bar.close),
                _ => bars[i - 1].close,
            };
            adjusted_pre_close(prev_close, merged.get(&i))
        })
        .collect()
}

/// (change_percent, amplitude), both zero when `pre_close <= 0`.
pub fn price_change(bar: &TradingBar, pre_close: f64) -> (f64, f64) {
    if pre_close <= 0.0 {
        return (0.0, 0.0);
    }
    let change = (bar.close - pre_close) / pre_close * 100.0;
    let amplitude = (bar.high - bar.low) / pre_close * 100.0;
    (round_to(change, 2), round_to(amplitude, 2))
}
