//! Forward (qfq) and backward (hfq) adjustment factors.
//!
//! Two strategies:
//!
//! * [`full_factors`]: batch over the whole bar history. Builds a timeline
//!   of trading days plus ex-rights dates, forward-fills closes on the
//!   non-trading entries, and derives both factors from the per-step
//!   `pre_close[i+1] / close[i]` ratios. Used for backfills and for symbols
//!   with no factor history.
//! * [`incremental_factors`]: event-flagged continuation over freshly
//!   computed basic-metrics rows, seeded with the last persisted hfq.
//!
//! On trading-day ex-rights dates both produce bit-identical hfq values; see
//! the regression tests at the bottom of this file.

use crate::calc::preclose::{XdxrInfo, adjusted_pre_close, align_ex_rights};
use crate::models::{BasicMetricsRecord, ExRightsEvent, FactorRecord, TradingBar};
use chrono::NaiveDate;
use std::collections::BTreeMap;

/// Ratios closer to 1.0 than this are float noise, not an ex-rights step.
pub const HFQ_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
struct TimelineEntry {
    date: NaiveDate,
    close: f64,
    pre_close: f64,
    is_trade_day: bool,
    xdxr: Option<XdxrInfo>,
}

/// Batch computation over a full, ascending bar history.
pub fn full_factors(bars: &[TradingBar], events: &[ExRightsEvent]) -> Vec<FactorRecord> {
    let Some(last_bar) = bars.last() else {
        return Vec::new();
    };
    let symbol = last_bar.symbol.as_str();

    // events after the last bar have no trading day to land on yet
    let relevant: Vec<&ExRightsEvent> = events.iter().filter(|e| e.date <= last_bar.date).collect();

    if relevant.is_empty() {
        return bars
            .iter()
            .map(|b| FactorRecord {
                date: b.date,
                symbol: b.symbol.clone(),
                qfq_factor: 1.0,
                hfq_factor: 1.0,
            })
            .collect();
    }

    let timeline = build_timeline(bars, &relevant);
    let n = timeline.len();

    let mut ratios = vec![1.0; n];
    for i in 0..n - 1 {
        let cur = &timeline[i];
        if cur.is_trade_day && cur.close != 0.0 {
            ratios[i] = timeline[i + 1].pre_close / cur.close;
        }
    }

    let mut qfq = vec![1.0; n];
    let mut acc = 1.0;
    for i in (0..n).rev() {
        acc *= ratios[i];
        qfq[i] = acc;
    }

    let mut hfq = vec![1.0; n];
    for i in 0..n - 1 {
        let next_pre = timeline[i + 1].pre_close;
        hfq[i + 1] = if next_pre != 0.0 {
            hfq[i] * (timeline[i].close / next_pre)
        } else {
            hfq[i]
        };
    }

    timeline
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_trade_day)
        .map(|(i, e)| FactorRecord {
            date: e.date,
            symbol: symbol.to_string(),
            qfq_factor: qfq[i],
            hfq_factor: hfq[i],
        })
        .collect()
}

fn build_timeline(bars: &[TradingBar], events: &[&ExRightsEvent]) -> Vec<TimelineEntry> {
    let mut by_date: BTreeMap<NaiveDate, TimelineEntry> = bars
        .iter()
        .map(|b| {
            (
                b.date,
                TimelineEntry {
                    date: b.date,
                    close: b.close,
                    pre_close: 0.0,
                    is_trade_day: true,
                    xdxr: None,
                },
            )
        })
        .collect();

    for event in events {
        by_date
            .entry(event.date)
            .or_insert_with(|| TimelineEntry {
                date: event.date,
                close: 0.0,
                pre_close: 0.0,
                is_trade_day: false,
                xdxr: None,
            })
            .xdxr
            .get_or_insert_with(XdxrInfo::default)
            .merge(event);
    }

    let mut timeline: Vec<TimelineEntry> = by_date.into_values().collect();

    let mut last_close = timeline
        .iter()
        .find(|e| e.is_trade_day && e.close > 0.0)
        .map(|e| e.close)
        .unwrap_or(0.0);
    for entry in &mut timeline {
        if entry.is_trade_day && entry.close > 0.0 {
            last_close = entry.close;
        } else {
            entry.close = last_close;
        }
    }

    timeline[0].pre_close = timeline[0].close;
    for i in 1..timeline.len() {
        let prev_close = timeline[i - 1].close;
        let entry = &mut timeline[i];
        entry.pre_close = if prev_close == 0.0 {
            entry.close
        } else {
            adjusted_pre_close(prev_close, entry.xdxr.as_ref())
        };
    }

    timeline
}

/// Continue an hfq chain over `rows` (ascending, all after the seed date).
///
/// A row is an ex-rights day when an event aligns to it, either on its own
/// date or carried forward from a suspended day in between.
pub fn incremental_factors(
    rows: &[BasicMetricsRecord],
    events: &[ExRightsEvent],
    last_hfq: f64,
    prev_close: f64,
) -> Vec<FactorRecord> {
    let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    let flagged = align_ex_rights(&dates, events);

    let mut current_hfq = last_hfq;
    let mut prev_close = prev_close;
    let mut out = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        if flagged.contains_key(&i) && row.pre_close != 0.0 {
            let ratio = prev_close / row.pre_close;
            if (ratio - 1.0).abs() > HFQ_EPSILON {
                current_hfq *= ratio;
            }
        }
        out.push(FactorRecord {
            date: row.date,
            symbol: row.symbol.clone(),
            qfq_factor: 0.0,
            hfq_factor: current_hfq,
        });
        prev_close = row.close;
    }

    derive_qfq(&mut out);
    out
}

/// `qfq[t] = hfq[t] / hfq[latest]` for one symbol's ascending rows.
pub fn derive_qfq(records: &mut [FactorRecord]) {
    let Some(latest) = records.last().map(|r| r.hfq_factor) else {
        return;
    };
    if latest == 0.0 {
        return;
    }
    for r in records.iter_mut() {
        r.qfq_factor = r.hfq_factor / latest;
    }
}
