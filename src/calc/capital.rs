//! As-of join of share-capital snapshots onto trading days.

use crate::models::{CapitalEvent, TradingBar};
use crate::utils::round_to;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CapitalMetrics {
    pub turnover: f64,
    pub float_mv: f64,
    pub total_mv: f64,
}

/// Walk bars in order, overwriting the share cursor with every capital event
/// dated on or before each day. Share counts are in 万股.
///
/// `seed` is `(float, total)` carried over from the last persisted row;
/// a new security starts from `(0, 0)`, which yields zero turnover until its
/// first snapshot.
pub fn resolve_capital(
    bars: &[TradingBar],
    events: &[CapitalEvent],
    seed: Option<(f64, f64)>,
) -> Vec<CapitalMetrics> {
    let (mut float_shares, mut total_shares) = seed.unwrap_or((0.0, 0.0));
    let mut cursor = 0usize;

    bars.iter()
        .map(|bar| {
            while cursor < events.len() && events[cursor].date <= bar.date {
                float_shares = events[cursor].float_shares;
                total_shares = events[cursor].total_shares;
                cursor += 1;
            }

            let mut m = CapitalMetrics::default();
            if float_shares > 0.0 {
                m.turnover = round_to(bar.volume as f64 / (float_shares * 10000.0), 6);
                m.float_mv = round_to(float_shares * 10000.0 * bar.close, 2);
            }
            if total_shares > 0.0 {
                m.total_mv = round_to(total_shares * 10000.0 * bar.close, 2);
            }
            m
        })
        .collect()
}
