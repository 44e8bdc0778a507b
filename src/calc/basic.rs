use crate::calc::capital::resolve_capital;
use crate::calc::preclose::{pre_close_series, price_change};
use crate::models::{BasicMetricsRecord, CapitalEvent, ExRightsEvent, IncrementState, TradingBar};

/// One basic-metrics row per bar.
///
/// `ex_rights` and `capital` must already exclude events folded into `seed`.
pub fn compute_basic_metrics(
    bars: &[TradingBar],
    ex_rights: &[ExRightsEvent],
    capital: &[CapitalEvent],
    seed: Option<&IncrementState>,
) -> Vec<BasicMetricsRecord> {
    let pre_closes = pre_close_series(bars, ex_rights, seed.map(|s| s.prev_close));
    let shares = resolve_capital(
        bars,
        capital,
        seed.map(|s| (s.last_post_float_shares, s.last_post_total_shares)),
    );

    bars.iter()
        .zip(pre_closes)
        .zip(shares)
        .map(|((bar, pre_close), cap)| {
            let (change_percent, amplitude) = price_change(bar, pre_close);
            BasicMetricsRecord {
                date: bar.date,
                symbol: bar.symbol.clone(),
                close: bar.close,
                pre_close,
                change_percent,
                amplitude,
                turnover: cap.turnover,
                float_mv: cap.float_mv,
                total_mv: cap.total_mv,
            }
        })
        .collect()
}
