// =============================================================================
// Average True Range (Wilder's smoothing)
// =============================================================================
//
// TR  = max(high - low, |high - prev_close|, |low - prev_close|)
// ATR = Wilder-smoothed TR over `period`
// =============================================================================

use crate::market_data::Candle;

/// Compute the latest ATR over `candles` (oldest-first) with the given
/// `period`.
///
/// Returns `None` when fewer than `period + 1` candles are available.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let true_ranges: Vec<f64> = candles
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let c = &w[1];
            (c.high - c.low)
                .max((c.high - prev_close).abs())
                .max((c.low - prev_close).abs())
        })
        .collect();

    let period_f = period as f64;
    let mut atr = true_ranges[..period].iter().sum::<f64>() / period_f;
    for &tr in &true_ranges[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
    }

    atr.is_finite().then_some(atr)
}
