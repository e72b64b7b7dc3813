// =============================================================================
// Moving Average Convergence Divergence (12 / 26 / 9)
// =============================================================================
//
// line      = EMA(fast) - EMA(slow), aligned on the slow EMA's start
// signal    = EMA(signal_period) of the line
// histogram = line - signal
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// The latest MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the latest MACD value for `closes`.
///
/// Returns `None` when there is not enough data to produce at least one
/// signal value (`slow + signal_period - 1` closes).
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return None;
    }

    let fast_series = calculate_ema(closes, fast);
    let slow_series = calculate_ema(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // Align: the slow series starts (slow - fast) entries later.
    let offset = slow - fast;
    let line_series: Vec<f64> = slow_series
        .iter()
        .enumerate()
        .map(|(i, &s)| fast_series[i + offset] - s)
        .collect();

    let signal_series = calculate_ema(&line_series, signal_period);
    let signal = *signal_series.last()?;
    let line = *line_series.last()?;

    Some(Macd {
        line,
        signal,
        histogram: line - signal,
    })
}

/// Standard 12/26/9 MACD.
pub fn standard_macd(closes: &[f64]) -> Option<Macd> {
    calculate_macd(closes, 12, 26, 9)
}
