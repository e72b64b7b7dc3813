// =============================================================================
// Bollinger Bands (20, 2σ)
// =============================================================================

use crate::indicators::sma::latest_sma;

/// The latest Bollinger Band reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bollinger {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Population standard deviation of the window.
    pub std_dev: f64,
    /// std_dev expressed as a fraction of the middle band; used for the
    /// mean-reversion z-score.
    pub std_pct: f64,
}

/// Compute the latest Bollinger Bands over the final `period` closes.
///
/// Returns `None` on insufficient data or a non-positive middle band.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<Bollinger> {
    if period == 0 || closes.len() < period {
        return None;
    }

    let middle = latest_sma(closes, period)?;
    if middle <= 0.0 {
        return None;
    }

    let window = &closes[closes.len() - period..];
    let variance =
        window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period as f64;
    let std_dev = variance.sqrt();

    Some(Bollinger {
        upper: middle + num_std * std_dev,
        middle,
        lower: middle - num_std * std_dev,
        std_dev,
        std_pct: std_dev / middle,
    })
}
