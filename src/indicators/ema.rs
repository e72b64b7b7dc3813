// =============================================================================
// Exponential Moving Average
// =============================================================================
//
// Seeded with the SMA of the first `period` values, then smoothed with
// k = 2 / (period + 1). One output value per input starting at index
// `period - 1`.
// =============================================================================

/// Compute the EMA series for `values` with the given `period`.
///
/// # Edge cases
/// - `period == 0` or `values.len() < period` => empty vec
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let k = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &v in &values[period..] {
        let ema = (v - prev) * k + prev;
        result.push(ema);
        prev = ema;
    }

    result
}

/// The most recent EMA value, or `None` on insufficient data.
pub fn latest_ema(values: &[f64], period: usize) -> Option<f64> {
    calculate_ema(values, period).last().copied()
}
