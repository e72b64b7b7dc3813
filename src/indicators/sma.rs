// =============================================================================
// Simple Moving Average
// =============================================================================

/// Compute the SMA series for `values` with the given `period` (one output
/// per input starting at index `period - 1`).
///
/// # Edge cases
/// - `period == 0` or `values.len() < period` => empty vec
pub fn calculate_sma(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(values.len() - period + 1);
    let mut window_sum: f64 = values[..period].iter().sum();
    result.push(window_sum / period as f64);

    for i in period..values.len() {
        window_sum += values[i] - values[i - period];
        result.push(window_sum / period as f64);
    }

    result
}

/// The most recent SMA value, or `None` on insufficient data.
pub fn latest_sma(values: &[f64], period: usize) -> Option<f64> {
    calculate_sma(values, period).last().copied()
}
