// =============================================================================
// Relative Strength Index (Wilder's smoothing)
// =============================================================================
//
// avg_gain and avg_loss are seeded with the SMA of the first `period` deltas
// and then smoothed with
//   avg = (prev_avg * (period - 1) + current) / period
// RSI = 100 - 100 / (1 + avg_gain / avg_loss), clamped to 100 when there are
// no losses and pinned at 50 for a flat series.
// =============================================================================

/// Compute the RSI series for `closes` with the given `period`.
///
/// One value per close starting at index `period` (the first `period` closes
/// seed the averages). Returns an empty vec on insufficient data.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let period_f = period as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    // Seed phase over the first `period` deltas.
    for w in closes[..=period].windows(2) {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period_f;
    avg_loss /= period_f;

    let mut result = Vec::with_capacity(closes.len() - period);
    match rsi_value(avg_gain, avg_loss) {
        Some(v) => result.push(v),
        None => return Vec::new(),
    }

    // Wilder smoothing over the remainder.
    for w in closes[period..].windows(2) {
        let delta = w[1] - w[0];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_value(avg_gain, avg_loss) {
            Some(v) => result.push(v),
            None => break,
        }
    }

    result
}

/// The most recent RSI value, or `None` on insufficient data.
pub fn latest_rsi(closes: &[f64], period: usize) -> Option<f64> {
    calculate_rsi(closes, period).last().copied()
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_gain == 0.0 && avg_loss == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
    };
    rsi.is_finite().then_some(rsi)
}
