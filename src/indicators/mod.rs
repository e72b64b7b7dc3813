// =============================================================================
// Technical Indicators
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators used by the
// strategies. Every public function returns `Option<T>` or an empty vec so
// callers are forced to handle insufficient-data and numerical edge cases.
// `IndicatorSet` aggregates one reading of everything for a single pair.
// =============================================================================

pub mod atr;
pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

use crate::market_data::Candle;

pub use bollinger::Bollinger;
pub use macd::Macd;

/// Longest lookback among the indicators (SMA-50); a window needs one more
/// sample than this before a pair can participate in a cycle.
pub const LARGEST_PERIOD: usize = 50;

/// Minimum candle count for `IndicatorSet::compute` to succeed.
pub const MIN_SAMPLES: usize = LARGEST_PERIOD + 1;

/// Window used for the normalised-volatility estimate in regime detection.
const VOLATILITY_WINDOW: usize = 30;

/// One complete indicator reading for a single pair, derived from its candle
/// window every cycle and never persisted.
#[derive(Debug, Clone)]
pub struct IndicatorSet {
    pub last_price: f64,
    pub last_volume: f64,
    pub rsi: f64,
    pub macd: Macd,
    pub bollinger: Bollinger,
    pub sma_20: f64,
    pub sma_50: f64,
    pub ema_12: f64,
    pub ema_26: f64,
    pub atr: f64,
    pub volume_sma: f64,
    /// Rolling price changes, percent. When the window is shorter than the
    /// horizon the change is measured from the oldest available candle.
    pub price_change_24h: f64,
    pub price_change_7d: f64,
    pub price_change_30d: f64,
    /// Stdev of the last 30 per-candle returns, scaled by sqrt(30).
    pub normalized_volatility: f64,
}

impl IndicatorSet {
    /// Derive the full indicator set from an oldest-first candle window.
    ///
    /// Returns `None` when fewer than [`MIN_SAMPLES`] candles are available
    /// or any constituent indicator cannot be computed.
    pub fn compute(candles: &[Candle], granularity_sec: u64) -> Option<Self> {
        if candles.len() < MIN_SAMPLES || granularity_sec == 0 {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
        let last_price = *closes.last()?;
        if last_price <= 0.0 {
            return None;
        }

        Some(Self {
            last_price,
            last_volume: *volumes.last()?,
            rsi: rsi::latest_rsi(&closes, 14)?,
            macd: macd::standard_macd(&closes)?,
            bollinger: bollinger::calculate_bollinger(&closes, 20, 2.0)?,
            sma_20: sma::latest_sma(&closes, 20)?,
            sma_50: sma::latest_sma(&closes, 50)?,
            ema_12: ema::latest_ema(&closes, 12)?,
            ema_26: ema::latest_ema(&closes, 26)?,
            atr: atr::calculate_atr(candles, 14)?,
            volume_sma: sma::latest_sma(&volumes, 20)?,
            price_change_24h: rolling_change(&closes, 24 * 3600, granularity_sec),
            price_change_7d: rolling_change(&closes, 7 * 24 * 3600, granularity_sec),
            price_change_30d: rolling_change(&closes, 30 * 24 * 3600, granularity_sec),
            normalized_volatility: normalized_volatility(&closes),
        })
    }
}

/// Percent price change over `horizon_sec`, measured against the close
/// `horizon / granularity` candles back (clamped to the oldest candle).
fn rolling_change(closes: &[f64], horizon_sec: u64, granularity_sec: u64) -> f64 {
    if closes.len() < 2 {
        return 0.0;
    }
    let steps = (horizon_sec / granularity_sec).max(1) as usize;
    let back = steps.min(closes.len() - 1);
    let reference = closes[closes.len() - 1 - back];
    let last = closes[closes.len() - 1];
    if reference <= 0.0 {
        return 0.0;
    }
    (last - reference) / reference * 100.0
}

/// Stdev of the last [`VOLATILITY_WINDOW`] per-candle returns, scaled by the
/// square root of the window so the regime thresholds are lookback-neutral.
fn normalized_volatility(closes: &[f64]) -> f64 {
    if closes.len() < VOLATILITY_WINDOW + 1 {
        return 0.0;
    }
    let window = &closes[closes.len() - VOLATILITY_WINDOW - 1..];
    let returns: Vec<f64> = window
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    variance.sqrt() * (VOLATILITY_WINDOW as f64).sqrt()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_candles(count: usize, start_price: f64, step: f64) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let close = start_price + step * i as f64;
                Candle {
                    time: (i as i64) * 3600,
                    low: close - 0.5,
                    high: close + 0.5,
                    open: close - step,
                    close,
                    volume: 100.0 + i as f64,
                }
            })
            .collect()
    }

    #[test]
    fn compute_requires_min_samples() {
        let candles = synthetic_candles(MIN_SAMPLES - 1, 100.0, 0.1);
        assert!(IndicatorSet::compute(&candles, 3600).is_none());
    }

    #[test]
    fn compute_full_set() {
        let candles = synthetic_candles(120, 100.0, 0.1);
        let set = IndicatorSet::compute(&candles, 3600).unwrap();
        assert!(set.last_price > 100.0);
        assert!(set.rsi > 50.0, "uptrend should have RSI above neutral");
        assert!(set.macd.line > 0.0);
        assert!(set.sma_20 > set.sma_50, "uptrend fast SMA above slow");
        assert!(set.atr > 0.0);
        assert!(set.volume_sma > 0.0);
        assert!(set.price_change_24h > 0.0);
    }

    #[test]
    fn rolling_change_clamps_to_window() {
        // 60 hourly candles cannot cover 30 days; the 30d change must fall
        // back to the full-window change rather than indexing out of range.
        let candles = synthetic_candles(60, 100.0, 1.0);
        let set = IndicatorSet::compute(&candles, 3600).unwrap();
        let full_window = (set.last_price - 100.0) / 100.0 * 100.0;
        assert!((set.price_change_30d - full_window).abs() < 1e-9);
        assert!((set.price_change_7d - full_window).abs() < 1e-9);
        // The 24h horizon (24 candles) does fit.
        assert!(set.price_change_24h < set.price_change_30d);
    }

    #[test]
    fn volatility_zero_for_flat_series() {
        let closes = vec![100.0; 60];
        assert!(normalized_volatility(&closes).abs() < 1e-12);
    }

    #[test]
    fn volatility_grows_with_swing_size() {
        let calm: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.9).sin() * 0.2)
            .collect();
        let wild: Vec<f64> = (0..60)
            .map(|i| 100.0 + (i as f64 * 0.9).sin() * 8.0)
            .collect();
        assert!(normalized_volatility(&wild) > normalized_volatility(&calm));
    }

    #[test]
    fn rolling_change_handles_short_series() {
        assert_eq!(rolling_change(&[100.0], 3600, 3600), 0.0);
        let change = rolling_change(&[100.0, 110.0], 24 * 3600, 3600);
        assert!((change - 10.0).abs() < 1e-10);
    }
}
