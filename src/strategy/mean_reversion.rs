// =============================================================================
// Mean-reversion strategy
// =============================================================================
//
// Combines RSI extremes with the Bollinger z-score
//   z = (price - bb_middle) / (bb_middle * bb_std_pct)
//
// BUY  when RSI < 30 and z < -1.0   (strong when RSI < 20 and z < -1.5)
// SELL when RSI > 70 and z > +1.0   (strong when RSI > 80 and z > +1.5)
// Confidence: 80 strong, 60 moderate, 40 weak (only one condition met).
// =============================================================================

use crate::indicators::IndicatorSet;
use crate::portfolio::PortfolioView;
use crate::strategy::regime::MarketRegime;
use crate::strategy::{Signal, Strategy};
use crate::types::Action;

const RSI_BUY: f64 = 30.0;
const RSI_BUY_STRONG: f64 = 20.0;
const RSI_SELL: f64 = 70.0;
const RSI_SELL_STRONG: f64 = 80.0;
const Z_ENTRY: f64 = 1.0;
const Z_STRONG: f64 = 1.5;

pub struct MeanReversion;

impl MeanReversion {
    pub fn new() -> Self {
        Self
    }

    fn z_score(indicators: &IndicatorSet) -> Option<f64> {
        let mid = indicators.bollinger.middle;
        let std_pct = indicators.bollinger.std_pct;
        if mid <= 0.0 || std_pct <= 1e-12 {
            return None;
        }
        Some((indicators.last_price - mid) / (mid * std_pct))
    }
}

impl Default for MeanReversion {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for MeanReversion {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn analyse(&self, indicators: &IndicatorSet, _view: &PortfolioView) -> Signal {
        let z = match Self::z_score(indicators) {
            Some(z) => z,
            None => return Signal::hold(0.0, "bands collapsed — no dispersion to revert"),
        };
        let rsi = indicators.rsi;

        // Oversold side.
        if rsi < RSI_BUY && z < -Z_ENTRY {
            let strong = rsi < RSI_BUY_STRONG && z < -Z_STRONG;
            let (confidence, multiplier) = if strong { (80.0, 1.1) } else { (60.0, 1.0) };
            return Signal::new(
                Action::Buy,
                confidence,
                format!("oversold reversion: rsi {rsi:.1}, z {z:.2}"),
                multiplier,
            );
        }

        // Overbought side.
        if rsi > RSI_SELL && z > Z_ENTRY {
            let strong = rsi > RSI_SELL_STRONG && z > Z_STRONG;
            let (confidence, multiplier) = if strong { (80.0, 1.1) } else { (60.0, 1.0) };
            return Signal::new(
                Action::Sell,
                confidence,
                format!("overbought reversion: rsi {rsi:.1}, z {z:.2}"),
                multiplier,
            );
        }

        // Weak: only one of the two conditions fired.
        if rsi < RSI_BUY || z < -Z_ENTRY {
            return Signal::new(
                Action::Buy,
                40.0,
                format!("weak oversold hint: rsi {rsi:.1}, z {z:.2}"),
                0.8,
            );
        }
        if rsi > RSI_SELL || z > Z_ENTRY {
            return Signal::new(
                Action::Sell,
                40.0,
                format!("weak overbought hint: rsi {rsi:.1}, z {z:.2}"),
                0.8,
            );
        }

        Signal::hold(
            20.0,
            format!("price near equilibrium: rsi {rsi:.1}, z {z:.2}"),
        )
    }

    fn regime_suitability(&self, regime: MarketRegime) -> f64 {
        match regime {
            MarketRegime::Sideways => 0.9,
            MarketRegime::Bull | MarketRegime::Bear => 0.6,
        }
    }
}
