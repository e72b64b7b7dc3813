// =============================================================================
// Momentum strategy
// =============================================================================
//
// Blended score in [-100, +100]:
//   0.4 * price momentum   (24h change, +-10% maps to +-100)
//   0.3 * volume momentum  (volume vs its SMA, signed by price direction)
//   0.3 * technical momentum (RSI displacement + ATR-scaled MACD histogram)
//
// BUY above +70, SELL below -70, HOLD otherwise. The position multiplier
// rises to 1.3 for very strong momentum.
// =============================================================================

use crate::indicators::IndicatorSet;
use crate::portfolio::PortfolioView;
use crate::strategy::regime::MarketRegime;
use crate::strategy::{Signal, Strategy};
use crate::types::Action;

const ENTRY_SCORE: f64 = 70.0;

pub struct Momentum;

impl Momentum {
    pub fn new() -> Self {
        Self
    }

    /// 24h price change, +-10% mapped to +-100.
    fn price_momentum(indicators: &IndicatorSet) -> f64 {
        (indicators.price_change_24h * 10.0).clamp(-100.0, 100.0)
    }

    /// Excess volume over its SMA, signed by the price direction. Volume has
    /// no direction of its own; it only amplifies the move it accompanies.
    fn volume_momentum(indicators: &IndicatorSet) -> f64 {
        if indicators.volume_sma <= 0.0 {
            return 0.0;
        }
        let excess = (indicators.last_volume / indicators.volume_sma - 1.0) * 100.0;
        // signum(0.0) is +1.0; a spike with no price direction must stay flat.
        let direction = if indicators.price_change_24h > 0.0 {
            1.0
        } else if indicators.price_change_24h < 0.0 {
            -1.0
        } else {
            0.0
        };
        (excess.clamp(0.0, 100.0)) * direction
    }

    fn technical_momentum(indicators: &IndicatorSet) -> f64 {
        let rsi_part = ((indicators.rsi - 50.0) * 2.0).clamp(-100.0, 100.0);
        let macd_part = if indicators.atr > 0.0 {
            (indicators.macd.histogram / indicators.atr * 100.0).clamp(-100.0, 100.0)
        } else {
            0.0
        };
        (rsi_part + macd_part) / 2.0
    }

    fn combined_score(indicators: &IndicatorSet) -> f64 {
        0.4 * Self::price_momentum(indicators)
            + 0.3 * Self::volume_momentum(indicators)
            + 0.3 * Self::technical_momentum(indicators)
    }
}

impl Default for Momentum {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for Momentum {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn analyse(&self, indicators: &IndicatorSet, _view: &PortfolioView) -> Signal {
        let score = Self::combined_score(indicators);
        let magnitude = score.abs();

        if magnitude > ENTRY_SCORE {
            let action = if score > 0.0 { Action::Buy } else { Action::Sell };
            // 1.0 at the entry threshold, 1.3 at a maxed-out score.
            let multiplier = 1.0 + ((magnitude - ENTRY_SCORE) / (100.0 - ENTRY_SCORE)) * 0.3;
            return Signal::new(
                action,
                magnitude,
                format!(
                    "momentum {score:.1} (price {:.1}, volume {:.1}, technical {:.1})",
                    Self::price_momentum(indicators),
                    Self::volume_momentum(indicators),
                    Self::technical_momentum(indicators)
                ),
                multiplier,
            );
        }

        Signal::hold(
            magnitude * 0.5,
            format!("momentum {score:.1} inside neutral band"),
        )
    }

    fn regime_suitability(&self, regime: MarketRegime) -> f64 {
        match regime {
            MarketRegime::Bull | MarketRegime::Bear => 0.8,
            MarketRegime::Sideways => 0.4,
        }
    }
}
