// =============================================================================
// Trend-following strategy
// =============================================================================
//
// Trend strength and direction are blended from three components:
//   - MACD histogram scaled by ATR              (weight 0.5)
//   - price displacement from the Bollinger mid (weight 0.3)
//   - RSI displacement from neutral             (weight 0.2)
//
// BUY when strength >= trend_threshold, direction is up and RSI is not
// overbought (< 75); the SELL rule mirrors with RSI > 25. The position
// multiplier scales 0.7 -> 1.2 linearly with trend strength.
// =============================================================================

use crate::indicators::IndicatorSet;
use crate::portfolio::PortfolioView;
use crate::strategy::regime::MarketRegime;
use crate::strategy::{Signal, Strategy};
use crate::types::Action;

const RSI_OVERBOUGHT: f64 = 75.0;
const RSI_OVERSOLD: f64 = 25.0;

pub struct TrendFollowing {
    trend_threshold: f64,
}

impl TrendFollowing {
    pub fn new(trend_threshold: f64) -> Self {
        Self {
            trend_threshold: trend_threshold.clamp(0.0, 1.0),
        }
    }

    /// Signed trend score in [-1, 1]; magnitude is strength, sign direction.
    fn trend_score(indicators: &IndicatorSet) -> f64 {
        let macd_component = if indicators.atr > 0.0 {
            (indicators.macd.histogram / indicators.atr).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let price_component = if indicators.bollinger.std_dev > 0.0 {
            ((indicators.last_price - indicators.bollinger.middle)
                / (2.0 * indicators.bollinger.std_dev))
                .clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let rsi_component = ((indicators.rsi - 50.0) / 25.0).clamp(-1.0, 1.0);

        0.5 * macd_component + 0.3 * price_component + 0.2 * rsi_component
    }
}

impl Strategy for TrendFollowing {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn analyse(&self, indicators: &IndicatorSet, _view: &PortfolioView) -> Signal {
        let score = Self::trend_score(indicators);
        let strength = score.abs();
        let multiplier = 0.7 + 0.5 * strength;

        if strength >= self.trend_threshold {
            if score > 0.0 && indicators.rsi < RSI_OVERBOUGHT {
                let headroom = (1.0 - self.trend_threshold).max(1e-9);
                let confidence = 55.0 + (strength - self.trend_threshold) / headroom * 40.0;
                return Signal::new(
                    Action::Buy,
                    confidence,
                    format!(
                        "uptrend strength {strength:.2} (macd hist {:.4}, price above mid, rsi {:.1})",
                        indicators.macd.histogram, indicators.rsi
                    ),
                    multiplier,
                );
            }
            if score < 0.0 && indicators.rsi > RSI_OVERSOLD {
                let headroom = (1.0 - self.trend_threshold).max(1e-9);
                let confidence = 55.0 + (strength - self.trend_threshold) / headroom * 40.0;
                return Signal::new(
                    Action::Sell,
                    confidence,
                    format!(
                        "downtrend strength {strength:.2} (macd hist {:.4}, price below mid, rsi {:.1})",
                        indicators.macd.histogram, indicators.rsi
                    ),
                    multiplier,
                );
            }
            // Trend present but RSI exhausted: stand aside.
            return Signal::hold(
                strength * 50.0,
                format!("trend exhausted at rsi {:.1}", indicators.rsi),
            );
        }

        Signal::hold(
            strength * 50.0,
            format!("trend strength {strength:.2} below threshold {:.2}", self.trend_threshold),
        )
    }

    fn regime_suitability(&self, regime: MarketRegime) -> f64 {
        match regime {
            MarketRegime::Bull => 0.9,
            MarketRegime::Bear => 0.8,
            MarketRegime::Sideways => 0.3,
        }
    }
}
