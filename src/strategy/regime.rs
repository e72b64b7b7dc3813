// =============================================================================
// Market regime detection and the per-regime strategy weight table
// =============================================================================
//
// Classification per pair, first match wins:
//
//   BULL      — 30-day change > +2%  AND  normalised volatility < 0.3
//   BEAR      — 30-day change < -2%  AND  normalised volatility < 0.3
//   SIDEWAYS  — everything else
//
// Independently, a cycle-wide hard-bear condition is raised when any pair's
// 7-day change drops below -5%; it tightens risk sizing and the advisory BUY
// gate downstream.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::WeightOverrides;
use crate::indicators::IndicatorSet;

/// Thresholds for the price-change classification, percent.
const BULL_CHANGE_PCT: f64 = 2.0;
const BEAR_CHANGE_PCT: f64 = -2.0;
const MAX_TRENDING_VOLATILITY: f64 = 0.3;

/// 7-day change below this raises the hard-bear override.
pub const HARD_BEAR_CHANGE_PCT: f64 = -5.0;

/// The combiner's classification of current market conditions for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketRegime {
    Bull,
    Bear,
    Sideways,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bull => write!(f, "BULL"),
            Self::Bear => write!(f, "BEAR"),
            Self::Sideways => write!(f, "SIDEWAYS"),
        }
    }
}

/// Regime plus the hard-bear flag for one pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeAssessment {
    pub regime: MarketRegime,
    /// 7-day change < -5%: overrides downstream risk sizing.
    pub hard_bear: bool,
}

/// Classify one pair from its indicator set.
pub fn detect(indicators: &IndicatorSet) -> RegimeAssessment {
    let change_30d = indicators.price_change_30d;
    let change_7d = indicators.price_change_7d;
    let volatility = indicators.normalized_volatility;

    let regime = if change_30d > BULL_CHANGE_PCT && volatility < MAX_TRENDING_VOLATILITY {
        MarketRegime::Bull
    } else if change_30d < BEAR_CHANGE_PCT && volatility < MAX_TRENDING_VOLATILITY {
        MarketRegime::Bear
    } else {
        MarketRegime::Sideways
    };

    let hard_bear = change_7d < HARD_BEAR_CHANGE_PCT;

    debug!(
        regime = %regime,
        hard_bear,
        change_30d = format!("{change_30d:.2}"),
        change_7d = format!("{change_7d:.2}"),
        volatility = format!("{volatility:.4}"),
        "regime detected"
    );

    RegimeAssessment { regime, hard_bear }
}

// ---------------------------------------------------------------------------
// Weight table
// ---------------------------------------------------------------------------

/// Ensemble weights for one regime. Always sums to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyWeights {
    pub trend: f64,
    pub mean_reversion: f64,
    pub momentum: f64,
    pub advisory: f64,
}

impl StrategyWeights {
    pub fn sum(&self) -> f64 {
        self.trend + self.mean_reversion + self.momentum + self.advisory
    }

    /// The built-in table, optionally overridden per regime from config.
    pub fn for_regime(regime: MarketRegime, overrides: &WeightOverrides) -> Self {
        let override_for = match regime {
            MarketRegime::Bull => overrides.bull,
            MarketRegime::Bear => overrides.bear,
            MarketRegime::Sideways => overrides.sideways,
        };
        if let Some([trend, mean_reversion, momentum, advisory]) = override_for {
            return Self {
                trend,
                mean_reversion,
                momentum,
                advisory,
            };
        }

        match regime {
            MarketRegime::Bull => Self {
                trend: 0.35,
                mean_reversion: 0.20,
                momentum: 0.25,
                advisory: 0.20,
            },
            MarketRegime::Bear => Self {
                trend: 0.30,
                mean_reversion: 0.25,
                momentum: 0.25,
                advisory: 0.20,
            },
            MarketRegime::Sideways => Self {
                trend: 0.15,
                mean_reversion: 0.40,
                momentum: 0.25,
                advisory: 0.20,
            },
        }
    }

    /// When the advisory signal is a fallback its weight is handed to the
    /// three quantitative strategies in proportion to their own weights.
    pub fn without_advisory(self) -> Self {
        let rest = self.trend + self.mean_reversion + self.momentum;
        if rest <= 0.0 {
            return self;
        }
        let scale = (rest + self.advisory) / rest;
        Self {
            trend: self.trend * scale,
            mean_reversion: self.mean_reversion * scale,
            momentum: self.momentum * scale,
            advisory: 0.0,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{Bollinger, Macd};

    fn indicators(change_30d: f64, change_7d: f64, volatility: f64) -> IndicatorSet {
        IndicatorSet {
            last_price: 100.0,
            last_volume: 10.0,
            rsi: 50.0,
            macd: Macd {
                line: 0.0,
                signal: 0.0,
                histogram: 0.0,
            },
            bollinger: Bollinger {
                upper: 102.0,
                middle: 100.0,
                lower: 98.0,
                std_dev: 1.0,
                std_pct: 0.01,
            },
            sma_20: 100.0,
            sma_50: 100.0,
            ema_12: 100.0,
            ema_26: 100.0,
            atr: 1.0,
            volume_sma: 10.0,
            price_change_24h: 0.0,
            price_change_7d: change_7d,
            price_change_30d: change_30d,
            normalized_volatility: volatility,
        }
    }

    #[test]
    fn detect_bull() {
        let a = detect(&indicators(5.0, 1.0, 0.1));
        assert_eq!(a.regime, MarketRegime::Bull);
        assert!(!a.hard_bear);
    }

    #[test]
    fn detect_bear() {
        let a = detect(&indicators(-5.0, -2.0, 0.1));
        assert_eq!(a.regime, MarketRegime::Bear);
        assert!(!a.hard_bear);
    }

    #[test]
    fn high_volatility_is_sideways_even_when_trending() {
        let a = detect(&indicators(8.0, 1.0, 0.5));
        assert_eq!(a.regime, MarketRegime::Sideways);
    }

    #[test]
    fn flat_market_is_sideways() {
        let a = detect(&indicators(0.5, 0.2, 0.1));
        assert_eq!(a.regime, MarketRegime::Sideways);
    }

    #[test]
    fn hard_bear_triggers_on_seven_day_drop() {
        let a = detect(&indicators(-1.0, -7.0, 0.5));
        assert!(a.hard_bear);
        // Hard bear is orthogonal to the base classification.
        assert_eq!(a.regime, MarketRegime::Sideways);
    }

    #[test]
    fn weight_table_sums_to_one() {
        let overrides = WeightOverrides::default();
        for regime in [MarketRegime::Bull, MarketRegime::Bear, MarketRegime::Sideways] {
            let w = StrategyWeights::for_regime(regime, &overrides);
            assert!((w.sum() - 1.0).abs() < 1e-12, "{regime} weights must sum to 1");
        }
    }

    #[test]
    fn sideways_favours_mean_reversion() {
        let w = StrategyWeights::for_regime(MarketRegime::Sideways, &WeightOverrides::default());
        assert_eq!(w.mean_reversion, 0.40);
        assert_eq!(w.trend, 0.15);
    }

    #[test]
    fn config_override_wins() {
        let overrides = WeightOverrides {
            bull: Some([0.4, 0.3, 0.2, 0.1]),
            ..Default::default()
        };
        let w = StrategyWeights::for_regime(MarketRegime::Bull, &overrides);
        assert_eq!(w.trend, 0.4);
        assert_eq!(w.advisory, 0.1);
        // Other regimes still use the built-in table.
        let w = StrategyWeights::for_regime(MarketRegime::Bear, &overrides);
        assert_eq!(w.trend, 0.30);
    }

    #[test]
    fn advisory_fallback_redistributes_proportionally() {
        let w = StrategyWeights::for_regime(MarketRegime::Bull, &WeightOverrides::default());
        let r = w.without_advisory();
        assert_eq!(r.advisory, 0.0);
        assert!((r.sum() - 1.0).abs() < 1e-12);
        // Proportions among the survivors are preserved.
        assert!((r.trend / r.momentum - w.trend / w.momentum).abs() < 1e-12);
        assert!(r.trend > w.trend);
    }

    #[test]
    fn regime_serde_uppercase() {
        assert_eq!(
            serde_json::to_string(&MarketRegime::Sideways).unwrap(),
            "\"SIDEWAYS\""
        );
    }
}
