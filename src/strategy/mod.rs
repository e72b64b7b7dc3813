// =============================================================================
// Strategy layer — ensemble members and their shared contract
// =============================================================================
//
// Strategies are pure functions of their inputs: one `Signal` per
// (pair, strategy, cycle), no cross-cycle state, no mutation of the portfolio
// view. Polymorphism is by capability — anything exposing `analyse` and
// `regime_suitability` can join the ensemble.
// =============================================================================

pub mod advisory;
pub mod combiner;
pub mod mean_reversion;
pub mod momentum;
pub mod regime;
pub mod trend;

use serde::{Deserialize, Serialize};

use crate::indicators::IndicatorSet;
use crate::portfolio::PortfolioView;
use crate::strategy::regime::MarketRegime;
use crate::types::Action;

/// Bounds for the per-signal position multiplier.
pub const POSITION_MULTIPLIER_MIN: f64 = 0.5;
pub const POSITION_MULTIPLIER_MAX: f64 = 1.5;

/// One strategy's opinion about one pair for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: Action,
    /// Conviction in [0, 100].
    pub confidence: f64,
    pub reasoning: String,
    /// Sizing hint in [0.5, 1.5].
    pub position_multiplier: f64,
    /// True when this is a degenerate stand-in (advisory safe-HOLD).
    #[serde(default)]
    pub fallback: bool,
}

impl Signal {
    /// Build a signal, clamping confidence and multiplier into contract range.
    pub fn new(
        action: Action,
        confidence: f64,
        reasoning: impl Into<String>,
        position_multiplier: f64,
    ) -> Self {
        Self {
            action,
            confidence: confidence.clamp(0.0, 100.0),
            reasoning: reasoning.into(),
            position_multiplier: position_multiplier
                .clamp(POSITION_MULTIPLIER_MIN, POSITION_MULTIPLIER_MAX),
            fallback: false,
        }
    }

    /// Neutral signal with the given conviction.
    pub fn hold(confidence: f64, reasoning: impl Into<String>) -> Self {
        Self::new(Action::Hold, confidence, reasoning, 1.0)
    }

    /// The degenerate signal emitted when a strategy cannot form an opinion.
    pub fn safe_hold(reasoning: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            confidence: 0.0,
            reasoning: reasoning.into(),
            position_multiplier: 1.0,
            fallback: true,
        }
    }
}

/// The ensemble-member contract.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce a signal from this cycle's indicators and a read-only
    /// portfolio view. Must be deterministic in its inputs.
    fn analyse(&self, indicators: &IndicatorSet, view: &PortfolioView) -> Signal;

    /// How well this strategy performs under the given regime, in [0, 1].
    /// Surfaced in the decision record for explainability.
    fn regime_suitability(&self, regime: MarketRegime) -> f64;
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_clamps_out_of_range_inputs() {
        let s = Signal::new(Action::Buy, 150.0, "x", 9.0);
        assert_eq!(s.confidence, 100.0);
        assert_eq!(s.position_multiplier, POSITION_MULTIPLIER_MAX);

        let s = Signal::new(Action::Sell, -3.0, "x", 0.1);
        assert_eq!(s.confidence, 0.0);
        assert_eq!(s.position_multiplier, POSITION_MULTIPLIER_MIN);
    }

    #[test]
    fn safe_hold_is_flagged() {
        let s = Signal::safe_hold("advisory unavailable");
        assert_eq!(s.action, Action::Hold);
        assert_eq!(s.confidence, 0.0);
        assert!(s.fallback);
    }

    #[test]
    fn plain_hold_is_not_a_fallback() {
        let s = Signal::hold(30.0, "nothing to do");
        assert!(!s.fallback);
        assert_eq!(s.action, Action::Hold);
        assert_eq!(s.confidence, 30.0);
    }
}
