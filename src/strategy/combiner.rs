// =============================================================================
// Strategy combiner — regime-aware weighted ensemble vote
// =============================================================================
//
// Votes: BUY = +1, SELL = -1, HOLD = 0. With regime weights w_i and
// confidences c_i:
//
//   strength = sum(w_i * vote_i * c_i) / sum(w_i)      (signed, [-100, 100])
//   avg_conf = sum(w_i * c_i) / sum(w_i)
//
// The final action is BUY when strength exceeds
// `buy_threshold/100 * avg_conf` (SELL mirrored), and is forced to HOLD
// whenever the combined confidence falls below the smaller action threshold.
// Tie-breaks: an exact tie holds; when the weighted BUY and SELL masses are
// within 1 point the highest-confidence individual strategy decides.
//
// A fallback advisory signal has its weight redistributed proportionally to
// the three quantitative strategies before combination.
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::WeightOverrides;
use crate::strategy::regime::{MarketRegime, RegimeAssessment, StrategyWeights};
use crate::strategy::Signal;
use crate::types::{Action, Pair};

/// Explainability payload carried with every combined signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDetails {
    pub market_regime: MarketRegime,
    pub hard_bear: bool,
    /// Strategy name -> weight actually used this cycle.
    pub weights: BTreeMap<String, f64>,
    /// Strategy name -> regime suitability, for the dashboard.
    pub suitability: BTreeMap<String, f64>,
    pub individual_strategies: BTreeMap<String, Signal>,
}

/// The ensemble output for one pair in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CombinedSignal {
    pub pair: Pair,
    pub action: Action,
    /// Normalised magnitude of the weighted vote, [0, 100].
    pub confidence: f64,
    /// Mean multiplier of the strategies agreeing with the final action.
    pub position_multiplier: f64,
    pub reasoning: String,
    pub price_change_24h: f64,
    /// Stale market data: confidence was capped at 50.
    pub degraded: bool,
    pub strategy_details: StrategyDetails,
}

/// The four ensemble member signals, in table order.
#[derive(Debug, Clone)]
pub struct EnsembleOutput {
    pub trend: Signal,
    pub mean_reversion: Signal,
    pub momentum: Signal,
    pub advisory: Signal,
}

/// Degraded snapshots cap confidence here.
const DEGRADED_CONFIDENCE_CAP: f64 = 50.0;

/// Weighted-mass gap treated as a tie.
const TIE_BAND: f64 = 1.0;

pub struct Combiner {
    buy_threshold: f64,
    sell_threshold: f64,
    overrides: WeightOverrides,
}

impl Combiner {
    pub fn new(buy_threshold: f64, sell_threshold: f64, overrides: WeightOverrides) -> Self {
        Self {
            buy_threshold,
            sell_threshold,
            overrides,
        }
    }

    /// Combine the four member signals into the per-pair ensemble signal.
    #[allow(clippy::too_many_arguments)]
    pub fn combine(
        &self,
        pair: &Pair,
        assessment: RegimeAssessment,
        outputs: &EnsembleOutput,
        suitability: BTreeMap<String, f64>,
        price_change_24h: f64,
        degraded: bool,
    ) -> CombinedSignal {
        let mut weights = StrategyWeights::for_regime(assessment.regime, &self.overrides);
        if outputs.advisory.fallback {
            weights = weights.without_advisory();
        }

        let entries: [(&str, f64, &Signal); 4] = [
            ("trend", weights.trend, &outputs.trend),
            ("mean_reversion", weights.mean_reversion, &outputs.mean_reversion),
            ("momentum", weights.momentum, &outputs.momentum),
            ("advisory", weights.advisory, &outputs.advisory),
        ];

        let sum_w: f64 = entries.iter().map(|(_, w, _)| w).sum();
        let strength: f64 = entries
            .iter()
            .map(|(_, w, s)| w * s.action.vote() * s.confidence)
            .sum::<f64>()
            / sum_w;
        let avg_conf: f64 =
            entries.iter().map(|(_, w, s)| w * s.confidence).sum::<f64>() / sum_w;

        let buy_mass: f64 = entries
            .iter()
            .filter(|(_, _, s)| s.action == Action::Buy)
            .map(|(_, w, s)| w * s.confidence)
            .sum::<f64>()
            / sum_w;
        let sell_mass: f64 = entries
            .iter()
            .filter(|(_, _, s)| s.action == Action::Sell)
            .map(|(_, w, s)| w * s.confidence)
            .sum::<f64>()
            / sum_w;

        // --- Action resolution -------------------------------------------------
        let mut action = if strength.abs() < f64::EPSILON {
            // Exact tie: prefer HOLD.
            Action::Hold
        } else if buy_mass > 0.0 && sell_mass > 0.0 && (buy_mass - sell_mass).abs() <= TIE_BAND {
            // Contested within the tie band: highest individual conviction wins.
            entries
                .iter()
                .filter(|(_, _, s)| s.action.is_actionable())
                .max_by(|a, b| a.2.confidence.total_cmp(&b.2.confidence))
                .map(|(_, _, s)| s.action)
                .unwrap_or(Action::Hold)
        } else if strength > self.buy_threshold / 100.0 * avg_conf {
            Action::Buy
        } else if strength < -(self.sell_threshold / 100.0) * avg_conf {
            Action::Sell
        } else {
            Action::Hold
        };

        // --- Confidence --------------------------------------------------------
        let mut confidence = strength.abs().clamp(0.0, 100.0);
        if degraded {
            confidence = confidence.min(DEGRADED_CONFIDENCE_CAP);
        }

        // Below the smaller action threshold the engine never acts.
        if confidence < self.buy_threshold.min(self.sell_threshold) {
            action = Action::Hold;
        }

        // --- Sizing hint -------------------------------------------------------
        let agreeing: Vec<&Signal> = entries
            .iter()
            .filter(|(_, _, s)| s.action == action && action.is_actionable())
            .map(|(_, _, s)| *s)
            .collect();
        let position_multiplier = if agreeing.is_empty() {
            1.0
        } else {
            agreeing.iter().map(|s| s.position_multiplier).sum::<f64>() / agreeing.len() as f64
        };

        let reasoning = format!(
            "{} regime: strength {strength:.1}, weighted confidence {avg_conf:.1}; \
             trend={}({:.0}) mean_reversion={}({:.0}) momentum={}({:.0}) advisory={}({:.0})",
            assessment.regime,
            outputs.trend.action,
            outputs.trend.confidence,
            outputs.mean_reversion.action,
            outputs.mean_reversion.confidence,
            outputs.momentum.action,
            outputs.momentum.confidence,
            outputs.advisory.action,
            outputs.advisory.confidence,
        );

        debug!(
            %pair,
            %action,
            confidence = format!("{confidence:.1}"),
            strength = format!("{strength:.1}"),
            regime = %assessment.regime,
            "signals combined"
        );

        let weights_map = BTreeMap::from([
            ("trend".to_string(), weights.trend),
            ("mean_reversion".to_string(), weights.mean_reversion),
            ("momentum".to_string(), weights.momentum),
            ("advisory".to_string(), weights.advisory),
        ]);
        let individual = BTreeMap::from([
            ("trend".to_string(), outputs.trend.clone()),
            ("mean_reversion".to_string(), outputs.mean_reversion.clone()),
            ("momentum".to_string(), outputs.momentum.clone()),
            ("advisory".to_string(), outputs.advisory.clone()),
        ]);

        CombinedSignal {
            pair: pair.clone(),
            action,
            confidence,
            position_multiplier,
            reasoning,
            price_change_24h,
            degraded,
            strategy_details: StrategyDetails {
                market_regime: assessment.regime,
                hard_bear: assessment.hard_bear,
                weights: weights_map,
                suitability,
                individual_strategies: individual,
            },
        }
    }
}
