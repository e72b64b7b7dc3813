// =============================================================================
// Advisory strategy — wraps the oracle verdict fetched earlier in the cycle
// =============================================================================
//
// The oracle is consulted asynchronously during collection; this strategy is
// the pure, synchronous ensemble member that turns the verdict into a
// `Signal`. A SafeHold verdict becomes the degenerate
// `{HOLD, 0, "advisory unavailable", fallback}` signal, and under the
// hard-bear override a BUY below 85 confidence is demoted to HOLD.
// =============================================================================

use crate::advisor::AdvisorVerdict;
use crate::indicators::IndicatorSet;
use crate::portfolio::PortfolioView;
use crate::strategy::regime::MarketRegime;
use crate::strategy::{Signal, Strategy};
use crate::types::Action;

/// Minimum advisory conviction for a BUY while the hard-bear override is
/// active.
const HARD_BEAR_BUY_CONFIDENCE: f64 = 85.0;

pub struct Advisory {
    verdict: AdvisorVerdict,
    hard_bear: bool,
}

impl Advisory {
    pub fn new(verdict: AdvisorVerdict, hard_bear: bool) -> Self {
        Self { verdict, hard_bear }
    }
}

impl Strategy for Advisory {
    fn name(&self) -> &'static str {
        "advisory"
    }

    fn analyse(&self, _indicators: &IndicatorSet, _view: &PortfolioView) -> Signal {
        match &self.verdict {
            AdvisorVerdict::Opinion {
                action,
                confidence,
                reasoning,
            } => {
                if self.hard_bear
                    && *action == Action::Buy
                    && *confidence < HARD_BEAR_BUY_CONFIDENCE
                {
                    return Signal::hold(
                        *confidence,
                        format!(
                            "advisory BUY ({confidence:.0}) below hard-bear bar of {HARD_BEAR_BUY_CONFIDENCE:.0}: {reasoning}"
                        ),
                    );
                }
                Signal::new(*action, *confidence, reasoning.clone(), 1.0)
            }
            AdvisorVerdict::SafeHold { reason } => Signal::safe_hold(reason.clone()),
        }
    }

    fn regime_suitability(&self, _regime: MarketRegime) -> f64 {
        // The oracle reasons about regime itself; its usefulness is flat.
        0.7
    }
}
