// =============================================================================
// Risk & position sizer — turns an allocation into a safe order size
// =============================================================================
//
// BUY: candidate = allocation x risk-level multiplier x signal multiplier,
// clamped to the allocation and the per-order maximum; anything below the
// exchange minimum is skipped silently (not an error).
//
// SELL: base size = held x clamp(multiplier x rebalance_factor, 0, 1) where
// the rebalance factor approaches the target quote share without overshooting
// it by more than five percentage points, and falls back to a 0.25 baseline
// exit fraction when the quote share already sits at or above target.
//
// Hard-bear override: BUY risk multiplier x 0.25, per-order maximum reduced
// to 2% of portfolio value, and at most MAX_HARD_BEAR_TRADES trades per cycle
// (enforced by the orchestrator).
// =============================================================================

use tracing::debug;

use crate::config::{AllocationSettings, RiskSettings};
use crate::types::{Pair, RiskLevel};

/// Trades allowed per cycle while the hard-bear override is active.
pub const MAX_HARD_BEAR_TRADES: usize = 3;

/// Hard-bear BUY multiplier and per-order cap.
const HARD_BEAR_RISK_FACTOR: f64 = 0.25;
const HARD_BEAR_MAX_POSITION: f64 = 0.02;

/// Overshoot allowance past the target quote share, as a fraction.
const REBALANCE_OVERSHOOT: f64 = 0.05;

/// Baseline exit fraction when the quote share already meets the target.
const BASELINE_EXIT_FRACTION: f64 = 0.25;

pub struct RiskSizer {
    risk_level: RiskLevel,
    min_trade_amount: f64,
    max_position_size: f64,
    target_quote_allocation: f64,
}

impl RiskSizer {
    pub fn new(risk: &RiskSettings, allocation: &AllocationSettings) -> Self {
        Self {
            risk_level: risk.risk_level,
            min_trade_amount: allocation.min_trade_amount,
            max_position_size: allocation.max_position_size,
            target_quote_allocation: allocation.target_quote_allocation,
        }
    }

    // -------------------------------------------------------------------------
    // BUY sizing
    // -------------------------------------------------------------------------

    /// Quote amount to spend on a BUY, or `None` when the sized trade falls
    /// below the exchange minimum (skip, not an error).
    pub fn size_buy(
        &self,
        pair: &Pair,
        allocation: f64,
        position_multiplier: f64,
        portfolio_value: f64,
        hard_bear: bool,
    ) -> Option<f64> {
        if allocation <= 0.0 {
            return None;
        }

        let mut risk_multiplier = self.risk_level.multiplier();
        let mut per_order_max = self.max_position_size * portfolio_value;
        if hard_bear {
            risk_multiplier *= HARD_BEAR_RISK_FACTOR;
            per_order_max = HARD_BEAR_MAX_POSITION * portfolio_value;
        }

        let size = (allocation * risk_multiplier * position_multiplier)
            .min(allocation)
            .min(per_order_max);

        if size < self.min_trade_amount {
            debug!(
                %pair,
                size = format!("{size:.2}"),
                minimum = self.min_trade_amount,
                "buy below exchange minimum — skipped"
            );
            return None;
        }

        Some(size)
    }

    // -------------------------------------------------------------------------
    // SELL sizing
    // -------------------------------------------------------------------------

    /// Base-asset amount to sell, or `None` when the position is empty or the
    /// sized trade falls below the exchange minimum.
    pub fn size_sell(
        &self,
        pair: &Pair,
        held_base: f64,
        price: f64,
        position_multiplier: f64,
        portfolio_value: f64,
        quote_share: f64,
    ) -> Option<f64> {
        let held_value = held_base * price;
        if held_value <= 0.0 || price <= 0.0 {
            return None;
        }

        let rebalance_factor = self.rebalance_factor(quote_share, portfolio_value, held_value);
        let target_fraction = (position_multiplier * rebalance_factor).clamp(0.0, 1.0);

        // Asset-specific cap: one order never moves more than the per-order
        // maximum share of the portfolio.
        let max_base = self.max_position_size * portfolio_value / price;
        let base = (held_base * target_fraction).min(max_base);

        if base * price < self.min_trade_amount {
            debug!(
                %pair,
                value = format!("{:.2}", base * price),
                minimum = self.min_trade_amount,
                "sell below exchange minimum — skipped"
            );
            return None;
        }

        Some(base)
    }

    /// Fraction of the holding whose sale moves the quote share toward the
    /// target without overshooting it by more than five percentage points.
    fn rebalance_factor(&self, quote_share: f64, portfolio_value: f64, held_value: f64) -> f64 {
        if quote_share < self.target_quote_allocation {
            let headroom =
                (self.target_quote_allocation + REBALANCE_OVERSHOOT - quote_share) * portfolio_value;
            (headroom / held_value).clamp(0.0, 1.0)
        } else {
            BASELINE_EXIT_FRACTION
        }
    }
}

impl std::fmt::Debug for RiskSizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskSizer")
            .field("risk_level", &self.risk_level)
            .field("min_trade_amount", &self.min_trade_amount)
            .field("max_position_size", &self.max_position_size)
            .field("target_quote_allocation", &self.target_quote_allocation)
            .finish()
    }
}
