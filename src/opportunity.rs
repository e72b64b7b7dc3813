// =============================================================================
// Opportunity manager — scores, ranks and allocates capital across signals
// =============================================================================
//
// Scoring (clamped to [0, 100]):
//   base  = combined confidence            (HOLD signals are excluded)
//   x 1.2 actionable bonus
//   + momentum bonus  min(10, 2 * (|24h%| - threshold%)) above the threshold
//   + consensus bonus 5 per agreeing strategy, capped at 15
//   + regime bonus    5 when BUY meets BULL or SELL meets BEAR
//
// Allocation over BUY opportunities only, weights score^p / sum(score^p):
//   tradable = max(0, quote_balance - max(reserve_abs, ratio * value))
//   - shares below the minimum per-trade allocation are dropped and weights
//     renormalised over the survivors, iterated to fixpoint
//   - the per-trade cap binds only while two or more opportunities survive;
//     clipped excess is redistributed proportionally to uncapped survivors
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::AllocationSettings;
use crate::strategy::combiner::CombinedSignal;
use crate::strategy::regime::MarketRegime;
use crate::types::{Action, Pair};

/// A combined signal augmented with its score and ranking position.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub signal: CombinedSignal,
    /// Final opportunity score in [0, 100].
    pub score: f64,
    /// Individual strategies agreeing with the combined action.
    pub consensus_count: u32,
    /// Position in the ranked list, 0 = best.
    pub rank: usize,
}

pub struct OpportunityManager {
    settings: AllocationSettings,
}

impl OpportunityManager {
    pub fn new(settings: AllocationSettings) -> Self {
        Self { settings }
    }

    // -------------------------------------------------------------------------
    // Scoring
    // -------------------------------------------------------------------------

    /// Score a single combined signal. `None` for HOLDs and for scores below
    /// the actionable floor.
    pub fn score(&self, signal: &CombinedSignal) -> Option<Opportunity> {
        if !signal.action.is_actionable() {
            return None;
        }

        let consensus_count = signal
            .strategy_details
            .individual_strategies
            .values()
            .filter(|s| s.action == signal.action)
            .count() as u32;

        let mut score = signal.confidence * 1.2;

        let abs_change = signal.price_change_24h.abs();
        if abs_change > self.settings.momentum_threshold_pct {
            score += (2.0 * (abs_change - self.settings.momentum_threshold_pct)).min(10.0);
        }

        score += (consensus_count as f64 * 5.0).min(15.0);

        let aligned = matches!(
            (signal.action, signal.strategy_details.market_regime),
            (Action::Buy, MarketRegime::Bull) | (Action::Sell, MarketRegime::Bear)
        );
        if aligned {
            score += 5.0;
        }

        let score = score.clamp(0.0, 100.0);
        if score < self.settings.min_actionable_confidence {
            debug!(
                pair = %signal.pair,
                score = format!("{score:.1}"),
                floor = self.settings.min_actionable_confidence,
                "opportunity dropped below actionable floor"
            );
            return None;
        }

        Some(Opportunity {
            signal: signal.clone(),
            score,
            consensus_count,
            rank: 0,
        })
    }

    /// Score all signals and produce the ranked list (best first). When the
    /// same pair somehow carries both a BUY and a SELL, the SELL wins and the
    /// BUY is suppressed for the cycle.
    pub fn rank(&self, signals: &[CombinedSignal]) -> Vec<Opportunity> {
        let mut scored: Vec<Opportunity> = signals.iter().filter_map(|s| self.score(s)).collect();

        // SELL-wins suppression per pair.
        let sell_pairs: Vec<Pair> = scored
            .iter()
            .filter(|o| o.signal.action == Action::Sell)
            .map(|o| o.signal.pair.clone())
            .collect();
        scored.retain(|o| {
            o.signal.action != Action::Buy || !sell_pairs.contains(&o.signal.pair)
        });

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        for (rank, opportunity) in scored.iter_mut().enumerate() {
            opportunity.rank = rank;
        }

        info!(count = scored.len(), "opportunities ranked");
        scored
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Quote currency available for BUYs after the reserve floor.
    pub fn tradable_quote(&self, quote_balance: f64, portfolio_value: f64) -> f64 {
        let reserve = self
            .settings
            .min_quote_reserve_absolute
            .max(self.settings.capital_reserve_ratio * portfolio_value);
        (quote_balance - reserve).max(0.0)
    }

    /// Allocate the tradable pool across the BUY opportunities.
    ///
    /// Returns an empty map when no BUY survives (the cycle then executes
    /// only SELLs).
    pub fn allocate(
        &self,
        opportunities: &[Opportunity],
        quote_balance: f64,
        portfolio_value: f64,
    ) -> BTreeMap<String, f64> {
        let tradable = self.tradable_quote(quote_balance, portfolio_value);
        if tradable <= 0.0 {
            debug!("no tradable quote after reserve — allocation empty");
            return BTreeMap::new();
        }

        let mut buys: Vec<(&Opportunity, f64)> = opportunities
            .iter()
            .filter(|o| o.signal.action == Action::Buy && o.score > 0.0)
            .map(|o| (o, 0.0))
            .collect();
        if buys.is_empty() {
            return BTreeMap::new();
        }

        let p = self.settings.allocation_power_factor;

        // --- Minimum-allocation fixpoint -------------------------------------
        loop {
            let total_weight: f64 = buys.iter().map(|(o, _)| o.score.powf(p)).sum();
            if total_weight <= 0.0 {
                return BTreeMap::new();
            }
            for (o, alloc) in buys.iter_mut() {
                *alloc = o.score.powf(p) / total_weight * tradable;
            }

            let before = buys.len();
            buys.retain(|(o, alloc)| {
                let keep = *alloc >= self.settings.min_trade_allocation;
                if !keep {
                    debug!(
                        pair = %o.signal.pair,
                        allocation = format!("{alloc:.2}"),
                        minimum = self.settings.min_trade_allocation,
                        "allocation below minimum — dropped"
                    );
                }
                keep
            });

            if buys.is_empty() {
                return BTreeMap::new();
            }
            if buys.len() == before {
                break;
            }
        }

        // --- Per-trade cap with proportional redistribution -------------------
        // A sole survivor takes the whole pool; the cap only arbitrates
        // between competing opportunities.
        if buys.len() >= 2 {
            let cap = self.settings.max_single_trade_ratio * tradable;
            for _ in 0..buys.len() {
                let excess: f64 = buys
                    .iter()
                    .map(|(_, alloc)| (alloc - cap).max(0.0))
                    .sum();
                if excess <= 1e-9 {
                    break;
                }

                let uncapped_weight: f64 = buys
                    .iter()
                    .filter(|(_, alloc)| *alloc < cap)
                    .map(|(_, alloc)| *alloc)
                    .sum();

                for (_, alloc) in buys.iter_mut() {
                    if *alloc > cap {
                        *alloc = cap;
                    } else if uncapped_weight > 0.0 {
                        *alloc += excess * (*alloc / uncapped_weight);
                    }
                }
            }
        }

        let allocation: BTreeMap<String, f64> = buys
            .iter()
            .map(|(o, alloc)| (o.signal.pair.to_string(), *alloc))
            .collect();

        let total: f64 = allocation.values().sum();
        info!(
            tradable = format!("{tradable:.2}"),
            allocated = format!("{total:.2}"),
            buys = allocation.len(),
            "capital allocated"
        );
        debug_assert!(total <= tradable + 1e-6);

        allocation
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::strategy::combiner::{StrategyDetails, CombinedSignal};
    use crate::strategy::Signal;
    use std::collections::BTreeMap as Map;

    fn manager() -> OpportunityManager {
        OpportunityManager::new(Settings::default().allocation)
    }

    fn signal(
        pair: &str,
        action: Action,
        confidence: f64,
        regime: MarketRegime,
        change_24h: f64,
        agreeing: usize,
    ) -> CombinedSignal {
        let mut individual = Map::new();
        for (i, name) in ["trend", "mean_reversion", "momentum", "advisory"]
            .iter()
            .enumerate()
        {
            let member_action = if i < agreeing { action } else { Action::Hold };
            individual.insert(name.to_string(), Signal::new(member_action, 50.0, "t", 1.0));
        }

        CombinedSignal {
            pair: Pair::parse(pair).unwrap(),
            action,
            confidence,
            position_multiplier: 1.0,
            reasoning: "test".into(),
            price_change_24h: change_24h,
            degraded: false,
            strategy_details: StrategyDetails {
                market_regime: regime,
                hard_bear: false,
                weights: Map::new(),
                suitability: Map::new(),
                individual_strategies: individual,
            },
        }
    }

    /// Force the opportunity's score for allocation-focused tests.
    fn opportunity(pair: &str, action: Action, score: f64) -> Opportunity {
        Opportunity {
            signal: signal(pair, action, score, MarketRegime::Sideways, 0.0, 0),
            score,
            consensus_count: 0,
            rank: 0,
        }
    }

    // ---- scoring ---------------------------------------------------------

    #[test]
    fn hold_signals_are_excluded() {
        let s = signal("BTC-EUR", Action::Hold, 90.0, MarketRegime::Bull, 0.0, 0);
        assert!(manager().score(&s).is_none());
    }

    #[test]
    fn score_composition() {
        // conf 60 * 1.2 = 72; momentum |5| > 3 => +min(10, 4) = 4;
        // consensus 2 => +10; BUY in BULL => +5. Total 91.
        let s = signal("BTC-EUR", Action::Buy, 60.0, MarketRegime::Bull, 5.0, 2);
        let o = manager().score(&s).unwrap();
        assert!((o.score - 91.0).abs() < 1e-9);
        assert_eq!(o.consensus_count, 2);
    }

    #[test]
    fn consensus_bonus_is_capped_at_15() {
        let s = signal("BTC-EUR", Action::Buy, 60.0, MarketRegime::Sideways, 0.0, 4);
        let o = manager().score(&s).unwrap();
        // 72 + 15, no momentum, no regime bonus.
        assert!((o.score - 87.0).abs() < 1e-9);
    }

    #[test]
    fn score_clamped_to_100() {
        let s = signal("BTC-EUR", Action::Buy, 95.0, MarketRegime::Bull, 12.0, 4);
        let o = manager().score(&s).unwrap();
        assert_eq!(o.score, 100.0);
    }

    #[test]
    fn sell_in_bear_gets_alignment_bonus() {
        let bear = manager()
            .score(&signal("BTC-EUR", Action::Sell, 60.0, MarketRegime::Bear, 0.0, 0))
            .unwrap();
        let sideways = manager()
            .score(&signal("BTC-EUR", Action::Sell, 60.0, MarketRegime::Sideways, 0.0, 0))
            .unwrap();
        assert!((bear.score - sideways.score - 5.0).abs() < 1e-9);
    }

    #[test]
    fn low_scores_are_dropped() {
        let s = signal("BTC-EUR", Action::Buy, 40.0, MarketRegime::Sideways, 0.0, 0);
        // 40 * 1.2 = 48 < 50 floor.
        assert!(manager().score(&s).is_none());
    }

    #[test]
    fn rank_orders_by_score_desc() {
        let signals = vec![
            signal("BTC-EUR", Action::Buy, 60.0, MarketRegime::Sideways, 0.0, 0),
            signal("ETH-EUR", Action::Buy, 80.0, MarketRegime::Sideways, 0.0, 0),
            signal("SOL-EUR", Action::Hold, 90.0, MarketRegime::Sideways, 0.0, 0),
        ];
        let ranked = manager().rank(&signals);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].signal.pair.to_string(), "ETH-EUR");
        assert_eq!(ranked[0].rank, 0);
        assert_eq!(ranked[1].rank, 1);
    }

    #[test]
    fn sell_wins_over_buy_for_the_same_pair() {
        let signals = vec![
            signal("BTC-EUR", Action::Buy, 80.0, MarketRegime::Sideways, 0.0, 0),
            signal("BTC-EUR", Action::Sell, 60.0, MarketRegime::Sideways, 0.0, 0),
        ];
        let ranked = manager().rank(&signals);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].signal.action, Action::Sell);
    }

    // ---- allocation ------------------------------------------------------

    #[test]
    fn reserve_floor_applies() {
        let m = manager();
        // max(50, 0.2*1800) = 360.
        assert!((m.tradable_quote(1000.0, 1800.0) - 640.0).abs() < 1e-9);
        // Absolute floor dominates small portfolios.
        assert!((m.tradable_quote(100.0, 100.0) - 50.0).abs() < 1e-9);
        // Nothing tradable when the balance is inside the reserve.
        assert_eq!(m.tradable_quote(40.0, 1000.0), 0.0);
    }

    #[test]
    fn scenario_a_single_buy_takes_full_pool() {
        // Portfolio: quote 1000, value 1800; ETH BUY 70, BTC SELL 80.
        let m = manager();
        let ranked = vec![
            opportunity("BTC-EUR", Action::Sell, 80.0),
            opportunity("ETH-EUR", Action::Buy, 70.0),
        ];
        let allocation = m.allocate(&ranked, 1000.0, 1800.0);
        assert_eq!(allocation.len(), 1);
        assert!((allocation["ETH-EUR"] - 640.0).abs() < 1e-9);
    }

    #[test]
    fn scenario_b_small_shares_are_dropped_to_the_top_pair() {
        // quote 200, portfolio 400 => reserve max(50, 80) = 80 => tradable 120.
        // Scores 90/60/55 at p=1.2 give shares ~0.46/0.28/0.26; the two small
        // allocations fall under the 50 minimum and the survivor absorbs 120.
        let m = manager();
        let ranked = vec![
            opportunity("BTC-EUR", Action::Buy, 90.0),
            opportunity("ETH-EUR", Action::Buy, 60.0),
            opportunity("SOL-EUR", Action::Buy, 55.0),
        ];
        let allocation = m.allocate(&ranked, 200.0, 400.0);
        assert_eq!(allocation.len(), 1);
        assert!((allocation["BTC-EUR"] - 120.0).abs() < 1e-9);
    }

    #[test]
    fn allocation_sums_to_at_most_tradable() {
        let m = manager();
        let ranked = vec![
            opportunity("BTC-EUR", Action::Buy, 90.0),
            opportunity("ETH-EUR", Action::Buy, 85.0),
            opportunity("SOL-EUR", Action::Buy, 80.0),
        ];
        let allocation = m.allocate(&ranked, 1000.0, 1000.0);
        let total: f64 = allocation.values().sum();
        let tradable = m.tradable_quote(1000.0, 1000.0);
        assert!(total <= tradable + 1e-6);
        assert_eq!(allocation.len(), 3);
    }

    #[test]
    fn cap_clips_and_redistributes() {
        let mut settings = Settings::default().allocation;
        settings.min_trade_allocation = 10.0;
        let m = OpportunityManager::new(settings);

        // Balance 150 on a 250 portfolio: reserve max(50, 50) = 50,
        // tradable 100.
        let ranked = vec![
            opportunity("BTC-EUR", Action::Buy, 90.0),
            opportunity("ETH-EUR", Action::Buy, 30.0),
        ];
        let allocation = m.allocate(&ranked, 150.0, 250.0);
        // Raw shares ~78.9/21.1; the cap at 60 clips the leader and hands
        // the excess to the runner-up.
        assert!((allocation["BTC-EUR"] - 60.0).abs() < 1e-6);
        assert!((allocation["ETH-EUR"] - 40.0).abs() < 1e-6);
    }

    #[test]
    fn empty_when_quote_is_inside_reserve() {
        let m = manager();
        let ranked = vec![opportunity("BTC-EUR", Action::Buy, 90.0)];
        assert!(m.allocate(&ranked, 40.0, 1000.0).is_empty());
    }

    #[test]
    fn sells_receive_no_allocation() {
        let m = manager();
        let ranked = vec![opportunity("BTC-EUR", Action::Sell, 90.0)];
        assert!(m.allocate(&ranked, 1000.0, 1000.0).is_empty());
    }
}
