// =============================================================================
// Portfolio ledger — the single mutable aggregate of held assets and cash
// =============================================================================
//
// The ledger is owned by the cycle orchestrator; all mutations flow through
// the executor and the exchange-sync step. Strategies receive defensive
// `PortfolioView` copies and can never mutate engine state.
//
// Invariants maintained by every mutation:
//   - every amount >= 0
//   - portfolio_value_quote == quote.amount + sum(asset.amount * last_price)
//   - last_updated is monotonically non-decreasing
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::exchange::AccountBalance;
use crate::storage;
use crate::types::Side;

/// Carried forward on every save so readers can migrate old files.
pub const LEDGER_SCHEMA_VERSION: u32 = 2;

/// Relative tolerance for the value-equation invariant check.
const VALUE_EPSILON: f64 = 1e-6;

// ---------------------------------------------------------------------------
// Holdings
// ---------------------------------------------------------------------------

/// One ledger entry: a held asset or the quote currency itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub amount: f64,
    pub initial_amount: f64,
    /// Last observed price in quote currency. Absent for the quote entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_price_quote: Option<f64>,
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// The persistent ledger (`portfolio.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub version: u32,
    pub quote_currency: String,
    /// Symbol -> holding; includes the quote currency as a priceless entry.
    pub holdings: BTreeMap<String, Holding>,
    pub trades_executed: u64,
    pub portfolio_value_quote: f64,
    pub initial_value_quote: f64,
    /// RFC 3339 UTC; never moves backwards.
    pub last_updated: String,
}

impl Portfolio {
    /// Bootstrap a fresh ledger from an exchange account snapshot and a map
    /// of asset prices. Unpriced dust assets are carried with amount only.
    pub fn from_exchange(
        balances: &[AccountBalance],
        prices: &HashMap<String, f64>,
        quote_currency: &str,
    ) -> Self {
        let mut holdings = BTreeMap::new();

        for balance in balances {
            let total = balance.total();
            if total <= 0.0 {
                continue;
            }
            let last_price_quote = if balance.currency == quote_currency {
                None
            } else {
                prices.get(&balance.currency).copied()
            };
            holdings.insert(
                balance.currency.clone(),
                Holding {
                    amount: total,
                    initial_amount: total,
                    last_price_quote,
                },
            );
        }

        holdings.entry(quote_currency.to_string()).or_insert(Holding {
            amount: 0.0,
            initial_amount: 0.0,
            last_price_quote: None,
        });

        let mut portfolio = Self {
            version: LEDGER_SCHEMA_VERSION,
            quote_currency: quote_currency.to_string(),
            holdings,
            trades_executed: 0,
            portfolio_value_quote: 0.0,
            initial_value_quote: 0.0,
            last_updated: Utc::now().to_rfc3339(),
        };
        portfolio.revalue();
        portfolio.initial_value_quote = portfolio.portfolio_value_quote;

        info!(
            value = portfolio.portfolio_value_quote,
            assets = portfolio.holdings.len(),
            "ledger bootstrapped from exchange snapshot"
        );
        portfolio
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn quote_amount(&self) -> f64 {
        self.holdings
            .get(&self.quote_currency)
            .map(|h| h.amount)
            .unwrap_or(0.0)
    }

    pub fn base_amount(&self, asset: &str) -> f64 {
        self.holdings.get(asset).map(|h| h.amount).unwrap_or(0.0)
    }

    /// Share of the portfolio held as quote currency, in [0,1].
    pub fn quote_share(&self) -> f64 {
        if self.portfolio_value_quote > 0.0 {
            self.quote_amount() / self.portfolio_value_quote
        } else {
            0.0
        }
    }

    /// Check the value-equation invariant without mutating anything.
    pub fn invariant_holds(&self) -> bool {
        let computed = self.computed_value();
        let scale = computed.abs().max(1.0);
        (computed - self.portfolio_value_quote).abs() <= VALUE_EPSILON * scale
    }

    fn computed_value(&self) -> f64 {
        self.holdings
            .iter()
            .map(|(symbol, holding)| {
                if symbol == &self.quote_currency {
                    holding.amount
                } else {
                    holding.amount * holding.last_price_quote.unwrap_or(0.0)
                }
            })
            .sum()
    }

    /// Defensive read-only copy handed to strategies and the advisor.
    pub fn view(&self) -> PortfolioView {
        PortfolioView {
            quote_currency: self.quote_currency.clone(),
            quote_amount: self.quote_amount(),
            portfolio_value_quote: self.portfolio_value_quote,
            holdings: self
                .holdings
                .iter()
                .filter(|(symbol, _)| *symbol != &self.quote_currency)
                .map(|(symbol, h)| (symbol.clone(), h.amount))
                .collect(),
        }
    }

    // -------------------------------------------------------------------------
    // Mutation (executor and exchange-sync only)
    // -------------------------------------------------------------------------

    /// Record a price observation for an asset and revalue.
    pub fn observe_price(&mut self, asset: &str, price: f64) {
        if asset == self.quote_currency || price <= 0.0 {
            return;
        }
        let entry = self.holdings.entry(asset.to_string()).or_insert(Holding {
            amount: 0.0,
            initial_amount: 0.0,
            last_price_quote: None,
        });
        entry.last_price_quote = Some(price);
        self.revalue();
    }

    /// Apply a terminal fill: move value between the quote entry and the base
    /// asset entry, bump the trade counter and revalue.
    pub fn apply_fill(
        &mut self,
        asset: &str,
        side: Side,
        base_amount: f64,
        quote_amount: f64,
        price: f64,
    ) {
        {
            let quote = self
                .holdings
                .entry(self.quote_currency.clone())
                .or_insert(Holding {
                    amount: 0.0,
                    initial_amount: 0.0,
                    last_price_quote: None,
                });
            match side {
                Side::Buy => quote.amount -= quote_amount,
                Side::Sell => quote.amount += quote_amount,
            }
            if quote.amount < 0.0 {
                warn!(
                    amount = quote.amount,
                    "quote balance went negative after fill — clamping to zero"
                );
                quote.amount = 0.0;
            }
        }

        {
            let base = self.holdings.entry(asset.to_string()).or_insert(Holding {
                amount: 0.0,
                initial_amount: 0.0,
                last_price_quote: None,
            });
            match side {
                Side::Buy => base.amount += base_amount,
                Side::Sell => base.amount -= base_amount,
            }
            if base.amount < 0.0 {
                warn!(
                    asset,
                    amount = base.amount,
                    "asset balance went negative after fill — clamping to zero"
                );
                base.amount = 0.0;
            }
            if price > 0.0 {
                base.last_price_quote = Some(price);
            }
        }

        self.trades_executed += 1;
        self.revalue();
    }

    /// Overwrite amounts from a fresh exchange snapshot (reconciliation after
    /// restarts or UNKNOWN orders). Initial amounts and history survive.
    pub fn sync_with_exchange(&mut self, balances: &[AccountBalance]) {
        let mut seen: Vec<String> = Vec::new();

        for balance in balances {
            let total = balance.total();
            seen.push(balance.currency.clone());
            let entry = self
                .holdings
                .entry(balance.currency.clone())
                .or_insert(Holding {
                    amount: 0.0,
                    initial_amount: total,
                    last_price_quote: None,
                });
            entry.amount = total;
        }

        // Assets no longer reported by the exchange are fully spent.
        for (symbol, holding) in self.holdings.iter_mut() {
            if !seen.contains(symbol) && symbol != &self.quote_currency {
                holding.amount = 0.0;
            }
        }

        self.revalue();
        info!(value = self.portfolio_value_quote, "ledger synced with exchange");
    }

    /// Re-base the tracking baseline (administrative reset). The performance
    /// tracker records the pre-reset state separately.
    pub fn reset_baseline(&mut self) {
        for holding in self.holdings.values_mut() {
            holding.initial_amount = holding.amount;
        }
        self.initial_value_quote = self.portfolio_value_quote;
        self.touch();
    }

    /// Recompute `portfolio_value_quote` from holdings and advance the clock.
    pub fn revalue(&mut self) {
        self.portfolio_value_quote = self.computed_value();
        self.touch();
    }

    fn touch(&mut self) {
        let now = Utc::now();
        // last_updated never moves backwards, even across clock adjustments.
        let previous = DateTime::parse_from_rfc3339(&self.last_updated)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now);
        self.last_updated = now.max(previous).to_rfc3339();
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Atomically persist the ledger (tmp + fsync + rename + .bak).
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        storage::write_json_atomic(path, self)
    }

    /// Load the ledger, falling back to the `.bak` sibling on parse failure.
    /// Never silently overwrites a corrupt file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        match storage::read_json::<Self>(path) {
            Ok(portfolio) => Ok(portfolio),
            Err(primary_err) => {
                let bak = storage::backup_path(path);
                warn!(
                    path = %path.display(),
                    error = %primary_err,
                    "ledger unreadable — trying backup"
                );
                storage::read_json::<Self>(&bak).map_err(|_| EngineError::LedgerCorruption {
                    path: path.display().to_string(),
                    reason: primary_err.to_string(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// Read-only portfolio state for strategies and the advisory adapter.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioView {
    pub quote_currency: String,
    pub quote_amount: f64,
    pub portfolio_value_quote: f64,
    /// Asset -> held amount (quote currency excluded).
    pub holdings: HashMap<String, f64>,
}

impl PortfolioView {
    pub fn quote_share(&self) -> f64 {
        if self.portfolio_value_quote > 0.0 {
            self.quote_amount / self.portfolio_value_quote
        } else {
            0.0
        }
    }

    pub fn base_amount(&self, asset: &str) -> f64 {
        self.holdings.get(asset).copied().unwrap_or(0.0)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn balances() -> Vec<AccountBalance> {
        vec![
            AccountBalance {
                currency: "EUR".into(),
                available: 1000.0,
                hold: 0.0,
            },
            AccountBalance {
                currency: "BTC".into(),
                available: 0.02,
                hold: 0.0,
            },
        ]
    }

    fn prices() -> HashMap<String, f64> {
        HashMap::from([("BTC".to_string(), 40_000.0)])
    }

    fn portfolio() -> Portfolio {
        Portfolio::from_exchange(&balances(), &prices(), "EUR")
    }

    #[test]
    fn bootstrap_values_holdings() {
        let p = portfolio();
        assert_eq!(p.version, LEDGER_SCHEMA_VERSION);
        assert!((p.quote_amount() - 1000.0).abs() < 1e-9);
        assert!((p.base_amount("BTC") - 0.02).abs() < 1e-9);
        // 1000 EUR + 0.02 BTC * 40000 = 1800
        assert!((p.portfolio_value_quote - 1800.0).abs() < 1e-9);
        assert_eq!(p.initial_value_quote, p.portfolio_value_quote);
        assert!(p.invariant_holds());
    }

    #[test]
    fn buy_fill_moves_value_and_preserves_invariant() {
        let mut p = portfolio();
        p.apply_fill("ETH", Side::Buy, 0.1, 200.0, 2000.0);
        assert!((p.quote_amount() - 800.0).abs() < 1e-9);
        assert!((p.base_amount("ETH") - 0.1).abs() < 1e-9);
        assert_eq!(p.trades_executed, 1);
        assert!(p.invariant_holds());
        // 800 + 0.02*40000 + 0.1*2000 = 1800
        assert!((p.portfolio_value_quote - 1800.0).abs() < 1e-9);
    }

    #[test]
    fn sell_fill_moves_value_back() {
        let mut p = portfolio();
        p.apply_fill("BTC", Side::Sell, 0.01, 400.0, 40_000.0);
        assert!((p.quote_amount() - 1400.0).abs() < 1e-9);
        assert!((p.base_amount("BTC") - 0.01).abs() < 1e-9);
        assert!(p.invariant_holds());
    }

    #[test]
    fn oversell_clamps_to_zero() {
        let mut p = portfolio();
        p.apply_fill("BTC", Side::Sell, 0.05, 2000.0, 40_000.0);
        assert_eq!(p.base_amount("BTC"), 0.0);
        assert!(p.invariant_holds());
    }

    #[test]
    fn quote_share_tracks_value() {
        let p = portfolio();
        // 1000 / 1800
        assert!((p.quote_share() - 1000.0 / 1800.0).abs() < 1e-9);
    }

    #[test]
    fn observe_price_revalues() {
        let mut p = portfolio();
        p.observe_price("BTC", 50_000.0);
        assert!((p.portfolio_value_quote - (1000.0 + 0.02 * 50_000.0)).abs() < 1e-9);
        assert!(p.invariant_holds());
    }

    #[test]
    fn sync_overwrites_amounts_but_keeps_baseline() {
        let mut p = portfolio();
        let initial_value = p.initial_value_quote;
        let fresh = vec![
            AccountBalance {
                currency: "EUR".into(),
                available: 500.0,
                hold: 0.0,
            },
            AccountBalance {
                currency: "BTC".into(),
                available: 0.03,
                hold: 0.0,
            },
        ];
        p.sync_with_exchange(&fresh);
        assert!((p.quote_amount() - 500.0).abs() < 1e-9);
        assert!((p.base_amount("BTC") - 0.03).abs() < 1e-9);
        assert_eq!(p.initial_value_quote, initial_value);
        assert!(p.invariant_holds());
    }

    #[test]
    fn sync_zeroes_vanished_assets() {
        let mut p = portfolio();
        let fresh = vec![AccountBalance {
            currency: "EUR".into(),
            available: 1800.0,
            hold: 0.0,
        }];
        p.sync_with_exchange(&fresh);
        assert_eq!(p.base_amount("BTC"), 0.0);
        assert!((p.portfolio_value_quote - 1800.0).abs() < 1e-9);
    }

    #[test]
    fn view_is_a_defensive_copy() {
        let p = portfolio();
        let mut view = p.view();
        view.holdings.insert("BTC".into(), 999.0);
        // Mutating the view leaves the ledger untouched.
        assert!((p.base_amount("BTC") - 0.02).abs() < 1e-9);
        assert!(!view.quote_currency.is_empty());
    }

    #[test]
    fn reset_baseline_rebases() {
        let mut p = portfolio();
        p.apply_fill("BTC", Side::Sell, 0.01, 400.0, 40_000.0);
        p.reset_baseline();
        assert_eq!(p.initial_value_quote, p.portfolio_value_quote);
        assert_eq!(
            p.holdings.get("BTC").unwrap().initial_amount,
            p.base_amount("BTC")
        );
    }

    #[test]
    fn last_updated_is_monotonic() {
        let mut p = portfolio();
        // Force a future timestamp, then mutate: the clock must not go back.
        p.last_updated = "2999-01-01T00:00:00+00:00".into();
        p.revalue();
        assert!(p.last_updated.starts_with("2999"));
    }

    #[test]
    fn save_load_roundtrip_is_stable() {
        let dir = std::env::temp_dir().join(format!("meridian-ledger-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("portfolio.json");

        let p = portfolio();
        p.save(&path).unwrap();
        let loaded = Portfolio::load(&path).unwrap();

        // Loading and re-saving with no mutation is a no-op modulo
        // last_updated.
        assert_eq!(loaded.holdings, p.holdings);
        assert_eq!(loaded.trades_executed, p.trades_executed);
        assert_eq!(loaded.version, p.version);
        assert!((loaded.portfolio_value_quote - p.portfolio_value_quote).abs() < 1e-12);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_falls_back_to_backup() {
        let dir = std::env::temp_dir().join(format!("meridian-ledger-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("portfolio.json");

        let p = portfolio();
        p.save(&path).unwrap();
        // Second save promotes the first file to .bak.
        p.save(&path).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let recovered = Portfolio::load(&path).unwrap();
        assert_eq!(recovered.holdings, p.holdings);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_corrupt_without_backup_errors() {
        let dir = std::env::temp_dir().join(format!("meridian-ledger-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("portfolio.json");
        std::fs::write(&path, "garbage").unwrap();

        match Portfolio::load(&path) {
            Err(EngineError::LedgerCorruption { .. }) => {}
            other => panic!("expected LedgerCorruption, got {other:?}"),
        }

        std::fs::remove_dir_all(&dir).ok();
    }
}
