// =============================================================================
// Performance tracker — snapshots, return/drawdown metrics, reset history
// =============================================================================
//
// Reads the ledger and the trade log, never mutates them. Snapshots are taken
// at the configured frequency, on every executed trade, at startup and on
// explicit reset, and are retained under a bounded window. Win rate and
// profit factor are reconstructed FIFO from the trade log because the ledger
// schema carries no cost basis.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::portfolio::Portfolio;
use crate::storage::{self, DataPaths};
use crate::types::{Side, TradeRecord};

/// Annualised risk-free rate used for Sharpe and Sortino, percent.
const RISK_FREE_RATE_PCT: f64 = 2.0;

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotType {
    Startup,
    Scheduled,
    Trade,
    Reset,
}

/// One entry of `performance/portfolio_snapshots.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp_utc: String,
    pub total_value_quote: f64,
    /// Symbol -> held amount at snapshot time.
    pub composition: BTreeMap<String, f64>,
    /// Asset -> last observed price.
    pub asset_prices: BTreeMap<String, f64>,
    pub snapshot_type: SnapshotType,
    pub session_id: String,
}

/// Append-only record of an administrative tracking reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetEntry {
    pub timestamp_utc: String,
    pub value_before: f64,
    pub composition_before: BTreeMap<String, f64>,
}

/// `performance/performance_config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    pub version: u32,
    pub initial_value_quote: f64,
    pub tracking_since: String,
    #[serde(default)]
    pub reset_history: Vec<ResetEntry>,
}

/// Metrics derived on demand; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub total_return_pct: f64,
    pub annualized_return_pct: f64,
    pub cagr_pct: f64,
    /// Stdev of daily returns x sqrt(365), percent.
    pub volatility_pct: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub closed_trades: usize,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct PerformanceTracker {
    paths: DataPaths,
    session_id: String,
    snapshot_every_secs: i64,
    retention_days: u32,
    snapshots: Vec<PerformanceSnapshot>,
    config: TrackingConfig,
}

impl PerformanceTracker {
    /// Load existing tracking state or initialise it from the ledger.
    pub fn load(
        paths: DataPaths,
        session_id: String,
        snapshot_frequency: &str,
        retention_days: u32,
        portfolio: &Portfolio,
    ) -> Self {
        let snapshot_every_secs = if snapshot_frequency == "daily" {
            24 * 3600
        } else {
            3600
        };

        let snapshots: Vec<PerformanceSnapshot> = if paths.snapshots().exists() {
            storage::read_json(&paths.snapshots()).unwrap_or_default()
        } else {
            Vec::new()
        };

        let config: TrackingConfig = if paths.performance_config().exists() {
            storage::read_json(&paths.performance_config()).unwrap_or_else(|_| {
                Self::fresh_config(portfolio)
            })
        } else {
            Self::fresh_config(portfolio)
        };

        info!(
            snapshots = snapshots.len(),
            initial_value = config.initial_value_quote,
            resets = config.reset_history.len(),
            "performance tracker loaded"
        );

        Self {
            paths,
            session_id,
            snapshot_every_secs,
            retention_days,
            snapshots,
            config,
        }
    }

    fn fresh_config(portfolio: &Portfolio) -> TrackingConfig {
        TrackingConfig {
            version: 1,
            initial_value_quote: portfolio.initial_value_quote,
            tracking_since: Utc::now().to_rfc3339(),
            reset_history: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    /// True when the scheduled cadence is due again.
    pub fn scheduled_due(&self, now: DateTime<Utc>) -> bool {
        let last = self
            .snapshots
            .iter()
            .rev()
            .find(|s| s.snapshot_type == SnapshotType::Scheduled)
            .and_then(|s| DateTime::parse_from_rfc3339(&s.timestamp_utc).ok())
            .map(|t| t.with_timezone(&Utc));
        match last {
            Some(t) => (now - t).num_seconds() >= self.snapshot_every_secs,
            None => true,
        }
    }

    /// Take a snapshot of the ledger and persist the bounded series.
    pub fn snapshot(&mut self, portfolio: &Portfolio, kind: SnapshotType) -> Result<()> {
        let composition: BTreeMap<String, f64> = portfolio
            .holdings
            .iter()
            .map(|(symbol, h)| (symbol.clone(), h.amount))
            .collect();
        let asset_prices: BTreeMap<String, f64> = portfolio
            .holdings
            .iter()
            .filter_map(|(symbol, h)| h.last_price_quote.map(|p| (symbol.clone(), p)))
            .collect();

        self.snapshots.push(PerformanceSnapshot {
            timestamp_utc: Utc::now().to_rfc3339(),
            total_value_quote: portfolio.portfolio_value_quote,
            composition,
            asset_prices,
            snapshot_type: kind,
            session_id: self.session_id.clone(),
        });

        self.prune_retention(Utc::now());
        storage::write_json_atomic(&self.paths.snapshots(), &self.snapshots)?;
        debug!(count = self.snapshots.len(), ?kind, "performance snapshot written");
        Ok(())
    }

    fn prune_retention(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::days(self.retention_days as i64);
        self.snapshots.retain(|s| {
            DateTime::parse_from_rfc3339(&s.timestamp_utc)
                .map(|t| t.with_timezone(&Utc) >= cutoff)
                .unwrap_or(true)
        });
    }

    // -------------------------------------------------------------------------
    // Reset
    // -------------------------------------------------------------------------

    /// Administrative reset: record the pre-reset state in the append-only
    /// history, re-base the ledger and the tracking baseline.
    pub fn reset(&mut self, portfolio: &mut Portfolio) -> Result<()> {
        let entry = ResetEntry {
            timestamp_utc: Utc::now().to_rfc3339(),
            value_before: portfolio.portfolio_value_quote,
            composition_before: portfolio
                .holdings
                .iter()
                .map(|(symbol, h)| (symbol.clone(), h.amount))
                .collect(),
        };
        self.config.reset_history.push(entry);

        portfolio.reset_baseline();
        self.config.initial_value_quote = portfolio.portfolio_value_quote;
        self.config.tracking_since = Utc::now().to_rfc3339();

        storage::write_json_atomic(&self.paths.performance_config(), &self.config)?;
        self.snapshot(portfolio, SnapshotType::Reset)?;
        info!(
            new_baseline = self.config.initial_value_quote,
            resets = self.config.reset_history.len(),
            "performance tracking reset"
        );
        Ok(())
    }

    pub fn persist_config(&self) -> Result<()> {
        storage::write_json_atomic(&self.paths.performance_config(), &self.config)
    }

    // -------------------------------------------------------------------------
    // Metrics
    // -------------------------------------------------------------------------

    /// Derive the full metric set from the snapshot series and trade log.
    pub fn metrics(&self, trades: &[TradeRecord]) -> Metrics {
        let series = self.daily_values();
        let initial = self.config.initial_value_quote;
        let current = series.last().map(|(_, v)| *v).unwrap_or(initial);

        let total_return_pct = if initial > 0.0 {
            (current - initial) / initial * 100.0
        } else {
            0.0
        };

        let tracked_days = self.tracked_days().max(1.0);
        let annualized_return_pct = total_return_pct * 365.0 / tracked_days;
        let cagr_pct = if initial > 0.0 && current > 0.0 {
            ((current / initial).powf(365.0 / tracked_days) - 1.0) * 100.0
        } else {
            0.0
        };

        let daily_returns = Self::daily_returns(&series);
        let volatility_pct = Self::stdev(&daily_returns) * (365.0_f64).sqrt() * 100.0;

        let sharpe = if volatility_pct > 1e-9 {
            (annualized_return_pct - RISK_FREE_RATE_PCT) / volatility_pct
        } else {
            0.0
        };

        let downside: Vec<f64> = daily_returns.iter().copied().filter(|r| *r < 0.0).collect();
        let downside_dev_pct = Self::stdev(&downside) * (365.0_f64).sqrt() * 100.0;
        let sortino = if downside_dev_pct > 1e-9 {
            (annualized_return_pct - RISK_FREE_RATE_PCT) / downside_dev_pct
        } else {
            0.0
        };

        let max_drawdown_pct = Self::max_drawdown(&series) * 100.0;
        let (win_rate, profit_factor, closed_trades) = Self::trade_stats(trades);

        Metrics {
            total_return_pct,
            annualized_return_pct,
            cagr_pct,
            volatility_pct,
            sharpe,
            sortino,
            max_drawdown_pct,
            win_rate,
            profit_factor,
            closed_trades,
        }
    }

    /// One value per calendar day (last snapshot of the day), oldest first.
    fn daily_values(&self) -> Vec<(String, f64)> {
        let mut by_day: BTreeMap<String, f64> = BTreeMap::new();
        for snap in &self.snapshots {
            let day = snap.timestamp_utc.chars().take(10).collect::<String>();
            by_day.insert(day, snap.total_value_quote);
        }
        by_day.into_iter().collect()
    }

    fn tracked_days(&self) -> f64 {
        let since = DateTime::parse_from_rfc3339(&self.config.tracking_since)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        (Utc::now() - since).num_seconds().max(0) as f64 / 86_400.0
    }

    fn daily_returns(series: &[(String, f64)]) -> Vec<f64> {
        series
            .windows(2)
            .filter(|w| w[0].1 > 0.0)
            .map(|w| (w[1].1 - w[0].1) / w[0].1)
            .collect()
    }

    fn stdev(values: &[f64]) -> f64 {
        if values.len() < 2 {
            return 0.0;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        variance.sqrt()
    }

    /// Running-peak maximum drawdown over the daily series, as a fraction.
    fn max_drawdown(series: &[(String, f64)]) -> f64 {
        let mut peak = f64::MIN;
        let mut max_dd = 0.0;
        for (_, value) in series {
            if *value > peak {
                peak = *value;
            }
            if peak > 0.0 {
                let dd = (peak - value) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }
        max_dd
    }

    /// Win rate and profit factor via FIFO matching of SELLs against BUYs,
    /// per pair. UNKNOWN and REJECTED records are ignored.
    fn trade_stats(trades: &[TradeRecord]) -> (f64, f64, usize) {
        let mut lots: HashMap<String, VecDeque<(f64, f64)>> = HashMap::new(); // pair -> (base, price)
        let mut wins = 0usize;
        let mut closed = 0usize;
        let mut gross_profit = 0.0;
        let mut gross_loss = 0.0;

        for trade in trades {
            if trade.base_amount <= 0.0 || trade.price <= 0.0 {
                continue;
            }
            let key = trade.pair.to_string();
            match trade.side {
                Side::Buy => lots
                    .entry(key)
                    .or_default()
                    .push_back((trade.base_amount, trade.price)),
                Side::Sell => {
                    let queue = lots.entry(key).or_default();
                    let mut remaining = trade.base_amount;
                    while remaining > 1e-12 {
                        let (lot_base, lot_price) = match queue.pop_front() {
                            Some(lot) => lot,
                            None => break, // sold inventory predating the log
                        };
                        let matched = lot_base.min(remaining);
                        let pnl = (trade.price - lot_price) * matched;

                        closed += 1;
                        if pnl > 0.0 {
                            wins += 1;
                            gross_profit += pnl;
                        } else {
                            gross_loss += -pnl;
                        }

                        remaining -= matched;
                        if lot_base > matched {
                            queue.push_front((lot_base - matched, lot_price));
                        }
                    }
                }
            }
        }

        let win_rate = if closed > 0 {
            wins as f64 / closed as f64
        } else {
            0.0
        };
        let profit_factor = if gross_loss > 1e-12 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        (win_rate, profit_factor, closed)
    }
}
