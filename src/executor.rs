// =============================================================================
// Trade executor — turns one ranked opportunity into one exchange order
// =============================================================================
//
// Execution is strictly serial across pairs (the orchestrator holds the cycle
// lock); a per-pair guard additionally rules out concurrent trades on the
// same pair within the process. Client order ids are SHA-256 over
// (pair, cycle id, side, monotonic counter) and therefore unique for the
// process lifetime — a repeat with the same id never produces two orders.
//
// Terminal fills update the ledger (atomic persist), append the trade log and
// arm the cool-down. An UNKNOWN order writes a warning record and leaves the
// ledger untouched for the next cycle's exchange-sync to reconcile.
// =============================================================================

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cooldown::CooldownThrottle;
use crate::errors::ExchangeError;
use crate::exchange::{ExchangeApi, OrderFill, OrderSize};
use crate::opportunity::Opportunity;
use crate::portfolio::Portfolio;
use crate::storage;
use crate::types::{Pair, Side, TradeRecord, TradeStatus};

/// Everything the executor needs for one opportunity.
pub struct ExecutionRequest<'a> {
    pub opportunity: &'a Opportunity,
    pub side: Side,
    pub size: OrderSize,
    /// Ticker midpoint, the simulation fill reference.
    pub ticker_mid: f64,
    pub cycle_id: u64,
}

/// Outcome of one execution attempt. Cycle-fatal failures (authentication,
/// ledger write) are returned as errors instead.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Executed(TradeRecord),
    /// Another trade on the same pair is in flight.
    PairBusy,
    /// The exchange rejected the order. `resync_needed` is set for
    /// insufficient-balance rejections so the orchestrator refetches the
    /// account before the next opportunity.
    Rejected {
        record: TradeRecord,
        resync_needed: bool,
    },
    /// Terminal status unknown; ledger deliberately untouched.
    Unknown(TradeRecord),
}

pub struct TradeExecutor<E> {
    exchange: Arc<E>,
    simulation_mode: bool,
    sim_slippage_bps: f64,
    sim_fee_bps: f64,
    order_counter: AtomicU64,
    pairs_in_flight: Mutex<HashSet<Pair>>,
}

impl<E: ExchangeApi> TradeExecutor<E> {
    pub fn new(
        exchange: Arc<E>,
        simulation_mode: bool,
        sim_slippage_bps: f64,
        sim_fee_bps: f64,
    ) -> Self {
        Self {
            exchange,
            simulation_mode,
            sim_slippage_bps,
            sim_fee_bps,
            order_counter: AtomicU64::new(0),
            pairs_in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Idempotent client order id: SHA-256 hex over the identifying tuple.
    pub fn client_order_id(&self, pair: &Pair, cycle_id: u64, side: Side) -> String {
        let counter = self.order_counter.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(format!("{pair}|{cycle_id}|{side}|{counter}").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Execute one opportunity end-to-end.
    pub async fn execute(
        &self,
        request: ExecutionRequest<'_>,
        ledger: &mut Portfolio,
        ledger_path: &Path,
        trade_log_path: &Path,
        cooldown: &CooldownThrottle,
    ) -> Result<ExecutionOutcome> {
        let pair = &request.opportunity.signal.pair;

        // Per-pair guard.
        if !self.pairs_in_flight.lock().insert(pair.clone()) {
            warn!(%pair, "trade already in flight for pair — skipping");
            return Ok(ExecutionOutcome::PairBusy);
        }
        let result = self
            .execute_guarded(&request, ledger, ledger_path, trade_log_path, cooldown)
            .await;
        self.pairs_in_flight.lock().remove(pair);
        result
    }

    async fn execute_guarded(
        &self,
        request: &ExecutionRequest<'_>,
        ledger: &mut Portfolio,
        ledger_path: &Path,
        trade_log_path: &Path,
        cooldown: &CooldownThrottle,
    ) -> Result<ExecutionOutcome> {
        let pair = &request.opportunity.signal.pair;
        let client_order_id = self.client_order_id(pair, request.cycle_id, request.side);

        let fill = if self.simulation_mode {
            self.simulate_fill(request, &client_order_id)
        } else {
            match self
                .exchange
                .place_market_order(pair, request.side, request.size, &client_order_id)
                .await
            {
                Ok(fill) => fill,
                Err(ExchangeError::InsufficientBalance { need, available }) => {
                    warn!(%pair, need, available, "order rejected: insufficient balance — aborting opportunity");
                    let record = self.record(request, &client_order_id, None, TradeStatus::Rejected);
                    self.append_log(trade_log_path, &record);
                    return Ok(ExecutionOutcome::Rejected {
                        record,
                        resync_needed: true,
                    });
                }
                Err(ExchangeError::OrderRejected { reason, .. }) => {
                    warn!(%pair, reason, "order rejected by exchange");
                    let record = self.record(request, &client_order_id, None, TradeStatus::Rejected);
                    self.append_log(trade_log_path, &record);
                    return Ok(ExecutionOutcome::Rejected {
                        record,
                        resync_needed: false,
                    });
                }
                Err(ExchangeError::OrderUnknown { order_id, .. }) => {
                    warn!(%pair, order_id, "order status unknown — ledger untouched until resync");
                    let mut record =
                        self.record(request, &client_order_id, None, TradeStatus::Unknown);
                    record.order_id = order_id;
                    self.append_log(trade_log_path, &record);
                    return Ok(ExecutionOutcome::Unknown(record));
                }
                Err(e @ ExchangeError::Authentication { .. }) => {
                    return Err(e).context("authentication failure during order placement")
                }
                Err(e) => {
                    warn!(%pair, error = %e, "order placement failed");
                    let record = self.record(request, &client_order_id, None, TradeStatus::Rejected);
                    self.append_log(trade_log_path, &record);
                    return Ok(ExecutionOutcome::Rejected {
                        record,
                        resync_needed: false,
                    });
                }
            }
        };

        // Terminal fill: ledger first (cycle-fatal on failure), then the log.
        let status = if self.simulation_mode {
            TradeStatus::Simulated
        } else if fill.partial {
            TradeStatus::Partial
        } else {
            TradeStatus::Filled
        };

        ledger.apply_fill(
            &pair.base,
            request.side,
            fill.base_amount,
            fill.quote_amount,
            fill.price,
        );
        ledger
            .save(ledger_path)
            .context("ledger write after fill failed")?;

        let record = self.record(request, &client_order_id, Some(&fill), status);
        self.append_log(trade_log_path, &record);

        cooldown.record_trade(pair, request.side, Instant::now());

        info!(
            %pair,
            side = %request.side,
            base = fill.base_amount,
            quote = fill.quote_amount,
            price = fill.price,
            %status,
            "trade executed"
        );

        Ok(ExecutionOutcome::Executed(record))
    }

    // -------------------------------------------------------------------------
    // Simulation
    // -------------------------------------------------------------------------

    /// Deterministic fill at the ticker mid with configured slippage and fee.
    fn simulate_fill(&self, request: &ExecutionRequest<'_>, client_order_id: &str) -> OrderFill {
        let slippage = self.sim_slippage_bps / 10_000.0;
        let fee_rate = self.sim_fee_bps / 10_000.0;

        let price = match request.side {
            Side::Buy => request.ticker_mid * (1.0 + slippage),
            Side::Sell => request.ticker_mid * (1.0 - slippage),
        };

        match (request.side, request.size) {
            (Side::Buy, OrderSize::QuoteFunds(funds)) => {
                let fees = funds * fee_rate;
                OrderFill {
                    order_id: client_order_id.to_string(),
                    base_amount: (funds - fees) / price,
                    quote_amount: funds,
                    price,
                    fees,
                    partial: false,
                }
            }
            (Side::Sell, OrderSize::BaseAmount(base)) => {
                let gross = base * price;
                let fees = gross * fee_rate;
                OrderFill {
                    order_id: client_order_id.to_string(),
                    base_amount: base,
                    quote_amount: gross - fees,
                    price,
                    fees,
                    partial: false,
                }
            }
            // Mismatched denominations cannot be produced by the sizer.
            (side, size) => {
                warn!(?side, ?size, "unexpected size denomination in simulation");
                OrderFill {
                    order_id: client_order_id.to_string(),
                    base_amount: 0.0,
                    quote_amount: 0.0,
                    price,
                    fees: 0.0,
                    partial: false,
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Records
    // -------------------------------------------------------------------------

    fn record(
        &self,
        request: &ExecutionRequest<'_>,
        client_order_id: &str,
        fill: Option<&OrderFill>,
        status: TradeStatus,
    ) -> TradeRecord {
        let signal = &request.opportunity.signal;
        TradeRecord {
            id: Uuid::new_v4().to_string(),
            timestamp_utc: Utc::now().to_rfc3339(),
            pair: signal.pair.clone(),
            side: request.side,
            base_amount: fill.map(|f| f.base_amount).unwrap_or(0.0),
            quote_amount: fill.map(|f| f.quote_amount).unwrap_or(0.0),
            price: fill.map(|f| f.price).unwrap_or(0.0),
            fees: fill.map(|f| f.fees).unwrap_or(0.0),
            strategy: "combined".into(),
            confidence: signal.confidence,
            reasoning: signal.reasoning.clone(),
            order_id: fill
                .map(|f| f.order_id.clone())
                .unwrap_or_else(|| client_order_id.to_string()),
            status,
            pnl: None,
        }
    }

    /// Trade-log append is not cycle-fatal; the ledger is the authority.
    fn append_log(&self, path: &Path, record: &TradeRecord) {
        if let Err(e) = storage::append_trade(path, record) {
            warn!(error = %e, "failed to append trade record");
        }
    }
}

impl<E> std::fmt::Debug for TradeExecutor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeExecutor")
            .field("simulation_mode", &self.simulation_mode)
            .field("orders_issued", &self.order_counter.load(Ordering::SeqCst))
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::exchange::{AccountBalance, OrderReport, Ticker};
    use crate::market_data::Candle;
    use crate::opportunity::OpportunityManager;
    use crate::strategy::combiner::{CombinedSignal, StrategyDetails};
    use crate::strategy::regime::MarketRegime;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap};
    use std::path::PathBuf;
    use std::time::Duration;

    // ---- fixtures --------------------------------------------------------

    enum Script {
        Fill,
        Reject,
        InsufficientBalance,
        Unknown,
    }

    struct ScriptedExchange {
        script: Script,
    }

    #[async_trait]
    impl ExchangeApi for ScriptedExchange {
        async fn get_accounts(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn get_product_ticker(&self, _pair: &Pair) -> Result<Ticker, ExchangeError> {
            unreachable!()
        }

        async fn get_candles(
            &self,
            _pair: &Pair,
            _granularity_sec: u64,
            _lookback: u32,
        ) -> Result<Vec<Candle>, ExchangeError> {
            unreachable!()
        }

        async fn place_market_order(
            &self,
            pair: &Pair,
            _side: Side,
            size: OrderSize,
            client_order_id: &str,
        ) -> Result<OrderFill, ExchangeError> {
            match self.script {
                Script::Fill => Ok(OrderFill {
                    order_id: format!("live-{client_order_id}"),
                    base_amount: 0.01,
                    quote_amount: 400.0,
                    price: 40_000.0,
                    fees: 0.4,
                    partial: false,
                }),
                Script::Reject => Err(ExchangeError::OrderRejected {
                    pair: pair.to_string(),
                    reason: "post only".into(),
                }),
                Script::InsufficientBalance => Err(ExchangeError::InsufficientBalance {
                    need: size.value(),
                    available: 1.0,
                }),
                Script::Unknown => Err(ExchangeError::OrderUnknown {
                    pair: pair.to_string(),
                    order_id: "mystery".into(),
                }),
            }
        }

        async fn get_order(&self, _order_id: &str) -> Result<OrderReport, ExchangeError> {
            unreachable!()
        }
    }

    fn opportunity(pair: &str, action: crate::types::Action, score: f64) -> Opportunity {
        Opportunity {
            signal: CombinedSignal {
                pair: Pair::parse(pair).unwrap(),
                action,
                confidence: score,
                position_multiplier: 1.0,
                reasoning: "test".into(),
                price_change_24h: 0.0,
                degraded: false,
                strategy_details: StrategyDetails {
                    market_regime: MarketRegime::Sideways,
                    hard_bear: false,
                    weights: BTreeMap::new(),
                    suitability: BTreeMap::new(),
                    individual_strategies: BTreeMap::new(),
                },
            },
            score,
            consensus_count: 0,
            rank: 0,
        }
    }

    fn ledger() -> Portfolio {
        Portfolio::from_exchange(
            &[
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
            ],
            &HashMap::from([("BTC".to_string(), 40_000.0)]),
            "EUR",
        )
    }

    fn temp_paths() -> (PathBuf, PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("meridian-exec-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        (
            dir.clone(),
            dir.join("portfolio.json"),
            dir.join("trade_history.json"),
        )
    }

    fn sim_executor() -> TradeExecutor<ScriptedExchange> {
        TradeExecutor::new(
            Arc::new(ScriptedExchange { script: Script::Fill }),
            true,
            5.0,
            10.0,
        )
    }

    fn live_executor(script: Script) -> TradeExecutor<ScriptedExchange> {
        TradeExecutor::new(Arc::new(ScriptedExchange { script }), false, 5.0, 10.0)
    }

    fn cooldown() -> CooldownThrottle {
        CooldownThrottle::new(Duration::from_secs(1800))
    }

    // ---- simulation ------------------------------------------------------

    #[tokio::test]
    async fn simulated_buy_updates_ledger_and_log() {
        let (dir, ledger_path, log_path) = temp_paths();
        let executor = sim_executor();
        let mut portfolio = ledger();
        let throttle = cooldown();
        let opp = opportunity("ETH-EUR", crate::types::Action::Buy, 70.0);

        let outcome = executor
            .execute(
                ExecutionRequest {
                    opportunity: &opp,
                    side: Side::Buy,
                    size: OrderSize::QuoteFunds(200.0),
                    ticker_mid: 2_000.0,
                    cycle_id: 1,
                },
                &mut portfolio,
                &ledger_path,
                &log_path,
                &throttle,
            )
            .await
            .unwrap();

        let record = match outcome {
            ExecutionOutcome::Executed(r) => r,
            other => panic!("expected Executed, got {other:?}"),
        };
        assert_eq!(record.status, TradeStatus::Simulated);
        // 5 bps slippage above mid.
        assert!((record.price - 2_001.0).abs() < 1e-9);
        // 10 bps fee on 200.
        assert!((record.fees - 0.2).abs() < 1e-9);
        assert!((record.quote_amount - 200.0).abs() < 1e-9);

        // Ledger moved and stayed consistent, and was persisted.
        assert!((portfolio.quote_amount() - 800.0).abs() < 1e-9);
        assert!(portfolio.invariant_holds());
        assert!(ledger_path.exists());

        // Trade log has the record, cool-down is armed.
        let trades = storage::load_trades(&log_path);
        assert_eq!(trades.len(), 1);
        assert_eq!(throttle.active_count(Instant::now()), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn simulated_sell_credits_net_proceeds() {
        let (dir, ledger_path, log_path) = temp_paths();
        let executor = sim_executor();
        let mut portfolio = ledger();
        let opp = opportunity("BTC-EUR", crate::types::Action::Sell, 80.0);

        let outcome = executor
            .execute(
                ExecutionRequest {
                    opportunity: &opp,
                    side: Side::Sell,
                    size: OrderSize::BaseAmount(0.01),
                    ticker_mid: 40_000.0,
                    cycle_id: 2,
                },
                &mut portfolio,
                &ledger_path,
                &log_path,
                &cooldown(),
            )
            .await
            .unwrap();

        let record = match outcome {
            ExecutionOutcome::Executed(r) => r,
            other => panic!("expected Executed, got {other:?}"),
        };
        // Price 5 bps below mid; proceeds net of 10 bps fee.
        let expected_price = 40_000.0 * (1.0 - 0.0005);
        assert!((record.price - expected_price).abs() < 1e-6);
        let gross = 0.01 * expected_price;
        assert!((record.quote_amount - (gross - gross * 0.001)).abs() < 1e-6);
        assert!(portfolio.invariant_holds());
        assert!((portfolio.base_amount("BTC") - 0.01).abs() < 1e-9);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn simulation_is_deterministic_on_replay() {
        fn request(o: &Opportunity) -> ExecutionRequest<'_> {
            ExecutionRequest {
                opportunity: o,
                side: Side::Buy,
                size: OrderSize::QuoteFunds(100.0),
                ticker_mid: 2_000.0,
                cycle_id: 1,
            }
        }

        let executor = sim_executor();
        let opp = opportunity("ETH-EUR", crate::types::Action::Buy, 70.0);
        let a = executor.simulate_fill(&request(&opp), "same-id");
        let b = executor.simulate_fill(&request(&opp), "same-id");
        assert_eq!(a.price, b.price);
        assert_eq!(a.base_amount, b.base_amount);
        assert_eq!(a.fees, b.fees);
    }

    // ---- client order ids ------------------------------------------------

    #[test]
    fn client_order_ids_are_unique_within_the_process() {
        let executor = sim_executor();
        let pair = Pair::parse("BTC-EUR").unwrap();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            // Same pair, cycle and side: the monotonic counter still makes
            // every id unique.
            assert!(seen.insert(executor.client_order_id(&pair, 7, Side::Buy)));
        }
    }

    // ---- live failure paths ----------------------------------------------

    #[tokio::test]
    async fn rejection_writes_record_and_leaves_ledger() {
        let (dir, ledger_path, log_path) = temp_paths();
        let executor = live_executor(Script::Reject);
        let mut portfolio = ledger();
        let before = portfolio.quote_amount();
        let opp = opportunity("BTC-EUR", crate::types::Action::Buy, 70.0);

        let outcome = executor
            .execute(
                ExecutionRequest {
                    opportunity: &opp,
                    side: Side::Buy,
                    size: OrderSize::QuoteFunds(100.0),
                    ticker_mid: 40_000.0,
                    cycle_id: 1,
                },
                &mut portfolio,
                &ledger_path,
                &log_path,
                &cooldown(),
            )
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Rejected {
                record,
                resync_needed,
            } => {
                assert_eq!(record.status, TradeStatus::Rejected);
                assert!(!resync_needed);
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(portfolio.quote_amount(), before);
        assert!(!ledger_path.exists(), "no ledger write without a fill");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn insufficient_balance_requests_resync() {
        let (dir, ledger_path, log_path) = temp_paths();
        let executor = live_executor(Script::InsufficientBalance);
        let mut portfolio = ledger();
        let opp = opportunity("BTC-EUR", crate::types::Action::Buy, 70.0);

        let outcome = executor
            .execute(
                ExecutionRequest {
                    opportunity: &opp,
                    side: Side::Buy,
                    size: OrderSize::QuoteFunds(5_000.0),
                    ticker_mid: 40_000.0,
                    cycle_id: 1,
                },
                &mut portfolio,
                &ledger_path,
                &log_path,
                &cooldown(),
            )
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Rejected { resync_needed, .. } => assert!(resync_needed),
            other => panic!("expected Rejected with resync, got {other:?}"),
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn unknown_order_records_warning_without_ledger_mutation() {
        let (dir, ledger_path, log_path) = temp_paths();
        let executor = live_executor(Script::Unknown);
        let mut portfolio = ledger();
        let before = portfolio.clone();
        let throttle = cooldown();
        let opp = opportunity("BTC-EUR", crate::types::Action::Sell, 70.0);

        let outcome = executor
            .execute(
                ExecutionRequest {
                    opportunity: &opp,
                    side: Side::Sell,
                    size: OrderSize::BaseAmount(0.01),
                    ticker_mid: 40_000.0,
                    cycle_id: 1,
                },
                &mut portfolio,
                &ledger_path,
                &log_path,
                &throttle,
            )
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Unknown(record) => {
                assert_eq!(record.status, TradeStatus::Unknown);
                assert_eq!(record.order_id, "mystery");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert_eq!(portfolio.quote_amount(), before.quote_amount());
        assert_eq!(portfolio.trades_executed, before.trades_executed);
        // No cool-down for a trade that may not exist.
        assert_eq!(throttle.active_count(Instant::now()), 0);
        // But the warning record is in the log for reconciliation.
        assert_eq!(storage::load_trades(&log_path).len(), 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn executed_live_fill_counts_trades() {
        let (dir, ledger_path, log_path) = temp_paths();
        let executor = live_executor(Script::Fill);
        let mut portfolio = ledger();
        let opp = opportunity("BTC-EUR", crate::types::Action::Sell, 80.0);

        let outcome = executor
            .execute(
                ExecutionRequest {
                    opportunity: &opp,
                    side: Side::Sell,
                    size: OrderSize::BaseAmount(0.01),
                    ticker_mid: 40_000.0,
                    cycle_id: 3,
                },
                &mut portfolio,
                &ledger_path,
                &log_path,
                &cooldown(),
            )
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Executed(record) => {
                assert_eq!(record.status, TradeStatus::Filled);
                assert!(record.order_id.starts_with("live-"));
            }
            other => panic!("expected Executed, got {other:?}"),
        }
        assert_eq!(portfolio.trades_executed, 1);
        assert!(portfolio.invariant_holds());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn allocation_feeds_executor_sizes() {
        // Smoke-check the hand-off shape: the opportunity manager's quote
        // allocations are the funds denominations the executor receives.
        let manager = OpportunityManager::new(Settings::default().allocation);
        let ranked = vec![opportunity("ETH-EUR", crate::types::Action::Buy, 70.0)];
        let allocation = manager.allocate(&ranked, 1000.0, 1800.0);
        assert!((allocation["ETH-EUR"] - 640.0).abs() < 1e-9);
    }
}
