// =============================================================================
// Cycle orchestrator — the three-phase decision loop
// =============================================================================
//
//   IDLE -> COLLECTING -> ANALYSING -> RANKING -> EXECUTING -> SNAPSHOTTING
//                 \____________ error ____________/
//                               v
//                           DEGRADED (persist partial decisions, no trades)
//
// One cycle at a time: ticks arriving while a cycle runs are dropped with a
// warning. The ledger is owned here; strategies see defensive copies only.
// Trade execution is strictly serial in ranked order. Three consecutive
// failed cycles make the engine give up with a fatal-runtime exit.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::advisor::{AdvisoryOracle, MarketBrief, PortfolioAwareness};
use crate::config::Settings;
use crate::cooldown::CooldownThrottle;
use crate::errors::ExchangeError;
use crate::exchange::{ExchangeApi, OrderSize};
use crate::executor::{ExecutionOutcome, ExecutionRequest, TradeExecutor};
use crate::market_data::{CollectError, MarketDataCollector, MarketSnapshot};
use crate::opportunity::{Opportunity, OpportunityManager};
use crate::performance::{PerformanceTracker, SnapshotType};
use crate::portfolio::Portfolio;
use crate::risk::{RiskSizer, MAX_HARD_BEAR_TRADES};
use crate::storage::{self, DataPaths};
use crate::strategy::advisory::Advisory;
use crate::strategy::combiner::{CombinedSignal, Combiner, EnsembleOutput};
use crate::strategy::mean_reversion::MeanReversion;
use crate::strategy::momentum::Momentum;
use crate::strategy::regime::{self, RegimeAssessment};
use crate::strategy::trend::TrendFollowing;
use crate::strategy::Strategy;
use crate::types::{Pair, Side, TradeRecord};

/// Consecutive failed cycles tolerated before the engine exits fatally.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Decision records retained for the dashboard ring.
const DECISION_RING_CAP: usize = 100;

/// Phase of the cycle state machine, for logs and the degraded path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CyclePhase {
    Idle,
    Collecting,
    Analysing,
    Ranking,
    Executing,
    Snapshotting,
    Degraded,
}

/// Per pair per cycle: the combined signal plus what happened to it.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub signal: CombinedSignal,
    pub executed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub created_at: String,
}

/// What one cycle produced, for logging and tests.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub signals: usize,
    pub opportunities: usize,
    pub executed: Vec<TradeRecord>,
    pub degraded: bool,
}

pub struct Engine<E, A> {
    settings: Settings,
    paths: DataPaths,
    exchange: Arc<E>,
    advisor: Arc<A>,
    collector: MarketDataCollector<E>,
    combiner: Combiner,
    opportunities: OpportunityManager,
    sizer: RiskSizer,
    executor: TradeExecutor<E>,
    cooldown: CooldownThrottle,
    tracker: PerformanceTracker,
    ledger: Portfolio,
    decision_ring: Vec<DecisionRecord>,
    cycle_counter: u64,
    consecutive_failures: u32,
    cycle_running: AtomicBool,
    shutting_down: Arc<AtomicBool>,
    shutdown_notify: Option<Arc<tokio::sync::Notify>>,
    phase: CyclePhase,
}

impl<E, A> Engine<E, A>
where
    E: ExchangeApi + 'static,
    A: AdvisoryOracle,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: Settings,
        paths: DataPaths,
        exchange: Arc<E>,
        advisor: Arc<A>,
        ledger: Portfolio,
        tracker: PerformanceTracker,
        shutting_down: Arc<AtomicBool>,
    ) -> Self {
        let collector = MarketDataCollector::new(
            exchange.clone(),
            settings.granularity_sec,
            settings.candle_lookback,
        );
        let combiner = Combiner::new(
            settings.risk.buy_confidence_threshold,
            settings.risk.sell_confidence_threshold,
            settings.weight_overrides.clone(),
        );
        let opportunities = OpportunityManager::new(settings.allocation.clone());
        let sizer = RiskSizer::new(&settings.risk, &settings.allocation);
        let executor = TradeExecutor::new(
            exchange.clone(),
            settings.risk.simulation_mode,
            settings.risk.sim_slippage_bps,
            settings.risk.sim_fee_bps,
        );
        let cooldown =
            CooldownThrottle::new(Duration::from_secs(settings.risk.cooldown_minutes * 60));

        Self {
            settings,
            paths,
            exchange,
            advisor,
            collector,
            combiner,
            opportunities,
            sizer,
            executor,
            cooldown,
            tracker,
            ledger,
            decision_ring: Vec::new(),
            cycle_counter: 0,
            consecutive_failures: 0,
            cycle_running: AtomicBool::new(false),
            shutting_down,
            shutdown_notify: None,
            phase: CyclePhase::Idle,
        }
    }

    /// Current position in the cycle state machine.
    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Wire the notifier that interrupts the tick sleep on shutdown.
    pub fn set_shutdown_notify(&mut self, notify: Arc<tokio::sync::Notify>) {
        self.shutdown_notify = Some(notify);
    }

    pub fn ledger(&self) -> &Portfolio {
        &self.ledger
    }

    // -------------------------------------------------------------------------
    // Tick loop
    // -------------------------------------------------------------------------

    /// Drive the scheduled tick until shutdown. Returns an error only on the
    /// fatal-runtime condition (three consecutive failed cycles).
    pub async fn run(&mut self) -> Result<()> {
        let period = Duration::from_secs(self.settings.decision_interval_minutes * 60);
        let mut ticker = tokio::time::interval(period);
        // Ticks missed during a running cycle are dropped, not queued.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_minutes = self.settings.decision_interval_minutes,
            pairs = self.settings.pairs.len(),
            simulation = self.settings.risk.simulation_mode,
            "cycle loop started"
        );

        let notify = self.shutdown_notify.clone();
        loop {
            match &notify {
                Some(notify) => {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = notify.notified() => {
                            info!("shutdown requested — leaving cycle loop");
                            return Ok(());
                        }
                    }
                }
                None => {
                    ticker.tick().await;
                }
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                info!("shutdown requested — leaving cycle loop");
                return Ok(());
            }
            self.tick().await?;
        }
    }

    /// Handle one tick, enforcing single-cycle mutual exclusion.
    pub async fn tick(&mut self) -> Result<()> {
        if self.cycle_running.swap(true, Ordering::SeqCst) {
            warn!("tick arrived while a cycle is running — dropped");
            return Ok(());
        }

        let outcome = self.run_cycle().await;
        self.cycle_running.store(false, Ordering::SeqCst);

        match outcome {
            Ok(report) => {
                self.consecutive_failures = 0;
                info!(
                    cycle = self.cycle_counter,
                    signals = report.signals,
                    opportunities = report.opportunities,
                    executed = report.executed.len(),
                    degraded = report.degraded,
                    "cycle complete"
                );
                Ok(())
            }
            Err(e) => {
                self.consecutive_failures += 1;
                error!(
                    cycle = self.cycle_counter,
                    failures = self.consecutive_failures,
                    error = %e,
                    "cycle failed"
                );
                if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(e).context("three consecutive cycle failures — giving up");
                }
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // One cycle
    // -------------------------------------------------------------------------

    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        self.cycle_counter += 1;
        let cycle_id = self.cycle_counter;
        debug!(cycle = cycle_id, "cycle starting");

        // ── Phase: COLLECTING ───────────────────────────────────────────
        self.phase = CyclePhase::Collecting;
        let snapshots = match self.collect_phase().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                self.enter_degraded(&[], &e.to_string());
                return Err(e);
            }
        };
        if snapshots.is_empty() {
            self.enter_degraded(&[], "no pair produced usable market data");
            return Ok(CycleReport {
                degraded: true,
                ..Default::default()
            });
        }

        // ── Phase: ANALYSING ────────────────────────────────────────────
        self.phase = CyclePhase::Analysing;
        let (signals, hard_bear) = self.analyse_phase(&snapshots).await;

        // ── Phase: RANKING ──────────────────────────────────────────────
        self.phase = CyclePhase::Ranking;
        let ranked = self.opportunities.rank(&signals);
        let allocation = self.opportunities.allocate(
            &ranked,
            self.ledger.quote_amount(),
            self.ledger.portfolio_value_quote,
        );

        // ── Phase: EXECUTING ────────────────────────────────────────────
        self.phase = CyclePhase::Executing;
        let (executed, decided) = self
            .execute_phase(cycle_id, &ranked, &allocation, &snapshots, hard_bear)
            .await?;

        // ── Phase: SNAPSHOTTING ─────────────────────────────────────────
        self.phase = CyclePhase::Snapshotting;
        self.snapshot_phase(&signals, &decided, &snapshots)?;

        self.phase = CyclePhase::Idle;
        Ok(CycleReport {
            signals: signals.len(),
            opportunities: ranked.len(),
            executed,
            degraded: false,
        })
    }

    /// Exchange sync plus concurrent per-pair collection.
    async fn collect_phase(&mut self) -> Result<Vec<MarketSnapshot>> {
        // Reconcile the ledger against the exchange before deciding anything;
        // this is what repairs state after an UNKNOWN order or a crash.
        match self.exchange.get_accounts().await {
            Ok(balances) => self.ledger.sync_with_exchange(&balances),
            Err(e) if matches!(e, ExchangeError::Authentication { .. }) => {
                return Err(anyhow::anyhow!(e)).context("exchange sync failed");
            }
            Err(e) => {
                warn!(error = %e, tag = e.taxonomy_tag(), "exchange sync failed — using persisted ledger");
            }
        }

        let now = Utc::now().timestamp();
        let futures: Vec<_> = self
            .settings
            .pairs
            .iter()
            .map(|pair| self.collector.collect(pair, now))
            .collect();

        let mut snapshots = Vec::new();
        for result in join_all(futures).await {
            match result {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(CollectError::Fatal(e)) => {
                    return Err(anyhow::anyhow!(e)).context("authentication failure during collection");
                }
                Err(CollectError::PairLocal(e)) => {
                    warn!(tag = e.taxonomy_tag(), error = %e, "pair excluded from cycle");
                }
            }
        }

        // Fresh prices feed the ledger valuation.
        for snapshot in &snapshots {
            self.ledger
                .observe_price(&snapshot.pair.base, snapshot.price);
        }

        Ok(snapshots)
    }

    /// Per-pair ensemble evaluation, advisory oracle included.
    async fn analyse_phase(&self, snapshots: &[MarketSnapshot]) -> (Vec<CombinedSignal>, bool) {
        let assessments: Vec<RegimeAssessment> = snapshots
            .iter()
            .map(|s| regime::detect(&s.indicators))
            .collect();
        // The hard-bear override is cycle-wide: one crashing pair tightens
        // every BUY this cycle.
        let hard_bear = assessments.iter().any(|a| a.hard_bear);
        if hard_bear {
            warn!("hard-bear override active for this cycle");
        }

        let view = self.ledger.view();
        let trend = TrendFollowing::new(self.settings.risk.trend_threshold);
        let mean_reversion = MeanReversion::new();
        let momentum = Momentum::new();

        let mut signals = Vec::with_capacity(snapshots.len());
        for (snapshot, assessment) in snapshots.iter().zip(assessments.iter()) {
            let brief = MarketBrief {
                pair: snapshot.pair.clone(),
                price: snapshot.price,
                rsi: snapshot.indicators.rsi,
                macd_histogram: snapshot.indicators.macd.histogram,
                price_change_24h: snapshot.indicators.price_change_24h,
                price_change_7d: snapshot.indicators.price_change_7d,
                price_change_30d: snapshot.indicators.price_change_30d,
                regime: assessment.regime,
                portfolio: PortfolioAwareness::assess(
                    &view,
                    self.settings.allocation.target_quote_allocation,
                    hard_bear,
                ),
            };
            let verdict = self.advisor.advise(&brief).await;
            let advisory = Advisory::new(verdict, hard_bear);

            let outputs = EnsembleOutput {
                trend: trend.analyse(&snapshot.indicators, &view),
                mean_reversion: mean_reversion.analyse(&snapshot.indicators, &view),
                momentum: momentum.analyse(&snapshot.indicators, &view),
                advisory: advisory.analyse(&snapshot.indicators, &view),
            };

            let suitability = BTreeMap::from([
                ("trend".to_string(), trend.regime_suitability(assessment.regime)),
                (
                    "mean_reversion".to_string(),
                    mean_reversion.regime_suitability(assessment.regime),
                ),
                (
                    "momentum".to_string(),
                    momentum.regime_suitability(assessment.regime),
                ),
                (
                    "advisory".to_string(),
                    advisory.regime_suitability(assessment.regime),
                ),
            ]);

            signals.push(self.combiner.combine(
                &snapshot.pair,
                *assessment,
                &outputs,
                suitability,
                snapshot.indicators.price_change_24h,
                snapshot.degraded,
            ));
        }

        (signals, hard_bear)
    }

    /// Serial execution in ranked order: cool-down, sizing, one order at a
    /// time.
    async fn execute_phase(
        &mut self,
        cycle_id: u64,
        ranked: &[Opportunity],
        allocation: &BTreeMap<String, f64>,
        snapshots: &[MarketSnapshot],
        hard_bear: bool,
    ) -> Result<(Vec<TradeRecord>, Vec<Pair>)> {
        let mut executed = Vec::new();
        let mut decided: Vec<Pair> = Vec::new();
        let trade_log = self.paths.trade_history();
        let ledger_path = self.paths.portfolio();

        for opportunity in ranked {
            if self.shutting_down.load(Ordering::SeqCst) {
                warn!("shutdown during execution — remaining opportunities skipped");
                break;
            }
            if hard_bear && executed.len() >= MAX_HARD_BEAR_TRADES {
                warn!("hard-bear trade cap reached — remaining opportunities skipped");
                break;
            }

            let pair = &opportunity.signal.pair;
            let side = match Side::try_from(opportunity.signal.action) {
                Ok(side) => side,
                Err(_) => continue,
            };

            // Cool-down is consulted after ranking so suppressed pairs free
            // their allocation for eligible ones.
            let verdict = self.cooldown.check(
                pair,
                side,
                opportunity.signal.confidence,
                self.settings.risk.buy_confidence_threshold,
                Instant::now(),
            );
            if !verdict.allowed() {
                decided.push(pair.clone());
                self.push_decision(DecisionRecord {
                    signal: opportunity.signal.clone(),
                    executed: false,
                    trade_id: None,
                    skip_reason: Some(format!("cool-down: {verdict:?}")),
                    created_at: Utc::now().to_rfc3339(),
                });
                continue;
            }

            let snapshot = match snapshots.iter().find(|s| &s.pair == pair) {
                Some(s) => s,
                None => continue,
            };
            let ticker_mid = if snapshot.bid > 0.0 && snapshot.ask > 0.0 {
                (snapshot.bid + snapshot.ask) / 2.0
            } else {
                snapshot.price
            };

            let size = match side {
                Side::Buy => {
                    let allocated = allocation.get(&pair.to_string()).copied().unwrap_or(0.0);
                    match self.sizer.size_buy(
                        pair,
                        allocated,
                        opportunity.signal.position_multiplier,
                        self.ledger.portfolio_value_quote,
                        hard_bear,
                    ) {
                        Some(quote) => OrderSize::QuoteFunds(quote),
                        None => {
                            decided.push(pair.clone());
                            self.push_decision(DecisionRecord {
                                signal: opportunity.signal.clone(),
                                executed: false,
                                trade_id: None,
                                skip_reason: Some("buy below minimum size".into()),
                                created_at: Utc::now().to_rfc3339(),
                            });
                            continue;
                        }
                    }
                }
                Side::Sell => {
                    let held = self.ledger.base_amount(&pair.base);
                    match self.sizer.size_sell(
                        pair,
                        held,
                        snapshot.price,
                        opportunity.signal.position_multiplier,
                        self.ledger.portfolio_value_quote,
                        self.ledger.quote_share(),
                    ) {
                        Some(base) => OrderSize::BaseAmount(base),
                        None => {
                            decided.push(pair.clone());
                            self.push_decision(DecisionRecord {
                                signal: opportunity.signal.clone(),
                                executed: false,
                                trade_id: None,
                                skip_reason: Some("sell below minimum size".into()),
                                created_at: Utc::now().to_rfc3339(),
                            });
                            continue;
                        }
                    }
                }
            };

            let outcome = self
                .executor
                .execute(
                    ExecutionRequest {
                        opportunity,
                        side,
                        size,
                        ticker_mid,
                        cycle_id,
                    },
                    &mut self.ledger,
                    &ledger_path,
                    &trade_log,
                    &self.cooldown,
                )
                .await?;

            decided.push(pair.clone());
            match outcome {
                ExecutionOutcome::Executed(record) => {
                    debug_assert!(self.ledger.invariant_holds());
                    self.push_decision(DecisionRecord {
                        signal: opportunity.signal.clone(),
                        executed: true,
                        trade_id: Some(record.id.clone()),
                        skip_reason: None,
                        created_at: Utc::now().to_rfc3339(),
                    });
                    self.tracker.snapshot(&self.ledger, SnapshotType::Trade)?;
                    if self.settings.output.notifications_enabled {
                        info!(
                            pair = %record.pair,
                            side = %record.side,
                            quote = record.quote_amount,
                            "trade notification queued for the report generator"
                        );
                    }
                    executed.push(record);
                }
                ExecutionOutcome::Rejected {
                    record,
                    resync_needed,
                } => {
                    self.push_decision(DecisionRecord {
                        signal: opportunity.signal.clone(),
                        executed: false,
                        trade_id: Some(record.id.clone()),
                        skip_reason: Some("order rejected".into()),
                        created_at: Utc::now().to_rfc3339(),
                    });
                    if resync_needed {
                        if let Ok(balances) = self.exchange.get_accounts().await {
                            self.ledger.sync_with_exchange(&balances);
                            self.ledger
                                .save(&ledger_path)
                                .context("ledger write after resync failed")?;
                        }
                    }
                }
                ExecutionOutcome::Unknown(record) => {
                    self.push_decision(DecisionRecord {
                        signal: opportunity.signal.clone(),
                        executed: false,
                        trade_id: Some(record.id.clone()),
                        skip_reason: Some("order status unknown".into()),
                        created_at: Utc::now().to_rfc3339(),
                    });
                }
                ExecutionOutcome::PairBusy => {}
            }
        }

        Ok((executed, decided))
    }

    /// Persist the decision ring, the ledger valuation, scheduled snapshots
    /// and optional candle archives.
    fn snapshot_phase(
        &mut self,
        signals: &[CombinedSignal],
        decided: &[Pair],
        snapshots: &[MarketSnapshot],
    ) -> Result<()> {
        // Pairs the execution phase never touched (HOLDs, unranked, dropped)
        // still get a decision record; the dashboard shows every verdict.
        for signal in signals {
            if !decided.contains(&signal.pair) {
                self.push_decision(DecisionRecord {
                    signal: signal.clone(),
                    executed: false,
                    trade_id: None,
                    skip_reason: None,
                    created_at: Utc::now().to_rfc3339(),
                });
            }
        }

        self.ledger
            .save(&self.paths.portfolio())
            .context("end-of-cycle ledger write failed")?;

        if self.settings.output.dashboard_export {
            storage::write_ring(
                &self.paths.latest_decisions(),
                &self.decision_ring,
                DECISION_RING_CAP,
            )?;
        }

        if self.tracker.scheduled_due(Utc::now()) {
            self.tracker.snapshot(&self.ledger, SnapshotType::Scheduled)?;
        }

        if self.settings.output.archive_candles {
            for snapshot in snapshots {
                let path = self.paths.historical(
                    &snapshot.pair,
                    self.settings.granularity_sec,
                    &format!("{}", self.settings.candle_lookback),
                );
                if let Err(e) = storage::archive_candles(&path, &snapshot.candles) {
                    warn!(pair = %snapshot.pair, error = %e, "candle archive failed");
                }
            }
        }

        Ok(())
    }

    /// DEGRADED: persist whatever decisions exist, execute nothing, return to
    /// idle.
    fn enter_degraded(&mut self, signals: &[CombinedSignal], reason: &str) {
        self.phase = CyclePhase::Degraded;
        warn!(reason, "cycle degraded — holding across the board");
        for signal in signals {
            self.push_decision(DecisionRecord {
                signal: signal.clone(),
                executed: false,
                trade_id: None,
                skip_reason: Some(format!("degraded: {reason}")),
                created_at: Utc::now().to_rfc3339(),
            });
        }
        if self.settings.output.dashboard_export {
            if let Err(e) = storage::write_ring(
                &self.paths.latest_decisions(),
                &self.decision_ring,
                DECISION_RING_CAP,
            ) {
                warn!(error = %e, "failed to persist degraded decision set");
            }
        }
        self.phase = CyclePhase::Idle;
    }

    fn push_decision(&mut self, record: DecisionRecord) {
        self.decision_ring.push(record);
        while self.decision_ring.len() > DECISION_RING_CAP {
            self.decision_ring.remove(0);
        }
    }

    /// Final actions before process exit: snapshot, persist everything and
    /// log the session's performance.
    pub fn finalize(&mut self) -> Result<()> {
        self.ledger
            .save(&self.paths.portfolio())
            .context("final ledger write failed")?;
        self.tracker.snapshot(&self.ledger, SnapshotType::Scheduled)?;
        self.tracker.persist_config()?;

        let trades = storage::load_trades(&self.paths.trade_history());
        let metrics = self.tracker.metrics(&trades);
        info!(
            total_return_pct = format!("{:.2}", metrics.total_return_pct),
            sharpe = format!("{:.2}", metrics.sharpe),
            max_drawdown_pct = format!("{:.2}", metrics.max_drawdown_pct),
            win_rate = format!("{:.2}", metrics.win_rate),
            closed_trades = metrics.closed_trades,
            "session performance"
        );

        info!("engine state finalised");
        Ok(())
    }
}
