// =============================================================================
// Market-data collector — per-pair OHLCV windows and derived indicators
// =============================================================================
//
// Stale-read policy: when the freshest candle is older than 2x the configured
// granularity the snapshot is flagged `degraded` and downstream components
// cap confidence at 50. A pair with fewer than the minimum required samples
// is excluded from the cycle (pair-local error, never cycle-fatal).
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{EngineError, ExchangeError};
use crate::exchange::ExchangeApi;
use crate::indicators::{IndicatorSet, MIN_SAMPLES};
use crate::types::Pair;

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A single OHLCV candle. Windows are ordered oldest-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time, UNIX seconds.
    pub time: i64,
    pub low: f64,
    pub high: f64,
    pub open: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Everything the strategies need to know about one pair for one cycle.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub pair: Pair,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
    pub candles: Vec<Candle>,
    pub indicators: IndicatorSet,
    /// True when the candle window is stale; downstream confidence is capped.
    pub degraded: bool,
}

/// Collection failures split by blast radius.
#[derive(Debug)]
pub enum CollectError {
    /// Authentication failures abort the whole cycle.
    Fatal(ExchangeError),
    /// Everything else only excludes the pair.
    PairLocal(EngineError),
}

impl CollectError {
    fn from_exchange(pair: &Pair, err: ExchangeError) -> Self {
        match err {
            ExchangeError::Authentication { .. } => Self::Fatal(err),
            other => Self::PairLocal(EngineError::DataUnavailable {
                pair: pair.to_string(),
                reason: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Fetches candle windows and tickers and derives the indicator set.
pub struct MarketDataCollector<E> {
    exchange: Arc<E>,
    granularity_sec: u64,
    lookback: u32,
}

impl<E: ExchangeApi> MarketDataCollector<E> {
    pub fn new(exchange: Arc<E>, granularity_sec: u64, lookback: u32) -> Self {
        Self {
            exchange,
            granularity_sec,
            lookback,
        }
    }

    /// Produce the cycle snapshot for one pair.
    ///
    /// `now_unix` is injected so staleness detection is deterministic in
    /// tests.
    pub async fn collect(&self, pair: &Pair, now_unix: i64) -> Result<MarketSnapshot, CollectError> {
        let candles = self
            .exchange
            .get_candles(pair, self.granularity_sec, self.lookback)
            .await
            .map_err(|e| CollectError::from_exchange(pair, e))?;

        if candles.len() < MIN_SAMPLES {
            return Err(CollectError::PairLocal(EngineError::DataUnavailable {
                pair: pair.to_string(),
                reason: format!(
                    "insufficient candles: {} < {MIN_SAMPLES}",
                    candles.len()
                ),
            }));
        }

        let indicators = IndicatorSet::compute(&candles, self.granularity_sec).ok_or_else(|| {
            CollectError::PairLocal(EngineError::DataUnavailable {
                pair: pair.to_string(),
                reason: "indicator computation failed on window".into(),
            })
        })?;

        let ticker = self
            .exchange
            .get_product_ticker(pair)
            .await
            .map_err(|e| CollectError::from_exchange(pair, e))?;

        let degraded = Self::is_stale(&candles, self.granularity_sec, now_unix);
        if degraded {
            warn!(%pair, "candle window is stale — signal marked degraded");
        }

        debug!(
            %pair,
            price = ticker.price,
            candles = candles.len(),
            degraded,
            "market snapshot collected"
        );

        Ok(MarketSnapshot {
            pair: pair.clone(),
            price: ticker.price,
            bid: ticker.bid,
            ask: ticker.ask,
            volume_24h: ticker.volume_24h,
            candles,
            indicators,
            degraded,
        })
    }

    /// A window is stale when its freshest candle opened more than
    /// `2 x granularity` before `now`.
    fn is_stale(candles: &[Candle], granularity_sec: u64, now_unix: i64) -> bool {
        match candles.last() {
            Some(last) => now_unix.saturating_sub(last.time) > 2 * granularity_sec as i64,
            None => true,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AccountBalance, OrderFill, OrderReport, OrderSize, Ticker};
    use crate::types::Side;
    use async_trait::async_trait;

    /// Serves a fixed candle window and ticker.
    struct FixedExchange {
        candles: Vec<Candle>,
    }

    #[async_trait]
    impl ExchangeApi for FixedExchange {
        async fn get_accounts(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn get_product_ticker(&self, _pair: &Pair) -> Result<Ticker, ExchangeError> {
            Ok(Ticker {
                price: 100.0,
                bid: 99.5,
                ask: 100.5,
                volume_24h: 1234.0,
            })
        }

        async fn get_candles(
            &self,
            _pair: &Pair,
            _granularity_sec: u64,
            _lookback: u32,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok(self.candles.clone())
        }

        async fn place_market_order(
            &self,
            _pair: &Pair,
            _side: Side,
            _size: OrderSize,
            _client_order_id: &str,
        ) -> Result<OrderFill, ExchangeError> {
            unreachable!("collector never places orders")
        }

        async fn get_order(&self, _order_id: &str) -> Result<OrderReport, ExchangeError> {
            unreachable!("collector never reads orders")
        }
    }

    fn window(count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.3).sin();
                Candle {
                    time: (i as i64) * 3600,
                    low: close - 0.5,
                    high: close + 0.5,
                    open: close,
                    close,
                    volume: 10.0,
                }
            })
            .collect()
    }

    fn pair() -> Pair {
        Pair::parse("BTC-EUR").unwrap()
    }

    #[tokio::test]
    async fn collect_produces_fresh_snapshot() {
        let candles = window(80);
        let last_time = candles.last().unwrap().time;
        let exchange = Arc::new(FixedExchange { candles });
        let collector = MarketDataCollector::new(exchange, 3600, 300);

        let snap = collector.collect(&pair(), last_time + 3600).await.unwrap();
        assert!(!snap.degraded);
        assert_eq!(snap.price, 100.0);
        assert_eq!(snap.candles.len(), 80);
    }

    #[tokio::test]
    async fn collect_flags_stale_window() {
        let candles = window(80);
        let last_time = candles.last().unwrap().time;
        let exchange = Arc::new(FixedExchange { candles });
        let collector = MarketDataCollector::new(exchange, 3600, 300);

        // 3 granularities past the last candle open => stale.
        let snap = collector
            .collect(&pair(), last_time + 3 * 3600 + 1)
            .await
            .unwrap();
        assert!(snap.degraded);
    }

    #[tokio::test]
    async fn collect_excludes_short_window() {
        let exchange = Arc::new(FixedExchange {
            candles: window(MIN_SAMPLES - 1),
        });
        let collector = MarketDataCollector::new(exchange, 3600, 300);

        match collector.collect(&pair(), 0).await {
            Err(CollectError::PairLocal(EngineError::DataUnavailable { reason, .. })) => {
                assert!(reason.contains("insufficient candles"));
            }
            other => panic!("expected DataUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn staleness_boundary_is_exactly_two_granularities() {
        let candles = window(5);
        let last = candles.last().unwrap().time;
        assert!(!MarketDataCollector::<FixedExchange>::is_stale(
            &candles,
            3600,
            last + 2 * 3600
        ));
        assert!(MarketDataCollector::<FixedExchange>::is_stale(
            &candles,
            3600,
            last + 2 * 3600 + 1
        ));
    }
}
