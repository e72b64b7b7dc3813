// =============================================================================
// Exchange adapter — the only seam through which orders and market data flow
// =============================================================================

pub mod client;
pub mod rate_limit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ExchangeError;
use crate::market_data::Candle;
use crate::types::{Pair, Side};

/// One asset balance from the exchange account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub currency: String,
    #[serde(default)]
    pub available: f64,
    #[serde(default)]
    pub hold: f64,
}

impl AccountBalance {
    pub fn total(&self) -> f64 {
        self.available + self.hold
    }
}

/// Best-bid/ask snapshot for a pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
}

impl Ticker {
    /// Midpoint of bid/ask, falling back to the last trade price when the
    /// book is one-sided.
    pub fn mid(&self) -> f64 {
        if self.bid > 0.0 && self.ask > 0.0 {
            (self.bid + self.ask) / 2.0
        } else {
            self.price
        }
    }
}

/// Market-order size: BUY is denominated in quote funds, SELL in base units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderSize {
    QuoteFunds(f64),
    BaseAmount(f64),
}

impl OrderSize {
    pub fn value(self) -> f64 {
        match self {
            Self::QuoteFunds(v) | Self::BaseAmount(v) => v,
        }
    }
}

/// Terminal fill returned by `place_market_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub base_amount: f64,
    pub quote_amount: f64,
    pub price: f64,
    pub fees: f64,
    /// True when the exchange reported a partial (but settled) fill.
    #[serde(default)]
    pub partial: bool,
}

/// Order status as reported by `get_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderReport {
    pub order_id: String,
    pub status: String,
    pub settled: bool,
    #[serde(default)]
    pub filled_size: f64,
    #[serde(default)]
    pub executed_value: f64,
    #[serde(default)]
    pub fill_fees: f64,
}

/// The operations the decision engine requires of an exchange.
///
/// `place_market_order` returns only once the exchange has acknowledged a
/// terminal order status, or surfaces `OrderRejected` / `OrderUnknown`.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, ExchangeError>;

    async fn get_product_ticker(&self, pair: &Pair) -> Result<Ticker, ExchangeError>;

    /// OHLCV candles, oldest-first, at the requested granularity.
    async fn get_candles(
        &self,
        pair: &Pair,
        granularity_sec: u64,
        lookback: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn place_market_order(
        &self,
        pair: &Pair,
        side: Side,
        size: OrderSize,
        client_order_id: &str,
    ) -> Result<OrderFill, ExchangeError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderReport, ExchangeError>;
}
