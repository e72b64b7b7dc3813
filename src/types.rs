// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Trading pair
// ---------------------------------------------------------------------------

/// An exchange-traded market, written `ASSET-QUOTE` (e.g. `BTC-EUR`).
///
/// The quote currency is a process-wide constant; every configured pair must
/// share it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pair {
    pub base: String,
    pub quote: String,
}

impl Pair {
    /// Parse `ASSET-QUOTE` into a pair. Both legs are upper-cased.
    pub fn parse(s: &str) -> Option<Self> {
        let (base, quote) = s.split_once('-')?;
        let base = base.trim();
        let quote = quote.trim();
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Self {
            base: base.to_uppercase(),
            quote: quote.to_uppercase(),
        })
    }
}

impl std::fmt::Display for Pair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

impl Serialize for Pair {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Pair {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Pair::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid pair '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Actions and sides
// ---------------------------------------------------------------------------

/// What a strategy (or the combined ensemble) recommends for a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// Signed vote used by the combiner: BUY=+1, SELL=-1, HOLD=0.
    pub fn vote(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
            Self::Hold => 0.0,
        }
    }

    pub fn is_actionable(self) -> bool {
        !matches!(self, Self::Hold)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::Hold => write!(f, "HOLD"),
        }
    }
}

/// The side of an executed order. Unlike [`Action`] there is no neutral value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl TryFrom<Action> for Side {
    type Error = ();

    fn try_from(action: Action) -> Result<Self, Self::Error> {
        match action {
            Action::Buy => Ok(Self::Buy),
            Action::Sell => Ok(Self::Sell),
            Action::Hold => Err(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Risk level
// ---------------------------------------------------------------------------

/// Operator-selected appetite. Scales every BUY candidate size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// The quote-size multiplier applied to BUY candidates.
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Low => 1.0,
            Self::Medium => 0.75,
            Self::High => 0.5,
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            _ => None,
        }
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

// ---------------------------------------------------------------------------
// Trade records
// ---------------------------------------------------------------------------

/// Terminal state of an executed (or attempted) trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Filled,
    Partial,
    Rejected,
    Simulated,
    /// Order reached the exchange but its terminal status is unknown; the
    /// next cycle's exchange-sync step reconciles the ledger.
    Unknown,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Filled => write!(f, "FILLED"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Rejected => write!(f, "REJECTED"),
            Self::Simulated => write!(f, "SIMULATED"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Immutable, append-only record of one trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Unique identifier (UUID v4).
    pub id: String,
    /// ISO 8601 UTC timestamp.
    pub timestamp_utc: String,
    pub pair: Pair,
    pub side: Side,
    /// Amount of the base asset bought or sold.
    pub base_amount: f64,
    /// Amount of the quote currency spent (BUY) or received (SELL), after fees.
    pub quote_amount: f64,
    /// Fill price in quote currency per unit of base.
    pub price: f64,
    pub fees: f64,
    /// Always "combined" — trades are only ever placed from the ensemble.
    pub strategy: String,
    pub confidence: f64,
    pub reasoning: String,
    /// Exchange order id (or the idempotent client order id in simulation).
    pub order_id: String,
    pub status: TradeStatus,
    /// Realised profit in quote currency. Left unset at write time; the
    /// performance tracker derives it FIFO from the full log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
}

// ---------------------------------------------------------------------------
// Startup record
// ---------------------------------------------------------------------------

/// Why the process is (re)starting, surfaced to the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartContext {
    Normal,
    Restart,
    Stop,
}

impl Default for RestartContext {
    fn default() -> Self {
        Self::Normal
    }
}

/// Written to `cache/bot_startup.json` at startup and again before a graceful
/// exit (with `restart_context = stop`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupRecord {
    pub pid: u32,
    pub startup_time: String,
    pub session_id: String,
    #[serde(default)]
    pub restart_context: RestartContext,
}
