// =============================================================================
// Error taxonomy for the Meridian trading engine
// =============================================================================
//
// Propagation policy: errors local to one pair or one component never abort
// the cycle. Only ledger-write failures and three consecutive unhandled cycle
// failures are cycle-fatal. Every variant carries a stable taxonomy tag used
// in log lines so operators can grep by failure class.
// =============================================================================

use thiserror::Error;

/// Errors surfaced by the exchange adapter.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network-level or 5xx failure that survived the retry policy.
    #[error("transient network error: {reason}")]
    Transient { reason: String },

    /// The exchange returned 429; the adapter converts this into a bounded
    /// sleep before one re-attempt.
    #[error("rate limited by exchange (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    /// 401/403 — fatal to the cycle; operator intervention required.
    #[error("authentication rejected: {reason}")]
    Authentication { reason: String },

    /// The exchange rejected the order outright.
    #[error("order rejected for {pair}: {reason}")]
    OrderRejected { pair: String, reason: String },

    /// The order reached the exchange but no terminal status was observed
    /// within the polling budget.
    #[error("order {order_id} status unknown for {pair}")]
    OrderUnknown { pair: String, order_id: String },

    /// Not enough funds to place the order; triggers an exchange resync.
    #[error("insufficient balance: need {need:.2}, available {available:.2}")]
    InsufficientBalance { need: f64, available: f64 },

    /// Malformed or unexpected response body.
    #[error("malformed exchange response: {reason}")]
    Malformed { reason: String },
}

impl ExchangeError {
    /// Stable tag for log lines and the decision audit trail.
    pub fn taxonomy_tag(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "TransientNetworkError",
            Self::RateLimited { .. } => "RateLimited",
            Self::Authentication { .. } => "AuthenticationError",
            Self::OrderRejected { .. } => "OrderRejected",
            Self::OrderUnknown { .. } => "OrderUnknown",
            Self::InsufficientBalance { .. } => "InsufficientBalance",
            Self::Malformed { .. } => "TransientNetworkError",
        }
    }

    /// True when the failure class is worth retrying at the call site.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::RateLimited { .. })
    }
}

/// Errors raised outside the exchange seam.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A pair had too little data this cycle; the pair is excluded, the
    /// cycle continues.
    #[error("data unavailable for {pair}: {reason}")]
    DataUnavailable { pair: String, reason: String },

    /// The advisory adapter failed; the advisory strategy degrades to
    /// safe-HOLD and the cycle continues.
    #[error("advisory unavailable: {reason}")]
    AdvisoryUnavailable { reason: String },

    /// The ledger on disk failed to parse and no usable fallback was found.
    #[error("ledger corruption in {path}: {reason}")]
    LedgerCorruption { path: String, reason: String },

    /// Another live process holds the startup lock.
    #[error("startup lock contested by live pid {holder_pid}")]
    LockContested { holder_pid: u32 },

    /// The lock file could not be created or written.
    #[error("cannot establish startup lock at {path}: {reason}")]
    LockUnavailable { path: String, reason: String },
}

impl EngineError {
    pub fn taxonomy_tag(&self) -> &'static str {
        match self {
            Self::DataUnavailable { .. } => "DataUnavailable",
            Self::AdvisoryUnavailable { .. } => "AdvisoryUnavailable",
            Self::LedgerCorruption { .. } => "LedgerCorruption",
            Self::LockContested { .. } | Self::LockUnavailable { .. } => "LockContested",
        }
    }
}
