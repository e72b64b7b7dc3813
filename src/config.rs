// =============================================================================
// Settings — immutable engine configuration loaded once at startup
// =============================================================================
//
// The configuration surface is environment-variable based (prefix MERIDIAN_),
// loaded through dotenv in main. Every key has a default so the engine can
// boot in simulation mode with nothing but an empty environment. Settings is
// immutable after load; SIGHUP is ignored by design.
// =============================================================================

use anyhow::{bail, Context, Result};

use crate::types::{Pair, RiskLevel};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_pairs() -> Vec<Pair> {
    ["BTC-EUR", "ETH-EUR", "SOL-EUR", "XRP-EUR"]
        .iter()
        .filter_map(|s| Pair::parse(s))
        .collect()
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_f64(key: &str, default: f64) -> Result<f64> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{key} must be a number, got '{v}'")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{key} must be an integer, got '{v}'")),
        Err(_) => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("{key} must be a boolean, got '{other}'"),
        },
        Err(_) => Ok(default),
    }
}

// =============================================================================
// Sub-sections
// =============================================================================

/// Exchange connectivity and throttling.
#[derive(Clone)]
pub struct ExchangeSettings {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    /// Requests allowed per rolling second.
    pub rate_limit_per_sec: u32,
    /// Retry attempts for transient failures.
    pub max_retries: u32,
    pub request_timeout_sec: u64,
}

impl std::fmt::Debug for ExchangeSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeSettings")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("max_retries", &self.max_retries)
            .field("request_timeout_sec", &self.request_timeout_sec)
            .finish()
    }
}

/// Advisory language-model adapter.
#[derive(Clone)]
pub struct AdvisorSettings {
    pub provider: String,
    pub primary_model: String,
    pub fallback_model: String,
    pub api_key: String,
    /// Provider region hint, forwarded verbatim.
    pub location: String,
    pub base_url: String,
    pub timeout_sec: u64,
}

impl std::fmt::Debug for AdvisorSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisorSettings")
            .field("provider", &self.provider)
            .field("primary_model", &self.primary_model)
            .field("fallback_model", &self.fallback_model)
            .field("api_key", &"<redacted>")
            .field("location", &self.location)
            .field("base_url", &self.base_url)
            .field("timeout_sec", &self.timeout_sec)
            .finish()
    }
}

/// Risk and signal thresholds.
#[derive(Debug, Clone)]
pub struct RiskSettings {
    pub risk_level: RiskLevel,
    pub simulation_mode: bool,
    /// Minimum combined confidence to act on a BUY.
    pub buy_confidence_threshold: f64,
    /// Minimum combined confidence to act on a SELL.
    pub sell_confidence_threshold: f64,
    pub cooldown_minutes: u64,
    /// MACD/Bollinger trend-strength gate for the trend strategy.
    pub trend_threshold: f64,
    /// Simulated fill slippage, basis points off the ticker mid.
    pub sim_slippage_bps: f64,
    /// Simulated fill fee, basis points of the quote amount.
    pub sim_fee_bps: f64,
}

/// Capital allocation knobs.
#[derive(Debug, Clone)]
pub struct AllocationSettings {
    /// Target share of the portfolio held as quote currency, in [0,1].
    pub target_quote_allocation: f64,
    pub min_quote_reserve_absolute: f64,
    /// Exchange minimum order size, in quote units.
    pub min_trade_amount: f64,
    /// Per-order maximum as a fraction of portfolio value.
    pub max_position_size: f64,
    pub capital_reserve_ratio: f64,
    /// Minimum per-trade allocation; smaller shares are dropped.
    pub min_trade_allocation: f64,
    /// Maximum per-trade share of the tradable pool.
    pub max_single_trade_ratio: f64,
    /// Power factor p in score^p allocation weighting.
    pub allocation_power_factor: f64,
    pub min_actionable_confidence: f64,
    /// |24h change| percent above which the momentum bonus applies.
    pub momentum_threshold_pct: f64,
}

/// Per-regime strategy weight override: [trend, mean_reversion, momentum,
/// advisory], expected to sum to 1.
pub type WeightOverride = [f64; 4];

/// Output toggles for external consumers.
#[derive(Debug, Clone)]
pub struct OutputSettings {
    pub data_dir: std::path::PathBuf,
    /// Write cache/latest_decisions.json for the dashboard.
    pub dashboard_export: bool,
    pub notifications_enabled: bool,
    /// Archive candle windows to historical/ as CSV.
    pub archive_candles: bool,
    /// "hourly" or "daily".
    pub snapshot_frequency: String,
    pub snapshot_retention_days: u32,
}

// =============================================================================
// Settings
// =============================================================================

/// Complete immutable configuration for one engine process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub pairs: Vec<Pair>,
    /// Process-wide quote currency; every pair must quote in it.
    pub quote_currency: String,
    pub decision_interval_minutes: u64,
    /// Candle granularity in seconds.
    pub granularity_sec: u64,
    /// Number of candles requested per pair per cycle.
    pub candle_lookback: u32,
    pub exchange: ExchangeSettings,
    pub advisor: AdvisorSettings,
    pub risk: RiskSettings,
    pub allocation: AllocationSettings,
    pub output: OutputSettings,
    pub weight_overrides: WeightOverrides,
}

/// Optional per-regime weight table overrides.
#[derive(Debug, Clone, Default)]
pub struct WeightOverrides {
    pub bull: Option<WeightOverride>,
    pub bear: Option<WeightOverride>,
    pub sideways: Option<WeightOverride>,
}

impl Settings {
    /// Load the full configuration from the environment.
    ///
    /// Fails on unparseable values or an inconsistent universe; missing keys
    /// fall back to defaults.
    pub fn from_env() -> Result<Self> {
        let quote_currency = env_string("MERIDIAN_BASE_CURRENCY", "EUR").to_uppercase();

        let pairs = match env_opt("MERIDIAN_TRADING_PAIRS") {
            Some(raw) => {
                let mut parsed = Vec::new();
                for item in raw.split(',') {
                    let item = item.trim();
                    if item.is_empty() {
                        continue;
                    }
                    let pair = Pair::parse(item)
                        .with_context(|| format!("invalid trading pair '{item}'"))?;
                    parsed.push(pair);
                }
                parsed
            }
            None => default_pairs(),
        };

        if pairs.is_empty() {
            bail!("MERIDIAN_TRADING_PAIRS resolved to an empty universe");
        }
        for pair in &pairs {
            if pair.quote != quote_currency {
                bail!(
                    "pair {pair} does not quote in the configured base currency {quote_currency}"
                );
            }
        }

        let decision_interval_minutes = env_u64("MERIDIAN_DECISION_INTERVAL_MINUTES", 60)?;
        if decision_interval_minutes == 0 {
            bail!("MERIDIAN_DECISION_INTERVAL_MINUTES must be >= 1");
        }

        let granularity_sec = env_u64("MERIDIAN_GRANULARITY_SEC", 3600)?;
        if granularity_sec == 0 {
            bail!("MERIDIAN_GRANULARITY_SEC must be >= 1");
        }
        if decision_interval_minutes * 60 < granularity_sec {
            bail!(
                "MERIDIAN_DECISION_INTERVAL_MINUTES ({decision_interval_minutes}m) must cover at \
                 least one candle of MERIDIAN_GRANULARITY_SEC ({granularity_sec}s)"
            );
        }

        let risk_level_raw = env_string("MERIDIAN_RISK_LEVEL", "MEDIUM");
        let risk_level = RiskLevel::from_str_loose(&risk_level_raw)
            .with_context(|| format!("MERIDIAN_RISK_LEVEL must be LOW/MEDIUM/HIGH, got '{risk_level_raw}'"))?;

        let snapshot_frequency = env_string("MERIDIAN_SNAPSHOT_FREQUENCY", "hourly").to_lowercase();
        if snapshot_frequency != "hourly" && snapshot_frequency != "daily" {
            bail!("MERIDIAN_SNAPSHOT_FREQUENCY must be 'hourly' or 'daily'");
        }

        let settings = Self {
            pairs,
            quote_currency,
            decision_interval_minutes,
            granularity_sec,
            candle_lookback: env_u64("MERIDIAN_CANDLE_LOOKBACK", 300)? as u32,
            exchange: ExchangeSettings {
                api_key: env_string("MERIDIAN_API_KEY", ""),
                api_secret: env_string("MERIDIAN_API_SECRET", ""),
                base_url: env_string(
                    "MERIDIAN_EXCHANGE_BASE_URL",
                    "https://api.exchange.example.com",
                ),
                rate_limit_per_sec: env_u64("MERIDIAN_RATE_LIMIT_PER_SEC", 10)? as u32,
                max_retries: env_u64("MERIDIAN_MAX_RETRIES", 3)? as u32,
                request_timeout_sec: env_u64("MERIDIAN_REQUEST_TIMEOUT_SEC", 30)?,
            },
            advisor: AdvisorSettings {
                provider: env_string("MERIDIAN_ADVISOR_PROVIDER", "vertex"),
                primary_model: env_string("MERIDIAN_ADVISOR_PRIMARY_MODEL", "advisor-pro"),
                fallback_model: env_string("MERIDIAN_ADVISOR_FALLBACK_MODEL", "advisor-flash"),
                api_key: env_string("MERIDIAN_ADVISOR_API_KEY", ""),
                location: env_string("MERIDIAN_ADVISOR_LOCATION", "europe-west1"),
                base_url: env_string(
                    "MERIDIAN_ADVISOR_BASE_URL",
                    "https://advisor.example.com",
                ),
                timeout_sec: env_u64("MERIDIAN_ADVISOR_TIMEOUT_SEC", 20)?,
            },
            risk: RiskSettings {
                risk_level,
                simulation_mode: env_bool("MERIDIAN_SIMULATION_MODE", true)?,
                buy_confidence_threshold: env_f64("MERIDIAN_BUY_CONFIDENCE_THRESHOLD", 55.0)?,
                sell_confidence_threshold: env_f64("MERIDIAN_SELL_CONFIDENCE_THRESHOLD", 55.0)?,
                cooldown_minutes: env_u64("MERIDIAN_COOLDOWN_MINUTES", 30)?,
                trend_threshold: env_f64("MERIDIAN_TREND_THRESHOLD", 0.6)?,
                sim_slippage_bps: env_f64("MERIDIAN_SIM_SLIPPAGE_BPS", 5.0)?,
                sim_fee_bps: env_f64("MERIDIAN_SIM_FEE_BPS", 10.0)?,
            },
            allocation: AllocationSettings {
                target_quote_allocation: env_f64("MERIDIAN_TARGET_QUOTE_ALLOCATION_PCT", 30.0)?
                    / 100.0,
                min_quote_reserve_absolute: env_f64("MERIDIAN_MIN_QUOTE_RESERVE_ABSOLUTE", 50.0)?,
                min_trade_amount: env_f64("MERIDIAN_MIN_TRADE_AMOUNT", 10.0)?,
                max_position_size: env_f64("MERIDIAN_MAX_POSITION_SIZE_PCT", 25.0)? / 100.0,
                capital_reserve_ratio: env_f64("MERIDIAN_CAPITAL_RESERVE_RATIO", 0.2)?,
                min_trade_allocation: env_f64("MERIDIAN_MIN_TRADE_ALLOCATION", 50.0)?,
                max_single_trade_ratio: env_f64("MERIDIAN_MAX_SINGLE_TRADE_RATIO", 0.6)?,
                allocation_power_factor: env_f64("MERIDIAN_ALLOCATION_POWER_FACTOR", 1.2)?,
                min_actionable_confidence: env_f64("MERIDIAN_MIN_ACTIONABLE_CONFIDENCE", 50.0)?,
                momentum_threshold_pct: env_f64("MERIDIAN_MOMENTUM_THRESHOLD_PCT", 3.0)?,
            },
            output: OutputSettings {
                data_dir: env_string("MERIDIAN_DATA_DIR", "./data").into(),
                dashboard_export: env_bool("MERIDIAN_DASHBOARD_EXPORT", true)?,
                notifications_enabled: env_bool("MERIDIAN_NOTIFICATIONS_ENABLED", false)?,
                archive_candles: env_bool("MERIDIAN_ARCHIVE_CANDLES", true)?,
                snapshot_frequency,
                snapshot_retention_days: env_u64("MERIDIAN_SNAPSHOT_RETENTION_DAYS", 90)? as u32,
            },
            weight_overrides: WeightOverrides {
                bull: parse_weight_override("MERIDIAN_WEIGHTS_BULL")?,
                bear: parse_weight_override("MERIDIAN_WEIGHTS_BEAR")?,
                sideways: parse_weight_override("MERIDIAN_WEIGHTS_SIDEWAYS")?,
            },
        };

        Ok(settings)
    }

    /// True when live credentials are required but missing.
    pub fn requires_credentials(&self) -> bool {
        !self.risk.simulation_mode
            && (self.exchange.api_key.is_empty() || self.exchange.api_secret.is_empty())
    }
}

/// Parse an optional "t,m,mo,a" weight override; the four weights must sum to
/// 1 within a small tolerance.
fn parse_weight_override(key: &str) -> Result<Option<WeightOverride>> {
    let raw = match env_opt(key) {
        Some(v) => v,
        None => return Ok(None),
    };

    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("{key} must be four comma-separated numbers"))?;

    if parts.len() != 4 {
        bail!("{key} must contain exactly four weights, got {}", parts.len());
    }
    let sum: f64 = parts.iter().sum();
    if (sum - 1.0).abs() > 1e-6 {
        bail!("{key} weights must sum to 1.0, got {sum}");
    }

    Ok(Some([parts[0], parts[1], parts[2], parts[3]]))
}

#[cfg(test)]
impl Default for Settings {
    /// Baseline configuration used throughout the test suite; mirrors the
    /// documented defaults without touching the process environment.
    fn default() -> Self {
        Self {
            pairs: default_pairs(),
            quote_currency: "EUR".into(),
            decision_interval_minutes: 60,
            granularity_sec: 3600,
            candle_lookback: 300,
            exchange: ExchangeSettings {
                api_key: String::new(),
                api_secret: String::new(),
                base_url: "https://api.exchange.example.com".into(),
                rate_limit_per_sec: 10,
                max_retries: 3,
                request_timeout_sec: 30,
            },
            advisor: AdvisorSettings {
                provider: "vertex".into(),
                primary_model: "advisor-pro".into(),
                fallback_model: "advisor-flash".into(),
                api_key: String::new(),
                location: "europe-west1".into(),
                base_url: "https://advisor.example.com".into(),
                timeout_sec: 20,
            },
            risk: RiskSettings {
                risk_level: RiskLevel::Medium,
                simulation_mode: true,
                buy_confidence_threshold: 55.0,
                sell_confidence_threshold: 55.0,
                cooldown_minutes: 30,
                trend_threshold: 0.6,
                sim_slippage_bps: 5.0,
                sim_fee_bps: 10.0,
            },
            allocation: AllocationSettings {
                target_quote_allocation: 0.30,
                min_quote_reserve_absolute: 50.0,
                min_trade_amount: 10.0,
                max_position_size: 0.25,
                capital_reserve_ratio: 0.2,
                min_trade_allocation: 50.0,
                max_single_trade_ratio: 0.6,
                allocation_power_factor: 1.2,
                min_actionable_confidence: 50.0,
                momentum_threshold_pct: 3.0,
            },
            output: OutputSettings {
                data_dir: std::env::temp_dir().join("meridian-test-data"),
                dashboard_export: true,
                notifications_enabled: false,
                archive_candles: false,
                snapshot_frequency: "hourly".into(),
                snapshot_retention_days: 90,
            },
            weight_overrides: WeightOverrides::default(),
        }
    }
}
