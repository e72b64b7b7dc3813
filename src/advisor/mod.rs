// =============================================================================
// Advisory model adapter — the language-model oracle behind the advisory
// strategy
// =============================================================================
//
// The adapter is an opaque oracle: given a compact market brief it returns
// either an opinion `{action, confidence, reasoning}` or a safe-HOLD. Its
// internals (primary/fallback model, prompt assembly, parsing, timeouts) are
// hidden behind `AdvisoryOracle`. The engine never fails a cycle because of
// an advisory failure.
// =============================================================================

pub mod prompt;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::AdvisorSettings;
use crate::portfolio::PortfolioView;
use crate::strategy::regime::MarketRegime;
use crate::types::{Action, Pair};

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// The oracle's answer for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdvisorVerdict {
    Opinion {
        action: Action,
        confidence: f64,
        reasoning: String,
    },
    SafeHold {
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Portfolio awareness
// ---------------------------------------------------------------------------

/// Cash-position bands derived from the target quote allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CashStance {
    /// Below 0.6x target: prefer SELL, demand very high conviction for BUY.
    CriticalLow,
    /// Below target: prefer SELL.
    Low,
    /// Between target and 1.5x target.
    Balanced,
    /// Above 1.5x target: prefer BUY.
    High,
}

/// The portfolio block the advisory prompt always carries.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioAwareness {
    pub quote_currency: String,
    pub quote_balance: f64,
    /// Current quote share of the portfolio, percent.
    pub quote_pct: f64,
    /// Target quote share, percent.
    pub target_pct: f64,
    pub critical_low_pct: f64,
    pub low_pct: f64,
    pub high_pct: f64,
    /// Cycle-wide hard-bear override; raises the BUY conviction bar to 85.
    pub hard_bear: bool,
}

impl PortfolioAwareness {
    /// Derive the awareness block from a portfolio view and the configured
    /// target quote allocation (fraction in [0,1]).
    pub fn assess(view: &PortfolioView, target_quote_allocation: f64, hard_bear: bool) -> Self {
        let target_pct = target_quote_allocation * 100.0;
        Self {
            quote_currency: view.quote_currency.clone(),
            quote_balance: view.quote_amount,
            quote_pct: view.quote_share() * 100.0,
            target_pct,
            critical_low_pct: 0.6 * target_pct,
            low_pct: target_pct,
            high_pct: 1.5 * target_pct,
            hard_bear,
        }
    }

    pub fn stance(&self) -> CashStance {
        if self.quote_pct < self.critical_low_pct {
            CashStance::CriticalLow
        } else if self.quote_pct < self.low_pct {
            CashStance::Low
        } else if self.quote_pct > self.high_pct {
            CashStance::High
        } else {
            CashStance::Balanced
        }
    }
}

// ---------------------------------------------------------------------------
// Market brief
// ---------------------------------------------------------------------------

/// Compact market summary handed to the oracle.
#[derive(Debug, Clone, Serialize)]
pub struct MarketBrief {
    pub pair: Pair,
    pub price: f64,
    pub rsi: f64,
    pub macd_histogram: f64,
    pub price_change_24h: f64,
    pub price_change_7d: f64,
    pub price_change_30d: f64,
    pub regime: MarketRegime,
    pub portfolio: PortfolioAwareness,
}

// ---------------------------------------------------------------------------
// Oracle seam
// ---------------------------------------------------------------------------

/// The advisory oracle the engine consults once per pair per cycle.
#[async_trait]
pub trait AdvisoryOracle: Send + Sync {
    async fn advise(&self, brief: &MarketBrief) -> AdvisorVerdict;
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

/// HTTPS JSON adapter with a primary and a fallback model.
pub struct HttpAdvisor {
    settings: AdvisorSettings,
    http: reqwest::Client,
}

impl HttpAdvisor {
    pub fn new(settings: AdvisorSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_sec))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { settings, http }
    }

    /// One completion attempt against a specific model.
    async fn complete(&self, model: &str, prompt_text: &str) -> Result<String, String> {
        let url = format!(
            "{}/v1/{}/models/{}:generate",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.provider,
            model
        );

        let body = serde_json::json!({
            "model": model,
            "location": self.settings.location,
            "prompt": prompt_text,
            "temperature": 0.0,
            "max_output_tokens": 256,
        });

        let request = self
            .http
            .post(&url)
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(
            Duration::from_secs(self.settings.timeout_sec),
            request,
        )
        .await
        .map_err(|_| format!("advisory call to {model} timed out"))?
        .map_err(|e| format!("advisory call to {model} failed: {e}"))?;

        if !response.status().is_success() {
            return Err(format!(
                "advisory model {model} returned {}",
                response.status()
            ));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("advisory response from {model} unreadable: {e}"))?;

        value["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| format!("advisory response from {model} missing 'text'"))
    }
}

#[async_trait]
impl AdvisoryOracle for HttpAdvisor {
    #[instrument(skip(self, brief), fields(pair = %brief.pair), name = "advisor::advise")]
    async fn advise(&self, brief: &MarketBrief) -> AdvisorVerdict {
        let prompt_text = prompt::render(brief);

        for model in [&self.settings.primary_model, &self.settings.fallback_model] {
            match self.complete(model, &prompt_text).await {
                Ok(text) => match prompt::parse_verdict(&text) {
                    Some((action, confidence, reasoning)) => {
                        debug!(model, %action, confidence, "advisory opinion received");
                        return AdvisorVerdict::Opinion {
                            action,
                            confidence,
                            reasoning,
                        };
                    }
                    None => {
                        warn!(model, "advisory response unparseable — trying next model");
                    }
                },
                Err(reason) => {
                    warn!(model, reason, "advisory attempt failed");
                }
            }
        }

        let degraded = crate::errors::EngineError::AdvisoryUnavailable {
            reason: "all models failed or returned garbage".into(),
        };
        warn!(tag = degraded.taxonomy_tag(), error = %degraded, "advisory degraded to safe-HOLD");
        AdvisorVerdict::SafeHold {
            reason: "advisory unavailable".into(),
        }
    }
}

impl std::fmt::Debug for HttpAdvisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdvisor")
            .field("provider", &self.settings.provider)
            .field("primary_model", &self.settings.primary_model)
            .field("fallback_model", &self.settings.fallback_model)
            .field("api_key", &"<redacted>")
            .finish()
    }
}
