// =============================================================================
// HTTP exchange client — HMAC-SHA256 signed REST requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Every private
// request carries MX-ACCESS-KEY, MX-ACCESS-TIMESTAMP and MX-ACCESS-SIGN
// headers, where the signature is the hex HMAC-SHA256 of
// `{timestamp}{METHOD}{path}{body}`.
//
// Transient failures (connection errors, 5xx) are retried by the middleware
// with exponential backoff and jitter; 429 is converted into one bounded
// sleep-and-retry; 401/403 surface as AuthenticationError and end the cycle.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::config::ExchangeSettings;
use crate::errors::ExchangeError;
use crate::exchange::rate_limit::RateLimiter;
use crate::exchange::{AccountBalance, ExchangeApi, OrderFill, OrderReport, OrderSize, Ticker};
use crate::market_data::Candle;
use crate::types::{Pair, Side};

type HmacSha256 = Hmac<Sha256>;

/// How often and how long `place_market_order` polls for a terminal status.
const ORDER_POLL_ATTEMPTS: u32 = 10;
const ORDER_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Upper bound for the sleep taken on a 429 before the single re-attempt.
const RATE_LIMIT_SLEEP_CAP_SECS: u64 = 10;

/// Signed REST client for the exchange.
pub struct HttpExchangeClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    http: ClientWithMiddleware,
    limiter: RateLimiter,
}

impl HttpExchangeClient {
    /// Build a client from the exchange settings, wiring the retry middleware
    /// and the sliding-window throttle.
    pub fn new(settings: &ExchangeSettings) -> Self {
        let retry_policy = ExponentialBackoff::builder()
            .build_with_max_retries(settings.max_retries);

        let inner = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_sec))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let http = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        debug!(base_url = %settings.base_url, "exchange client initialised");

        Self {
            api_key: settings.api_key.clone(),
            api_secret: settings.api_secret.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http,
            limiter: RateLimiter::per_second(settings.rate_limit_per_sec),
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// Hex HMAC-SHA256 of `{timestamp}{METHOD}{path}{body}`.
    pub fn sign(&self, timestamp: u64, method: &str, path: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(format!("{timestamp}{method}{path}{body}").as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_secs()
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// Send one signed request, returning the status and parsed JSON body.
    ///
    /// Common failure classes (auth, rate limit, 5xx) are mapped here;
    /// endpoint-specific 4xx handling is left to the caller.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<(StatusCode, serde_json::Value), ExchangeError> {
        let mut rate_limit_retried = false;

        loop {
            self.limiter.acquire().await;

            let url = format!("{}{}", self.base_url, path);
            let body_text = body.map(|b| b.to_string()).unwrap_or_default();
            let ts = Self::timestamp();
            let signature = self.sign(ts, method.as_str(), path, &body_text);

            let mut request = self
                .http
                .request(method.clone(), &url)
                .header("MX-ACCESS-KEY", &self.api_key)
                .header("MX-ACCESS-TIMESTAMP", ts.to_string())
                .header("MX-ACCESS-SIGN", signature);
            if let Some(b) = body {
                request = request.json(b);
            }

            let response = request.send().await.map_err(|e| ExchangeError::Transient {
                reason: format!("{method} {path}: {e}"),
            })?;

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(1)
                    .min(RATE_LIMIT_SLEEP_CAP_SECS);

                if rate_limit_retried {
                    return Err(ExchangeError::RateLimited {
                        retry_after_secs: retry_after,
                    });
                }

                warn!(path, retry_after, "rate limited by exchange — sleeping");
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                rate_limit_retried = true;
                continue;
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ExchangeError::Authentication {
                    reason: format!("{method} {path} returned {status}"),
                });
            }

            if status.is_server_error() {
                // The middleware already retried; whatever remains is terminal.
                return Err(ExchangeError::Transient {
                    reason: format!("{method} {path} returned {status}"),
                });
            }

            let value = if status == StatusCode::NO_CONTENT {
                serde_json::Value::Null
            } else {
                response.json().await.map_err(|e| ExchangeError::Malformed {
                    reason: format!("{method} {path}: {e}"),
                })?
            };

            return Ok((status, value));
        }
    }

    // -------------------------------------------------------------------------
    // Parsing helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn number(value: &serde_json::Value) -> Result<f64, ExchangeError> {
        if let Some(s) = value.as_str() {
            s.parse::<f64>().map_err(|_| ExchangeError::Malformed {
                reason: format!("expected numeric string, got '{s}'"),
            })
        } else if let Some(n) = value.as_f64() {
            Ok(n)
        } else {
            Err(ExchangeError::Malformed {
                reason: format!("expected number, got {value}"),
            })
        }
    }

    /// Parse the `[[time, low, high, open, close, volume], ...]` candle
    /// response into oldest-first candles, skipping malformed rows.
    fn parse_candles(body: &serde_json::Value) -> Result<Vec<Candle>, ExchangeError> {
        let rows = body.as_array().ok_or_else(|| ExchangeError::Malformed {
            reason: "candle response is not an array".into(),
        })?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let cols = match row.as_array() {
                Some(c) if c.len() >= 6 => c,
                _ => {
                    warn!("skipping malformed candle row: {row}");
                    continue;
                }
            };

            let parsed = (
                cols[0].as_i64(),
                Self::number(&cols[1]).ok(),
                Self::number(&cols[2]).ok(),
                Self::number(&cols[3]).ok(),
                Self::number(&cols[4]).ok(),
                Self::number(&cols[5]).ok(),
            );
            match parsed {
                (Some(time), Some(low), Some(high), Some(open), Some(close), Some(volume)) => {
                    candles.push(Candle {
                        time,
                        low,
                        high,
                        open,
                        close,
                        volume,
                    });
                }
                _ => warn!("skipping candle row with non-numeric fields: {row}"),
            }
        }

        candles.sort_by_key(|c| c.time);
        Ok(candles)
    }

    fn parse_order_report(body: &serde_json::Value) -> Result<OrderReport, ExchangeError> {
        Ok(OrderReport {
            order_id: body["id"]
                .as_str()
                .ok_or_else(|| ExchangeError::Malformed {
                    reason: "order response missing 'id'".into(),
                })?
                .to_string(),
            status: body["status"].as_str().unwrap_or("unknown").to_string(),
            settled: body["settled"].as_bool().unwrap_or(false),
            filled_size: Self::number(&body["filled_size"]).unwrap_or(0.0),
            executed_value: Self::number(&body["executed_value"]).unwrap_or(0.0),
            fill_fees: Self::number(&body["fill_fees"]).unwrap_or(0.0),
        })
    }

    fn fill_from_report(report: &OrderReport) -> OrderFill {
        let price = if report.filled_size > 0.0 {
            report.executed_value / report.filled_size
        } else {
            0.0
        };
        OrderFill {
            order_id: report.order_id.clone(),
            base_amount: report.filled_size,
            quote_amount: report.executed_value,
            price,
            fees: report.fill_fees,
            partial: report.status == "partial",
        }
    }
}

#[async_trait]
impl ExchangeApi for HttpExchangeClient {
    #[instrument(skip(self), name = "exchange::get_accounts")]
    async fn get_accounts(&self) -> Result<Vec<AccountBalance>, ExchangeError> {
        let (status, body) = self.send(Method::GET, "/accounts", None).await?;
        if !status.is_success() {
            return Err(ExchangeError::Malformed {
                reason: format!("GET /accounts returned {status}: {body}"),
            });
        }

        let rows = body.as_array().ok_or_else(|| ExchangeError::Malformed {
            reason: "accounts response is not an array".into(),
        })?;

        let mut balances = Vec::with_capacity(rows.len());
        for row in rows {
            let currency = match row["currency"].as_str() {
                Some(c) => c.to_uppercase(),
                None => continue,
            };
            balances.push(AccountBalance {
                currency,
                available: Self::number(&row["available"]).unwrap_or(0.0),
                hold: Self::number(&row["hold"]).unwrap_or(0.0),
            });
        }

        debug!(count = balances.len(), "account snapshot retrieved");
        Ok(balances)
    }

    #[instrument(skip(self), name = "exchange::get_ticker")]
    async fn get_product_ticker(&self, pair: &Pair) -> Result<Ticker, ExchangeError> {
        let path = format!("/products/{pair}/ticker");
        let (status, body) = self.send(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExchangeError::Malformed {
                reason: format!("GET {path} returned {status}: {body}"),
            });
        }

        Ok(Ticker {
            price: Self::number(&body["price"])?,
            bid: Self::number(&body["bid"]).unwrap_or(0.0),
            ask: Self::number(&body["ask"]).unwrap_or(0.0),
            volume_24h: Self::number(&body["volume"]).unwrap_or(0.0),
        })
    }

    #[instrument(skip(self), name = "exchange::get_candles")]
    async fn get_candles(
        &self,
        pair: &Pair,
        granularity_sec: u64,
        lookback: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let path = format!(
            "/products/{pair}/candles?granularity={granularity_sec}&limit={lookback}"
        );
        let (status, body) = self.send(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExchangeError::Malformed {
                reason: format!("GET {path} returned {status}: {body}"),
            });
        }

        let candles = Self::parse_candles(&body)?;
        debug!(%pair, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    #[instrument(skip(self, size), name = "exchange::place_market_order")]
    async fn place_market_order(
        &self,
        pair: &Pair,
        side: Side,
        size: OrderSize,
        client_order_id: &str,
    ) -> Result<OrderFill, ExchangeError> {
        let mut order = serde_json::json!({
            "product_id": pair.to_string(),
            "side": side.to_string().to_lowercase(),
            "type": "market",
            "client_order_id": client_order_id,
        });
        match size {
            OrderSize::QuoteFunds(funds) => {
                order["funds"] = serde_json::json!(format!("{funds:.8}"));
            }
            OrderSize::BaseAmount(amount) => {
                order["size"] = serde_json::json!(format!("{amount:.8}"));
            }
        }

        let (status, body) = self.send(Method::POST, "/orders", Some(&order)).await?;

        if status.is_client_error() {
            let message = body["message"].as_str().unwrap_or("").to_lowercase();
            if message.contains("insufficient") {
                return Err(ExchangeError::InsufficientBalance {
                    need: size.value(),
                    available: Self::number(&body["available"]).unwrap_or(0.0),
                });
            }
            return Err(ExchangeError::OrderRejected {
                pair: pair.to_string(),
                reason: if message.is_empty() {
                    format!("{status}")
                } else {
                    message
                },
            });
        }

        let order_id = body["id"]
            .as_str()
            .ok_or_else(|| ExchangeError::Malformed {
                reason: format!("order response missing 'id': {body}"),
            })?
            .to_string();

        // Poll until the exchange reports a terminal status.
        for attempt in 0..ORDER_POLL_ATTEMPTS {
            match self.get_order(&order_id).await {
                Ok(report) if report.settled => {
                    if report.status == "rejected" {
                        return Err(ExchangeError::OrderRejected {
                            pair: pair.to_string(),
                            reason: "rejected after acceptance".into(),
                        });
                    }
                    debug!(%pair, order_id = %report.order_id, "order settled");
                    return Ok(Self::fill_from_report(&report));
                }
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    warn!(order_id, attempt, error = %e, "order poll failed — retrying");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(ORDER_POLL_INTERVAL).await;
        }

        Err(ExchangeError::OrderUnknown {
            pair: pair.to_string(),
            order_id,
        })
    }

    #[instrument(skip(self), name = "exchange::get_order")]
    async fn get_order(&self, order_id: &str) -> Result<OrderReport, ExchangeError> {
        let path = format!("/orders/{order_id}");
        let (status, body) = self.send(Method::GET, &path, None).await?;
        if !status.is_success() {
            return Err(ExchangeError::Malformed {
                reason: format!("GET {path} returned {status}: {body}"),
            });
        }
        Self::parse_order_report(&body)
    }
}

impl std::fmt::Debug for HttpExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExchangeClient")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
