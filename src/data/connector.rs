//! Abstract exchange connector contract plus the shared REST plumbing.
//!
//! Every HTTP call first awaits the exchange's rate limiter, then retries
//! transient failures with exponential backoff (factor 2, up to 3 attempts).
//! HTTP 429 waits out the window before retrying; 404 and invalid-symbol
//! responses short-circuit to `SymbolNotFound` without retry. Pagination is
//! the connector's problem: callers always receive an ascending, deduplicated
//! series covering the requested range (or as much as the venue has).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::limiter::{LimiterRegistry, RateLimiter};
use crate::error::ExchangeError;
use crate::market::series::{Series, SeriesKind};
use crate::market::symbol::{Exchange, Symbol};
use crate::market::timeframe::Timeframe;

pub type TimeRange = (DateTime<Utc>, DateTime<Utc>);

const MAX_RETRIES: u32 = 3;
const HTTP_TIMEOUT_SECS: u64 = 30;
const RATE_LIMIT_BACKOFF_SECS: u64 = 60;

/// Abstract capability set. Venues that lack an endpoint return
/// [`ExchangeError::NotSupported`] rather than faking data.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn exchange(&self) -> Exchange;

    async fn get_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError>;

    async fn get_funding_rate(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError>;

    async fn get_open_interest(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError>;

    async fn get_basis(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let _ = (symbol, range);
        Err(ExchangeError::NotSupported {
            exchange: self.exchange().as_str(),
            capability: "basis",
        })
    }

    async fn get_long_short_ratio(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError>;

    async fn get_liquidations(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let _ = (symbol, range);
        Err(ExchangeError::NotSupported {
            exchange: self.exchange().as_str(),
            capability: "liquidations",
        })
    }

    async fn get_mark_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError>;

    /// Dispatch by series kind; the pipeline's single entry point.
    async fn fetch_series(
        &self,
        kind: SeriesKind,
        symbol: &Symbol,
        timeframe: Option<Timeframe>,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        match kind {
            SeriesKind::Ohlcv => {
                self.get_ohlcv(symbol, timeframe.unwrap_or(Timeframe::H1), range)
                    .await
            }
            SeriesKind::FundingRate => self.get_funding_rate(symbol, range).await,
            SeriesKind::OpenInterest => self.get_open_interest(symbol, range).await,
            SeriesKind::Basis => self.get_basis(symbol, range).await,
            SeriesKind::Liquidations => self.get_liquidations(symbol, range).await,
            SeriesKind::LongShortRatio => self.get_long_short_ratio(symbol, range).await,
        }
    }
}

/// Build a connector for the given venue, sharing its process-wide limiter.
pub fn make_connector(
    exchange: Exchange,
    limiters: &LimiterRegistry,
) -> Result<Arc<dyn ExchangeConnector>, ExchangeError> {
    let limiter = limiters.get(exchange);
    Ok(match exchange {
        Exchange::Binance => Arc::new(super::binance::BinanceConnector::new(limiter)?),
        Exchange::Bybit => Arc::new(super::bybit::BybitConnector::new(limiter)?),
        Exchange::Okx => Arc::new(super::okx::OkxConnector::new(limiter)?),
    })
}

/// Rate-limited, retrying JSON GET client shared by the connectors.
pub(crate) struct RestClient {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    exchange: Exchange,
}

impl RestClient {
    pub(crate) fn new(exchange: Exchange, limiter: Arc<RateLimiter>) -> Result<Self, ExchangeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .map_err(|e| ExchangeError::Api(format!("client construction: {e}")))?;
        Ok(Self {
            client,
            limiter,
            exchange,
        })
    }

    pub(crate) async fn get_json(
        &self,
        url: &str,
        params: &[(&str, String)],
        weight: u32,
    ) -> Result<Value, ExchangeError> {
        for attempt in 0..=MAX_RETRIES {
            self.limiter.acquire(weight).await;

            let response = match self.client.get(url).query(params).send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt == MAX_RETRIES {
                        return Err(ExchangeError::Api(format!(
                            "{} request failed: {e}",
                            self.exchange
                        )));
                    }
                    let wait = 2u64.pow(attempt);
                    tracing::warn!(
                        exchange = %self.exchange,
                        "request error, retrying in {wait}s (attempt {}/{MAX_RETRIES}): {e}",
                        attempt + 1,
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
            };

            let status = response.status().as_u16();

            if status == 404 {
                return Err(ExchangeError::SymbolNotFound(url.to_string()));
            }

            if status == 429 {
                if attempt == MAX_RETRIES {
                    return Err(ExchangeError::RateLimited(format!(
                        "{} still throttling after {MAX_RETRIES} retries",
                        self.exchange
                    )));
                }
                tracing::warn!(
                    exchange = %self.exchange,
                    "429 rate limited, backing off {RATE_LIMIT_BACKOFF_SECS}s"
                );
                tokio::time::sleep(Duration::from_secs(RATE_LIMIT_BACKOFF_SECS)).await;
                continue;
            }

            if status >= 500 {
                if attempt == MAX_RETRIES {
                    return Err(ExchangeError::Api(format!(
                        "{} server error {status}",
                        self.exchange
                    )));
                }
                let wait = 2u64.pow(attempt + 1);
                tracing::warn!(
                    exchange = %self.exchange,
                    "{status} server error, backing off {wait}s"
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            if status >= 400 {
                // Client errors are deterministic; venues report unknown
                // symbols this way (e.g. Binance code -1121).
                let body = response.text().await.unwrap_or_default();
                if body.contains("-1121") || body.to_lowercase().contains("symbol") {
                    return Err(ExchangeError::SymbolNotFound(body));
                }
                return Err(ExchangeError::Api(format!(
                    "{} client error {status}: {body}",
                    self.exchange
                )));
            }

            return response
                .json::<Value>()
                .await
                .map_err(|e| ExchangeError::Format(format!("{}: {e}", self.exchange)));
        }
        unreachable!("retry loop always returns")
    }
}

// -- shared parse helpers ----------------------------------------------------

pub(crate) fn field_f64(value: &Value, field: &str) -> Result<f64, ExchangeError> {
    let v = value
        .get(field)
        .ok_or_else(|| ExchangeError::Format(format!("missing field {field}")))?;
    json_f64(v).ok_or_else(|| ExchangeError::Format(format!("field {field} not numeric: {v}")))
}

pub(crate) fn field_ts_ms(value: &Value, field: &str) -> Result<DateTime<Utc>, ExchangeError> {
    let ms = field_f64(value, field)? as i64;
    ts_from_ms(ms)
}

/// Accept both JSON numbers and numeric strings — venues mix the two freely.
pub(crate) fn json_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn index_f64(row: &Value, i: usize) -> Result<f64, ExchangeError> {
    let v = row
        .get(i)
        .ok_or_else(|| ExchangeError::Format(format!("missing array element {i}")))?;
    json_f64(v).ok_or_else(|| ExchangeError::Format(format!("element {i} not numeric: {v}")))
}

pub(crate) fn ts_from_ms(ms: i64) -> Result<DateTime<Utc>, ExchangeError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| ExchangeError::Format(format!("timestamp out of range: {ms}")))
}

/// Sort ascending by the key and drop duplicate timestamps (keep first).
pub(crate) fn sort_dedup_by_ts<T>(items: &mut Vec<T>, ts: impl Fn(&T) -> DateTime<Utc>) {
    items.sort_by_key(|item| ts(item));
    items.dedup_by_key(|item| ts(item));
}
