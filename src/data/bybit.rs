//! Bybit v5 connector (linear perpetuals).
//!
//! v5 wraps every payload in `{retCode, retMsg, result}` and returns lists
//! newest-first, so pagination walks backwards from the range end and the
//! shared sort/dedup pass restores ascending order. Historical liquidations
//! and basis are not offered, so those capabilities stay `NotSupported`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::connector::{
    field_f64, json_f64, sort_dedup_by_ts, ExchangeConnector, RestClient, TimeRange,
};
use super::limiter::RateLimiter;
use crate::error::ExchangeError;
use crate::market::series::{
    Cadence, Candle, FundingPoint, LongShortPoint, OiPoint, Series, SeriesData, SeriesKind,
    SeriesMeta,
};
use crate::market::symbol::{Exchange, Symbol, SymbolMapper};
use crate::market::timeframe::Timeframe;

const BASE_URL: &str = "https://api.bybit.com";
const KLINE_PAGE: usize = 1000;
const FUNDING_PAGE: usize = 200;
const STATS_PAGE: usize = 200;

pub struct BybitConnector {
    rest: RestClient,
    mapper: SymbolMapper,
}

fn interval(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::M1 => "1",
        Timeframe::M5 => "5",
        Timeframe::M15 => "15",
        Timeframe::H1 => "60",
        Timeframe::H4 => "240",
        Timeframe::D1 => "D",
    }
}

/// Millisecond timestamp of a v5 list row (string-keyed or positional).
fn row_ts(row: &Value) -> Option<i64> {
    if let Some(first) = row.get(0) {
        return json_f64(first).map(|v| v as i64);
    }
    for field in ["timestamp", "fundingRateTimestamp"] {
        if let Some(ts) = row.get(field).and_then(json_f64) {
            return Some(ts as i64);
        }
    }
    None
}

impl BybitConnector {
    pub fn new(limiter: Arc<RateLimiter>) -> Result<Self, ExchangeError> {
        Ok(Self {
            rest: RestClient::new(Exchange::Bybit, limiter)?,
            mapper: SymbolMapper::new(),
        })
    }

    fn native(&self, symbol: &Symbol) -> String {
        self.mapper.to_exchange(symbol, Exchange::Bybit)
    }

    /// Unwrap the v5 envelope, mapping retCode failures to error kinds.
    async fn get_result(
        &self,
        url: &str,
        params: &[(&str, String)],
        weight: u32,
    ) -> Result<Value, ExchangeError> {
        let body = self.rest.get_json(url, params, weight).await?;
        let ret_code = body.get("retCode").and_then(Value::as_i64).unwrap_or(-1);
        if ret_code != 0 {
            let msg = body
                .get("retMsg")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            if msg.to_lowercase().contains("symbol") {
                return Err(ExchangeError::SymbolNotFound(msg.to_string()));
            }
            return Err(ExchangeError::Api(format!("bybit retCode {ret_code}: {msg}")));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| ExchangeError::Format("bybit response missing result".into()))
    }

    /// Walk a newest-first list endpoint backwards until the range start is
    /// covered. Without a range a single page is returned.
    async fn paginate_desc(
        &self,
        url: &str,
        base_params: &[(&str, String)],
        range: Option<TimeRange>,
        start_key: &'static str,
        end_key: &'static str,
        page_size: usize,
        weight: u32,
    ) -> Result<Vec<Value>, ExchangeError> {
        let mut rows: Vec<Value> = Vec::new();
        let mut cursor_end = range.map(|(_, end)| end.timestamp_millis());

        loop {
            let mut params: Vec<(&str, String)> = base_params.to_vec();
            params.push(("limit", page_size.to_string()));
            if let Some((start, _)) = range {
                params.push((start_key, start.timestamp_millis().to_string()));
            }
            if let Some(end) = cursor_end {
                params.push((end_key, end.to_string()));
            }

            let result = self.get_result(url, &params, weight).await?;
            let page = result
                .get("list")
                .and_then(Value::as_array)
                .ok_or_else(|| ExchangeError::Format(format!("missing list in {url}")))?;
            if page.is_empty() {
                break;
            }

            tracing::debug!(url, rows = page.len(), "bybit page fetched");
            rows.extend(page.iter().cloned());

            if page.len() < page_size || range.is_none() {
                break;
            }

            let oldest = page
                .iter()
                .filter_map(row_ts)
                .min()
                .ok_or_else(|| ExchangeError::Format("page row without timestamp".into()))?;
            let next_end = oldest - 1;
            if cursor_end.is_some_and(|c| next_end >= c)
                || range.is_some_and(|(start, _)| next_end < start.timestamp_millis())
            {
                break;
            }
            cursor_end = Some(next_end);
        }
        Ok(rows)
    }
}

fn parse_kline(row: &Value) -> Result<Candle, ExchangeError> {
    use super::connector::{index_f64, ts_from_ms};
    let ts_ms = row_ts(row)
        .ok_or_else(|| ExchangeError::Format("kline row without timestamp".into()))?;
    Ok(Candle {
        ts: ts_from_ms(ts_ms)?,
        open: index_f64(row, 1)?,
        high: index_f64(row, 2)?,
        low: index_f64(row, 3)?,
        close: index_f64(row, 4)?,
        volume: index_f64(row, 5)?,
    })
}

#[async_trait]
impl ExchangeConnector for BybitConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn get_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![
            ("category", "linear".to_string()),
            ("symbol", self.native(symbol)),
            ("interval", interval(timeframe).to_string()),
        ];
        let rows = self
            .paginate_desc(
                &format!("{BASE_URL}/v5/market/kline"),
                &params,
                range,
                "start",
                "end",
                KLINE_PAGE,
                1,
            )
            .await?;

        let mut candles = rows
            .iter()
            .map(parse_kline)
            .collect::<Result<Vec<_>, _>>()?;
        sort_dedup_by_ts(&mut candles, |c| c.ts);

        Ok(Series {
            meta: SeriesMeta::ohlcv(symbol.clone(), Exchange::Bybit, timeframe),
            data: SeriesData::Ohlcv(candles),
        })
    }

    async fn get_funding_rate(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![
            ("category", "linear".to_string()),
            ("symbol", self.native(symbol)),
        ];
        let rows = self
            .paginate_desc(
                &format!("{BASE_URL}/v5/market/funding/history"),
                &params,
                range,
                "startTime",
                "endTime",
                FUNDING_PAGE,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                let ts_ms = row_ts(row)
                    .ok_or_else(|| ExchangeError::Format("funding row without timestamp".into()))?;
                Ok(FundingPoint {
                    ts: super::connector::ts_from_ms(ts_ms)?,
                    rate: field_f64(row, "fundingRate")?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Bybit,
                SeriesKind::FundingRate,
                Cadence::FUNDING_8H,
            ),
            data: SeriesData::Funding(points),
        })
    }

    async fn get_open_interest(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![
            ("category", "linear".to_string()),
            ("symbol", self.native(symbol)),
            ("intervalTime", "1h".to_string()),
        ];
        let rows = self
            .paginate_desc(
                &format!("{BASE_URL}/v5/market/open-interest"),
                &params,
                range,
                "startTime",
                "endTime",
                STATS_PAGE,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                let ts_ms = row_ts(row)
                    .ok_or_else(|| ExchangeError::Format("oi row without timestamp".into()))?;
                Ok(OiPoint {
                    ts: super::connector::ts_from_ms(ts_ms)?,
                    value: field_f64(row, "openInterest")?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Bybit,
                SeriesKind::OpenInterest,
                Cadence::from(Timeframe::H1),
            ),
            data: SeriesData::OpenInterest(points),
        })
    }

    async fn get_long_short_ratio(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![
            ("category", "linear".to_string()),
            ("symbol", self.native(symbol)),
            ("period", "1h".to_string()),
        ];
        let rows = self
            .paginate_desc(
                &format!("{BASE_URL}/v5/market/account-ratio"),
                &params,
                range,
                "startTime",
                "endTime",
                STATS_PAGE,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                let ts_ms = row_ts(row)
                    .ok_or_else(|| ExchangeError::Format("ratio row without timestamp".into()))?;
                Ok(LongShortPoint {
                    ts: super::connector::ts_from_ms(ts_ms)?,
                    long_ratio: field_f64(row, "buyRatio")?,
                    short_ratio: field_f64(row, "sellRatio")?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Bybit,
                SeriesKind::LongShortRatio,
                Cadence::from(Timeframe::H1),
            ),
            data: SeriesData::LongShort(points),
        })
    }

    async fn get_mark_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        let params = vec![
            ("category", "linear".to_string()),
            ("symbol", self.native(symbol)),
        ];
        let result = self
            .get_result(&format!("{BASE_URL}/v5/market/tickers"), &params, 1)
            .await?;
        let first = result
            .get("list")
            .and_then(Value::as_array)
            .and_then(|l| l.first())
            .ok_or_else(|| ExchangeError::Format("empty tickers list".into()))?;
        field_f64(first, "markPrice")
    }
}
