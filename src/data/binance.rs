//! Binance USDⓈ-M futures connector.
//!
//! The richest capability set of the three venues: klines, funding, open
//! interest, long/short account ratio, basis, and mark price. Historical
//! forced-order (liquidation) data was withdrawn from the public API, so
//! `get_liquidations` keeps the default `NotSupported`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::connector::{
    field_f64, field_ts_ms, index_f64, sort_dedup_by_ts, ExchangeConnector, RestClient, TimeRange,
};
use super::limiter::RateLimiter;
use crate::error::ExchangeError;
use crate::market::series::{
    BasisPoint, Cadence, Candle, FundingPoint, LongShortPoint, OiPoint, Series, SeriesData,
    SeriesKind, SeriesMeta,
};
use crate::market::symbol::{Exchange, Symbol, SymbolMapper};
use crate::market::timeframe::Timeframe;

const BASE_URL: &str = "https://fapi.binance.com";
const KLINES_PAGE: usize = 1500;
const FUNDING_PAGE: usize = 1000;
const STATS_PAGE: usize = 500;

pub struct BinanceConnector {
    rest: RestClient,
    mapper: SymbolMapper,
}

impl BinanceConnector {
    pub fn new(limiter: Arc<RateLimiter>) -> Result<Self, ExchangeError> {
        Ok(Self {
            rest: RestClient::new(Exchange::Binance, limiter)?,
            mapper: SymbolMapper::new(),
        })
    }

    fn native(&self, symbol: &Symbol) -> String {
        self.mapper.to_exchange(symbol, Exchange::Binance)
    }

    /// Page through an endpoint keyed by `startTime`, advancing the cursor
    /// past the last row each page. Without a range a single page of the
    /// most recent rows is returned.
    async fn paginate(
        &self,
        url: &str,
        base_params: &[(&str, String)],
        range: Option<TimeRange>,
        page_size: usize,
        weight: u32,
    ) -> Result<Vec<Value>, ExchangeError> {
        let mut rows: Vec<Value> = Vec::new();
        let mut cursor = range.map(|(start, _)| start.timestamp_millis());

        loop {
            let mut params: Vec<(&str, String)> = base_params.to_vec();
            params.push(("limit", page_size.to_string()));
            if let Some(start) = cursor {
                params.push(("startTime", start.to_string()));
            }
            if let Some((_, end)) = range {
                params.push(("endTime", end.timestamp_millis().to_string()));
            }

            let body = self.rest.get_json(url, &params, weight).await?;
            let page = body
                .as_array()
                .ok_or_else(|| ExchangeError::Format(format!("expected array from {url}")))?;
            if page.is_empty() {
                break;
            }

            tracing::debug!(url, rows = page.len(), "binance page fetched");
            rows.extend(page.iter().cloned());

            if page.len() < page_size || range.is_none() {
                break;
            }

            let last_ts = page
                .last()
                .and_then(|row| row_timestamp(row))
                .ok_or_else(|| ExchangeError::Format("page row without timestamp".into()))?;
            let next = last_ts + 1;
            if cursor.is_some_and(|c| next <= c) {
                break;
            }
            cursor = Some(next);
        }
        Ok(rows)
    }
}

/// Timestamp of a row in either the kline (array) or object shape.
fn row_timestamp(row: &Value) -> Option<i64> {
    if let Some(first) = row.get(0) {
        return first.as_i64();
    }
    for field in ["timestamp", "fundingTime"] {
        if let Some(ts) = row.get(field).and_then(Value::as_i64) {
            return Some(ts);
        }
    }
    None
}

fn parse_kline(row: &Value) -> Result<Candle, ExchangeError> {
    let ts_ms = row
        .get(0)
        .and_then(Value::as_i64)
        .ok_or_else(|| ExchangeError::Format("kline open time missing".into()))?;
    let ts = DateTime::from_timestamp_millis(ts_ms)
        .ok_or_else(|| ExchangeError::Format(format!("kline timestamp out of range: {ts_ms}")))?;
    Ok(Candle {
        ts,
        open: index_f64(row, 1)?,
        high: index_f64(row, 2)?,
        low: index_f64(row, 3)?,
        close: index_f64(row, 4)?,
        volume: index_f64(row, 5)?,
    })
}

fn clip_range<T>(items: &mut Vec<T>, range: Option<TimeRange>, ts: impl Fn(&T) -> DateTime<Utc>) {
    if let Some((start, end)) = range {
        items.retain(|item| {
            let t = ts(item);
            t >= start && t <= end
        });
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn get_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![
            ("symbol", self.native(symbol)),
            ("interval", timeframe.as_str().to_string()),
        ];
        let rows = self
            .paginate(
                &format!("{BASE_URL}/fapi/v1/klines"),
                &params,
                range,
                KLINES_PAGE,
                5,
            )
            .await?;

        let mut candles = rows
            .iter()
            .map(parse_kline)
            .collect::<Result<Vec<_>, _>>()?;
        sort_dedup_by_ts(&mut candles, |c| c.ts);
        clip_range(&mut candles, range, |c| c.ts);

        Ok(Series {
            meta: SeriesMeta::ohlcv(symbol.clone(), Exchange::Binance, timeframe),
            data: SeriesData::Ohlcv(candles),
        })
    }

    async fn get_funding_rate(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![("symbol", self.native(symbol))];
        let rows = self
            .paginate(
                &format!("{BASE_URL}/fapi/v1/fundingRate"),
                &params,
                range,
                FUNDING_PAGE,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                Ok(FundingPoint {
                    ts: field_ts_ms(row, "fundingTime")?,
                    rate: field_f64(row, "fundingRate")?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);
        clip_range(&mut points, range, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Binance,
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
            ("symbol", self.native(symbol)),
            ("period", "1h".to_string()),
        ];
        let rows = self
            .paginate(
                &format!("{BASE_URL}/futures/data/openInterestHist"),
                &params,
                range,
                STATS_PAGE,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                Ok(OiPoint {
                    ts: field_ts_ms(row, "timestamp")?,
                    value: field_f64(row, "sumOpenInterest")?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);
        clip_range(&mut points, range, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Binance,
                SeriesKind::OpenInterest,
                Cadence::from(Timeframe::H1),
            ),
            data: SeriesData::OpenInterest(points),
        })
    }

    async fn get_basis(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![
            ("pair", self.native(symbol)),
            ("contractType", "PERPETUAL".to_string()),
            ("period", "1h".to_string()),
        ];
        let rows = self
            .paginate(
                &format!("{BASE_URL}/futures/data/basis"),
                &params,
                range,
                STATS_PAGE,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                Ok(BasisPoint {
                    ts: field_ts_ms(row, "timestamp")?,
                    value: field_f64(row, "basis")?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);
        clip_range(&mut points, range, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Binance,
                SeriesKind::Basis,
                Cadence::from(Timeframe::H1),
            ),
            data: SeriesData::Basis(points),
        })
    }

    async fn get_long_short_ratio(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![
            ("symbol", self.native(symbol)),
            ("period", "1h".to_string()),
        ];
        let rows = self
            .paginate(
                &format!("{BASE_URL}/futures/data/globalLongShortAccountRatio"),
                &params,
                range,
                STATS_PAGE,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                Ok(LongShortPoint {
                    ts: field_ts_ms(row, "timestamp")?,
                    long_ratio: field_f64(row, "longAccount")?,
                    short_ratio: field_f64(row, "shortAccount")?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);
        clip_range(&mut points, range, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Binance,
                SeriesKind::LongShortRatio,
                Cadence::from(Timeframe::H1),
            ),
            data: SeriesData::LongShort(points),
        })
    }

    async fn get_mark_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        let params = [("symbol", self.native(symbol))];
        let body = self
            .rest
            .get_json(&format!("{BASE_URL}/fapi/v1/premiumIndex"), &params, 1)
            .await?;
        field_f64(&body, "markPrice")
    }
}
