//! OKX v5 connector.
//!
//! Instruments use the `BASE-QUOTE-SWAP` form; payloads come wrapped in
//! `{code, msg, data}` with positional string arrays, newest first. The
//! trading-statistics ("rubik") endpoints key on the base currency rather
//! than the instrument, and report long/short positioning as a single ratio
//! which is normalized into two sides summing to one.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::connector::{
    field_f64, index_f64, json_f64, sort_dedup_by_ts, ts_from_ms, ExchangeConnector, RestClient,
    TimeRange,
};
use super::limiter::RateLimiter;
use crate::error::ExchangeError;
use crate::market::series::{
    Cadence, Candle, FundingPoint, LongShortPoint, OiPoint, Series, SeriesData, SeriesKind,
    SeriesMeta,
};
use crate::market::symbol::{Exchange, Symbol, SymbolMapper};
use crate::market::timeframe::Timeframe;

const BASE_URL: &str = "https://www.okx.com";
const CANDLES_PAGE: usize = 100;
const FUNDING_PAGE: usize = 100;

pub struct OkxConnector {
    rest: RestClient,
    mapper: SymbolMapper,
}

fn bar(timeframe: Timeframe) -> &'static str {
    match timeframe {
        Timeframe::M1 => "1m",
        Timeframe::M5 => "5m",
        Timeframe::M15 => "15m",
        Timeframe::H1 => "1H",
        Timeframe::H4 => "4H",
        Timeframe::D1 => "1D",
    }
}

fn row_ts(row: &Value) -> Option<i64> {
    if let Some(first) = row.get(0) {
        return json_f64(first).map(|v| v as i64);
    }
    row.get("fundingTime").and_then(json_f64).map(|v| v as i64)
}

impl OkxConnector {
    pub fn new(limiter: Arc<RateLimiter>) -> Result<Self, ExchangeError> {
        Ok(Self {
            rest: RestClient::new(Exchange::Okx, limiter)?,
            mapper: SymbolMapper::new(),
        })
    }

    fn inst_id(&self, symbol: &Symbol) -> String {
        self.mapper.to_exchange(symbol, Exchange::Okx)
    }

    /// Unwrap the `{code, msg, data}` envelope.
    async fn get_data(
        &self,
        url: &str,
        params: &[(&str, String)],
        weight: u32,
    ) -> Result<Vec<Value>, ExchangeError> {
        let body = self.rest.get_json(url, params, weight).await?;
        let code = body.get("code").and_then(Value::as_str).unwrap_or("-1");
        if code != "0" {
            let msg = body.get("msg").and_then(Value::as_str).unwrap_or("unknown");
            // 51001: instrument does not exist
            if code == "51001" || msg.contains("instId") {
                return Err(ExchangeError::SymbolNotFound(msg.to_string()));
            }
            return Err(ExchangeError::Api(format!("okx code {code}: {msg}")));
        }
        body.get("data")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| ExchangeError::Format("okx response missing data".into()))
    }

    /// Walk a newest-first endpoint backwards via the `after` cursor until
    /// the range start is reached. Without a range one page is returned.
    async fn paginate_after(
        &self,
        url: &str,
        base_params: &[(&str, String)],
        range: Option<TimeRange>,
        page_size: usize,
        weight: u32,
    ) -> Result<Vec<Value>, ExchangeError> {
        let mut rows: Vec<Value> = Vec::new();
        // `after` returns records strictly older than the cursor; seed it
        // just past the range end so the end itself is included.
        let mut cursor = range.map(|(_, end)| end.timestamp_millis() + 1);

        loop {
            let mut params: Vec<(&str, String)> = base_params.to_vec();
            params.push(("limit", page_size.to_string()));
            if let Some(after) = cursor {
                params.push(("after", after.to_string()));
            }

            let page = self.get_data(url, &params, weight).await?;
            if page.is_empty() {
                break;
            }

            tracing::debug!(url, rows = page.len(), "okx page fetched");
            let oldest = page
                .iter()
                .filter_map(row_ts)
                .min()
                .ok_or_else(|| ExchangeError::Format("page row without timestamp".into()))?;
            rows.extend(page.iter().cloned());

            if page.len() < page_size || range.is_none() {
                break;
            }
            if range.is_some_and(|(start, _)| oldest <= start.timestamp_millis()) {
                break;
            }
            if cursor.is_some_and(|c| oldest >= c) {
                break;
            }
            cursor = Some(oldest);
        }

        if let Some((start, end)) = range {
            let (start_ms, end_ms) = (start.timestamp_millis(), end.timestamp_millis());
            rows.retain(|row| {
                row_ts(row).is_some_and(|ts| ts >= start_ms && ts <= end_ms)
            });
        }
        Ok(rows)
    }
}

fn parse_candle(row: &Value) -> Result<Candle, ExchangeError> {
    let ts_ms =
        row_ts(row).ok_or_else(|| ExchangeError::Format("candle row without timestamp".into()))?;
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
impl ExchangeConnector for OkxConnector {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    async fn get_ohlcv(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![
            ("instId", self.inst_id(symbol)),
            ("bar", bar(timeframe).to_string()),
        ];
        let rows = self
            .paginate_after(
                &format!("{BASE_URL}/api/v5/market/history-candles"),
                &params,
                range,
                CANDLES_PAGE,
                1,
            )
            .await?;

        let mut candles = rows
            .iter()
            .map(parse_candle)
            .collect::<Result<Vec<_>, _>>()?;
        sort_dedup_by_ts(&mut candles, |c| c.ts);

        Ok(Series {
            meta: SeriesMeta::ohlcv(symbol.clone(), Exchange::Okx, timeframe),
            data: SeriesData::Ohlcv(candles),
        })
    }

    async fn get_funding_rate(
        &self,
        symbol: &Symbol,
        range: Option<TimeRange>,
    ) -> Result<Series, ExchangeError> {
        let params = vec![("instId", self.inst_id(symbol))];
        let rows = self
            .paginate_after(
                &format!("{BASE_URL}/api/v5/public/funding-rate-history"),
                &params,
                range,
                FUNDING_PAGE,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                let ts_ms = row
                    .get("fundingTime")
                    .and_then(json_f64)
                    .ok_or_else(|| ExchangeError::Format("funding row without time".into()))?
                    as i64;
                Ok(FundingPoint {
                    ts: ts_from_ms(ts_ms)?,
                    rate: field_f64(row, "fundingRate")?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Okx,
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
        let mut params = vec![
            ("ccy", symbol.base.clone()),
            ("period", "1H".to_string()),
        ];
        if let Some((start, end)) = range {
            params.push(("begin", start.timestamp_millis().to_string()));
            params.push(("end", end.timestamp_millis().to_string()));
        }
        let rows = self
            .get_data(
                &format!("{BASE_URL}/api/v5/rubik/stat/contracts/open-interest-volume"),
                &params,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                let ts_ms = row_ts(row)
                    .ok_or_else(|| ExchangeError::Format("oi row without timestamp".into()))?;
                Ok(OiPoint {
                    ts: ts_from_ms(ts_ms)?,
                    value: index_f64(row, 1)?,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Okx,
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
        let mut params = vec![
            ("ccy", symbol.base.clone()),
            ("period", "1H".to_string()),
        ];
        if let Some((start, end)) = range {
            params.push(("begin", start.timestamp_millis().to_string()));
            params.push(("end", end.timestamp_millis().to_string()));
        }
        let rows = self
            .get_data(
                &format!("{BASE_URL}/api/v5/rubik/stat/contracts/long-short-account-ratio"),
                &params,
                1,
            )
            .await?;

        let mut points = rows
            .iter()
            .map(|row| {
                let ts_ms = row_ts(row)
                    .ok_or_else(|| ExchangeError::Format("ratio row without timestamp".into()))?;
                let ratio = index_f64(row, 1)?;
                // A single long/short ratio r splits into sides summing to 1.
                let long_ratio = ratio / (1.0 + ratio);
                Ok(LongShortPoint {
                    ts: ts_from_ms(ts_ms)?,
                    long_ratio,
                    short_ratio: 1.0 - long_ratio,
                })
            })
            .collect::<Result<Vec<_>, ExchangeError>>()?;
        sort_dedup_by_ts(&mut points, |p| p.ts);

        Ok(Series {
            meta: SeriesMeta::perpetual(
                symbol.clone(),
                Exchange::Okx,
                SeriesKind::LongShortRatio,
                Cadence::from(Timeframe::H1),
            ),
            data: SeriesData::LongShort(points),
        })
    }

    async fn get_mark_price(&self, symbol: &Symbol) -> Result<f64, ExchangeError> {
        let params = vec![
            ("instType", "SWAP".to_string()),
            ("instId", self.inst_id(symbol)),
        ];
        let rows = self
            .get_data(&format!("{BASE_URL}/api/v5/public/mark-price"), &params, 1)
            .await?;
        let first = rows
            .first()
            .ok_or_else(|| ExchangeError::Format("empty mark price data".into()))?;
        field_f64(first, "markPx")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_mapping_uses_okx_casing() {
        assert_eq!(bar(Timeframe::M5), "5m");
        assert_eq!(bar(Timeframe::H1), "1H");
        assert_eq!(bar(Timeframe::D1), "1D");
    }

    #[test]
    fn parse_candle_positional_row() {
        let row = serde_json::json!([
            "1597026383085",
            "3.721",
            "3.743",
            "3.677",
            "3.708",
            "8422410",
            "22698348.04",
            "12698348.04",
            "1"
        ]);
        let candle = parse_candle(&row).unwrap();
        assert_eq!(candle.ts.timestamp_millis(), 1_597_026_383_085);
        assert_eq!(candle.open, 3.721);
        assert_eq!(candle.close, 3.708);
    }

    #[test]
    fn long_short_split_sums_to_one() {
        // ratio 1.5 → long 0.6, short 0.4
        let ratio = 1.5f64;
        let long = ratio / (1.0 + ratio);
        assert!((long - 0.6).abs() < 1e-12);
        assert!((long + (1.0 - long) - 1.0).abs() < 1e-12);
    }
}
