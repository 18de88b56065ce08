//! Storage-first data loading and multi-exchange aggregation.
//!
//! `load` serves a strategy's declared requirements for one symbol: probe
//! the on-disk store, fall back to the connector, run quality control, and
//! persist what was fetched. Optional requirements that the venue cannot
//! serve are omitted without error; required ones propagate.
//!
//! `aggregate` fans the same fetch out across venues with a bounded worker
//! pool, aligns everything on the union timestamp grid, flags cross-venue
//! outliers, and combines per the chosen method.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use super::connector::{ExchangeConnector, TimeRange};
use super::quality;
use super::storage::Storage;
use crate::error::{DataError, ExchangeError};
use crate::market::series::{
    BasisPoint, Cadence, Candle, FundingPoint, LiquidationPoint, LongShortPoint, OiPoint, Series,
    SeriesData, SeriesKind, SeriesMeta,
};
use crate::market::symbol::Symbol;
use crate::market::timeframe::Timeframe;
use crate::market::MarketData;
use crate::strategy::DataRequirement;

/// Default bound on concurrent cross-exchange fetches.
pub const DEFAULT_MAX_WORKERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    WeightedMean,
    Median,
    Sum,
}

pub struct DataPipeline {
    storage: Storage,
    connector: Arc<dyn ExchangeConnector>,
}

impl DataPipeline {
    pub fn new(storage: Storage, connector: Arc<dyn ExchangeConnector>) -> Self {
        Self { storage, connector }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn meta_for(&self, requirement: &DataRequirement, symbol: &Symbol, timeframe: Timeframe) -> SeriesMeta {
        let exchange = self.connector.exchange();
        match requirement.source {
            SeriesKind::Ohlcv => SeriesMeta::ohlcv(
                symbol.clone(),
                exchange,
                requirement.timeframe.unwrap_or(timeframe),
            ),
            SeriesKind::FundingRate => SeriesMeta::perpetual(
                symbol.clone(),
                exchange,
                SeriesKind::FundingRate,
                Cadence::FUNDING_8H,
            ),
            kind => SeriesMeta::perpetual(
                symbol.clone(),
                exchange,
                kind,
                Cadence::from(Timeframe::H1),
            ),
        }
    }

    /// Load every declared requirement for one `(symbol, timeframe, range)`.
    pub async fn load(
        &self,
        requirements: &[DataRequirement],
        symbol: &Symbol,
        timeframe: Timeframe,
        range: Option<TimeRange>,
    ) -> Result<MarketData, DataError> {
        let mut out = MarketData::new();

        for requirement in requirements {
            let meta = self.meta_for(requirement, symbol, timeframe);

            if let Some(series) = self.storage.load(&meta, range)? {
                if covers(&series, range) {
                    tracing::debug!(kind = %meta.kind, %symbol, "served from storage");
                    out.insert(series);
                    continue;
                }
            }

            match self
                .connector
                .fetch_series(requirement.source, symbol, Some(timeframe), range)
                .await
            {
                Ok(series) => {
                    let report = quality::validate(&series);
                    for finding in report.warnings() {
                        tracing::warn!(
                            kind = %meta.kind,
                            %symbol,
                            rule = %finding.rule,
                            "{}",
                            finding.message
                        );
                    }
                    if report.passed() {
                        self.storage.save(&series)?;
                        out.insert(series);
                    } else if requirement.required {
                        return Err(DataError::Quality {
                            symbol: symbol.to_string(),
                            kind: requirement.source,
                            detail: report.summary(),
                        });
                    } else {
                        tracing::warn!(
                            kind = %meta.kind,
                            %symbol,
                            "optional series failed quality control, omitted: {}",
                            report.summary()
                        );
                    }
                }
                Err(
                    err @ (ExchangeError::SymbolNotFound(_) | ExchangeError::NotSupported { .. }),
                ) if !requirement.required => {
                    tracing::info!(kind = %meta.kind, %symbol, "optional series unavailable: {err}");
                }
                Err(err) => {
                    if requirement.required {
                        return Err(err.into());
                    }
                    tracing::warn!(kind = %meta.kind, %symbol, "optional series fetch failed: {err}");
                }
            }
        }

        for requirement in requirements.iter().filter(|r| r.required) {
            if !out.contains(requirement.source) {
                return Err(DataError::Missing {
                    symbol: symbol.to_string(),
                    kind: requirement.source,
                });
            }
        }

        Ok(out)
    }
}

/// Whether a cached series already satisfies the requested range, allowing
/// one cadence of slack at each edge.
fn covers(series: &Series, range: Option<TimeRange>) -> bool {
    if series.is_empty() {
        return false;
    }
    let Some((start, end)) = range else {
        return true;
    };
    let slack = series.meta.cadence.millis();
    let (Some(first), Some(last)) = (series.start(), series.end()) else {
        return false;
    };
    first.timestamp_millis() <= start.timestamp_millis() + slack
        && last.timestamp_millis() >= end.timestamp_millis() - slack
}

/// Fetch the same series from several venues in parallel (bounded by
/// `max_workers`), align on the union timestamp grid, and combine.
pub async fn aggregate(
    connectors: &[Arc<dyn ExchangeConnector>],
    kind: SeriesKind,
    symbol: &Symbol,
    timeframe: Option<Timeframe>,
    range: Option<TimeRange>,
    method: AggregationMethod,
    max_workers: usize,
) -> Result<Series, DataError> {
    if connectors.is_empty() {
        return Err(DataError::Missing {
            symbol: symbol.to_string(),
            kind,
        });
    }

    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut tasks = Vec::new();
    for connector in connectors {
        let connector = Arc::clone(connector);
        let semaphore = Arc::clone(&semaphore);
        let symbol = symbol.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore open");
            let exchange = connector.exchange();
            let result = connector.fetch_series(kind, &symbol, timeframe, range).await;
            (exchange, result)
        }));
    }

    let mut fetched = Vec::new();
    for task in tasks {
        let (exchange, result) = task.await.map_err(|e| {
            DataError::Exchange(ExchangeError::Api(format!("aggregation task failed: {e}")))
        })?;
        match result {
            Ok(series) if !series.is_empty() => fetched.push(series),
            Ok(_) => tracing::info!(%exchange, %kind, "no rows from venue"),
            Err(err) => tracing::warn!(%exchange, %kind, "venue fetch failed: {err}"),
        }
    }
    if fetched.is_empty() {
        return Err(DataError::Missing {
            symbol: symbol.to_string(),
            kind,
        });
    }

    Ok(combine(&fetched, method))
}

/// Per-timestamp values from one venue: the measured fields plus an
/// optional weight (traded volume where the series has one).
type Row = (Vec<f64>, Option<f64>);

fn fields_of(data: &SeriesData, i: usize) -> Row {
    match data {
        SeriesData::Ohlcv(v) => {
            let c = &v[i];
            (vec![c.open, c.high, c.low, c.close, c.volume], Some(c.volume))
        }
        SeriesData::Funding(v) => (vec![v[i].rate], None),
        SeriesData::OpenInterest(v) => (vec![v[i].value], None),
        SeriesData::Basis(v) => (vec![v[i].value], None),
        SeriesData::Liquidations(v) => (vec![v[i].buy_volume, v[i].sell_volume], None),
        SeriesData::LongShort(v) => (vec![v[i].long_ratio, v[i].short_ratio], None),
    }
}

fn combine(series_list: &[Series], method: AggregationMethod) -> Series {
    let kind = series_list[0].kind();

    // Outer join on the timestamp grid: ts → per-venue rows.
    let mut grid: BTreeMap<i64, Vec<Row>> = BTreeMap::new();
    for series in series_list {
        for i in 0..series.len() {
            let ts = series
                .data
                .timestamp_at(i)
                .map_or(0, |t| t.timestamp_millis());
            grid.entry(ts).or_default().push(fields_of(&series.data, i));
        }
    }

    let mut outliers = 0usize;
    let mut combined_rows: Vec<(i64, Vec<f64>)> = Vec::with_capacity(grid.len());
    for (ts, rows) in &grid {
        let field_count = rows[0].0.len();
        let mut values = Vec::with_capacity(field_count);
        for field in 0..field_count {
            let column: Vec<f64> = rows.iter().map(|(fields, _)| fields[field]).collect();

            // Cross-venue z-score flagging; outliers are logged, not dropped.
            if column.len() >= 3 {
                let mean = crate::engine::metrics::mean(&column);
                let std = crate::engine::metrics::std_dev(&column);
                if std.is_finite() && std > 0.0 {
                    outliers += column.iter().filter(|v| ((**v - mean) / std).abs() > 3.0).count();
                }
            }

            let weights: Vec<f64> = rows
                .iter()
                .map(|(_, w)| w.filter(|w| *w > 0.0).unwrap_or(1.0))
                .collect();
            values.push(combine_column(&column, &weights, method));
        }
        combined_rows.push((*ts, values));
    }
    if outliers > 0 {
        tracing::warn!(count = outliers, %kind, "cross-exchange outliers included in aggregate");
    }

    let meta = series_list[0].meta.clone();
    let data = rebuild(kind, &combined_rows);
    Series { meta, data }
}

fn combine_column(values: &[f64], weights: &[f64], method: AggregationMethod) -> f64 {
    match method {
        AggregationMethod::Sum => values.iter().sum(),
        AggregationMethod::Median => {
            let mut sorted = values.to_vec();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 1 {
                sorted[mid]
            } else {
                f64::midpoint(sorted[mid - 1], sorted[mid])
            }
        }
        AggregationMethod::WeightedMean => {
            let total: f64 = weights.iter().sum();
            if total > 0.0 {
                values
                    .iter()
                    .zip(weights.iter())
                    .map(|(v, w)| v * w)
                    .sum::<f64>()
                    / total
            } else {
                crate::engine::metrics::mean(values)
            }
        }
    }
}

fn rebuild(kind: SeriesKind, rows: &[(i64, Vec<f64>)]) -> SeriesData {
    let ts = |ms: i64| {
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or(chrono::DateTime::UNIX_EPOCH)
    };
    match kind {
        SeriesKind::Ohlcv => SeriesData::Ohlcv(
            rows.iter()
                .map(|(ms, f)| Candle {
                    ts: ts(*ms),
                    open: f[0],
                    high: f[1],
                    low: f[2],
                    close: f[3],
                    volume: f[4],
                })
                .collect(),
        ),
        SeriesKind::FundingRate => SeriesData::Funding(
            rows.iter()
                .map(|(ms, f)| FundingPoint {
                    ts: ts(*ms),
                    rate: f[0],
                })
                .collect(),
        ),
        SeriesKind::OpenInterest => SeriesData::OpenInterest(
            rows.iter()
                .map(|(ms, f)| OiPoint {
                    ts: ts(*ms),
                    value: f[0],
                })
                .collect(),
        ),
        SeriesKind::Basis => SeriesData::Basis(
            rows.iter()
                .map(|(ms, f)| BasisPoint {
                    ts: ts(*ms),
                    value: f[0],
                })
                .collect(),
        ),
        SeriesKind::Liquidations => SeriesData::Liquidations(
            rows.iter()
                .map(|(ms, f)| LiquidationPoint {
                    ts: ts(*ms),
                    buy_volume: f[0],
                    sell_volume: f[1],
                })
                .collect(),
        ),
        SeriesKind::LongShortRatio => SeriesData::LongShort(
            rows.iter()
                .map(|(ms, f)| LongShortPoint {
                    ts: ts(*ms),
                    long_ratio: f[0],
                    short_ratio: f[1],
                })
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::symbol::Exchange;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn candles(n: usize, base: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                ts: start_ts() + Duration::hours(i as i64),
                open: base + i as f64,
                high: base + i as f64 + 1.0,
                low: base + i as f64 - 1.0,
                close: base + i as f64 + 0.5,
                volume: 1_000.0,
            })
            .collect()
    }

    /// Connector stub serving canned data and counting fetches.
    struct MockConnector {
        exchange: Exchange,
        ohlcv: Vec<Candle>,
        funding: Option<Vec<FundingPoint>>,
        fetches: AtomicUsize,
    }

    impl MockConnector {
        fn new(exchange: Exchange, ohlcv: Vec<Candle>) -> Self {
            Self {
                exchange,
                ohlcv,
                funding: None,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExchangeConnector for MockConnector {
        fn exchange(&self) -> Exchange {
            self.exchange
        }

        async fn get_ohlcv(
            &self,
            symbol: &Symbol,
            timeframe: Timeframe,
            _range: Option<TimeRange>,
        ) -> Result<Series, ExchangeError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Series {
                meta: SeriesMeta::ohlcv(symbol.clone(), self.exchange, timeframe),
                data: SeriesData::Ohlcv(self.ohlcv.clone()),
            })
        }

        async fn get_funding_rate(
            &self,
            symbol: &Symbol,
            _range: Option<TimeRange>,
        ) -> Result<Series, ExchangeError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match &self.funding {
                Some(points) => Ok(Series {
                    meta: SeriesMeta::perpetual(
                        symbol.clone(),
                        self.exchange,
                        SeriesKind::FundingRate,
                        Cadence::FUNDING_8H,
                    ),
                    data: SeriesData::Funding(points.clone()),
                }),
                None => Err(ExchangeError::NotSupported {
                    exchange: self.exchange.as_str(),
                    capability: "funding",
                }),
            }
        }

        async fn get_open_interest(
            &self,
            _symbol: &Symbol,
            _range: Option<TimeRange>,
        ) -> Result<Series, ExchangeError> {
            Err(ExchangeError::NotSupported {
                exchange: self.exchange.as_str(),
                capability: "open interest",
            })
        }

        async fn get_long_short_ratio(
            &self,
            _symbol: &Symbol,
            _range: Option<TimeRange>,
        ) -> Result<Series, ExchangeError> {
            Err(ExchangeError::NotSupported {
                exchange: self.exchange.as_str(),
                capability: "long/short ratio",
            })
        }

        async fn get_mark_price(&self, _symbol: &Symbol) -> Result<f64, ExchangeError> {
            Ok(100.0)
        }
    }

    #[tokio::test]
    async fn load_fetches_then_serves_from_storage() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::new(Exchange::Binance, candles(48, 100.0)));
        let pipeline = DataPipeline::new(Storage::new(dir.path()), connector.clone());
        let symbol = Symbol::new("BTC", "USDT");
        let requirements = [DataRequirement::ohlcv(48)];

        let first = pipeline
            .load(&requirements, &symbol, Timeframe::H1, None)
            .await
            .unwrap();
        assert_eq!(first.candles().len(), 48);
        assert_eq!(connector.fetches.load(Ordering::SeqCst), 1);

        // Second load is storage-first: no further connector traffic.
        let second = pipeline
            .load(&requirements, &symbol, Timeframe::H1, None)
            .await
            .unwrap();
        assert_eq!(second.candles().len(), 48);
        assert_eq!(connector.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn optional_unsupported_series_is_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::new(Exchange::Bybit, candles(24, 100.0)));
        let pipeline = DataPipeline::new(Storage::new(dir.path()), connector);
        let symbol = Symbol::new("BTC", "USDT");
        let requirements = [
            DataRequirement::ohlcv(24),
            DataRequirement::perpetual(SeriesKind::FundingRate, 30, false),
        ];

        let data = pipeline
            .load(&requirements, &symbol, Timeframe::H1, None)
            .await
            .unwrap();
        assert!(data.contains(SeriesKind::Ohlcv));
        assert!(!data.contains(SeriesKind::FundingRate));
    }

    #[tokio::test]
    async fn required_unsupported_series_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MockConnector::new(Exchange::Bybit, candles(24, 100.0)));
        let pipeline = DataPipeline::new(Storage::new(dir.path()), connector);
        let symbol = Symbol::new("BTC", "USDT");
        let requirements = [
            DataRequirement::ohlcv(24),
            DataRequirement::perpetual(SeriesKind::FundingRate, 30, true),
        ];

        let result = pipeline
            .load(&requirements, &symbol, Timeframe::H1, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn required_bad_quality_propagates() {
        let dir = tempfile::tempdir().unwrap();
        // One candle violates the OHLC invariant — critical finding.
        let mut bad = candles(24, 100.0);
        bad[3].high = bad[3].close - 5.0;
        let connector = Arc::new(MockConnector::new(Exchange::Binance, bad));
        let pipeline = DataPipeline::new(Storage::new(dir.path()), connector);
        let symbol = Symbol::new("BTC", "USDT");

        let result = pipeline
            .load(&[DataRequirement::ohlcv(24)], &symbol, Timeframe::H1, None)
            .await;
        assert!(matches!(result, Err(DataError::Quality { .. })));
    }

    #[tokio::test]
    async fn aggregate_median_across_three_venues() {
        let symbol = Symbol::new("BTC", "USDT");
        let venues: Vec<Arc<dyn ExchangeConnector>> = vec![
            Arc::new(MockConnector::new(Exchange::Binance, candles(5, 100.0))),
            Arc::new(MockConnector::new(Exchange::Bybit, candles(5, 101.0))),
            Arc::new(MockConnector::new(Exchange::Okx, candles(5, 150.0))),
        ];

        let combined = aggregate(
            &venues,
            SeriesKind::Ohlcv,
            &symbol,
            Some(Timeframe::H1),
            None,
            AggregationMethod::Median,
            DEFAULT_MAX_WORKERS,
        )
        .await
        .unwrap();

        let candles = combined.candles().unwrap();
        assert_eq!(candles.len(), 5);
        // Median of opens {100, 101, 150} at bar 0 is 101.
        assert_eq!(candles[0].open, 101.0);
    }

    #[tokio::test]
    async fn aggregate_weighted_mean_equal_volumes_is_plain_mean() {
        let symbol = Symbol::new("ETH", "USDT");
        let venues: Vec<Arc<dyn ExchangeConnector>> = vec![
            Arc::new(MockConnector::new(Exchange::Binance, candles(3, 100.0))),
            Arc::new(MockConnector::new(Exchange::Okx, candles(3, 104.0))),
        ];
        let combined = aggregate(
            &venues,
            SeriesKind::Ohlcv,
            &symbol,
            Some(Timeframe::H1),
            None,
            AggregationMethod::WeightedMean,
            2,
        )
        .await
        .unwrap();
        let candles = combined.candles().unwrap();
        assert_eq!(candles[0].open, 102.0);
    }

    #[tokio::test]
    async fn aggregate_outer_joins_missing_timestamps() {
        let symbol = Symbol::new("BTC", "USDT");
        let venues: Vec<Arc<dyn ExchangeConnector>> = vec![
            Arc::new(MockConnector::new(Exchange::Binance, candles(5, 100.0))),
            Arc::new(MockConnector::new(Exchange::Bybit, candles(3, 100.0))),
        ];
        let combined = aggregate(
            &venues,
            SeriesKind::Ohlcv,
            &symbol,
            Some(Timeframe::H1),
            None,
            AggregationMethod::WeightedMean,
            2,
        )
        .await
        .unwrap();
        // Union grid keeps the two trailing bars only Binance has.
        assert_eq!(combined.len(), 5);
    }

    #[tokio::test]
    async fn aggregate_with_all_failures_errors() {
        struct Failing;
        #[async_trait]
        impl ExchangeConnector for Failing {
            fn exchange(&self) -> Exchange {
                Exchange::Okx
            }
            async fn get_ohlcv(
                &self,
                _: &Symbol,
                _: Timeframe,
                _: Option<TimeRange>,
            ) -> Result<Series, ExchangeError> {
                Err(ExchangeError::Api("boom".into()))
            }
            async fn get_funding_rate(
                &self,
                _: &Symbol,
                _: Option<TimeRange>,
            ) -> Result<Series, ExchangeError> {
                Err(ExchangeError::Api("boom".into()))
            }
            async fn get_open_interest(
                &self,
                _: &Symbol,
                _: Option<TimeRange>,
            ) -> Result<Series, ExchangeError> {
                Err(ExchangeError::Api("boom".into()))
            }
            async fn get_long_short_ratio(
                &self,
                _: &Symbol,
                _: Option<TimeRange>,
            ) -> Result<Series, ExchangeError> {
                Err(ExchangeError::Api("boom".into()))
            }
            async fn get_mark_price(&self, _: &Symbol) -> Result<f64, ExchangeError> {
                Err(ExchangeError::Api("boom".into()))
            }
        }

        let venues: Vec<Arc<dyn ExchangeConnector>> = vec![Arc::new(Failing)];
        let result = aggregate(
            &venues,
            SeriesKind::Ohlcv,
            &Symbol::new("BTC", "USDT"),
            Some(Timeframe::H1),
            None,
            AggregationMethod::Sum,
            1,
        )
        .await;
        assert!(matches!(result, Err(DataError::Missing { .. })));
    }
}
