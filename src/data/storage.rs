//! Content-addressed on-disk series cache.
//!
//! Layout:
//! - OHLCV: `<root>/<exchange>/<BASE-QUOTE>/<timeframe>.parquet`
//! - perpetual series:
//!   `<root>/perpetual/<kind>/<exchange>/<BASE-QUOTE>_<cadence>.parquet`
//! - legacy flat CSV (read-only): `<root>/<BASEQUOTE>_<timeframe>.csv`
//!
//! Writes go through a temp file and an atomic rename, so concurrent
//! readers never observe a torn file and last-writer-wins is safe for a
//! given fingerprint. Timestamps persist as epoch-millisecond Int64
//! columns, which keeps round trips bit-identical.

use std::path::{Path, PathBuf};

use chrono::DateTime;
use polars::prelude::*;

use super::connector::TimeRange;
use crate::error::DataError;
use crate::market::series::{
    BasisPoint, Candle, FundingPoint, LiquidationPoint, LongShortPoint, OiPoint, Series,
    SeriesData, SeriesKind, SeriesMeta,
};

/// Files smaller than this cannot hold a valid parquet footer.
const MIN_FILE_BYTES: u64 = 128;

#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root from `DATA_DIR`, defaulting to `~/.perpquant/data`.
    pub fn from_env() -> Self {
        let root = std::env::var("DATA_DIR").map_or_else(
            |_| {
                let home = std::env::var("HOME").map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from);
                home.join(".perpquant").join("data")
            },
            PathBuf::from,
        );
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn symbol_dir(meta: &SeriesMeta) -> String {
        format!("{}-{}", meta.symbol.base, meta.symbol.quote)
    }

    /// Canonical nested path for a series fingerprint.
    pub fn path_for(&self, meta: &SeriesMeta) -> PathBuf {
        match meta.kind {
            SeriesKind::Ohlcv => {
                let timeframe = meta
                    .timeframe
                    .map_or_else(|| meta.cadence.to_string(), |tf| tf.to_string());
                self.root
                    .join(meta.exchange.as_str())
                    .join(Self::symbol_dir(meta))
                    .join(format!("{timeframe}.parquet"))
            }
            kind => self
                .root
                .join("perpetual")
                .join(kind.as_str())
                .join(meta.exchange.as_str())
                .join(format!("{}_{}.parquet", Self::symbol_dir(meta), meta.cadence)),
        }
    }

    /// Legacy flat layout kept for reading old caches.
    fn legacy_path(&self, meta: &SeriesMeta) -> Option<PathBuf> {
        if meta.kind != SeriesKind::Ohlcv {
            return None;
        }
        let timeframe = meta.timeframe?;
        Some(self.root.join(format!(
            "{}{}_{}.csv",
            meta.symbol.base, meta.symbol.quote, timeframe
        )))
    }

    /// Persist a series at its fingerprint path (write-temp-then-rename).
    pub fn save(&self, series: &Series) -> Result<PathBuf, DataError> {
        let path = self.path_for(&series.meta);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut df = to_frame(&series.data)?;
        let tmp_path = path.with_extension("parquet.tmp");
        let file = std::fs::File::create(&tmp_path)?;
        ParquetWriter::new(file).finish(&mut df)?;
        std::fs::rename(&tmp_path, &path)?;

        tracing::debug!(path = %path.display(), rows = series.len(), "series saved");
        Ok(path)
    }

    /// Load the series at this fingerprint, clipped to `range` when given.
    /// Returns `Ok(None)` when nothing is cached.
    pub fn load(
        &self,
        meta: &SeriesMeta,
        range: Option<TimeRange>,
    ) -> Result<Option<Series>, DataError> {
        let path = self.path_for(meta);
        let df = if path.exists() {
            let path_str = path.to_string_lossy().to_string();
            LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())?
                .collect()?
        } else if let Some(legacy) = self.legacy_path(meta).filter(|p| p.exists()) {
            CsvReadOptions::default()
                .with_has_header(true)
                .try_into_reader_with_file_path(Some(legacy.clone()))?
                .finish()?
        } else {
            return Ok(None);
        };

        let mut data = from_frame(meta.kind, &df)?;
        if let Some((start, end)) = range {
            clip(&mut data, start.timestamp_millis(), end.timestamp_millis());
        }
        Ok(Some(Series {
            meta: meta.clone(),
            data,
        }))
    }

    /// Cheap completeness probe: file present and plausibly sized, with an
    /// optional record-count match against the parquet footer.
    pub fn has_complete(&self, meta: &SeriesMeta, expected_rows: Option<usize>) -> bool {
        let path = self.path_for(meta);
        let Ok(file_meta) = std::fs::metadata(&path) else {
            return false;
        };
        if file_meta.len() < MIN_FILE_BYTES {
            return false;
        }
        match expected_rows {
            None => true,
            Some(expected) => {
                let path_str = path.to_string_lossy().to_string();
                let count =
                    LazyFrame::scan_parquet(path_str.as_str().into(), ScanArgsParquet::default())
                        .and_then(|lf| lf.select([len().alias("n")]).collect())
                        .ok()
                        .and_then(|df| {
                            df.column("n").ok().and_then(|c| {
                                c.u32().ok().and_then(|ca| ca.get(0)).map(|n| n as usize)
                            })
                        });
                count == Some(expected)
            }
        }
    }
}

fn to_frame(data: &SeriesData) -> Result<DataFrame, DataError> {
    let df = match data {
        SeriesData::Ohlcv(rows) => {
            let ts: Vec<i64> = rows.iter().map(|r| r.ts.timestamp_millis()).collect();
            df! {
                "ts" => &ts,
                "open" => rows.iter().map(|r| r.open).collect::<Vec<_>>(),
                "high" => rows.iter().map(|r| r.high).collect::<Vec<_>>(),
                "low" => rows.iter().map(|r| r.low).collect::<Vec<_>>(),
                "close" => rows.iter().map(|r| r.close).collect::<Vec<_>>(),
                "volume" => rows.iter().map(|r| r.volume).collect::<Vec<_>>(),
            }?
        }
        SeriesData::Funding(rows) => {
            let ts: Vec<i64> = rows.iter().map(|r| r.ts.timestamp_millis()).collect();
            df! {
                "ts" => &ts,
                "rate" => rows.iter().map(|r| r.rate).collect::<Vec<_>>(),
            }?
        }
        SeriesData::OpenInterest(rows) => {
            let ts: Vec<i64> = rows.iter().map(|r| r.ts.timestamp_millis()).collect();
            df! {
                "ts" => &ts,
                "value" => rows.iter().map(|r| r.value).collect::<Vec<_>>(),
            }?
        }
        SeriesData::Basis(rows) => {
            let ts: Vec<i64> = rows.iter().map(|r| r.ts.timestamp_millis()).collect();
            df! {
                "ts" => &ts,
                "value" => rows.iter().map(|r| r.value).collect::<Vec<_>>(),
            }?
        }
        SeriesData::Liquidations(rows) => {
            let ts: Vec<i64> = rows.iter().map(|r| r.ts.timestamp_millis()).collect();
            df! {
                "ts" => &ts,
                "buy_volume" => rows.iter().map(|r| r.buy_volume).collect::<Vec<_>>(),
                "sell_volume" => rows.iter().map(|r| r.sell_volume).collect::<Vec<_>>(),
            }?
        }
        SeriesData::LongShort(rows) => {
            let ts: Vec<i64> = rows.iter().map(|r| r.ts.timestamp_millis()).collect();
            df! {
                "ts" => &ts,
                "long_ratio" => rows.iter().map(|r| r.long_ratio).collect::<Vec<_>>(),
                "short_ratio" => rows.iter().map(|r| r.short_ratio).collect::<Vec<_>>(),
            }?
        }
    };
    Ok(df)
}

fn col_f64(df: &DataFrame, name: &str) -> Result<Vec<f64>, DataError> {
    let column = df.column(name)?;
    // Legacy CSVs may carry integer-typed columns.
    let casted = column.cast(&DataType::Float64)?;
    Ok(casted.f64()?.into_iter().map(Option::unwrap_or_default).collect())
}

fn col_ts(df: &DataFrame, name: &str) -> Result<Vec<i64>, DataError> {
    let column = df.column(name)?;
    let casted = column.cast(&DataType::Int64)?;
    Ok(casted.i64()?.into_iter().map(Option::unwrap_or_default).collect())
}

fn from_frame(kind: SeriesKind, df: &DataFrame) -> Result<SeriesData, DataError> {
    let ts_col_name = if df.schema().contains("ts") { "ts" } else { "timestamp" };
    let ts = col_ts(df, ts_col_name)?;
    let to_dt = |ms: i64| DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH);

    let data = match kind {
        SeriesKind::Ohlcv => {
            let open = col_f64(df, "open")?;
            let high = col_f64(df, "high")?;
            let low = col_f64(df, "low")?;
            let close = col_f64(df, "close")?;
            let volume = col_f64(df, "volume")?;
            SeriesData::Ohlcv(
                (0..ts.len())
                    .map(|i| Candle {
                        ts: to_dt(ts[i]),
                        open: open[i],
                        high: high[i],
                        low: low[i],
                        close: close[i],
                        volume: volume[i],
                    })
                    .collect(),
            )
        }
        SeriesKind::FundingRate => {
            let rate = col_f64(df, "rate")?;
            SeriesData::Funding(
                (0..ts.len())
                    .map(|i| FundingPoint {
                        ts: to_dt(ts[i]),
                        rate: rate[i],
                    })
                    .collect(),
            )
        }
        SeriesKind::OpenInterest => {
            let value = col_f64(df, "value")?;
            SeriesData::OpenInterest(
                (0..ts.len())
                    .map(|i| OiPoint {
                        ts: to_dt(ts[i]),
                        value: value[i],
                    })
                    .collect(),
            )
        }
        SeriesKind::Basis => {
            let value = col_f64(df, "value")?;
            SeriesData::Basis(
                (0..ts.len())
                    .map(|i| BasisPoint {
                        ts: to_dt(ts[i]),
                        value: value[i],
                    })
                    .collect(),
            )
        }
        SeriesKind::Liquidations => {
            let buy = col_f64(df, "buy_volume")?;
            let sell = col_f64(df, "sell_volume")?;
            SeriesData::Liquidations(
                (0..ts.len())
                    .map(|i| LiquidationPoint {
                        ts: to_dt(ts[i]),
                        buy_volume: buy[i],
                        sell_volume: sell[i],
                    })
                    .collect(),
            )
        }
        SeriesKind::LongShortRatio => {
            let long = col_f64(df, "long_ratio")?;
            let short = col_f64(df, "short_ratio")?;
            SeriesData::LongShort(
                (0..ts.len())
                    .map(|i| LongShortPoint {
                        ts: to_dt(ts[i]),
                        long_ratio: long[i],
                        short_ratio: short[i],
                    })
                    .collect(),
            )
        }
    };
    Ok(data)
}

fn clip(data: &mut SeriesData, start_ms: i64, end_ms: i64) {
    let keep = |ts: chrono::DateTime<chrono::Utc>| {
        let ms = ts.timestamp_millis();
        ms >= start_ms && ms <= end_ms
    };
    match data {
        SeriesData::Ohlcv(v) => v.retain(|r| keep(r.ts)),
        SeriesData::Funding(v) => v.retain(|r| keep(r.ts)),
        SeriesData::OpenInterest(v) => v.retain(|r| keep(r.ts)),
        SeriesData::Basis(v) => v.retain(|r| keep(r.ts)),
        SeriesData::Liquidations(v) => v.retain(|r| keep(r.ts)),
        SeriesData::LongShort(v) => v.retain(|r| keep(r.ts)),
    }
}
