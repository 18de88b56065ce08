//! Typed time-indexed series: OHLCV candles plus the perpetual-specific
//! series (funding, open interest, basis, liquidations, long/short ratio).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::market::symbol::{Exchange, Symbol};
use crate::market::timeframe::Timeframe;

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Signed funding rate, 8-hour cadence on most venues.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FundingPoint {
    pub ts: DateTime<Utc>,
    pub rate: f64,
}

/// Outstanding contracts, in contract or quote units as the venue reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OiPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Perp minus spot, signed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BasisPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Forced-closure volumes per side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiquidationPoint {
    pub ts: DateTime<Utc>,
    pub buy_volume: f64,
    pub sell_volume: f64,
}

/// Long vs. short account ratios; both sides non-negative, sum positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LongShortPoint {
    pub ts: DateTime<Utc>,
    pub long_ratio: f64,
    pub short_ratio: f64,
}

/// Discriminant for the six supported series families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesKind {
    Ohlcv,
    FundingRate,
    OpenInterest,
    Basis,
    Liquidations,
    LongShortRatio,
}

impl SeriesKind {
    pub const ALL: [SeriesKind; 6] = [
        SeriesKind::Ohlcv,
        SeriesKind::FundingRate,
        SeriesKind::OpenInterest,
        SeriesKind::Basis,
        SeriesKind::Liquidations,
        SeriesKind::LongShortRatio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SeriesKind::Ohlcv => "ohlcv",
            SeriesKind::FundingRate => "funding_rate",
            SeriesKind::OpenInterest => "open_interest",
            SeriesKind::Basis => "basis",
            SeriesKind::Liquidations => "liquidations",
            SeriesKind::LongShortRatio => "long_short_ratio",
        }
    }
}

impl fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeriesKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SeriesKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown series kind: {s}")))
    }
}

/// Native sampling interval of a series, in milliseconds.
///
/// OHLCV cadence comes from its [`Timeframe`]; perpetual series carry the
/// venue's native cadence (funding is 8h almost everywhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cadence(i64);

impl Cadence {
    pub const FUNDING_8H: Cadence = Cadence(8 * 3_600_000);

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn millis(self) -> i64 {
        self.0
    }
}

impl From<Timeframe> for Cadence {
    fn from(tf: Timeframe) -> Self {
        Cadence(tf.millis())
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0;
        if ms % 86_400_000 == 0 {
            write!(f, "{}d", ms / 86_400_000)
        } else if ms % 3_600_000 == 0 {
            write!(f, "{}h", ms / 3_600_000)
        } else if ms % 60_000 == 0 {
            write!(f, "{}m", ms / 60_000)
        } else {
            write!(f, "{ms}ms")
        }
    }
}

/// Identity of a series: what it measures, where it came from, how often.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub symbol: Symbol,
    pub exchange: Exchange,
    pub kind: SeriesKind,
    pub cadence: Cadence,
    /// Present for OHLCV; perpetual series only have a native cadence.
    pub timeframe: Option<Timeframe>,
}

impl SeriesMeta {
    pub fn ohlcv(symbol: Symbol, exchange: Exchange, timeframe: Timeframe) -> Self {
        Self {
            symbol,
            exchange,
            kind: SeriesKind::Ohlcv,
            cadence: timeframe.into(),
            timeframe: Some(timeframe),
        }
    }

    pub fn perpetual(symbol: Symbol, exchange: Exchange, kind: SeriesKind, cadence: Cadence) -> Self {
        Self {
            symbol,
            exchange,
            kind,
            cadence,
            timeframe: None,
        }
    }
}

/// Payload of a series, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SeriesData {
    Ohlcv(Vec<Candle>),
    Funding(Vec<FundingPoint>),
    OpenInterest(Vec<OiPoint>),
    Basis(Vec<BasisPoint>),
    Liquidations(Vec<LiquidationPoint>),
    LongShort(Vec<LongShortPoint>),
}

impl SeriesData {
    pub fn kind(&self) -> SeriesKind {
        match self {
            SeriesData::Ohlcv(_) => SeriesKind::Ohlcv,
            SeriesData::Funding(_) => SeriesKind::FundingRate,
            SeriesData::OpenInterest(_) => SeriesKind::OpenInterest,
            SeriesData::Basis(_) => SeriesKind::Basis,
            SeriesData::Liquidations(_) => SeriesKind::Liquidations,
            SeriesData::LongShort(_) => SeriesKind::LongShortRatio,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SeriesData::Ohlcv(v) => v.len(),
            SeriesData::Funding(v) => v.len(),
            SeriesData::OpenInterest(v) => v.len(),
            SeriesData::Basis(v) => v.len(),
            SeriesData::Liquidations(v) => v.len(),
            SeriesData::LongShort(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timestamp_at(&self, i: usize) -> Option<DateTime<Utc>> {
        match self {
            SeriesData::Ohlcv(v) => v.get(i).map(|p| p.ts),
            SeriesData::Funding(v) => v.get(i).map(|p| p.ts),
            SeriesData::OpenInterest(v) => v.get(i).map(|p| p.ts),
            SeriesData::Basis(v) => v.get(i).map(|p| p.ts),
            SeriesData::Liquidations(v) => v.get(i).map(|p| p.ts),
            SeriesData::LongShort(v) => v.get(i).map(|p| p.ts),
        }
    }
}

/// A typed series plus its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub meta: SeriesMeta,
    pub data: SeriesData,
}

impl Series {
    pub fn kind(&self) -> SeriesKind {
        self.meta.kind
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.data.timestamp_at(0)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        match self.data.len() {
            0 => None,
            n => self.data.timestamp_at(n - 1),
        }
    }

    pub fn candles(&self) -> Option<&[Candle]> {
        match &self.data {
            SeriesData::Ohlcv(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(ts_hour: u32, close: f64) -> Candle {
        Candle {
            ts: Utc.with_ymd_and_hms(2024, 1, 1, ts_hour, 0, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        }
    }

    #[test]
    fn series_range_from_data() {
        let series = Series {
            meta: SeriesMeta::ohlcv(
                Symbol::new("BTC", "USDT"),
                Exchange::Binance,
                Timeframe::H1,
            ),
            data: SeriesData::Ohlcv(vec![candle(0, 100.0), candle(1, 101.0), candle(2, 102.0)]),
        };
        assert_eq!(series.len(), 3);
        assert_eq!(
            series.start().unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            series.end().unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap()
        );
    }

    #[test]
    fn empty_series_has_no_range() {
        let series = Series {
            meta: SeriesMeta::perpetual(
                Symbol::new("BTC", "USDT"),
                Exchange::Binance,
                SeriesKind::FundingRate,
                Cadence::FUNDING_8H,
            ),
            data: SeriesData::Funding(vec![]),
        };
        assert!(series.is_empty());
        assert!(series.start().is_none());
        assert!(series.end().is_none());
    }

    #[test]
    fn cadence_display_units() {
        assert_eq!(Cadence::FUNDING_8H.to_string(), "8h");
        assert_eq!(Cadence::from(Timeframe::M5).to_string(), "5m");
        assert_eq!(Cadence::from(Timeframe::D1).to_string(), "1d");
        assert_eq!(Cadence::from_millis(1500).to_string(), "1500ms");
    }

    #[test]
    fn series_kind_string_round_trip() {
        for kind in SeriesKind::ALL {
            assert_eq!(kind.as_str().parse::<SeriesKind>().unwrap(), kind);
        }
    }

    #[test]
    fn data_kind_matches_variant() {
        let data = SeriesData::Liquidations(vec![]);
        assert_eq!(data.kind(), SeriesKind::Liquidations);
    }
}
