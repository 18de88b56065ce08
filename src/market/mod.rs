pub mod series;
pub mod symbol;
pub mod timeframe;

use std::collections::HashMap;

use crate::market::series::{
    BasisPoint, Candle, FundingPoint, LiquidationPoint, LongShortPoint, OiPoint, Series,
    SeriesData, SeriesKind,
};

/// All series loaded for one backtest run, keyed by kind.
///
/// Built by the data pipeline and handed to the engine read-only. OHLCV is
/// always present; perpetual series are present only when the strategy
/// requested them and the exchange could serve them.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    series: HashMap<SeriesKind, Series>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, series: Series) {
        self.series.insert(series.kind(), series);
    }

    pub fn get(&self, kind: SeriesKind) -> Option<&Series> {
        self.series.get(&kind)
    }

    pub fn contains(&self, kind: SeriesKind) -> bool {
        self.series.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = SeriesKind> + '_ {
        self.series.keys().copied()
    }

    /// The primary OHLCV candles, or an empty slice when none were loaded.
    pub fn candles(&self) -> &[Candle] {
        match self.series.get(&SeriesKind::Ohlcv).map(|s| &s.data) {
            Some(SeriesData::Ohlcv(c)) => c,
            _ => &[],
        }
    }

    pub fn funding(&self) -> Option<&[FundingPoint]> {
        match self.series.get(&SeriesKind::FundingRate).map(|s| &s.data) {
            Some(SeriesData::Funding(f)) => Some(f),
            _ => None,
        }
    }

    pub fn open_interest(&self) -> Option<&[OiPoint]> {
        match self.series.get(&SeriesKind::OpenInterest).map(|s| &s.data) {
            Some(SeriesData::OpenInterest(o)) => Some(o),
            _ => None,
        }
    }

    pub fn basis(&self) -> Option<&[BasisPoint]> {
        match self.series.get(&SeriesKind::Basis).map(|s| &s.data) {
            Some(SeriesData::Basis(b)) => Some(b),
            _ => None,
        }
    }

    pub fn liquidations(&self) -> Option<&[LiquidationPoint]> {
        match self.series.get(&SeriesKind::Liquidations).map(|s| &s.data) {
            Some(SeriesData::Liquidations(l)) => Some(l),
            _ => None,
        }
    }

    pub fn long_short(&self) -> Option<&[LongShortPoint]> {
        match self
            .series
            .get(&SeriesKind::LongShortRatio)
            .map(|s| &s.data)
        {
            Some(SeriesData::LongShort(l)) => Some(l),
            _ => None,
        }
    }
}
