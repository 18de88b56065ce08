//! Strategy contract: the two supported strategy shapes, declared parameter
//! schemas, data requirements, and the process-wide registry.

pub mod builtin;
pub mod indicators;
pub mod params;
pub mod registry;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::engine::broker::Broker;
use crate::market::series::{Candle, SeriesKind};
use crate::market::timeframe::Timeframe;
use crate::market::MarketData;

/// One input series a strategy needs. The first requirement a strategy
/// declares must be OHLCV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRequirement {
    pub source: SeriesKind,
    pub timeframe: Option<Timeframe>,
    pub lookback_periods: usize,
    pub required: bool,
}

impl DataRequirement {
    pub fn ohlcv(lookback_periods: usize) -> Self {
        Self {
            source: SeriesKind::Ohlcv,
            timeframe: None,
            lookback_periods,
            required: true,
        }
    }

    pub fn perpetual(source: SeriesKind, lookback_periods: usize, required: bool) -> Self {
        Self {
            source,
            timeframe: None,
            lookback_periods,
            required,
        }
    }
}

/// Descriptive metadata attached to a registered strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyMetadata {
    pub name: String,
    pub version: String,
    pub category: String,
    pub description: String,
    pub author: String,
    pub created_date: NaiveDate,
    pub tags: Vec<String>,
}

/// Imperative strategy shape: consulted once per bar with mutable access to
/// the broker. Entries, exits, and stop placement all go through broker
/// calls; the engine handles SL/TP and liquidation triggers between calls.
pub trait Strategy: Send {
    fn on_bar(&mut self, i: usize, candle: &Candle, data: &MarketData, broker: &mut Broker);
}

/// Declarative strategy shape: produces the whole signal vector up front.
///
/// `signals[i]` is a target exposure level in {-1, 0, 1} and may depend only
/// on `data[..=i]` — no look-ahead. The engine translates level transitions
/// into orders filled at the next bar's open.
pub trait SignalStrategy: Send {
    fn compute_signals(&self, data: &MarketData) -> Vec<i8>;
}

/// A built strategy, tagged by shape. Shape selection happens at
/// registration time rather than by runtime inspection.
pub enum StrategyInstance {
    Imperative(Box<dyn Strategy>),
    Signal(Box<dyn SignalStrategy>),
}

impl StrategyInstance {
    pub fn is_signal(&self) -> bool {
        matches!(self, StrategyInstance::Signal(_))
    }
}
