#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use perpquant::engine::broker::Broker;
use perpquant::engine::types::BrokerConfig;
use perpquant::market::series::{Candle, Series, SeriesData, SeriesMeta};
use perpquant::market::symbol::{Exchange, Symbol};
use perpquant::market::timeframe::Timeframe;
use perpquant::market::MarketData;
use perpquant::strategy::Strategy;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Hourly candles from explicit (open, high, low, close) tuples.
pub fn candles_from_bars(bars: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
    bars.iter()
        .enumerate()
        .map(|(i, &(open, high, low, close))| Candle {
            ts: t0() + Duration::hours(i as i64),
            open,
            high,
            low,
            close,
            volume: 1_000.0,
        })
        .collect()
}

/// Gapless hourly candles from closes: each bar opens at the previous
/// close, with a small high/low buffer around the body.
pub fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
    let mut prev = closes.first().copied().unwrap_or(0.0);
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            let open = prev;
            prev = close;
            Candle {
                ts: t0() + Duration::hours(i as i64),
                open,
                high: open.max(close) + 0.5,
                low: open.min(close) - 0.5,
                close,
                volume: 1_000.0,
            }
        })
        .collect()
}

pub fn market_data(candles: Vec<Candle>) -> MarketData {
    let mut data = MarketData::new();
    data.insert(Series {
        meta: SeriesMeta::ohlcv(Symbol::new("BTC", "USDT"), Exchange::Binance, Timeframe::H1),
        data: SeriesData::Ohlcv(candles),
    });
    data
}

pub fn broker_config(initial_cash: f64, fee_rate: f64, leverage: f64) -> BrokerConfig {
    BrokerConfig {
        initial_cash,
        fee_rate,
        leverage,
        maintenance_margin_rate: 0.005,
        slippage_rate: 0.0,
    }
}

/// Deterministic but wiggly closes for sweep tests.
pub fn synthetic_closes(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let x = i as f64;
            100.0 + 10.0 * (x / 13.0).sin() + 4.0 * (x / 5.0).cos() + x * 0.05
        })
        .collect()
}

/// Imperative test strategy: goes all-in long on the first bar and attaches
/// the given stops.
pub struct EnterLongWithStops {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl Strategy for EnterLongWithStops {
    fn on_bar(&mut self, i: usize, candle: &Candle, _data: &MarketData, broker: &mut Broker) {
        if i == 0 {
            broker.buy_all(candle.close, candle.ts, "test_entry");
            if let Some(sl) = self.stop_loss {
                broker.set_stop_loss(sl);
            }
            if let Some(tp) = self.take_profit {
                broker.set_take_profit(tp);
            }
        }
    }
}
