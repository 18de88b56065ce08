//! Dynamic stop-loss / take-profit management.
//!
//! Given an open position and the bar history up to the current index, the
//! manager computes updated SL/TP prices and flags an exit when the bar
//! range crosses either one. Stops only ever ratchet in the position's
//! favour; support/resistance-based stops recompute their levels
//! periodically from the history seen so far, never from future bars.

use serde::{Deserialize, Serialize};

use crate::engine::types::{Direction, Position};
use crate::market::series::Candle;
use crate::market::MarketData;
use crate::risk::levels::{self, SrConfig};
use crate::strategy::indicators;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopKind {
    /// Entry price offset by a fixed percentage.
    Fixed { pct: f64 },
    /// Entry price offset by a multiple of ATR(period).
    Atr { period: usize, multiplier: f64 },
    /// Nearest support (long) or resistance (short) on the adverse side,
    /// padded by a small buffer.
    Support { buffer_pct: f64 },
    /// Activates once unrealized profit exceeds `activation_pct`, then
    /// follows price at `distance_pct`, ratcheting monotonically.
    Trailing {
        activation_pct: f64,
        distance_pct: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TakeProfitKind {
    Fixed { pct: f64 },
    /// Nearest resistance (long) or support (short) on the favourable side.
    Resistance,
    /// Stop distance times a reward ratio.
    RiskReward { ratio: f64 },
    /// Follows price on the profit side, letting winners run.
    Trailing { distance_pct: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConfig {
    pub stop: StopKind,
    pub take_profit: Option<TakeProfitKind>,
    #[serde(default)]
    pub sr: SrConfig,
    /// Bars between S/R level refreshes for the level-based kinds.
    #[serde(default = "default_refresh")]
    pub refresh_every: usize,
}

fn default_refresh() -> usize {
    20
}

/// Result of one stop evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopUpdate {
    pub new_stop_loss: Option<f64>,
    pub new_take_profit: Option<f64>,
    pub should_exit: bool,
    pub exit_reason: Option<String>,
}

impl StopUpdate {
    fn hold(sl: Option<f64>, tp: Option<f64>) -> Self {
        Self {
            new_stop_loss: sl,
            new_take_profit: tp,
            should_exit: false,
            exit_reason: None,
        }
    }
}

#[derive(Debug)]
pub struct DynamicStopManager {
    config: StopConfig,
    cached_levels: Vec<levels::SRLevel>,
    last_refresh: Option<usize>,
}

impl DynamicStopManager {
    pub fn new(config: StopConfig) -> Self {
        Self {
            config,
            cached_levels: Vec::new(),
            last_refresh: None,
        }
    }

    fn needs_levels(&self) -> bool {
        matches!(self.config.stop, StopKind::Support { .. })
            || matches!(self.config.take_profit, Some(TakeProfitKind::Resistance))
    }

    fn refresh_levels(&mut self, data: &MarketData, i: usize) {
        let due = match self.last_refresh {
            Some(last) => i >= last + self.config.refresh_every,
            None => true,
        };
        if !due {
            return;
        }
        // Only the history up to and including bar i may inform the levels.
        let candles = data.candles();
        let visible = &candles[..=i.min(candles.len() - 1)];
        let mut truncated = MarketData::new();
        if let Some(series) = data.get(crate::market::series::SeriesKind::Ohlcv) {
            let mut series = series.clone();
            if let crate::market::series::SeriesData::Ohlcv(c) = &mut series.data {
                c.truncate(visible.len());
            }
            truncated.insert(series);
        }
        self.cached_levels = levels::detect(&truncated, &self.config.sr);
        self.last_refresh = Some(i);
    }

    /// Evaluate stops for the open position against bar `i`.
    pub fn update(&mut self, position: &Position, i: usize, data: &MarketData) -> StopUpdate {
        let candles = data.candles();
        let Some(candle) = candles.get(i) else {
            return StopUpdate::hold(position.sl_price, position.tp_price);
        };

        if self.needs_levels() {
            self.refresh_levels(data, i);
        }

        let sl = self.stop_price(position, i, candles, candle);
        let tp = self.take_profit_price(position, sl, candle);

        // Monotonic ratchet: a stop may only tighten in the position's favour.
        let sl = match (position.sl_price, sl) {
            (Some(current), Some(candidate)) => Some(match position.direction {
                Direction::Long => current.max(candidate),
                Direction::Short => current.min(candidate),
            }),
            (current, candidate) => candidate.or(current),
        };
        let tp = tp.or(position.tp_price);

        let (should_exit, exit_reason) = check_crossing(position.direction, candle, sl, tp);
        StopUpdate {
            new_stop_loss: sl,
            new_take_profit: tp,
            should_exit,
            exit_reason,
        }
    }

    fn stop_price(
        &self,
        position: &Position,
        i: usize,
        candles: &[Candle],
        candle: &Candle,
    ) -> Option<f64> {
        let entry = position.entry_price;
        let sign = position.direction.sign();
        match &self.config.stop {
            StopKind::Fixed { pct } => Some(entry * (1.0 - sign * pct)),
            StopKind::Atr { period, multiplier } => {
                let end = i + 1;
                let close: Vec<f64> = candles[..end].iter().map(|c| c.close).collect();
                let high: Vec<f64> = candles[..end].iter().map(|c| c.high).collect();
                let low: Vec<f64> = candles[..end].iter().map(|c| c.low).collect();
                let atr = indicators::atr(&close, &high, &low, *period);
                let current = atr.last().copied().unwrap_or(f64::NAN);
                if current.is_finite() {
                    Some(entry - sign * multiplier * current)
                } else {
                    None
                }
            }
            StopKind::Support { buffer_pct } => match position.direction {
                Direction::Long => levels::nearest_support(entry, &self.cached_levels)
                    .map(|l| l.price * (1.0 - buffer_pct)),
                Direction::Short => levels::nearest_resistance(entry, &self.cached_levels)
                    .map(|l| l.price * (1.0 + buffer_pct)),
            },
            StopKind::Trailing {
                activation_pct,
                distance_pct,
            } => {
                let profit_pct = (candle.close - entry) / entry * sign;
                if profit_pct >= *activation_pct {
                    Some(candle.close * (1.0 - sign * distance_pct))
                } else {
                    None
                }
            }
        }
    }

    fn take_profit_price(
        &self,
        position: &Position,
        stop: Option<f64>,
        candle: &Candle,
    ) -> Option<f64> {
        let entry = position.entry_price;
        let sign = position.direction.sign();
        match &self.config.take_profit {
            None => None,
            Some(TakeProfitKind::Fixed { pct }) => Some(entry * (1.0 + sign * pct)),
            Some(TakeProfitKind::Resistance) => match position.direction {
                Direction::Long => {
                    levels::nearest_resistance(entry, &self.cached_levels).map(|l| l.price)
                }
                Direction::Short => {
                    levels::nearest_support(entry, &self.cached_levels).map(|l| l.price)
                }
            },
            Some(TakeProfitKind::RiskReward { ratio }) => {
                let stop = stop.or(position.sl_price)?;
                let distance = (entry - stop).abs();
                Some(entry + sign * distance * ratio)
            }
            Some(TakeProfitKind::Trailing { distance_pct }) => {
                let candidate = candle.close * (1.0 + sign * distance_pct);
                match position.tp_price {
                    // Let winners run: the target only moves further out.
                    Some(current) => Some(match position.direction {
                        Direction::Long => current.max(candidate),
                        Direction::Short => current.min(candidate),
                    }),
                    None => Some(candidate),
                }
            }
        }
    }
}

/// SL/TP crossing test against the bar range. When both trigger in the same
/// bar the stop-loss wins.
fn check_crossing(
    direction: Direction,
    candle: &Candle,
    sl: Option<f64>,
    tp: Option<f64>,
) -> (bool, Option<String>) {
    let sl_hit = sl.is_some_and(|sl| match direction {
        Direction::Long => candle.low <= sl,
        Direction::Short => candle.high >= sl,
    });
    if sl_hit {
        return (true, Some("stop_loss".to_string()));
    }
    let tp_hit = tp.is_some_and(|tp| match direction {
        Direction::Long => candle.high >= tp,
        Direction::Short => candle.low <= tp,
    });
    if tp_hit {
        return (true, Some("take_profit".to_string()));
    }
    (false, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::series::{Series, SeriesData, SeriesMeta};
    use crate::market::symbol::{Exchange, Symbol};
    use crate::market::timeframe::Timeframe;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn ts0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn data_from_closes(closes: &[f64]) -> MarketData {
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                ts: ts0() + Duration::hours(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume: 10.0,
            })
            .collect();
        let mut data = MarketData::new();
        data.insert(Series {
            meta: SeriesMeta::ohlcv(Symbol::new("BTC", "USDT"), Exchange::Binance, Timeframe::H1),
            data: SeriesData::Ohlcv(candles),
        });
        data
    }

    fn long_position(entry: f64) -> Position {
        Position {
            direction: Direction::Long,
            entry_price: entry,
            size: 1.0,
            leverage: 1.0,
            entry_time: ts0(),
            sl_price: None,
            tp_price: None,
            liq_price: None,
            entry_reason: "test".into(),
            entry_bar: 0,
            entry_fee: 0.0,
            worst_price: entry,
            best_price: entry,
        }
    }

    #[test]
    fn fixed_stop_placed_below_long_entry() {
        let data = data_from_closes(&[100.0, 101.0, 102.0]);
        let mut mgr = DynamicStopManager::new(StopConfig {
            stop: StopKind::Fixed { pct: 0.05 },
            take_profit: Some(TakeProfitKind::RiskReward { ratio: 2.0 }),
            sr: SrConfig::default(),
            refresh_every: 20,
        });
        let update = mgr.update(&long_position(100.0), 1, &data);
        assert!((update.new_stop_loss.unwrap() - 95.0).abs() < 1e-10);
        // risk = 5, reward ratio 2 → tp at 110
        assert!((update.new_take_profit.unwrap() - 110.0).abs() < 1e-10);
        assert!(!update.should_exit);
    }

    #[test]
    fn trailing_stop_activates_and_ratchets() {
        // Price climbs from 100 to 110, then stalls.
        let closes: Vec<f64> = (0..11).map(|i| 100.0 + f64::from(i)).collect();
        let data = data_from_closes(&closes);
        let mut mgr = DynamicStopManager::new(StopConfig {
            stop: StopKind::Trailing {
                activation_pct: 0.02,
                distance_pct: 0.03,
            },
            take_profit: None,
            sr: SrConfig::default(),
            refresh_every: 20,
        });

        let mut position = long_position(100.0);

        // Bar 1: only 1% profit — not yet active.
        let update = mgr.update(&position, 1, &data);
        assert!(update.new_stop_loss.is_none());

        // Bar 5: 5% profit — trailing stop at 105 * 0.97.
        let update = mgr.update(&position, 5, &data);
        let sl5 = update.new_stop_loss.unwrap();
        assert!((sl5 - 105.0 * 0.97).abs() < 1e-10);
        position.sl_price = Some(sl5);

        // Bar 10: stop follows to 110 * 0.97, strictly higher.
        let update = mgr.update(&position, 10, &data);
        let sl10 = update.new_stop_loss.unwrap();
        assert!(sl10 > sl5);
        assert!((sl10 - 110.0 * 0.97).abs() < 1e-10);
    }

    #[test]
    fn ratchet_never_loosens() {
        let data = data_from_closes(&[100.0, 110.0, 103.0]);
        let mut mgr = DynamicStopManager::new(StopConfig {
            stop: StopKind::Trailing {
                activation_pct: 0.01,
                distance_pct: 0.02,
            },
            take_profit: None,
            sr: SrConfig::default(),
            refresh_every: 20,
        });
        let mut position = long_position(100.0);

        let update = mgr.update(&position, 1, &data);
        let high_water = update.new_stop_loss.unwrap(); // 110 * 0.98
        position.sl_price = Some(high_water);

        // Price fell back to 103; candidate stop (103*0.98) is below the
        // ratchet and must be ignored.
        let update = mgr.update(&position, 2, &data);
        assert!((update.new_stop_loss.unwrap() - high_water).abs() < 1e-10);
    }

    #[test]
    fn stop_loss_wins_over_take_profit_in_same_bar() {
        let mut data = data_from_closes(&[100.0]);
        // Widen the bar so both 95 and 110 are inside its range.
        if let Some(series) = data.get(crate::market::series::SeriesKind::Ohlcv) {
            let mut series = series.clone();
            if let SeriesData::Ohlcv(c) = &mut series.data {
                c[0].low = 94.0;
                c[0].high = 111.0;
            }
            data.insert(series);
        }
        let mut mgr = DynamicStopManager::new(StopConfig {
            stop: StopKind::Fixed { pct: 0.05 },
            take_profit: Some(TakeProfitKind::Fixed { pct: 0.10 }),
            sr: SrConfig::default(),
            refresh_every: 20,
        });
        let update = mgr.update(&long_position(100.0), 0, &data);
        assert!(update.should_exit);
        assert_eq!(update.exit_reason.as_deref(), Some("stop_loss"));
    }

    #[test]
    fn atr_stop_waits_for_warmup() {
        let data = data_from_closes(&[100.0, 100.5, 101.0]);
        let mut mgr = DynamicStopManager::new(StopConfig {
            stop: StopKind::Atr {
                period: 14,
                multiplier: 2.0,
            },
            take_profit: None,
            sr: SrConfig::default(),
            refresh_every: 20,
        });
        let update = mgr.update(&long_position(100.0), 2, &data);
        assert!(update.new_stop_loss.is_none());
    }
}
