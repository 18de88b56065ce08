//! Built-in strategies. Two declarative trend/reversion baselines, a
//! funding-rate sentiment fade, and an imperative breakout strategy that
//! exercises broker-managed stops and risk-based sizing.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::engine::broker::Broker;
use crate::error::ConfigError;
use crate::market::series::{Candle, SeriesKind};
use crate::market::MarketData;
use crate::risk::sizing::{position_size, SizingConstraints, SizingMethod};
use crate::strategy::indicators;
use crate::strategy::params::{ParameterSpec, Params};
use crate::strategy::registry::StrategyDef;
use crate::strategy::{DataRequirement, SignalStrategy, Strategy, StrategyInstance, StrategyMetadata};

fn metadata(name: &str, category: &str, description: &str, tags: &[&str]) -> StrategyMetadata {
    StrategyMetadata {
        name: name.to_string(),
        version: "1.0".to_string(),
        category: category.to_string(),
        description: description.to_string(),
        author: "perpquant".to_string(),
        created_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        tags: tags.iter().map(|t| (*t).to_string()).collect(),
    }
}

/// All built-in strategy definitions, used to seed the registry.
pub fn all() -> Vec<StrategyDef> {
    vec![
        sma_cross_def(),
        rsi_reversion_def(),
        funding_contrarian_def(),
        channel_breakout_def(),
    ]
}

// ---------------------------------------------------------------------------
// sma_cross — declarative trend following, long/flat
// ---------------------------------------------------------------------------

pub struct SmaCross {
    fast: usize,
    slow: usize,
}

impl SignalStrategy for SmaCross {
    fn compute_signals(&self, data: &MarketData) -> Vec<i8> {
        let closes: Vec<f64> = data.candles().iter().map(|c| c.close).collect();
        let fast = indicators::sma(&closes, self.fast);
        let slow = indicators::sma(&closes, self.slow);
        (0..closes.len())
            .map(|i| i8::from(fast[i].is_finite() && slow[i].is_finite() && fast[i] > slow[i]))
            .collect()
    }
}

fn sma_cross_def() -> StrategyDef {
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "fast".to_string(),
        ParameterSpec::int(10, "fast SMA period").bounded(2.0, 200.0),
    );
    parameters.insert(
        "slow".to_string(),
        ParameterSpec::int(30, "slow SMA period").bounded(3.0, 500.0),
    );

    StrategyDef::new(
        "sma_cross",
        metadata(
            "SMA Crossover",
            "trend",
            "Long while the fast SMA is above the slow SMA, flat otherwise.",
            &["trend", "moving-average"],
        ),
        parameters,
        vec![DataRequirement::ohlcv(500)],
        Box::new(|params: &Params| {
            Ok(StrategyInstance::Signal(Box::new(SmaCross {
                fast: params.get_int("fast")? as usize,
                slow: params.get_int("slow")? as usize,
            })))
        }),
    )
    .with_validator(Box::new(|params: &Params| {
        let fast = params.get_int("fast")?;
        let slow = params.get_int("slow")?;
        if fast >= slow {
            return Err(ConfigError::InvalidParameter {
                name: "fast".to_string(),
                detail: format!("fast ({fast}) must be below slow ({slow})"),
            });
        }
        Ok(())
    }))
}

// ---------------------------------------------------------------------------
// rsi_reversion — declarative mean reversion, long/short
// ---------------------------------------------------------------------------

pub struct RsiReversion {
    oversold: f64,
    overbought: f64,
}

impl SignalStrategy for RsiReversion {
    fn compute_signals(&self, data: &MarketData) -> Vec<i8> {
        let closes: Vec<f64> = data.candles().iter().map(|c| c.close).collect();
        let rsi = indicators::rsi(&closes);
        rsi.iter()
            .map(|&r| {
                if !r.is_finite() {
                    0
                } else if r < self.oversold {
                    1
                } else if r > self.overbought {
                    -1
                } else {
                    0
                }
            })
            .collect()
    }
}

fn rsi_reversion_def() -> StrategyDef {
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "oversold".to_string(),
        ParameterSpec::float(30.0, "long when 14-period RSI is below this").bounded(1.0, 50.0),
    );
    parameters.insert(
        "overbought".to_string(),
        ParameterSpec::float(70.0, "short when 14-period RSI is above this").bounded(50.0, 99.0),
    );

    StrategyDef::new(
        "rsi_reversion",
        metadata(
            "RSI Reversion",
            "mean_reversion",
            "Fade RSI extremes: long oversold, short overbought.",
            &["mean-reversion", "oscillator"],
        ),
        parameters,
        vec![DataRequirement::ohlcv(100)],
        Box::new(|params: &Params| {
            Ok(StrategyInstance::Signal(Box::new(RsiReversion {
                oversold: params.get_float("oversold")?,
                overbought: params.get_float("overbought")?,
            })))
        }),
    )
    .with_validator(Box::new(|params: &Params| {
        let oversold = params.get_float("oversold")?;
        let overbought = params.get_float("overbought")?;
        if oversold >= overbought {
            return Err(ConfigError::InvalidParameter {
                name: "oversold".to_string(),
                detail: format!("oversold ({oversold}) must be below overbought ({overbought})"),
            });
        }
        Ok(())
    }))
}

// ---------------------------------------------------------------------------
// funding_contrarian — declarative sentiment fade on funding extremes
// ---------------------------------------------------------------------------

pub struct FundingContrarian {
    threshold: f64,
}

impl SignalStrategy for FundingContrarian {
    fn compute_signals(&self, data: &MarketData) -> Vec<i8> {
        let candles = data.candles();
        let funding = data.funding().unwrap_or(&[]);

        // Funding points are sparse (8h cadence); carry the latest rate at
        // or before each bar forward.
        let mut j = 0usize;
        let mut latest: Option<f64> = None;
        candles
            .iter()
            .map(|candle| {
                while j < funding.len() && funding[j].ts <= candle.ts {
                    latest = Some(funding[j].rate);
                    j += 1;
                }
                match latest {
                    // Heavily positive funding = crowded longs; fade short.
                    Some(rate) if rate > self.threshold => -1,
                    Some(rate) if rate < -self.threshold => 1,
                    _ => 0,
                }
            })
            .collect()
    }
}

fn funding_contrarian_def() -> StrategyDef {
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "threshold".to_string(),
        ParameterSpec::float(0.0005, "absolute funding rate considered extreme")
            .bounded(0.000_01, 0.01),
    );

    StrategyDef::new(
        "funding_contrarian",
        metadata(
            "Funding Contrarian",
            "sentiment",
            "Fade funding-rate extremes on perpetuals: short when longs pay \
             heavily, long when shorts do.",
            &["funding", "contrarian", "perpetual"],
        ),
        parameters,
        vec![
            DataRequirement::ohlcv(100),
            DataRequirement::perpetual(SeriesKind::FundingRate, 90, true),
        ],
        Box::new(|params: &Params| {
            Ok(StrategyInstance::Signal(Box::new(FundingContrarian {
                threshold: params.get_float("threshold")?,
            })))
        }),
    )
}

// ---------------------------------------------------------------------------
// channel_breakout — imperative Donchian breakout with broker-managed stops
// ---------------------------------------------------------------------------

pub struct ChannelBreakout {
    lookback: usize,
    risk_pct: f64,
    reward_ratio: f64,
}

impl Strategy for ChannelBreakout {
    fn on_bar(&mut self, i: usize, candle: &Candle, data: &MarketData, broker: &mut Broker) {
        if broker.position().is_some() || i < self.lookback {
            return;
        }
        let candles = data.candles();
        let window = &candles[i - self.lookback..i];
        let highest = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
        let lowest = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);

        if candle.close > highest {
            let equity = broker.equity(candle.close);
            let sized = position_size(
                equity,
                candle.close,
                Some(lowest),
                &SizingMethod::FixedRisk {
                    risk_pct: self.risk_pct,
                },
                &SizingConstraints {
                    max_position_pct: 1.0,
                    max_leverage: broker.config().leverage,
                },
            );
            if sized.size > 0.0
                && broker
                    .buy(sized.size, candle.close, candle.ts, "channel_breakout")
                    .is_filled()
            {
                broker.set_stop_loss(lowest);
                broker.set_take_profit(candle.close + (candle.close - lowest) * self.reward_ratio);
            }
        }
    }
}

fn channel_breakout_def() -> StrategyDef {
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "lookback".to_string(),
        ParameterSpec::int(20, "channel lookback in bars").bounded(2.0, 500.0),
    );
    parameters.insert(
        "risk_pct".to_string(),
        ParameterSpec::float(0.01, "equity fraction risked per trade").bounded(0.0001, 0.1),
    );
    parameters.insert(
        "reward_ratio".to_string(),
        ParameterSpec::float(2.0, "take-profit distance as a multiple of risk").bounded(0.5, 10.0),
    );

    StrategyDef::new(
        "channel_breakout",
        metadata(
            "Channel Breakout",
            "breakout",
            "Buy closes above the prior N-bar high with a stop at the channel \
             low and a risk-multiple target.",
            &["breakout", "donchian"],
        ),
        parameters,
        vec![DataRequirement::ohlcv(500)],
        Box::new(|params: &Params| {
            Ok(StrategyInstance::Imperative(Box::new(ChannelBreakout {
                lookback: params.get_int("lookback")? as usize,
                risk_pct: params.get_float("risk_pct")?,
                reward_ratio: params.get_float("reward_ratio")?,
            })))
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::series::{FundingPoint, Series, SeriesData, SeriesMeta};
    use crate::market::symbol::{Exchange, Symbol};
    use crate::market::timeframe::Timeframe;
    use chrono::{Duration, TimeZone, Utc};

    fn market_data(closes: &[f64]) -> MarketData {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                ts: start + Duration::hours(i as i64),
                open: close,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 100.0,
            })
            .collect();
        let mut data = MarketData::new();
        data.insert(Series {
            meta: SeriesMeta::ohlcv(Symbol::new("BTC", "USDT"), Exchange::Binance, Timeframe::H1),
            data: SeriesData::Ohlcv(candles),
        });
        data
    }

    #[test]
    fn sma_cross_goes_long_in_uptrend() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + f64::from(i)).collect();
        let strategy = SmaCross { fast: 3, slow: 5 };
        let signals = strategy.compute_signals(&market_data(&closes));
        assert_eq!(signals.len(), 20);
        // Warm-up is flat, steady uptrend is long thereafter.
        assert!(signals[..4].iter().all(|&s| s == 0));
        assert!(signals[5..].iter().all(|&s| s == 1));
    }

    #[test]
    fn sma_cross_no_lookahead() {
        // Mutating the tail must not change earlier signals.
        let mut closes: Vec<f64> = (0..30).map(|i| 100.0 + f64::from(i % 7)).collect();
        let strategy = SmaCross { fast: 3, slow: 5 };
        let before = strategy.compute_signals(&market_data(&closes));
        closes[25] = 1.0;
        closes[29] = 500.0;
        let after = strategy.compute_signals(&market_data(&closes));
        assert_eq!(before[..25], after[..25]);
    }

    #[test]
    fn funding_contrarian_fades_extremes() {
        let closes: Vec<f64> = vec![100.0; 10];
        let mut data = market_data(&closes);
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        data.insert(Series {
            meta: SeriesMeta::perpetual(
                Symbol::new("BTC", "USDT"),
                Exchange::Binance,
                SeriesKind::FundingRate,
                crate::market::series::Cadence::FUNDING_8H,
            ),
            data: SeriesData::Funding(vec![
                FundingPoint {
                    ts: start,
                    rate: 0.001,
                },
                FundingPoint {
                    ts: start + Duration::hours(8),
                    rate: -0.002,
                },
            ]),
        });

        let strategy = FundingContrarian { threshold: 0.0005 };
        let signals = strategy.compute_signals(&data);
        // First funding print is crowded-long: short. After hour 8 the
        // crowd flipped: long.
        assert_eq!(signals[0], -1);
        assert_eq!(signals[7], -1);
        assert_eq!(signals[8], 1);
        assert_eq!(signals[9], 1);
    }

    #[test]
    fn funding_contrarian_flat_without_series() {
        let strategy = FundingContrarian { threshold: 0.0005 };
        let signals = strategy.compute_signals(&market_data(&[100.0; 5]));
        assert!(signals.iter().all(|&s| s == 0));
    }

    #[test]
    fn rsi_reversion_flat_during_warmup() {
        let strategy = RsiReversion {
            oversold: 30.0,
            overbought: 70.0,
        };
        let signals = strategy.compute_signals(&market_data(&[100.0; 10]));
        assert!(signals.iter().all(|&s| s == 0));
    }
}
