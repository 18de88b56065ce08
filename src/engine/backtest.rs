//! The backtest engine: a single-threaded, strictly bar-ordered event loop.
//!
//! Per-bar ordering:
//!
//! 1. Pending signal transitions (queued on the previous bar) fill at this
//!    bar's open.
//! 2. Liquidation check against the bar range — before anything else may
//!    act, including a position opened at this bar's open.
//! 3. Stop-loss / take-profit arbitration on the position's stored stops;
//!    when both trigger in one bar, the stop-loss wins.
//! 4. Strategy dispatch: imperative strategies act through the broker,
//!    declarative strategies queue a level transition for the next open.
//! 5. Funding transfers and dynamic stop updates (when configured).
//! 6. Mark to market at the bar close.
//!
//! The loop never propagates errors for business conditions — rejections,
//! liquidations, and stop hits are recorded and iteration continues. After
//! the final bar any open position is closed at the last close.

use chrono::{DateTime, Utc};

use super::broker::Broker;
use super::execution::{ExecutionConfig, ExecutionModel, OrderSide, OrderType};
use super::metrics::{compute_metrics, MetricsConfig};
use super::types::{BacktestResult, BrokerConfig, Direction};
use crate::market::series::{Candle, SeriesKind};
use crate::market::timeframe::Timeframe;
use crate::market::MarketData;
use crate::risk::stops::{DynamicStopManager, StopConfig};
use crate::strategy::StrategyInstance;

/// Optional engine extensions beyond the plain broker simulation.
#[derive(Debug, Clone, Default)]
pub struct BacktestOptions {
    pub risk_free_rate: f64,
    pub execution: Option<ExecutionConfig>,
    pub stops: Option<StopConfig>,
}

/// Run a backtest with default options.
pub fn run_backtest(
    data: &MarketData,
    strategy: StrategyInstance,
    broker_config: &BrokerConfig,
) -> BacktestResult {
    run_backtest_with(data, strategy, broker_config, &BacktestOptions::default())
}

/// Run a backtest with explicit execution/stop options.
pub fn run_backtest_with(
    data: &MarketData,
    strategy: StrategyInstance,
    broker_config: &BrokerConfig,
    options: &BacktestOptions,
) -> BacktestResult {
    let candles = data.candles();
    let mut broker = Broker::new(broker_config.clone());

    let exec = options.execution.clone().map(ExecutionModel::new);
    if let Some(model) = &exec {
        broker.set_fee_rate(model.fee_rate(OrderType::Market));
    }
    let mut stop_mgr = options.stops.clone().map(DynamicStopManager::new);

    let bars_per_year = data
        .get(SeriesKind::Ohlcv)
        .and_then(|s| s.meta.timeframe)
        .map_or(365.0, Timeframe::bars_per_year);

    if candles.is_empty() {
        broker.mark_initial(DateTime::<Utc>::UNIX_EPOCH);
        return finish(broker, broker_config, options, bars_per_year);
    }
    broker.mark_initial(candles[0].ts);

    let signals = match &strategy {
        StrategyInstance::Signal(s) => {
            let mut v = s.compute_signals(data);
            v.resize(candles.len(), 0);
            Some(v)
        }
        StrategyInstance::Imperative(_) => None,
    };
    let mut strategy = strategy;

    // Current applied exposure level for the signal driver, and the
    // transition queued for the next bar's open.
    let mut level: i8 = 0;
    let mut pending: Option<i8> = None;
    let mut prev_ts: Option<DateTime<Utc>> = None;

    for (i, candle) in candles.iter().enumerate() {
        if let Some(target) = pending.take() {
            apply_transition(&mut broker, exec.as_ref(), level, target, i, candles, candle);
            level = target;
        }

        let liq_hit = broker.position().and_then(|p| {
            p.liq_price.filter(|liq| match p.direction {
                Direction::Long => candle.low <= *liq,
                Direction::Short => candle.high >= *liq,
            })
        });
        if let Some(liq) = liq_hit {
            broker.liquidate(liq, candle.ts);
            level = 0;
            broker.mark_to_market(candle.close, candle.ts);
            prev_ts = Some(candle.ts);
            continue;
        }

        if let Some(pos) = broker.position() {
            let direction = pos.direction;
            let sl_hit = pos.sl_price.filter(|sl| match direction {
                Direction::Long => candle.low <= *sl,
                Direction::Short => candle.high >= *sl,
            });
            let tp_hit = pos.tp_price.filter(|tp| match direction {
                Direction::Long => candle.high >= *tp,
                Direction::Short => candle.low <= *tp,
            });
            if let Some(sl) = sl_hit {
                let fill = exit_fill(sl, direction, broker_config.slippage_rate);
                broker.close(fill, candle.ts, "stop_loss");
                level = 0;
            } else if let Some(tp) = tp_hit {
                let fill = exit_fill(tp, direction, broker_config.slippage_rate);
                broker.close(fill, candle.ts, "take_profit");
                level = 0;
            }
        }

        broker.observe_bar(candle.low, candle.high);

        match (&mut strategy, &signals) {
            (StrategyInstance::Imperative(s), _) => s.on_bar(i, candle, data, &mut broker),
            (StrategyInstance::Signal(_), Some(signals)) => {
                let target = signals[i].clamp(-1, 1);
                if target != level {
                    pending = Some(target);
                }
            }
            (StrategyInstance::Signal(_), None) => unreachable!("signals precomputed"),
        }

        if let Some(model) = &exec {
            if let Some(pos) = broker.position().cloned() {
                let due =
                    model.funding_due(&pos, prev_ts, candle.ts, candle.close, data.funding());
                if due != 0.0 {
                    broker.apply_funding(due);
                }
            }
        }

        if let Some(mgr) = &mut stop_mgr {
            if let Some(pos) = broker.position().cloned() {
                let update = mgr.update(&pos, i, data);
                if let Some(sl) = update.new_stop_loss {
                    broker.set_stop_loss(sl);
                }
                if let Some(tp) = update.new_take_profit {
                    broker.set_take_profit(tp);
                }
                if update.should_exit {
                    let reason = update
                        .exit_reason
                        .unwrap_or_else(|| "risk_exit".to_string());
                    let target = if reason == "take_profit" {
                        update.new_take_profit
                    } else {
                        update.new_stop_loss
                    };
                    let fill = target
                        .unwrap_or(candle.close)
                        .clamp(candle.low, candle.high);
                    broker.close(fill, candle.ts, &reason);
                    level = 0;
                }
            }
        }

        broker.mark_to_market(candle.close, candle.ts);
        prev_ts = Some(candle.ts);
    }

    if broker.position().is_some() {
        let last = candles.last().expect("non-empty candles");
        broker.close(last.close, last.ts, "end_of_data");
    }

    finish(broker, broker_config, options, bars_per_year)
}

/// Translate a signal-level transition into broker orders at the bar open.
fn apply_transition(
    broker: &mut Broker,
    exec: Option<&ExecutionModel>,
    from: i8,
    to: i8,
    i: usize,
    candles: &[Candle],
    candle: &Candle,
) {
    if from == to {
        return;
    }
    let leverage = broker.config().leverage;

    if from != 0 && broker.position().is_some() {
        let side = match from {
            1 => OrderSide::Sell,
            _ => OrderSide::Buy,
        };
        let notional = broker.equity(candle.open) * leverage;
        let price = filled_price(exec, side, candle.open, i, candles, notional);
        broker.close(price, candle.ts, "signal_exit");
    }

    match to {
        1 => {
            let notional = broker.equity(candle.open) * leverage;
            let price = filled_price(exec, OrderSide::Buy, candle.open, i, candles, notional);
            broker.buy_all(price, candle.ts, "signal_long");
        }
        -1 => {
            let notional = broker.equity(candle.open) * leverage;
            let price = filled_price(exec, OrderSide::Sell, candle.open, i, candles, notional);
            broker.short_all(price, candle.ts, "signal_short");
        }
        _ => {}
    }
}

fn filled_price(
    exec: Option<&ExecutionModel>,
    side: OrderSide,
    nominal: f64,
    i: usize,
    candles: &[Candle],
    approx_notional: f64,
) -> f64 {
    match exec {
        Some(model) => {
            model
                .execute(side, OrderType::Market, nominal, i, candles, approx_notional)
                .fill_price
        }
        None => nominal,
    }
}

/// SL/TP trigger fill, adjusted adversely by the configured slippage rate.
fn exit_fill(trigger: f64, direction: Direction, slippage_rate: f64) -> f64 {
    match direction {
        // Closing a long sells; adverse is lower.
        Direction::Long => trigger * (1.0 - slippage_rate),
        // Closing a short buys back; adverse is higher.
        Direction::Short => trigger * (1.0 + slippage_rate),
    }
}

fn finish(
    broker: Broker,
    broker_config: &BrokerConfig,
    options: &BacktestOptions,
    bars_per_year: f64,
) -> BacktestResult {
    let (equity_curve, trade_log, liquidation_events, cash) = broker.finish();
    let metrics = compute_metrics(
        &equity_curve,
        &trade_log,
        broker_config.initial_cash,
        &MetricsConfig {
            risk_free_rate: options.risk_free_rate,
            bars_per_year,
        },
    );
    BacktestResult {
        equity_curve,
        trade_log,
        metrics,
        liquidation_events,
        final_cash: cash,
        final_equity: cash,
    }
}
