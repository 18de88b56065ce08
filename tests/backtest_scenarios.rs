//! End-to-end backtest scenarios: the SMA-crossover walkthrough, stop-loss
//! and liquidation golden cases, engine invariants, and parameter-sweep
//! determinism.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use perpquant::engine::backtest::run_backtest;
use perpquant::engine::types::Direction;
use perpquant::experiment::grid::{GridSpec, SearchMode};
use perpquant::experiment::runner::{self, BacktestFn, ExperimentConfig, RunTask};
use perpquant::market::symbol::Symbol;
use perpquant::market::timeframe::Timeframe;
use perpquant::strategy::params::{ParamValue, Params};
use perpquant::strategy::registry::StrategyRegistry;
use perpquant::strategy::StrategyInstance;

use common::{
    broker_config, candles_from_bars, candles_from_closes, market_data, synthetic_closes,
    EnterLongWithStops,
};

fn build_sma(fast: i64, slow: i64) -> StrategyInstance {
    let registry = StrategyRegistry::with_builtins();
    let overrides = Params::new().with("fast", fast).with("slow", slow);
    registry.build("sma_cross", &overrides).unwrap().0
}

/// SMA crossover on the canonical ten-bar ramp: one long round trip,
/// entered around bar 3 and exited around bar 7.
#[test]
fn sma_crossover_single_profitable_trade() {
    let closes = [10.0, 11.0, 12.0, 13.0, 14.0, 13.0, 12.0, 11.0, 10.0, 11.0];
    let mut candles = candles_from_closes(&closes);
    // Exit bar gaps up slightly before selling off.
    candles[7].open = 12.25;
    candles[7].high = 12.75;

    let data = market_data(candles);
    let result = run_backtest(&data, build_sma(2, 3), &broker_config(1_000.0, 0.0, 1.0));

    assert_eq!(result.metrics.num_trades, 1);
    let trade = &result.trade_log[0];
    assert_eq!(trade.direction, Direction::Long);
    // Crossover fires at bar 2; the fill lands on bar 3's open.
    assert_eq!(trade.entry_time, data.candles()[3].ts);
    assert_eq!(trade.exit_time, data.candles()[7].ts);
    assert!(trade.pnl_abs > 0.0, "pnl was {}", trade.pnl_abs);
    assert!(result.final_equity > 1_000.0);
}

/// Long stop-loss: SL at 95, next bar trades through it.
#[test]
fn long_stop_loss_fills_at_stop() {
    let data = market_data(candles_from_bars(&[
        (100.0, 100.5, 99.5, 100.0),
        (100.0, 101.0, 94.0, 100.0),
        (100.0, 100.5, 99.5, 100.0),
    ]));
    let strategy = StrategyInstance::Imperative(Box::new(EnterLongWithStops {
        stop_loss: Some(95.0),
        take_profit: None,
    }));
    let result = run_backtest(&data, strategy, &broker_config(1_000.0, 0.0, 1.0));

    assert_eq!(result.trade_log.len(), 1);
    let trade = &result.trade_log[0];
    assert_eq!(trade.exit_reason, "stop_loss");
    assert_eq!(trade.exit_price, 95.0);
    assert!((trade.pnl_pct - (-5.0)).abs() < 1e-9);
}

/// SL and TP both inside one bar: the stop-loss wins.
#[test]
fn same_bar_stop_and_target_resolves_to_stop() {
    let data = market_data(candles_from_bars(&[
        (100.0, 100.5, 99.5, 100.0),
        (100.0, 111.0, 94.0, 100.0),
    ]));
    let strategy = StrategyInstance::Imperative(Box::new(EnterLongWithStops {
        stop_loss: Some(95.0),
        take_profit: Some(110.0),
    }));
    let result = run_backtest(&data, strategy, &broker_config(1_000.0, 0.0, 1.0));

    assert_eq!(result.trade_log.len(), 1);
    assert_eq!(result.trade_log[0].exit_reason, "stop_loss");
    assert_eq!(result.trade_log[0].exit_price, 95.0);
}

/// 10x long liquidates at entry·(1 − 1/leverage + maintenance) = 90.5.
#[test]
fn leveraged_long_liquidation() {
    let data = market_data(candles_from_bars(&[
        (100.0, 100.5, 99.5, 100.0),
        (100.0, 100.5, 90.0, 92.0),
        (92.0, 93.0, 91.0, 92.5),
    ]));
    let strategy = StrategyInstance::Imperative(Box::new(EnterLongWithStops {
        stop_loss: None,
        take_profit: None,
    }));
    let result = run_backtest(&data, strategy, &broker_config(1_000.0, 0.0, 10.0));

    assert_eq!(result.liquidation_events.len(), 1);
    let trade = &result.trade_log[0];
    assert!(trade.is_liquidation);
    assert!((trade.exit_price - 90.5).abs() < 1e-9);
    // Only the maintenance margin survives — cash is close to zero.
    assert!(result.final_cash < 100.0);
    assert!(result.final_cash >= 0.0);
}

/// Engine invariants over a busy synthetic run: per-bar equity identity,
/// trade accounting, exit ordering, and liquidation bookkeeping.
#[test]
fn engine_invariants_hold_on_synthetic_run() {
    let data = market_data(candles_from_closes(&synthetic_closes(300)));
    let result = run_backtest(&data, build_sma(5, 20), &broker_config(10_000.0, 0.0005, 3.0));

    // Equity curve: initial point plus one mark per bar, in order.
    assert_eq!(result.equity_curve.len(), 301);
    for pair in result.equity_curve.windows(2) {
        assert!(pair[0].ts <= pair[1].ts);
    }

    for trade in &result.trade_log {
        assert!(trade.exit_time >= trade.entry_time);
        assert!(trade.size > 0.0);
        assert!(trade.fee >= 0.0);
        assert!(trade.mae_pct <= trade.mfe_pct + 1e-9);
    }

    let liquidation_trades = result.trade_log.iter().filter(|t| t.is_liquidation).count();
    assert_eq!(liquidation_trades, result.liquidation_events.len());

    // Net trade PnL reconciles with the cash delta.
    let pnl_sum: f64 = result.trade_log.iter().map(|t| t.pnl_abs).sum();
    assert!(
        (pnl_sum - (result.final_equity - 10_000.0)).abs() < 1e-6,
        "pnl {pnl_sum} vs equity delta {}",
        result.final_equity - 10_000.0
    );

    // Profit factor classification matches the trade log.
    let wins = result.trade_log.iter().filter(|t| t.pnl_abs > 0.0).count();
    let losses = result.trade_log.iter().filter(|t| t.pnl_abs < 0.0).count();
    if result.trade_log.is_empty() {
        assert!(result.metrics.profit_factor.is_nan());
    } else if losses == 0 && wins > 0 {
        assert!(result.metrics.profit_factor.is_infinite());
    } else if losses > 0 {
        assert!(result.metrics.profit_factor.is_finite());
        assert!(result.metrics.profit_factor >= 0.0);
    }
}

/// Repeated identical runs must be bit-identical.
#[test]
fn repeated_backtests_are_identical() {
    let data = market_data(candles_from_closes(&synthetic_closes(200)));
    let config = broker_config(10_000.0, 0.001, 2.0);
    let a = run_backtest(&data, build_sma(5, 20), &config);
    let b = run_backtest(&data, build_sma(5, 20), &config);

    assert_eq!(
        serde_json::to_string(&a.trade_log).unwrap(),
        serde_json::to_string(&b.trade_log).unwrap()
    );
    assert_eq!(
        serde_json::to_string(&a.equity_curve).unwrap(),
        serde_json::to_string(&b.equity_curve).unwrap()
    );
    assert_eq!(a.final_equity, b.final_equity);
}

fn sweep_backtest_fn() -> BacktestFn {
    Arc::new(|task: &RunTask| {
        let registry = StrategyRegistry::with_builtins();
        let (strategy, _params) = registry
            .build(&task.strategy_id, &task.params)
            .map_err(anyhow::Error::from)?;
        let data = market_data(candles_from_closes(&synthetic_closes(250)));
        let result = run_backtest(&data, strategy, &broker_config(10_000.0, 0.0005, 1.0));
        Ok(runner::metric_map(&result.metrics))
    })
}

/// Parameter-sweep determinism: the same grid over the same data yields
/// identical per-combination metrics and the same best run.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parameter_sweep_is_deterministic() {
    let mut config = ExperimentConfig::new(
        "sweep-determinism",
        "sma_cross",
        vec![Symbol::new("BTC", "USDT")],
        Timeframe::H1,
    );
    config.param_grid.insert(
        "fast".to_string(),
        GridSpec::Values(vec![ParamValue::Int(5), ParamValue::Int(10)]),
    );
    config.param_grid.insert(
        "slow".to_string(),
        GridSpec::Values(vec![ParamValue::Int(20), ParamValue::Int(30)]),
    );
    config.search = SearchMode::Grid;
    config.optimization_metric = "total_return".to_string();
    config.parallel_workers = 4;

    let first = runner::run(&config, sweep_backtest_fn()).await.unwrap();
    let second = runner::run(&config, sweep_backtest_fn()).await.unwrap();

    assert_eq!(first.completed, 4);
    assert_eq!(second.completed, 4);

    let by_task = |result: &runner::ExperimentResult| -> BTreeMap<String, BTreeMap<String, f64>> {
        result
            .runs
            .iter()
            .map(|r| (r.task_id.clone(), r.metrics.clone().unwrap_or_default()))
            .collect()
    };
    assert_eq!(by_task(&first), by_task(&second));

    let best_a = first.best.unwrap();
    let best_b = second.best.unwrap();
    assert_eq!(best_a.task_id, best_b.task_id);
    assert_eq!(
        best_a.metrics.unwrap()["total_return"],
        best_b.metrics.unwrap()["total_return"]
    );
}

/// Zero-bar data: a result with an empty trade log and a single equity
/// point, never a panic.
#[test]
fn zero_bars_yield_empty_result() {
    let data = market_data(vec![]);
    let result = run_backtest(&data, build_sma(2, 3), &broker_config(1_000.0, 0.0, 1.0));
    assert!(result.trade_log.is_empty());
    assert_eq!(result.equity_curve.len(), 1);
    assert_eq!(result.equity_curve[0].equity, 1_000.0);
}
