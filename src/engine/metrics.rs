//! Equity-curve and trade-log statistics.
//!
//! Edge cases follow the documented conventions: with no trades every trade
//! stat is NaN, a constant equity curve yields NaN Sharpe, and profit factor
//! is +inf when no trade lost. Division guards never panic.

use super::types::{EquityPoint, PerformanceMetrics, Trade};

/// Annualization inputs for one run.
#[derive(Debug, Clone, Copy)]
pub struct MetricsConfig {
    /// Annual risk-free rate as a fraction.
    pub risk_free_rate: f64,
    /// Bars in a 365-day year for the run's timeframe.
    pub bars_per_year: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            bars_per_year: 365.0,
        }
    }
}

struct TradeStats {
    win_rate: f64,
    avg_win: f64,
    avg_loss: f64,
    win_loss_ratio: f64,
    profit_factor: f64,
    expectancy: f64,
    max_consecutive_wins: usize,
    max_consecutive_losses: usize,
}

/// Compute the full metrics bundle for one backtest run.
pub fn compute_metrics(
    equity_curve: &[EquityPoint],
    trade_log: &[Trade],
    initial_cash: f64,
    config: &MetricsConfig,
) -> PerformanceMetrics {
    let returns = bar_returns(equity_curve);
    let num_bars = equity_curve.len().saturating_sub(1);

    let final_equity = equity_curve.last().map_or(initial_cash, |p| p.equity);
    let total_return = if initial_cash > 0.0 {
        (final_equity - initial_cash) / initial_cash
    } else {
        f64::NAN
    };

    let annualized_return = if num_bars == 0 {
        f64::NAN
    } else {
        let years = num_bars as f64 / config.bars_per_year;
        (1.0 + total_return).powf(1.0 / years) - 1.0
    };

    let volatility = std_dev(&returns);
    let annualized_volatility = volatility * config.bars_per_year.sqrt();

    let rf_per_bar = config.risk_free_rate / config.bars_per_year;
    let mean_return = mean(&returns);
    let sharpe_ratio = if volatility > 0.0 {
        (mean_return - rf_per_bar) / volatility * config.bars_per_year.sqrt()
    } else {
        f64::NAN
    };

    let downside = downside_deviation(&returns);
    let sortino_ratio = if downside > 0.0 {
        (mean_return - rf_per_bar) / downside * config.bars_per_year.sqrt()
    } else {
        f64::NAN
    };

    let (max_drawdown, max_drawdown_duration) = drawdown(equity_curve);
    let calmar_ratio = if max_drawdown > 0.0 {
        annualized_return / max_drawdown
    } else {
        f64::NAN
    };

    let var_95 = historical_var(&returns, 0.05);
    let var_99 = historical_var(&returns, 0.01);
    let cvar_95 = conditional_var(&returns, 0.05);
    let cvar_99 = conditional_var(&returns, 0.01);

    let t = trade_stats(trade_log);

    PerformanceMetrics {
        total_return,
        annualized_return,
        max_drawdown,
        max_drawdown_duration,
        volatility,
        annualized_volatility,
        sharpe_ratio,
        sortino_ratio,
        calmar_ratio,
        var_95,
        var_99,
        cvar_95,
        cvar_99,
        num_trades: trade_log.len(),
        win_rate: t.win_rate,
        avg_win: t.avg_win,
        avg_loss: t.avg_loss,
        win_loss_ratio: t.win_loss_ratio,
        profit_factor: t.profit_factor,
        expectancy: t.expectancy,
        max_consecutive_wins: t.max_consecutive_wins,
        max_consecutive_losses: t.max_consecutive_losses,
    }
}

pub(crate) fn bar_returns(equity_curve: &[EquityPoint]) -> Vec<f64> {
    equity_curve
        .windows(2)
        .filter(|w| w[0].equity > 0.0)
        .map(|w| (w[1].equity - w[0].equity) / w[0].equity)
        .collect()
}

pub(crate) fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

pub(crate) fn std_dev(data: &[f64]) -> f64 {
    if data.len() < 2 {
        return f64::NAN;
    }
    let m = mean(data);
    let variance = data.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (data.len() - 1) as f64;
    variance.sqrt()
}

pub(crate) fn downside_deviation(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return f64::NAN;
    }
    let sum_sq: f64 = returns
        .iter()
        .filter(|r| **r < 0.0)
        .map(|r| r.powi(2))
        .sum();
    (sum_sq / returns.len() as f64).sqrt()
}

/// Peak-to-trough drawdown fraction and the longest run of bars spent below
/// a previous peak.
fn drawdown(equity_curve: &[EquityPoint]) -> (f64, usize) {
    let Some(first) = equity_curve.first() else {
        return (0.0, 0);
    };
    let mut peak = first.equity;
    let mut max_dd = 0.0;
    let mut current_len = 0usize;
    let mut max_len = 0usize;

    for point in equity_curve {
        if point.equity >= peak {
            peak = point.equity;
            current_len = 0;
        } else {
            current_len += 1;
            max_len = max_len.max(current_len);
            if peak > 0.0 {
                let dd = (peak - point.equity) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }
    }
    (max_dd, max_len)
}

/// Historical VaR at tail probability `alpha`, reported as a positive loss.
pub(crate) fn historical_var(returns: &[f64], alpha: f64) -> f64 {
    if returns.is_empty() {
        return f64::NAN;
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let index = ((alpha * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
    -sorted[index]
}

/// Mean loss beyond the VaR threshold, reported positive.
pub(crate) fn conditional_var(returns: &[f64], alpha: f64) -> f64 {
    if returns.is_empty() {
        return f64::NAN;
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let cutoff = ((alpha * sorted.len() as f64).floor() as usize).min(sorted.len() - 1);
    let tail = &sorted[..=cutoff];
    -(tail.iter().sum::<f64>() / tail.len() as f64)
}

fn trade_stats(trade_log: &[Trade]) -> TradeStats {
    if trade_log.is_empty() {
        return TradeStats {
            win_rate: f64::NAN,
            avg_win: f64::NAN,
            avg_loss: f64::NAN,
            win_loss_ratio: f64::NAN,
            profit_factor: f64::NAN,
            expectancy: f64::NAN,
            max_consecutive_wins: 0,
            max_consecutive_losses: 0,
        };
    }

    let total = trade_log.len() as f64;
    let mut wins = 0usize;
    let mut losses = 0usize;
    let mut win_sum = 0.0;
    let mut loss_sum = 0.0;
    let mut win_streak = 0usize;
    let mut loss_streak = 0usize;
    let mut max_win_streak = 0usize;
    let mut max_loss_streak = 0usize;

    for t in trade_log {
        if t.pnl_abs > 0.0 {
            wins += 1;
            win_sum += t.pnl_abs;
            win_streak += 1;
            loss_streak = 0;
            max_win_streak = max_win_streak.max(win_streak);
        } else if t.pnl_abs < 0.0 {
            losses += 1;
            loss_sum += t.pnl_abs;
            loss_streak += 1;
            win_streak = 0;
            max_loss_streak = max_loss_streak.max(loss_streak);
        } else {
            // Scratch trades break both streaks.
            win_streak = 0;
            loss_streak = 0;
        }
    }

    let win_rate = wins as f64 / total;
    let avg_win = if wins > 0 { win_sum / wins as f64 } else { 0.0 };
    let avg_loss = if losses > 0 {
        loss_sum / losses as f64
    } else {
        0.0
    };

    let profit_factor = if loss_sum < 0.0 {
        win_sum / loss_sum.abs()
    } else if win_sum > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let win_loss_ratio = if avg_loss < 0.0 {
        avg_win / avg_loss.abs()
    } else if avg_win > 0.0 {
        f64::INFINITY
    } else {
        f64::NAN
    };

    let expectancy = win_rate * avg_win - (1.0 - win_rate) * avg_loss.abs();

    TradeStats {
        win_rate,
        avg_win,
        avg_loss,
        win_loss_ratio,
        profit_factor,
        expectancy,
        max_consecutive_wins: max_win_streak,
        max_consecutive_losses: max_loss_streak,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Direction;
    use chrono::{TimeZone, Utc};

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &equity)| EquityPoint {
                ts: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                    + chrono::Duration::hours(i as i64),
                equity,
            })
            .collect()
    }

    fn trade(pnl: f64) -> Trade {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Trade {
            entry_time: ts,
            exit_time: ts + chrono::Duration::hours(4),
            direction: Direction::Long,
            entry_price: 100.0,
            exit_price: 100.0 + pnl,
            size: 1.0,
            leverage: 1.0,
            fee: 0.0,
            pnl_abs: pnl,
            pnl_pct: pnl,
            entry_reason: "signal".into(),
            exit_reason: "signal_exit".into(),
            holding_bars: 4,
            mae_pct: 0.0,
            mfe_pct: 0.0,
            equity_after: 10_000.0 + pnl,
            is_liquidation: false,
        }
    }

    #[test]
    fn no_trades_yields_nan_trade_stats() {
        let m = compute_metrics(
            &curve(&[10_000.0, 10_100.0]),
            &[],
            10_000.0,
            &MetricsConfig::default(),
        );
        assert_eq!(m.num_trades, 0);
        assert!(m.win_rate.is_nan());
        assert!(m.profit_factor.is_nan());
        assert!(m.expectancy.is_nan());
    }

    #[test]
    fn constant_equity_yields_nan_sharpe() {
        let m = compute_metrics(
            &curve(&[10_000.0, 10_000.0, 10_000.0]),
            &[],
            10_000.0,
            &MetricsConfig::default(),
        );
        assert!(m.sharpe_ratio.is_nan());
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.total_return, 0.0);
    }

    #[test]
    fn all_wins_profit_factor_infinite() {
        let trades = vec![trade(50.0), trade(100.0)];
        let m = compute_metrics(
            &curve(&[10_000.0, 10_150.0]),
            &trades,
            10_000.0,
            &MetricsConfig::default(),
        );
        assert!(m.profit_factor.is_infinite() && m.profit_factor > 0.0);
        assert_eq!(m.win_rate, 1.0);
        assert_eq!(m.max_consecutive_wins, 2);
    }

    #[test]
    fn mixed_trades_finite_profit_factor() {
        let trades = vec![trade(100.0), trade(-50.0), trade(150.0)];
        let m = compute_metrics(
            &curve(&[10_000.0, 10_200.0]),
            &trades,
            10_000.0,
            &MetricsConfig::default(),
        );
        assert!((m.profit_factor - 250.0 / 50.0).abs() < 1e-10);
        assert!((m.win_rate - 2.0 / 3.0).abs() < 1e-10);
        assert!((m.avg_win - 125.0).abs() < 1e-10);
        assert!((m.avg_loss - (-50.0)).abs() < 1e-10);
        // expectancy = 2/3 * 125 - 1/3 * 50
        assert!((m.expectancy - (2.0 / 3.0 * 125.0 - 50.0 / 3.0)).abs() < 1e-10);
    }

    #[test]
    fn max_drawdown_and_duration() {
        // Peak 10_200 at bar 1; trough 9_800 at bar 3; recovery at bar 5.
        let m = compute_metrics(
            &curve(&[10_000.0, 10_200.0, 10_000.0, 9_800.0, 10_100.0, 10_300.0]),
            &[],
            10_000.0,
            &MetricsConfig::default(),
        );
        let expected = (10_200.0 - 9_800.0) / 10_200.0;
        assert!((m.max_drawdown - expected).abs() < 1e-10);
        // Bars 2, 3, 4 are below the bar-1 peak.
        assert_eq!(m.max_drawdown_duration, 3);
    }

    #[test]
    fn var_positive_under_steady_losses() {
        let values: Vec<f64> = (0..40).map(|i| 10_000.0 - 50.0 * f64::from(i)).collect();
        let m = compute_metrics(&curve(&values), &[], 10_000.0, &MetricsConfig::default());
        assert!(m.var_95 > 0.0);
        assert!(m.cvar_95 >= m.var_95);
        assert!(m.cvar_99 >= m.cvar_95 - 1e-12);
    }

    #[test]
    fn scratch_trades_break_streaks() {
        let trades = vec![trade(-10.0), trade(0.0), trade(-10.0)];
        let m = compute_metrics(
            &curve(&[10_000.0, 9_980.0]),
            &trades,
            10_000.0,
            &MetricsConfig::default(),
        );
        assert_eq!(m.max_consecutive_losses, 1);
        assert_eq!(m.win_rate, 0.0);
    }

    #[test]
    fn annualized_return_one_year_matches_total() {
        // 365 daily bars = exactly one year at the default bars_per_year.
        let mut values = vec![10_000.0];
        for i in 1..=365 {
            values.push(10_000.0 + f64::from(i));
        }
        let m = compute_metrics(&curve(&values), &[], 10_000.0, &MetricsConfig::default());
        assert!((m.annualized_return - m.total_return).abs() < 1e-10);
    }

    #[test]
    fn zero_bar_curve_never_panics() {
        let m = compute_metrics(
            &curve(&[10_000.0]),
            &[],
            10_000.0,
            &MetricsConfig::default(),
        );
        assert_eq!(m.total_return, 0.0);
        assert!(m.annualized_return.is_nan());
        assert!(m.volatility.is_nan());
    }
}
