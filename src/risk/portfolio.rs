//! Portfolio-level risk analytics: the metric bundle over an arbitrary
//! return series, cross-series correlation, benchmark beta, and per-position
//! risk numbers.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::engine::metrics::{
    conditional_var, downside_deviation, historical_var, mean, std_dev, MetricsConfig,
};

/// Risk statistics over one return series, optionally measured against a
/// benchmark return series of the same length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub volatility: f64,
    pub annualized_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub var_95: f64,
    pub var_99: f64,
    pub cvar_95: f64,
    pub cvar_99: f64,
    pub beta: Option<f64>,
    pub information_ratio: Option<f64>,
}

/// Compute the risk bundle for a bar-return series.
pub fn risk_metrics(
    returns: &[f64],
    benchmark: Option<&[f64]>,
    config: &MetricsConfig,
) -> RiskMetrics {
    let volatility = std_dev(returns);
    let annualization = config.bars_per_year.sqrt();
    let rf_per_bar = config.risk_free_rate / config.bars_per_year;
    let mean_return = mean(returns);

    let sharpe_ratio = if volatility > 0.0 {
        (mean_return - rf_per_bar) / volatility * annualization
    } else {
        f64::NAN
    };

    let downside = downside_deviation(returns);
    let sortino_ratio = if downside > 0.0 {
        (mean_return - rf_per_bar) / downside * annualization
    } else {
        f64::NAN
    };

    let (beta_value, information_ratio) = match benchmark {
        Some(bench) if bench.len() == returns.len() && returns.len() >= 2 => {
            (Some(beta(returns, bench)), Some(information_ratio_impl(returns, bench, annualization)))
        }
        _ => (None, None),
    };

    RiskMetrics {
        volatility,
        annualized_volatility: volatility * annualization,
        sharpe_ratio,
        sortino_ratio,
        var_95: historical_var(returns, 0.05),
        var_99: historical_var(returns, 0.01),
        cvar_95: conditional_var(returns, 0.05),
        cvar_99: conditional_var(returns, 0.01),
        beta: beta_value,
        information_ratio,
    }
}

/// Pearson correlation between two equal-length series; NaN when either is
/// degenerate.
pub fn correlation(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return f64::NAN;
    }
    let mean_a = mean(a);
    let mean_b = mean(b);
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return f64::NAN;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

/// Pairwise correlation matrix over N return series. Series shorter than the
/// longest are compared over their common prefix.
pub fn correlation_matrix(series: &[Vec<f64>]) -> DMatrix<f64> {
    let n = series.len();
    let mut matrix = DMatrix::from_element(n, n, f64::NAN);
    for i in 0..n {
        matrix[(i, i)] = 1.0;
        for j in i + 1..n {
            let len = series[i].len().min(series[j].len());
            let value = correlation(&series[i][..len], &series[j][..len]);
            matrix[(i, j)] = value;
            matrix[(j, i)] = value;
        }
    }
    matrix
}

/// Regression beta of `returns` against `benchmark`.
pub fn beta(returns: &[f64], benchmark: &[f64]) -> f64 {
    if returns.len() != benchmark.len() || returns.len() < 2 {
        return f64::NAN;
    }
    let mean_r = mean(returns);
    let mean_b = mean(benchmark);
    let mut cov = 0.0;
    let mut var_b = 0.0;
    for (r, b) in returns.iter().zip(benchmark.iter()) {
        cov += (r - mean_r) * (b - mean_b);
        var_b += (b - mean_b).powi(2);
    }
    if var_b <= 0.0 {
        return f64::NAN;
    }
    cov / var_b
}

fn information_ratio_impl(returns: &[f64], benchmark: &[f64], annualization: f64) -> f64 {
    let active: Vec<f64> = returns
        .iter()
        .zip(benchmark.iter())
        .map(|(r, b)| r - b)
        .collect();
    let tracking_error = std_dev(&active);
    if tracking_error > 0.0 {
        mean(&active) / tracking_error * annualization
    } else {
        f64::NAN
    }
}

/// Quote-currency amount lost if the stop is hit, and that amount as a
/// fraction of the account.
pub fn position_risk(size: f64, entry: f64, stop: f64, account_balance: f64) -> (f64, f64) {
    let risk_amount = size * (entry - stop).abs();
    let risk_pct = if account_balance > 0.0 {
        risk_amount / account_balance
    } else {
        f64::NAN
    };
    (risk_amount, risk_pct)
}
