//! Position sizing.
//!
//! Every method produces a base-asset size from the account balance and
//! entry price; outputs are clamped so the position's notional never exceeds
//! `max_position_pct` of equity times `max_leverage`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SizingMethod {
    /// Fixed quote-currency amount.
    FixedAmount { amount: f64 },
    /// Risk a fixed fraction of equity between entry and stop.
    FixedRisk { risk_pct: f64 },
    /// Kelly criterion `f = W - (1-W)/R`, scaled by a fractional multiplier.
    Kelly {
        win_rate: f64,
        payoff_ratio: f64,
        kelly_fraction: f64,
    },
    /// Scale a base allocation by target over realized volatility.
    VolatilityAdjusted {
        target_vol: f64,
        current_vol: f64,
        base_pct: f64,
    },
    /// Fixed fraction of equity.
    EquityPercentage { pct: f64 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizingConstraints {
    pub max_position_pct: f64,
    pub max_leverage: f64,
}

impl Default for SizingConstraints {
    fn default() -> Self {
        Self {
            max_position_pct: 1.0,
            max_leverage: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSize {
    /// Base-asset quantity.
    pub size: f64,
    pub notional: f64,
    /// Quote currency lost if the stop is hit, zero when no stop was given.
    pub risk_amount: f64,
    pub risk_pct: f64,
}

/// Size a position. Degenerate inputs (zero balance, stopless fixed-risk,
/// non-positive Kelly edge) yield a zero size rather than an error.
pub fn position_size(
    account_balance: f64,
    entry: f64,
    stop_loss: Option<f64>,
    method: &SizingMethod,
    constraints: &SizingConstraints,
) -> PositionSize {
    if account_balance <= 0.0 || entry <= 0.0 {
        return zero();
    }

    let raw_size = match method {
        SizingMethod::FixedAmount { amount } => amount.max(0.0) / entry,
        SizingMethod::FixedRisk { risk_pct } => match stop_loss {
            Some(stop) => {
                let distance = (entry - stop).abs();
                if distance > 0.0 {
                    account_balance * risk_pct / distance
                } else {
                    0.0
                }
            }
            None => 0.0,
        },
        SizingMethod::Kelly {
            win_rate,
            payoff_ratio,
            kelly_fraction,
        } => {
            if *payoff_ratio <= 0.0 {
                0.0
            } else {
                let f = win_rate - (1.0 - win_rate) / payoff_ratio;
                let f = (f * kelly_fraction).clamp(0.0, constraints.max_position_pct);
                account_balance * f / entry
            }
        }
        SizingMethod::VolatilityAdjusted {
            target_vol,
            current_vol,
            base_pct,
        } => {
            let scale = if *current_vol > 0.0 {
                target_vol / current_vol
            } else {
                1.0
            };
            account_balance * base_pct * scale / entry
        }
        SizingMethod::EquityPercentage { pct } => account_balance * pct.max(0.0) / entry,
    };

    let max_notional =
        account_balance * constraints.max_position_pct.max(0.0) * constraints.max_leverage.max(0.0);
    let size = raw_size.min(max_notional / entry).max(0.0);
    let notional = size * entry;

    let risk_amount = stop_loss.map_or(0.0, |stop| size * (entry - stop).abs());
    let risk_pct = risk_amount / account_balance;

    PositionSize {
        size,
        notional,
        risk_amount,
        risk_pct,
    }
}

fn zero() -> PositionSize {
    PositionSize {
        size: 0.0,
        notional: 0.0,
        risk_amount: 0.0,
        risk_pct: 0.0,
    }
}
