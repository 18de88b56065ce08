//! Optional execution-cost overlay.
//!
//! When enabled, nominal orders are transformed before the broker records
//! them: tiered maker/taker fees replace the flat fee rate, fills slip
//! adversely per the configured model, and perpetual positions pay (or
//! receive) funding whenever they are held across an 8-hour boundary.
//! When disabled the broker's own flat `fee_rate` applies and all of this
//! is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Direction, Position};
use crate::market::series::{Candle, FundingPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Which way an order aggresses: buys slip up, sells slip down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    fn adverse_sign(self) -> f64 {
        match self {
            OrderSide::Buy => 1.0,
            OrderSide::Sell => -1.0,
        }
    }
}

/// Maker/taker schedule with a VIP-tier discount ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Maker fee in basis points.
    pub maker_bps: f64,
    /// Taker fee in basis points.
    pub taker_bps: f64,
    /// VIP tier, 0 (retail) through 4.
    pub vip_tier: u8,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            maker_bps: 2.0,
            taker_bps: 5.0,
            vip_tier: 0,
        }
    }
}

const VIP_DISCOUNTS: [f64; 5] = [1.0, 0.9, 0.8, 0.7, 0.6];

impl FeeSchedule {
    /// Fee rate (a fraction, not bps) for the given order type at this tier.
    pub fn rate(&self, order_type: OrderType) -> f64 {
        let bps = match order_type {
            OrderType::Market => self.taker_bps,
            OrderType::Limit => self.maker_bps,
        };
        let discount = VIP_DISCOUNTS[usize::from(self.vip_tier).min(VIP_DISCOUNTS.len() - 1)];
        bps * discount / 10_000.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum SlippageModel {
    /// Flat adverse adjustment in basis points.
    Fixed { bps: f64 },
    /// Impact grows with order notional relative to the bar's traded value.
    Adaptive { impact_bps: f64 },
    /// Stepwise bps by order-to-bar volume ratio: `(ratio_ceiling, bps)`
    /// tiers, first matching tier wins.
    VolumeWeighted { tiers: Vec<(f64, f64)> },
    /// Base bps scaled by realized volatility over a trailing window
    /// relative to a baseline.
    VolatilityAdjusted {
        bps: f64,
        baseline_vol: f64,
        window: usize,
    },
}

impl Default for SlippageModel {
    fn default() -> Self {
        SlippageModel::Fixed { bps: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub fees: FeeSchedule,
    pub slippage: SlippageModel,
    /// Apply funding transfers at 8h boundaries when a funding series is
    /// loaded.
    pub apply_funding: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fees: FeeSchedule::default(),
            slippage: SlippageModel::default(),
            apply_funding: true,
        }
    }
}

/// A nominal order after cost transformation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionResult {
    pub fill_price: f64,
    pub fee_rate: f64,
}

#[derive(Debug, Clone)]
pub struct ExecutionModel {
    config: ExecutionConfig,
}

impl ExecutionModel {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    pub fn apply_funding(&self) -> bool {
        self.config.apply_funding
    }

    pub fn fee_rate(&self, order_type: OrderType) -> f64 {
        self.config.fees.rate(order_type)
    }

    /// Transform a nominal order into its executed form. `i` indexes the
    /// current bar within `candles`; `approx_notional` is the order's
    /// estimated quote value for impact models. Limit orders do not slip.
    pub fn execute(
        &self,
        side: OrderSide,
        order_type: OrderType,
        price: f64,
        i: usize,
        candles: &[Candle],
        approx_notional: f64,
    ) -> ExecutionResult {
        let fee_rate = self.fee_rate(order_type);
        if order_type == OrderType::Limit {
            return ExecutionResult {
                fill_price: price,
                fee_rate,
            };
        }
        let bps = self.slip_bps(i, candles, approx_notional);
        let fill_price = price * (1.0 + side.adverse_sign() * bps / 10_000.0);
        ExecutionResult {
            fill_price,
            fee_rate,
        }
    }

    fn slip_bps(&self, i: usize, candles: &[Candle], approx_notional: f64) -> f64 {
        match &self.config.slippage {
            SlippageModel::Fixed { bps } => *bps,
            SlippageModel::Adaptive { impact_bps } => {
                let bar_value = candles
                    .get(i)
                    .map_or(0.0, |c| c.volume * c.close);
                if bar_value > 0.0 {
                    impact_bps * (approx_notional / bar_value).min(1.0) * 100.0
                } else {
                    *impact_bps
                }
            }
            SlippageModel::VolumeWeighted { tiers } => {
                let bar_value = candles
                    .get(i)
                    .map_or(0.0, |c| c.volume * c.close);
                let ratio = if bar_value > 0.0 {
                    approx_notional / bar_value
                } else {
                    f64::INFINITY
                };
                tiers
                    .iter()
                    .find(|(ceiling, _)| ratio <= *ceiling)
                    .or_else(|| tiers.last())
                    .map_or(0.0, |(_, bps)| *bps)
            }
            SlippageModel::VolatilityAdjusted {
                bps,
                baseline_vol,
                window,
            } => {
                let start = i.saturating_sub(*window);
                let closes: Vec<f64> = candles[start..=i.min(candles.len() - 1)]
                    .iter()
                    .map(|c| c.close)
                    .collect();
                let returns: Vec<f64> = closes
                    .windows(2)
                    .filter(|w| w[0] > 0.0)
                    .map(|w| (w[1] - w[0]) / w[0])
                    .collect();
                let vol = crate::engine::metrics::std_dev(&returns);
                if vol.is_finite() && *baseline_vol > 0.0 {
                    bps * (vol / baseline_vol)
                } else {
                    *bps
                }
            }
        }
    }

    /// Funding owed by the position for every boundary crossed in
    /// `(prev_ts, now_ts]`. Positive = paid by the account (long paying a
    /// positive rate); negative = received.
    pub fn funding_due(
        &self,
        position: &Position,
        prev_ts: Option<DateTime<Utc>>,
        now_ts: DateTime<Utc>,
        mark_price: f64,
        funding: Option<&[FundingPoint]>,
    ) -> f64 {
        if !self.config.apply_funding {
            return 0.0;
        }
        let Some(funding) = funding else {
            return 0.0;
        };
        let window_start = prev_ts.unwrap_or(position.entry_time);

        let from = funding.partition_point(|p| p.ts <= window_start);
        let to = funding.partition_point(|p| p.ts <= now_ts);

        let notional = position.size * mark_price;
        let sign = match position.direction {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        };
        funding[from..to]
            .iter()
            .map(|p| notional * p.rate * sign)
            .sum()
    }
}
