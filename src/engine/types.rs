use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

/// Position direction. A flat book is represented by the absence of a
/// [`Position`], never by a zero-size position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

/// Broker knobs for one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BrokerConfig {
    #[garde(range(min = 0.01))]
    pub initial_cash: f64,
    /// Fee charged on notional at both open and close.
    #[garde(range(min = 0.0, max = 0.1))]
    pub fee_rate: f64,
    #[garde(range(min = 1.0, max = 125.0))]
    pub leverage: f64,
    #[garde(range(min = 0.0, max = 0.5))]
    pub maintenance_margin_rate: f64,
    /// Optional adverse fill adjustment applied to SL/TP trigger fills.
    #[garde(range(min = 0.0, max = 0.05))]
    pub slippage_rate: f64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            initial_cash: 10_000.0,
            fee_rate: 0.0004,
            leverage: 1.0,
            maintenance_margin_rate: 0.005,
            slippage_rate: 0.0,
        }
    }
}

/// An open position. At most one exists per broker at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub direction: Direction,
    pub entry_price: f64,
    /// Base-asset quantity, always positive.
    pub size: f64,
    pub leverage: f64,
    pub entry_time: DateTime<Utc>,
    pub sl_price: Option<f64>,
    pub tp_price: Option<f64>,
    pub liq_price: Option<f64>,
    pub entry_reason: String,
    /// Index into the equity curve at entry; holding time in bars is the
    /// number of marks since.
    pub entry_bar: usize,
    /// Fee already paid on open, folded into the trade record at close.
    pub entry_fee: f64,
    /// Most adverse price observed since entry (lowest low for longs).
    pub worst_price: f64,
    /// Most favourable price observed since entry.
    pub best_price: f64,
}

impl Position {
    /// Margin posted for this position.
    pub fn margin(&self) -> f64 {
        self.size * self.entry_price / self.leverage
    }

    /// Price-move PnL at `price`, before fees.
    pub fn unrealized(&self, price: f64) -> f64 {
        self.size * (price - self.entry_price) * self.direction.sign()
    }

    /// Mark-to-market value: posted margin plus unrealized PnL.
    pub fn value(&self, price: f64) -> f64 {
        self.margin() + self.unrealized(price)
    }

    /// Maximum adverse excursion as a percentage of entry price.
    pub fn mae_pct(&self) -> f64 {
        (self.worst_price - self.entry_price) / self.entry_price * self.direction.sign() * 100.0
    }

    /// Maximum favourable excursion as a percentage of entry price.
    pub fn mfe_pct(&self) -> f64 {
        (self.best_price - self.entry_price) / self.entry_price * self.direction.sign() * 100.0
    }
}

/// A closed round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub direction: Direction,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub leverage: f64,
    /// Total fees for the round trip (open + close).
    pub fee: f64,
    /// Net PnL after fees.
    pub pnl_abs: f64,
    /// Net PnL as a percentage of posted margin.
    pub pnl_pct: f64,
    pub entry_reason: String,
    pub exit_reason: String,
    pub holding_bars: usize,
    pub mae_pct: f64,
    pub mfe_pct: f64,
    pub equity_after: f64,
    pub is_liquidation: bool,
}

/// One mark-to-market observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: DateTime<Utc>,
    pub equity: f64,
}

/// Forced closure record, kept alongside the corresponding trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub ts: DateTime<Utc>,
    pub direction: Direction,
    pub size: f64,
    pub price: f64,
    /// Margin lost in the liquidation, net of the residual returned.
    pub loss: f64,
}

/// Outcome of a broker order. Rejections are values, not errors: the inner
/// engine loop never throws on a business condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOutcome {
    Filled,
    /// Margin plus fee exceeded available cash.
    RejectedInsufficientFunds,
    /// An order that requires a flat book arrived while a position was open,
    /// or vice versa.
    RejectedInvalidState,
}

impl OrderOutcome {
    pub fn is_filled(self) -> bool {
        matches!(self, OrderOutcome::Filled)
    }
}

/// Statistics computed from the equity curve and trade log. Division guards
/// yield NaN or infinity as documented on each field, never panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annualized_return: f64,
    /// Peak-to-trough fraction of the equity curve, reported positive.
    pub max_drawdown: f64,
    /// Bars spent inside the longest drawdown.
    pub max_drawdown_duration: usize,
    pub volatility: f64,
    pub annualized_volatility: f64,
    /// NaN when the equity curve is constant.
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub var_95: f64,
    pub var_99: f64,
    pub cvar_95: f64,
    pub cvar_99: f64,
    pub num_trades: usize,
    /// NaN when there are no trades; likewise for the remaining trade stats.
    pub win_rate: f64,
    pub avg_win: f64,
    /// Mean losing-trade PnL, a negative number.
    pub avg_loss: f64,
    pub win_loss_ratio: f64,
    /// +inf when every trade won, NaN with no trades.
    pub profit_factor: f64,
    pub expectancy: f64,
    pub max_consecutive_wins: usize,
    pub max_consecutive_losses: usize,
}

/// Everything a single backtest run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub equity_curve: Vec<EquityPoint>,
    pub trade_log: Vec<Trade>,
    pub metrics: PerformanceMetrics,
    pub liquidation_events: Vec<LiquidationEvent>,
    pub final_cash: f64,
    pub final_equity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn position(direction: Direction, entry: f64, size: f64, leverage: f64) -> Position {
        Position {
            direction,
            entry_price: entry,
            size,
            leverage,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
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
    fn long_unrealized_pnl() {
        let p = position(Direction::Long, 100.0, 2.0, 1.0);
        assert!((p.unrealized(105.0) - 10.0).abs() < 1e-10);
        assert!((p.unrealized(95.0) - (-10.0)).abs() < 1e-10);
    }

    #[test]
    fn short_unrealized_pnl() {
        let p = position(Direction::Short, 100.0, 2.0, 1.0);
        assert!((p.unrealized(95.0) - 10.0).abs() < 1e-10);
        assert!((p.unrealized(105.0) - (-10.0)).abs() < 1e-10);
    }

    #[test]
    fn margin_scales_with_leverage() {
        let p = position(Direction::Long, 100.0, 1.0, 10.0);
        assert!((p.margin() - 10.0).abs() < 1e-10);
        // value at entry equals margin
        assert!((p.value(100.0) - 10.0).abs() < 1e-10);
    }

    #[test]
    fn excursions_signed_by_direction() {
        let mut p = position(Direction::Long, 100.0, 1.0, 1.0);
        p.worst_price = 95.0;
        p.best_price = 110.0;
        assert!((p.mae_pct() - (-5.0)).abs() < 1e-10);
        assert!((p.mfe_pct() - 10.0).abs() < 1e-10);

        let mut s = position(Direction::Short, 100.0, 1.0, 1.0);
        s.worst_price = 104.0; // adverse for a short is a higher price
        s.best_price = 90.0;
        assert!((s.mae_pct() - (-4.0)).abs() < 1e-10);
        assert!((s.mfe_pct() - 10.0).abs() < 1e-10);
    }

    #[test]
    fn broker_config_validation() {
        let cfg = BrokerConfig::default();
        assert!(cfg.validate().is_ok());

        let bad = BrokerConfig {
            leverage: 0.0,
            ..BrokerConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = BrokerConfig {
            fee_rate: -0.01,
            ..BrokerConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
