//! Simulated margin broker for a single backtest run.
//!
//! Holds cash, at most one open position, and the run's trade and equity
//! logs. Orders that cannot be honoured are rejected through
//! [`OrderOutcome`] values; the broker never panics or errors on a business
//! condition.
//!
//! Margin accounting: opening a position moves `size * entry / leverage`
//! from cash into the position and charges the fee on notional. Equity at
//! any price is `cash + margin + unrealized`, so the account is flat through
//! an open (minus the fee).

use chrono::{DateTime, Utc};

use super::types::{
    BrokerConfig, Direction, EquityPoint, LiquidationEvent, OrderOutcome, Position, Trade,
};

/// Tolerance when comparing cash requirements against available cash.
const CASH_EPS: f64 = 1e-9;

#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    cash: f64,
    position: Option<Position>,
    equity_curve: Vec<EquityPoint>,
    trade_log: Vec<Trade>,
    liquidation_events: Vec<LiquidationEvent>,
    fees_paid: f64,
    funding_paid: f64,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let cash = config.initial_cash;
        Self {
            config,
            cash,
            position: None,
            equity_curve: Vec::new(),
            trade_log: Vec::new(),
            liquidation_events: Vec::new(),
            fees_paid: 0.0,
            funding_paid: 0.0,
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Replace the flat fee rate, used when an execution-cost overlay
    /// supplies tiered maker/taker fees.
    pub fn set_fee_rate(&mut self, fee_rate: f64) {
        self.config.fee_rate = fee_rate;
    }

    pub fn trade_log(&self) -> &[Trade] {
        &self.trade_log
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn liquidation_events(&self) -> &[LiquidationEvent] {
        &self.liquidation_events
    }

    pub fn fees_paid(&self) -> f64 {
        self.fees_paid
    }

    pub fn funding_paid(&self) -> f64 {
        self.funding_paid
    }

    /// Mark-to-market equity at `price`.
    pub fn equity(&self, price: f64) -> f64 {
        match &self.position {
            Some(pos) => self.cash + pos.value(price),
            None => self.cash,
        }
    }

    fn liquidation_price(&self, direction: Direction, entry: f64) -> f64 {
        let lev = self.config.leverage;
        let mmr = self.config.maintenance_margin_rate;
        match direction {
            Direction::Long => entry * (1.0 - 1.0 / lev + mmr),
            Direction::Short => entry * (1.0 + 1.0 / lev - mmr),
        }
    }

    fn open(
        &mut self,
        direction: Direction,
        size: f64,
        price: f64,
        time: DateTime<Utc>,
        reason: &str,
    ) -> OrderOutcome {
        if self.position.is_some() {
            return OrderOutcome::RejectedInvalidState;
        }
        if size <= 0.0 || price <= 0.0 {
            return OrderOutcome::RejectedInvalidState;
        }

        let margin = size * price / self.config.leverage;
        let fee = size * price * self.config.fee_rate;
        if margin + fee > self.cash + CASH_EPS {
            return OrderOutcome::RejectedInsufficientFunds;
        }

        self.cash -= margin + fee;
        self.fees_paid += fee;
        self.position = Some(Position {
            direction,
            entry_price: price,
            size,
            leverage: self.config.leverage,
            entry_time: time,
            sl_price: None,
            tp_price: None,
            liq_price: Some(self.liquidation_price(direction, price)),
            entry_reason: reason.to_string(),
            entry_bar: self.equity_curve.len(),
            entry_fee: fee,
            worst_price: price,
            best_price: price,
        });
        OrderOutcome::Filled
    }

    /// Open a long when flat, or close an open short.
    pub fn buy(&mut self, size: f64, price: f64, time: DateTime<Utc>, reason: &str) -> OrderOutcome {
        match self.position.as_ref().map(|p| p.direction) {
            None => self.open(Direction::Long, size, price, time, reason),
            Some(Direction::Short) => {
                self.close(price, time, reason);
                OrderOutcome::Filled
            }
            Some(Direction::Long) => OrderOutcome::RejectedInvalidState,
        }
    }

    /// Open a short when flat, or close an open long.
    pub fn sell(&mut self, size: f64, price: f64, time: DateTime<Utc>, reason: &str) -> OrderOutcome {
        match self.position.as_ref().map(|p| p.direction) {
            None => self.open(Direction::Short, size, price, time, reason),
            Some(Direction::Long) => {
                self.close(price, time, reason);
                OrderOutcome::Filled
            }
            Some(Direction::Short) => OrderOutcome::RejectedInvalidState,
        }
    }

    fn size_for_full_equity(&self, price: f64) -> f64 {
        let lev = self.config.leverage;
        let fee = self.config.fee_rate;
        let sized = self.cash * lev / (price * (1.0 + fee));
        // The nominal sizing ignores that the fee is charged on the levered
        // notional; clamp so margin + fee never exceeds cash.
        let affordable = self.cash / (price * (1.0 / lev + fee));
        sized.min(affordable)
    }

    /// Open a long consuming effectively the full equity. Requires a flat book.
    pub fn buy_all(&mut self, price: f64, time: DateTime<Utc>, reason: &str) -> OrderOutcome {
        if self.position.is_some() {
            return OrderOutcome::RejectedInvalidState;
        }
        let size = self.size_for_full_equity(price);
        if size <= 0.0 {
            return OrderOutcome::RejectedInsufficientFunds;
        }
        self.open(Direction::Long, size, price, time, reason)
    }

    /// Open a short consuming effectively the full equity. Requires a flat book.
    pub fn short_all(&mut self, price: f64, time: DateTime<Utc>, reason: &str) -> OrderOutcome {
        if self.position.is_some() {
            return OrderOutcome::RejectedInvalidState;
        }
        let size = self.size_for_full_equity(price);
        if size <= 0.0 {
            return OrderOutcome::RejectedInsufficientFunds;
        }
        self.open(Direction::Short, size, price, time, reason)
    }

    /// Alias for [`Broker::short_all`], matching the long-side naming.
    pub fn sell_all(&mut self, price: f64, time: DateTime<Utc>, reason: &str) -> OrderOutcome {
        self.short_all(price, time, reason)
    }

    /// Attach a stop-loss to the open position.
    pub fn set_stop_loss(&mut self, price: f64) {
        if let Some(pos) = self.position.as_mut() {
            pos.sl_price = Some(price);
        }
    }

    /// Attach a take-profit to the open position.
    pub fn set_take_profit(&mut self, price: f64) {
        if let Some(pos) = self.position.as_mut() {
            pos.tp_price = Some(price);
        }
    }

    /// Track intrabar extremes against the open position for MAE/MFE.
    pub fn observe_bar(&mut self, low: f64, high: f64) {
        if let Some(pos) = self.position.as_mut() {
            match pos.direction {
                Direction::Long => {
                    pos.worst_price = pos.worst_price.min(low);
                    pos.best_price = pos.best_price.max(high);
                }
                Direction::Short => {
                    pos.worst_price = pos.worst_price.max(high);
                    pos.best_price = pos.best_price.min(low);
                }
            }
        }
    }

    /// Realize the open position at `price` and record the trade.
    /// Returns `None` when the book is flat.
    pub fn close(&mut self, price: f64, time: DateTime<Utc>, reason: &str) -> Option<&Trade> {
        self.close_inner(price, time, reason, false)
    }

    /// Force-close at the liquidation price. The trade is flagged and a
    /// liquidation event is recorded; residual cash is floored at zero.
    pub fn liquidate(&mut self, price: f64, time: DateTime<Utc>) -> Option<&Trade> {
        self.close_inner(price, time, "liquidation", true)
    }

    fn close_inner(
        &mut self,
        price: f64,
        time: DateTime<Utc>,
        reason: &str,
        is_liquidation: bool,
    ) -> Option<&Trade> {
        let mut pos = self.position.take()?;

        // The exit price itself is an observed extreme.
        match pos.direction {
            Direction::Long => {
                pos.worst_price = pos.worst_price.min(price);
                pos.best_price = pos.best_price.max(price);
            }
            Direction::Short => {
                pos.worst_price = pos.worst_price.max(price);
                pos.best_price = pos.best_price.min(price);
            }
        }

        let gross = pos.unrealized(price);
        let exit_fee = pos.size * price * self.config.fee_rate;
        self.fees_paid += exit_fee;
        self.cash += pos.margin() + gross - exit_fee;
        if is_liquidation && self.cash < 0.0 {
            self.cash = 0.0;
        }

        let pnl_abs = gross - exit_fee - pos.entry_fee;
        let margin = pos.margin();
        let pnl_pct = if margin > 0.0 {
            pnl_abs / margin * 100.0
        } else {
            f64::NAN
        };

        if is_liquidation {
            self.liquidation_events.push(LiquidationEvent {
                ts: time,
                direction: pos.direction,
                size: pos.size,
                price,
                loss: -pnl_abs,
            });
        }

        let trade = Trade {
            entry_time: pos.entry_time,
            exit_time: time,
            direction: pos.direction,
            entry_price: pos.entry_price,
            exit_price: price,
            size: pos.size,
            leverage: pos.leverage,
            fee: pos.entry_fee + exit_fee,
            pnl_abs,
            pnl_pct,
            entry_reason: pos.entry_reason.clone(),
            exit_reason: reason.to_string(),
            holding_bars: self.equity_curve.len().saturating_sub(pos.entry_bar),
            mae_pct: pos.mae_pct(),
            mfe_pct: pos.mfe_pct(),
            equity_after: self.cash,
            is_liquidation,
        };
        self.trade_log.push(trade);
        self.trade_log.last()
    }

    /// Append one equity observation at the bar close.
    pub fn mark_to_market(&mut self, price: f64, ts: DateTime<Utc>) {
        let equity = self.equity(price);
        self.equity_curve.push(EquityPoint { ts, equity });
    }

    /// Record an initial equity observation before any bar is processed.
    pub fn mark_initial(&mut self, ts: DateTime<Utc>) {
        self.equity_curve.push(EquityPoint {
            ts,
            equity: self.cash,
        });
    }

    /// Apply a funding transfer. Positive `amount` is paid by the account.
    pub fn apply_funding(&mut self, amount: f64) {
        self.cash -= amount;
        self.funding_paid += amount;
    }

    /// Consume the broker, yielding its logs and final cash.
    pub fn finish(
        self,
    ) -> (
        Vec<EquityPoint>,
        Vec<Trade>,
        Vec<LiquidationEvent>,
        f64,
    ) {
        (
            self.equity_curve,
            self.trade_log,
            self.liquidation_events,
            self.cash,
        )
    }
}
