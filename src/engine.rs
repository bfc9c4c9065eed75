//! Signal execution
//!
//! The `Coordinator` is the only writer of risk state. Both the backtester and
//! the live session push ticks and Entry signals through it in the order they
//! are accepted, so `DayRiskState` transitions are applied atomically and in
//! sequence.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::{DataIssue, OrderError};
use crate::ports::{OrderPort, OrderRequest};
use crate::risk::{EntryDecision, RejectReason, RiskManager};
use crate::{
    DayRiskState, ExitReason, GapCandidate, Position, Side, Signal, Symbol, Tick, Trade,
};

/// Entry discarded by the risk manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedEntry {
    pub symbol: Symbol,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub reason: RejectReason,
}

/// Order the port could not fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFailure {
    pub symbol: Symbol,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
    pub error: OrderError,
}

/// Everything that happened in one trading session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub date: NaiveDate,
    pub candidates: Vec<GapCandidate>,
    pub trades: Vec<Trade>,
    /// Snapshot of the day's risk state after every closed trade
    pub risk_trajectory: Vec<DayRiskState>,
    pub final_state: DayRiskState,
    pub rejected_entries: Vec<RejectedEntry>,
    pub order_failures: Vec<OrderFailure>,
    pub data_gaps: Vec<Symbol>,
    pub dropped_ticks: usize,
    /// Positions still open after the forced EOD exit (exit order failed)
    pub open_positions: Vec<Position>,
    pub starting_capital: f64,
    pub ending_capital: f64,
}

impl SessionReport {
    fn new(date: NaiveDate, candidates: Vec<GapCandidate>, capital: f64) -> Self {
        SessionReport {
            date,
            candidates,
            trades: Vec::new(),
            risk_trajectory: Vec::new(),
            final_state: DayRiskState::default(),
            rejected_entries: Vec::new(),
            order_failures: Vec::new(),
            data_gaps: Vec::new(),
            dropped_ticks: 0,
            open_positions: Vec::new(),
            starting_capital: capital,
            ending_capital: capital,
        }
    }

    pub fn total_pnl(&self) -> f64 {
        self.trades.iter().map(|t| t.pnl_abs).sum()
    }
}

/// Single owner of the `RiskManager` and the `OrderPort`
pub struct Coordinator<O: OrderPort> {
    risk: RiskManager,
    orders: O,
    report: SessionReport,
    /// Last accepted `(price, timestamp)` per symbol this session
    last_quotes: HashMap<Symbol, (f64, DateTime<Utc>)>,
}

impl<O: OrderPort> Coordinator<O> {
    pub fn new(risk: RiskManager, orders: O) -> Self {
        let capital = risk.capital();
        Coordinator {
            risk,
            orders,
            report: SessionReport::new(NaiveDate::default(), Vec::new(), capital),
            last_quotes: HashMap::new(),
        }
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn orders(&self) -> &O {
        &self.orders
    }

    /// Report under construction for the current session
    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    pub fn entries_allowed(&self) -> bool {
        self.risk.accepts_entries()
    }

    /// Reset daily limits and start a fresh report
    pub fn begin_session(&mut self, date: NaiveDate, candidates: Vec<GapCandidate>) {
        self.risk.start_session();
        info!(
            %date,
            candidates = candidates.len(),
            capital = self.risk.capital(),
            "Session started"
        );
        self.report = SessionReport::new(date, candidates, self.risk.capital());
        self.last_quotes.clear();
    }

    pub fn record_issue(&mut self, issue: DataIssue) {
        match issue {
            DataIssue::DataGap { symbol } => {
                if !self.report.data_gaps.contains(&symbol) {
                    self.report.data_gaps.push(symbol);
                }
            }
            DataIssue::ClockSkew { .. } | DataIssue::InvalidTick { .. } => {
                self.report.dropped_ticks += 1;
            }
        }
    }

    /// Accepted tick: mark the price and run exit evaluation for the symbol
    pub fn on_tick(&mut self, symbol: &Symbol, tick: &Tick) {
        self.last_quotes
            .insert(symbol.clone(), (tick.price, tick.timestamp));

        for exit in self.risk.evaluate_exits(symbol, tick) {
            self.execute_exit(&exit);
        }
    }

    /// Entry signal from an evaluator. `range_low` feeds range-low stops.
    pub fn on_entry(&mut self, signal: &Signal, range_low: Option<f64>) {
        let plan = match self.risk.evaluate_entry(signal, range_low) {
            EntryDecision::Accept(plan) => plan,
            EntryDecision::Reject(reason) => {
                if let Signal::Entry {
                    symbol,
                    reference_price,
                    timestamp,
                } = signal
                {
                    self.report.rejected_entries.push(RejectedEntry {
                        symbol: symbol.clone(),
                        price: *reference_price,
                        timestamp: *timestamp,
                        reason,
                    });
                }
                return;
            }
        };

        let order = OrderRequest {
            symbol: plan.symbol.clone(),
            side: Side::Buy,
            size: plan.size,
            reference_price: plan.reference_price,
            timestamp: plan.timestamp,
        };
        match self.orders.submit_market_order(&order) {
            Ok(fill) => {
                self.risk.open_position(&plan, &fill);
            }
            Err(e) => self.record_order_failure(&order, e),
        }
    }

    fn record_order_failure(&mut self, order: &OrderRequest, error: OrderError) {
        warn!(symbol = %order.symbol, side = ?order.side, "Order failed: {}", error);
        self.report.order_failures.push(OrderFailure {
            symbol: order.symbol.clone(),
            side: order.side,
            timestamp: order.timestamp,
            error,
        });
    }

    fn execute_exit(&mut self, signal: &Signal) {
        let Signal::Exit {
            position_id,
            symbol,
            reason,
            reference_price,
            timestamp,
        } = signal
        else {
            return;
        };
        let Some(size) = self.risk.position(*position_id).map(|p| p.size) else {
            return;
        };

        let order = OrderRequest {
            symbol: symbol.clone(),
            side: Side::Sell,
            size,
            reference_price: *reference_price,
            timestamp: *timestamp,
        };
        let fill = match self.orders.submit_market_order(&order) {
            Ok(fill) => fill,
            Err(e) => {
                // Position stays open; exit evaluation retries on the next tick
                self.record_order_failure(&order, e);
                return;
            }
        };

        let Some(closed) = self.risk.close_position(*position_id, &fill, *reason) else {
            return;
        };
        self.report.trades.push(closed.trade);
        self.report.risk_trajectory.push(self.risk.day_state().clone());

        if closed.blocked.is_some() && self.risk.config().flatten_on_block {
            let at = *timestamp;
            let quotes = self.last_quotes.clone();
            let flatten = self.risk.force_exit_signals(ExitReason::KillSwitch, at, |s| {
                quotes.get(s).map(|(price, _)| (*price, at))
            });
            for exit in flatten {
                self.execute_exit(&exit);
            }
        }
    }

    /// Force EOD exits at each symbol's last observed print and hand back
    /// the report
    pub fn finish_session(&mut self, session_close: DateTime<Utc>) -> SessionReport {
        let quotes = self.last_quotes.clone();
        let eod = self.risk.force_exit_signals(ExitReason::Eod, session_close, |s| {
            quotes
                .get(s)
                .map(|(price, ts)| (*price, (*ts).min(session_close)))
        });
        for exit in eod {
            self.execute_exit(&exit);
        }

        self.report.final_state = self.risk.day_state().clone();
        self.report.open_positions = self.risk.open_positions().cloned().collect();
        self.report.ending_capital = self.risk.capital();

        info!(
            date = %self.report.date,
            trades = self.report.trades.len(),
            status = ?self.report.final_state.status,
            pnl = self.report.total_pnl(),
            "Session finished"
        );
        let next = SessionReport::new(self.report.date, Vec::new(), self.risk.capital());
        std::mem::replace(&mut self.report, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::ports::SimulatedBroker;
    use crate::{BlockReason, RiskStatus};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 11, 14, 30, 0).unwrap() + Duration::minutes(minutes)
    }

    fn tick(minutes: i64, price: f64) -> Tick {
        Tick {
            timestamp: t(minutes),
            price,
            volume: 100.0,
        }
    }

    fn entry(symbol: &str, minutes: i64, price: f64) -> Signal {
        Signal::Entry {
            symbol: Symbol::new(symbol),
            reference_price: price,
            timestamp: t(minutes),
        }
    }

    fn coordinator(risk: RiskConfig, broker: SimulatedBroker) -> Coordinator<SimulatedBroker> {
        let mut c = Coordinator::new(risk.build(), broker);
        c.begin_session(NaiveDate::from_ymd_opt(2024, 1, 11).unwrap(), Vec::new());
        c
    }

    #[test]
    fn test_entry_then_target_exit() {
        let mut c = coordinator(RiskConfig::default(), SimulatedBroker::new(0.0));
        let x = Symbol::new("X");
        c.on_entry(&entry("X", 6, 10.0), None);
        assert_eq!(c.risk().open_position_count(), 1);

        c.on_tick(&x, &tick(10, 10.5));
        c.on_tick(&x, &tick(20, 10.9));
        let report = c.finish_session(t(390));

        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].reason, ExitReason::Target);
        assert_relative_eq!(report.trades[0].pnl_pct, 0.09, epsilon = 1e-9);
        assert_eq!(report.final_state.trades_closed, 1);
        assert_eq!(report.final_state.status, RiskStatus::Active);
        assert_eq!(report.risk_trajectory.len(), 1);
    }

    #[test]
    fn test_rejected_order_leaves_state_untouched() {
        let broker = SimulatedBroker::new(0.0).rejecting(Symbol::new("X"));
        let mut c = coordinator(RiskConfig::default(), broker);
        c.on_entry(&entry("X", 6, 10.0), None);

        assert_eq!(c.risk().open_position_count(), 0);
        let report = c.finish_session(t(390));
        assert_eq!(report.order_failures.len(), 1);
        assert_eq!(report.final_state, DayRiskState::default());
        assert!(report.trades.is_empty());
    }

    #[test]
    fn test_failed_exit_keeps_position_open() {
        let mut c = coordinator(RiskConfig::default(), SimulatedBroker::new(0.0));
        c.on_entry(&entry("X", 6, 10.0), None);
        c.orders = SimulatedBroker::new(0.0).rejecting(Symbol::new("X"));

        c.on_tick(&Symbol::new("X"), &tick(10, 9.0));
        let report = c.finish_session(t(390));
        assert!(report.trades.is_empty());
        assert_eq!(report.open_positions.len(), 1);
        assert_eq!(report.final_state.trades_closed, 0);
        // stop exit and the forced EOD exit both failed
        assert_eq!(report.order_failures.len(), 2);
    }

    #[test]
    fn test_entries_rejected_after_block_are_reported() {
        let mut c = coordinator(RiskConfig::default(), SimulatedBroker::new(0.0));
        c.on_entry(&entry("X", 6, 10.0), None);
        c.on_tick(&Symbol::new("X"), &tick(8, 9.4));
        assert!(!c.entries_allowed());

        c.on_entry(&entry("Y", 9, 20.0), None);
        let report = c.finish_session(t(390));
        assert_eq!(report.final_state.blocked_by, Some(BlockReason::FirstLoss));
        assert_eq!(report.rejected_entries.len(), 1);
        assert_eq!(report.rejected_entries[0].reason, RejectReason::Blocked);
        assert_eq!(report.trades.len(), 1);
    }

    #[test]
    fn test_eod_closes_at_last_price() {
        let mut c = coordinator(RiskConfig::default(), SimulatedBroker::new(0.0));
        c.on_entry(&entry("X", 6, 10.0), None);
        c.on_tick(&Symbol::new("X"), &tick(30, 10.2));
        let report = c.finish_session(t(390));
        assert_eq!(report.trades[0].reason, ExitReason::Eod);
        assert_eq!(report.trades[0].exit_price, 10.2);
        assert_eq!(report.trades[0].exit_time, t(30));
    }

    #[test]
    fn test_eod_exit_uses_each_symbols_last_print() {
        let mut c = coordinator(RiskConfig::default(), SimulatedBroker::new(0.0));
        let (a, b) = (Symbol::new("A"), Symbol::new("B"));
        c.on_entry(&entry("A", 6, 10.0), None);
        c.on_entry(&entry("B", 7, 20.0), None);
        c.on_tick(&a, &tick(10, 10.1));
        c.on_tick(&b, &tick(120, 20.1));
        c.on_tick(&b, &tick(200, 20.2));

        let report = c.finish_session(t(390));
        let exit_of = |symbol: &Symbol| {
            let trade = report.trades.iter().find(|tr| &tr.symbol == symbol).unwrap();
            (trade.exit_price, trade.exit_time)
        };
        assert_eq!(exit_of(&a), (10.1, t(10)));
        assert_eq!(exit_of(&b), (20.2, t(200)));
    }

    #[test]
    fn test_flatten_on_block_closes_other_positions() {
        let risk = RiskConfig::default()
            .with_max_trades(3)
            .with_flatten_on_block(true);
        let mut c = coordinator(risk, SimulatedBroker::new(0.0));
        c.on_entry(&entry("A", 6, 10.0), None);
        c.on_entry(&entry("B", 7, 20.0), None);
        c.on_tick(&Symbol::new("B"), &tick(8, 20.5));
        c.on_tick(&Symbol::new("A"), &tick(9, 9.0));

        let report = c.finish_session(t(390));
        assert_eq!(report.trades.len(), 2);
        assert_eq!(report.trades[0].reason, ExitReason::Stop);
        assert_eq!(report.trades[1].reason, ExitReason::KillSwitch);
        assert_eq!(report.trades[1].exit_price, 20.5);
    }

    #[test]
    fn test_capital_carries_into_next_session() {
        let mut c = coordinator(RiskConfig::default(), SimulatedBroker::new(0.0));
        c.on_entry(&entry("X", 6, 10.0), None);
        c.on_tick(&Symbol::new("X"), &tick(10, 10.9));
        let first = c.finish_session(t(390));

        c.begin_session(NaiveDate::from_ymd_opt(2024, 1, 12).unwrap(), Vec::new());
        assert_eq!(c.report().starting_capital, first.ending_capital);
        assert!(first.ending_capital > first.starting_capital);
        assert!(c.entries_allowed());
    }
}
