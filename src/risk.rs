//! Risk management and the daily kill switch
//!
//! The `RiskManager` is the single owner of the day's `DayRiskState` and of
//! every open `Position`. Entries are accepted only while the day is
//! `Active`; exits are evaluated for open positions regardless of state.
//!
//! Kill-switch transitions (Active → Blocked, irreversible for the session):
//! - `trades_closed` reaches `max_trades_per_day`
//! - any closed trade with `pnl_pct < 0` (when `stop_after_first_loss`)
//! - `cumulative_pnl_pct <= -max_daily_loss_pct`
//!
//! Position sizing formula:
//! ```text
//! size = (capital * risk_per_trade_pct) / (entry_price - stop_price)
//! ```
//! capped at `capital * max_position_pct / entry_price`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::config::{RiskConfig, StopSource, TrailingStopConfig};
use crate::ports::Fill;
use crate::{
    BlockReason, DayRiskState, ExitReason, Position, PositionId, PositionStatus, RiskStatus,
    Signal, Symbol, Tick, Trade,
};

impl DayRiskState {
    pub fn max_trades_reached(&self, limits: &RiskConfig) -> bool {
        self.trades_closed >= limits.max_trades_per_day
    }

    pub fn first_loss_hit(&self, limits: &RiskConfig) -> bool {
        limits.stop_after_first_loss && self.has_loss
    }

    pub fn daily_loss_limit_hit(&self, limits: &RiskConfig) -> bool {
        self.cumulative_pnl_pct <= -limits.max_daily_loss_pct
    }

    /// Fold one closed trade into the counters and re-evaluate the kill switch.
    ///
    /// Returns the trigger when this closure moved the day into `Blocked`.
    pub fn record_close(&mut self, pnl_pct: f64, limits: &RiskConfig) -> Option<BlockReason> {
        self.trades_closed += 1;
        // Breakeven (pnl_pct == 0) is not a loss
        if pnl_pct < 0.0 {
            self.has_loss = true;
        }
        self.cumulative_pnl_pct += pnl_pct;

        if self.status == RiskStatus::Blocked {
            return None;
        }

        let trigger = if self.first_loss_hit(limits) {
            Some(BlockReason::FirstLoss)
        } else if self.daily_loss_limit_hit(limits) {
            Some(BlockReason::DailyLossLimit)
        } else if self.max_trades_reached(limits) {
            Some(BlockReason::MaxTrades)
        } else {
            None
        };

        if let Some(reason) = trigger {
            self.status = RiskStatus::Blocked;
            self.blocked_by = Some(reason);
        }
        trigger
    }
}

impl RiskConfig {
    /// Set the daily trade budget
    pub fn with_max_trades(mut self, max: u32) -> Self {
        self.max_trades_per_day = max;
        self
    }

    /// Enable or disable the first-loss kill switch
    pub fn with_stop_after_first_loss(mut self, enabled: bool) -> Self {
        self.stop_after_first_loss = enabled;
        self
    }

    /// Set the daily loss limit as a fraction (0.08 = 8%)
    pub fn with_max_daily_loss(mut self, pct: f64) -> Self {
        self.max_daily_loss_pct = pct;
        self
    }

    /// Set fixed stop and target distances
    pub fn with_stop_and_target(mut self, stop_pct: f64, target_pct: f64) -> Self {
        self.stop_loss_pct = stop_pct;
        self.target_pct = target_pct;
        self
    }

    pub fn with_stop_source(mut self, source: StopSource) -> Self {
        self.stop_source = source;
        self
    }

    pub fn with_trailing_stop(mut self, trailing: TrailingStopConfig) -> Self {
        self.trailing_stop = Some(trailing);
        self
    }

    pub fn with_capital(mut self, capital: f64) -> Self {
        self.starting_capital = capital;
        self
    }

    pub fn with_flatten_on_block(mut self, enabled: bool) -> Self {
        self.flatten_on_block = enabled;
        self
    }

    /// Build the RiskManager
    pub fn build(self) -> RiskManager {
        RiskManager::new(self)
    }
}

/// Why an Entry signal was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Kill switch engaged for the day
    Blocked,
    /// Open positions plus closed trades already use the daily budget
    TradeBudgetCommitted,
    AlreadyOpen,
    InvalidSize,
    NotAnEntry,
}

/// Accepted entry, ready to be sent to the order port
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub symbol: Symbol,
    pub reference_price: f64,
    pub timestamp: DateTime<Utc>,
    pub stop_price: f64,
    pub target_price: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryDecision {
    Accept(EntryPlan),
    Reject(RejectReason),
}

/// Result of closing a position
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub trade: Trade,
    /// Set when this closure engaged the kill switch
    pub blocked: Option<BlockReason>,
}

/// Risk manager for the day's entries, exits and kill switch
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskConfig,
    capital: f64,
    day: DayRiskState,
    positions: BTreeMap<PositionId, Position>,
    next_position_id: PositionId,
    trades: Vec<Trade>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        RiskManager {
            capital: config.starting_capital,
            config,
            day: DayRiskState::default(),
            positions: BTreeMap::new(),
            next_position_id: 1,
            trades: Vec::new(),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn capital(&self) -> f64 {
        self.capital
    }

    pub fn day_state(&self) -> &DayRiskState {
        &self.day
    }

    pub fn accepts_entries(&self) -> bool {
        self.day.is_active()
    }

    /// Append-only trade log across all sessions
    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn position(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn position_for(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.values().find(|p| &p.symbol == symbol)
    }

    /// Reset the daily counters. Capital and the trade log carry over.
    pub fn start_session(&mut self) {
        if !self.positions.is_empty() {
            warn!(
                "Starting new session with {} positions still open",
                self.positions.len()
            );
        }
        self.day = DayRiskState::default();
    }

    fn levels(&self, entry_price: f64, range_low: Option<f64>) -> (f64, f64) {
        let stop = match (self.config.stop_source, range_low) {
            (StopSource::RangeLow, Some(low)) => low,
            _ => entry_price * (1.0 - self.config.stop_loss_pct),
        };
        (stop, entry_price * (1.0 + self.config.target_pct))
    }

    /// Position size for the given entry/stop, 0.0 if no valid size exists
    pub fn calculate_position_size(&self, entry_price: f64, stop_price: f64) -> f64 {
        let stop_distance = entry_price - stop_price;
        if stop_distance <= 0.0 || entry_price <= 0.0 {
            return 0.0;
        }
        let risk_amount = self.capital * self.config.risk_per_trade_pct;
        let size = risk_amount / stop_distance;
        let max_size = self.capital * self.config.max_position_pct / entry_price;
        let size = size.min(max_size);
        if size.is_finite() && size > 0.0 {
            size
        } else {
            0.0
        }
    }

    /// Gate an Entry signal. `range_low` is used when stops come from the opening range.
    pub fn evaluate_entry(&self, signal: &Signal, range_low: Option<f64>) -> EntryDecision {
        let Signal::Entry {
            symbol,
            reference_price,
            timestamp,
        } = signal
        else {
            return EntryDecision::Reject(RejectReason::NotAnEntry);
        };

        let reject = |reason: RejectReason| {
            info!(symbol = %symbol, price = reference_price, reason = ?reason, "Entry rejected");
            EntryDecision::Reject(reason)
        };

        if !self.accepts_entries() {
            return reject(RejectReason::Blocked);
        }
        if self.position_for(symbol).is_some() {
            return reject(RejectReason::AlreadyOpen);
        }
        let committed = self.day.trades_closed as usize + self.positions.len();
        if committed >= self.config.max_trades_per_day as usize {
            return reject(RejectReason::TradeBudgetCommitted);
        }

        let (stop_price, target_price) = self.levels(*reference_price, range_low);
        let size = self.calculate_position_size(*reference_price, stop_price);
        if size <= 0.0 {
            return reject(RejectReason::InvalidSize);
        }

        EntryDecision::Accept(EntryPlan {
            symbol: symbol.clone(),
            reference_price: *reference_price,
            timestamp: *timestamp,
            stop_price,
            target_price,
            size,
        })
    }

    /// Create an Open position from a confirmed entry fill.
    ///
    /// Fixed-percentage levels are re-anchored on the fill price.
    pub fn open_position(&mut self, plan: &EntryPlan, fill: &Fill) -> &Position {
        let (stop_price, target_price) = match self.config.stop_source {
            StopSource::FixedPct => self.levels(fill.price, None),
            StopSource::RangeLow => (plan.stop_price, fill.price * (1.0 + self.config.target_pct)),
        };
        let id = self.next_position_id;
        self.next_position_id += 1;

        let position = Position {
            id,
            symbol: plan.symbol.clone(),
            entry_price: fill.price,
            entry_time: fill.timestamp,
            stop_price,
            target_price,
            size: plan.size,
            status: PositionStatus::Open,
            high_water: fill.price,
        };
        info!(
            symbol = %position.symbol,
            id,
            entry = position.entry_price,
            stop = position.stop_price,
            target = position.target_price,
            size = position.size,
            "Position opened"
        );
        self.positions.entry(id).or_insert(position)
    }

    fn apply_trailing(&self, position: &mut Position) {
        let Some(trailing) = self.config.trailing_stop else {
            return;
        };
        let activation = position.entry_price * (1.0 + trailing.trigger_pct);
        if position.high_water < activation {
            return;
        }
        let trailed = position.high_water * (1.0 - trailing.distance_pct);
        if trailed > position.stop_price {
            debug!(
                symbol = %position.symbol,
                from = position.stop_price,
                to = trailed,
                "Trailing stop raised"
            );
            position.stop_price = trailed;
        }
    }

    /// Check stop and target for every open position in `symbol`
    pub fn evaluate_exits(&mut self, symbol: &Symbol, tick: &Tick) -> Vec<Signal> {
        let ids: Vec<PositionId> = self
            .positions
            .values()
            .filter(|p| &p.symbol == symbol)
            .map(|p| p.id)
            .collect();

        let mut exits = Vec::new();
        for id in ids {
            let Some(mut position) = self.positions.get(&id).cloned() else {
                continue;
            };
            position.high_water = position.high_water.max(tick.price);
            self.apply_trailing(&mut position);

            let reason = if tick.price <= position.stop_price {
                Some(ExitReason::Stop)
            } else if tick.price >= position.target_price {
                Some(ExitReason::Target)
            } else {
                None
            };

            if let Some(reason) = reason {
                exits.push(Signal::Exit {
                    position_id: id,
                    symbol: position.symbol.clone(),
                    reason,
                    reference_price: tick.price,
                    timestamp: tick.timestamp,
                });
            }
            self.positions.insert(id, position);
        }
        exits
    }

    /// Exit signals for every open position at the `(price, timestamp)` quoted
    /// by `quote_of`. Positions without a quote exit at their entry price at
    /// `fallback_time`.
    pub fn force_exit_signals<F>(
        &self,
        reason: ExitReason,
        fallback_time: DateTime<Utc>,
        quote_of: F,
    ) -> Vec<Signal>
    where
        F: Fn(&Symbol) -> Option<(f64, DateTime<Utc>)>,
    {
        self.positions
            .values()
            .map(|p| {
                let (reference_price, timestamp) =
                    quote_of(&p.symbol).unwrap_or((p.entry_price, fallback_time));
                Signal::Exit {
                    position_id: p.id,
                    symbol: p.symbol.clone(),
                    reason,
                    reference_price,
                    timestamp,
                }
            })
            .collect()
    }

    /// Close a position on a confirmed exit fill and update the day's state
    pub fn close_position(
        &mut self,
        position_id: PositionId,
        fill: &Fill,
        reason: ExitReason,
    ) -> Option<ClosedTrade> {
        let mut position = self.positions.remove(&position_id)?;
        position.status = PositionStatus::Closed;

        let trade = Trade::from_position(&position, fill.price, fill.timestamp, reason);
        self.capital += trade.pnl_abs;
        let blocked = self.day.record_close(trade.pnl_pct, &self.config);

        info!(
            symbol = %trade.symbol,
            reason = %reason,
            pnl_pct = %format!("{:+.2}%", trade.pnl_pct * 100.0),
            pnl = trade.pnl_abs,
            trades_closed = self.day.trades_closed,
            "Position closed"
        );
        if let Some(trigger) = blocked {
            info!(
                trigger = %trigger,
                cumulative_pnl_pct = %format!("{:+.2}%", self.day.cumulative_pnl_pct * 100.0),
                "Kill switch engaged; no further entries this session"
            );
        }

        self.trades.push(trade.clone());
        Some(ClosedTrade { trade, blocked })
    }
}
