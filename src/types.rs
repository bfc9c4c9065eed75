//! Core data types used across the trading engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for tick data
#[derive(Debug, Error)]
pub enum TickValidationError {
    #[error("price must be positive and finite, got {0}")]
    InvalidPrice(f64),

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),
}

/// A single price observation for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
}

impl Tick {
    /// Create a new tick with validation
    pub fn new(timestamp: DateTime<Utc>, price: f64, volume: f64) -> Result<Self, TickValidationError> {
        let tick = Self {
            timestamp,
            price,
            volume,
        };
        tick.validate()?;
        Ok(tick)
    }

    /// Validate the tick data
    pub fn validate(&self) -> Result<(), TickValidationError> {
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(TickValidationError::InvalidPrice(self.price));
        }
        if self.volume < 0.0 {
            return Err(TickValidationError::NegativeVolume(self.volume));
        }
        Ok(())
    }
}

/// Ticker symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned into every signal, position and trade, and handed to each
/// per-symbol evaluation task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Gap-up scan result, created once per symbol per session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapCandidate {
    pub symbol: Symbol,
    pub previous_close: f64,
    pub session_open: f64,
    /// (session_open - previous_close) / previous_close
    pub gap_pct: f64,
}

/// High/low band of the opening window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningRange {
    pub symbol: Symbol,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub high: f64,
    pub low: f64,
    /// Mean tick volume inside the window (used for optional volume confirmation)
    pub avg_volume: f64,
    pub finalized: bool,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Stop,
    Target,
    Eod,
    KillSwitch,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::Stop => "stop",
            ExitReason::Target => "target",
            ExitReason::Eod => "eod",
            ExitReason::KillSwitch => "kill_switch",
        };
        f.write_str(s)
    }
}

pub type PositionId = u64;

/// Decision produced within one evaluation cycle. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Entry {
        symbol: Symbol,
        reference_price: f64,
        timestamp: DateTime<Utc>,
    },
    Exit {
        position_id: PositionId,
        symbol: Symbol,
        reason: ExitReason,
        reference_price: f64,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Long position owned by the risk manager until closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub symbol: Symbol,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_price: f64,
    pub target_price: f64,
    pub size: f64,
    pub status: PositionStatus,
    /// Highest price seen since entry (drives the optional trailing stop)
    pub high_water: f64,
}

/// Immutable record of a closed position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: Symbol,
    pub entry_price: f64,
    pub exit_price: f64,
    pub size: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    /// Fractional return, e.g. 0.08 = +8%
    pub pnl_pct: f64,
    pub pnl_abs: f64,
    pub reason: ExitReason,
}

impl Trade {
    pub fn from_position(
        position: &Position,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
    ) -> Self {
        Trade {
            symbol: position.symbol.clone(),
            entry_price: position.entry_price,
            exit_price,
            size: position.size,
            entry_time: position.entry_time,
            exit_time,
            pnl_pct: (exit_price - position.entry_price) / position.entry_price,
            pnl_abs: (exit_price - position.entry_price) * position.size,
            reason,
        }
    }

    pub fn is_loss(&self) -> bool {
        self.pnl_pct < 0.0
    }
}

/// Kill-switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskStatus {
    Active,
    Blocked,
}

/// Trigger that moved the day into `Blocked`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    MaxTrades,
    FirstLoss,
    DailyLossLimit,
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockReason::MaxTrades => "max trades per day reached",
            BlockReason::FirstLoss => "first losing trade",
            BlockReason::DailyLossLimit => "daily loss limit reached",
        };
        f.write_str(s)
    }
}

/// Per-session risk counters, reset only at session start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRiskState {
    pub trades_closed: u32,
    pub has_loss: bool,
    pub cumulative_pnl_pct: f64,
    pub status: RiskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<BlockReason>,
}

impl Default for DayRiskState {
    fn default() -> Self {
        DayRiskState {
            trades_closed: 0,
            has_loss: false,
            cumulative_pnl_pct: 0.0,
            status: RiskStatus::Active,
            blocked_by: None,
        }
    }
}

impl DayRiskState {
    pub fn is_active(&self) -> bool {
        self.status == RiskStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn position(entry: f64) -> Position {
        Position {
            id: 1,
            symbol: Symbol::new("ABC"),
            entry_price: entry,
            entry_time: Utc.with_ymd_and_hms(2024, 1, 11, 14, 40, 0).unwrap(),
            stop_price: entry * 0.95,
            target_price: entry * 1.08,
            size: 10.0,
            status: PositionStatus::Open,
            high_water: entry,
        }
    }

    #[test]
    fn test_tick_validation() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 11, 14, 30, 0).unwrap();
        assert!(Tick::new(ts, 10.0, 100.0).is_ok());
        assert!(Tick::new(ts, 0.0, 100.0).is_err());
        assert!(Tick::new(ts, f64::NAN, 100.0).is_err());
        assert!(Tick::new(ts, 10.0, -1.0).is_err());
    }

    #[test]
    fn test_trade_from_position() {
        let pos = position(100.0);
        let exit_time = pos.entry_time + chrono::Duration::minutes(10);
        let trade = Trade::from_position(&pos, 95.0, exit_time, ExitReason::Stop);

        assert!((trade.pnl_pct + 0.05).abs() < 1e-12);
        assert!((trade.pnl_abs + 50.0).abs() < 1e-9);
        assert!(trade.is_loss());
    }

    #[test]
    fn test_breakeven_is_not_loss() {
        let pos = position(100.0);
        let trade = Trade::from_position(&pos, 100.0, pos.entry_time, ExitReason::Eod);
        assert!(!trade.is_loss());
    }

    #[test]
    fn test_symbol_serde_transparent() {
        let sym = Symbol::new("XYZ");
        let json = serde_json::to_string(&sym).unwrap();
        assert_eq!(json, "\"XYZ\"");
        let parsed: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, sym);
    }

    #[test]
    fn test_exit_reason_serializes_snake_case() {
        let json = serde_json::to_string(&ExitReason::KillSwitch).unwrap();
        assert_eq!(json, "\"kill_switch\"");
    }
}
