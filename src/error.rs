//! Error taxonomy
//!
//! `ConfigError` is fatal and only raised before a session starts.
//! `OrderError` is surfaced to the coordinator, which reports it without
//! touching the day's risk counters. `DataIssue` values are recoverable and
//! end up in the session report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Symbol;

/// Invalid configuration values
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} = {value} is out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        reason: &'static str,
    },

    #[error("{field} = '{value}' is not a valid HH:MM time")]
    InvalidTime { field: &'static str, value: String },

    #[error("unknown timezone '{0}'")]
    InvalidTimezone(String),

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

/// Order placement failures
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum OrderError {
    #[error("order for {symbol} rejected: {reason}")]
    Rejected { symbol: Symbol, reason: String },
}

/// Recoverable data problems observed during a session
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum DataIssue {
    #[error("{symbol}: no ticks observed in the opening range window")]
    DataGap { symbol: Symbol },

    #[error("{symbol}: tick at {timestamp} dropped ({reason})")]
    ClockSkew {
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        reason: String,
    },

    #[error("{symbol}: malformed tick at {timestamp} dropped ({reason})")]
    InvalidTick {
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        reason: String,
    },
}
