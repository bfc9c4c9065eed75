//! Opening Range Breakout Trader
//!
//! Gap-up scanning, opening-range breakout detection and a daily kill switch
//! for intraday long entries, with a deterministic tick-replay backtester and
//! a concurrent live session runner sharing the same decision pipeline.

pub mod config;
pub mod error;
pub mod types;
pub mod scanner;
pub mod range;
pub mod breakout;
pub mod session;
pub mod risk;
pub mod ports;
pub mod engine;
pub mod backtest;
pub mod live;
pub mod data;

pub use config::Config;
pub use types::*;
