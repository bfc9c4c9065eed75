//! Configuration management
//!
//! Handles loading and validating the JSON configuration file. Every section
//! falls back to its defaults, so a file only needs the values it overrides.
//!
//! All percentages are fractions: `0.03` means 3%.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scanner: ScannerConfig,
    pub session: SessionConfig,
    pub risk: RiskConfig,
    pub backtest: BacktestConfig,
}

impl Config {
    /// Load configuration from a JSON file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    /// Check every parameter once, before any session begins
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scanner.validate()?;
        self.session.validate()?;
        self.risk.validate()?;
        self.backtest.validate()
    }
}

fn check_fraction(
    field: &'static str,
    value: f64,
    allow_zero: bool,
    max_exclusive: Option<f64>,
) -> Result<(), ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            reason: "must be finite",
        });
    }
    if value < 0.0 || (!allow_zero && value == 0.0) {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            reason: if allow_zero {
                "must be >= 0"
            } else {
                "must be > 0"
            },
        });
    }
    if let Some(max) = max_exclusive {
        if value >= max {
            return Err(ConfigError::OutOfRange {
                field,
                value,
                reason: "must be below 1.0",
            });
        }
    }
    Ok(())
}

pub(crate) fn parse_hhmm(field: &'static str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| ConfigError::InvalidTime {
        field,
        value: value.to_string(),
    })
}

/// Gap scanner parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Minimum gap-up from previous close (GAP_UP_MIN_PCT)
    pub gap_up_min_pct: f64,
    /// Optional cap on the number of candidates kept after sorting
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_candidates: Option<usize>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfig {
            gap_up_min_pct: 0.03,
            max_candidates: None,
        }
    }
}

impl ScannerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("scanner.gap_up_min_pct", self.gap_up_min_pct, true, Some(1.0))?;
        if self.max_candidates == Some(0) {
            return Err(ConfigError::Inconsistent(
                "scanner.max_candidates must be at least 1 when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trading session schedule
///
/// Times are wall-clock times in `timezone`; daylight saving is handled by
/// `chrono-tz` when the schedule is resolved for a concrete date.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub timezone: String,
    /// "HH:MM"
    pub market_open: String,
    /// "HH:MM"
    pub market_close: String,
    /// Length of the opening range window (OPENING_RANGE_MINUTES)
    pub opening_range_minutes: u32,
    /// Entry cutoff measured from market open (ENTRY_WINDOW_MINUTES)
    pub entry_window_minutes: u32,
    /// Breakout tick volume must be >= this multiple of the opening-range
    /// average tick volume. 0 disables the check.
    pub breakout_volume_multiplier: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timezone: "America/New_York".to_string(),
            market_open: "09:30".to_string(),
            market_close: "16:00".to_string(),
            opening_range_minutes: 5,
            entry_window_minutes: 60,
            breakout_volume_multiplier: 0.0,
        }
    }
}

impl SessionConfig {
    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(self.timezone.clone()))
    }

    pub fn open_time(&self) -> Result<NaiveTime, ConfigError> {
        parse_hhmm("session.market_open", &self.market_open)
    }

    pub fn close_time(&self) -> Result<NaiveTime, ConfigError> {
        parse_hhmm("session.market_close", &self.market_close)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.tz()?;
        let open = self.open_time()?;
        let close = self.close_time()?;
        if open >= close {
            return Err(ConfigError::Inconsistent(format!(
                "market_open ({}) must be before market_close ({})",
                self.market_open, self.market_close
            )));
        }
        if self.opening_range_minutes == 0 {
            return Err(ConfigError::OutOfRange {
                field: "session.opening_range_minutes",
                value: 0.0,
                reason: "must be >= 1",
            });
        }
        if self.entry_window_minutes <= self.opening_range_minutes {
            return Err(ConfigError::Inconsistent(format!(
                "entry_window_minutes ({}) must exceed opening_range_minutes ({})",
                self.entry_window_minutes, self.opening_range_minutes
            )));
        }
        let session_minutes = (close - open).num_minutes();
        if i64::from(self.entry_window_minutes) > session_minutes {
            return Err(ConfigError::Inconsistent(format!(
                "entry window ({} min) extends past market close ({} min session)",
                self.entry_window_minutes, session_minutes
            )));
        }
        check_fraction(
            "session.breakout_volume_multiplier",
            self.breakout_volume_multiplier,
            true,
            None,
        )
    }
}

/// Where the initial stop comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSource {
    /// entry × (1 − stop_loss_pct)
    #[default]
    FixedPct,
    /// Low of the opening range
    RangeLow,
}

/// Trailing stop, activated once the position is far enough in profit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    pub trigger_pct: f64,
    pub distance_pct: f64,
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        TrailingStopConfig {
            trigger_pct: 0.06,
            distance_pct: 0.02,
        }
    }
}

/// Kill switches, exits and sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub max_trades_per_day: u32,
    pub stop_after_first_loss: bool,
    /// Blocks once cumulative pnl_pct <= -max_daily_loss_pct
    pub max_daily_loss_pct: f64,
    pub stop_loss_pct: f64,
    pub target_pct: f64,
    pub stop_source: StopSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trailing_stop: Option<TrailingStopConfig>,
    /// Initial capital, in the same currency as the price data
    pub starting_capital: f64,
    pub risk_per_trade_pct: f64,
    pub max_position_pct: f64,
    /// Force-close other open positions when the day becomes Blocked
    pub flatten_on_block: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        RiskConfig {
            max_trades_per_day: 2,
            stop_after_first_loss: true,
            max_daily_loss_pct: 0.08,
            stop_loss_pct: 0.05,
            target_pct: 0.08,
            stop_source: StopSource::FixedPct,
            trailing_stop: None,
            starting_capital: 40.0,
            risk_per_trade_pct: 0.02,
            max_position_pct: 0.80,
            flatten_on_block: false,
        }
    }
}

impl RiskConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_trades_per_day == 0 {
            return Err(ConfigError::OutOfRange {
                field: "risk.max_trades_per_day",
                value: 0.0,
                reason: "must be >= 1",
            });
        }
        check_fraction("risk.max_daily_loss_pct", self.max_daily_loss_pct, false, None)?;
        check_fraction("risk.stop_loss_pct", self.stop_loss_pct, false, Some(1.0))?;
        check_fraction("risk.target_pct", self.target_pct, false, None)?;
        check_fraction("risk.risk_per_trade_pct", self.risk_per_trade_pct, false, None)?;
        check_fraction("risk.max_position_pct", self.max_position_pct, false, None)?;
        if self.risk_per_trade_pct > 1.0 || self.max_position_pct > 1.0 {
            return Err(ConfigError::Inconsistent(
                "risk_per_trade_pct and max_position_pct must not exceed 1.0".to_string(),
            ));
        }
        if !self.starting_capital.is_finite() || self.starting_capital <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "risk.starting_capital",
                value: self.starting_capital,
                reason: "must be > 0",
            });
        }
        if let Some(trailing) = &self.trailing_stop {
            check_fraction("risk.trailing_stop.trigger_pct", trailing.trigger_pct, false, None)?;
            check_fraction(
                "risk.trailing_stop.distance_pct",
                trailing.distance_pct,
                false,
                Some(1.0),
            )?;
        }
        Ok(())
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Adverse fill adjustment applied by the simulated broker (0 = fill at signal price)
    pub slippage_pct: f64,
    pub data_dir: String,
    pub results_dir: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            slippage_pct: 0.0,
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
        }
    }
}

impl BacktestConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("backtest.slippage_pct", self.slippage_pct, true, Some(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scanner.gap_up_min_pct, 0.03);
        assert_eq!(config.session.opening_range_minutes, 5);
        assert_eq!(config.session.entry_window_minutes, 60);
        assert_eq!(config.risk.max_trades_per_day, 2);
        assert_eq!(config.risk.stop_loss_pct, 0.05);
        assert_eq!(config.risk.max_daily_loss_pct, 0.08);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "risk": { "target_pct": 0.12 }, "scanner": { "max_candidates": 5 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.risk.target_pct, 0.12);
        assert_eq!(config.risk.stop_loss_pct, 0.05);
        assert_eq!(config.scanner.max_candidates, Some(5));
        assert_eq!(config.session.timezone, "America/New_York");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_percentage_rejected() {
        let mut config = Config::default();
        config.risk.stop_loss_pct = -0.05;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "risk.stop_loss_pct",
                ..
            })
        ));
    }

    #[test]
    fn test_nan_rejected() {
        let mut config = Config::default();
        config.scanner.gap_up_min_pct = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_max_trades_rejected() {
        let mut config = Config::default();
        config.risk.max_trades_per_day = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_entry_window_must_exceed_range() {
        let mut config = Config::default();
        config.session.entry_window_minutes = 5;
        assert!(matches!(config.validate(), Err(ConfigError::Inconsistent(_))));
    }

    #[test]
    fn test_bad_timezone_and_time() {
        let mut config = Config::default();
        config.session.timezone = "Mars/Olympus".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTimezone("Mars/Olympus".to_string()))
        );

        let mut config = Config::default();
        config.session.market_open = "9h30".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTime { .. })));
    }

    #[test]
    fn test_open_after_close_rejected() {
        let mut config = Config::default();
        config.session.market_open = "16:30".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Inconsistent(_))));
    }

    #[test]
    fn test_trailing_stop_validated() {
        let mut config = Config::default();
        config.risk.trailing_stop = Some(TrailingStopConfig {
            trigger_pct: 0.06,
            distance_pct: 1.5,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("orb_trader_bad_config_{}.json", std::process::id()));
        fs::write(&path, r#"{ "risk": { "max_daily_loss_pct": -0.08 } }"#).unwrap();
        let result = Config::from_file(&path);
        fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
