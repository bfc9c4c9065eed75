//! Range breakout detection
//!
//! Entry: first tick inside the entry window whose price is >= the opening
//! range high (optionally on confirming volume). At most one signal per
//! symbol per session.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::{OpeningRange, Signal, Tick};

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Watching,
    Triggered,
    /// Entry window passed without a breakout
    Expired,
}

#[derive(Debug, Clone)]
pub struct BreakoutDetector {
    range: OpeningRange,
    entry_start: DateTime<Utc>,
    entry_cutoff: DateTime<Utc>,
    volume_multiplier: f64,
    state: DetectorState,
}

impl BreakoutDetector {
    /// `range` must be finalized. `entry_cutoff` is inclusive.
    pub fn new(
        range: OpeningRange,
        entry_start: DateTime<Utc>,
        entry_cutoff: DateTime<Utc>,
        volume_multiplier: f64,
    ) -> Self {
        debug_assert!(range.finalized, "breakout detector needs a finalized range");
        BreakoutDetector {
            range,
            entry_start,
            entry_cutoff,
            volume_multiplier,
            state: DetectorState::Watching,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn range(&self) -> &OpeningRange {
        &self.range
    }

    fn is_volume_confirming(&self, tick: &Tick) -> bool {
        if self.volume_multiplier <= 0.0 {
            return true;
        }
        tick.volume >= self.range.avg_volume * self.volume_multiplier
    }

    /// Evaluate one tick; returns the Entry signal on the first crossing only
    pub fn evaluate(&mut self, tick: &Tick) -> Option<Signal> {
        if self.state != DetectorState::Watching {
            return None;
        }
        if tick.timestamp < self.entry_start {
            return None;
        }
        if tick.timestamp > self.entry_cutoff {
            self.state = DetectorState::Expired;
            debug!(symbol = %self.range.symbol, "Entry window closed without breakout");
            return None;
        }
        if tick.price < self.range.high {
            return None;
        }
        if !self.is_volume_confirming(tick) {
            debug!(
                symbol = %self.range.symbol,
                volume = tick.volume,
                required = self.range.avg_volume * self.volume_multiplier,
                "Breakout price reached without volume confirmation"
            );
            return None;
        }

        self.state = DetectorState::Triggered;
        info!(
            symbol = %self.range.symbol,
            price = tick.price,
            range_high = self.range.high,
            "Breakout above opening range"
        );
        Some(Signal::Entry {
            symbol: self.range.symbol.clone(),
            reference_price: tick.price,
            timestamp: tick.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Symbol;
    use chrono::{Duration, TimeZone};

    fn open() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 11, 14, 30, 0).unwrap()
    }

    fn range() -> OpeningRange {
        OpeningRange {
            symbol: Symbol::new("X"),
            window_start: open(),
            window_end: open() + Duration::minutes(5),
            high: 10.40,
            low: 10.25,
            avg_volume: 1000.0,
            finalized: true,
        }
    }

    fn detector(volume_multiplier: f64) -> BreakoutDetector {
        BreakoutDetector::new(
            range(),
            open() + Duration::minutes(5),
            open() + Duration::minutes(60),
            volume_multiplier,
        )
    }

    fn tick(minute: i64, price: f64, volume: f64) -> Tick {
        Tick {
            timestamp: open() + Duration::minutes(minute),
            price,
            volume,
        }
    }

    #[test]
    fn test_fires_on_first_tick_at_or_above_high() {
        let mut d = detector(0.0);
        assert!(d.evaluate(&tick(6, 10.35, 500.0)).is_none());
        assert!(d.evaluate(&tick(7, 10.39, 500.0)).is_none());
        let signal = d.evaluate(&tick(8, 10.40, 500.0)).unwrap();
        assert_eq!(
            signal,
            Signal::Entry {
                symbol: Symbol::new("X"),
                reference_price: 10.40,
                timestamp: open() + Duration::minutes(8),
            }
        );
    }

    #[test]
    fn test_never_retriggers() {
        let mut d = detector(0.0);
        assert!(d.evaluate(&tick(6, 10.45, 500.0)).is_some());
        assert!(d.evaluate(&tick(7, 10.30, 500.0)).is_none());
        assert!(d.evaluate(&tick(8, 10.50, 500.0)).is_none());
        assert_eq!(d.state(), DetectorState::Triggered);
    }

    #[test]
    fn test_no_entry_after_cutoff() {
        let mut d = detector(0.0);
        assert!(d.evaluate(&tick(61, 11.0, 500.0)).is_none());
        assert_eq!(d.state(), DetectorState::Expired);
        assert!(d.evaluate(&tick(62, 11.0, 500.0)).is_none());
    }

    #[test]
    fn test_cutoff_is_inclusive() {
        let mut d = detector(0.0);
        assert!(d.evaluate(&tick(60, 10.5, 500.0)).is_some());
    }

    #[test]
    fn test_volume_confirmation() {
        let mut d = detector(1.5);
        assert!(d.evaluate(&tick(6, 10.5, 1000.0)).is_none());
        assert_eq!(d.state(), DetectorState::Watching);
        assert!(d.evaluate(&tick(7, 10.5, 1500.0)).is_some());
    }
}
