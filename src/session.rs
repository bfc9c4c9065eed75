//! Session schedule and per-symbol evaluation
//!
//! `SessionClock` resolves the configured wall-clock schedule into UTC instants
//! for one trading date. `SymbolEvaluator` chains the range tracker and the
//! breakout detector for one candidate and filters out ticks that fall outside
//! the session or arrive out of order.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::breakout::{BreakoutDetector, DetectorState};
use crate::config::SessionConfig;
use crate::error::{ConfigError, DataIssue};
use crate::range::{RangeEvent, RangePhase, RangeTracker};
use crate::{GapCandidate, Signal, Symbol, Tick};

/// Session boundaries for one trading date, in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClock {
    pub date: NaiveDate,
    pub open: DateTime<Utc>,
    /// End of the opening range window, start of the entry window
    pub range_end: DateTime<Utc>,
    /// Last instant at which entries are accepted (inclusive)
    pub entry_cutoff: DateTime<Utc>,
    pub close: DateTime<Utc>,
}

fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>, ConfigError> {
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            ConfigError::Inconsistent(format!("{} {} does not exist in {}", date, time, tz))
        })
}

impl SessionClock {
    pub fn for_date(date: NaiveDate, config: &SessionConfig) -> Result<Self, ConfigError> {
        let tz = config.tz()?;
        let open = resolve_local(tz, date, config.open_time()?)?;
        let close = resolve_local(tz, date, config.close_time()?)?;
        Ok(SessionClock {
            date,
            open,
            range_end: open + Duration::minutes(i64::from(config.opening_range_minutes)),
            entry_cutoff: open + Duration::minutes(i64::from(config.entry_window_minutes)),
            close,
        })
    }

    pub fn in_session(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.open && ts <= self.close
    }

    pub fn entries_open(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.range_end && ts <= self.entry_cutoff
    }
}

/// Trading date of a timestamp in the session timezone
pub fn trading_date(ts: DateTime<Utc>, config: &SessionConfig) -> Result<NaiveDate, ConfigError> {
    Ok(ts.with_timezone(&config.tz()?).date_naive())
}

/// Where a candidate is in its session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvaluatorPhase {
    CollectingRange,
    WatchingBreakout,
    Triggered,
    EntryWindowClosed,
    /// Excluded for the session because the opening range had no ticks
    Excluded,
}

/// What happened to one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutcome {
    /// Tick passed the session/ordering checks; forward it to exit evaluation
    pub accepted: bool,
    pub entry: Option<Signal>,
    pub issue: Option<DataIssue>,
}

impl TickOutcome {
    fn dropped(issue: DataIssue) -> Self {
        TickOutcome {
            accepted: false,
            entry: None,
            issue: Some(issue),
        }
    }
}

/// Per-candidate pipeline: RangeTracker → BreakoutDetector
#[derive(Debug, Clone)]
pub struct SymbolEvaluator {
    candidate: GapCandidate,
    clock: SessionClock,
    volume_multiplier: f64,
    tracker: RangeTracker,
    detector: Option<BreakoutDetector>,
    last_tick: Option<Tick>,
}

impl SymbolEvaluator {
    pub fn new(candidate: GapCandidate, clock: SessionClock, volume_multiplier: f64) -> Self {
        let tracker = RangeTracker::new(candidate.symbol.clone(), clock.open, clock.range_end);
        SymbolEvaluator {
            candidate,
            clock,
            volume_multiplier,
            tracker,
            detector: None,
            last_tick: None,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.candidate.symbol
    }

    pub fn last_tick(&self) -> Option<&Tick> {
        self.last_tick.as_ref()
    }

    pub fn tracker(&self) -> &RangeTracker {
        &self.tracker
    }

    /// Low of the finalized opening range
    pub fn range_low(&self) -> Option<f64> {
        self.tracker.finalized().map(|r| r.low)
    }

    pub fn phase(&self) -> EvaluatorPhase {
        match (self.tracker.phase(), &self.detector) {
            (RangePhase::Collecting, _) => EvaluatorPhase::CollectingRange,
            (RangePhase::DataGap, _) => EvaluatorPhase::Excluded,
            (RangePhase::Finalized, Some(d)) => match d.state() {
                DetectorState::Watching => EvaluatorPhase::WatchingBreakout,
                DetectorState::Triggered => EvaluatorPhase::Triggered,
                DetectorState::Expired => EvaluatorPhase::EntryWindowClosed,
            },
            (RangePhase::Finalized, None) => EvaluatorPhase::WatchingBreakout,
        }
    }

    /// Nothing left to do for entries: triggered, expired or excluded
    pub fn entries_done(&self) -> bool {
        matches!(
            self.phase(),
            EvaluatorPhase::Triggered | EvaluatorPhase::EntryWindowClosed | EvaluatorPhase::Excluded
        )
    }

    fn check_tick(&self, tick: &Tick) -> Option<DataIssue> {
        if let Err(e) = tick.validate() {
            return Some(DataIssue::InvalidTick {
                symbol: self.candidate.symbol.clone(),
                timestamp: tick.timestamp,
                reason: e.to_string(),
            });
        }
        let skew = |reason: &str| {
            Some(DataIssue::ClockSkew {
                symbol: self.candidate.symbol.clone(),
                timestamp: tick.timestamp,
                reason: reason.to_string(),
            })
        };
        if !self.clock.in_session(tick.timestamp) {
            return skew("outside session bounds");
        }
        match &self.last_tick {
            Some(last) if tick.timestamp < last.timestamp => skew("out of order"),
            _ => None,
        }
    }

    fn on_range_event(&mut self, event: RangeEvent) -> Option<DataIssue> {
        match event {
            RangeEvent::Finalized(range) => {
                self.detector = Some(BreakoutDetector::new(
                    range,
                    self.clock.range_end,
                    self.clock.entry_cutoff,
                    self.volume_multiplier,
                ));
                None
            }
            RangeEvent::DataGap(issue) => Some(issue),
            _ => None,
        }
    }

    pub fn on_tick(&mut self, tick: &Tick) -> TickOutcome {
        if let Some(issue) = self.check_tick(tick) {
            warn!("{}", issue);
            return TickOutcome::dropped(issue);
        }
        self.last_tick = Some(*tick);

        let mut outcome = TickOutcome {
            accepted: true,
            ..Default::default()
        };

        if self.tracker.phase() == RangePhase::Collecting {
            let event = self.tracker.observe(tick);
            outcome.issue = self.on_range_event(event);
        }

        if let Some(detector) = self.detector.as_mut() {
            outcome.entry = detector.evaluate(tick);
        }

        debug!(
            symbol = %self.candidate.symbol,
            price = tick.price,
            phase = ?self.phase(),
            "Tick evaluated"
        );
        outcome
    }

    /// Close the opening range at `window_end` when no later tick has arrived
    pub fn close_range(&mut self) -> Option<DataIssue> {
        if self.tracker.phase() != RangePhase::Collecting {
            return None;
        }
        let event = self.tracker.finalize();
        self.on_range_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 11).unwrap()
    }

    fn clock() -> SessionClock {
        SessionClock::for_date(date(), &SessionConfig::default()).unwrap()
    }

    fn candidate() -> GapCandidate {
        GapCandidate {
            symbol: Symbol::new("X"),
            previous_close: 10.0,
            session_open: 10.35,
            gap_pct: 0.035,
        }
    }

    fn tick(minutes: i64, price: f64) -> Tick {
        Tick {
            timestamp: clock().open + Duration::minutes(minutes),
            price,
            volume: 100.0,
        }
    }

    #[test]
    fn test_clock_resolves_new_york_winter() {
        let c = clock();
        // 09:30 EST == 14:30 UTC in January
        assert_eq!(c.open.hour(), 14);
        assert_eq!(c.open.minute(), 30);
        assert_eq!(c.range_end - c.open, Duration::minutes(5));
        assert_eq!(c.entry_cutoff - c.open, Duration::minutes(60));
        assert_eq!(c.close.hour(), 21);
    }

    #[test]
    fn test_clock_handles_daylight_saving() {
        let summer = NaiveDate::from_ymd_opt(2024, 7, 10).unwrap();
        let c = SessionClock::for_date(summer, &SessionConfig::default()).unwrap();
        assert_eq!(c.open.hour(), 13);
    }

    #[test]
    fn test_trading_date_uses_session_timezone() {
        let late = Utc.with_ymd_and_hms(2024, 1, 12, 2, 0, 0).unwrap();
        assert_eq!(trading_date(late, &SessionConfig::default()).unwrap(), date());
    }

    #[test]
    fn test_pipeline_emits_entry_after_range() {
        let mut ev = SymbolEvaluator::new(candidate(), clock(), 0.0);
        for (m, p) in [(0, 10.30), (1, 10.40), (2, 10.25)] {
            let out = ev.on_tick(&tick(m, p));
            assert!(out.accepted);
            assert!(out.entry.is_none());
        }
        assert_eq!(ev.phase(), EvaluatorPhase::CollectingRange);

        let out = ev.on_tick(&tick(6, 10.38));
        assert!(out.entry.is_none());
        assert_eq!(ev.phase(), EvaluatorPhase::WatchingBreakout);

        let out = ev.on_tick(&tick(7, 10.45));
        assert!(matches!(out.entry, Some(Signal::Entry { reference_price, .. }) if reference_price == 10.45));
        assert_eq!(ev.phase(), EvaluatorPhase::Triggered);
        assert!(ev.entries_done());
    }

    #[test]
    fn test_finalizing_tick_can_break_out() {
        let mut ev = SymbolEvaluator::new(candidate(), clock(), 0.0);
        ev.on_tick(&tick(0, 10.0));
        let out = ev.on_tick(&tick(5, 10.5));
        assert!(out.entry.is_some());
    }

    #[test]
    fn test_data_gap_excludes_symbol() {
        let mut ev = SymbolEvaluator::new(candidate(), clock(), 0.0);
        let out = ev.on_tick(&tick(10, 12.0));
        assert!(out.accepted);
        assert!(matches!(out.issue, Some(DataIssue::DataGap { .. })));
        assert!(out.entry.is_none());
        assert_eq!(ev.phase(), EvaluatorPhase::Excluded);
        assert!(ev.on_tick(&tick(11, 13.0)).entry.is_none());
    }

    #[test]
    fn test_explicit_close_range() {
        let mut ev = SymbolEvaluator::new(candidate(), clock(), 0.0);
        assert!(matches!(ev.close_range(), Some(DataIssue::DataGap { .. })));
        assert!(ev.close_range().is_none());
    }

    #[test]
    fn test_out_of_session_ticks_dropped() {
        let mut ev = SymbolEvaluator::new(candidate(), clock(), 0.0);
        let out = ev.on_tick(&tick(-10, 10.0));
        assert!(!out.accepted);
        assert!(matches!(out.issue, Some(DataIssue::ClockSkew { .. })));

        let after_close = tick(7 * 60, 10.0);
        assert!(!ev.on_tick(&after_close).accepted);
        assert!(ev.last_tick().is_none());
    }

    #[test]
    fn test_out_of_order_tick_dropped() {
        let mut ev = SymbolEvaluator::new(candidate(), clock(), 0.0);
        assert!(ev.on_tick(&tick(2, 10.0)).accepted);
        let out = ev.on_tick(&tick(1, 10.1));
        assert!(!out.accepted);
        assert_eq!(ev.tracker().ticks_seen(), 1);
    }

    #[test]
    fn test_malformed_tick_dropped() {
        let mut ev = SymbolEvaluator::new(candidate(), clock(), 0.0);
        let out = ev.on_tick(&tick(1, -1.0));
        assert!(!out.accepted);
        assert!(matches!(out.issue, Some(DataIssue::InvalidTick { .. })));
    }
}
