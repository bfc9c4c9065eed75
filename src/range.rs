//! Opening range tracking
//!
//! One tracker per candidate. While collecting, ticks inside
//! `[window_start, window_end)` widen the band; the first tick at or after
//! `window_end` (or an explicit close) finalizes it. A window with no ticks
//! finalizes into a data gap and the symbol sits out the session.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::DataIssue;
use crate::{OpeningRange, Symbol, Tick};

/// Tracker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePhase {
    Collecting,
    Finalized,
    /// Window closed without a single tick
    DataGap,
}

/// Result of feeding one tick to the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum RangeEvent {
    /// Tick was inside the window and folded into the band
    Updated,
    /// Tick precedes the window (pre-market print) and is not folded in.
    /// `SymbolEvaluator` drops these as clock skew before they get here;
    /// this covers trackers fed directly.
    BeforeWindow,
    /// This tick closed the window; the range is now final
    Finalized(OpeningRange),
    /// This tick closed an empty window
    DataGap(DataIssue),
    /// Tracker already closed; tick not consumed
    Closed,
}

#[derive(Debug, Clone)]
pub struct RangeTracker {
    symbol: Symbol,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    phase: RangePhase,
    range: Option<OpeningRange>,
    ticks_seen: usize,
    volume_sum: f64,
}

impl RangeTracker {
    pub fn new(symbol: Symbol, window_start: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        RangeTracker {
            symbol,
            window_start,
            window_end,
            phase: RangePhase::Collecting,
            range: None,
            ticks_seen: 0,
            volume_sum: 0.0,
        }
    }

    pub fn phase(&self) -> RangePhase {
        self.phase
    }

    pub fn ticks_seen(&self) -> usize {
        self.ticks_seen
    }

    /// Current band (partial while collecting)
    pub fn range(&self) -> Option<&OpeningRange> {
        self.range.as_ref()
    }

    /// Finalized band, if any
    pub fn finalized(&self) -> Option<&OpeningRange> {
        self.range.as_ref().filter(|r| r.finalized)
    }

    pub fn observe(&mut self, tick: &Tick) -> RangeEvent {
        if self.phase != RangePhase::Collecting {
            return RangeEvent::Closed;
        }
        if tick.timestamp < self.window_start {
            return RangeEvent::BeforeWindow;
        }
        if tick.timestamp >= self.window_end {
            return self.finalize();
        }

        self.ticks_seen += 1;
        self.volume_sum += tick.volume;
        let avg_volume = self.volume_sum / self.ticks_seen as f64;
        match self.range.as_mut() {
            Some(range) => {
                range.high = range.high.max(tick.price);
                range.low = range.low.min(tick.price);
                range.avg_volume = avg_volume;
            }
            None => {
                self.range = Some(OpeningRange {
                    symbol: self.symbol.clone(),
                    window_start: self.window_start,
                    window_end: self.window_end,
                    high: tick.price,
                    low: tick.price,
                    avg_volume,
                    finalized: false,
                });
            }
        }
        RangeEvent::Updated
    }

    /// Close the window explicitly. No further updates are accepted afterwards.
    pub fn finalize(&mut self) -> RangeEvent {
        if self.phase != RangePhase::Collecting {
            return RangeEvent::Closed;
        }
        match self.range.as_mut() {
            Some(range) => {
                range.finalized = true;
                self.phase = RangePhase::Finalized;
                debug!(
                    symbol = %self.symbol,
                    high = range.high,
                    low = range.low,
                    ticks = self.ticks_seen,
                    "Opening range finalized"
                );
                RangeEvent::Finalized(range.clone())
            }
            None => {
                self.phase = RangePhase::DataGap;
                let issue = DataIssue::DataGap {
                    symbol: self.symbol.clone(),
                };
                warn!("{}", issue);
                RangeEvent::DataGap(issue)
            }
        }
    }
}
