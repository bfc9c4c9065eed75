//! Recorded market data
//!
//! Loads tick history and previous closes from CSV and replays them through
//! the `MarketDataPort` interface.
//!
//! File layout inside a data directory:
//! - `ticks.csv`: `timestamp,symbol,price,volume`
//! - `previous_close.csv`: `symbol,previous_close` (reference closes for the first session)

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::ports::MarketDataPort;
use crate::session::{trading_date, SessionClock};
use crate::{Symbol, Tick, Trade};

pub const TICKS_FILE: &str = "ticks.csv";
pub const PREVIOUS_CLOSE_FILE: &str = "previous_close.csv";

#[derive(Debug, Deserialize)]
struct TickRow {
    timestamp: String,
    symbol: String,
    price: f64,
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct CloseRow {
    symbol: String,
    previous_close: f64,
}

/// RFC 3339, or `%Y-%m-%d %H:%M:%S` assumed UTC
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .context(format!("Failed to parse timestamp: {}", s))
}

/// Load ticks grouped by symbol, each series sorted by timestamp.
///
/// Rows keep their file order for equal timestamps.
pub fn load_ticks_csv(path: impl AsRef<Path>) -> Result<HashMap<Symbol, Vec<Tick>>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .context(format!("Failed to open tick file {}", path.display()))?;

    let mut ticks: HashMap<Symbol, Vec<Tick>> = HashMap::new();
    for (row_idx, result) in reader.deserialize::<TickRow>().enumerate() {
        let row = result.context(format!("Failed to read row {}", row_idx + 1))?;
        let timestamp = parse_timestamp(&row.timestamp)?;
        ticks.entry(Symbol::new(row.symbol)).or_default().push(Tick {
            timestamp,
            price: row.price,
            volume: row.volume,
        });
    }

    for series in ticks.values_mut() {
        series.sort_by_key(|t| t.timestamp);
    }
    info!(
        "Loaded {} ticks for {} symbols from {}",
        ticks.values().map(Vec::len).sum::<usize>(),
        ticks.len(),
        path.display()
    );
    Ok(ticks)
}

pub fn load_previous_closes(path: impl AsRef<Path>) -> Result<HashMap<Symbol, f64>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .context(format!("Failed to open previous close file {}", path.display()))?;

    let mut closes = HashMap::new();
    for (row_idx, result) in reader.deserialize::<CloseRow>().enumerate() {
        let row = result.context(format!("Failed to read row {}", row_idx + 1))?;
        closes.insert(Symbol::new(row.symbol), row.previous_close);
    }
    Ok(closes)
}

/// Write closed trades to CSV
pub fn save_trades_csv(trades: &[Trade], path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(&path)
        .context(format!("Failed to create {}", path.display()))?;
    for trade in trades {
        writer.serialize(trade)?;
    }
    writer.flush()?;
    info!("Saved {} trades to {}", trades.len(), path.display());
    Ok(path)
}

/// Recorded tick history for a set of symbols
#[derive(Debug, Clone, Default)]
pub struct ReplayFeed {
    ticks: HashMap<Symbol, Vec<Tick>>,
    /// Reference closes for the first recorded session
    closes: HashMap<Symbol, f64>,
    session: SessionConfig,
}

impl ReplayFeed {
    pub fn new(
        ticks: HashMap<Symbol, Vec<Tick>>,
        closes: HashMap<Symbol, f64>,
        session: SessionConfig,
    ) -> Self {
        ReplayFeed {
            ticks,
            closes,
            session,
        }
    }

    /// Load `ticks.csv` and (optionally) `previous_close.csv` from a directory
    pub fn from_dir(dir: impl AsRef<Path>, session: SessionConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let ticks = load_ticks_csv(dir.join(TICKS_FILE))?;
        let close_path = dir.join(PREVIOUS_CLOSE_FILE);
        let closes = if close_path.exists() {
            load_previous_closes(&close_path)?
        } else {
            warn!(
                "{} not found; first session has no reference closes",
                close_path.display()
            );
            HashMap::new()
        };
        Ok(Self::new(ticks, closes, session))
    }

    /// Every symbol with recorded ticks, sorted
    pub fn symbols(&self) -> Vec<Symbol> {
        let set: BTreeSet<&Symbol> = self.ticks.keys().collect();
        set.into_iter().cloned().collect()
    }

    /// Trading dates present in the history, ascending
    pub fn dates(&self) -> Result<Vec<NaiveDate>> {
        let mut dates = BTreeSet::new();
        for tick in self.ticks.values().flatten() {
            dates.insert(trading_date(tick.timestamp, &self.session)?);
        }
        Ok(dates.into_iter().collect())
    }

    /// Last regular-session price per trading date for one symbol.
    /// Pre-market and after-hours prints never set a close.
    fn daily_closes(&self, symbol: &Symbol) -> Result<BTreeMap<NaiveDate, f64>> {
        let mut closes = BTreeMap::new();
        let mut clocks: HashMap<NaiveDate, SessionClock> = HashMap::new();
        if let Some(series) = self.ticks.get(symbol) {
            for tick in series {
                let date = trading_date(tick.timestamp, &self.session)?;
                let clock = match clocks.get(&date) {
                    Some(clock) => *clock,
                    None => {
                        let clock = SessionClock::for_date(date, &self.session)?;
                        clocks.insert(date, clock);
                        clock
                    }
                };
                if clock.in_session(tick.timestamp) {
                    closes.insert(date, tick.price);
                }
            }
        }
        Ok(closes)
    }

    /// View of the history as it looked at the open of `date`
    pub fn as_of(&self, date: NaiveDate) -> ReplayView<'_> {
        ReplayView { feed: self, date }
    }
}

/// `MarketDataPort` over a `ReplayFeed` for one session date.
///
/// The previous close is the last recorded price of an earlier trading date,
/// falling back to the reference closes file.
#[derive(Debug, Clone, Copy)]
pub struct ReplayView<'a> {
    feed: &'a ReplayFeed,
    date: NaiveDate,
}

impl MarketDataPort for ReplayView<'_> {
    fn get_previous_close(&self, symbol: &Symbol) -> Result<f64> {
        let recorded = self
            .feed
            .daily_closes(symbol)?
            .range(..self.date)
            .next_back()
            .map(|(_, price)| *price);
        recorded
            .or_else(|| self.feed.closes.get(symbol).copied())
            .context(format!("No previous close for {} before {}", symbol, self.date))
    }

    fn stream_ticks(&self, symbol: &Symbol, session_date: NaiveDate) -> Result<Vec<Tick>> {
        let Some(series) = self.feed.ticks.get(symbol) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for tick in series {
            if trading_date(tick.timestamp, &self.feed.session)? == session_date {
                out.push(*tick);
            }
        }
        Ok(out)
    }
}
