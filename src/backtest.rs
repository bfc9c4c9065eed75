//! Backtesting engine
//!
//! Replays recorded ticks through the same scanner, evaluators and
//! coordinator used live. Per-symbol series are merged into one stream
//! ordered by (timestamp, candidate rank), so identical input always yields
//! identical trades and risk trajectory.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::data::ReplayFeed;
use crate::engine::{Coordinator, SessionReport};
use crate::error::ConfigError;
use crate::ports::{MarketDataPort, OrderPort, SimulatedBroker};
use crate::risk::RiskManager;
use crate::scanner::{scan, UniverseEntry};
use crate::session::{SessionClock, SymbolEvaluator};
use crate::{Config, GapCandidate, Symbol, Tick, Trade};

/// Trade statistics over a whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percentage (0-100)
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_pnl_pct: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub profit_factor: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Percentage, over the capital curve after each trade
    pub max_drawdown: f64,
}

impl BacktestSummary {
    pub fn from_trades(trades: &[Trade], starting_capital: f64) -> Self {
        if trades.is_empty() {
            return BacktestSummary::default();
        }

        let (winning, losing): (Vec<&Trade>, Vec<&Trade>) =
            trades.iter().partition(|t| !t.is_loss());
        let wins: Vec<&Trade> = winning.into_iter().filter(|t| t.pnl_abs > 0.0).collect();

        let gross_profits: f64 = wins.iter().map(|t| t.pnl_abs).sum();
        let gross_losses: f64 = losing.iter().map(|t| t.pnl_abs.abs()).sum();

        let profit_factor = if gross_losses > 0.0 {
            gross_profits / gross_losses
        } else if gross_profits > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_win = if !wins.is_empty() {
            gross_profits / wins.len() as f64
        } else {
            0.0
        };
        let avg_loss = if !losing.is_empty() {
            gross_losses / losing.len() as f64
        } else {
            0.0
        };

        let largest_win = wins.iter().map(|t| t.pnl_abs).fold(0.0, f64::max);
        let largest_loss = losing.iter().map(|t| t.pnl_abs).fold(0.0, f64::min);

        let mut equity = starting_capital;
        let mut peak = starting_capital;
        let mut max_dd = 0.0;
        for trade in trades {
            equity += trade.pnl_abs;
            if equity > peak {
                peak = equity;
            }
            if peak > 0.0 {
                let dd = (peak - equity) / peak;
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }

        BacktestSummary {
            total_trades: trades.len(),
            winning_trades: wins.len(),
            losing_trades: losing.len(),
            win_rate: (wins.len() as f64 / trades.len() as f64) * 100.0,
            total_pnl: trades.iter().map(|t| t.pnl_abs).sum(),
            avg_pnl_pct: trades.iter().map(|t| t.pnl_pct).sum::<f64>() / trades.len() as f64,
            avg_win,
            avg_loss,
            profit_factor,
            largest_win,
            largest_loss,
            max_drawdown: max_dd * 100.0,
        }
    }
}

/// Multi-session backtest output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub sessions: Vec<SessionReport>,
    pub trades: Vec<Trade>,
    pub summary: BacktestSummary,
    pub starting_capital: f64,
    pub ending_capital: f64,
}

/// Backtest engine
pub struct Backtester {
    config: Config,
}

impl Backtester {
    /// Fails on an invalid configuration instead of replaying with it
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Backtester { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Coordinator over a fresh risk manager and the simulated broker
    pub fn coordinator(&self) -> Coordinator<SimulatedBroker> {
        Coordinator::new(
            RiskManager::new(self.config.risk.clone()),
            SimulatedBroker::new(self.config.backtest.slippage_pct),
        )
    }

    /// Build the scanner universe: previous close plus the first in-session
    /// print as the session open. Symbols missing either are skipped.
    fn load_universe<M: MarketDataPort>(
        &self,
        data: &M,
        symbols: &[Symbol],
        clock: &SessionClock,
    ) -> Result<(Vec<UniverseEntry>, HashMap<Symbol, Vec<Tick>>)> {
        let mut universe = Vec::new();
        let mut series = HashMap::new();

        for symbol in symbols {
            let ticks = data
                .stream_ticks(symbol, clock.date)
                .context(format!("Failed to stream ticks for {}", symbol))?;
            let Some(open) = ticks
                .iter()
                .find(|t| clock.in_session(t.timestamp) && t.validate().is_ok())
            else {
                debug!(symbol = %symbol, date = %clock.date, "No session ticks; skipping");
                continue;
            };
            let previous_close = match data.get_previous_close(symbol) {
                Ok(close) => close,
                Err(e) => {
                    warn!(symbol = %symbol, "Skipping: {:#}", e);
                    continue;
                }
            };
            universe.push(UniverseEntry::new(symbol.clone(), previous_close, open.price));
            series.insert(symbol.clone(), ticks);
        }
        Ok((universe, series))
    }

    /// Scanner output for one session, without replaying it
    pub fn scan_session<M: MarketDataPort>(
        &self,
        data: &M,
        symbols: &[Symbol],
        date: NaiveDate,
    ) -> Result<Vec<GapCandidate>> {
        let clock = SessionClock::for_date(date, &self.config.session)?;
        let (universe, _) = self.load_universe(data, symbols, &clock)?;
        Ok(scan(&universe, &self.config.scanner))
    }

    /// Replay one session through `coordinator`
    pub fn run_session<M: MarketDataPort, O: OrderPort>(
        &self,
        coordinator: &mut Coordinator<O>,
        data: &M,
        symbols: &[Symbol],
        date: NaiveDate,
    ) -> Result<SessionReport> {
        let clock = SessionClock::for_date(date, &self.config.session)?;
        let (universe, mut series) = self.load_universe(data, symbols, &clock)?;

        let candidates = scan(&universe, &self.config.scanner);
        coordinator.begin_session(date, candidates.clone());

        let volume_multiplier = self.config.session.breakout_volume_multiplier;
        let mut evaluators: Vec<SymbolEvaluator> = candidates
            .into_iter()
            .map(|c| SymbolEvaluator::new(c, clock, volume_multiplier))
            .collect();

        let streams: Vec<Vec<(usize, Tick)>> = evaluators
            .iter()
            .enumerate()
            .map(|(rank, ev)| {
                series
                    .remove(ev.symbol())
                    .unwrap_or_default()
                    .into_iter()
                    .map(|tick| (rank, tick))
                    .collect()
            })
            .collect();

        let merged = streams
            .into_iter()
            .map(|s| s.into_iter())
            .kmerge_by(|a, b| (a.1.timestamp, a.0) < (b.1.timestamp, b.0));

        for (rank, tick) in merged {
            let evaluator = &mut evaluators[rank];
            let outcome = evaluator.on_tick(&tick);
            if let Some(issue) = outcome.issue {
                coordinator.record_issue(issue);
            }
            if outcome.accepted {
                let symbol = evaluator.symbol().clone();
                coordinator.on_tick(&symbol, &tick);
            }
            if let Some(signal) = outcome.entry {
                coordinator.on_entry(&signal, evaluator.range_low());
            }
        }

        for evaluator in evaluators.iter_mut() {
            if let Some(issue) = evaluator.close_range() {
                coordinator.record_issue(issue);
            }
        }

        Ok(coordinator.finish_session(clock.close))
    }

    /// Replay every session in the feed. Daily limits reset per session,
    /// capital carries over.
    pub fn run(&self, feed: &ReplayFeed) -> Result<BacktestResult> {
        let symbols = feed.symbols();
        let dates = feed.dates()?;
        info!(
            "Backtesting {} symbols over {} sessions",
            symbols.len(),
            dates.len()
        );

        let mut coordinator = self.coordinator();
        let mut sessions = Vec::with_capacity(dates.len());
        for date in dates {
            let report = self.run_session(&mut coordinator, &feed.as_of(date), &symbols, date)?;
            sessions.push(report);
        }

        let trades: Vec<Trade> = sessions.iter().flat_map(|s| s.trades.clone()).collect();
        let starting_capital = self.config.risk.starting_capital;
        let summary = BacktestSummary::from_trades(&trades, starting_capital);
        Ok(BacktestResult {
            sessions,
            trades,
            summary,
            starting_capital,
            ending_capital: coordinator.risk().capital(),
        })
    }
}
