//! Live session runner
//!
//! One tokio task per candidate owns its `SymbolEvaluator` and tick feed.
//! Tasks forward accepted ticks and Entry signals over an mpsc channel to the
//! coordinator loop, the only writer of risk state. A `watch` channel carries
//! the entries-allowed gate back to the tasks; they check it before sending
//! an Entry but keep forwarding ticks so exits are still managed.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{Coordinator, SessionReport};
use crate::error::{ConfigError, DataIssue};
use crate::ports::OrderPort;
use crate::session::{SessionClock, SymbolEvaluator};
use crate::{Config, GapCandidate, Signal, Symbol, Tick};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Messages from symbol tasks to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Tick { symbol: Symbol, tick: Tick },
    Entry { signal: Signal, range_low: Option<f64> },
    Issue(DataIssue),
}

/// Tick feed for one candidate
pub struct SymbolFeed {
    pub candidate: GapCandidate,
    pub ticks: mpsc::Receiver<Tick>,
}

async fn evaluate_symbol(
    mut evaluator: SymbolEvaluator,
    mut ticks: mpsc::Receiver<Tick>,
    events: mpsc::Sender<SessionEvent>,
    gate: watch::Receiver<bool>,
) {
    let symbol = evaluator.symbol().clone();

    while let Some(tick) = ticks.recv().await {
        let outcome = evaluator.on_tick(&tick);

        let mut out = Vec::with_capacity(2);
        if let Some(issue) = outcome.issue {
            out.push(SessionEvent::Issue(issue));
        }
        if outcome.accepted {
            out.push(SessionEvent::Tick {
                symbol: symbol.clone(),
                tick,
            });
        }
        if let Some(signal) = outcome.entry {
            if *gate.borrow() {
                out.push(SessionEvent::Entry {
                    signal,
                    range_low: evaluator.range_low(),
                });
            } else {
                debug!(symbol = %symbol, "Entry gate closed; breakout not forwarded");
            }
        }

        for event in out {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }

    if let Some(issue) = evaluator.close_range() {
        let _ = events.send(SessionEvent::Issue(issue)).await;
    }
    debug!(symbol = %symbol, "Feed closed");
}

/// One live trading session
pub struct LiveSession<O: OrderPort> {
    config: Config,
    clock: SessionClock,
    coordinator: Coordinator<O>,
}

impl<O: OrderPort> LiveSession<O> {
    pub fn new(
        config: Config,
        clock: SessionClock,
        coordinator: Coordinator<O>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(LiveSession {
            config,
            clock,
            coordinator,
        })
    }

    /// Hand the coordinator back (capital carries into the next session)
    pub fn into_coordinator(self) -> Coordinator<O> {
        self.coordinator
    }

    fn gate_open(&self, latest: Option<DateTime<Utc>>) -> bool {
        let within_window = latest.map_or(true, |ts| ts <= self.clock.entry_cutoff);
        self.coordinator.entries_allowed() && within_window
    }

    /// Run until every feed closes or `stop` flips to true, then force EOD
    /// exits and abort the remaining tasks.
    pub async fn run(
        &mut self,
        feeds: Vec<SymbolFeed>,
        mut stop: watch::Receiver<bool>,
    ) -> SessionReport {
        let candidates: Vec<GapCandidate> = feeds.iter().map(|f| f.candidate.clone()).collect();
        self.coordinator.begin_session(self.clock.date, candidates);

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (gate_tx, gate_rx) = watch::channel(self.gate_open(None));

        let volume_multiplier = self.config.session.breakout_volume_multiplier;
        let handles: Vec<JoinHandle<()>> = feeds
            .into_iter()
            .map(|feed| {
                let evaluator = SymbolEvaluator::new(feed.candidate, self.clock, volume_multiplier);
                tokio::spawn(evaluate_symbol(
                    evaluator,
                    feed.ticks,
                    events_tx.clone(),
                    gate_rx.clone(),
                ))
            })
            .collect();
        drop(events_tx);
        info!("Monitoring {} candidates", handles.len());

        let mut latest: Option<DateTime<Utc>> = None;
        let mut stop_open = true;
        loop {
            tokio::select! {
                biased;

                changed = stop.changed(), if stop_open => {
                    match changed {
                        Ok(()) if *stop.borrow() => {
                            info!("Stop requested, ending session");
                            break;
                        }
                        Ok(()) => {}
                        Err(_) => stop_open = false,
                    }
                }

                event = events_rx.recv() => {
                    let Some(event) = event else {
                        info!("All feeds closed");
                        break;
                    };
                    match event {
                        SessionEvent::Tick { symbol, tick } => {
                            latest = Some(latest.map_or(tick.timestamp, |ts| ts.max(tick.timestamp)));
                            self.coordinator.on_tick(&symbol, &tick);
                        }
                        SessionEvent::Entry { signal, range_low } => {
                            self.coordinator.on_entry(&signal, range_low);
                        }
                        SessionEvent::Issue(issue) => self.coordinator.record_issue(issue),
                    }
                }
            }

            let open = self.gate_open(latest);
            gate_tx.send_if_modified(|current| {
                if *current != open {
                    *current = open;
                    true
                } else {
                    false
                }
            });
        }

        let report = self.coordinator.finish_session(self.clock.close);
        for handle in handles {
            if !handle.is_finished() {
                warn!("Aborting symbol task still running at session end");
                handle.abort();
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SimulatedBroker;
    use crate::risk::RiskManager;
    use crate::ExitReason;
    use chrono::{Duration, NaiveDate};

    fn clock() -> SessionClock {
        let config = Config::default();
        SessionClock::for_date(NaiveDate::from_ymd_opt(2024, 1, 11).unwrap(), &config.session)
            .unwrap()
    }

    fn session() -> LiveSession<SimulatedBroker> {
        let config = Config::default();
        let coordinator = Coordinator::new(
            RiskManager::new(config.risk.clone()),
            SimulatedBroker::new(0.0),
        );
        LiveSession::new(config, clock(), coordinator).unwrap()
    }

    fn candidate(symbol: &str) -> GapCandidate {
        GapCandidate {
            symbol: Symbol::new(symbol),
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

    #[tokio::test]
    async fn test_live_session_trades_and_closes_at_eod() {
        let (tx, rx) = mpsc::channel(64);
        for t in [tick(0, 10.35), tick(2, 10.40), tick(6, 10.45), tick(30, 10.60)] {
            tx.send(t).await.unwrap();
        }
        drop(tx);

        let (_stop_tx, stop_rx) = watch::channel(false);
        let mut live = session();
        let report = live
            .run(
                vec![SymbolFeed {
                    candidate: candidate("X"),
                    ticks: rx,
                }],
                stop_rx,
            )
            .await;

        assert_eq!(report.trades.len(), 1);
        assert_eq!(report.trades[0].reason, ExitReason::Eod);
        assert_eq!(report.trades[0].exit_price, 10.60);
        assert!(report.open_positions.is_empty());
    }

    #[tokio::test]
    async fn test_stop_signal_ends_session() {
        let (tx, rx) = mpsc::channel(64);
        tx.send(tick(0, 10.35)).await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut live = session();
        let feeds = vec![SymbolFeed {
            candidate: candidate("X"),
            ticks: rx,
        }];
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            stop_tx.send(true).unwrap();
            tx
        });

        let report = live.run(feeds, stop_rx).await;
        let _tx = handle.await.unwrap();
        assert!(report.trades.is_empty());
        assert!(report.final_state.is_active());
    }

    #[tokio::test]
    async fn test_empty_feed_reports_data_gap() {
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let mut live = session();
        let report = live
            .run(
                vec![SymbolFeed {
                    candidate: candidate("X"),
                    ticks: rx,
                }],
                stop_rx,
            )
            .await;
        assert_eq!(report.data_gaps, vec![Symbol::new("X")]);
    }
}
