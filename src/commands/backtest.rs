//! Backtest command implementation

use anyhow::{Context, Result};
use chrono::NaiveDate;
use orb_trader::backtest::{BacktestSummary, Backtester};
use orb_trader::data::{self, ReplayFeed};
use std::path::PathBuf;
use tracing::{debug, info};

pub fn run(
    config_path: String,
    data_dir_override: Option<String>,
    capital_override: Option<f64>,
    date: Option<String>,
) -> Result<()> {
    info!("Starting backtest");

    let mut config = super::load_config(&config_path)?;

    if let Some(dir) = data_dir_override {
        info!("Overriding data directory to: {}", dir);
        config.backtest.data_dir = dir;
    }
    if let Some(capital) = capital_override {
        info!("Overriding starting capital to: {:.2}", capital);
        config.risk.starting_capital = capital;
    }
    let backtester = Backtester::new(config.clone()).context("Invalid configuration")?;

    info!("Loading data from: {}", config.backtest.data_dir);
    let feed = ReplayFeed::from_dir(&config.backtest.data_dir, config.session.clone())?;
    debug!("Symbols: {:?}", feed.symbols());

    let (sessions, trades, ending_capital) = match date {
        Some(date) => {
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                .context(format!("Invalid date: {}", date))?;
            let mut coordinator = backtester.coordinator();
            let report =
                backtester.run_session(&mut coordinator, &feed.as_of(date), &feed.symbols(), date)?;
            let trades = report.trades.clone();
            (vec![report], trades, coordinator.risk().capital())
        }
        None => {
            let result = backtester.run(&feed)?;
            (result.sessions, result.trades, result.ending_capital)
        }
    };
    let summary = BacktestSummary::from_trades(&trades, config.risk.starting_capital);

    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let results_dir = PathBuf::from(&config.backtest.results_dir);
    data::save_trades_csv(&trades, results_dir.join(format!("trades_{}.csv", stamp)))?;
    let report_path = results_dir.join(format!("sessions_{}.json", stamp));
    std::fs::write(&report_path, serde_json::to_string_pretty(&sessions)?)
        .context(format!("Failed to write {}", report_path.display()))?;
    info!("Session reports written to {}", report_path.display());

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));
    println!("Sessions:           {}", sessions.len());
    println!("Starting Capital:   {:.2}", config.risk.starting_capital);
    println!("Ending Capital:     {:.2}", ending_capital);
    println!("Total P&L:          {:.2}", summary.total_pnl);
    println!("Max Drawdown:       {:.2}%", summary.max_drawdown);
    println!("Win Rate:           {:.2}%", summary.win_rate);
    println!("Profit Factor:      {:.2}", summary.profit_factor);
    println!("Total Trades:       {}", summary.total_trades);
    println!("Winning Trades:     {}", summary.winning_trades);
    println!("Losing Trades:      {}", summary.losing_trades);
    println!("Average Win:        {:.2}", summary.avg_win);
    println!("Average Loss:       {:.2}", summary.avg_loss);
    println!("Largest Win:        {:.2}", summary.largest_win);
    println!("Largest Loss:       {:.2}", summary.largest_loss);
    println!("{}", "=".repeat(60));

    for session in &sessions {
        let blocked = session
            .final_state
            .blocked_by
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  candidates={:<3} trades={:<2} pnl={:+.2}%  blocked: {}",
            session.date,
            session.candidates.len(),
            session.trades.len(),
            session.final_state.cumulative_pnl_pct * 100.0,
            blocked
        );
    }

    info!("Backtest completed successfully");
    Ok(())
}
