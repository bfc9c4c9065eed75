//! Scan command implementation

use anyhow::{Context, Result};
use chrono::NaiveDate;
use orb_trader::backtest::Backtester;
use orb_trader::data::ReplayFeed;
use tracing::info;

pub fn run(config_path: String, data_dir_override: Option<String>, date: String) -> Result<()> {
    let mut config = super::load_config(&config_path)?;
    if let Some(dir) = data_dir_override {
        config.backtest.data_dir = dir;
    }

    let date =
        NaiveDate::parse_from_str(&date, "%Y-%m-%d").context(format!("Invalid date: {}", date))?;
    let feed = ReplayFeed::from_dir(&config.backtest.data_dir, config.session.clone())?;
    let backtester = Backtester::new(config.clone()).context("Invalid configuration")?;
    let candidates = backtester.scan_session(&feed.as_of(date), &feed.symbols(), date)?;

    info!("{} candidates for {}", candidates.len(), date);
    println!(
        "\nGap-up candidates for {} (min gap {:.2}%)",
        date,
        config.scanner.gap_up_min_pct * 100.0
    );
    println!("{}", "-".repeat(48));
    for c in &candidates {
        println!(
            "{:<10} prev={:>10.2} open={:>10.2} gap={:>+7.2}%",
            c.symbol,
            c.previous_close,
            c.session_open,
            c.gap_pct * 100.0
        );
    }
    if candidates.is_empty() {
        println!("(none)");
    }
    Ok(())
}
