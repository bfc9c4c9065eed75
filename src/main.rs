//! Opening range breakout trader - main entry point
//!
//! This binary provides two subcommands:
//! - backtest: Replay recorded ticks through the strategy
//! - scan: Show gap-up candidates for one session

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

const DEFAULT_CONFIG: &str = "configs/default.json";

#[derive(Parser, Debug)]
#[command(name = "orb-trader")]
#[command(about = "Gap-up opening range breakout trader with daily kill switch", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay recorded sessions
    Backtest {
        /// Path to configuration file (falls back to ORB_CONFIG)
        #[arg(short, long)]
        config: Option<String>,

        /// Directory with ticks.csv and previous_close.csv (overrides config)
        #[arg(short, long)]
        data_dir: Option<String>,

        /// Starting capital (overrides config)
        #[arg(long)]
        capital: Option<f64>,

        /// Replay only this session (YYYY-MM-DD)
        #[arg(long)]
        date: Option<String>,
    },

    /// Scan one session for gap-up candidates
    Scan {
        /// Path to configuration file (falls back to ORB_CONFIG)
        #[arg(short, long)]
        config: Option<String>,

        /// Directory with ticks.csv and previous_close.csv (overrides config)
        #[arg(short, long)]
        data_dir: Option<String>,

        /// Session date (YYYY-MM-DD)
        #[arg(long)]
        date: String,
    },
}

fn resolve_config_path(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("ORB_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string())
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    // Same format without ANSI colors
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!("Logging initialized");
    info!("Log file: {}", log_path.display());
    Ok(())
}

fn main() -> Result<()> {
    // Optional .env with RUST_LOG / ORB_CONFIG
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let command_name = match &cli.command {
        Commands::Backtest { .. } => "backtest",
        Commands::Scan { .. } => "scan",
    };
    setup_logging(cli.verbose, command_name)?;

    match cli.command {
        Commands::Backtest {
            config,
            data_dir,
            capital,
            date,
        } => commands::backtest::run(resolve_config_path(config), data_dir, capital, date),

        Commands::Scan {
            config,
            data_dir,
            date,
        } => commands::scan::run(resolve_config_path(config), data_dir, date),
    }
}
