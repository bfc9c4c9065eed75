//! Subcommand implementations

pub mod backtest;
pub mod scan;

use anyhow::Result;
use orb_trader::Config;
use std::path::Path;
use tracing::{info, warn};

/// Load and validate the config, or fall back to defaults when the file is absent
pub fn load_config(config_path: &str) -> Result<Config> {
    if !Path::new(config_path).exists() {
        warn!("Config file {} not found, using defaults", config_path);
        return Ok(Config::default());
    }
    let config = Config::from_file(config_path)?;
    info!("Loaded configuration from: {}", config_path);
    Ok(config)
}
