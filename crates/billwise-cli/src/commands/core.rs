//! Shared command utilities
//!
//! This module contains:
//! - `open_engine` - Load the detection policy and open the database
//! - `parse_as_of` / `parse_sign` - Argument parsing shared by commands
//! - `print_json` - `--json` output

use std::path::Path;

use anyhow::{Context, Result};
use billwise_core::{Database, DetectionConfig, Engine, SignConvention};
use chrono::NaiveDate;
use serde::Serialize;

/// Open the engine on a SQLite database with the resolved detection policy
pub fn open_engine(db_path: &Path, config_path: Option<&Path>) -> Result<Engine> {
    let config = DetectionConfig::load(config_path).context("Failed to load detection config")?;
    let path_str = db_path
        .to_str()
        .context("Database path is not valid UTF-8")?;
    let db = Database::new(path_str)
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
    Ok(Engine::open(db, config))
}

/// Parse an optional YYYY-MM-DD date, defaulting to today
pub fn parse_as_of(date: Option<&str>) -> Result<NaiveDate> {
    match date {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{}' (use YYYY-MM-DD)", s)),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

pub fn parse_sign(sign: &str) -> Result<SignConvention> {
    sign.parse().map_err(|e: String| anyhow::anyhow!(e))
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}
