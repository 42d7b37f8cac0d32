//! Run the normalize and transform steps back to back
//! Bronze ingestion happens upstream; this drives bronze -> silver -> gold

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use jqlake::{
    BackendRegistry, BlobStorage, BronzeStorage, GoldStorage, SilverStorage, StorageError,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Start date (YYYYMMDD); defaults to the earliest bronze date
    #[arg(long, value_parser = parse_compact_date)]
    from: Option<NaiveDate>,

    /// End date (YYYYMMDD); defaults to the latest bronze date
    #[arg(long, value_parser = parse_compact_date)]
    to: Option<NaiveDate>,

    /// Reprocess existing silver partitions and replace gold rows
    #[arg(long)]
    force: bool,

    /// Bronze backend name
    #[arg(long, env = "BRONZE_BACKEND", default_value = "demo.bronze")]
    bronze_backend: String,

    /// Silver backend name
    #[arg(long, env = "SILVER_BACKEND", default_value = "demo.silver")]
    silver_backend: String,

    /// Gold backend name
    #[arg(long, env = "GOLD_BACKEND", default_value = "demo.gold")]
    gold_backend: String,
}

fn parse_compact_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .map_err(|e| format!("Expected YYYYMMDD, got '{value}': {e}"))
}

fn main() -> Result<()> {
    jqlake::init_from_env()?;
    let cli = Cli::parse();

    let registry = BackendRegistry::from_env().context("Failed to load backend configuration")?;
    let bronze = Arc::new(BronzeStorage::new(BlobStorage::from_name(
        &registry,
        &cli.bronze_backend,
    )?));
    let silver = Arc::new(SilverStorage::new(
        BlobStorage::from_name(&registry, &cli.silver_backend)?,
        bronze.clone(),
    ));
    let gold = GoldStorage::new(
        BlobStorage::from_name(&registry, &cli.gold_backend)?,
        silver.clone(),
    );

    let available = bronze.list_available_dates("daily_quotes")?;
    if available.is_empty() {
        info!("No bronze daily quotes available; nothing to do");
        return Ok(());
    }
    let start = cli.from.unwrap_or(available[0]);
    let end = cli.to.unwrap_or(available[available.len() - 1]);

    info!("Running pipeline for {start} to {end}");

    let mut normalized = 0u64;
    for date in available.into_iter().filter(|d| *d >= start && *d <= end) {
        match silver.normalize_daily_quotes(date, cli.force) {
            Ok(Some(_)) => normalized += 1,
            Ok(None) => {}
            Err(e @ StorageError::DataQuality(_)) => {
                error!("Validation failed for {date}: {e}")
            }
            Err(e) => error!("Failed to normalize {date}: {e}"),
        }
    }
    info!("Normalized {normalized} dates");

    let stats = gold.transform_daily_prices(Some(start), Some(end), cli.force)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
