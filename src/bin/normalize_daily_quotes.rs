//! Normalize raw daily quotes from the bronze layer into the silver layer

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use jqlake::{BackendRegistry, BlobStorage, BronzeStorage, SilverStorage, StorageError};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Start date (YYYYMMDD); defaults to the earliest bronze date
    #[arg(long, value_parser = parse_compact_date)]
    from: Option<NaiveDate>,

    /// End date (YYYYMMDD); defaults to the latest bronze date
    #[arg(long, value_parser = parse_compact_date)]
    to: Option<NaiveDate>,

    /// Reprocess dates that already exist in silver
    #[arg(long)]
    force: bool,

    /// Bronze backend name
    #[arg(long, env = "BRONZE_BACKEND", default_value = "demo.bronze")]
    bronze_backend: String,

    /// Silver backend name
    #[arg(long, env = "SILVER_BACKEND", default_value = "demo.silver")]
    silver_backend: String,
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
    let silver = SilverStorage::new(
        BlobStorage::from_name(&registry, &cli.silver_backend)?,
        bronze.clone(),
    );

    let available = bronze.list_available_dates("daily_quotes")?;
    if available.is_empty() {
        info!("No bronze daily quotes to normalize");
        return Ok(());
    }

    let start = cli.from.unwrap_or(available[0]);
    let end = cli.to.unwrap_or(available[available.len() - 1]);

    let mut processed = 0u64;
    let mut failed = 0u64;
    for date in available.into_iter().filter(|d| *d >= start && *d <= end) {
        match silver.normalize_daily_quotes(date, cli.force) {
            Ok(Some(key)) => {
                info!("Normalized {date} -> {key}");
                processed += 1;
            }
            Ok(None) => info!("No data for {date}"),
            // A bad partition aborts that date only; the batch continues
            Err(e @ StorageError::DataQuality(_)) => {
                error!("Validation failed for {date}: {e}");
                failed += 1;
            }
            Err(e) => {
                error!("Failed to normalize {date}: {e}");
                failed += 1;
            }
        }
    }

    info!("Normalization complete: {processed} dates processed, {failed} failed");
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
