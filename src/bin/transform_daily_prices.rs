//! Transform silver daily prices into the stock-centric gold layer

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use jqlake::{BackendRegistry, BlobStorage, BronzeStorage, GoldStorage, SilverStorage};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Start date (YYYYMMDD); defaults to the earliest silver date
    #[arg(long, value_parser = parse_compact_date)]
    from: Option<NaiveDate>,

    /// End date (YYYYMMDD); defaults to the latest silver date
    #[arg(long, value_parser = parse_compact_date)]
    to: Option<NaiveDate>,

    /// Replace gold rows for dates that already exist
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
        bronze,
    ));
    let gold = GoldStorage::new(BlobStorage::from_name(&registry, &cli.gold_backend)?, silver);

    // Sweep temp keys abandoned by interrupted runs before writing
    let removed = gold.cleanup_orphan_temps(Duration::from_secs(3600))?;
    if removed > 0 {
        info!("Removed {removed} orphan temp keys");
    }

    let stats = gold.transform_daily_prices(cli.from, cli.to, cli.force)?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
