//! Gold layer: stock-centric merged price history
//! One file per stock, date-unique and date-sorted, merge-updated in place

use arrow::array::{Array, BooleanArray};
use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backend::PutOptions;
use crate::blob::BlobStorage;
use crate::error::{Result, StorageError};
use crate::layers::silver::DAILY_PRICES_TABLE;
use crate::layers::{round_mb, split_partition_key, SilverStorage};
use crate::table::{self, PARQUET_CONTENT_TYPE};

/// Suffix marking an in-flight atomic write.
const TEMP_SUFFIX: &str = ".tmp";

/// Outcome of one silver-to-gold transformation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub dates_processed: u64,
    pub stocks_updated: u64,
    pub records_written: u64,
}

/// Per-stock statistics for the gold tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StockStats {
    pub files: u64,
    pub size_mb: f64,
    pub records: u64,
}

/// Aggregate statistics for the gold tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GoldStats {
    pub stocks: BTreeMap<String, StockStats>,
    pub total_files: u64,
    pub total_size_mb: f64,
    pub total_records: u64,
}

/// Stock-partitioned price storage at `daily_prices/{code}/data.parquet`.
///
/// Files are merge-updated: each pass unions new rows with the existing
/// file, deduplicates keeping the last occurrence per date, sorts, and
/// atomically replaces the file. At most one writer per stock at a time;
/// writers for different stocks are safe concurrently.
pub struct GoldStorage {
    storage: BlobStorage,
    silver: Arc<SilverStorage>,
}

impl GoldStorage {
    pub fn new(storage: BlobStorage, silver: Arc<SilverStorage>) -> Self {
        Self { storage, silver }
    }

    pub fn storage(&self) -> &BlobStorage {
        &self.storage
    }

    pub fn silver(&self) -> &Arc<SilverStorage> {
        &self.silver
    }

    fn gold_key(code: &str) -> String {
        format!("daily_prices/{code}/data.parquet")
    }

    /// Pivot silver daily prices into per-stock gold files.
    ///
    /// With no explicit range, the full silver inventory is processed.
    /// Failures on individual stocks are logged; the pass continues.
    pub fn transform_daily_prices(
        &self,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        force: bool,
    ) -> Result<TransformStats> {
        let available = self.silver.list_available_dates(DAILY_PRICES_TABLE)?;
        let Some((&first, &last)) = available.first().zip(available.last()) else {
            warn!("No data available in silver layer");
            return Ok(TransformStats::default());
        };

        let start = start_date.unwrap_or(first);
        let end = end_date.unwrap_or(last);

        let dates_to_process: Vec<NaiveDate> = available
            .iter()
            .copied()
            .filter(|d| *d >= start && *d <= end)
            .collect();
        if dates_to_process.is_empty() {
            warn!("No silver data in range {start} to {end}");
            return Ok(TransformStats::default());
        }

        info!(
            "Transforming {} dates from silver to gold layer: {} to {}",
            dates_to_process.len(),
            dates_to_process[0],
            dates_to_process[dates_to_process.len() - 1]
        );

        let silver_batch = self.silver.read_daily_prices(start, end, None)?;
        if silver_batch.num_rows() == 0 {
            warn!("No silver data in range {start} to {end}");
            return Ok(TransformStats::default());
        }

        let code_col = table::str_col(&silver_batch, "code")?;
        let codes: BTreeSet<String> = (0..code_col.len())
            .filter(|&i| code_col.is_valid(i))
            .map(|i| code_col.value(i).to_string())
            .collect();

        let date_col = table::date_col(&silver_batch, "date")?;
        let dates_with_data: BTreeSet<i32> = (0..date_col.len())
            .filter(|&i| date_col.is_valid(i))
            .map(|i| date_col.value(i))
            .collect();

        info!(
            "Found {} unique stocks across {} dates",
            codes.len(),
            dates_with_data.len()
        );

        let mut stats = TransformStats {
            dates_processed: dates_with_data.len() as u64,
            ..TransformStats::default()
        };

        for code in &codes {
            let mask: BooleanArray = (0..code_col.len())
                .map(|i| Some(code_col.is_valid(i) && code_col.value(i) == code))
                .collect();
            let stock_rows = table::filter(&silver_batch, &mask)?;

            match self.merge_stock(code, &stock_rows, force) {
                Ok(()) => {
                    stats.stocks_updated += 1;
                    stats.records_written += stock_rows.num_rows() as u64;
                }
                Err(e) => {
                    error!("Failed to update stock {code}: {e}");
                    continue;
                }
            }
        }

        info!(
            "Transformation complete: {} dates, {} stocks updated, {} records written",
            stats.dates_processed, stats.stocks_updated, stats.records_written
        );
        Ok(stats)
    }

    /// Merge new rows into a stock's gold file.
    ///
    /// Without `force`, dates already present are preserved and only new
    /// dates are appended. With `force`, incoming rows replace existing
    /// rows for the same date (the incoming row is the last occurrence at
    /// dedup time because it is concatenated after the existing rows).
    fn merge_stock(&self, code: &str, new_rows: &RecordBatch, force: bool) -> Result<()> {
        let gold_key = Self::gold_key(code);

        let merged = if self.storage.exists(&gold_key)? {
            let existing = table::read_parquet(self.storage.get(&gold_key)?)?;

            let mut incoming = new_rows.clone();
            if !force {
                let existing_dates: HashSet<i32> = {
                    let dates = table::date_col(&existing, "date")?;
                    (0..dates.len())
                        .filter(|&i| dates.is_valid(i))
                        .map(|i| dates.value(i))
                        .collect()
                };
                let dates = table::date_col(&incoming, "date")?;
                let keep: BooleanArray = (0..dates.len())
                    .map(|i| Some(dates.is_valid(i) && !existing_dates.contains(&dates.value(i))))
                    .collect();
                incoming = table::filter(&incoming, &keep)?;

                if incoming.num_rows() == 0 {
                    debug!("No new data to add for {code}");
                    return Ok(());
                }
            }

            table::concat(&[existing, incoming])?
        } else {
            new_rows.clone()
        };

        // Keep-last dedup doubles as the date sort
        let deduped = table::dedup_keep_last_by_date(&merged)?;
        self.write_atomic(&gold_key, &deduped)
    }

    /// Write a batch so readers only ever observe a complete Parquet file.
    ///
    /// The bytes land under a temp key first; the final key is then
    /// replaced in a single put (atomic per object on S3, rename-backed on
    /// the filesystem) and the temp key is dropped.
    fn write_atomic(&self, blob_key: &str, batch: &RecordBatch) -> Result<()> {
        let parquet = table::write_parquet(batch)?;
        let temp_key = format!("{blob_key}{TEMP_SUFFIX}");
        let opts = PutOptions::with_content_type(PARQUET_CONTENT_TYPE);

        self.storage.put(&temp_key, &parquet, &opts)?;
        self.storage.put(blob_key, &self.storage.get(&temp_key)?, &opts)?;
        if let Err(e) = self.storage.delete(&temp_key) {
            // Final key is already in place; the orphan is swept later
            warn!("Failed to clean up temp key {temp_key}: {e}");
        }
        Ok(())
    }

    /// Delete orphaned `.tmp` keys older than `older_than`, left behind by
    /// interrupted transforms. Returns the number of keys removed.
    pub fn cleanup_orphan_temps(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| StorageError::InvalidArgument(format!("Bad threshold: {e}")))?;

        let mut removed = 0;
        for blob in self.storage.list(Some("daily_prices/"))? {
            if blob.key.ends_with(TEMP_SUFFIX) && blob.last_modified < cutoff {
                match self.storage.delete(&blob.key) {
                    Ok(()) => {
                        info!("Removed orphan temp key: {}", blob.key);
                        removed += 1;
                    }
                    Err(e) => warn!("Failed to remove orphan temp key {}: {e}", blob.key),
                }
            }
        }
        Ok(removed)
    }

    /// Read one stock's daily prices, optionally date-bounded and projected.
    ///
    /// `date` and `code` are always included in a projection; requesting a
    /// column the file does not have is an error.
    pub fn read_stock_prices(
        &self,
        code: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
        columns: Option<&[String]>,
    ) -> Result<RecordBatch> {
        let gold_key = Self::gold_key(code);
        if !self.storage.exists(&gold_key)? {
            warn!("No gold data for stock {code}");
            return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
        }

        let mut batch = table::read_parquet(self.storage.get(&gold_key)?)?;

        if start_date.is_some() || end_date.is_some() {
            let dates = table::date_col(&batch, "date")?;
            let start = start_date.map(table::naive_to_date32);
            let end = end_date.map(table::naive_to_date32);
            let mask: BooleanArray = (0..dates.len())
                .map(|i| {
                    let keep = dates.is_valid(i)
                        && start.map_or(true, |s| dates.value(i) >= s)
                        && end.map_or(true, |e| dates.value(i) <= e);
                    Some(keep)
                })
                .collect();
            batch = table::filter(&batch, &mask)?;
        }

        if let Some(columns) = columns {
            batch = project_with_keys(&batch, columns)?;
        }

        table::sort_by(&batch, &["date"])
    }

    /// All stock codes with a gold file, sorted ascending.
    pub fn list_available_stocks(&self) -> Result<Vec<String>> {
        let mut stocks = BTreeSet::new();
        for blob in self.storage.list(Some("daily_prices/"))? {
            if let Some((_, code)) = split_partition_key(&blob.key) {
                stocks.insert(code.to_string());
            }
        }
        Ok(stocks.into_iter().collect())
    }

    /// Aggregate storage statistics, optionally restricted to one stock.
    ///
    /// Record counts come from the Parquet footer, so no column data is
    /// decoded.
    pub fn get_storage_stats(&self, stock: Option<&str>) -> Result<GoldStats> {
        let prefix = match stock {
            Some(code) => format!("daily_prices/{code}/"),
            None => "daily_prices/".to_string(),
        };

        let mut stats = GoldStats::default();
        for blob in self.storage.list(Some(&prefix))? {
            let Some((_, code)) = split_partition_key(&blob.key) else {
                continue;
            };

            let records = match self
                .storage
                .get(&blob.key)
                .and_then(table::parquet_row_count)
            {
                Ok(count) => count,
                Err(e) => {
                    warn!("Failed to count records in {}: {e}", blob.key);
                    0
                }
            };

            let entry = stats.stocks.entry(code.to_string()).or_default();
            let size_mb = blob.size as f64 / (1024.0 * 1024.0);
            entry.files += 1;
            entry.size_mb += size_mb;
            entry.records += records;
            stats.total_files += 1;
            stats.total_size_mb += size_mb;
            stats.total_records += records;
        }

        stats.total_size_mb = round_mb(stats.total_size_mb);
        for entry in stats.stocks.values_mut() {
            entry.size_mb = round_mb(entry.size_mb);
        }
        Ok(stats)
    }
}

/// Project a batch to the requested columns plus `date` and `code`,
/// preserving the file's column order.
fn project_with_keys(batch: &RecordBatch, columns: &[String]) -> Result<RecordBatch> {
    let mut wanted: HashSet<&str> = columns.iter().map(String::as_str).collect();
    wanted.insert("date");
    wanted.insert("code");

    for column in columns {
        if !table::has_column(batch, column) {
            return Err(StorageError::InvalidArgument(format!(
                "Column not found: {column}"
            )));
        }
    }

    let indices: Vec<usize> = batch
        .schema()
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, field)| wanted.contains(field.name().as_str()))
        .map(|(i, _)| i)
        .collect();
    Ok(batch.project(&indices)?)
}
