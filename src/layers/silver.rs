//! Silver layer: normalized daily price tables with data quality validation
//! Derived from bronze, regenerable, partitioned by date

use arrow::array::{
    new_null_array, Array, ArrayRef, BooleanArray, Float64Array, StringArray,
};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::PutOptions;
use crate::blob::BlobStorage;
use crate::error::{Result, StorageError};
use crate::layers::{round_mb, split_partition_key, BronzeStorage};
use crate::table::{self, PARQUET_CONTENT_TYPE};

/// Bronze endpoint feeding the daily price table.
const DAILY_QUOTES_ENDPOINT: &str = "daily_quotes";

/// Silver table name for normalized daily prices.
pub const DAILY_PRICES_TABLE: &str = "daily_prices";

/// Per-table statistics for the silver tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableStats {
    pub dates: u64,
    pub files: u64,
    pub size_mb: f64,
}

/// Aggregate statistics for the silver tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SilverStats {
    pub tables: BTreeMap<String, TableStats>,
    pub total_files: u64,
    pub total_size_mb: f64,
}

/// Normalized timeseries storage partitioned as
/// `{table}/{YYYY-MM-DD}/data.parquet`.
pub struct SilverStorage {
    storage: BlobStorage,
    bronze: Arc<BronzeStorage>,
}

impl SilverStorage {
    pub fn new(storage: BlobStorage, bronze: Arc<BronzeStorage>) -> Self {
        Self { storage, bronze }
    }

    pub fn storage(&self) -> &BlobStorage {
        &self.storage
    }

    pub fn bronze(&self) -> &Arc<BronzeStorage> {
        &self.bronze
    }

    fn silver_key(table: &str, date: NaiveDate) -> String {
        format!("{table}/{date}/data.parquet")
    }

    /// Normalize one date of raw daily quotes into the silver table.
    ///
    /// Idempotent: if the partition already exists and `force` is false the
    /// existing key is returned without touching bronze. Returns `None`
    /// when bronze has no data for the date.
    pub fn normalize_daily_quotes(&self, date: NaiveDate, force: bool) -> Result<Option<String>> {
        let blob_key = Self::silver_key(DAILY_PRICES_TABLE, date);
        if !force && self.storage.exists(&blob_key)? {
            info!("Daily quotes already normalized for {date}");
            return Ok(Some(blob_key));
        }

        let raw = self
            .bronze
            .read_raw_data(DAILY_QUOTES_ENDPOINT, Some(date), None)?;
        if raw.num_rows() == 0 {
            warn!("No raw daily quotes data for {date}");
            return Ok(None);
        }

        let normalized = normalize_daily_quotes_schema(&raw)?;
        validate_daily_quotes(&normalized)?;

        let parquet = table::write_parquet(&normalized)?;
        self.storage.put(
            &blob_key,
            &parquet,
            &PutOptions::with_content_type(PARQUET_CONTENT_TYPE),
        )?;

        info!(
            "Normalized {} daily quotes records for {date}",
            normalized.num_rows()
        );
        Ok(Some(blob_key))
    }

    /// Read normalized daily prices across a date range, optionally
    /// filtered to a set of codes. Sorted by (date, code).
    pub fn read_daily_prices(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        codes: Option<&[String]>,
    ) -> Result<RecordBatch> {
        let mut batches = Vec::new();
        let mut current = start_date;
        while current <= end_date {
            let blob_key = Self::silver_key(DAILY_PRICES_TABLE, current);
            if self.storage.exists(&blob_key)? {
                let data = self.storage.get(&blob_key)?;
                batches.push(table::read_parquet(data)?);
            }
            current = current
                .checked_add_days(Days::new(1))
                .ok_or_else(|| StorageError::InvalidArgument("Date overflow".to_string()))?;
        }

        if batches.is_empty() {
            return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
        }

        let mut combined = table::concat(&batches)?;

        let dates = table::date_col(&combined, "date")?;
        let start = table::naive_to_date32(start_date);
        let end = table::naive_to_date32(end_date);
        let mask: BooleanArray = (0..dates.len())
            .map(|i| {
                Some(dates.is_valid(i) && dates.value(i) >= start && dates.value(i) <= end)
            })
            .collect();
        combined = table::filter(&combined, &mask)?;

        if let Some(codes) = codes {
            let wanted: HashSet<&str> = codes.iter().map(String::as_str).collect();
            let code_col = table::str_col(&combined, "code")?;
            let mask: BooleanArray = (0..code_col.len())
                .map(|i| Some(code_col.is_valid(i) && wanted.contains(code_col.value(i))))
                .collect();
            combined = table::filter(&combined, &mask)?;
        }

        table::sort_by(&combined, &["date", "code"])
    }

    /// All dates with a partition for the table, sorted ascending.
    pub fn list_available_dates(&self, table: &str) -> Result<Vec<NaiveDate>> {
        let mut dates = BTreeSet::new();
        for blob in self.storage.list(Some(&format!("{table}/")))? {
            if let Some((_, date_str)) = split_partition_key(&blob.key) {
                if let Ok(date) = date_str.parse::<NaiveDate>() {
                    dates.insert(date);
                }
            }
        }
        Ok(dates.into_iter().collect())
    }

    /// Aggregate storage statistics, optionally restricted to one table.
    pub fn get_storage_stats(&self, table: Option<&str>) -> Result<SilverStats> {
        let prefix = table.map(|t| format!("{t}/"));
        let mut stats = SilverStats::default();

        for blob in self.storage.list(prefix.as_deref())? {
            let Some((table_name, date_str)) = split_partition_key(&blob.key) else {
                continue;
            };
            if date_str.parse::<NaiveDate>().is_err() {
                continue;
            }

            let entry = stats.tables.entry(table_name.to_string()).or_default();
            let size_mb = blob.size as f64 / (1024.0 * 1024.0);
            entry.dates += 1;
            entry.files += 1;
            entry.size_mb += size_mb;
            stats.total_files += 1;
            stats.total_size_mb += size_mb;
        }

        stats.total_size_mb = round_mb(stats.total_size_mb);
        for entry in stats.tables.values_mut() {
            entry.size_mb = round_mb(entry.size_mb);
        }
        Ok(stats)
    }
}

/// Columns the raw daily quotes response must carry.
const REQUIRED_SOURCE_COLUMNS: [&str; 7] =
    ["Code", "Date", "Open", "High", "Low", "Close", "Volume"];

/// Project raw daily quotes into the normalized silver schema.
///
/// Casts are lenient (unparseable values become null); rows missing any of
/// code, date, or close are dropped; `adj_close` falls back to
/// `close * coalesce(adjustment_factor, 1.0)` when the source does not
/// provide it.
fn normalize_daily_quotes_schema(raw: &RecordBatch) -> Result<RecordBatch> {
    let missing: Vec<&str> = REQUIRED_SOURCE_COLUMNS
        .iter()
        .filter(|name| !table::has_column(raw, name))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(StorageError::DataQuality(format!(
            "Missing required columns: {}",
            missing.join(", ")
        )));
    }

    let n = raw.num_rows();
    let project = |source: &str, dtype: &DataType| -> Result<ArrayRef> {
        Ok(cast(table::column(raw, source)?, dtype)?)
    };
    let project_optional = |source: &str, dtype: &DataType| -> Result<ArrayRef> {
        match raw.column_by_name(source) {
            Some(column) => Ok(cast(column, dtype)?),
            None => Ok(new_null_array(dtype, n)),
        }
    };

    let code = project("Code", &DataType::Utf8)?;
    let date = project("Date", &DataType::Date32)?;
    let open = project("Open", &DataType::Float64)?;
    let high = project("High", &DataType::Float64)?;
    let low = project("Low", &DataType::Float64)?;
    let close = project("Close", &DataType::Float64)?;
    let volume = project("Volume", &DataType::Int64)?;
    let turnover_value = project_optional("TurnoverValue", &DataType::Float64)?;
    let adjustment_factor = project_optional("AdjustmentFactor", &DataType::Float64)?;
    let adj_close_source = project_optional("AdjustmentClose", &DataType::Float64)?;

    // Drop rows missing any of the identifying columns
    let keep: BooleanArray = (0..n)
        .map(|i| Some(code.is_valid(i) && date.is_valid(i) && close.is_valid(i)))
        .collect();

    let loose_fields = vec![
        Field::new("code", DataType::Utf8, true),
        Field::new("date", DataType::Date32, true),
        Field::new("open", DataType::Float64, true),
        Field::new("high", DataType::Float64, true),
        Field::new("low", DataType::Float64, true),
        Field::new("close", DataType::Float64, true),
        Field::new("volume", DataType::Int64, true),
        Field::new("turnover_value", DataType::Float64, true),
        Field::new("adjustment_factor", DataType::Float64, true),
        Field::new("adj_close", DataType::Float64, true),
    ];
    let loose = RecordBatch::try_new(
        Arc::new(Schema::new(loose_fields)),
        vec![
            code,
            date,
            open,
            high,
            low,
            close,
            volume,
            turnover_value,
            adjustment_factor,
            adj_close_source,
        ],
    )?;
    let filtered = table::filter(&loose, &keep)?;
    let m = filtered.num_rows();

    // Fill adj_close where the source left it null
    let close_col = table::f64_col(&filtered, "close")?;
    let factor_col = table::f64_col(&filtered, "adjustment_factor")?;
    let adj_source_col = table::f64_col(&filtered, "adj_close")?;
    let adj_close: Float64Array = (0..m)
        .map(|i| {
            if adj_source_col.is_valid(i) {
                Some(adj_source_col.value(i))
            } else {
                let factor = if factor_col.is_valid(i) {
                    factor_col.value(i)
                } else {
                    1.0
                };
                Some(close_col.value(i) * factor)
            }
        })
        .collect();

    let processed_at: ArrayRef =
        Arc::new(StringArray::from(vec![Utc::now().to_rfc3339(); m]));

    let final_fields = vec![
        Field::new("code", DataType::Utf8, false),
        Field::new("date", DataType::Date32, false),
        Field::new("open", DataType::Float64, true),
        Field::new("high", DataType::Float64, true),
        Field::new("low", DataType::Float64, true),
        Field::new("close", DataType::Float64, false),
        Field::new("volume", DataType::Int64, true),
        Field::new("turnover_value", DataType::Float64, true),
        Field::new("adjustment_factor", DataType::Float64, true),
        Field::new("adj_close", DataType::Float64, false),
        Field::new("processed_at", DataType::Utf8, false),
    ];
    let normalized = RecordBatch::try_new(
        Arc::new(Schema::new(final_fields)),
        vec![
            filtered.column(0).clone(),
            filtered.column(1).clone(),
            filtered.column(2).clone(),
            filtered.column(3).clone(),
            filtered.column(4).clone(),
            filtered.column(5).clone(),
            filtered.column(6).clone(),
            filtered.column(7).clone(),
            filtered.column(8).clone(),
            Arc::new(adj_close),
            processed_at,
        ],
    )?;

    table::sort_by(&normalized, &["code", "date"])
}

/// Validate a normalized partition before it is written.
fn validate_daily_quotes(batch: &RecordBatch) -> Result<()> {
    let required = ["code", "date", "open", "high", "low", "close", "volume"];
    let missing: Vec<&str> = required
        .iter()
        .filter(|name| !table::has_column(batch, name))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(StorageError::DataQuality(format!(
            "Missing required columns: {}",
            missing.join(", ")
        )));
    }

    let code = table::column(batch, "code")?;
    if code.null_count() > 0 {
        return Err(StorageError::DataQuality(format!(
            "Found {} null codes",
            code.null_count()
        )));
    }

    let close = table::f64_col(batch, "close")?;
    if close.null_count() > 0 {
        return Err(StorageError::DataQuality(format!(
            "Found {} null close prices",
            close.null_count()
        )));
    }

    if batch.num_rows() > 0 {
        let mut min_close = f64::INFINITY;
        let mut max_close = f64::NEG_INFINITY;
        for value in close.iter().flatten() {
            min_close = min_close.min(value);
            max_close = max_close.max(value);
        }
        if min_close <= 0.0 {
            return Err(StorageError::DataQuality(format!(
                "Found non-positive close prices: min={min_close}"
            )));
        }
        // 1M yen is implausible for a single share; flag but keep
        if max_close > 1_000_000.0 {
            warn!("Found very high close price: max={max_close}");
        }
    }

    let open = table::f64_col(batch, "open")?;
    let high = table::f64_col(batch, "high")?;
    let low = table::f64_col(batch, "low")?;
    let mut invalid_ohlc = 0usize;
    for i in 0..batch.num_rows() {
        let bound = |arr: &Float64Array| arr.is_valid(i).then(|| arr.value(i));
        let (o, h, l, c) = (bound(open), bound(high), bound(low), Some(close.value(i)));

        let violated = matches!((h, l), (Some(h), Some(l)) if h < l)
            || matches!((h, o), (Some(h), Some(o)) if h < o)
            || matches!((h, c), (Some(h), Some(c)) if h < c)
            || matches!((l, o), (Some(l), Some(o)) if l > o)
            || matches!((l, c), (Some(l), Some(c)) if l > c);
        if violated {
            invalid_ohlc += 1;
        }
    }
    if invalid_ohlc > 0 {
        return Err(StorageError::DataQuality(format!(
            "Found {invalid_ohlc} records with invalid OHLC relationships"
        )));
    }

    info!(
        "Data quality validation passed for {} records",
        batch.num_rows()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_batch(rows: Vec<serde_json::Value>) -> RecordBatch {
        table::rows_to_batch(&rows).unwrap()
    }

    #[test]
    fn computes_adj_close_from_factor() {
        let raw = raw_batch(vec![json!({
            "Code": "1301", "Date": "2024-01-15",
            "Open": 101.0, "High": 105.0, "Low": 98.0, "Close": 102.0,
            "Volume": 100000, "AdjustmentFactor": 1.1, "AdjustmentClose": null
        })]);

        let normalized = normalize_daily_quotes_schema(&raw).unwrap();
        assert_eq!(normalized.num_rows(), 1);
        let adj = table::f64_col(&normalized, "adj_close").unwrap();
        assert!((adj.value(0) - 112.2).abs() < 1e-9);
        validate_daily_quotes(&normalized).unwrap();
    }

    #[test]
    fn drops_rows_missing_identifiers() {
        let raw = raw_batch(vec![
            json!({"Code": "1301", "Date": "2024-01-15", "Open": 1.0, "High": 2.0,
                   "Low": 0.5, "Close": 1.5, "Volume": 10}),
            json!({"Code": null, "Date": "2024-01-15", "Open": 1.0, "High": 2.0,
                   "Low": 0.5, "Close": 1.5, "Volume": 10}),
            json!({"Code": "1302", "Date": "2024-01-15", "Open": 1.0, "High": 2.0,
                   "Low": 0.5, "Close": null, "Volume": 10}),
        ]);

        let normalized = normalize_daily_quotes_schema(&raw).unwrap();
        assert_eq!(normalized.num_rows(), 1);
    }

    #[test]
    fn rejects_inverted_ohlc() {
        let raw = raw_batch(vec![json!({
            "Code": "1301", "Date": "2024-01-15",
            "Open": 100.0, "High": 95.0, "Low": 98.0, "Close": 96.0,
            "Volume": 10
        })]);

        let normalized = normalize_daily_quotes_schema(&raw).unwrap();
        let err = validate_daily_quotes(&normalized).unwrap_err();
        assert!(matches!(err, StorageError::DataQuality(_)));
    }

    #[test]
    fn rejects_non_positive_close() {
        let raw = raw_batch(vec![json!({
            "Code": "1301", "Date": "2024-01-15",
            "Open": 1.0, "High": 2.0, "Low": 0.5, "Close": 0.0,
            "Volume": 10
        })]);

        let normalized = normalize_daily_quotes_schema(&raw).unwrap();
        let err = validate_daily_quotes(&normalized).unwrap_err();
        assert!(matches!(err, StorageError::DataQuality(_)));
    }
}
