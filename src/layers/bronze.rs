//! Bronze layer: raw API responses as partitioned Parquet
//! Minimal processing, kept for lineage and reprocessing

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::blob::BlobStorage;
use crate::error::{Result, StorageError};
use crate::layers::{round_mb, split_partition_key};
use crate::table::{self, PARQUET_CONTENT_TYPE};
use crate::backend::PutOptions;

/// Per-endpoint statistics for the bronze tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EndpointStats {
    pub dates: u64,
    pub files: u64,
    pub size_mb: f64,
}

/// Aggregate statistics for the bronze tier.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BronzeStats {
    pub endpoints: BTreeMap<String, EndpointStats>,
    pub total_files: u64,
    pub total_size_mb: f64,
}

/// Raw-response storage partitioned as `{endpoint}/{YYYY-MM-DD}/data.parquet`.
///
/// Partitions are append-only per (endpoint, date); the ingest orchestrator
/// skips dates that already exist unless forced.
pub struct BronzeStorage {
    storage: BlobStorage,
    add_metadata_columns: bool,
    // Latest-partition cache per endpoint; superseded entries are replaced
    // when a newer date shows up in the inventory
    snapshot_cache: Mutex<HashMap<String, (NaiveDate, RecordBatch)>>,
}

impl BronzeStorage {
    pub fn new(storage: BlobStorage) -> Self {
        Self {
            storage,
            add_metadata_columns: false,
            snapshot_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Enable `_endpoint` / `_partition_date` / `_ingested_at` / `_metadata`
    /// lineage columns on stored partitions.
    pub fn with_metadata_columns(mut self, enabled: bool) -> Self {
        self.add_metadata_columns = enabled;
        self
    }

    pub fn storage(&self) -> &BlobStorage {
        &self.storage
    }

    fn partition_key(endpoint: &str, date: NaiveDate) -> String {
        format!("{endpoint}/{date}/data.parquet")
    }

    /// Store one raw API response as a partition. Returns the blob key.
    ///
    /// An empty response is still written so the date shows up in the
    /// inventory.
    pub fn store_raw_response(
        &self,
        endpoint: &str,
        rows: &[Value],
        date: NaiveDate,
        metadata: Option<&Value>,
    ) -> Result<String> {
        let blob_key = Self::partition_key(endpoint, date);

        if rows.is_empty() {
            warn!("No data to store for {endpoint} on {date}");
        }

        let mut batch = table::rows_to_batch(rows)?;

        // Parquet needs at least one column, so an empty response always
        // carries the lineage columns
        if self.add_metadata_columns || batch.num_columns() == 0 {
            batch = append_lineage_columns(&batch, endpoint, date, metadata)?;
        }

        let parquet = table::write_parquet(&batch)?;
        self.storage.put(
            &blob_key,
            &parquet,
            &PutOptions::with_content_type(PARQUET_CONTENT_TYPE),
        )?;

        info!("Stored {} records to {blob_key}", batch.num_rows());
        Ok(blob_key)
    }

    /// Read raw data for a single date or a date range (exactly one of the
    /// two may be given; neither reads every partition).
    pub fn read_raw_data(
        &self,
        endpoint: &str,
        date: Option<NaiveDate>,
        date_range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<RecordBatch> {
        if date.is_some() && date_range.is_some() {
            return Err(StorageError::InvalidArgument(
                "Cannot specify both date and date_range".to_string(),
            ));
        }

        let mut keys_to_read = Vec::new();

        if let Some(date) = date {
            let blob_key = Self::partition_key(endpoint, date);
            if self.storage.exists(&blob_key)? {
                keys_to_read.push(blob_key);
            }
        } else {
            for blob in self.storage.list(Some(&format!("{endpoint}/")))? {
                let Some((_, date_str)) = split_partition_key(&blob.key) else {
                    warn!("Skipping invalid blob key: {}", blob.key);
                    continue;
                };
                let Ok(blob_date) = date_str.parse::<NaiveDate>() else {
                    warn!("Skipping invalid blob key: {}", blob.key);
                    continue;
                };
                if let Some((start, end)) = date_range {
                    if blob_date < start || blob_date > end {
                        continue;
                    }
                }
                keys_to_read.push(blob.key);
            }
        }

        if keys_to_read.is_empty() {
            return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
        }

        let mut batches = Vec::with_capacity(keys_to_read.len());
        for key in &keys_to_read {
            let data = self.storage.get(key)?;
            batches.push(table::read_parquet(data)?);
        }
        table::concat(&batches)
    }

    /// All dates with a partition for the endpoint, sorted ascending.
    pub fn list_available_dates(&self, endpoint: &str) -> Result<Vec<NaiveDate>> {
        let mut dates = BTreeSet::new();
        for blob in self.storage.list(Some(&format!("{endpoint}/")))? {
            if let Some((_, date_str)) = split_partition_key(&blob.key) {
                if let Ok(date) = date_str.parse::<NaiveDate>() {
                    dates.insert(date);
                }
            }
        }
        Ok(dates.into_iter().collect())
    }

    /// Aggregate storage statistics across all endpoints.
    pub fn get_storage_stats(&self) -> Result<BronzeStats> {
        let mut stats = BronzeStats::default();

        for blob in self.storage.list(None)? {
            let Some((endpoint, date_str)) = split_partition_key(&blob.key) else {
                continue;
            };
            if date_str.parse::<NaiveDate>().is_err() {
                continue;
            }

            let entry = stats.endpoints.entry(endpoint.to_string()).or_default();
            let size_mb = blob.size as f64 / (1024.0 * 1024.0);
            entry.dates += 1;
            entry.files += 1;
            entry.size_mb += size_mb;
            stats.total_files += 1;
            stats.total_size_mb += size_mb;
        }

        stats.total_size_mb = round_mb(stats.total_size_mb);
        for entry in stats.endpoints.values_mut() {
            entry.size_mb = round_mb(entry.size_mb);
        }
        Ok(stats)
    }

    /// Latest partition for an endpoint, cached until a newer date appears.
    pub fn latest_snapshot(&self, endpoint: &str) -> Result<Option<(NaiveDate, RecordBatch)>> {
        let dates = self.list_available_dates(endpoint)?;
        let Some(latest) = dates.into_iter().next_back() else {
            return Ok(None);
        };

        {
            let cache = self.snapshot_cache.lock().expect("snapshot cache poisoned");
            if let Some((cached_date, batch)) = cache.get(endpoint) {
                if *cached_date == latest {
                    return Ok(Some((latest, batch.clone())));
                }
            }
        }

        let batch = self.read_raw_data(endpoint, Some(latest), None)?;
        self.snapshot_cache
            .lock()
            .expect("snapshot cache poisoned")
            .insert(endpoint.to_string(), (latest, batch.clone()));
        Ok(Some((latest, batch)))
    }
}

fn append_lineage_columns(
    batch: &RecordBatch,
    endpoint: &str,
    date: NaiveDate,
    metadata: Option<&Value>,
) -> Result<RecordBatch> {
    let n = batch.num_rows();
    let repeat = |value: &str| -> ArrayRef {
        Arc::new(StringArray::from(vec![value.to_string(); n]))
    };

    let mut fields: Vec<Field> = batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    let mut columns: Vec<ArrayRef> = batch.columns().to_vec();

    fields.push(Field::new("_endpoint", DataType::Utf8, false));
    columns.push(repeat(endpoint));
    fields.push(Field::new("_partition_date", DataType::Utf8, false));
    columns.push(repeat(&date.to_string()));
    fields.push(Field::new("_ingested_at", DataType::Utf8, false));
    columns.push(repeat(&Utc::now().to_rfc3339()));

    if let Some(metadata) = metadata {
        fields.push(Field::new("_metadata", DataType::Utf8, false));
        columns.push(repeat(&serde_json::to_string(metadata)?));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
}
