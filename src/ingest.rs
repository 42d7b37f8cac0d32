//! Bronze ingestion driven by a paginated market-data API client

use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::layers::BronzeStorage;
use crate::stock::LISTED_INFO_ENDPOINT;

/// Paginated fetch capability of the upstream market-data API.
///
/// Implementations follow the API's opaque `pagination_key` round-trip and
/// return all pages concatenated.
pub trait PaginatedFetch {
    /// GET `path`, collecting the array under `data_key` across all pages.
    fn get_paginated(
        &self,
        path: &str,
        data_key: &str,
        params: &HashMap<String, String>,
    ) -> Result<Vec<Value>>;
}

/// Ingest one endpoint for a list of dates.
///
/// Dates already present in bronze are skipped unless `force` is set.
/// Failures on a single date are logged and do not halt the batch.
/// Returns the total number of records ingested.
pub fn ingest_endpoint(
    client: &dyn PaginatedFetch,
    bronze: &BronzeStorage,
    endpoint: &str,
    api_path: &str,
    data_key: &str,
    dates: &[NaiveDate],
    force: bool,
) -> Result<u64> {
    info!("Processing {} dates for {endpoint}", dates.len());

    let existing = bronze.list_available_dates(endpoint)?;
    let mut total_records: u64 = 0;

    for &date in dates {
        info!("Processing date: {date}");

        if !force && existing.contains(&date) {
            info!("Data already exists for {date}, skipping");
            continue;
        }

        let date_param = date.format("%Y%m%d").to_string();
        let mut params = HashMap::new();
        params.insert("date".to_string(), date_param.clone());

        let rows = match client.get_paginated(api_path, data_key, &params) {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to fetch {endpoint} for {date}: {e}");
                continue;
            }
        };

        if rows.is_empty() {
            warn!("No data returned for {date}");
            continue;
        }
        total_records += rows.len() as u64;

        let metadata = json!({
            "api_call": api_path,
            "date_param": date_param,
            "record_count": rows.len(),
        });

        match bronze.store_raw_response(endpoint, &rows, date, Some(&metadata)) {
            Ok(blob_key) => info!("Stored raw data: {blob_key}"),
            Err(e) => {
                error!("Failed to store {endpoint} for {date}: {e}");
                continue;
            }
        }
    }

    info!("Ingestion completed. Total records ingested: {total_records}");
    Ok(total_records)
}

/// Ingest daily quotes for the given dates.
pub fn ingest_daily_quotes(
    client: &dyn PaginatedFetch,
    bronze: &BronzeStorage,
    dates: &[NaiveDate],
    force: bool,
) -> Result<u64> {
    ingest_endpoint(
        client,
        bronze,
        "daily_quotes",
        "/v1/prices/daily_quotes",
        "daily_quotes",
        dates,
        force,
    )
}

/// Ingest the listed-info master snapshot for the given dates.
pub fn ingest_listed_info(
    client: &dyn PaginatedFetch,
    bronze: &BronzeStorage,
    dates: &[NaiveDate],
    force: bool,
) -> Result<u64> {
    ingest_endpoint(
        client,
        bronze,
        LISTED_INFO_ENDPOINT,
        "/v1/listed/info",
        "info",
        dates,
        force,
    )
}
