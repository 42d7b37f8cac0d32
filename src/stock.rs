//! Stock-level access built on top of the bronze and gold storage layers
//! Master data comes from bronze `listed_info` snapshots, price history
//! from the gold tier

use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use crate::error::{Result, StorageError};
use crate::layers::{BronzeStorage, GoldStorage};
use crate::table;

/// Bronze endpoint holding the master record of listed securities.
pub const LISTED_INFO_ENDPOINT: &str = "listed_info";

/// Column carrying the security code in listed-info snapshots.
const CODE_COLUMN: &str = "Code";

/// How adjusted price columns are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriceAdjustment {
    /// Raw prices as stored.
    #[default]
    None,
    /// Add `adj_*` columns next to the raw ones.
    Add,
    /// Replace the raw columns in place.
    Replace,
}

/// Matching mode for listed-info search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    IContains,
}

/// Options for [`Stock::get_price_history`].
#[derive(Debug, Clone)]
pub struct PriceHistoryOptions {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Columns to keep; `date` and `code` are always included.
    pub columns: Option<Vec<String>>,
    pub adjust: PriceAdjustment,
    /// Scale volume by the inverse factor when adjusting.
    pub adjust_volume: bool,
    /// Scale turnover value by the factor when adjusting.
    pub adjust_turnover: bool,
}

impl Default for PriceHistoryOptions {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            columns: None,
            adjust: PriceAdjustment::None,
            adjust_volume: true,
            adjust_turnover: false,
        }
    }
}

/// A single security, resolved to its 5-digit exchange code.
pub struct Stock {
    code: String,
    bronze: Arc<BronzeStorage>,
    gold: Arc<GoldStorage>,
    listed_info: OnceLock<serde_json::Map<String, Value>>,
}

impl Stock {
    /// Resolve `code` (4 or 5 digits) and bind it to the storage layers.
    pub fn new(code: &str, bronze: Arc<BronzeStorage>, gold: Arc<GoldStorage>) -> Result<Self> {
        let resolved = resolve_code(code, &bronze, &gold)?;
        Ok(Self {
            code: resolved,
            bronze,
            gold,
            listed_info: OnceLock::new(),
        })
    }

    /// The resolved 5-digit code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The 4-digit base code, without the market suffix.
    pub fn base_code(&self) -> &str {
        &self.code[..4.min(self.code.len())]
    }

    /// Search listed securities by a listed-info field value.
    ///
    /// Matching rows become `Stock` instances with their listed-info cache
    /// pre-warmed from the snapshot row.
    pub fn search(
        bronze: Arc<BronzeStorage>,
        gold: Arc<GoldStorage>,
        field: &str,
        value: &str,
        mode: MatchMode,
    ) -> Result<Vec<Stock>> {
        let Some((_, snapshot)) = bronze.latest_snapshot(LISTED_INFO_ENDPOINT)? else {
            return Ok(Vec::new());
        };
        if snapshot.num_rows() == 0 {
            return Ok(Vec::new());
        }

        if !table::has_column(&snapshot, field) {
            let columns: Vec<String> = snapshot
                .schema()
                .fields()
                .iter()
                .map(|f| f.name().clone())
                .collect();
            return Err(StorageError::InvalidArgument(format!(
                "Field '{field}' not found in listed info columns: {}",
                columns.join(", ")
            )));
        }

        let column = table::column(&snapshot, field)?;
        let needle = value.to_lowercase();
        let mut results = Vec::new();

        for row in 0..snapshot.num_rows() {
            if !column.is_valid(row) {
                continue;
            }
            let cell = table::cell_to_string(column, row)?;
            let matched = match mode {
                MatchMode::Exact => cell == value,
                MatchMode::IContains => cell.to_lowercase().contains(&needle),
            };
            if !matched {
                continue;
            }

            let code_col = table::column(&snapshot, CODE_COLUMN)?;
            if !code_col.is_valid(row) {
                continue;
            }
            let code = table::cell_to_string(code_col, row)?;
            if code.is_empty() {
                continue;
            }

            let stock = Stock::new(&code, bronze.clone(), gold.clone())?;
            let _ = stock.listed_info.set(table::row_to_json(&snapshot, row)?);
            results.push(stock);
        }

        Ok(results)
    }

    /// Master data for this security from the latest listed-info snapshot.
    pub fn get_listed_info(&self) -> Result<serde_json::Map<String, Value>> {
        if let Some(info) = self.listed_info.get() {
            return Ok(info.clone());
        }

        let Some((_, snapshot)) = self.bronze.latest_snapshot(LISTED_INFO_ENDPOINT)? else {
            return Err(StorageError::NotFound(
                "No listed info data available in bronze storage".to_string(),
            ));
        };
        if !table::has_column(&snapshot, CODE_COLUMN) {
            return Err(StorageError::NotFound(
                "Listed info snapshot missing 'Code' column".to_string(),
            ));
        }

        let code_col = table::column(&snapshot, CODE_COLUMN)?;
        for row in 0..snapshot.num_rows() {
            if code_col.is_valid(row) && table::cell_to_string(code_col, row)? == self.code {
                let info = table::row_to_json(&snapshot, row)?;
                let _ = self.listed_info.set(info.clone());
                return Ok(info);
            }
        }

        Err(StorageError::NotFound(format!(
            "No listed info found for code {}",
            self.code
        )))
    }

    fn listed_field(&self, field: &str) -> Result<Option<String>> {
        Ok(self
            .get_listed_info()?
            .get(field)
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    pub fn company_name(&self) -> Result<Option<String>> {
        self.listed_field("CompanyName")
    }

    pub fn company_name_english(&self) -> Result<Option<String>> {
        self.listed_field("CompanyNameEnglish")
    }

    pub fn sector17_code(&self) -> Result<Option<String>> {
        self.listed_field("Sector17Code")
    }

    pub fn sector33_code(&self) -> Result<Option<String>> {
        self.listed_field("Sector33Code")
    }

    pub fn market_code(&self) -> Result<Option<String>> {
        self.listed_field("MarketCode")
    }

    /// Price history from the gold layer, with optional per-row adjustment.
    ///
    /// Adjusted prices multiply each of open/high/low/close by that row's
    /// `adjustment_factor` (null factors count as 1.0); volume divides by
    /// the factor (a zero factor leaves volume unchanged); turnover
    /// multiplies. Column projection is applied last.
    pub fn get_price_history(&self, opts: &PriceHistoryOptions) -> Result<RecordBatch> {
        let mut history =
            self.gold
                .read_stock_prices(&self.code, opts.start_date, opts.end_date, None)?;

        if opts.adjust != PriceAdjustment::None
            && history.num_rows() > 0
            && table::has_column(&history, "adjustment_factor")
        {
            history = apply_adjustment(&history, opts)?;
        }

        if let Some(columns) = &opts.columns {
            history = project_columns(&history, columns)?;
        }

        Ok(history)
    }

    /// The most recent price record, if any.
    pub fn get_latest_price(&self) -> Result<Option<serde_json::Map<String, Value>>> {
        let history = self.get_price_history(&PriceHistoryOptions::default())?;
        if history.num_rows() == 0 {
            return Ok(None);
        }
        Ok(Some(table::row_to_json(&history, history.num_rows() - 1)?))
    }

    fn series(&self, column: &str, adjust: PriceAdjustment) -> Result<Vec<Option<f64>>> {
        let opts = PriceHistoryOptions {
            adjust,
            ..PriceHistoryOptions::default()
        };
        let history = self.get_price_history(&opts)?;
        if history.num_rows() == 0 || !table::has_column(&history, column) {
            return Ok(Vec::new());
        }
        let values = cast(table::column(&history, column)?, &DataType::Float64)?;
        let values = values
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| StorageError::Backend(format!("Column {column} is not numeric")))?;
        Ok(values.iter().collect())
    }

    /// Close prices, adjusted by default.
    pub fn close_series(&self, adjusted: bool) -> Result<Vec<Option<f64>>> {
        let adjust = if adjusted {
            PriceAdjustment::Replace
        } else {
            PriceAdjustment::None
        };
        self.series("close", adjust)
    }

    /// Volumes scaled by the inverse adjustment factor.
    pub fn volume_series(&self) -> Result<Vec<Option<f64>>> {
        self.series("volume", PriceAdjustment::Replace)
    }

    /// Raw turnover values.
    pub fn turnover_series(&self) -> Result<Vec<Option<f64>>> {
        self.series("turnover_value", PriceAdjustment::None)
    }

    /// Raw adjustment factors.
    pub fn adjustment_factor_series(&self) -> Result<Vec<Option<f64>>> {
        self.series("adjustment_factor", PriceAdjustment::None)
    }

    /// Rows where the adjustment factor deviates from 1.0 by more than
    /// `tolerance` (corporate actions such as splits).
    pub fn adjustment_events(&self, tolerance: f64) -> Result<RecordBatch> {
        let history = self.get_price_history(&PriceHistoryOptions::default())?;
        if history.num_rows() == 0 || !table::has_column(&history, "adjustment_factor") {
            return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
        }

        let factors = table::f64_col(&history, "adjustment_factor")?;
        let mask: BooleanArray = (0..factors.len())
            .map(|i| Some(factors.is_valid(i) && (factors.value(i) - 1.0).abs() > tolerance))
            .collect();
        table::filter(&history, &mask)
    }
}

impl std::fmt::Debug for Stock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stock").field("code", &self.code).finish()
    }
}

/// Resolve user input to a canonical 5-digit exchange code.
///
/// 5-digit input passes through. 4-digit input consults the listed-info
/// snapshot, then the gold inventory, for codes starting with the input;
/// with no evidence, the Tokyo Stock Exchange padding (`input + "0"`) is
/// assumed. Candidates ending in `0` win, then the lexicographic minimum.
fn resolve_code(code: &str, bronze: &BronzeStorage, gold: &GoldStorage) -> Result<String> {
    let cleaned = code.trim();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Err(StorageError::InvalidArgument(format!(
            "Stock code must be numeric: {code:?}"
        )));
    }

    match cleaned.len() {
        5 => return Ok(cleaned.to_string()),
        4 => {}
        _ => {
            return Err(StorageError::InvalidArgument(
                "Stock code must be 4 or 5 digits".to_string(),
            ))
        }
    }

    let mut candidates: Vec<String> = Vec::new();

    // Misconfigured bronze storage falls back to the gold inventory
    let snapshot = bronze
        .latest_snapshot(LISTED_INFO_ENDPOINT)
        .unwrap_or_default();
    if let Some((_, snapshot)) = snapshot {
        if table::has_column(&snapshot, CODE_COLUMN) {
            let code_col = table::column(&snapshot, CODE_COLUMN)?;
            for row in 0..snapshot.num_rows() {
                if !code_col.is_valid(row) {
                    continue;
                }
                let candidate = table::cell_to_string(code_col, row)?;
                if candidate == cleaned {
                    return Ok(candidate);
                }
                if candidate.starts_with(cleaned) {
                    candidates.push(candidate);
                }
            }
        }
    }

    if candidates.is_empty() {
        let stocks = gold.list_available_stocks().unwrap_or_default();
        candidates.extend(stocks.into_iter().filter(|s| s.starts_with(cleaned)));
    }

    if candidates.is_empty() {
        debug!("No code evidence for {cleaned}; assuming TSE padding");
        return Ok(format!("{cleaned}0"));
    }

    candidates.sort();
    candidates.dedup();
    for candidate in &candidates {
        if candidate.ends_with('0') {
            return Ok(candidate.clone());
        }
    }
    Ok(candidates[0].clone())
}

/// Price columns eligible for adjustment, in output order.
const ADJUSTABLE_PRICE_COLUMNS: [&str; 4] = ["open", "high", "low", "close"];

fn apply_adjustment(history: &RecordBatch, opts: &PriceHistoryOptions) -> Result<RecordBatch> {
    let factors = table::f64_col(history, "adjustment_factor")?.clone();
    let factor_at = |i: usize| -> f64 {
        if factors.is_valid(i) {
            factors.value(i)
        } else {
            1.0
        }
    };

    let mut fields: Vec<Field> = history
        .schema()
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect();
    let mut columns: Vec<ArrayRef> = history.columns().to_vec();

    let mut emit = |name: &str, values: Float64Array| {
        let array: ArrayRef = Arc::new(values);
        match opts.adjust {
            PriceAdjustment::Replace => {
                if let Some(idx) = fields.iter().position(|f| f.name() == name) {
                    fields[idx] = Field::new(name, DataType::Float64, true);
                    columns[idx] = array;
                }
            }
            PriceAdjustment::Add => {
                fields.push(Field::new(format!("adj_{name}"), DataType::Float64, true));
                columns.push(array);
            }
            PriceAdjustment::None => {}
        }
    };

    for name in ADJUSTABLE_PRICE_COLUMNS {
        if !table::has_column(history, name) {
            continue;
        }
        let raw = cast(table::column(history, name)?, &DataType::Float64)?;
        let raw = raw
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| StorageError::Backend(format!("Column {name} is not numeric")))?;
        let adjusted: Float64Array = (0..raw.len())
            .map(|i| raw.is_valid(i).then(|| raw.value(i) * factor_at(i)))
            .collect();
        emit(name, adjusted);
    }

    if opts.adjust_volume && table::has_column(history, "volume") {
        let raw = cast(table::column(history, "volume")?, &DataType::Float64)?;
        let raw = raw
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| StorageError::Backend("Column volume is not numeric".to_string()))?;
        let adjusted: Float64Array = (0..raw.len())
            .map(|i| {
                raw.is_valid(i).then(|| {
                    // A zero factor would divide away the row; leave it raw
                    let factor = factor_at(i);
                    let divisor = if factor == 0.0 { 1.0 } else { factor };
                    raw.value(i) / divisor
                })
            })
            .collect();
        emit("volume", adjusted);
    }

    if opts.adjust_turnover && table::has_column(history, "turnover_value") {
        let raw = cast(table::column(history, "turnover_value")?, &DataType::Float64)?;
        let raw = raw
            .as_any()
            .downcast_ref::<Float64Array>()
            .ok_or_else(|| {
                StorageError::Backend("Column turnover_value is not numeric".to_string())
            })?;
        let adjusted: Float64Array = (0..raw.len())
            .map(|i| raw.is_valid(i).then(|| raw.value(i) * factor_at(i)))
            .collect();
        emit("turnover_value", adjusted);
    }

    Ok(RecordBatch::try_new(
        Arc::new(Schema::new(fields)),
        columns,
    )?)
}

/// Keep the requested columns plus `date` and `code`, preserving batch
/// column order. Requesting an absent column is an error.
fn project_columns(batch: &RecordBatch, columns: &[String]) -> Result<RecordBatch> {
    for column in columns {
        if !table::has_column(batch, column) {
            return Err(StorageError::InvalidArgument(format!(
                "Column not found: {column}"
            )));
        }
    }

    let mut wanted: std::collections::HashSet<&str> =
        columns.iter().map(String::as_str).collect();
    wanted.insert("date");
    wanted.insert("code");

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_adjust_volume_only() {
        let opts = PriceHistoryOptions::default();
        assert_eq!(opts.adjust, PriceAdjustment::None);
        assert!(opts.adjust_volume);
        assert!(!opts.adjust_turnover);
    }
}
