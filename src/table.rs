//! Columnar table helpers shared by the storage tiers
//! RecordBatch in memory, Parquet (snappy) at rest

use arrow::array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    UInt32Array,
};
use arrow::compute::{self, SortColumn};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::json::reader::infer_json_schema_from_iterator;
use arrow::json::ReaderBuilder;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Result, StorageError};

/// Content type recorded on every tier file.
pub const PARQUET_CONTENT_TYPE: &str = "application/parquet";

/// Build a RecordBatch from JSON rows, inferring the schema.
///
/// All-null columns infer as `Null` which Parquet cannot represent; those
/// fields are rewritten to nullable Utf8. Empty input yields an empty batch
/// with an empty schema.
pub fn rows_to_batch(rows: &[Value]) -> Result<RecordBatch> {
    if rows.is_empty() {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    }

    let inferred = infer_json_schema_from_iterator(rows.iter().map(Ok))?;
    let fields: Vec<Field> = inferred
        .fields()
        .iter()
        .map(|field| {
            if field.data_type() == &DataType::Null {
                Field::new(field.name(), DataType::Utf8, true)
            } else {
                field.as_ref().clone()
            }
        })
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let mut decoder = ReaderBuilder::new(schema.clone()).build_decoder()?;
    decoder.serialize(rows)?;
    match decoder.flush()? {
        Some(batch) => Ok(batch),
        None => Ok(RecordBatch::new_empty(schema)),
    }
}

/// Serialize a batch to Parquet bytes with snappy compression.
pub fn write_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(buffer)
}

/// Read Parquet bytes into a single batch.
pub fn read_parquet(data: Vec<u8>) -> Result<RecordBatch> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(data))?;
    let schema = builder.schema().clone();
    let reader = builder.build()?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    if batches.is_empty() {
        return Ok(RecordBatch::new_empty(schema));
    }
    concat(&batches)
}

/// Row count from the Parquet footer, without decoding any column data.
pub fn parquet_row_count(data: Vec<u8>) -> Result<u64> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(data))?;
    let rows = builder.metadata().file_metadata().num_rows();
    Ok(rows.max(0) as u64)
}

/// Concatenate batches sharing one schema.
pub fn concat(batches: &[RecordBatch]) -> Result<RecordBatch> {
    match batches {
        [] => Ok(RecordBatch::new_empty(Arc::new(Schema::empty()))),
        [single] => Ok(single.clone()),
        _ => Ok(compute::concat_batches(&batches[0].schema(), batches)?),
    }
}

/// Reorder a batch by a list of row indices.
pub fn take(batch: &RecordBatch, indices: &UInt32Array) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = batch
        .columns()
        .iter()
        .map(|column| compute::take(column, indices, None))
        .collect::<std::result::Result<_, _>>()?;
    Ok(RecordBatch::try_new(batch.schema(), columns)?)
}

/// Sort a batch lexicographically by the named columns, ascending.
pub fn sort_by(batch: &RecordBatch, columns: &[&str]) -> Result<RecordBatch> {
    if batch.num_rows() == 0 {
        return Ok(batch.clone());
    }
    let sort_columns: Vec<SortColumn> = columns
        .iter()
        .map(|name| {
            Ok(SortColumn {
                values: column(batch, name)?.clone(),
                options: None,
            })
        })
        .collect::<Result<_>>()?;
    let indices = compute::lexsort_to_indices(&sort_columns, None)?;
    take(batch, &indices)
}

/// Filter a batch by a boolean mask (nulls drop the row).
pub fn filter(batch: &RecordBatch, mask: &BooleanArray) -> Result<RecordBatch> {
    Ok(compute::filter_record_batch(batch, mask)?)
}

/// Look up a column by name.
pub fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| StorageError::Backend(format!("Column not found: {name}")))
}

/// Whether the batch schema has the named column.
pub fn has_column(batch: &RecordBatch, name: &str) -> bool {
    batch.column_by_name(name).is_some()
}

pub fn str_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| StorageError::Backend(format!("Column {name} is not Utf8")))
}

pub fn f64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Float64Array> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| StorageError::Backend(format!("Column {name} is not Float64")))
}

pub fn i64_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Int64Array> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<Int64Array>()
        .ok_or_else(|| StorageError::Backend(format!("Column {name} is not Int64")))
}

pub fn date_col<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a Date32Array> {
    column(batch, name)?
        .as_any()
        .downcast_ref::<Date32Array>()
        .ok_or_else(|| StorageError::Backend(format!("Column {name} is not Date32")))
}

/// Days-since-epoch to calendar date.
pub fn date32_to_naive(days: i32) -> NaiveDate {
    NaiveDate::default() + chrono::Duration::days(days as i64)
}

/// Calendar date to days-since-epoch.
pub fn naive_to_date32(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}

/// Deduplicate on the `date` column keeping the last occurrence per date,
/// returning rows sorted by date ascending. Rows with a null date are
/// dropped.
pub fn dedup_keep_last_by_date(batch: &RecordBatch) -> Result<RecordBatch> {
    let dates = date_col(batch, "date")?;
    let mut last: std::collections::BTreeMap<i32, u32> = std::collections::BTreeMap::new();
    for i in 0..dates.len() {
        if dates.is_valid(i) {
            last.insert(dates.value(i), i as u32);
        }
    }
    let indices = UInt32Array::from(last.into_values().collect::<Vec<u32>>());
    take(batch, &indices)
}

/// Render a single cell as a display string.
pub fn cell_to_string(array: &ArrayRef, row: usize) -> Result<String> {
    Ok(arrow::util::display::array_value_to_string(array, row)?)
}

/// Extract one row as a JSON object, preserving numeric types for the
/// common column kinds and falling back to display strings elsewhere.
pub fn row_to_json(batch: &RecordBatch, row: usize) -> Result<serde_json::Map<String, Value>> {
    let mut out = serde_json::Map::new();
    for (field, array) in batch.schema().fields().iter().zip(batch.columns()) {
        let value = if !array.is_valid(row) {
            Value::Null
        } else {
            match field.data_type() {
                DataType::Utf8 => {
                    let col = array.as_any().downcast_ref::<StringArray>();
                    col.map(|c| Value::String(c.value(row).to_string()))
                        .unwrap_or(Value::Null)
                }
                DataType::Int64 => {
                    let col = array.as_any().downcast_ref::<Int64Array>();
                    col.map(|c| Value::from(c.value(row))).unwrap_or(Value::Null)
                }
                DataType::Float64 => {
                    let col = array.as_any().downcast_ref::<Float64Array>();
                    col.map(|c| Value::from(c.value(row))).unwrap_or(Value::Null)
                }
                DataType::Boolean => {
                    let col = array.as_any().downcast_ref::<BooleanArray>();
                    col.map(|c| Value::Bool(c.value(row))).unwrap_or(Value::Null)
                }
                DataType::Date32 => {
                    let col = array.as_any().downcast_ref::<Date32Array>();
                    col.map(|c| Value::String(date32_to_naive(c.value(row)).to_string()))
                        .unwrap_or(Value::Null)
                }
                _ => Value::String(cell_to_string(array, row)?),
            }
        };
        out.insert(field.name().clone(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_batch_from_json_rows() {
        let rows = vec![
            json!({"Code": "13010", "Close": 102.0, "Volume": 100000}),
            json!({"Code": "99990", "Close": 55.5, "Volume": 42}),
        ];
        let batch = rows_to_batch(&rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert!(has_column(&batch, "Code"));
        assert!(has_column(&batch, "Close"));
    }

    #[test]
    fn all_null_columns_become_utf8() {
        let rows = vec![json!({"A": "x", "B": null}), json!({"A": "y", "B": null})];
        let batch = rows_to_batch(&rows).unwrap();
        let field = batch.schema().field_with_name("B").unwrap().clone();
        assert_eq!(field.data_type(), &DataType::Utf8);
    }

    #[test]
    fn parquet_round_trip() {
        let rows = vec![json!({"k": "a", "v": 1.5}), json!({"k": "b", "v": 2.5})];
        let batch = rows_to_batch(&rows).unwrap();
        let bytes = write_parquet(&batch).unwrap();

        assert_eq!(parquet_row_count(bytes.clone()).unwrap(), 2);
        let restored = read_parquet(bytes).unwrap();
        assert_eq!(restored.num_rows(), 2);
        assert_eq!(restored.schema(), batch.schema());
    }

    #[test]
    fn dedup_keeps_last_occurrence() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("date", DataType::Date32, false),
            Field::new("close", DataType::Float64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Date32Array::from(vec![20, 10, 20])),
                Arc::new(Float64Array::from(vec![1.0, 2.0, 3.0])),
            ],
        )
        .unwrap();

        let deduped = dedup_keep_last_by_date(&batch).unwrap();
        assert_eq!(deduped.num_rows(), 2);
        let dates = date_col(&deduped, "date").unwrap();
        let closes = f64_col(&deduped, "close").unwrap();
        assert_eq!((dates.value(0), dates.value(1)), (10, 20));
        assert_eq!((closes.value(0), closes.value(1)), (2.0, 3.0));
    }

    #[test]
    fn date32_conversions_round_trip() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(date32_to_naive(naive_to_date32(date)), date);
    }
}
