//! Medallion storage tiers
//! Bronze holds raw API responses, Silver normalized tables, Gold
//! stock-centric merged timeseries

pub mod bronze;
pub mod gold;
pub mod silver;

pub use bronze::BronzeStorage;
pub use gold::GoldStorage;
pub use silver::SilverStorage;

/// Round a megabyte figure to two decimal places for stats reporting.
pub(crate) fn round_mb(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Split a partition key of the form `a/b/data.parquet` into `(a, b)`.
/// Returns None for keys that do not match the partition grammar.
pub(crate) fn split_partition_key(key: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [first, second, "data.parquet"] => Some((first, second)),
        _ => None,
    }
}
