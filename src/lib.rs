//! jqlake - Medallion-Architecture Data Lakehouse
//!
//! Tiered columnar storage for Japanese equity market data over a
//! pluggable blob store (local filesystem or S3-compatible object stores).
//!
//! ## Tiers
//!
//! - **Bronze**: raw API responses, partitioned by endpoint and date
//! - **Silver**: normalized and validated daily price tables
//! - **Gold**: per-stock merged price history with atomic writes
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use jqlake::{BackendRegistry, BlobStorage, BronzeStorage, GoldStorage, SilverStorage};
//!
//! fn main() -> jqlake::Result<()> {
//!     let registry = BackendRegistry::from_env()?;
//!
//!     let bronze = Arc::new(BronzeStorage::new(BlobStorage::from_name(&registry, "demo.bronze")?));
//!     let silver = Arc::new(SilverStorage::new(
//!         BlobStorage::from_name(&registry, "demo.silver")?,
//!         bronze.clone(),
//!     ));
//!     let gold = GoldStorage::new(BlobStorage::from_name(&registry, "demo.gold")?, silver);
//!
//!     let stats = gold.transform_daily_prices(None, None, false)?;
//!     println!("{} stocks updated", stats.stocks_updated);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod blob;
pub mod config;
pub mod error;
pub mod ingest;
pub mod layers;
pub mod logging;
pub mod registry;
pub mod stock;
pub mod table;

// Re-export core types
pub use backend::{
    BlobBackend, BlobListResult, BlobMetadata, FilesystemBackend, ListOptions, PresignMethod,
    PrefixedBackend, PutOptions, S3Backend,
};
pub use blob::BlobStorage;
pub use error::{Result, StorageError};
pub use ingest::PaginatedFetch;
pub use layers::{BronzeStorage, GoldStorage, SilverStorage};
pub use logging::{init_from_env, init_logging, LogConfig};
pub use registry::BackendRegistry;
pub use stock::{MatchMode, PriceAdjustment, PriceHistoryOptions, Stock};
