//! Vendor access, flat-file decoding, and columnar storage.

pub mod circuit_breaker;
pub mod flatfile;
pub mod flatfiles;
pub mod frame;
pub mod polygon;
pub mod provider;
pub mod schema;
pub mod state;
pub mod store;

pub use circuit_breaker::CircuitBreaker;
pub use flatfile::{FlatFile, FlatFileError, MalformedRow, Records, RowBatch};
pub use flatfiles::{
    FlatFilePrefixes, FlatFileSource, LocalFlatFiles, PolygonVendor, S3FlatFiles,
    S3FlatFilesConfig,
};
pub use polygon::{PolygonRest, PolygonRestConfig};
pub use provider::{backoff_delay, VendorApi, VendorError};
pub use schema::{SchemaError, Table};
pub use state::{CheckpointLog, DateCommit};
pub use store::{
    is_valid_partition_key, ColumnarStore, ParquetStore, ScanFilter, StoreError, TableStats,
};
