//! Optionality core: domain types, option ticker decoding, split adjustment,
//! vendor clients, and the partitioned Parquet store.
//!
//! This crate holds everything that does not depend on scheduling:
//! - Domain types (raw bars, option identities, splits, tickers, checkpoints)
//! - Option ticker decoder
//! - Read-time split adjustment
//! - Technical indicators over adjusted bars
//! - Vendor trait plus the Polygon REST and flat-file clients
//! - Flat-file reader and the columnar store

pub mod adjust;
pub mod data;
pub mod domain;
pub mod indicators;
pub mod option_symbol;

pub use adjust::{adjust_bar, adjust_price, cumulative_factor, SplitHistory};
pub use indicators::{technicals, TechnicalRow};
pub use option_symbol::{decode_option_ticker, encode_option_ticker, DecodeError, DecodeErrorKind};

#[cfg(test)]
mod tests {
    use super::*;

    /// Everything shared across worker threads must be Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<domain::RawBar>();
        require_sync::<domain::RawBar>();
        require_send::<domain::OptionBar>();
        require_sync::<domain::OptionBar>();
        require_send::<domain::SplitEvent>();
        require_sync::<domain::SplitEvent>();
        require_send::<domain::IngestionCheckpoint>();
        require_sync::<domain::IngestionCheckpoint>();

        require_send::<data::FlatFile>();
        require_sync::<data::FlatFile>();
        require_send::<data::ParquetStore>();
        require_sync::<data::ParquetStore>();
        require_send::<data::CheckpointLog>();
        require_sync::<data::CheckpointLog>();
        require_send::<data::PolygonVendor>();
        require_sync::<data::PolygonVendor>();
        require_send::<data::VendorError>();
        require_send::<data::StoreError>();
        require_send::<SplitHistory>();
        require_sync::<SplitHistory>();
    }

    #[test]
    fn vendor_trait_is_object_safe() {
        fn _takes(_: &dyn data::VendorApi, _: &dyn data::ColumnarStore, _: &dyn data::FlatFileSource) {}
    }
}
