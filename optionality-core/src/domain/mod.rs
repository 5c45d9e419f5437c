//! Domain types for daily market data ingestion.

pub mod bar;
pub mod checkpoint;
pub mod option;
pub mod split;
pub mod ticker;

pub use bar::{DataKind, RawBar};
pub use checkpoint::IngestionCheckpoint;
pub use option::{OptionBar, OptionIdentity, OptionType};
pub use split::{SplitError, SplitEvent};
pub use ticker::{is_valid_symbol, TickerMetadata};
