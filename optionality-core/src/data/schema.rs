//! Table schemas and partitioning for the columnar store.

use crate::domain::DataKind;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The four persisted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Tickers,
    Stocks,
    Splits,
    Options,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Tickers, Table::Stocks, Table::Splits, Table::Options];

    pub fn for_kind(kind: DataKind) -> Self {
        match kind {
            DataKind::Stocks => Table::Stocks,
            DataKind::Options => Table::Options,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Table::Tickers => "tickers",
            Table::Stocks => "stocks",
            Table::Splits => "splits",
            Table::Options => "options",
        }
    }

    /// Column whose value selects the partition directory. `None` for the
    /// small reference tables, which live in a single file.
    pub fn partition_column(self) -> Option<&'static str> {
        match self {
            Table::Stocks => Some("ticker"),
            Table::Options => Some("underlying_symbol"),
            Table::Tickers | Table::Splits => None,
        }
    }

    /// Column used for date-range filtering, if the table has one.
    pub fn date_column(self) -> Option<&'static str> {
        match self {
            Table::Stocks | Table::Options => Some("window_start"),
            Table::Splits => Some("execution_date"),
            Table::Tickers => None,
        }
    }

    /// Column holding the symbol a ticker filter applies to.
    pub fn symbol_column(self) -> &'static str {
        match self {
            Table::Options => "underlying_symbol",
            Table::Tickers | Table::Stocks | Table::Splits => "ticker",
        }
    }

    pub fn schema(self) -> Schema {
        let fields = match self {
            Table::Stocks => vec![
                Field::new("ticker".into(), DataType::String),
                Field::new("window_start".into(), DataType::Date),
                Field::new("volume".into(), DataType::UInt64),
                Field::new("open".into(), DataType::Float64),
                Field::new("close".into(), DataType::Float64),
                Field::new("high".into(), DataType::Float64),
                Field::new("low".into(), DataType::Float64),
                Field::new("transactions".into(), DataType::UInt64),
            ],
            Table::Options => vec![
                Field::new("ticker".into(), DataType::String),
                Field::new("underlying_symbol".into(), DataType::String),
                Field::new("expiration_date".into(), DataType::Date),
                Field::new("option_type".into(), DataType::String),
                Field::new("strike_price".into(), DataType::Float64),
                Field::new("window_start".into(), DataType::Date),
                Field::new("volume".into(), DataType::UInt64),
                Field::new("open".into(), DataType::Float64),
                Field::new("close".into(), DataType::Float64),
                Field::new("high".into(), DataType::Float64),
                Field::new("low".into(), DataType::Float64),
                Field::new("transactions".into(), DataType::UInt64),
            ],
            Table::Splits => vec![
                Field::new("id".into(), DataType::String),
                Field::new("ticker".into(), DataType::String),
                Field::new("execution_date".into(), DataType::Date),
                Field::new("split_from".into(), DataType::UInt32),
                Field::new("split_to".into(), DataType::UInt32),
                Field::new("split_factor".into(), DataType::Float64),
            ],
            Table::Tickers => vec![
                Field::new("ticker".into(), DataType::String),
                Field::new("name".into(), DataType::String),
                Field::new("market".into(), DataType::String),
                Field::new("locale".into(), DataType::String),
                Field::new("primary_exchange".into(), DataType::String),
                Field::new("type".into(), DataType::String),
                Field::new("active".into(), DataType::Boolean),
                Field::new("currency_name".into(), DataType::String),
                Field::new("cik".into(), DataType::String),
                Field::new("composite_figi".into(), DataType::String),
                Field::new("share_class_figi".into(), DataType::String),
                Field::new("last_updated_utc".into(), DataType::String),
                Field::new("delisted_utc".into(), DataType::String),
            ],
        };
        Schema::from_iter(fields)
    }

    /// Validate a DataFrame against this table's schema.
    pub fn validate(self, df: &DataFrame) -> Result<(), SchemaError> {
        let expected = self.schema();
        let actual = df.schema();

        for field in expected.iter_fields() {
            let actual_dtype = actual
                .get(field.name())
                .ok_or_else(|| SchemaError::MissingColumn {
                    table: self,
                    column: field.name().to_string(),
                })?;
            if actual_dtype != field.dtype() {
                return Err(SchemaError::TypeMismatch {
                    table: self,
                    column: field.name().to_string(),
                    expected: field.dtype().clone(),
                    actual: actual_dtype.clone(),
                });
            }
        }

        Ok(())
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("{table}: missing required column {column}")]
    MissingColumn { table: Table, column: String },

    #[error("{table}: type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        table: Table,
        column: String,
        expected: DataType,
        actual: DataType,
    },
}
