//! Store administration: init, clean and stats.

use chrono::NaiveDate;
use optionality_core::data::{
    CheckpointLog, ColumnarStore, ScanFilter, StoreError, Table, TableStats,
};
use optionality_core::domain::{DataKind, IngestionCheckpoint};
use polars::prelude::*;
use serde::Serialize;
use tracing::info;

use crate::adjusted::QueryError;

/// Create every table directory and the state directories.
pub fn init_store(store: &dyn ColumnarStore, log: &CheckpointLog) -> Result<(), StoreError> {
    store.initialize()?;
    log.initialize()?;
    info!("store initialised");
    Ok(())
}

/// Delete every table, checkpoint and commit record, then re-initialise.
pub fn clean_store(store: &dyn ColumnarStore, log: &CheckpointLog) -> Result<(), StoreError> {
    for table in Table::ALL {
        store.delete_table(table)?;
        info!(%table, "table deleted");
    }
    log.reset()?;
    init_store(store, log)
}

#[derive(Debug, Clone, Serialize)]
pub struct TableReport {
    pub table: Table,
    pub rows: u64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub footprint: TableStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreReport {
    pub tables: Vec<TableReport>,
    pub checkpoints: Vec<IngestionCheckpoint>,
}

pub fn store_stats(
    store: &dyn ColumnarStore,
    log: &CheckpointLog,
) -> Result<StoreReport, QueryError> {
    let mut tables = Vec::new();
    for table in Table::ALL {
        let lf = store.scan(table, &ScanFilter::all())?;
        let mut aggs = vec![len().cast(DataType::UInt64).alias("rows")];
        if let Some(date_col) = table.date_column() {
            aggs.push(col(date_col).min().alias("first"));
            aggs.push(col(date_col).max().alias("last"));
        }
        let df = lf.select(aggs).collect()?;

        let rows = df.column("rows")?.u64()?.get(0).unwrap_or(0);
        let (first_date, last_date) = if table.date_column().is_some() {
            (
                date_value(df.column("first")?)?,
                date_value(df.column("last")?)?,
            )
        } else {
            (None, None)
        };

        tables.push(TableReport {
            table,
            rows,
            first_date,
            last_date,
            footprint: store.table_stats(table)?,
        });
    }

    let checkpoints = DataKind::ALL
        .iter()
        .map(|&kind| log.load_checkpoint(kind))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StoreReport {
        tables,
        checkpoints,
    })
}

fn date_value(column: &Column) -> PolarsResult<Option<NaiveDate>> {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    Ok(column
        .date()?
        .get(0)
        .map(|days| epoch + chrono::Duration::days(i64::from(days))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use optionality_core::data::frame::splits_to_frame;
    use optionality_core::data::ParquetStore;
    use optionality_core::domain::SplitEvent;

    #[test]
    fn stats_of_fresh_store_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let log = CheckpointLog::new(dir.path());
        init_store(&store, &log).unwrap();

        let report = store_stats(&store, &log).unwrap();
        assert_eq!(report.tables.len(), 4);
        assert!(report.tables.iter().all(|t| t.rows == 0 && t.first_date.is_none()));
        assert!(report.checkpoints.iter().all(|c| c.last_loaded_date.is_none()));
    }

    #[test]
    fn stats_report_date_range_and_clean_resets() {
        let dir = tempfile::tempdir().unwrap();
        let store = ParquetStore::new(dir.path());
        let log = CheckpointLog::new(dir.path());
        init_store(&store, &log).unwrap();

        let d1 = NaiveDate::from_ymd_opt(2020, 8, 31).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 6, 10).unwrap();
        let splits = vec![
            SplitEvent::new("a", "AAPL", d1, 1, 4).unwrap(),
            SplitEvent::new("n", "NVDA", d2, 1, 10).unwrap(),
        ];
        store
            .replace_table(Table::Splits, splits_to_frame(&splits).unwrap())
            .unwrap();
        log.save_checkpoint(&IngestionCheckpoint::empty(DataKind::Stocks).advanced_to(d2))
            .unwrap();

        let report = store_stats(&store, &log).unwrap();
        let split_stats = report
            .tables
            .iter()
            .find(|t| t.table == Table::Splits)
            .unwrap();
        assert_eq!(split_stats.rows, 2);
        assert_eq!(split_stats.first_date, Some(d1));
        assert_eq!(split_stats.last_date, Some(d2));
        assert_eq!(report.checkpoints[0].last_loaded_date, Some(d2));

        clean_store(&store, &log).unwrap();
        let report = store_stats(&store, &log).unwrap();
        assert!(report.tables.iter().all(|t| t.rows == 0));
        assert!(report.checkpoints.iter().all(|c| c.last_loaded_date.is_none()));
    }
}
