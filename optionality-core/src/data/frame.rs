//! Conversions between domain rows and Polars DataFrames.

use super::schema::Table;
use crate::domain::{OptionBar, RawBar, SplitEvent, TickerMetadata};
use chrono::NaiveDate;
use polars::prelude::*;

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn epoch_days(date: NaiveDate) -> i32 {
    (date - epoch()).num_days() as i32
}

fn integrity(msg: String) -> PolarsError {
    PolarsError::ComputeError(msg.into())
}

fn date_column(name: &str, days: Vec<i32>) -> PolarsResult<Column> {
    Column::new(name.into(), days).cast(&DataType::Date)
}

/// Stock bars as a stocks-table frame.
pub fn bars_to_frame(bars: &[&RawBar]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Column::new(
            "ticker".into(),
            bars.iter().map(|b| b.symbol.as_str()).collect::<Vec<_>>(),
        ),
        date_column(
            "window_start",
            bars.iter().map(|b| epoch_days(b.window_start)).collect(),
        )?,
        Column::new("volume".into(), bars.iter().map(|b| b.volume).collect::<Vec<u64>>()),
        Column::new("open".into(), bars.iter().map(|b| b.open).collect::<Vec<f64>>()),
        Column::new("close".into(), bars.iter().map(|b| b.close).collect::<Vec<f64>>()),
        Column::new("high".into(), bars.iter().map(|b| b.high).collect::<Vec<f64>>()),
        Column::new("low".into(), bars.iter().map(|b| b.low).collect::<Vec<f64>>()),
        Column::new(
            "transactions".into(),
            bars.iter().map(|b| b.transactions).collect::<Vec<u64>>(),
        ),
    ])
}

/// Option bars as an options-table frame.
pub fn option_bars_to_frame(bars: &[&OptionBar]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Column::new(
            "ticker".into(),
            bars.iter().map(|b| b.bar.symbol.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "underlying_symbol".into(),
            bars.iter()
                .map(|b| b.identity.underlying_symbol.as_str())
                .collect::<Vec<_>>(),
        ),
        date_column(
            "expiration_date",
            bars.iter()
                .map(|b| epoch_days(b.identity.expiration_date))
                .collect(),
        )?,
        Column::new(
            "option_type".into(),
            bars.iter()
                .map(|b| b.identity.option_type.code().to_string())
                .collect::<Vec<_>>(),
        ),
        Column::new(
            "strike_price".into(),
            bars.iter()
                .map(|b| b.identity.strike_price())
                .collect::<Vec<f64>>(),
        ),
        date_column(
            "window_start",
            bars.iter().map(|b| epoch_days(b.bar.window_start)).collect(),
        )?,
        Column::new("volume".into(), bars.iter().map(|b| b.bar.volume).collect::<Vec<u64>>()),
        Column::new("open".into(), bars.iter().map(|b| b.bar.open).collect::<Vec<f64>>()),
        Column::new("close".into(), bars.iter().map(|b| b.bar.close).collect::<Vec<f64>>()),
        Column::new("high".into(), bars.iter().map(|b| b.bar.high).collect::<Vec<f64>>()),
        Column::new("low".into(), bars.iter().map(|b| b.bar.low).collect::<Vec<f64>>()),
        Column::new(
            "transactions".into(),
            bars.iter().map(|b| b.bar.transactions).collect::<Vec<u64>>(),
        ),
    ])
}

pub fn splits_to_frame(splits: &[SplitEvent]) -> PolarsResult<DataFrame> {
    DataFrame::new(vec![
        Column::new(
            "id".into(),
            splits.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
        ),
        Column::new(
            "ticker".into(),
            splits.iter().map(|s| s.ticker.as_str()).collect::<Vec<_>>(),
        ),
        date_column(
            "execution_date",
            splits.iter().map(|s| epoch_days(s.execution_date)).collect(),
        )?,
        Column::new(
            "split_from".into(),
            splits.iter().map(SplitEvent::split_from).collect::<Vec<u32>>(),
        ),
        Column::new(
            "split_to".into(),
            splits.iter().map(SplitEvent::split_to).collect::<Vec<u32>>(),
        ),
        Column::new(
            "split_factor".into(),
            splits.iter().map(SplitEvent::split_factor).collect::<Vec<f64>>(),
        ),
    ])
}

pub fn tickers_to_frame(tickers: &[TickerMetadata]) -> PolarsResult<DataFrame> {
    let text = |name: &str, f: fn(&TickerMetadata) -> Option<&str>| {
        Column::new(name.into(), tickers.iter().map(f).collect::<Vec<Option<&str>>>())
    };
    DataFrame::new(vec![
        Column::new(
            "ticker".into(),
            tickers.iter().map(|t| t.ticker.as_str()).collect::<Vec<_>>(),
        ),
        text("name", |t| t.name.as_deref()),
        text("market", |t| t.market.as_deref()),
        text("locale", |t| t.locale.as_deref()),
        text("primary_exchange", |t| t.primary_exchange.as_deref()),
        text("type", |t| t.ticker_type.as_deref()),
        Column::new("active".into(), tickers.iter().map(|t| t.active).collect::<Vec<bool>>()),
        text("currency_name", |t| t.currency_name.as_deref()),
        text("cik", |t| t.cik.as_deref()),
        text("composite_figi", |t| t.composite_figi.as_deref()),
        text("share_class_figi", |t| t.share_class_figi.as_deref()),
        text("last_updated_utc", |t| t.last_updated_utc.as_deref()),
        text("delisted_utc", |t| t.delisted_utc.as_deref()),
    ])
}

/// Read a stocks-table frame back into bars. Rows with a null key column
/// are an integrity error; null prices read as NaN.
pub fn frame_to_bars(df: &DataFrame) -> PolarsResult<Vec<RawBar>> {
    let tickers = df.column("ticker")?.str()?;
    let dates = df.column("window_start")?.date()?;
    let volumes = df.column("volume")?.u64()?;
    let opens = df.column("open")?.f64()?;
    let closes = df.column("close")?.f64()?;
    let highs = df.column("high")?.f64()?;
    let lows = df.column("low")?.f64()?;
    let transactions = df.column("transactions")?.u64()?;

    let epoch = epoch();
    let mut bars = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let (Some(symbol), Some(days)) = (tickers.get(i), dates.get(i)) else {
            return Err(integrity(format!("null ticker or window_start at row {i}")));
        };
        bars.push(RawBar {
            symbol: symbol.to_string(),
            window_start: epoch + chrono::Duration::days(i64::from(days)),
            volume: volumes.get(i).unwrap_or(0),
            open: opens.get(i).unwrap_or(f64::NAN),
            close: closes.get(i).unwrap_or(f64::NAN),
            high: highs.get(i).unwrap_or(f64::NAN),
            low: lows.get(i).unwrap_or(f64::NAN),
            transactions: transactions.get(i).unwrap_or(0),
        });
    }
    Ok(bars)
}

/// Read a splits-table frame back into events. Invalid rows are an
/// integrity error: the splits table only ever holds validated events.
pub fn frame_to_splits(df: &DataFrame) -> PolarsResult<Vec<SplitEvent>> {
    let ids = df.column("id")?.str()?;
    let tickers = df.column("ticker")?.str()?;
    let dates = df.column("execution_date")?.date()?;
    let froms = df.column("split_from")?.u32()?;
    let tos = df.column("split_to")?.u32()?;

    let epoch = epoch();
    let mut splits = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let (Some(id), Some(ticker), Some(days), Some(from), Some(to)) =
            (ids.get(i), tickers.get(i), dates.get(i), froms.get(i), tos.get(i))
        else {
            return Err(integrity(format!("null field in splits row {i}")));
        };
        let date = epoch + chrono::Duration::days(i64::from(days));
        let split = SplitEvent::new(id, ticker, date, from, to)
            .map_err(|e| integrity(format!("splits row {i}: {e}")))?;
        splits.push(split);
    }
    Ok(splits)
}

/// Frame with no rows and the table's schema.
pub fn empty_frame(table: Table) -> DataFrame {
    DataFrame::empty_with_schema(&table.schema())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OptionIdentity, OptionType};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn bar(symbol: &str, date: NaiveDate) -> RawBar {
        RawBar {
            symbol: symbol.into(),
            window_start: date,
            volume: 10,
            open: 1.0,
            close: 2.0,
            high: 3.0,
            low: 0.5,
            transactions: 4,
        }
    }

    #[test]
    fn stock_frame_matches_schema_and_reads_back() {
        let bars = [bar("AAPL", d(2024, 1, 2)), bar("AAPL", d(2024, 1, 3))];
        let refs: Vec<&RawBar> = bars.iter().collect();
        let df = bars_to_frame(&refs).unwrap();
        Table::Stocks.validate(&df).unwrap();
        assert_eq!(frame_to_bars(&df).unwrap(), bars.to_vec());
    }

    #[test]
    fn option_frame_matches_schema() {
        let ob = OptionBar {
            bar: bar("O:SPY240315P00450500", d(2024, 3, 1)),
            identity: OptionIdentity {
                underlying_symbol: "SPY".into(),
                expiration_date: d(2024, 3, 15),
                option_type: OptionType::Put,
                strike_thousandths: 450_500,
            },
        };
        let df = option_bars_to_frame(&[&ob]).unwrap();
        Table::Options.validate(&df).unwrap();
        let strike = df.column("strike_price").unwrap().f64().unwrap().get(0);
        assert_eq!(strike, Some(450.5));
        let kind = df.column("option_type").unwrap().str().unwrap().get(0);
        assert_eq!(kind, Some("P"));
    }

    #[test]
    fn split_frame_keeps_factor_column() {
        let splits = vec![SplitEvent::new("E1", "AAPL", d(2020, 8, 31), 1, 4).unwrap()];
        let df = splits_to_frame(&splits).unwrap();
        Table::Splits.validate(&df).unwrap();
        assert_eq!(df.column("split_factor").unwrap().f64().unwrap().get(0), Some(4.0));
        assert_eq!(frame_to_splits(&df).unwrap(), splits);
    }

    #[test]
    fn ticker_frame_allows_nulls() {
        let mut t = TickerMetadata::new("AAPL");
        t.name = Some("Apple Inc.".into());
        let df = tickers_to_frame(&[t, TickerMetadata::new("MSFT")]).unwrap();
        Table::Tickers.validate(&df).unwrap();
        assert_eq!(df.column("name").unwrap().null_count(), 1);
    }

    #[test]
    fn empty_frames_validate() {
        let refs: Vec<&RawBar> = Vec::new();
        Table::Stocks.validate(&bars_to_frame(&refs).unwrap()).unwrap();
        Table::Splits.validate(&splits_to_frame(&[]).unwrap()).unwrap();
        assert_eq!(empty_frame(Table::Options).height(), 0);
    }
}
