//! Optionality CLI: incremental market data ingestion and verification.
//!
//! Commands:
//! - `update`: sync splits, load new stocks and options dates, spot-check
//! - `check-files`: report whether the vendor has published a date's files
//! - `verify`: spot-check split-adjusted prices against the vendor
//! - `clean`: delete every table and checkpoint (dry run without `--confirm`)
//! - `init`, `stats`, `refresh-tickers`: store administration

use anyhow::{Context, Result};
use chrono::{Duration, NaiveDate, Utc};
use chrono_tz::America::New_York;
use clap::{Parser, Subcommand};
use optionality_core::data::{ColumnarStore, FlatFileSource};
use optionality_core::domain::DataKind;
use optionality_runner::config::{Requirements, Settings};
use optionality_runner::pipeline::LogProgress;
use optionality_runner::report::{RunSummary, VerificationSummary};
use optionality_runner::verify::{verify, VerifyConfig};
use optionality_runner::workflow::{build_flat_files, build_vendor, open_store, run_update};
use optionality_runner::{clean_store, init_store, logging, refresh_tickers, store_stats};
use optionality_runner::{StoreReport, TickerRefreshReport};
use serde::Serialize;
use std::path::PathBuf;
use tracing::error;

/// Exit code for "files not yet published".
const EXIT_NOT_AVAILABLE: i32 = 2;

#[derive(Parser)]
#[command(
    name = "optionality",
    about = "Incremental Polygon flat-file ingestion with split-adjustment verification"
)]
struct Cli {
    /// Settings file. Defaults to ./optionality.toml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging. RUST_LOG takes precedence.
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Print results as JSON instead of tables.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync splits, load every new stocks and options date, then spot-check.
    Update {
        /// Last date to load (YYYY-MM-DD). Defaults to yesterday in New York.
        #[arg(long)]
        through: Option<String>,
    },
    /// Check whether the stocks and options files for a date are published.
    CheckFiles {
        /// Date to check (YYYY-MM-DD). Defaults to yesterday in New York.
        #[arg(long)]
        date: Option<String>,
    },
    /// Spot-check split-adjusted closes against the vendor.
    Verify {
        /// Tickers to sample.
        #[arg(long)]
        sample_size: Option<usize>,

        /// Relative tolerance (0.001 = 0.1%).
        #[arg(long)]
        tolerance: Option<f64>,

        /// RNG seed for a reproducible sample.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Delete every table, checkpoint and commit record, then re-initialise.
    Clean {
        /// Actually delete (without this flag, only previews what would be removed).
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
    /// Create the empty store layout.
    Init,
    /// Row counts, date ranges and disk usage per table.
    Stats,
    /// Replace the tickers table from the vendor listing.
    RefreshTickers,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("Error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    let json = cli.json;

    match cli.command {
        Commands::Update { through } => {
            settings.validate(Requirements::ALL)?;
            let through = parse_date_or_yesterday(through.as_deref())?;
            run_update_cmd(&settings, through, json)
        }
        Commands::CheckFiles { date } => {
            settings.validate(Requirements {
                rest_api: false,
                flat_files: true,
            })?;
            let date = parse_date_or_yesterday(date.as_deref())?;
            run_check_files(&settings, date)
        }
        Commands::Verify {
            sample_size,
            tolerance,
            seed,
        } => {
            if let Some(n) = sample_size {
                settings.verify.sample_size = n;
            }
            if let Some(t) = tolerance {
                settings.verify.tolerance = t;
            }
            if seed.is_some() {
                settings.verify.seed = seed;
            }
            settings.validate(Requirements::ALL)?;
            run_verify(&settings, json)
        }
        Commands::Clean { confirm } => {
            settings.validate(Requirements::NONE)?;
            run_clean(&settings, confirm)
        }
        Commands::Init => {
            settings.validate(Requirements::NONE)?;
            let (store, log) = open_store(&settings);
            init_store(&store, &log)?;
            println!("Initialised store at {}", settings.storage.path.display());
            Ok(0)
        }
        Commands::Stats => {
            settings.validate(Requirements::NONE)?;
            let (store, log) = open_store(&settings);
            let report = store_stats(&store, &log)?;
            if json {
                print_json(&report)?;
            } else {
                print_stats(&report, &settings);
            }
            Ok(0)
        }
        Commands::RefreshTickers => {
            settings.validate(Requirements::ALL)?;
            let vendor = build_vendor(&settings)?;
            let (store, _) = open_store(&settings);
            store.initialize()?;
            let report = refresh_tickers(&vendor, &store)?;
            if json {
                print_json(&report)?;
            } else {
                print_ticker_refresh(&report);
            }
            Ok(0)
        }
    }
}

fn today_in_new_york() -> NaiveDate {
    Utc::now().with_timezone(&New_York).date_naive()
}

fn parse_date_or_yesterday(arg: Option<&str>) -> Result<NaiveDate> {
    match arg {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid date '{s}', expected YYYY-MM-DD")),
        None => Ok(today_in_new_york() - Duration::days(1)),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run_update_cmd(settings: &Settings, through: NaiveDate, json: bool) -> Result<i32> {
    let vendor = build_vendor(settings)?;
    let (store, log) = open_store(settings);
    init_store(&store, &log)?;

    let summary = run_update(
        &vendor,
        &store,
        &log,
        settings,
        through,
        today_in_new_york(),
        &LogProgress,
    )?;

    if json {
        print_json(&summary)?;
    } else {
        print_run_summary(&summary);
    }
    Ok(if summary.is_success() { 0 } else { 1 })
}

fn run_check_files(settings: &Settings, date: NaiveDate) -> Result<i32> {
    let files = build_flat_files(settings)?;

    let mut all_present = true;
    println!("Flat files for {date}:");
    for kind in DataKind::ALL {
        let present = files.exists(kind, date)?;
        all_present &= present;
        let status = if present { "available" } else { "not yet available" };
        println!("  {:<8} {:<18} {}", kind.as_str(), status, files.locate(kind, date));
    }

    Ok(if all_present { 0 } else { EXIT_NOT_AVAILABLE })
}

fn run_verify(settings: &Settings, json: bool) -> Result<i32> {
    let vendor = build_vendor(settings)?;
    let (store, _) = open_store(settings);
    let config = VerifyConfig::from_settings(&settings.verify, false);

    let report = verify(&vendor, &store, &config, today_in_new_york())?;
    if json {
        print_json(&report)?;
    } else {
        print_verification(&VerificationSummary::from(&report));
    }
    Ok(if report.is_success() { 0 } else { 1 })
}

fn run_clean(settings: &Settings, confirm: bool) -> Result<i32> {
    let (store, log) = open_store(settings);
    if !settings.storage.path.exists() {
        println!(
            "Store directory does not exist: {}",
            settings.storage.path.display()
        );
        return Ok(0);
    }

    let report = store_stats(&store, &log)?;
    println!("Store: {}", settings.storage.path.display());
    for table in &report.tables {
        println!(
            "  {:<8} {:>12} rows {:>10}",
            table.table.name(),
            table.rows,
            format_size(table.footprint.bytes)
        );
    }

    if !confirm {
        println!();
        println!("Dry run: pass --confirm to delete every table and checkpoint.");
        return Ok(0);
    }

    clean_store(&store, &log)?;
    println!("Done. Store reset.");
    Ok(0)
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_date(date: Option<NaiveDate>) -> String {
    date.map_or_else(|| "-".to_string(), |d| d.to_string())
}

fn print_run_summary(summary: &RunSummary) {
    println!();
    println!("=== Update Summary ===");
    let elapsed = summary
        .finished_at
        .map(|end| (end - summary.started_at).num_seconds())
        .unwrap_or(0);
    println!("Started:        {}", summary.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Elapsed:        {elapsed}s");
    if let Some(splits) = &summary.splits {
        println!(
            "Splits:         {} stored ({} fetched, {} duplicates)",
            splits.stored, splits.fetched, splits.duplicates
        );
    }
    for kind in summary.kinds.iter().filter(|k| !k.backfilled.is_empty()) {
        let dates: Vec<String> = kind.backfilled.iter().map(ToString::to_string).collect();
        println!("Backfill:       {} {}", kind.kind, dates.join(", "));
    }

    println!();
    println!(
        "{:<8} {:<12} {:<12} {:>9} {:>8} {:>7} {:>9} {:>11} {:>9}",
        "Kind", "Before", "After", "Committed", "Missing", "Failed", "Cancelled", "Rows", "Skipped"
    );
    println!("{}", "-".repeat(94));
    for kind in &summary.kinds {
        println!(
            "{:<8} {:<12} {:<12} {:>9} {:>8} {:>7} {:>9} {:>11} {:>9}",
            kind.kind.as_str(),
            format_date(kind.checkpoint_before),
            format_date(kind.checkpoint_after),
            kind.counts.committed,
            kind.counts.not_available,
            kind.counts.failed,
            kind.counts.cancelled,
            kind.counts.rows,
            kind.counts.skipped_rows,
        );
    }
    for kind in &summary.kinds {
        for failure in &kind.failures {
            println!("FAILED: {} {}: {}", kind.kind, failure.date, failure.error);
        }
    }

    if let Some(verification) = &summary.verification {
        print_verification(verification);
    }
    for err in &summary.errors {
        println!("ERROR: {err}");
    }

    println!();
    if summary.is_success() {
        println!("Result: OK ({} rows committed)", summary.rows_committed());
    } else {
        println!("Result: FAILED");
    }
    println!();
}

fn print_verification(v: &VerificationSummary) {
    println!();
    println!("--- Verification ---");
    println!("Tickers:        {}", v.sampled_tickers.join(", "));
    println!("Tolerance:      {:.3}%", v.tolerance * 100.0);
    println!(
        "Comparisons:    {} ({} passed, {} failed, {} no data, {} errors)",
        v.comparisons, v.passed, v.failed, v.no_data, v.errors
    );
    if v.problems.is_empty() {
        return;
    }
    println!();
    println!(
        "{:<8} {:<12} {:>12} {:>12} {:>12} {:>10}  {}",
        "Ticker", "Date", "Raw", "Adjusted", "Vendor", "Diff %", "Status"
    );
    println!("{}", "-".repeat(80));
    let price = |p: Option<f64>| p.map_or_else(|| "-".to_string(), |p| format!("{p:.4}"));
    for check in &v.problems {
        println!(
            "{:<8} {:<12} {:>12} {:>12} {:>12} {:>10}  {:?}",
            check.ticker,
            check.date,
            price(check.raw_close),
            price(check.local_adjusted),
            price(check.reference),
            check
                .rel_diff
                .map_or_else(|| "-".to_string(), |r| format!("{:.3}", r * 100.0)),
            check.status,
        );
    }
}

fn print_stats(report: &StoreReport, settings: &Settings) {
    println!("Store: {}", settings.storage.path.display());
    println!();
    println!(
        "{:<8} {:>12} {:<12} {:<12} {:>10} {:>8} {:>10}",
        "Table", "Rows", "First", "Last", "Partitions", "Files", "Size"
    );
    println!("{}", "-".repeat(78));
    let mut total = 0;
    for t in &report.tables {
        total += t.footprint.bytes;
        println!(
            "{:<8} {:>12} {:<12} {:<12} {:>10} {:>8} {:>10}",
            t.table.name(),
            t.rows,
            format_date(t.first_date),
            format_date(t.last_date),
            t.footprint.partitions,
            t.footprint.files,
            format_size(t.footprint.bytes),
        );
    }
    println!("Total size: {}", format_size(total));
    println!();
    for cp in &report.checkpoints {
        println!(
            "Checkpoint {:<8} {}",
            cp.kind.as_str(),
            format_date(cp.last_loaded_date)
        );
    }
}

fn print_ticker_refresh(report: &TickerRefreshReport) {
    println!(
        "Tickers: {} stored ({} fetched, {} skipped)",
        report.stored, report.fetched, report.skipped
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_dates() {
        assert_eq!(
            parse_date_or_yesterday(Some("2024-03-05")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
        );
        assert!(parse_date_or_yesterday(Some("03/05/2024")).is_err());
    }

    #[test]
    fn default_date_is_before_today() {
        assert!(parse_date_or_yesterday(None).unwrap() < today_in_new_york());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["optionality", "verify", "--seed", "7", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Commands::Verify { seed: Some(7), .. }));
    }
}
