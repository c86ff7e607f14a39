//! Catalog Batches Tool
//!
//! Inspect a catalog, ingest JSONL records into it, and run a batch merge from a
//! TOML config.
//!
//! Usage:
//!   cargo run --release --bin catalog_batches -- instruments --catalog ./catalog
//!   cargo run --release --bin catalog_batches -- partitions --catalog ./catalog --data-class quote_tick --instrument EURUSD.SIM
//!   cargo run --release --bin catalog_batches -- ingest --catalog ./catalog --data-class quote_tick --instrument EURUSD.SIM --input quotes.jsonl
//!   cargo run --release --bin catalog_batches -- merge --config merge_config.toml

use anyhow::{bail, Context, Result};
use catalog_merge::catalog::{CatalogIndex, CatalogRegistry, CatalogWriter, DateRange, Instrument};
use catalog_merge::clock::{format_nanos, parse_timestamp, Nanos};
use catalog_merge::persistence::{parse_bytes, Batch, BatchMerger, MergeConfig};
use catalog_merge::records::{DataClass, Record};
use catalog_merge::replay::{RecordHandler, ReplayDriver};
use clap::{Parser, Subcommand};
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "catalog_batches")]
#[command(about = "Inspect catalogs and merge their sources into time-ordered batches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the instruments registered in a catalog
    Instruments {
        #[arg(short, long)]
        catalog: PathBuf,
    },

    /// List the partitions of one stream
    Partitions {
        #[arg(short, long)]
        catalog: PathBuf,

        #[arg(short, long)]
        data_class: String,

        /// Omit for class-wide streams
        #[arg(short, long)]
        instrument: Option<String>,
    },

    /// Write records from a JSONL file as new partitions
    Ingest {
        #[arg(short, long)]
        catalog: PathBuf,

        #[arg(short, long)]
        data_class: String,

        #[arg(short, long)]
        instrument: Option<String>,

        /// One tagged record per line, e.g. {"type":"quote_tick",...}
        #[arg(long)]
        input: PathBuf,

        /// Split into files of at most this many rows
        #[arg(long)]
        max_rows: Option<usize>,
    },

    /// Merge the configured sources and print one line per batch
    Merge {
        #[arg(long, env = "MERGE_CONFIG_PATH", default_value = "merge_config.toml")]
        config: PathBuf,

        /// Override target_batch_size_bytes, e.g. 4096 or 10kib
        #[arg(long)]
        target_batch_size: Option<String>,

        /// Override read_num_rows
        #[arg(long)]
        read_num_rows: Option<usize>,

        /// Restrict every source to records at or after this RFC3339 time
        #[arg(long)]
        start: Option<String>,

        /// Restrict every source to records at or before this RFC3339 time
        #[arg(long)]
        end: Option<String>,

        /// Print only the final summary
        #[arg(short, long)]
        quiet: bool,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "catalog_merge=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Instruments { catalog } => list_instruments(catalog),
        Commands::Partitions {
            catalog,
            data_class,
            instrument,
        } => list_partitions(catalog, &data_class, instrument),
        Commands::Ingest {
            catalog,
            data_class,
            instrument,
            input,
            max_rows,
        } => ingest(catalog, &data_class, instrument.as_deref(), input, max_rows),
        Commands::Merge {
            config,
            target_batch_size,
            read_num_rows,
            start,
            end,
            quiet,
        } => merge(config, target_batch_size, read_num_rows, start, end, quiet),
    }
}

fn list_instruments(catalog: PathBuf) -> Result<()> {
    let index = CatalogIndex::open(catalog.as_path())
        .with_context(|| format!("Failed to open catalog: {:?}", catalog))?;

    println!("{:<28} {:<12} {:<12} {:>6} {:>6}", "ID", "Venue", "Class", "PxP", "SzP");
    println!("{}", "-".repeat(68));
    for instrument in index.instruments().iter() {
        println!(
            "{:<28} {:<12} {:<12} {:>6} {:>6}",
            instrument.id,
            instrument.venue,
            instrument.asset_class.as_deref().unwrap_or("-"),
            instrument.price_precision,
            instrument.size_precision
        );
    }
    println!("\n{} instruments", index.instruments().len());
    Ok(())
}

fn list_partitions(catalog: PathBuf, data_class: &str, instrument: Option<String>) -> Result<()> {
    let data_class: DataClass = data_class.parse()?;
    let index = CatalogIndex::open(catalog.as_path())
        .with_context(|| format!("Failed to open catalog: {:?}", catalog))?;
    let listing = index.listing(data_class, instrument.as_ref())?;

    println!(
        "{:<20} {:>10} {:>24} {:>24}",
        "File", "Rows", "First ts_init", "Last ts_init"
    );
    println!("{}", "-".repeat(82));
    let mut total = 0;
    for meta in listing.iter() {
        let file = meta
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        println!(
            "{:<20} {:>10} {:>24} {:>24}",
            file,
            meta.row_count,
            format_nanos(meta.min_ts),
            format_nanos(meta.max_ts)
        );
        total += meta.row_count;
    }
    println!("\n{} partitions, {} rows", listing.len(), total);
    Ok(())
}

fn ingest(
    catalog: PathBuf,
    data_class: &str,
    instrument: Option<&str>,
    input: PathBuf,
    max_rows: Option<usize>,
) -> Result<()> {
    let data_class: DataClass = data_class.parse()?;
    let file = std::fs::File::open(&input)
        .with_context(|| format!("Failed to open input: {:?}", input))?;

    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .with_context(|| format!("{:?}:{}: invalid record", input, line_no + 1))?;
        records.push(record);
    }

    let mut writer = CatalogWriter::create(&catalog)?;
    if let Some(max_rows) = max_rows {
        writer = writer.with_max_rows_per_partition(max_rows);
    }
    if let Some(id) = instrument {
        match writer.instruments().get(id) {
            Some(existing) => info!(instrument = id, venue = %existing.venue, "Instrument known"),
            None => {
                let venue = id.rsplit('.').next().unwrap_or(id);
                writer.add_instrument(Instrument::new(id, venue))?;
                info!(instrument = id, venue, "Instrument registered");
            }
        }
    }

    let files = writer.write_partition(data_class, instrument, &records)?;
    println!("Wrote {} records into {} partitions", records.len(), files.len());
    for path in files {
        println!("  {}", path.display());
    }
    Ok(())
}

/// Prints one line per batch as the replay clock reaches it.
struct BatchPrinter {
    quiet: bool,
}

impl RecordHandler for BatchPrinter {
    fn on_record(&mut self, _record: &Record, _now: Nanos) {}

    fn on_batch_end(&mut self, batch: &Batch, now: Nanos) {
        if self.quiet {
            return;
        }
        println!(
            "{:>6} {:>8} {:>12} {:>24} {:>24}",
            batch.seq,
            batch.len(),
            batch.estimated_bytes,
            batch.min_ts().map(format_nanos).unwrap_or_default(),
            format_nanos(now)
        );
    }
}

fn merge(
    config_path: PathBuf,
    target_batch_size: Option<String>,
    read_num_rows: Option<usize>,
    start: Option<String>,
    end: Option<String>,
    quiet: bool,
) -> Result<()> {
    let mut config = MergeConfig::load(&config_path)
        .with_context(|| format!("Failed to load merge config: {:?}", config_path))?;

    if let Some(size) = target_batch_size {
        config.target_batch_size_bytes = match parse_bytes(&size) {
            Some(bytes) => bytes,
            None => bail!("Invalid --target-batch-size: {}", size),
        };
    }
    if let Some(rows) = read_num_rows {
        config.read_num_rows = rows;
    }
    let start = start.map(|s| parse_time(&s)).transpose()?;
    let end = end.map(|s| parse_time(&s)).transpose()?;
    if start.is_some() || end.is_some() {
        for source in &mut config.sources {
            let range = source.date_range.unwrap_or_default();
            source.date_range = Some(DateRange::new(start.or(range.start), end.or(range.end)));
        }
    }

    let mut registry = CatalogRegistry::new();
    let mut merger = BatchMerger::open(&mut registry, &config)?;
    info!(sources = ?merger.source_names(), "Merging");

    if !quiet {
        println!(
            "{:>6} {:>8} {:>12} {:>24} {:>24}",
            "Batch", "Records", "Bytes", "First ts_init", "Last ts_init"
        );
        println!("{}", "-".repeat(78));
    }

    let mut driver = ReplayDriver::new(BatchPrinter { quiet });
    let summary = driver.run(merger.by_ref())?;
    let stats = merger.stats();

    println!();
    println!("Batches:      {}", summary.batches);
    println!("Records:      {}", summary.records);
    println!("Bytes:        {}", stats.bytes_emitted);
    println!("Refills:      {}", stats.refills);
    println!("Ties kept:    {}", stats.ties_absorbed);
    println!("Skipped:      {}", stats.sources_skipped);
    for (class, count) in &summary.records_by_class {
        println!("  {:<26} {}", class, count);
    }
    println!("Fingerprint:  {}", merger.fingerprint());
    Ok(())
}

fn parse_time(s: &str) -> Result<Nanos> {
    match parse_timestamp(s) {
        Some(ts) => Ok(ts),
        None => bail!("Invalid RFC3339 timestamp: {}", s),
    }
}
