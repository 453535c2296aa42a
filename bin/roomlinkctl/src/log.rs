//! ---
//! rl_section: "07-binaries"
//! rl_subsection: "binary"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master log image inspection and maintenance subcommands."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use roomlink_common::config::AppConfig;
use roomlink_msg::LogRecord;
use roomlink_persistence::{FileEeprom, GatedStore, LogAllocator, RegionGeometry};
use serde_json::json;
use tracing::info;

use crate::load_config;

#[derive(Debug, Subcommand)]
pub enum LogCommand {
    /// Print stored records, oldest first, one JSON object per line.
    Dump(DumpArgs),
    /// Recover the ring and report its layout.
    Scan(ImageArgs),
    /// Print and then delete the oldest records.
    Drain(DrainArgs),
    /// Delete every record in the region.
    Clear(ImageArgs),
}

#[derive(Debug, Args)]
pub struct ImageArgs {
    /// EEPROM image file; defaults to `log_region.image` from the configuration.
    #[arg(long, value_name = "FILE")]
    image: Option<PathBuf>,

    /// Configuration supplying the region geometry.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DumpArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Index of the first record to print.
    #[arg(long, default_value_t = 0)]
    start: usize,

    /// Print at most this many records.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct DrainArgs {
    #[command(flatten)]
    image: ImageArgs,

    /// Records to drain.
    #[arg(long, default_value_t = 16)]
    count: usize,
}

pub fn run(command: LogCommand) -> Result<()> {
    match command {
        LogCommand::Dump(args) => dump(args),
        LogCommand::Scan(args) => scan(args),
        LogCommand::Drain(args) => drain(args),
        LogCommand::Clear(args) => clear(args),
    }
}

impl ImageArgs {
    fn open(&self) -> Result<LogAllocator<FileEeprom>> {
        let config: AppConfig = load_config(self.config.as_deref())?;
        let region = &config.log_region;
        let image = self.image.clone().unwrap_or_else(|| region.image.clone());
        let store = FileEeprom::open(&image, region.capacity)
            .with_context(|| format!("unable to open log image {}", image.display()))?;
        let log = LogAllocator::recover(
            GatedStore::new(store, region.ready_poll_limit, region.page_size),
            RegionGeometry::new(region.region_start, region.region_size),
        )?;
        Ok(log)
    }
}

fn record_json(record: &LogRecord) -> serde_json::Value {
    json!({
        "sequence": record.sequence,
        "event_code": format!("{:#04x}", record.event_code),
        "event_type": record.event_type,
        "group": record.group,
        "originator": hex::encode(record.originator),
        "timestamp": record.timestamp.to_string(),
    })
}

fn print_records(records: &[LogRecord]) -> Result<()> {
    for record in records {
        println!("{}", serde_json::to_string(&record_json(record))?);
    }
    Ok(())
}

fn dump(args: DumpArgs) -> Result<()> {
    let mut log = args.image.open()?;
    let limit = args.limit.unwrap_or_else(|| log.count());
    let records = log.read_page(args.start, limit)?;
    print_records(&records)
}

fn scan(args: ImageArgs) -> Result<()> {
    let log = args.open()?;
    let report = json!({
        "layout": log.layout().to_string(),
        "region": log.region(),
        "geometry": log.geometry(),
        "recovery": log.recovery(),
        "slots": log.geometry().slots(),
        "free_slots": log.free_slots(),
        "next_sequence": log.next_sequence(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn drain(args: DrainArgs) -> Result<()> {
    let mut log = args.image.open()?;
    let records = log.read_page(0, args.count)?;
    if records.is_empty() {
        info!("log image holds no records");
        return Ok(());
    }
    print_records(&records)?;
    let removed = log.delete_records(records.len())?;
    info!(removed, remaining = log.count(), "drained log records");
    Ok(())
}

fn clear(args: ImageArgs) -> Result<()> {
    let mut log = args.open()?;
    let before = log.count();
    log.delete_all()?;
    info!(removed = before, "log image cleared");
    Ok(())
}
