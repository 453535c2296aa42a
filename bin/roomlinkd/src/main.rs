//! ---
//! rl_section: "07-binaries"
//! rl_subsection: "binary"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Binary entrypoint for the roomlink bus master daemon."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use roomlink_common::config::{parse_address, AppConfig};
use roomlink_common::logging::init_tracing;
use roomlink_core::{
    AddressTable, MasterController, ProtocolContext, ProtocolSettings, ScanMode, SystemCalendar,
};
use roomlink_metrics::{new_registry, spawn_http_server, DaemonMetrics, ProtocolMetrics, SharedRegistry};
use roomlink_msg::BusTransport;
use roomlink_persistence::{FileEeprom, GatedStore, LogAllocator, LogMetrics, RegionGeometry};
use roomlink_rt::{MonotonicClock, RateLimiter};
use roomlink_testharness::{SimulatedBus, SimulatedRoom};
use tokio::signal;
use tracing::{info, warn};

mod serial;

use serial::SerialBus;

#[derive(Debug, Parser)]
#[command(author, version, about = "roomlink bus master daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DEVICE", help = "Serial port overriding the configured one")]
    port: Option<String>,

    #[arg(long, help = "Drive simulated rooms instead of the serial port")]
    simulate: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliScanMode {
    FirstResponder,
    FindNew,
}

impl From<CliScanMode> for ScanMode {
    fn from(value: CliScanMode) -> Self {
        match value {
            CliScanMode::FirstResponder => ScanMode::FirstResponder,
            CliScanMode::FindNew => ScanMode::FindNew,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the poll loop until interrupted")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
    #[command(about = "Probe an address range and report the first unit that answers")]
    Scan {
        #[arg(long, value_parser = parse_address)]
        from: u16,
        #[arg(long, value_parser = parse_address)]
        to: u16,
        #[arg(long, value_enum, default_value = "first-responder")]
        mode: CliScanMode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/roomlink.toml"));
    candidates.push(PathBuf::from("configs/roomlink.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    let load_duration = load_started.elapsed();
    if let Some(port) = cli.port {
        config.bus.port = port;
    }

    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    let profile = if cfg!(debug_assertions) { "debug" } else { "release" };
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), profile);

    init_tracing("roomlinkd", &config.logging)?;
    info!(config_path = %loaded.source.display(), units = config.addressing.units.len(), "configuration loaded");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            println!("{} OK ({} units)", loaded.source.display(), config.addressing.units.len());
            Ok(())
        }
        Commands::Scan { from, to, mode } => {
            if from > to {
                bail!("scan range is empty: {from:#06x} > {to:#06x}");
            }
            if cli.simulate {
                let bus = simulated_bus(&config);
                scan(&config, bus, &registry, from, to, mode.into())
            } else {
                let bus = SerialBus::open(&config.bus.port, config.bus.baud_rate)?;
                scan(&config, bus, &registry, from, to, mode.into())
            }
        }
        Commands::Run => {
            if cli.simulate {
                info!("driving simulated rooms");
                run_daemon(&config, simulated_bus(&config), registry, daemon_metrics).await
            } else {
                info!(port = %config.bus.port, baud = config.bus.baud_rate, "opening serial port");
                let bus = SerialBus::open(&config.bus.port, config.bus.baud_rate)?;
                run_daemon(&config, bus, registry, daemon_metrics).await
            }
        }
    }
}

fn simulated_bus(config: &AppConfig) -> SimulatedBus {
    let addressing = &config.addressing;
    let mut bus = SimulatedBus::new(config.bus.master_address, addressing.group, addressing.broadcast)
        .with_random_silence(0x5EED, 0.02);
    for (n, unit) in addressing.units.iter().enumerate() {
        bus.add_room(SimulatedRoom::new(*unit).with_card_events(n % 4 * 6, n as u8));
    }
    bus
}

fn controller<B: BusTransport>(
    config: &AppConfig,
    bus: B,
    registry: &SharedRegistry,
) -> Result<MasterController<FileEeprom, B, MonotonicClock>> {
    let region = &config.log_region;
    let store = FileEeprom::open(&region.image, region.capacity)?;
    let log = LogAllocator::recover(
        GatedStore::new(store, region.ready_poll_limit, region.page_size),
        RegionGeometry::new(region.region_start, region.region_size),
    )?
    .with_metrics(LogMetrics::new(registry.clone())?);
    info!(
        records = log.count(),
        layout = %log.layout(),
        image = %region.image.display(),
        "master log recovered"
    );

    let ctx = ProtocolContext::new(
        ProtocolSettings::from_config(config),
        AddressTable::from_config(&config.addressing)?,
        log,
        Box::new(SystemCalendar),
    );
    let metrics = ProtocolMetrics::new(registry.clone())?;
    Ok(MasterController::new(ctx, bus, MonotonicClock::new()).with_metrics(metrics))
}

fn scan<B: BusTransport>(
    config: &AppConfig,
    bus: B,
    registry: &SharedRegistry,
    from: u16,
    to: u16,
    mode: ScanMode,
) -> Result<()> {
    let mut ctl = controller(config, bus, registry)?;
    let report = ctl.scan(from..=to, mode)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_daemon<B: BusTransport>(
    config: &AppConfig,
    bus: B,
    registry: SharedRegistry,
    daemon_metrics: DaemonMetrics,
) -> Result<()> {
    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let mut ctl = controller(config, bus, &registry)?;
    let mut limiter = RateLimiter::new(config.protocol.tick);
    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(transport = ctl.bus().name(), tick_ms = limiter.period().as_millis() as u64, "poll loop running; waiting for termination signal");
    loop {
        tokio::select! {
            _ = limiter.tick() => {
                let started = Instant::now();
                ctl.poll();
                if started.elapsed() > limiter.period() {
                    daemon_metrics.inc_tick_overrun();
                }
            }
            result = &mut shutdown => {
                result?;
                info!("ctrl-c received; shutting down");
                break;
            }
        }
    }

    let ctx = ctl.context();
    info!(
        ticks = ctl.ticks(),
        flags = %ctl.flags(),
        log_records = ctx.log.count(),
        unreachable = ctx.units.unreachable_count(),
        "poll loop stopped"
    );
    if ctx.transfer.is_some() {
        warn!("transfer session interrupted by shutdown");
    }

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}
