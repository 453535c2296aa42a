//! ---
//! rl_section: "07-binaries"
//! rl_subsection: "binary"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Simulated bus run for operators and smoke tests."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Args;
use roomlink_common::config::AppConfig;
use roomlink_core::{
    AddressTable, MasterController, ProtocolContext, ProtocolSettings, SystemCalendar,
};
use roomlink_persistence::{
    FileEeprom, GatedStore, LogAllocator, MemoryEeprom, NvStore, RegionGeometry,
};
use roomlink_rt::{Clock, ManualClock};
use roomlink_testharness::{SimulatedBus, SimulatedRoom};
use roomlink_transfer::{MemorySource, TransferKind};
use serde_json::json;
use tracing::info;

use crate::load_config;

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Poll loop iterations to run.
    #[arg(long, default_value_t = 5000)]
    ticks: u64,

    /// Simulated rooms, addressed from 0x0101 upward.
    #[arg(long, default_value_t = 4)]
    rooms: u16,

    /// Card events each room holds at start.
    #[arg(long, default_value_t = 8)]
    logs: usize,

    /// Share of point-to-point requests the rooms never see.
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    /// Seed for the loss generator.
    #[arg(long, default_value_t = 0x5EED)]
    seed: u64,

    /// Push a firmware image of this many bytes to the first room.
    #[arg(long, value_name = "BYTES")]
    firmware_bytes: Option<usize>,

    /// Keep the master log in this image file instead of memory.
    #[arg(long, value_name = "FILE")]
    log_image: Option<PathBuf>,

    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl SimulateArgs {
    pub fn execute(self) -> Result<()> {
        if self.rooms == 0 || self.rooms > 0x00FF {
            bail!("--rooms must be within 1..=255");
        }
        let config = load_config(self.config.as_deref())?;
        let region = &config.log_region;
        let geometry = RegionGeometry::new(region.region_start, region.region_size);
        let summary = match &self.log_image {
            Some(path) => {
                let store = FileEeprom::open(path, region.capacity)?;
                let gated = GatedStore::new(store, region.ready_poll_limit, region.page_size);
                self.drive(&config, LogAllocator::recover(gated, geometry)?)?
            }
            None => {
                let store = MemoryEeprom::new(region.capacity);
                let gated = GatedStore::new(store, region.ready_poll_limit, region.page_size);
                self.drive(&config, LogAllocator::recover(gated, geometry)?)?
            }
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }

    fn drive<S: NvStore>(&self, config: &AppConfig, log: LogAllocator<S>) -> Result<serde_json::Value> {
        let master = config.bus.master_address;
        let units: Vec<u16> = (1..=self.rooms).map(|n| 0x0100 + n).collect();
        let mut bus = SimulatedBus::new(master, config.addressing.group, config.addressing.broadcast);
        if self.loss > 0.0 {
            bus = bus.with_random_silence(self.seed, self.loss);
        }
        for (n, unit) in units.iter().enumerate() {
            bus.add_room(SimulatedRoom::new(*unit).with_card_events(self.logs, n as u8));
        }

        let table = AddressTable::new(units.clone(), config.addressing.group, config.addressing.broadcast)?;
        let ctx = ProtocolContext::new(
            ProtocolSettings::from_config(config),
            table,
            log,
            Box::new(SystemCalendar),
        );
        let clock = ManualClock::new();
        let mut ctl = MasterController::new(ctx, bus, clock.clone());
        if let Some(bytes) = self.firmware_bytes {
            let image = (0..bytes).map(|n| n as u8).collect();
            ctl.submit_transfer(
                TransferKind::Firmware,
                units[0],
                Box::new(MemorySource::new("simulated-firmware", image)),
            )?;
        }

        let step = (config.protocol.tick.as_millis() as u64).max(1);
        info!(rooms = units.len(), ticks = self.ticks, step_ms = step, "simulation started");
        for _ in 0..self.ticks {
            ctl.poll();
            clock.advance(step);
        }

        let ctx = ctl.context();
        let units_json: Vec<_> = ctx
            .units
            .iter()
            .map(|(addr, status)| {
                json!({
                    "unit": format!("{addr:#06x}"),
                    "reachable": status.reachable,
                    "consecutive_failures": status.consecutive_failures,
                    "last": status.last,
                })
            })
            .collect();
        let rooms: Vec<_> = ctl.bus().rooms().iter().map(SimulatedRoom::snapshot).collect();
        let images: usize = ctl.bus().rooms().iter().map(|room| room.images().len()).sum();
        Ok(json!({
            "ticks": ctl.ticks(),
            "simulated_ms": clock.now_ms(),
            "frames_sent": ctl.bus().sent().len(),
            "state": ctl.state(),
            "flags": ctl.flags().to_string(),
            "log_records": ctx.log.count(),
            "log_layout": ctx.log.layout().to_string(),
            "images_delivered": images,
            "units": units_json,
            "rooms": rooms,
        }))
    }
}
