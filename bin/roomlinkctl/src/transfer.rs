//! ---
//! rl_section: "07-binaries"
//! rl_subsection: "binary"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Transfer planning subcommands."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};
use roomlink_common::parse_address;
use roomlink_core::ProtocolSettings;
use roomlink_transfer::{AssetSource, FileSource, TransferKind, TransferSession};
use serde_json::json;

use crate::load_config;

#[derive(Debug, Subcommand)]
pub enum TransferCommand {
    /// Show how a file would be split into chunks for a unit.
    Plan(PlanArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Firmware,
    Bootloader,
    Asset,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Image to deliver.
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// What the image is.
    #[arg(long, value_enum, default_value = "asset")]
    kind: KindArg,

    /// Asset slot; only meaningful for `--kind asset`.
    #[arg(long, default_value_t = 0)]
    slot: u8,

    /// Destination unit address.
    #[arg(long, value_parser = parse_address, default_value = "0x0101")]
    unit: u16,

    /// Chunk size overriding `transfer.chunk_size`.
    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

pub fn run(command: TransferCommand) -> Result<()> {
    match command {
        TransferCommand::Plan(args) => args.execute(),
    }
}

impl PlanArgs {
    fn execute(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let mut settings = ProtocolSettings::from_config(&config).transfer;
        if let Some(chunk_size) = self.chunk_size {
            settings.chunk_size = chunk_size;
        }
        let kind = match self.kind {
            KindArg::Firmware => TransferKind::Firmware,
            KindArg::Bootloader => TransferKind::Bootloader,
            KindArg::Asset => TransferKind::Asset { slot: self.slot },
        };
        let source = FileSource::open(&self.file)?;
        let session = TransferSession::new(kind, self.unit, source.total_size(), &settings)?;
        let last_chunk = match session.total_bytes % session.chunk_size {
            0 if session.total_bytes > 0 => session.chunk_size,
            rem => rem,
        };
        let plan = json!({
            "source": source.label(),
            "kind": kind.label(),
            "unit": format!("{:#06x}", self.unit),
            "total_bytes": session.total_bytes,
            "chunk_size": session.chunk_size,
            "total_chunks": session.total_chunks,
            "last_chunk_bytes": last_chunk,
            "header_payload": hex::encode(session.header_payload()),
            "arms_bootloader": kind.arms_bootloader(),
            "attempts_per_frame": session.attempt_ceiling,
        });
        println!("{}", serde_json::to_string_pretty(&plan)?);
        Ok(())
    }
}
