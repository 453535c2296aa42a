//! ---
//! rl_section: "07-binaries"
//! rl_subsection: "binary"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Frame encode/decode subcommands."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use roomlink_common::parse_address;
use roomlink_core::{AdHocCommand, Destination};
use roomlink_msg::{decode, encode, FrameKind, Opcode};
use serde_json::json;

use crate::load_config;

#[derive(Debug, Subcommand)]
pub enum FrameCommand {
    /// Validate a command and print its wire frame as hex.
    Encode(EncodeArgs),
    /// Decode a hex frame and print its fields as JSON.
    Decode(DecodeArgs),
}

#[derive(Debug, Args)]
pub struct EncodeArgs {
    /// Opcode name, e.g. `set-room-status`.
    #[arg(long, value_parser = parse_opcode)]
    opcode: Opcode,

    /// Destination unit address (decimal or 0x-prefixed hex).
    #[arg(long, value_parser = parse_address, conflicts_with_all = ["group", "broadcast"])]
    dest: Option<u16>,

    /// Send to the configured group address.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    group: bool,

    /// Send to the configured broadcast address.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    broadcast: bool,

    /// Argument digits for the opcode.
    #[arg(long, default_value = "")]
    args: String,

    /// Configuration supplying the master, group and broadcast addresses.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DecodeArgs {
    /// Frame bytes as hex; whitespace is ignored.
    hex: String,
}

pub fn run(command: FrameCommand) -> Result<()> {
    match command {
        FrameCommand::Encode(args) => args.execute(),
        FrameCommand::Decode(args) => args.execute(),
    }
}

fn parse_opcode(raw: &str) -> Result<Opcode, String> {
    raw.parse::<Opcode>()
        .map_err(|_| format!("unknown opcode {raw:?}"))
}

impl EncodeArgs {
    fn execute(self) -> Result<()> {
        let config = load_config(self.config.as_deref())?;
        let destination = match (self.dest, self.group, self.broadcast) {
            (Some(addr), _, _) => Destination::Unit(addr),
            (None, true, _) => Destination::Group,
            (None, false, true) => Destination::Broadcast,
            (None, false, false) => bail!("one of --dest, --group or --broadcast is required"),
        };
        let command = AdHocCommand::parse(self.opcode, destination, &self.args)?;
        let dest = match destination {
            Destination::Unit(addr) => addr,
            Destination::Group => config.addressing.group,
            Destination::Broadcast => config.addressing.broadcast,
        };
        let frame = encode(FrameKind::Command, dest, config.bus.master_address, command.payload())?;
        println!("{}", hex::encode(frame.to_bytes()));
        Ok(())
    }
}

impl DecodeArgs {
    fn execute(self) -> Result<()> {
        let cleaned: String = self.hex.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = hex::decode(&cleaned).context("frame is not valid hex")?;
        let frame = decode(&bytes, None)?;
        let opcode = match frame.kind {
            FrameKind::Command => frame
                .opcode_byte()
                .and_then(Opcode::from_code)
                .map(|opcode| opcode.to_string()),
            FrameKind::Data => None,
        };
        let summary = json!({
            "kind": frame.kind,
            "dest": format!("{:#06x}", frame.dest),
            "src": format!("{:#06x}", frame.src),
            "length": frame.length(),
            "opcode": opcode,
            "payload": hex::encode(&frame.payload),
            "checksum": format!("{:#06x}", frame.checksum()),
            "trailing_bytes": bytes.len() - frame.encoded_len(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }
}
