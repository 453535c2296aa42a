//! ---
//! rl_section: "07-binaries"
//! rl_subsection: "binary"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Control CLI for operators working with the roomlink bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use roomlink_common::config::AppConfig;
use roomlink_logging as logging;

mod frame;
mod log;
mod simulate;
mod transfer;

#[derive(Debug, Parser)]
#[command(author, version, about = "roomlink operator utility", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(subcommand, about = "Encode and decode bus frames")]
    Frame(frame::FrameCommand),
    #[command(subcommand, about = "Inspect and maintain a master log image")]
    Log(log::LogCommand),
    #[command(subcommand, about = "Plan chunked transfers")]
    Transfer(transfer::TransferCommand),
    #[command(about = "Run the master against simulated rooms and print a summary")]
    Simulate(simulate::SimulateArgs),
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Frame(cmd) => frame::run(cmd)?,
        Commands::Log(cmd) => log::run(cmd)?,
        Commands::Transfer(cmd) => transfer::run(cmd)?,
        Commands::Simulate(args) => args.execute()?,
    }
    Ok(())
}

/// Explicit file, then the usual locations, then built-in defaults.
pub(crate) fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        return AppConfig::from_path(path);
    }
    let candidates = [
        PathBuf::from("configs/roomlink.toml"),
        PathBuf::from("configs/roomlink.example.toml"),
    ];
    let env_override = std::env::var_os(AppConfig::ENV_CONFIG_PATH).is_some();
    if env_override || candidates.iter().any(|path| path.exists()) {
        AppConfig::load(&candidates)
    } else {
        Ok(AppConfig::default())
    }
}
