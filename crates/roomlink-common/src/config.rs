//! ---
//! rl_section: "01-core-functionality"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Shared primitives and utilities for the bus controller."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Bytes per stored log record.
const RECORD_SIZE: usize = roomlink_msg::RECORD_SIZE;
/// Largest transfer chunk a data frame can carry.
const MAX_CHUNK_SIZE: usize = roomlink_msg::MAX_PAYLOAD - 2;
/// Records that fit one log list reply frame.
const MAX_LOG_PAGE_RECORDS: u8 = 15;

fn default_port() -> String {
    "/dev/ttyUSB0".to_owned()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_master_address() -> u16 {
    0x0001
}

fn default_response_timeout() -> Duration {
    Duration::from_millis(150)
}

fn default_byte_timeout() -> Duration {
    Duration::from_millis(20)
}

fn default_inter_frame_delay() -> Duration {
    Duration::from_millis(10)
}

fn default_bootloader_settle() -> Duration {
    Duration::from_millis(1500)
}

fn default_group_address() -> u16 {
    0xFFFE
}

fn default_broadcast_address() -> u16 {
    0xFFFF
}

fn default_attempt_ceiling() -> u32 {
    10
}

fn default_log_cadence() -> u32 {
    10
}

fn default_time_broadcast_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_tick() -> Duration {
    Duration::from_millis(2)
}

fn default_log_page_records() -> u8 {
    MAX_LOG_PAGE_RECORDS
}

fn default_log_image() -> PathBuf {
    PathBuf::from("target/roomlink/master-log.img")
}

fn default_capacity() -> usize {
    8192
}

fn default_region_size() -> usize {
    4096
}

fn default_page_size() -> usize {
    64
}

fn default_ready_poll_limit() -> u32 {
    1000
}

fn default_chunk_size() -> usize {
    64
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

/// Primary configuration object for the roomlink master.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub addressing: AddressingConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub log_region: LogRegionConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "ROOMLINK_CONFIG";

    /// Load configuration from disk, respecting the `ROOMLINK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Read and validate one file.
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.addressing.validate(self.bus.master_address)?;
        self.protocol.validate()?;
        self.log_region.validate()?;
        self.transfer.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Serial line and bus timing.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_master_address")]
    pub master_address: u16,
    #[serde(default = "default_response_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub response_timeout: Duration,
    #[serde(default = "default_byte_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub byte_timeout: Duration,
    #[serde(default = "default_inter_frame_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub inter_frame_delay: Duration,
    #[serde(default = "default_bootloader_settle")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub bootloader_settle: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            master_address: default_master_address(),
            response_timeout: default_response_timeout(),
            byte_timeout: default_byte_timeout(),
            inter_frame_delay: default_inter_frame_delay(),
            bootloader_settle: default_bootloader_settle(),
        }
    }
}

/// Unit address table plus the shared group and broadcast addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressingConfig {
    #[serde(default)]
    pub units: Vec<u16>,
    #[serde(default = "default_group_address")]
    pub group: u16,
    #[serde(default = "default_broadcast_address")]
    pub broadcast: u16,
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            units: Vec::new(),
            group: default_group_address(),
            broadcast: default_broadcast_address(),
        }
    }
}

impl AddressingConfig {
    pub fn validate(&self, master: u16) -> Result<()> {
        if self.units.is_empty() {
            bail!("addressing.units must list at least one unit");
        }
        if self.group == self.broadcast {
            bail!("group and broadcast addresses must differ");
        }
        if master == 0 || master == self.group || master == self.broadcast {
            bail!("master address {master:#06x} collides with a reserved address");
        }
        let mut seen = HashSet::new();
        for unit in &self.units {
            if *unit == 0 {
                bail!("unit address 0 is reserved as the table terminator");
            }
            if *unit == self.group || *unit == self.broadcast || *unit == master {
                bail!("unit address {unit:#06x} collides with the group, broadcast or master address");
            }
            if !seen.insert(*unit) {
                bail!("unit address {unit:#06x} listed twice");
            }
        }
        Ok(())
    }
}

/// Orchestrator cadence and retry budgets.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_attempt_ceiling")]
    pub attempt_ceiling: u32,
    #[serde(default = "default_log_cadence")]
    pub log_cadence: u32,
    #[serde(default = "default_time_broadcast_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub time_broadcast_interval: Duration,
    #[serde(default = "default_tick")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub tick: Duration,
    #[serde(default = "default_log_page_records")]
    pub log_page_records: u8,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            attempt_ceiling: default_attempt_ceiling(),
            log_cadence: default_log_cadence(),
            time_broadcast_interval: default_time_broadcast_interval(),
            tick: default_tick(),
            log_page_records: default_log_page_records(),
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.attempt_ceiling == 0 {
            bail!("protocol.attempt_ceiling must be at least 1");
        }
        if self.log_cadence == 0 {
            bail!("protocol.log_cadence must be at least 1");
        }
        if self.tick.is_zero() {
            bail!("protocol.tick must be non-zero");
        }
        if self.log_page_records == 0 || self.log_page_records > MAX_LOG_PAGE_RECORDS {
            bail!("protocol.log_page_records must be within 1..={MAX_LOG_PAGE_RECORDS}");
        }
        Ok(())
    }
}

/// Placement of the master's log ring on its EEPROM image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRegionConfig {
    #[serde(default = "default_log_image")]
    pub image: PathBuf,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub region_start: usize,
    #[serde(default = "default_region_size")]
    pub region_size: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_ready_poll_limit")]
    pub ready_poll_limit: u32,
}

impl Default for LogRegionConfig {
    fn default() -> Self {
        Self {
            image: default_log_image(),
            capacity: default_capacity(),
            region_start: 0,
            region_size: default_region_size(),
            page_size: default_page_size(),
            ready_poll_limit: default_ready_poll_limit(),
        }
    }
}

impl LogRegionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.region_size == 0 || self.region_size % RECORD_SIZE != 0 {
            bail!(
                "log_region.region_size {} must be a positive multiple of {RECORD_SIZE}",
                self.region_size
            );
        }
        if self.region_start + self.region_size > self.capacity {
            bail!(
                "log region {}+{} exceeds device capacity {}",
                self.region_start,
                self.region_size,
                self.capacity
            );
        }
        if self.ready_poll_limit == 0 {
            bail!("log_region.ready_poll_limit must be at least 1");
        }
        Ok(())
    }
}

/// Chunked transfer tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_attempt_ceiling")]
    pub attempt_ceiling: u32,
    #[serde(default)]
    pub rearm_write_protect: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            attempt_ceiling: default_attempt_ceiling(),
            rearm_write_protect: false,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "transfer.chunk_size {} must be within 1..={MAX_CHUNK_SIZE}",
                self.chunk_size
            );
        }
        if self.attempt_ceiling == 0 {
            bail!("transfer.attempt_ceiling must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Parse a bus address written in decimal or with a `0x` prefix.
pub fn parse_address(raw: &str) -> std::result::Result<u16, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse::<u16>(),
    };
    parsed.map_err(|err| format!("invalid bus address {raw:?}: {err}"))
}
