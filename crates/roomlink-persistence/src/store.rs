//! ---
//! rl_section: "03-log-storage"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Non-volatile store abstraction and EEPROM backends."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Byte-addressed non-volatile storage.
//!
//! Devices expose a ready line and a write-enable gate. [`GatedStore`] owns the
//! bracketing discipline: every write cycle polls ready (bounded), enables writes,
//! programs, waits again and disables writes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Errors raised by store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The device never reported ready within the poll budget.
    #[error("device not ready after {polls} polls")]
    NotReady {
        /// Number of ready polls spent.
        polls: u32,
    },
    /// Access outside the device.
    #[error("access of {len} bytes at {addr:#06x} exceeds capacity {capacity}")]
    OutOfRange {
        /// Start address.
        addr: usize,
        /// Access length.
        len: usize,
        /// Device capacity.
        capacity: usize,
    },
    /// Program or erase attempted without write enable.
    #[error("write attempted while write-protected at {addr:#06x}")]
    WriteProtected {
        /// Address of the rejected write.
        addr: usize,
    },
    /// Backing file failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Raw device primitives.
pub trait NvStore: Send {
    /// Total bytes on the device.
    fn capacity(&self) -> usize;
    /// Sample the device-ready line once.
    fn is_ready(&mut self) -> StoreResult<bool>;
    /// Drive the write-enable gate.
    fn set_write_enable(&mut self, enabled: bool) -> StoreResult<()>;
    /// Read `buf.len()` bytes from `addr`.
    fn read(&mut self, addr: usize, buf: &mut [u8]) -> StoreResult<()>;
    /// Program bytes at `addr`; requires write enable.
    fn program(&mut self, addr: usize, data: &[u8]) -> StoreResult<()>;
    /// Zero `len` bytes at `addr` in one erase cycle; requires write enable.
    fn erase(&mut self, addr: usize, len: usize) -> StoreResult<()>;
}

fn check_range(addr: usize, len: usize, capacity: usize) -> StoreResult<()> {
    match addr.checked_add(len) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(StoreError::OutOfRange {
            addr,
            len,
            capacity,
        }),
    }
}

/// Store wrapper that enforces bounded ready polls and bracketed write cycles.
#[derive(Debug)]
pub struct GatedStore<S> {
    inner: S,
    ready_poll_limit: u32,
    page_size: usize,
}

impl<S: NvStore> GatedStore<S> {
    /// Wrap a device. `page_size` splits programs on page boundaries; zero disables splitting.
    pub fn new(inner: S, ready_poll_limit: u32, page_size: usize) -> Self {
        Self {
            inner,
            ready_poll_limit: ready_poll_limit.max(1),
            page_size,
        }
    }

    /// Device capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Borrow the wrapped device.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the wrapped device.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Release the wrapped device.
    pub fn into_inner(self) -> S {
        self.inner
    }

    fn wait_ready(&mut self) -> StoreResult<()> {
        for _ in 0..self.ready_poll_limit {
            if self.inner.is_ready()? {
                return Ok(());
            }
        }
        warn!(polls = self.ready_poll_limit, "store ready line stuck");
        Err(StoreError::NotReady {
            polls: self.ready_poll_limit,
        })
    }

    fn bracketed<F>(&mut self, op: F) -> StoreResult<()>
    where
        F: FnOnce(&mut S) -> StoreResult<()>,
    {
        self.wait_ready()?;
        self.inner.set_write_enable(true)?;
        let outcome = op(&mut self.inner);
        let settled = self.wait_ready();
        self.inner.set_write_enable(false)?;
        outcome.and(settled)
    }

    /// Ready-gated read.
    pub fn read(&mut self, addr: usize, buf: &mut [u8]) -> StoreResult<()> {
        check_range(addr, buf.len(), self.capacity())?;
        self.wait_ready()?;
        self.inner.read(addr, buf)
    }

    /// Write `data` at `addr`, one bracketed cycle per device page touched.
    pub fn write(&mut self, addr: usize, data: &[u8]) -> StoreResult<()> {
        check_range(addr, data.len(), self.capacity())?;
        let mut offset = 0;
        while offset < data.len() {
            let at = addr + offset;
            let room = if self.page_size == 0 {
                data.len() - offset
            } else {
                self.page_size - (at % self.page_size)
            };
            let take = room.min(data.len() - offset);
            let piece = &data[offset..offset + take];
            self.bracketed(|dev| dev.program(at, piece))?;
            offset += take;
        }
        Ok(())
    }

    /// Zero a range in a single bracketed erase cycle.
    pub fn erase(&mut self, addr: usize, len: usize) -> StoreResult<()> {
        check_range(addr, len, self.capacity())?;
        debug!(addr, len, "erasing store range");
        self.bracketed(|dev| dev.erase(addr, len))
    }
}

/// RAM-backed EEPROM used by tests and the simulator.
#[derive(Debug, Clone)]
pub struct MemoryEeprom {
    bytes: Vec<u8>,
    write_enabled: bool,
    busy_after_write: u32,
    busy_remaining: u32,
    stuck: bool,
    reads: usize,
    write_cycles: usize,
}

impl MemoryEeprom {
    /// Zero-filled device of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self::from_bytes(vec![0; capacity])
    }

    /// Device preloaded with an image.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            write_enabled: false,
            busy_after_write: 0,
            busy_remaining: 0,
            stuck: false,
            reads: 0,
            write_cycles: 0,
        }
    }

    /// Report busy for `polls` samples after each program or erase.
    pub fn with_write_latency(mut self, polls: u32) -> Self {
        self.busy_after_write = polls;
        self
    }

    /// Hold the ready line low forever.
    pub fn set_stuck(&mut self, stuck: bool) {
        self.stuck = stuck;
    }

    /// Device contents.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of read transactions served.
    pub fn read_count(&self) -> usize {
        self.reads
    }

    /// Number of program/erase cycles served.
    pub fn write_cycles(&self) -> usize {
        self.write_cycles
    }

    /// Whether the write-enable gate is currently open.
    pub fn write_enabled(&self) -> bool {
        self.write_enabled
    }

    fn finish_write(&mut self) {
        self.write_cycles += 1;
        self.busy_remaining = self.busy_after_write;
    }
}

impl NvStore for MemoryEeprom {
    fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn is_ready(&mut self) -> StoreResult<bool> {
        if self.stuck {
            return Ok(false);
        }
        if self.busy_remaining > 0 {
            self.busy_remaining -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn set_write_enable(&mut self, enabled: bool) -> StoreResult<()> {
        self.write_enabled = enabled;
        Ok(())
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> StoreResult<()> {
        check_range(addr, buf.len(), self.bytes.len())?;
        buf.copy_from_slice(&self.bytes[addr..addr + buf.len()]);
        self.reads += 1;
        Ok(())
    }

    fn program(&mut self, addr: usize, data: &[u8]) -> StoreResult<()> {
        if !self.write_enabled {
            return Err(StoreError::WriteProtected { addr });
        }
        check_range(addr, data.len(), self.bytes.len())?;
        self.bytes[addr..addr + data.len()].copy_from_slice(data);
        self.finish_write();
        Ok(())
    }

    fn erase(&mut self, addr: usize, len: usize) -> StoreResult<()> {
        if !self.write_enabled {
            return Err(StoreError::WriteProtected { addr });
        }
        check_range(addr, len, self.bytes.len())?;
        self.bytes[addr..addr + len].fill(0);
        self.finish_write();
        Ok(())
    }
}

/// EEPROM image kept in a fixed-size file.
#[derive(Debug)]
pub struct FileEeprom {
    path: PathBuf,
    file: File,
    capacity: usize,
    write_enabled: bool,
}

impl FileEeprom {
    /// Open or create an image of exactly `capacity` bytes; new space reads as zero.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let current = file.metadata()?.len() as usize;
        if current < capacity {
            file.set_len(capacity as u64)?;
        } else if current > capacity {
            warn!(path = %path.display(), current, capacity, "eeprom image larger than configured capacity");
        }
        Ok(Self {
            path,
            file,
            capacity,
            write_enabled: false,
        })
    }

    /// Image path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl NvStore for FileEeprom {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_ready(&mut self) -> StoreResult<bool> {
        Ok(true)
    }

    fn set_write_enable(&mut self, enabled: bool) -> StoreResult<()> {
        self.write_enabled = enabled;
        Ok(())
    }

    fn read(&mut self, addr: usize, buf: &mut [u8]) -> StoreResult<()> {
        check_range(addr, buf.len(), self.capacity)?;
        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn program(&mut self, addr: usize, data: &[u8]) -> StoreResult<()> {
        if !self.write_enabled {
            return Err(StoreError::WriteProtected { addr });
        }
        check_range(addr, data.len(), self.capacity)?;
        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.write_all(data)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn erase(&mut self, addr: usize, len: usize) -> StoreResult<()> {
        if !self.write_enabled {
            return Err(StoreError::WriteProtected { addr });
        }
        check_range(addr, len, self.capacity)?;
        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.write_all(&vec![0u8; len])?;
        self.file.sync_data()?;
        Ok(())
    }
}
