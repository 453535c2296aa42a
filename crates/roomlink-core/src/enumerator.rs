//! ---
//! rl_section: "05-protocol-core"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Master orchestration of the room controller bus."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
//! Unit address table and the round-robin cursor over it.

use roomlink_common::AddressingConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{CoreError, Result};

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "addr")]
pub enum Destination {
    /// One unit; replies are expected.
    Unit(u16),
    /// The configured group address; no reply.
    Group,
    /// The broadcast address; no reply.
    Broadcast,
}

impl Destination {
    /// Wire address for this destination.
    pub fn addr(&self, table: &AddressTable) -> u16 {
        match self {
            Destination::Unit(addr) => *addr,
            Destination::Group => table.group,
            Destination::Broadcast => table.broadcast,
        }
    }

    /// Group and broadcast sends never wait for a reply.
    pub fn is_point_to_point(&self) -> bool {
        matches!(self, Destination::Unit(_))
    }
}

/// Ordered unit addresses plus the shared group and broadcast addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressTable {
    units: Vec<u16>,
    group: u16,
    broadcast: u16,
}

impl AddressTable {
    /// Build a table; the list must be non-empty and free of zero or reserved entries.
    pub fn new(units: Vec<u16>, group: u16, broadcast: u16) -> Result<Self> {
        if units.is_empty() {
            return Err(CoreError::Address("unit table is empty".into()));
        }
        let table = Self {
            units: Vec::with_capacity(units.len()),
            group,
            broadcast,
        };
        units.into_iter().try_fold(table, |mut table, unit| {
            table.check_assignable(unit)?;
            table.units.push(unit);
            Ok(table)
        })
    }

    /// Build from a zero-terminated list; entries after the first zero are ignored.
    pub fn from_zero_terminated(raw: &[u16], group: u16, broadcast: u16) -> Result<Self> {
        let units = raw.iter().copied().take_while(|unit| *unit != 0).collect();
        Self::new(units, group, broadcast)
    }

    pub fn from_config(config: &AddressingConfig) -> Result<Self> {
        Self::new(config.units.clone(), config.group, config.broadcast)
    }

    pub fn units(&self) -> &[u16] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    pub fn broadcast(&self) -> u16 {
        self.broadcast
    }

    pub fn contains(&self, addr: u16) -> bool {
        self.units.contains(&addr)
    }

    /// Zero, group and broadcast can never be a unit address.
    pub fn is_reserved(&self, addr: u16) -> bool {
        addr == 0 || addr == self.group || addr == self.broadcast
    }

    fn check_assignable(&self, addr: u16) -> Result<()> {
        if self.is_reserved(addr) {
            return Err(CoreError::Address(format!("{addr:#06x} is reserved")));
        }
        if self.contains(addr) {
            return Err(CoreError::Address(format!("{addr:#06x} listed twice")));
        }
        Ok(())
    }

    /// Provisioning: a unit moved to a new bus address.
    pub fn replace(&mut self, old: u16, new: u16) -> Result<()> {
        let Some(index) = self.units.iter().position(|unit| *unit == old) else {
            return Err(CoreError::Address(format!("{old:#06x} is not in the table")));
        };
        if old == new {
            return Ok(());
        }
        self.check_assignable(new)?;
        self.units[index] = new;
        info!(old = format!("{old:#06x}"), new = format!("{new:#06x}"), "unit address rewritten");
        Ok(())
    }
}

/// Round-robin cursor over an [`AddressTable`].
#[derive(Debug, Clone)]
pub struct AddressEnumerator {
    table: AddressTable,
    cursor: usize,
}

impl AddressEnumerator {
    pub fn new(table: AddressTable) -> Self {
        Self { table, cursor: 0 }
    }

    /// Address at the cursor; the cursor wraps to the first entry after the last one.
    pub fn next_unit(&mut self) -> u16 {
        if self.cursor >= self.table.units.len() {
            self.cursor = 0;
        }
        let unit = self.table.units[self.cursor];
        self.cursor += 1;
        if self.cursor == self.table.units.len() {
            self.cursor = 0;
        }
        unit
    }

    pub fn group_addr(&self) -> u16 {
        self.table.group
    }

    pub fn broadcast_addr(&self) -> u16 {
        self.table.broadcast
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn table(&self) -> &AddressTable {
        &self.table
    }

    /// Rewrite one entry; the cursor keeps its position.
    pub fn replace(&mut self, old: u16, new: u16) -> Result<()> {
        self.table.replace(old, new)
    }
}
