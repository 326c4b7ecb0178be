// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! PCI collaborator interfaces consumed by the host bridge.
//!
//! Generic config-space emulation lives outside this crate. The bridge only needs to read and
//! write config registers, program MSI/MSI-X messages and enumerate BARs, which is what
//! [`PciFunction`] exposes.

use std::collections::BTreeMap;
use std::fmt::Debug;

/// Number of buses addressable through a packed config address.
pub const PCI_BUS_MAX: usize = 0xff;
/// Number of device slots on one bus.
pub const PCI_SLOT_MAX: u8 = 32;
/// Number of functions in one slot.
pub const PCI_FUNC_MAX: u8 = 8;

/// Size of conventional PCI config space.
pub const PCI_CONFIG_SPACE_SIZE: u16 = 0x100;
/// Size of PCIe extended config space.
pub const PCIE_CONFIG_SPACE_SIZE: u16 = 0x1000;

pub const PCI_VENDOR_ID: u16 = 0x00;
pub const PCI_DEVICE_ID: u16 = 0x02;
pub const PCI_STATUS: u16 = 0x06;
pub const PCI_REVISION_ID: u16 = 0x08;
pub const PCI_CLASS_PROG: u16 = 0x09;
pub const PCI_CLASS_DEVICE: u16 = 0x0a;
pub const PCI_CACHE_LINE_SIZE: u16 = 0x0c;
pub const PCI_HEADER_TYPE: u16 = 0x0e;
pub const PCI_SUBSYSTEM_VENDOR_ID: u16 = 0x2c;
pub const PCI_SUBSYSTEM_ID: u16 = 0x2e;
pub const PCI_INTERRUPT_PIN: u16 = 0x3d;
pub const PCI_MIN_GNT: u16 = 0x3e;
pub const PCI_MAX_LAT: u16 = 0x3f;

pub const PCI_HEADER_TYPE_NORMAL: u8 = 0;
pub const PCI_HEADER_TYPE_MULTI_FUNCTION: u8 = 0x80;

pub const PCI_STATUS_66MHZ: u32 = 0x20;
pub const PCI_STATUS_UDF: u32 = 0x40;
pub const PCI_STATUS_FAST_BACK: u32 = 0x80;
pub const PCI_STATUS_DEVSEL_MASK: u32 = 0x600;

/// Offset of the Message Control word inside an MSI-X capability.
pub const PCI_MSIX_FLAGS: u16 = 2;
/// MSI-X enable bit in Message Control.
pub const PCI_MSIX_FLAGS_ENABLE: u32 = 0x8000;

/// Builds a devfn from slot and function numbers.
pub const fn devfn(slot: u8, func: u8) -> u8 {
    (slot << 3) | (func & 0x7)
}

/// Slot part of a devfn.
pub const fn devfn_slot(devfn: u8) -> u8 {
    devfn >> 3
}

/// Function part of a devfn.
pub const fn devfn_func(devfn: u8) -> u8 {
    devfn & 0x7
}

/// Packed config address as passed by the guest in RTAS arguments.
///
/// Layout: `ext_reg[31:28] | bus[23:16] | devfn[15:8] | reg[7:0]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigAddress(pub u32);

impl ConfigAddress {
    /// Bus number.
    pub fn bus(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    /// Device/function number.
    pub fn devfn(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    /// Register offset, with the extended register bits folded into bits 8..11.
    pub fn register(self) -> u16 {
        (((self.0 >> 20) & 0xf00) | (self.0 & 0xff)) as u16
    }

    /// The address with register bits cleared. MSI bookkeeping is keyed on this.
    pub fn device_key(self) -> u32 {
        self.0 & 0x00ff_ff00
    }
}

/// Kind of a BAR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PciBarRegionType {
    /// I/O port space.
    Io,
    /// 32-bit memory space.
    Memory32,
    /// 64-bit memory space.
    Memory64,
}

/// A programmed BAR of a PCI function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PciBar {
    /// BAR slot (0..=5), or 6 for the expansion ROM.
    pub index: u8,
    /// Region kind.
    pub region_type: PciBarRegionType,
    /// Bus address the BAR is currently programmed at.
    pub addr: u64,
    /// Region size in bytes.
    pub size: u64,
}

impl PciBar {
    /// Config space offset of the BAR register.
    pub fn config_offset(&self) -> u32 {
        match self.index {
            6 => 0x30,
            index => 0x10 + 4 * u32::from(index),
        }
    }
}

/// An MSI/MSI-X message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MsiMessage {
    /// Message address.
    pub address: u64,
    /// Message data.
    pub data: u32,
}

/// One PCI function as seen by the host bridge.
pub trait PciFunction: Debug + Send {
    /// Reads `len` (1, 2 or 4) bytes of config space at `offset`.
    fn read_config(&self, offset: u16, len: u8) -> u32;
    /// Writes `len` (1, 2 or 4) bytes of config space at `offset`.
    fn write_config(&mut self, offset: u16, len: u8, value: u32);
    /// Size of the config space the function implements.
    fn config_size(&self) -> u16 {
        PCI_CONFIG_SPACE_SIZE
    }

    /// Vectors supported by the MSI capability, 0 when absent.
    fn msi_max_vectors(&self) -> u32;
    /// Vectors currently enabled through the MSI capability.
    fn msi_allocated_vectors(&self) -> u32;
    /// Programs the MSI message.
    fn msi_set_message(&mut self, msg: MsiMessage);
    /// Current MSI message.
    fn msi_message(&self) -> MsiMessage;

    /// Entries of the MSI-X table, 0 when absent.
    fn msix_entries(&self) -> u32;
    /// Programs one MSI-X table entry.
    fn msix_set_message(&mut self, entry: u32, msg: MsiMessage);
    /// Current message of one MSI-X table entry.
    fn msix_message(&self, entry: u32) -> MsiMessage;
    /// Config offset of the MSI-X capability, if present.
    fn msix_cap_offset(&self) -> Option<u16> {
        None
    }
    /// Clears the MSI-X table and pending bits.
    fn msix_reset(&mut self) {}

    /// Currently programmed BARs.
    fn bars(&self) -> Vec<PciBar>;
    /// Device level reset.
    fn reset(&mut self);
    /// Whether the function is a host device passed through VFIO.
    fn is_vfio(&self) -> bool {
        false
    }
}

/// Errors from bus membership changes.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum PciBusError {
    /// Device/function {0:#x} is already occupied
    DevfnInUse(u8),
    /// Slot {0} is out of range
    InvalidSlot(u8),
}

/// The root bus of one host bridge.
#[derive(Debug, Default)]
pub struct PciBus {
    number: u8,
    devices: BTreeMap<u8, Box<dyn PciFunction>>,
}

impl PciBus {
    /// Creates an empty bus with the given number.
    pub fn new(number: u8) -> Self {
        PciBus {
            number,
            devices: BTreeMap::new(),
        }
    }

    /// Bus number.
    pub fn number(&self) -> u8 {
        self.number
    }

    /// Plugs a function at `devfn`.
    pub fn attach(&mut self, devfn: u8, device: Box<dyn PciFunction>) -> Result<(), PciBusError> {
        if devfn_slot(devfn) >= PCI_SLOT_MAX {
            return Err(PciBusError::InvalidSlot(devfn_slot(devfn)));
        }
        if self.devices.contains_key(&devfn) {
            return Err(PciBusError::DevfnInUse(devfn));
        }
        self.devices.insert(devfn, device);
        Ok(())
    }

    /// Unplugs the function at `devfn`.
    pub fn detach(&mut self, devfn: u8) -> Option<Box<dyn PciFunction>> {
        self.devices.remove(&devfn)
    }

    /// Function at `(bus, devfn)`. Only the root bus is populated.
    pub fn find(&self, bus: u8, devfn: u8) -> Option<&dyn PciFunction> {
        if bus != self.number {
            return None;
        }
        self.devices.get(&devfn).map(|dev| dev.as_ref())
    }

    /// Mutable variant of [`PciBus::find`].
    pub fn find_mut(&mut self, bus: u8, devfn: u8) -> Option<&mut (dyn PciFunction + 'static)> {
        if bus != self.number {
            return None;
        }
        self.devices.get_mut(&devfn).map(|dev| dev.as_mut())
    }

    /// Iterates over `(devfn, function)` pairs in devfn order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &dyn PciFunction)> {
        self.devices.iter().map(|(devfn, dev)| (*devfn, dev.as_ref()))
    }

    /// Mutable variant of [`PciBus::iter`].
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u8, &mut Box<dyn PciFunction>)> {
        self.devices.iter_mut().map(|(devfn, dev)| (*devfn, dev))
    }

    /// Resets every function on the bus.
    pub fn reset(&mut self) {
        self.devices.values_mut().for_each(|dev| dev.reset());
    }
}
