// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! PCI hot-plug handshake.
//!
//! Plugging a function stages a device tree fragment on its slot connector, which the guest
//! pulls through ibm,configure-connector. Unplugging waits for the guest to isolate the slot
//! unless it already is.

use vm_memory::{Bytes, GuestAddress};

use crate::drc::{CC_WORK_AREA_SIZE, CcResponse, ConnectorState, DrcField, ENTITY_SENSE_PRESENT};
use crate::dt::DtNode;
use crate::machine::{PlatformEvent, SpaprMachine};
use crate::pci::{
    ConfigAddress, PCI_CACHE_LINE_SIZE, PCI_CLASS_DEVICE, PCI_DEVICE_ID, PCI_HEADER_TYPE,
    PCI_HEADER_TYPE_MULTI_FUNCTION, PCI_HEADER_TYPE_NORMAL, PCI_INTERRUPT_PIN, PCI_MAX_LAT,
    PCI_MIN_GNT, PCI_REVISION_ID, PCI_SLOT_MAX, PCI_STATUS, PCI_STATUS_66MHZ,
    PCI_STATUS_DEVSEL_MASK, PCI_STATUS_FAST_BACK, PCI_STATUS_UDF, PCI_SUBSYSTEM_ID,
    PCI_SUBSYSTEM_VENDOR_ID, PCI_VENDOR_ID, PciBarRegionType, PciBusError, PciFunction,
    devfn_slot,
};
use crate::rtas::{RtasCall, RtasStatus};

// phys.hi flags of OF PCI addresses.
const OF_RELOCATABLE_NOT: u32 = 0x8000_0000;
const OF_SS_IO: u32 = 0x0100_0000;
const OF_SS_MEM32: u32 = 0x0200_0000;
const OF_SS_MEM64: u32 = 0x0300_0000;

/// Hot-plug request errors.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum HotplugError {
    /// No PCI host bridge with BUID {0:#x}
    UnknownBuid(u64),
    /// PCI host bridge {0:#x} has no hot-plug connectors
    NoConnectors(u64),
    /// Slot {0} is out of range
    InvalidSlot(u8),
    /// Slot {0} is already populated
    SlotOccupied(u8),
    /// Slot {0} holds no device
    SlotEmpty(u8),
    /// Cannot attach the device: {0}
    Bus(#[from] PciBusError),
}

/// Direction of a hot-plug event delivered to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HotplugAction {
    Add,
    Remove,
}

/// Outcome of an unplug request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnplugStatus {
    /// The function is gone.
    Removed,
    /// The guest still has to isolate the slot.
    Pending,
}

fn split(value: u64) -> [u32; 2] {
    [(value >> 32) as u32, value as u32]
}

// `reg` and `assigned-addresses` rows for the config space and the populated BARs.
fn address_props(dev: &dyn PciFunction, bus: u8, devfn: u8) -> (Vec<u32>, Vec<u32>) {
    let dev_id = (u32::from(bus) << 8) | u32::from(devfn);
    let mut reg = vec![dev_id << 8, 0, 0, 0, 0];
    let mut assigned = Vec::new();

    for bar in dev.bars().iter().filter(|bar| bar.size != 0) {
        let space = match bar.region_type {
            PciBarRegionType::Io => OF_SS_IO,
            PciBarRegionType::Memory32 => OF_SS_MEM32,
            PciBarRegionType::Memory64 => OF_SS_MEM64,
        };
        let phys_hi = (dev_id << 8) | (bar.config_offset() & 0xff) | space;
        let [size_hi, size_lo] = split(bar.size);
        let [addr_hi, addr_lo] = split(bar.addr);
        reg.extend([phys_hi, 0, 0, size_hi, size_lo]);
        assigned.extend([phys_hi | OF_RELOCATABLE_NOT, addr_hi, addr_lo, size_hi, size_lo]);
    }
    (reg, assigned)
}

/// Builds the fragment describing the function at `devfn`.
pub fn build_child_node(
    dev: &dyn PciFunction,
    bus: u8,
    devfn: u8,
    phb_index: u32,
    drc_index: u32,
) -> DtNode {
    let slot = devfn_slot(devfn);
    let mut node = DtNode::new(format!("pci@{slot}"));

    node.property_u32("vendor-id", dev.read_config(PCI_VENDOR_ID, 2));
    node.property_u32("device-id", dev.read_config(PCI_DEVICE_ID, 2));
    node.property_u32("revision-id", dev.read_config(PCI_REVISION_ID, 1));
    node.property_u32("class-code", dev.read_config(PCI_CLASS_DEVICE, 2) << 8);
    node.property_u32("interrupts", dev.read_config(PCI_INTERRUPT_PIN, 1));

    let header_type = dev.read_config(PCI_HEADER_TYPE, 1) as u8;
    // Bridges do not have these registers.
    if header_type & !PCI_HEADER_TYPE_MULTI_FUNCTION == PCI_HEADER_TYPE_NORMAL {
        node.property_u32("min-grant", dev.read_config(PCI_MIN_GNT, 1));
        node.property_u32("max-latency", dev.read_config(PCI_MAX_LAT, 1));
        node.property_u32("subsystem-id", dev.read_config(PCI_SUBSYSTEM_ID, 2));
        node.property_u32(
            "subsystem-vendor-id",
            dev.read_config(PCI_SUBSYSTEM_VENDOR_ID, 2),
        );
    }
    node.property_u32("cache-line-size", dev.read_config(PCI_CACHE_LINE_SIZE, 1));

    let status = dev.read_config(PCI_STATUS, 2);
    node.property_u32("devsel-speed", status & PCI_STATUS_DEVSEL_MASK);
    node.property_u32("fast-back-to-back", status & PCI_STATUS_FAST_BACK);
    node.property_u32("66mhz-capable", status & PCI_STATUS_66MHZ);
    node.property_u32("udf-supported", status & PCI_STATUS_UDF);

    node.property_string("name", "pci");
    node.property_string(
        "ibm,loc-code",
        &format!(
            "Slot {}",
            u32::from(slot) + phb_index * u32::from(PCI_SLOT_MAX)
        ),
    );
    node.property_u32("ibm,my-drc-index", drc_index);
    node.property_u32("#address-cells", 3);
    node.property_u32("#size-cells", 2);
    node.property_u32("ibm,req#msi-x", dev.msix_entries());

    let (reg, assigned) = address_props(dev, bus, devfn);
    node.property_array_u32("reg", &reg);
    node.property_array_u32("assigned-addresses", &assigned);
    node
}

/// Plugs `dev` at `devfn` behind the bridge `buid` and returns the slot connector index.
///
/// Functions present at boot (`hotplugged == false`) start unisolated, the way firmware hands
/// them to the guest. Hot-plugged ones stay isolated until the guest configures them and are
/// announced through a [`PlatformEvent::Hotplug`].
pub fn add_device(
    machine: &mut SpaprMachine,
    buid: u64,
    devfn: u8,
    dev: Box<dyn PciFunction>,
    hotplugged: bool,
) -> Result<u32, HotplugError> {
    let phb = machine
        .phbs_mut()
        .find_by_buid_mut(buid)
        .ok_or(HotplugError::UnknownBuid(buid))?;
    let slot = devfn_slot(devfn);
    let phb_index = phb.index().ok_or(HotplugError::NoConnectors(buid))?;
    let bus = phb.bus.number();

    let entry = phb
        .drc
        .slots
        .get(usize::from(slot))
        .ok_or(HotplugError::InvalidSlot(slot))?;
    if entry.cc.state != ConnectorState::Idle {
        return Err(HotplugError::SlotOccupied(slot));
    }
    let drc_index = entry.index;

    let fragment = build_child_node(dev.as_ref(), bus, devfn, phb_index, drc_index);
    phb.bus.attach(devfn, dev)?;

    if let Some(phb_entry) = phb.drc.phb.as_mut() {
        phb_entry.state.set(DrcField::EntitySense, ENTITY_SENSE_PRESENT);
    }
    let entry = phb
        .drc
        .slots
        .get_mut(usize::from(slot))
        .ok_or(HotplugError::InvalidSlot(slot))?;
    entry.state.set(DrcField::EntitySense, ENTITY_SENSE_PRESENT);
    if !hotplugged {
        entry.state.set(DrcField::Isolation, 1);
    }
    entry.cc.stage(fragment, devfn);

    log::info!("pci: plugged {devfn:#x} into PHB {buid:#x}, connector {drc_index:#x}");
    if hotplugged {
        machine.push_event(PlatformEvent::Hotplug {
            action: HotplugAction::Add,
            drc_index,
        });
    }
    Ok(drc_index)
}

/// Requests removal of the function in `slot` behind the bridge `buid`.
///
/// An isolated slot is emptied right away. Otherwise the removal completes when the guest
/// isolates the slot through set-indicator.
pub fn remove_device(
    machine: &mut SpaprMachine,
    buid: u64,
    slot: u8,
) -> Result<UnplugStatus, HotplugError> {
    let phb = machine
        .phbs_mut()
        .find_by_buid_mut(buid)
        .ok_or(HotplugError::UnknownBuid(buid))?;
    if phb.drc.is_empty() {
        return Err(HotplugError::NoConnectors(buid));
    }
    let entry = phb
        .drc
        .slots
        .get_mut(usize::from(slot))
        .ok_or(HotplugError::InvalidSlot(slot))?;
    if entry.cc.state == ConnectorState::Idle {
        return Err(HotplugError::SlotEmpty(slot));
    }
    let drc_index = entry.index;

    let status = if entry.awaiting_release {
        log::debug!("pci: connector {drc_index:#x} is already awaiting release");
        UnplugStatus::Pending
    } else if entry.is_releasable() {
        UnplugStatus::Removed
    } else {
        entry.awaiting_release = true;
        UnplugStatus::Pending
    };

    machine.push_event(PlatformEvent::Hotplug {
        action: HotplugAction::Remove,
        drc_index,
    });
    if status == UnplugStatus::Removed {
        complete_unplug(machine, buid, slot);
    }
    Ok(status)
}

/// Empties `slot`: drops the staged fragment, frees the MSI block and detaches the function.
pub(crate) fn complete_unplug(machine: &mut SpaprMachine, buid: u64, slot: u8) {
    let Some((phb, irq)) = machine.phb_and_irq_mut(buid) else {
        return;
    };
    let Some(entry) = phb.drc.slots.get_mut(usize::from(slot)) else {
        return;
    };
    let Some(devfn) = entry.release() else {
        log::warn!("pci: connector {:#x} has no function to release", entry.index);
        return;
    };

    let addr = ConfigAddress((u32::from(phb.bus.number()) << 16) | (u32::from(devfn) << 8));
    phb.msi.release(addr, irq);
    if let Some(mut dev) = phb.bus.detach(devfn) {
        dev.reset();
    }
    log::info!("pci: unplugged {devfn:#x} from PHB {buid:#x}");
}

// ibm,configure-connector
pub(crate) fn rtas_ibm_configure_connector(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(2, 1)?;
    let wa_addr = GuestAddress((u64::from(call.arg(1)) << 32) | u64::from(call.arg(0)));

    let mut wa = vec![0u8; CC_WORK_AREA_SIZE];
    if machine.guest_memory().read_slice(&mut wa, wa_addr).is_err() {
        call.set_ret(0, CcResponse::Error as i32 as u32);
        return Ok(());
    }
    let drc_index = u32::from_be_bytes([wa[0], wa[1], wa[2], wa[3]]);

    let response = match machine.find_drc_mut(drc_index) {
        Some((phb, location)) => match phb.drc.entry_mut(location) {
            Some(entry) => entry.cc.step(&mut wa),
            None => CcResponse::Error,
        },
        None => {
            log::debug!("drc: configure-connector on unknown connector {drc_index:#x}");
            CcResponse::Error
        }
    };

    if response != CcResponse::Error && machine.guest_memory().write_slice(&wa, wa_addr).is_err()
    {
        call.set_ret(0, CcResponse::Error as i32 as u32);
        return Ok(());
    }
    call.set_ret(0, response as i32 as u32);
    Ok(())
}
