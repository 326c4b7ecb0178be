// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! MSI and MSI-X vector allocation through ibm,change-msi.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::SPAPR_PCI_MSI_WINDOW;
use crate::irq::IrqController;
use crate::machine::SpaprMachine;
use crate::pci::{
    ConfigAddress, MsiMessage, PCI_BUS_MAX, PCI_FUNC_MAX, PCI_SLOT_MAX, PciBus, PciFunction, devfn,
};
use crate::phb::SpaprPhb;
use crate::rtas::{RtasCall, RtasStatus};

// ibm,change-msi function codes, as used by the Linux pseries code.
const RTAS_CHANGE_FN: u32 = 1;
const RTAS_CHANGE_MSI_FN: u32 = 3;
const RTAS_CHANGE_MSIX_FN: u32 = 4;

/// Size of each legacy bitmap: one byte per `(bus, slot)`.
pub const MSI_V1_BITMAP_SIZE: usize = PCI_BUS_MAX * PCI_SLOT_MAX as usize;

/// Interrupt type requested by the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsiKind {
    Msi,
    Msix,
}

impl MsiKind {
    fn from_function(func: u32) -> Option<MsiKind> {
        match func {
            RTAS_CHANGE_FN | RTAS_CHANGE_MSI_FN => Some(MsiKind::Msi),
            RTAS_CHANGE_MSIX_FN => Some(MsiKind::Msix),
            _ => None,
        }
    }

    /// Type code returned in `rets[3]`.
    pub fn rtas_type(self) -> u32 {
        match self {
            MsiKind::Msi => 1,
            MsiKind::Msix => 2,
        }
    }

    fn max_vectors(self, dev: &dyn PciFunction) -> u32 {
        match self {
            MsiKind::Msi => dev.msi_max_vectors(),
            MsiKind::Msix => dev.msix_entries(),
        }
    }
}

/// Interrupt block assigned to one function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsiAllocation {
    pub first_irq: u32,
    pub num: u32,
}

/// Per-slot MSI/MSI-X enable bitmaps of the first migration format.
///
/// Byte `bus << 5 | slot` holds one bit per function.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsiBitmaps {
    pub msi: Vec<u8>,
    pub msix: Vec<u8>,
}

/// Interrupt blocks of the functions behind one bridge, keyed by `(bus, devfn)`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MsiTable {
    devs: BTreeMap<u32, MsiAllocation>,
    legacy: Option<MsiBitmaps>,
}

impl MsiTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: ConfigAddress) -> Option<MsiAllocation> {
        self.devs.get(&addr.device_key()).copied()
    }

    /// Records a block, returning the one it replaces.
    pub fn insert(&mut self, addr: ConfigAddress, alloc: MsiAllocation) -> Option<MsiAllocation> {
        self.devs.insert(addr.device_key(), alloc)
    }

    pub fn remove(&mut self, addr: ConfigAddress) -> Option<MsiAllocation> {
        self.devs.remove(&addr.device_key())
    }

    /// `(device key, block)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, MsiAllocation)> + '_ {
        self.devs.iter().map(|(key, alloc)| (*key, *alloc))
    }

    pub fn len(&self) -> usize {
        self.devs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devs.is_empty()
    }

    /// Keeps legacy bitmaps until the functions can be inspected.
    pub fn set_legacy(&mut self, bitmaps: MsiBitmaps) {
        self.legacy = Some(bitmaps);
    }

    pub fn has_legacy(&self) -> bool {
        self.legacy.is_some()
    }

    /// Legacy bitmaps not folded yet.
    pub fn legacy(&self) -> Option<&MsiBitmaps> {
        self.legacy.as_ref()
    }

    /// Turns pending legacy bitmaps into table entries.
    ///
    /// The first vector and count are read back from the functions, which carry the messages
    /// programmed before migration. The blocks are claimed on `irq` again.
    pub fn fold_legacy(&mut self, bus: &PciBus, irq: &mut dyn IrqController) {
        let Some(legacy) = self.legacy.take() else {
            return;
        };
        for (offs, (msi, msix)) in legacy.msi.iter().zip(&legacy.msix).enumerate() {
            for func in 0..PCI_FUNC_MAX {
                let bit = 1u8 << func;
                let (msi, msix) = (msi & bit != 0, msix & bit != 0);
                if !msi && !msix {
                    continue;
                }
                let bus_num = (offs / usize::from(PCI_SLOT_MAX)) as u8;
                let devfn = devfn((offs % usize::from(PCI_SLOT_MAX)) as u8, func);
                let addr = ConfigAddress((u32::from(bus_num) << 16) | (u32::from(devfn) << 8));
                let Some(dev) = bus.find(bus_num, devfn) else {
                    log::error!("pci: MSI enabled for missing function {bus_num}:{devfn:#x}");
                    continue;
                };
                if msi && msix {
                    log::warn!("pci: both MSI and MSI-X set for {bus_num}:{devfn:#x}, using MSI-X");
                }
                let (num, first_irq) = if msix {
                    (dev.msix_entries(), dev.msix_message(0).data)
                } else {
                    (dev.msi_allocated_vectors(), dev.msi_message().data)
                };
                if num == 0 || first_irq == 0 {
                    continue;
                }
                if let Err(err) = irq.alloc_block(first_irq, num, false, !msix) {
                    log::warn!("pci: cannot claim MSI block {first_irq:#x}+{num}: {err}");
                }
                self.devs.insert(addr.device_key(), MsiAllocation { first_irq, num });
            }
        }
    }

    /// Drops the block of `addr` and gives it back to `irq`.
    pub fn release(
        &mut self,
        addr: ConfigAddress,
        irq: &mut dyn IrqController,
    ) -> Option<MsiAllocation> {
        let alloc = self.remove(addr)?;
        if let Err(err) = irq.free_block(alloc.first_irq, alloc.num) {
            log::warn!("pci: cannot free MSI block {:#x}: {err}", alloc.first_irq);
        }
        Some(alloc)
    }

    /// Releases every block.
    pub fn clear(&mut self, irq: &mut dyn IrqController) {
        let keys: Vec<u32> = self.devs.keys().copied().collect();
        for key in keys {
            self.release(ConfigAddress(key), irq);
        }
        self.legacy = None;
    }
}

fn clear_messages(dev: &mut dyn PciFunction, num: u32) {
    if dev.msi_max_vectors() > 0 {
        dev.msi_set_message(MsiMessage::default());
    }
    for entry in 0..num.min(dev.msix_entries()) {
        dev.msix_set_message(entry, MsiMessage::default());
    }
}

fn program_messages(dev: &mut dyn PciFunction, kind: MsiKind, first_irq: u32, num: u32) {
    match kind {
        MsiKind::Msi => dev.msi_set_message(MsiMessage {
            address: SPAPR_PCI_MSI_WINDOW,
            data: first_irq,
        }),
        // All entries share one address so the writes can be coalesced.
        MsiKind::Msix => {
            for entry in 0..num {
                dev.msix_set_message(
                    entry,
                    MsiMessage {
                        address: SPAPR_PCI_MSI_WINDOW,
                        data: first_irq + entry,
                    },
                );
            }
        }
    }
}

fn lookup<'a>(
    machine: &'a mut SpaprMachine,
    buid: u64,
    addr: ConfigAddress,
) -> Result<(&'a mut SpaprPhb, &'a mut dyn IrqController), RtasStatus> {
    let (phb, irq) = machine
        .phb_and_irq_mut(buid)
        .ok_or(RtasStatus::ParamError)?;
    if phb.bus.find(addr.bus(), addr.devfn()).is_none() {
        return Err(RtasStatus::ParamError);
    }
    phb.msi.fold_legacy(&phb.bus, irq);
    Ok((phb, irq))
}

// ibm,change-msi
pub(crate) fn rtas_ibm_change_msi(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(6, 4)?;
    let addr = ConfigAddress(call.arg(0));
    let buid = call.arg64(1);
    let func = call.arg(3);
    let req_num = call.arg(4);
    let seq_num = call.arg(5);

    let kind = MsiKind::from_function(func).ok_or_else(|| {
        log::debug!("pci: ibm,change-msi function {func} not implemented");
        RtasStatus::ParamError
    })?;
    let (phb, irq) = lookup(machine, buid, addr)?;
    let dev = phb
        .bus
        .find_mut(addr.bus(), addr.devfn())
        .ok_or(RtasStatus::ParamError)?;

    if req_num == 0 {
        let alloc = phb.msi.get(addr).ok_or_else(|| {
            log::debug!("pci: releasing MSIs of unconfigured {:#x}", addr.0);
            RtasStatus::HwError
        })?;
        irq.free_block(alloc.first_irq, alloc.num).map_err(|err| {
            log::warn!("pci: cannot free MSIs of {:#x}: {err}", addr.0);
            RtasStatus::HwError
        })?;
        clear_messages(dev, alloc.num);
        phb.msi.remove(addr);
        log::debug!("pci: released {} MSIs of {:#x}", alloc.num, addr.0);
        call.set_ret(1, 0);
        return Ok(());
    }

    let max = kind.max_vectors(dev);
    if max == 0 {
        log::debug!("pci: {kind:?} is not available on {:#x}", addr.0);
        return Err(RtasStatus::HwError);
    }
    let num = if req_num > max {
        log::debug!("pci: {:#x} asked for {req_num} vectors, clamping to {max}", addr.0);
        max
    } else {
        req_num
    };

    // A failed allocation leaves the previous block in place.
    let first_irq = irq
        .alloc_block(0, num, false, kind == MsiKind::Msi)
        .map_err(|err| {
            log::warn!("pci: cannot allocate {num} MSIs for {:#x}: {err}", addr.0);
            RtasStatus::HwError
        })?;
    if let Some(old) = phb.msi.remove(addr) {
        if let Err(err) = irq.free_block(old.first_irq, old.num) {
            log::warn!("pci: cannot free previous MSIs of {:#x}: {err}", addr.0);
        }
        clear_messages(dev, old.num);
    }
    program_messages(dev, kind, first_irq, num);
    phb.msi.insert(addr, MsiAllocation { first_irq, num });
    log::debug!("pci: {:#x} got {num} {kind:?} vectors at {first_irq:#x}", addr.0);

    call.set_ret(1, num);
    call.set_ret(2, seq_num.wrapping_add(1));
    call.set_ret(3, kind.rtas_type());
    Ok(())
}

// ibm,query-interrupt-source-number
pub(crate) fn rtas_ibm_query_interrupt_source_number(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(4, 3)?;
    let addr = ConfigAddress(call.arg(0));
    let buid = call.arg64(1);
    let vector = call.arg(3);

    let (phb, _) = lookup(machine, buid, addr)?;
    let alloc = phb
        .msi
        .get(addr)
        .filter(|alloc| alloc.first_irq != 0 && vector < alloc.num)
        .ok_or_else(|| {
            log::debug!("pci: no vector {vector} on {:#x}", addr.0);
            RtasStatus::HwError
        })?;

    call.set_ret(1, alloc.first_irq + vector);
    // Edge triggered.
    call.set_ret(2, 1);
    Ok(())
}
