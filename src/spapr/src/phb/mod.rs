// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! sPAPR PCI host bridges.
//!
//! A [`SpaprPhb`] is the firmware visible root of one PCI domain. It owns its bus, the four
//! legacy interrupt sources shared by the slots, the MSI bookkeeping, the DMA windows and the
//! EEH backend. The machine keeps every live bridge in a [`PhbRegistry`] keyed by BUID.

pub mod fdt;
pub mod persist;

use std::sync::Arc;

use crate::config::{ConfigError, PhbBackendConfig, PhbConfig, PhbLayout, SPAPR_PCI_DMA_WINDOW_SIZE};
use crate::ddw::{DdwBackend, DdwError, DmaWindow, DmaWindows, EmulatedDdw, SPAPR_TCE_PAGE_SHIFT};
use crate::drc::{DrcLocation, PhbDrcTable};
use crate::eeh::{EehBackend, EmulatedEeh};
use crate::irq::{IrqController, IrqError};
use crate::machine::SpaprMachine;
use crate::msi::MsiTable;
use crate::pci::{ConfigAddress, PciBus, PciFunction, devfn_slot};
use crate::rtas::{RtasCall, RtasStatus};
use crate::vfio::{SpaprVfioContainer, VfioDdw, VfioEeh, VfioError};

/// Legacy interrupt pins per slot (INTA..INTD).
pub const PCI_NUM_PINS: usize = 4;

/// Host bridge construction errors.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum PhbError {
    /// Invalid bridge configuration: {0}
    Config(#[from] ConfigError),
    /// PCI host bridges must have unique BUIDs, {0:#x} is taken
    DuplicateBuid(u64),
    /// LIOBNs of PHB {0:#x} overlap those of PHB {1:#x}
    LiobnOverlap(u64, u64),
    /// Cannot allocate LSIs: {0}
    Lsi(IrqError),
    /// DMA windows: {0}
    Dma(#[from] DdwError),
    /// VFIO: {0}
    Vfio(#[from] VfioError),
    /// The host reports a {0:#x} byte default DMA window, which is not a power of two
    Dma32Window(u64),
    /// A VFIO bridge needs a container
    MissingContainer,
}

/// Slot interrupt swizzling: pin `pin` (0 for INTA) of `slot` is routed to this LSI.
pub const fn swizzle(slot: u8, pin: u8) -> usize {
    (slot as usize + pin as usize) % PCI_NUM_PINS
}

fn alloc_lsis(irq: &mut dyn IrqController) -> Result<[u32; PCI_NUM_PINS], IrqError> {
    let mut lsi = [0u32; PCI_NUM_PINS];
    for pin in 0..PCI_NUM_PINS {
        match irq.alloc_block(0, 1, true, false) {
            Ok(first) => lsi[pin] = first,
            Err(err) => {
                for allocated in &lsi[..pin] {
                    let _ = irq.free_block(*allocated, 1);
                }
                return Err(err);
            }
        }
    }
    Ok(lsi)
}

/// One host bridge.
#[derive(Debug)]
pub struct SpaprPhb {
    layout: PhbLayout,
    /// LSI numbers, one per pin.
    pub lsi: [u32; PCI_NUM_PINS],
    /// Root bus.
    pub bus: PciBus,
    /// MSI/MSI-X blocks of the functions on the bus.
    pub msi: MsiTable,
    /// Default and dynamic DMA windows.
    pub dma: DmaWindows,
    /// PE operations.
    pub eeh: Box<dyn EehBackend>,
    /// Bridge and slot connectors.
    pub drc: PhbDrcTable,
    vfio: bool,
}

impl SpaprPhb {
    /// Builds a bridge from `config`.
    ///
    /// VFIO bridges take their default window and DDW/EEH capabilities from `container`. The
    /// LSIs are the last resource taken, so a failure never leaks interrupt sources.
    pub fn realize(
        config: &PhbConfig,
        irq: &mut dyn IrqController,
        container: Option<Arc<dyn SpaprVfioContainer>>,
    ) -> Result<Self, PhbError> {
        let layout = config.layout()?;

        let (dma, eeh, vfio): (DmaWindows, Box<dyn EehBackend>, bool) = match &config.backend {
            PhbBackendConfig::Emulated => {
                let default_window = DmaWindow {
                    liobn: layout.dma_liobn,
                    page_shift: SPAPR_TCE_PAGE_SHIFT,
                    window_shift: SPAPR_PCI_DMA_WINDOW_SIZE.ilog2(),
                    bus_offset: 0,
                };
                let backend: Option<Box<dyn DdwBackend>> = if config.ddw {
                    Some(Box::new(EmulatedDdw::new(config.ddw_windows)?))
                } else {
                    None
                };
                (
                    DmaWindows::new(default_window, backend)?,
                    Box::new(EmulatedEeh),
                    false,
                )
            }
            PhbBackendConfig::Vfio { iommu_group } => {
                let container = container.ok_or(PhbError::MissingContainer)?;
                let info = container.tce_info()?;
                if !info.dma32_size.is_power_of_two() {
                    return Err(PhbError::Dma32Window(info.dma32_size));
                }
                let default_window = DmaWindow {
                    liobn: layout.dma_liobn,
                    page_shift: SPAPR_TCE_PAGE_SHIFT,
                    window_shift: info.dma32_size.ilog2(),
                    bus_offset: info.dma32_start,
                };
                let backend: Option<Box<dyn DdwBackend>> = match (config.ddw, info.ddw) {
                    (true, true) => Some(Box::new(VfioDdw::new(container.clone(), info))),
                    (true, false) => {
                        log::warn!(
                            "vfio: group {iommu_group} has no dynamic DMA window support, disabling DDW"
                        );
                        None
                    }
                    (false, _) => None,
                };
                (
                    DmaWindows::new(default_window, backend)?,
                    Box::new(VfioEeh::new(container)),
                    true,
                )
            }
        };

        let lsi = alloc_lsis(irq).map_err(PhbError::Lsi)?;
        log::info!(
            "pci: realized PHB {:#x}, LSIs {:#x}..={:#x}, default window {:#x}",
            layout.buid,
            lsi[0],
            lsi[PCI_NUM_PINS - 1],
            layout.dma_liobn
        );

        Ok(SpaprPhb {
            layout,
            lsi,
            bus: PciBus::new(0),
            msi: MsiTable::new(),
            dma,
            eeh,
            drc: PhbDrcTable::new(layout.index),
            vfio,
        })
    }

    pub fn buid(&self) -> u64 {
        self.layout.buid
    }

    /// Index the bridge was laid out from, `None` for explicitly placed bridges.
    pub fn index(&self) -> Option<u32> {
        self.layout.index
    }

    pub fn layout(&self) -> &PhbLayout {
        &self.layout
    }

    /// Whether DMA and EEH go through a host IOMMU group.
    pub fn is_vfio(&self) -> bool {
        self.vfio
    }

    /// Device tree node name.
    pub fn dt_name(&self) -> String {
        format!("pci@{:x}", self.layout.buid)
    }

    /// LSI raised by interrupt pin `pin` (0 for INTA) of the function at `devfn`.
    pub fn map_irq(&self, devfn: u8, pin: u8) -> u32 {
        self.lsi[swizzle(devfn_slot(devfn), pin)]
    }

    /// Returns the bridge to its power-on state: every dynamic window and MSI block is
    /// dropped and the functions are reset.
    pub fn reset(&mut self, irq: &mut dyn IrqController) {
        if let Err(err) = self.dma.reset() {
            log::warn!("pci: PHB {:#x} DMA window reset failed: {err}", self.buid());
        }
        self.msi.clear(irq);
        self.bus.reset();
        self.eeh.reenable();
    }

    /// Gives the LSIs back to `irq`. The bridge must not be used afterwards.
    pub fn release_lsis(&mut self, irq: &mut dyn IrqController) {
        for lsi in self.lsi {
            if let Err(err) = irq.free_block(lsi, 1) {
                log::warn!("pci: cannot free LSI {lsi:#x}: {err}");
            }
        }
    }
}

/// The live bridges of a machine.
#[derive(Debug, Default)]
pub struct PhbRegistry {
    phbs: Vec<SpaprPhb>,
}

impl PhbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails when `phb` would share its BUID or any of its LIOBNs with a live bridge.
    pub fn check_conflicts(&self, phb: &SpaprPhb) -> Result<(), PhbError> {
        if self.find_by_buid(phb.buid()).is_some() {
            return Err(PhbError::DuplicateBuid(phb.buid()));
        }
        let liobns = phb.dma.liobn_range();
        if let Some(other) = self.phbs.iter().find(|other| {
            let taken = other.dma.liobn_range();
            liobns.start() <= taken.end() && taken.start() <= liobns.end()
        }) {
            return Err(PhbError::LiobnOverlap(phb.buid(), other.buid()));
        }
        Ok(())
    }

    /// Registers `phb` unless it conflicts with a live bridge.
    pub fn add(&mut self, phb: SpaprPhb) -> Result<(), PhbError> {
        self.check_conflicts(&phb)?;
        self.phbs.push(phb);
        Ok(())
    }

    pub fn find_by_buid(&self, buid: u64) -> Option<&SpaprPhb> {
        self.phbs.iter().find(|phb| phb.buid() == buid)
    }

    pub fn find_by_buid_mut(&mut self, buid: u64) -> Option<&mut SpaprPhb> {
        self.phbs.iter_mut().find(|phb| phb.buid() == buid)
    }

    /// Bridge owning the DMA window `liobn`.
    pub fn find_by_liobn_mut(&mut self, liobn: u32) -> Option<&mut SpaprPhb> {
        self.phbs.iter_mut().find(|phb| phb.dma.owns(liobn))
    }

    /// Function addressed by `addr` behind the bridge `buid`.
    pub fn find_device(&self, buid: u64, addr: ConfigAddress) -> Option<&dyn PciFunction> {
        self.find_by_buid(buid)?.bus.find(addr.bus(), addr.devfn())
    }

    pub fn find_device_mut(
        &mut self,
        buid: u64,
        addr: ConfigAddress,
    ) -> Option<&mut (dyn PciFunction + 'static)> {
        self.find_by_buid_mut(buid)?
            .bus
            .find_mut(addr.bus(), addr.devfn())
    }

    /// Bridge owning the connector `drc_index` and where the connector sits on it.
    pub fn find_drc_mut(&mut self, drc_index: u32) -> Option<(&mut SpaprPhb, DrcLocation)> {
        self.phbs.iter_mut().find_map(|phb| {
            let location = phb.drc.locate(drc_index)?;
            Some((phb, location))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &SpaprPhb> {
        self.phbs.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SpaprPhb> {
        self.phbs.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.phbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phbs.is_empty()
    }
}

// Resolves the function and register a config access targets.
fn config_target(
    machine: &mut SpaprMachine,
    buid: u64,
    addr: ConfigAddress,
    size: u32,
) -> Result<(&mut (dyn PciFunction + 'static), u16, u8), RtasStatus> {
    let len = match size {
        1 | 2 | 4 => size as u8,
        _ => {
            log::debug!("pci: config access of {size} bytes");
            return Err(RtasStatus::HwError);
        }
    };
    let reg = addr.register();
    let dev = machine.phbs_mut().find_device_mut(buid, addr).ok_or_else(|| {
        log::debug!("pci: no function at {:#x} on {buid:#x}", addr.0);
        RtasStatus::HwError
    })?;
    if reg % u16::from(len) != 0 || reg >= dev.config_size() {
        log::debug!("pci: bad config register {reg:#x}/{len}");
        return Err(RtasStatus::HwError);
    }
    Ok((dev, reg, len))
}

fn read_config(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
    buid: u64,
    addr: ConfigAddress,
    size: u32,
) -> Result<(), RtasStatus> {
    let (dev, reg, len) = config_target(machine, buid, addr, size)?;
    let value = dev.read_config(reg, len);
    call.set_ret(1, value);
    Ok(())
}

fn write_config(
    machine: &mut SpaprMachine,
    buid: u64,
    addr: ConfigAddress,
    size: u32,
    value: u32,
) -> Result<(), RtasStatus> {
    let (dev, reg, len) = config_target(machine, buid, addr, size)?;
    dev.write_config(reg, len, value);
    Ok(())
}

// ibm,read-pci-config
pub(crate) fn rtas_ibm_read_pci_config(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(4, 2)?;
    let (addr, buid, size) = (ConfigAddress(call.arg(0)), call.arg64(1), call.arg(3));
    read_config(machine, call, buid, addr, size)
}

// read-pci-config
pub(crate) fn rtas_read_pci_config(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(2, 2)?;
    let (addr, size) = (ConfigAddress(call.arg(0)), call.arg(1));
    read_config(machine, call, 0, addr, size)
}

// ibm,write-pci-config
pub(crate) fn rtas_ibm_write_pci_config(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(5, 1)?;
    let addr = ConfigAddress(call.arg(0));
    write_config(machine, call.arg64(1), addr, call.arg(3), call.arg(4))
}

// write-pci-config
pub(crate) fn rtas_write_pci_config(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(3, 1)?;
    let addr = ConfigAddress(call.arg(0));
    write_config(machine, 0, addr, call.arg(1), call.arg(2))
}
