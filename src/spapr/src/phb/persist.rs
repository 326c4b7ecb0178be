// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Defines the structures needed for saving/restoring a host bridge.
//!
//! Three wire layouts exist. [`PhbStateV1`] carries per-slot MSI enable bitmaps,
//! [`PhbStateV2`] replaces them with the allocated blocks and [`PhbStateV3`] adds the dynamic
//! DMA windows. All of them load into [`PhbState`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{PCI_NUM_PINS, SpaprPhb};
use crate::config::{PhbConfig, PhbLayout};
use crate::ddw::DmaWindow;
use crate::irq::IrqController;
use crate::msi::{MsiAllocation, MsiBitmaps};
use crate::pci::ConfigAddress;
use crate::persist::{Persist, PersistError};
use crate::vfio::SpaprVfioContainer;

/// Fields that tie a migrated bridge to the configured one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhbIdentity {
    pub buid: u64,
    pub dma_liobn: u32,
    pub mem_win_addr: u64,
    pub mem_win_size: u64,
    pub io_win_addr: u64,
    pub io_win_size: u64,
}

impl From<&PhbLayout> for PhbIdentity {
    fn from(layout: &PhbLayout) -> Self {
        PhbIdentity {
            buid: layout.buid,
            dma_liobn: layout.dma_liobn,
            mem_win_addr: layout.mem_win_addr,
            mem_win_size: layout.mem_win_size,
            io_win_addr: layout.io_win_addr,
            io_win_size: layout.io_win_size,
        }
    }
}

impl PhbIdentity {
    // `self` is the migrated identity.
    fn check(&self, configured: &PhbIdentity) -> Result<(), PersistError> {
        let fields = [
            ("buid", self.buid, configured.buid),
            (
                "liobn",
                u64::from(self.dma_liobn),
                u64::from(configured.dma_liobn),
            ),
            ("mem_win_addr", self.mem_win_addr, configured.mem_win_addr),
            ("mem_win_size", self.mem_win_size, configured.mem_win_size),
            ("io_win_addr", self.io_win_addr, configured.io_win_addr),
            ("io_win_size", self.io_win_size, configured.io_win_size),
        ];
        for (field, migrated, configured) in fields {
            if migrated != configured {
                return Err(PersistError::IdentityMismatch(field, migrated, configured));
            }
        }
        Ok(())
    }
}

/// MSI block of one function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsiDevState {
    /// `(bus, devfn)` part of the config address.
    pub key: u32,
    pub first_irq: u32,
    pub num: u32,
}

/// Bridge state, version 1.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhbStateV1 {
    pub identity: PhbIdentity,
    pub lsi: [u32; PCI_NUM_PINS],
    pub msi: Vec<u8>,
    pub msix: Vec<u8>,
}

/// Bridge state, version 2.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhbStateV2 {
    pub identity: PhbIdentity,
    pub lsi: [u32; PCI_NUM_PINS],
    pub msi_devs: Vec<MsiDevState>,
}

/// Bridge state, version 3.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhbStateV3 {
    pub identity: PhbIdentity,
    pub lsi: [u32; PCI_NUM_PINS],
    pub msi_devs: Vec<MsiDevState>,
    pub ddw_num: u32,
    pub windows: Vec<DmaWindow>,
}

/// MSI bookkeeping as migrated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PhbMsiState {
    Devices(Vec<MsiDevState>),
    /// Version 1 bitmaps, folded once the functions are back.
    Legacy(MsiBitmaps),
}

/// Version independent bridge state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhbState {
    pub identity: PhbIdentity,
    pub lsi: [u32; PCI_NUM_PINS],
    pub msi: PhbMsiState,
    pub windows: Vec<DmaWindow>,
}

impl From<PhbStateV1> for PhbState {
    fn from(state: PhbStateV1) -> Self {
        PhbState {
            identity: state.identity,
            lsi: state.lsi,
            msi: PhbMsiState::Legacy(MsiBitmaps {
                msi: state.msi,
                msix: state.msix,
            }),
            windows: Vec::new(),
        }
    }
}

impl From<PhbStateV2> for PhbState {
    fn from(state: PhbStateV2) -> Self {
        PhbState {
            identity: state.identity,
            lsi: state.lsi,
            msi: PhbMsiState::Devices(state.msi_devs),
            windows: Vec::new(),
        }
    }
}

impl TryFrom<PhbStateV3> for PhbState {
    type Error = PersistError;

    fn try_from(state: PhbStateV3) -> Result<Self, Self::Error> {
        if state.ddw_num as usize != state.windows.len() {
            return Err(PersistError::WindowCount(state.ddw_num, state.windows.len()));
        }
        Ok(PhbState {
            identity: state.identity,
            lsi: state.lsi,
            msi: PhbMsiState::Devices(state.msi_devs),
            windows: state.windows,
        })
    }
}

impl PhbState {
    fn msi_devs(&self) -> Result<Vec<MsiDevState>, PersistError> {
        match &self.msi {
            PhbMsiState::Devices(devs) => Ok(devs.clone()),
            PhbMsiState::Legacy(_) => Err(PersistError::PendingLegacyMsi),
        }
    }

    /// Version 2 layout. Dynamic windows are dropped.
    pub fn to_v2(&self) -> Result<PhbStateV2, PersistError> {
        Ok(PhbStateV2 {
            identity: self.identity,
            lsi: self.lsi,
            msi_devs: self.msi_devs()?,
        })
    }

    pub fn to_v3(&self) -> Result<PhbStateV3, PersistError> {
        Ok(PhbStateV3 {
            identity: self.identity,
            lsi: self.lsi,
            msi_devs: self.msi_devs()?,
            ddw_num: self.windows.len() as u32,
            windows: self.windows.clone(),
        })
    }
}

/// What a bridge is rebuilt from.
#[derive(Debug)]
pub struct PhbConstructorArgs<'a> {
    pub config: &'a PhbConfig,
    pub irq: &'a mut dyn IrqController,
    pub container: Option<Arc<dyn SpaprVfioContainer>>,
}

impl SpaprPhb {
    // Takes over the interrupt numbers and DMA windows the guest was using.
    fn load_state(
        &mut self,
        irq: &mut dyn IrqController,
        state: &PhbState,
    ) -> Result<(), PersistError> {
        if self.lsi != state.lsi {
            self.release_lsis(irq);
            for (pin, lsi) in state.lsi.iter().enumerate() {
                self.lsi[pin] = irq.alloc_block(*lsi, 1, true, false)?;
            }
        }

        match &state.msi {
            PhbMsiState::Devices(devs) => {
                for dev in devs {
                    irq.alloc_block(dev.first_irq, dev.num, false, false)?;
                    self.msi.insert(
                        ConfigAddress(dev.key),
                        MsiAllocation {
                            first_irq: dev.first_irq,
                            num: dev.num,
                        },
                    );
                }
            }
            PhbMsiState::Legacy(bitmaps) => self.msi.set_legacy(bitmaps.clone()),
        }

        for window in &state.windows {
            self.dma.restore_window(window)?;
        }
        Ok(())
    }
}

impl<'a> Persist<'a> for SpaprPhb {
    type State = PhbState;
    type ConstructorArgs = PhbConstructorArgs<'a>;
    type Error = PersistError;

    fn save(&self) -> Self::State {
        let msi = match self.msi.legacy() {
            Some(bitmaps) => PhbMsiState::Legacy(bitmaps.clone()),
            None => PhbMsiState::Devices(
                self.msi
                    .iter()
                    .map(|(key, alloc)| MsiDevState {
                        key,
                        first_irq: alloc.first_irq,
                        num: alloc.num,
                    })
                    .collect(),
            ),
        };
        PhbState {
            identity: PhbIdentity::from(self.layout()),
            lsi: self.lsi,
            msi,
            windows: self.dma.dynamic_windows().copied().collect(),
        }
    }

    fn restore(
        constructor_args: Self::ConstructorArgs,
        state: &Self::State,
    ) -> Result<Self, Self::Error> {
        let PhbConstructorArgs {
            config,
            irq,
            container,
        } = constructor_args;
        let mut phb = SpaprPhb::realize(config, irq, container)?;

        let loaded = state
            .identity
            .check(&PhbIdentity::from(phb.layout()))
            .and_then(|_| phb.load_state(irq, state));
        if let Err(err) = loaded {
            phb.msi.clear(irq);
            if let Err(err) = phb.dma.reset() {
                log::warn!("pci: cannot drop restored windows of {:#x}: {err}", phb.buid());
            }
            phb.release_lsis(irq);
            return Err(err);
        }
        log::info!(
            "pci: restored PHB {:#x} with {} MSI blocks and {} dynamic windows",
            phb.buid(),
            phb.msi.len(),
            phb.dma.active()
        );
        Ok(phb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spapr_pci_liobn;
    use crate::ddw::DdwPageSizes;
    use crate::irq::{XICS_IRQ_BASE, XicsIrqAllocator};
    use crate::msi::MSI_V1_BITMAP_SIZE;

    fn args<'a>(config: &'a PhbConfig, irq: &'a mut dyn IrqController) -> PhbConstructorArgs<'a> {
        PhbConstructorArgs {
            config,
            irq,
            container: None,
        }
    }

    fn populated(irq: &mut XicsIrqAllocator) -> SpaprPhb {
        let config = PhbConfig {
            ddw_windows: 2,
            ..PhbConfig::with_index(0)
        };
        let mut phb = SpaprPhb::realize(&config, irq, None).unwrap();
        let first_irq = irq.alloc_block(0, 4, false, true).unwrap();
        phb.msi.insert(
            ConfigAddress(0x0000_1000),
            MsiAllocation { first_irq, num: 4 },
        );
        phb.dma.create(16, 24, DdwPageSizes::all()).unwrap();
        phb
    }

    #[test]
    fn test_save() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let phb = populated(&mut irq);
        let state = phb.save();
        assert_eq!(state.identity.buid, phb.buid());
        assert_eq!(state.lsi, phb.lsi);
        assert_eq!(
            state.msi,
            PhbMsiState::Devices(vec![MsiDevState {
                key: 0x1000,
                first_irq: XICS_IRQ_BASE + 4,
                num: 4
            }])
        );
        assert_eq!(state.windows.len(), 1);
        assert_eq!(state.windows[0].liobn, spapr_pci_liobn(0, 1));

        let v3 = state.to_v3().unwrap();
        assert_eq!(v3.ddw_num, 1);
        assert_eq!(PhbState::try_from(v3).unwrap(), state);
        let v2 = state.to_v2().unwrap();
        assert!(PhbState::from(v2).windows.is_empty());
    }

    #[test]
    fn test_restore() {
        let mut src_irq = XicsIrqAllocator::new(64).unwrap();
        // Shift the source numbering so the destination has to move its LSIs.
        src_irq.alloc_block(0, 2, true, false).unwrap();
        let state = populated(&mut src_irq).save();

        let config = PhbConfig {
            ddw_windows: 2,
            ..PhbConfig::with_index(0)
        };
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let phb = SpaprPhb::restore(args(&config, &mut irq), &state).unwrap();
        assert_eq!(phb.lsi, state.lsi);
        assert!(phb.lsi.iter().all(|lsi| irq.is_lsi(*lsi)));
        assert_eq!(
            phb.msi.get(ConfigAddress(0x1000)),
            Some(MsiAllocation {
                first_irq: XICS_IRQ_BASE + 8,
                num: 4
            })
        );
        assert_eq!(phb.dma.active(), 1);
        assert_eq!(phb.dma.dynamic_windows().next(), state.windows.first());
        // Four LSIs and one MSI block.
        assert_eq!(irq.allocated_blocks(), 5);
    }

    #[test]
    fn test_restore_identity_mismatch() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let mut state = populated(&mut irq).save();
        state.identity.mem_win_size = 0x1000_0000;

        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let config = PhbConfig::with_index(0);
        assert!(matches!(
            SpaprPhb::restore(args(&config, &mut irq), &state),
            Err(PersistError::IdentityMismatch("mem_win_size", 0x1000_0000, 0x2000_0000))
        ));
        assert_eq!(irq.allocated_blocks(), 0);
    }

    #[test]
    fn test_restore_window_budget() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let mut state = populated(&mut irq).save();
        let mut extra = state.windows[0];
        extra.liobn = spapr_pci_liobn(0, 2);
        extra.bus_offset += 1 << 24;
        state.windows.push(extra);

        // The destination only offers one dynamic window.
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let config = PhbConfig::with_index(0);
        assert!(matches!(
            SpaprPhb::restore(args(&config, &mut irq), &state),
            Err(PersistError::Ddw(_))
        ));
        assert_eq!(irq.allocated_blocks(), 0);
    }

    #[test]
    fn test_v3_window_count() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let mut v3 = populated(&mut irq).save().to_v3().unwrap();
        v3.ddw_num = 2;
        assert!(matches!(
            PhbState::try_from(v3),
            Err(PersistError::WindowCount(2, 1))
        ));
    }

    #[test]
    fn test_restore_v1_keeps_bitmaps() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let identity = PhbIdentity::from(&PhbConfig::with_index(0).layout().unwrap());
        let mut msix = vec![0u8; MSI_V1_BITMAP_SIZE];
        msix[2] = 0x01;
        let v1 = PhbStateV1 {
            identity,
            lsi: [XICS_IRQ_BASE, XICS_IRQ_BASE + 1, XICS_IRQ_BASE + 2, XICS_IRQ_BASE + 3],
            msi: vec![0u8; MSI_V1_BITMAP_SIZE],
            msix,
        };
        let state = PhbState::from(v1);
        let config = PhbConfig::with_index(0);
        let phb = SpaprPhb::restore(args(&config, &mut irq), &state).unwrap();
        assert!(phb.msi.has_legacy());
        assert!(phb.msi.is_empty());
        assert!(matches!(
            phb.save().to_v3(),
            Err(PersistError::PendingLegacyMsi)
        ));
    }
}
