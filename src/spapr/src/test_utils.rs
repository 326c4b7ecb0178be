// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![allow(missing_docs)]

use std::sync::{Arc, Mutex};

use vm_memory::{GuestAddress, GuestMemoryMmap};

use crate::config::{MachineConfig, PhbConfig};
use crate::machine::SpaprMachine;
use crate::pci::{MsiMessage, PciBar, PciFunction};
use crate::vfio::{SpaprVfioContainer, TceInfo, VfioEehPeErr, VfioError};

/// Guest RAM used by machine tests.
pub const TEST_MEM_SIZE: usize = 0x10_0000;

pub fn single_region_mem(size: usize) -> GuestMemoryMmap {
    GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size)]).unwrap()
}

/// Config-space backed function with configurable MSI/MSI-X capabilities.
#[derive(Debug)]
pub struct DummyPciFunction {
    pub config: Vec<u8>,
    pub msi_vectors: u32,
    pub msi_enabled: u32,
    pub msi_msg: MsiMessage,
    pub msix_table: Vec<MsiMessage>,
    pub msix_cap: Option<u16>,
    pub msix_resets: Arc<Mutex<u32>>,
    pub bars: Vec<PciBar>,
    pub resets: Arc<Mutex<u32>>,
    pub vfio: bool,
}

impl DummyPciFunction {
    pub fn new(vendor: u16, device: u16) -> Self {
        let mut config = vec![0u8; 256];
        config[0..2].copy_from_slice(&vendor.to_le_bytes());
        config[2..4].copy_from_slice(&device.to_le_bytes());
        // Interrupt pin INTA.
        config[0x3d] = 1;
        DummyPciFunction {
            config,
            msi_vectors: 0,
            msi_enabled: 0,
            msi_msg: MsiMessage::default(),
            msix_table: Vec::new(),
            msix_cap: None,
            msix_resets: Arc::new(Mutex::new(0)),
            bars: Vec::new(),
            resets: Arc::new(Mutex::new(0)),
            vfio: false,
        }
    }

    pub fn with_msi(mut self, vectors: u32) -> Self {
        self.msi_vectors = vectors;
        self
    }

    pub fn with_msix(mut self, entries: u32) -> Self {
        self.msix_table = vec![MsiMessage::default(); entries as usize];
        self.msix_cap = Some(0x50);
        self
    }

    pub fn with_bar(mut self, bar: PciBar) -> Self {
        self.bars.push(bar);
        self
    }

    pub fn vfio(mut self) -> Self {
        self.vfio = true;
        self
    }
}

impl PciFunction for DummyPciFunction {
    fn read_config(&self, offset: u16, len: u8) -> u32 {
        let offset = usize::from(offset);
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().take(usize::from(len)).enumerate() {
            *byte = self.config.get(offset + i).copied().unwrap_or(0);
        }
        u32::from_le_bytes(bytes)
    }

    fn write_config(&mut self, offset: u16, len: u8, value: u32) {
        let offset = usize::from(offset);
        let bytes = value.to_le_bytes();
        for (i, byte) in bytes.iter().take(usize::from(len)).enumerate() {
            if let Some(slot) = self.config.get_mut(offset + i) {
                *slot = *byte;
            }
        }
    }

    fn msi_max_vectors(&self) -> u32 {
        self.msi_vectors
    }

    fn msi_allocated_vectors(&self) -> u32 {
        self.msi_enabled
    }

    fn msi_set_message(&mut self, msg: MsiMessage) {
        self.msi_msg = msg;
    }

    fn msi_message(&self) -> MsiMessage {
        self.msi_msg
    }

    fn msix_entries(&self) -> u32 {
        self.msix_table.len() as u32
    }

    fn msix_set_message(&mut self, entry: u32, msg: MsiMessage) {
        if let Some(slot) = self.msix_table.get_mut(entry as usize) {
            *slot = msg;
        }
    }

    fn msix_message(&self, entry: u32) -> MsiMessage {
        self.msix_table
            .get(entry as usize)
            .copied()
            .unwrap_or_default()
    }

    fn msix_cap_offset(&self) -> Option<u16> {
        self.msix_cap
    }

    fn msix_reset(&mut self) {
        self.msix_table
            .iter_mut()
            .for_each(|entry| *entry = MsiMessage::default());
        *self.msix_resets.lock().unwrap() += 1;
    }

    fn bars(&self) -> Vec<PciBar> {
        self.bars.clone()
    }

    fn reset(&mut self) {
        *self.resets.lock().unwrap() += 1;
    }

    fn is_vfio(&self) -> bool {
        self.vfio
    }
}

/// Records every VFIO container call and answers from canned values.
#[derive(Debug, Clone)]
pub struct MockVfioContainer {
    pub info: TceInfo,
    pub calls: Arc<Mutex<Vec<String>>>,
    pub next_start: Arc<Mutex<u64>>,
    pub fail_create: bool,
    pub fail_remove: bool,
    pub fail_eeh: bool,
    pub eeh_ret: i32,
}

impl MockVfioContainer {
    pub fn new(info: TceInfo) -> Self {
        MockVfioContainer {
            info,
            calls: Arc::new(Mutex::new(Vec::new())),
            next_start: Arc::new(Mutex::new(0x0800_0000_0000_0000)),
            fail_create: false,
            fail_remove: false,
            fail_eeh: false,
            eeh_ret: 0,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl SpaprVfioContainer for MockVfioContainer {
    fn tce_info(&self) -> Result<TceInfo, VfioError> {
        self.calls.lock().unwrap().push("info".to_string());
        Ok(self.info)
    }

    fn tce_create(&self, page_shift: u32, window_size: u64, levels: u32) -> Result<u64, VfioError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("create {page_shift} {window_size:#x} {levels}"));
        if self.fail_create {
            return Err(VfioError::TceCreate(std::io::Error::from_raw_os_error(
                libc::ENOSPC,
            )));
        }
        let mut next = self.next_start.lock().unwrap();
        let start = *next;
        *next += window_size;
        Ok(start)
    }

    fn tce_remove(&self, start_addr: u64) -> Result<(), VfioError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("remove {start_addr:#x}"));
        if self.fail_remove {
            return Err(VfioError::TceRemove(std::io::Error::from_raw_os_error(
                libc::EBUSY,
            )));
        }
        Ok(())
    }

    fn eeh_pe_op(&self, op: u32) -> Result<i32, VfioError> {
        self.calls.lock().unwrap().push(format!("eeh {op}"));
        if self.fail_eeh {
            return Err(VfioError::EehPeOp(
                op,
                std::io::Error::from_raw_os_error(libc::EIO),
            ));
        }
        Ok(self.eeh_ret)
    }

    fn eeh_inject_error(&self, err: VfioEehPeErr) -> Result<i32, VfioError> {
        self.calls.lock().unwrap().push(format!(
            "inject {} {} {:#x} {:#x}",
            err.err_type, err.func, err.addr, err.mask
        ));
        if self.fail_eeh {
            return Err(VfioError::EehPeOp(
                9,
                std::io::Error::from_raw_os_error(libc::EIO),
            ));
        }
        Ok(0)
    }
}

pub fn default_machine_config() -> MachineConfig {
    MachineConfig {
        ram_size_mib: 1,
        phbs: vec![PhbConfig::with_index(0)],
        ..Default::default()
    }
}

/// A machine with one emulated PHB at index 0 and a small RAM.
pub fn default_machine() -> SpaprMachine {
    SpaprMachine::new(default_machine_config(), single_region_mem(TEST_MEM_SIZE)).unwrap()
}
