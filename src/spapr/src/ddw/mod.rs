// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! DMA windows of a host bridge.
//!
//! Every bridge starts with a default 32-bit window. Guests that support it can ask for
//! additional, usually much larger, windows through the dynamic DMA window calls. Windows are
//! backed either by software TCE tables or by the host IOMMU through VFIO.

pub mod tce;

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use vm_allocator::{AddressAllocator, AllocPolicy, IdAllocator, RangeInclusive};

use crate::machine::SpaprMachine;
use crate::rtas::{RtasCall, RtasStatus};
use crate::vfio::VfioError;
use tce::{IommuRoot, TceError, TceTable};

/// Base page shift of the default window.
pub const SPAPR_TCE_PAGE_SHIFT: u32 = 12;
/// Largest window the guest may request.
pub const DDW_MAX_WINDOW_SHIFT: u32 = 62;
/// Bus address where emulated dynamic windows start.
pub const DDW_EMULATED_BUS_BASE: u64 = 0x8000_0000_0000_0000;
/// Dynamic windows are numbered from 1; 0 is the default window.
const DDW_FIRST_WINDOW: u32 = 1;
const DDW_LAST_WINDOW: u32 = 255;

bitflags::bitflags! {
    /// Page sizes a window can use, as encoded in the query results.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DdwPageSizes: u32 {
        const SIZE_4K = 0x01;
        const SIZE_64K = 0x02;
        const SIZE_16M = 0x04;
        const SIZE_32M = 0x08;
        const SIZE_64M = 0x10;
        const SIZE_128M = 0x20;
        const SIZE_256M = 0x40;
        const SIZE_16G = 0x80;
    }
}

const PAGE_SHIFTS: [(u32, DdwPageSizes); 8] = [
    (12, DdwPageSizes::SIZE_4K),
    (16, DdwPageSizes::SIZE_64K),
    (24, DdwPageSizes::SIZE_16M),
    (25, DdwPageSizes::SIZE_32M),
    (26, DdwPageSizes::SIZE_64M),
    (27, DdwPageSizes::SIZE_128M),
    (28, DdwPageSizes::SIZE_256M),
    (34, DdwPageSizes::SIZE_16G),
];

impl DdwPageSizes {
    /// Flag for a page of `1 << shift` bytes.
    pub fn from_shift(shift: u32) -> Option<DdwPageSizes> {
        PAGE_SHIFTS
            .iter()
            .find(|(s, _)| *s == shift)
            .map(|(_, flag)| *flag)
    }

    /// Union of the flags of every known shift in `shifts`.
    pub fn from_shifts(shifts: impl IntoIterator<Item = u32>) -> DdwPageSizes {
        shifts
            .into_iter()
            .filter_map(DdwPageSizes::from_shift)
            .fold(DdwPageSizes::empty(), |acc, flag| acc | flag)
    }

    /// Flags for a host page size bitmap where bit `n` means `1 << n` bytes.
    pub fn from_host_bitmap(bitmap: u64) -> DdwPageSizes {
        DdwPageSizes::from_shifts((0..64).filter(|bit| bitmap & (1u64 << bit) != 0))
    }
}

/// What a backend can offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DdwCapabilities {
    /// Dynamic windows supported at the same time.
    pub windows_supported: u32,
    pub page_sizes: DdwPageSizes,
}

/// Dynamic DMA window errors.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum DdwError {
    /// Dynamic DMA windows are disabled on this bridge
    Disabled,
    /// Invalid window: page shift {0}, window shift {1}
    InvalidShift(u32, u32),
    /// Page shift {0} is not usable
    PageSizeNotUsable(u32),
    /// No dynamic DMA window left
    NoWindowsLeft,
    /// LIOBN {0:#x} leaves no room for {1} dynamic windows
    LiobnRange(u32, u32),
    /// Unknown LIOBN {0:#x}
    UnknownLiobn(u32),
    /// LIOBN {0:#x} is the default window
    DefaultWindow(u32),
    /// Cannot allocate bus space for a {0:#x} byte window: {1}
    Allocate(u64, vm_allocator::Error),
    /// No window mapped at bus offset {0:#x}
    NotMapped(u64),
    /// Window restored at {1:#x} instead of {0:#x}
    OffsetMismatch(u64, u64),
    /// IOMMU map: {0}
    Map(#[from] TceError),
    /// VFIO: {0}
    Vfio(#[from] VfioError),
}

impl DdwError {
    /// Status reported to the guest for this failure.
    pub fn rtas_status(&self) -> RtasStatus {
        match self {
            DdwError::InvalidShift(..)
            | DdwError::PageSizeNotUsable(_)
            | DdwError::NoWindowsLeft
            | DdwError::DefaultWindow(_) => RtasStatus::ParamError,
            _ => RtasStatus::HwError,
        }
    }
}

/// Provider of dynamic windows.
pub trait DdwBackend: Debug + Send {
    /// Window budget and page sizes.
    fn query(&self) -> Result<DdwCapabilities, DdwError>;
    /// Sets up a window and returns its bus offset. `bus_offset` asks for a specific placement,
    /// which a backend that picks offsets itself may ignore.
    fn create(
        &mut self,
        page_shift: u32,
        window_shift: u32,
        bus_offset: Option<u64>,
    ) -> Result<u64, DdwError>;
    /// Tears down the window at `bus_offset`.
    fn remove(&mut self, bus_offset: u64, window_size: u64) -> Result<(), DdwError>;
    /// Called once every dynamic window is gone.
    fn reset(&mut self) -> Result<(), DdwError> {
        Ok(())
    }
}

/// Software windows carved out of the upper half of the bus address space.
#[derive(Debug)]
pub struct EmulatedDdw {
    windows_supported: u32,
    page_sizes: DdwPageSizes,
    bus_space: AddressAllocator,
}

impl EmulatedDdw {
    pub fn new(windows_supported: u32) -> Result<Self, DdwError> {
        Ok(EmulatedDdw {
            windows_supported,
            page_sizes: DdwPageSizes::SIZE_4K | DdwPageSizes::SIZE_64K | DdwPageSizes::SIZE_16M,
            bus_space: AddressAllocator::new(DDW_EMULATED_BUS_BASE, DDW_EMULATED_BUS_BASE)
                .map_err(|err| DdwError::Allocate(DDW_EMULATED_BUS_BASE, err))?,
        })
    }
}

impl DdwBackend for EmulatedDdw {
    fn query(&self) -> Result<DdwCapabilities, DdwError> {
        Ok(DdwCapabilities {
            windows_supported: self.windows_supported,
            page_sizes: self.page_sizes,
        })
    }

    fn create(
        &mut self,
        _page_shift: u32,
        window_shift: u32,
        bus_offset: Option<u64>,
    ) -> Result<u64, DdwError> {
        let size = 1u64 << window_shift;
        let policy = match bus_offset {
            Some(offset) => AllocPolicy::ExactMatch(offset),
            None => AllocPolicy::FirstMatch,
        };
        let range = self
            .bus_space
            .allocate(size, size, policy)
            .map_err(|err| DdwError::Allocate(size, err))?;
        Ok(range.start())
    }

    fn remove(&mut self, bus_offset: u64, window_size: u64) -> Result<(), DdwError> {
        let range = RangeInclusive::new(bus_offset, bus_offset + window_size - 1)
            .map_err(|_| DdwError::NotMapped(bus_offset))?;
        self.bus_space
            .free(&range)
            .map_err(|_| DdwError::NotMapped(bus_offset))
    }
}

/// One DMA window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaWindow {
    pub liobn: u32,
    pub page_shift: u32,
    pub window_shift: u32,
    pub bus_offset: u64,
}

impl DmaWindow {
    pub fn size(&self) -> u64 {
        1u64 << self.window_shift
    }

    fn table(&self) -> TceTable {
        TceTable::new(
            self.liobn,
            self.page_shift,
            self.bus_offset,
            1u64 << (self.window_shift - self.page_shift),
        )
    }
}

/// Result of a window query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DdwQuery {
    /// Windows the guest can still create.
    pub windows_available: u32,
    /// Page sizes both the backend and the guest support.
    pub page_sizes: DdwPageSizes,
}

/// Default and dynamic DMA windows of one bridge.
#[derive(Debug)]
pub struct DmaWindows {
    default_window: DmaWindow,
    backend: Option<Box<dyn DdwBackend>>,
    // Highest dynamic window number.
    last_id: u32,
    ids: IdAllocator,
    dynamic: BTreeMap<u32, DmaWindow>,
    iommu: IommuRoot,
}

impl DmaWindows {
    /// Creates the default window. `backend` is `None` when dynamic windows are disabled.
    pub fn new(
        default_window: DmaWindow,
        backend: Option<Box<dyn DdwBackend>>,
    ) -> Result<Self, DdwError> {
        let last_id = match backend.as_deref() {
            Some(backend) => backend.query()?.windows_supported.min(DDW_LAST_WINDOW),
            None => 0,
        };
        if default_window.liobn.checked_add(last_id).is_none() {
            return Err(DdwError::LiobnRange(default_window.liobn, last_id));
        }
        let mut iommu = IommuRoot::new();
        iommu.map(default_window.table())?;
        Ok(DmaWindows {
            default_window,
            backend,
            last_id,
            ids: IdAllocator::new(DDW_FIRST_WINDOW, last_id.max(DDW_FIRST_WINDOW))
                .map_err(|err| DdwError::Allocate(0, err))?,
            dynamic: BTreeMap::new(),
            iommu,
        })
    }

    pub fn default_window(&self) -> &DmaWindow {
        &self.default_window
    }

    pub fn ddw_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Number of live dynamic windows.
    pub fn active(&self) -> u32 {
        self.dynamic.len() as u32
    }

    /// Live dynamic windows in LIOBN order.
    pub fn dynamic_windows(&self) -> impl Iterator<Item = &DmaWindow> {
        self.dynamic.values()
    }

    /// LIOBNs reserved for the default and dynamic windows of this bridge.
    pub fn liobn_range(&self) -> std::ops::RangeInclusive<u32> {
        let first = self.default_window.liobn;
        first..=first.saturating_add(self.last_id)
    }

    /// Whether `liobn` names a window of this bridge.
    pub fn owns(&self, liobn: u32) -> bool {
        liobn == self.default_window.liobn || self.dynamic.contains_key(&liobn)
    }

    /// The bridge bus address space.
    pub fn iommu(&self) -> &IommuRoot {
        &self.iommu
    }

    pub fn iommu_mut(&mut self) -> &mut IommuRoot {
        &mut self.iommu
    }

    fn backend(&self) -> Result<&dyn DdwBackend, DdwError> {
        self.backend.as_deref().ok_or(DdwError::Disabled)
    }

    fn backend_mut(&mut self) -> Result<&mut Box<dyn DdwBackend>, DdwError> {
        self.backend.as_mut().ok_or(DdwError::Disabled)
    }

    /// Windows left and usable page sizes given the page sizes of the guest.
    pub fn query(&self, guest_page_sizes: DdwPageSizes) -> Result<DdwQuery, DdwError> {
        let caps = self.backend()?.query()?;
        Ok(DdwQuery {
            windows_available: caps.windows_supported.saturating_sub(self.active()),
            page_sizes: caps.page_sizes & guest_page_sizes,
        })
    }

    /// Creates a dynamic window.
    pub fn create(
        &mut self,
        page_shift: u32,
        window_shift: u32,
        guest_page_sizes: DdwPageSizes,
    ) -> Result<DmaWindow, DdwError> {
        if window_shift < page_shift || window_shift > DDW_MAX_WINDOW_SHIFT {
            return Err(DdwError::InvalidShift(page_shift, window_shift));
        }
        let query = self.query(guest_page_sizes)?;
        if !DdwPageSizes::from_shift(page_shift).is_some_and(|size| query.page_sizes.contains(size))
        {
            return Err(DdwError::PageSizeNotUsable(page_shift));
        }
        if query.windows_available == 0 {
            return Err(DdwError::NoWindowsLeft);
        }
        let window = self.ids.allocate_id().map_err(|_| DdwError::NoWindowsLeft)?;
        let Some(liobn) = self
            .default_window
            .liobn
            .checked_add(window)
            .filter(|_| window <= self.last_id)
        else {
            let _ = self.ids.free_id(window);
            return Err(DdwError::NoWindowsLeft);
        };

        match self.map_window(liobn, page_shift, window_shift, None) {
            Ok(window) => Ok(window),
            Err(err) => {
                // The id was just handed out.
                let _ = self.ids.free_id(window);
                Err(err)
            }
        }
    }

    fn map_window(
        &mut self,
        liobn: u32,
        page_shift: u32,
        window_shift: u32,
        bus_offset: Option<u64>,
    ) -> Result<DmaWindow, DdwError> {
        let backend = self.backend_mut()?;
        let offset = backend.create(page_shift, window_shift, bus_offset)?;
        let window = DmaWindow {
            liobn,
            page_shift,
            window_shift,
            bus_offset: offset,
        };
        if let Some(expected) = bus_offset.filter(|expected| *expected != offset) {
            let _ = backend.remove(offset, window.size());
            return Err(DdwError::OffsetMismatch(expected, offset));
        }
        if let Err(err) = self.iommu.map(window.table()) {
            let _ = self.backend_mut()?.remove(offset, window.size());
            return Err(err.into());
        }
        self.dynamic.insert(liobn, window);
        log::debug!(
            "ddw: created window {liobn:#x} at {offset:#x}, page shift {page_shift}, window shift {window_shift}"
        );
        Ok(window)
    }

    /// Removes the dynamic window `liobn`.
    pub fn remove(&mut self, liobn: u32) -> Result<(), DdwError> {
        if liobn == self.default_window.liobn {
            return Err(DdwError::DefaultWindow(liobn));
        }
        let window = *self
            .dynamic
            .get(&liobn)
            .ok_or(DdwError::UnknownLiobn(liobn))?;
        // Only forget the window once the backend has let go of it.
        self.backend_mut()?
            .remove(window.bus_offset, window.size())?;
        self.iommu.unmap(window.bus_offset);
        self.dynamic.remove(&liobn);
        let _ = self.ids.free_id(liobn - self.default_window.liobn);
        log::debug!("ddw: removed window {liobn:#x}");
        Ok(())
    }

    /// Removes every dynamic window.
    pub fn reset(&mut self) -> Result<(), DdwError> {
        let liobns: Vec<u32> = self.dynamic.keys().copied().collect();
        for liobn in liobns {
            self.remove(liobn)?;
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.reset()?;
        }
        Ok(())
    }

    /// Recreates a window from a migration stream.
    pub fn restore_window(&mut self, window: &DmaWindow) -> Result<(), DdwError> {
        if window.window_shift < window.page_shift || window.window_shift > DDW_MAX_WINDOW_SHIFT {
            return Err(DdwError::InvalidShift(window.page_shift, window.window_shift));
        }
        let id = window
            .liobn
            .checked_sub(self.default_window.liobn)
            .filter(|id| (DDW_FIRST_WINDOW..=self.last_id).contains(id))
            .ok_or(DdwError::UnknownLiobn(window.liobn))?;
        if self.dynamic.contains_key(&window.liobn) {
            return Err(DdwError::UnknownLiobn(window.liobn));
        }
        if self.active() >= self.backend()?.query()?.windows_supported {
            return Err(DdwError::NoWindowsLeft);
        }
        self.map_window(
            window.liobn,
            window.page_shift,
            window.window_shift,
            Some(window.bus_offset),
        )?;
        self.ids.mark_used(id);
        Ok(())
    }
}

trait IdAllocatorExt {
    fn mark_used(&mut self, id: u32);
}

impl IdAllocatorExt for IdAllocator {
    // Allocates ids in order until `id` is taken, then hands back the others.
    fn mark_used(&mut self, id: u32) {
        let mut taken = Vec::new();
        while let Ok(next) = self.allocate_id() {
            if next == id {
                break;
            }
            taken.push(next);
        }
        for other in taken {
            let _ = self.free_id(other);
        }
    }
}

fn guest_page_sizes(machine: &SpaprMachine) -> DdwPageSizes {
    DdwPageSizes::from_shifts(machine.config().guest_page_shifts.iter().copied())
}

// ibm,query-pe-dma-window
pub(crate) fn rtas_ibm_query_pe_dma_window(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(3, 5)?;
    let buid = call.arg64(1);
    let guest_sizes = guest_page_sizes(machine);
    let max_pages = machine.config().ram_size() >> SPAPR_TCE_PAGE_SHIFT;

    let phb = machine.phbs().find_by_buid(buid).ok_or(RtasStatus::ParamError)?;
    let query = phb.dma.query(guest_sizes).map_err(|err| {
        log::debug!("ddw: query on {buid:#x} failed: {err}");
        err.rtas_status()
    })?;

    call.set_ret(1, query.windows_available);
    call.set_ret(2, u32::try_from(max_pages).unwrap_or(u32::MAX));
    call.set_ret(3, query.page_sizes.bits());
    // Page sizes usable for migration.
    call.set_ret(4, query.page_sizes.bits());
    Ok(())
}

// ibm,create-pe-dma-window
pub(crate) fn rtas_ibm_create_pe_dma_window(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(5, 4)?;
    let buid = call.arg64(1);
    let page_shift = call.arg(3);
    let window_shift = call.arg(4);
    let guest_sizes = guest_page_sizes(machine);

    let phb = machine
        .phbs_mut()
        .find_by_buid_mut(buid)
        .ok_or(RtasStatus::ParamError)?;
    let window = phb
        .dma
        .create(page_shift, window_shift, guest_sizes)
        .map_err(|err| {
            log::debug!("ddw: create on {buid:#x} failed: {err}");
            err.rtas_status()
        })?;

    call.set_ret(1, window.liobn);
    call.set_ret64(2, window.bus_offset);
    Ok(())
}

// ibm,remove-pe-dma-window
pub(crate) fn rtas_ibm_remove_pe_dma_window(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(1, 1)?;
    let liobn = call.arg(0);
    let phb = machine
        .phbs_mut()
        .find_by_liobn_mut(liobn)
        .ok_or(RtasStatus::HwError)?;
    phb.dma.remove(liobn).map_err(|err| {
        log::debug!("ddw: remove {liobn:#x} failed: {err}");
        err.rtas_status()
    })
}

// ibm,reset-pe-dma-window
pub(crate) fn rtas_ibm_reset_pe_dma_window(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(3, 1)?;
    let buid = call.arg64(1);
    let phb = machine
        .phbs_mut()
        .find_by_buid_mut(buid)
        .ok_or(RtasStatus::ParamError)?;
    if !phb.dma.ddw_enabled() {
        return Err(RtasStatus::HwError);
    }
    phb.dma.reset().map_err(|err| {
        log::warn!("ddw: reset on {buid:#x} failed: {err}");
        err.rtas_status()
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::config::{SPAPR_PCI_BASE_BUID, PhbConfig};
    use crate::rtas::*;
    use crate::test_utils::{default_machine, default_machine_config, single_region_mem, TEST_MEM_SIZE};

    const LIOBN0: u32 = 0x8000_0000;

    fn default_window() -> DmaWindow {
        DmaWindow {
            liobn: LIOBN0,
            page_shift: 12,
            window_shift: 30,
            bus_offset: 0,
        }
    }

    fn emulated(windows: u32) -> DmaWindows {
        DmaWindows::new(
            default_window(),
            Some(Box::new(EmulatedDdw::new(windows).unwrap())),
        )
        .unwrap()
    }

    fn guest() -> DdwPageSizes {
        DdwPageSizes::from_shifts([12, 16, 24])
    }

    fn buid_args(buid: u64) -> [u32; 3] {
        [0, (buid >> 32) as u32, buid as u32]
    }

    fn run(machine: &mut SpaprMachine, token: u32, args: Vec<u32>, nret: usize) -> RtasCall {
        let mut call = RtasCall::new(token, args, nret);
        dispatch(machine, &mut call);
        call
    }

    #[test]
    fn test_page_size_flags() {
        assert_eq!(DdwPageSizes::from_shift(24), Some(DdwPageSizes::SIZE_16M));
        assert_eq!(DdwPageSizes::from_shift(13), None);
        assert_eq!(DdwPageSizes::from_shifts([12, 16, 24]).bits(), 0x07);
        assert_eq!(
            DdwPageSizes::from_host_bitmap((1 << 12) | (1 << 16) | (1 << 34) | (1 << 20)),
            DdwPageSizes::SIZE_4K | DdwPageSizes::SIZE_64K | DdwPageSizes::SIZE_16G
        );
    }

    #[test]
    fn test_query_counts_active_windows() {
        let mut windows = emulated(2);
        assert_eq!(windows.query(guest()).unwrap().windows_available, 2);
        windows.create(16, 32, guest()).unwrap();
        let query = windows.query(guest()).unwrap();
        assert_eq!(query.windows_available, 1);
        assert_eq!(query.page_sizes.bits(), 0x07);
        // Only sizes the guest can use are reported.
        let query = windows.query(DdwPageSizes::SIZE_4K).unwrap();
        assert_eq!(query.page_sizes, DdwPageSizes::SIZE_4K);
    }

    #[test]
    fn test_create_errors() {
        let mut windows = emulated(1);
        assert!(matches!(
            windows.create(16, 12, guest()),
            Err(DdwError::InvalidShift(16, 12))
        ));
        assert!(matches!(
            windows.create(12, 63, guest()),
            Err(DdwError::InvalidShift(12, 63))
        ));
        assert!(matches!(
            windows.create(24, 30, DdwPageSizes::SIZE_4K),
            Err(DdwError::PageSizeNotUsable(24))
        ));
        assert!(matches!(
            windows.create(25, 30, guest()),
            Err(DdwError::PageSizeNotUsable(25))
        ));
        let window = windows.create(12, 30, guest()).unwrap();
        assert_eq!(window.liobn, LIOBN0 + 1);
        assert_eq!(window.bus_offset, DDW_EMULATED_BUS_BASE);
        assert!(matches!(
            windows.create(12, 30, guest()),
            Err(DdwError::NoWindowsLeft)
        ));

        let mut disabled = DmaWindows::new(default_window(), None).unwrap();
        assert!(matches!(
            disabled.create(12, 30, guest()),
            Err(DdwError::Disabled)
        ));
        assert_eq!(DdwError::Disabled.rtas_status(), RtasStatus::HwError);
        assert_eq!(
            DdwError::NoWindowsLeft.rtas_status(),
            RtasStatus::ParamError
        );
    }

    #[test]
    fn test_liobn_range() {
        let windows = emulated(3);
        assert_eq!(windows.liobn_range(), LIOBN0..=LIOBN0 + 3);
        let disabled = DmaWindows::new(default_window(), None).unwrap();
        assert_eq!(disabled.liobn_range(), LIOBN0..=LIOBN0);

        let top = DmaWindow {
            liobn: u32::MAX,
            ..default_window()
        };
        assert!(matches!(
            DmaWindows::new(top, Some(Box::new(EmulatedDdw::new(1).unwrap()))),
            Err(DdwError::LiobnRange(u32::MAX, 1))
        ));

        let below_top = DmaWindow {
            liobn: u32::MAX - 1,
            ..default_window()
        };
        let mut windows =
            DmaWindows::new(below_top, Some(Box::new(EmulatedDdw::new(1).unwrap()))).unwrap();
        assert_eq!(windows.create(12, 30, guest()).unwrap().liobn, u32::MAX);
        assert!(matches!(
            windows.create(12, 30, guest()),
            Err(DdwError::NoWindowsLeft)
        ));
    }

    #[test]
    fn test_remove() {
        let mut windows = emulated(2);
        let first = windows.create(16, 40, guest()).unwrap();
        let second = windows.create(12, 20, guest()).unwrap();
        assert_eq!(second.liobn, LIOBN0 + 2);
        // Aligned to its own size past the first window.
        assert_eq!(second.bus_offset % (1 << 20), 0);
        assert!(second.bus_offset >= first.bus_offset + first.size());
        assert!(windows.iommu().find(second.liobn).is_some());

        assert!(matches!(
            windows.remove(LIOBN0),
            Err(DdwError::DefaultWindow(LIOBN0))
        ));
        assert!(matches!(
            windows.remove(LIOBN0 + 9),
            Err(DdwError::UnknownLiobn(_))
        ));
        windows.remove(first.liobn).unwrap();
        assert_eq!(windows.active(), 1);
        assert!(windows.iommu().find(first.liobn).is_none());

        // The freed number is handed out again.
        assert_eq!(windows.create(16, 40, guest()).unwrap().liobn, first.liobn);

        windows.reset().unwrap();
        assert_eq!(windows.active(), 0);
        assert_eq!(windows.iommu().len(), 1);
    }

    #[test]
    fn test_restore_window() {
        let mut windows = emulated(2);
        let saved = DmaWindow {
            liobn: LIOBN0 + 2,
            page_shift: 16,
            window_shift: 32,
            bus_offset: DDW_EMULATED_BUS_BASE + (1 << 32),
        };
        windows.restore_window(&saved).unwrap();
        assert_eq!(windows.dynamic_windows().copied().collect::<Vec<_>>(), vec![saved]);
        // Number 2 is taken, so the next window gets 1.
        assert_eq!(windows.create(12, 20, guest()).unwrap().liobn, LIOBN0 + 1);
        assert!(matches!(
            windows.restore_window(&saved),
            Err(DdwError::UnknownLiobn(_))
        ));
    }

    #[test]
    fn test_query_scenario() {
        let mut machine = default_machine();
        let call = run(
            &mut machine,
            RTAS_IBM_QUERY_PE_DMA_WINDOW,
            buid_args(SPAPR_PCI_BASE_BUID).to_vec(),
            5,
        );
        let rets = call.rets();
        assert_eq!(rets[0], 0);
        // No windows yet, so the whole budget is available.
        assert_eq!(rets[1], 1);
        assert_eq!(rets[2], (1 << 20) >> 12);
        let mask = DdwPageSizes::from_bits_truncate(rets[3]);
        assert!(mask.contains(DdwPageSizes::SIZE_4K | DdwPageSizes::SIZE_16M));
        assert_eq!(rets[3], rets[4]);
    }

    #[test]
    fn test_query_large_ram() {
        // 32 TiB is more 4K pages than one return word holds.
        let mut config = default_machine_config();
        config.ram_size_mib = 32 << 20;
        let mut machine = SpaprMachine::new(config, single_region_mem(TEST_MEM_SIZE)).unwrap();
        let call = run(
            &mut machine,
            RTAS_IBM_QUERY_PE_DMA_WINDOW,
            buid_args(SPAPR_PCI_BASE_BUID).to_vec(),
            5,
        );
        assert_eq!(call.status(), 0);
        assert_eq!(call.rets()[2], u32::MAX);
    }

    #[test]
    fn test_rtas_errors() {
        let mut config = default_machine_config();
        config.phbs.push(PhbConfig {
            ddw: false,
            ..PhbConfig::with_index(1)
        });
        let mut machine = SpaprMachine::new(config, single_region_mem(TEST_MEM_SIZE)).unwrap();

        // Unknown bridge.
        let call = run(
            &mut machine,
            RTAS_IBM_QUERY_PE_DMA_WINDOW,
            buid_args(0x1234).to_vec(),
            5,
        );
        assert_eq!(call.status(), RtasStatus::ParamError as i32);

        // Disabled.
        for (token, mut args, nret) in [
            (RTAS_IBM_QUERY_PE_DMA_WINDOW, vec![], 5),
            (RTAS_IBM_CREATE_PE_DMA_WINDOW, vec![12, 20], 4),
            (RTAS_IBM_RESET_PE_DMA_WINDOW, vec![], 1),
        ] {
            let mut full = buid_args(SPAPR_PCI_BASE_BUID + 1).to_vec();
            full.append(&mut args);
            let call = run(&mut machine, token, full, nret);
            assert_eq!(call.status(), RtasStatus::HwError as i32, "{token:#x}");
        }

        // Unknown LIOBN.
        let call = run(&mut machine, RTAS_IBM_REMOVE_PE_DMA_WINDOW, vec![0x8000_0005], 1);
        assert_eq!(call.status(), RtasStatus::HwError as i32);
        // Default window.
        let call = run(&mut machine, RTAS_IBM_REMOVE_PE_DMA_WINDOW, vec![0x8000_0000], 1);
        assert_eq!(call.status(), RtasStatus::ParamError as i32);
        // Wrong counts.
        let call = run(&mut machine, RTAS_IBM_REMOVE_PE_DMA_WINDOW, vec![0x8000_0000], 2);
        assert_eq!(call.status(), RtasStatus::ParamError as i32);
    }

    #[test]
    fn test_rtas_create_reset() {
        let mut machine = default_machine();
        let mut args = buid_args(SPAPR_PCI_BASE_BUID).to_vec();
        args.extend([16, 32]);
        let call = run(&mut machine, RTAS_IBM_CREATE_PE_DMA_WINDOW, args, 4);
        assert_eq!(call.status(), 0);
        assert_eq!(call.rets()[1], LIOBN0 + 1);
        assert_eq!(call.rets()[2], 0x8000_0000);
        assert_eq!(call.rets()[3], 0);

        let call = run(
            &mut machine,
            RTAS_IBM_QUERY_PE_DMA_WINDOW,
            buid_args(SPAPR_PCI_BASE_BUID).to_vec(),
            5,
        );
        assert_eq!(call.rets()[1], 0);

        let call = run(
            &mut machine,
            RTAS_IBM_RESET_PE_DMA_WINDOW,
            buid_args(SPAPR_PCI_BASE_BUID).to_vec(),
            1,
        );
        assert_eq!(call.status(), 0);
        let phb = machine.phbs().find_by_buid(SPAPR_PCI_BASE_BUID).unwrap();
        assert_eq!(phb.dma.active(), 0);
    }

    proptest! {
        #[test]
        fn test_create_remove_round_trip(
            page_shift in prop::sample::select(vec![12u32, 16, 24]),
            extra in 0u32..=38,
        ) {
            let window_shift = page_shift + extra;
            let mut machine = default_machine();
            let mut args = buid_args(SPAPR_PCI_BASE_BUID).to_vec();
            args.extend([page_shift, window_shift]);

            let query = buid_args(SPAPR_PCI_BASE_BUID).to_vec();
            let before = run(&mut machine, RTAS_IBM_QUERY_PE_DMA_WINDOW, query.clone(), 5);
            let created = run(&mut machine, RTAS_IBM_CREATE_PE_DMA_WINDOW, args, 4);
            prop_assert_eq!(created.status(), 0);
            let liobn = created.rets()[1];
            let removed = run(&mut machine, RTAS_IBM_REMOVE_PE_DMA_WINDOW, vec![liobn], 1);
            prop_assert_eq!(removed.status(), 0);
            let after = run(&mut machine, RTAS_IBM_QUERY_PE_DMA_WINDOW, query, 5);
            prop_assert_eq!(before.rets(), after.rets());
        }

        #[test]
        fn test_window_smaller_than_page(
            page_shift in 12u32..=34,
            deficit in 1u32..=12,
        ) {
            let window_shift = page_shift - deficit;
            let mut windows = emulated(1);
            let err = windows.create(page_shift, window_shift, guest()).unwrap_err();
            prop_assert_eq!(err.rtas_status(), RtasStatus::ParamError);
            prop_assert_eq!(windows.active(), 0);
            // No window number was consumed.
            prop_assert_eq!(windows.create(12, 20, guest()).unwrap().liobn, LIOBN0 + 1);
        }
    }
}
