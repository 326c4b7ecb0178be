// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host IOMMU backed bridges.
//!
//! A bridge passing through a host IOMMU group owns a VFIO container using the sPAPR TCE v2
//! IOMMU. DMA windows are created and removed by the host kernel and EEH operations are
//! forwarded to the host PE.

use std::fmt::Debug;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use vm_memory::{GuestMemory, GuestMemoryMmap, GuestMemoryRegion, MemoryRegionAddress};
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ref, ioctl_with_val};
use vmm_sys_util::ioctl_io_nr;

use crate::ddw::{DdwBackend, DdwCapabilities, DdwError, DdwPageSizes};
use crate::eeh::{EehBackend, EehError, EehInjection, EehOption, SlotReset};
use crate::pci::{PCI_MSIX_FLAGS, PCI_MSIX_FLAGS_ENABLE, PciBus};

const VFIO_TYPE: u32 = b';' as u32;
const VFIO_API_VERSION: i32 = 0;
const VFIO_SPAPR_TCE_V2_IOMMU: u64 = 7;
/// Host reports dynamic DMA window support.
pub const VFIO_IOMMU_SPAPR_INFO_DDW: u32 = 1;

ioctl_io_nr!(VFIO_GET_API_VERSION, VFIO_TYPE, 100);
ioctl_io_nr!(VFIO_CHECK_EXTENSION, VFIO_TYPE, 101);
ioctl_io_nr!(VFIO_SET_IOMMU, VFIO_TYPE, 102);
ioctl_io_nr!(VFIO_GROUP_SET_CONTAINER, VFIO_TYPE, 104);
ioctl_io_nr!(VFIO_IOMMU_SPAPR_TCE_GET_INFO, VFIO_TYPE, 112);
ioctl_io_nr!(VFIO_IOMMU_ENABLE, VFIO_TYPE, 115);
ioctl_io_nr!(VFIO_IOMMU_SPAPR_REGISTER_MEMORY, VFIO_TYPE, 117);
ioctl_io_nr!(VFIO_IOMMU_SPAPR_TCE_CREATE, VFIO_TYPE, 119);
ioctl_io_nr!(VFIO_IOMMU_SPAPR_TCE_REMOVE, VFIO_TYPE, 120);
ioctl_io_nr!(VFIO_EEH_PE_OP, VFIO_TYPE, 121);

pub const VFIO_EEH_PE_DISABLE: u32 = 0;
pub const VFIO_EEH_PE_ENABLE: u32 = 1;
pub const VFIO_EEH_PE_UNFREEZE_IO: u32 = 2;
pub const VFIO_EEH_PE_UNFREEZE_DMA: u32 = 3;
pub const VFIO_EEH_PE_GET_STATE: u32 = 4;
pub const VFIO_EEH_PE_RESET_DEACTIVATE: u32 = 5;
pub const VFIO_EEH_PE_RESET_HOT: u32 = 6;
pub const VFIO_EEH_PE_RESET_FUNDAMENTAL: u32 = 7;
pub const VFIO_EEH_PE_CONFIGURE: u32 = 8;
pub const VFIO_EEH_PE_INJECT_ERR: u32 = 9;

/// Largest number of TCE table levels the host kernel builds.
pub const VFIO_TCE_MAX_LEVELS: u32 = 4;
// Each table level indexes this many host pages of the level below.
const TCE_LEVEL_FANOUT: u64 = 64;

/// VFIO container errors.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum VfioError {
    /// Cannot open {0}: {1}
    Open(String, std::io::Error),
    /// Unsupported VFIO API version {0}
    ApiVersion(i32),
    /// Host does not support the sPAPR TCE v2 IOMMU
    NoSpaprTceV2,
    /// Cannot attach the group to the container: {0}
    SetContainer(std::io::Error),
    /// Cannot select the sPAPR IOMMU: {0}
    SetIommu(std::io::Error),
    /// Cannot enable the IOMMU: {0}
    Enable(std::io::Error),
    /// Cannot read TCE capabilities: {0}
    TceInfo(std::io::Error),
    /// Cannot create a DMA window: {0}
    TceCreate(std::io::Error),
    /// Cannot remove a DMA window: {0}
    TceRemove(std::io::Error),
    /// A {0} level TCE table exceeds the host limit of {1}
    TooManyLevels(u32, u32),
    /// Cannot register guest memory: {0}
    RegisterMemory(std::io::Error),
    /// EEH PE operation {0} failed: {1}
    EehPeOp(u32, std::io::Error),
}

/// TCE capabilities of a container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TceInfo {
    /// Bus address of the default 32-bit window.
    pub dma32_start: u64,
    /// Size of the default 32-bit window.
    pub dma32_size: u64,
    /// Whether the host supports dynamic windows.
    pub ddw: bool,
    /// Host page size bitmap, bit `n` for `1 << n` bytes.
    pub pgsizes: u64,
    pub max_dynamic_windows: u32,
    /// Deepest TCE table the host can build.
    pub levels: u32,
}

/// Error injection request for [`SpaprVfioContainer::eeh_inject_error`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VfioEehPeErr {
    pub err_type: u32,
    pub func: u32,
    pub addr: u64,
    pub mask: u64,
}

/// The container operations a VFIO bridge relies on.
pub trait SpaprVfioContainer: Debug + Send + Sync {
    /// `VFIO_IOMMU_SPAPR_TCE_GET_INFO`.
    fn tce_info(&self) -> Result<TceInfo, VfioError>;
    /// `VFIO_IOMMU_SPAPR_TCE_CREATE`, returning the bus address of the new window.
    fn tce_create(&self, page_shift: u32, window_size: u64, levels: u32) -> Result<u64, VfioError>;
    /// `VFIO_IOMMU_SPAPR_TCE_REMOVE`.
    fn tce_remove(&self, start_addr: u64) -> Result<(), VfioError>;
    /// `VFIO_EEH_PE_OP`, returning the ioctl result.
    fn eeh_pe_op(&self, op: u32) -> Result<i32, VfioError>;
    /// `VFIO_EEH_PE_OP` with `VFIO_EEH_PE_INJECT_ERR`.
    fn eeh_inject_error(&self, err: VfioEehPeErr) -> Result<i32, VfioError>;
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioIommuSpaprTceDdwInfo {
    pgsizes: u64,
    max_dynamic_windows_supported: u32,
    levels: u32,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioIommuSpaprTceInfo {
    argsz: u32,
    flags: u32,
    dma32_window_start: u32,
    dma32_window_size: u32,
    ddw: VfioIommuSpaprTceDdwInfo,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioIommuSpaprTceCreate {
    argsz: u32,
    flags: u32,
    page_shift: u32,
    resv1: u32,
    window_size: u64,
    levels: u32,
    resv2: u32,
    start_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioIommuSpaprTceRemove {
    argsz: u32,
    flags: u32,
    start_addr: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioIommuSpaprRegisterMemory {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    size: u64,
}

#[repr(C)]
#[derive(Debug, Default)]
struct VfioEehPeOp {
    argsz: u32,
    flags: u32,
    op: u32,
    err: VfioEehPeErr,
}

fn argsz<T>() -> u32 {
    std::mem::size_of::<T>() as u32
}

/// A VFIO container file descriptor with one group attached.
#[derive(Debug)]
pub struct VfioContainerFd {
    container: File,
    // Kept open so the group stays attached.
    _group: File,
}

fn open_rw(path: &str) -> Result<File, VfioError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| VfioError::Open(path.to_string(), err))
}

fn check_ret(ret: i32) -> std::io::Result<i32> {
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(ret)
}

impl VfioContainerFd {
    /// Opens `/dev/vfio/<iommu_group>` into a new sPAPR TCE v2 container.
    pub fn open_group(iommu_group: u32) -> Result<Self, VfioError> {
        let container = open_rw("/dev/vfio/vfio")?;

        // SAFETY: the fd is valid and the ioctl takes no argument.
        let version = unsafe { ioctl(&container, VFIO_GET_API_VERSION()) };
        if version != VFIO_API_VERSION {
            return Err(VfioError::ApiVersion(version));
        }
        // SAFETY: the fd is valid and the argument is passed by value.
        let ret = unsafe {
            ioctl_with_val(&container, VFIO_CHECK_EXTENSION(), VFIO_SPAPR_TCE_V2_IOMMU)
        };
        if ret <= 0 {
            return Err(VfioError::NoSpaprTceV2);
        }

        let group = open_rw(&format!("/dev/vfio/{iommu_group}"))?;
        let container_fd = container.as_raw_fd();
        // SAFETY: both fds are valid and the kernel only reads the container fd.
        let ret = unsafe { ioctl_with_ref(&group, VFIO_GROUP_SET_CONTAINER(), &container_fd) };
        check_ret(ret).map_err(VfioError::SetContainer)?;

        // SAFETY: the fd is valid and the argument is passed by value.
        let ret = unsafe { ioctl_with_val(&container, VFIO_SET_IOMMU(), VFIO_SPAPR_TCE_V2_IOMMU) };
        check_ret(ret).map_err(VfioError::SetIommu)?;
        // SAFETY: the fd is valid and the ioctl takes no argument.
        let ret = unsafe { ioctl(&container, VFIO_IOMMU_ENABLE()) };
        check_ret(ret).map_err(VfioError::Enable)?;

        log::info!("vfio: IOMMU group {iommu_group} attached to a sPAPR TCE v2 container");
        Ok(VfioContainerFd {
            container,
            _group: group,
        })
    }

    /// Pre-registers every guest RAM region so the host can pin it for TCE mappings.
    pub fn register_guest_memory(&self, guest_memory: &GuestMemoryMmap) -> Result<(), VfioError> {
        for region in guest_memory.iter() {
            let vaddr = region
                .get_host_address(MemoryRegionAddress(0))
                .map_err(|_| {
                    VfioError::RegisterMemory(std::io::Error::from_raw_os_error(libc::EFAULT))
                })?;
            let mut reg = VfioIommuSpaprRegisterMemory {
                argsz: argsz::<VfioIommuSpaprRegisterMemory>(),
                flags: 0,
                vaddr: vaddr as u64,
                size: region.len(),
            };
            // SAFETY: the fd is valid and `reg` matches the kernel layout.
            let ret = unsafe {
                ioctl_with_mut_ref(&self.container, VFIO_IOMMU_SPAPR_REGISTER_MEMORY(), &mut reg)
            };
            check_ret(ret).map_err(VfioError::RegisterMemory)?;
        }
        Ok(())
    }

    fn pe_op(&self, mut op: VfioEehPeOp) -> Result<i32, VfioError> {
        let code = op.op;
        // SAFETY: the fd is valid and `op` matches the kernel layout.
        let ret = unsafe { ioctl_with_mut_ref(&self.container, VFIO_EEH_PE_OP(), &mut op) };
        check_ret(ret).map_err(|err| VfioError::EehPeOp(code, err))
    }
}

impl SpaprVfioContainer for VfioContainerFd {
    fn tce_info(&self) -> Result<TceInfo, VfioError> {
        let mut info = VfioIommuSpaprTceInfo {
            argsz: argsz::<VfioIommuSpaprTceInfo>(),
            ..Default::default()
        };
        // SAFETY: the fd is valid and `info` matches the kernel layout.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.container, VFIO_IOMMU_SPAPR_TCE_GET_INFO(), &mut info)
        };
        check_ret(ret).map_err(VfioError::TceInfo)?;
        Ok(TceInfo {
            dma32_start: u64::from(info.dma32_window_start),
            dma32_size: u64::from(info.dma32_window_size),
            ddw: info.flags & VFIO_IOMMU_SPAPR_INFO_DDW != 0,
            pgsizes: info.ddw.pgsizes,
            max_dynamic_windows: info.ddw.max_dynamic_windows_supported,
            levels: info.ddw.levels,
        })
    }

    fn tce_create(&self, page_shift: u32, window_size: u64, levels: u32) -> Result<u64, VfioError> {
        let mut create = VfioIommuSpaprTceCreate {
            argsz: argsz::<VfioIommuSpaprTceCreate>(),
            page_shift,
            window_size,
            levels,
            ..Default::default()
        };
        // SAFETY: the fd is valid and `create` matches the kernel layout.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.container, VFIO_IOMMU_SPAPR_TCE_CREATE(), &mut create)
        };
        check_ret(ret).map_err(VfioError::TceCreate)?;
        Ok(create.start_addr)
    }

    fn tce_remove(&self, start_addr: u64) -> Result<(), VfioError> {
        let mut remove = VfioIommuSpaprTceRemove {
            argsz: argsz::<VfioIommuSpaprTceRemove>(),
            flags: 0,
            start_addr,
        };
        // SAFETY: the fd is valid and `remove` matches the kernel layout.
        let ret = unsafe {
            ioctl_with_mut_ref(&self.container, VFIO_IOMMU_SPAPR_TCE_REMOVE(), &mut remove)
        };
        check_ret(ret).map_err(VfioError::TceRemove)?;
        Ok(())
    }

    fn eeh_pe_op(&self, op: u32) -> Result<i32, VfioError> {
        self.pe_op(VfioEehPeOp {
            argsz: argsz::<VfioEehPeOp>(),
            op,
            ..Default::default()
        })
    }

    fn eeh_inject_error(&self, err: VfioEehPeErr) -> Result<i32, VfioError> {
        self.pe_op(VfioEehPeOp {
            argsz: argsz::<VfioEehPeOp>(),
            flags: 0,
            op: VFIO_EEH_PE_INJECT_ERR,
            err,
        })
    }
}

/// Table depth the host needs for `entries` TCEs given its page size.
pub fn tce_table_levels(entries: u64, host_page_size: u64) -> u32 {
    let pages = entries.saturating_mul(8) / host_page_size.max(1);
    if pages <= TCE_LEVEL_FANOUT {
        1
    } else if pages <= TCE_LEVEL_FANOUT.pow(2) {
        2
    } else if pages <= TCE_LEVEL_FANOUT.pow(3) {
        3
    } else {
        VFIO_TCE_MAX_LEVELS
    }
}

/// Host page size.
pub fn host_page_size() -> u64 {
    // SAFETY: sysconf has no memory safety requirements.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(size).unwrap_or(4096)
}

/// Dynamic windows created by the host IOMMU.
#[derive(Debug)]
pub struct VfioDdw {
    container: Arc<dyn SpaprVfioContainer>,
    info: TceInfo,
    host_page_size: u64,
}

impl VfioDdw {
    /// `info` must come from the same container.
    pub fn new(container: Arc<dyn SpaprVfioContainer>, info: TceInfo) -> Self {
        VfioDdw {
            container,
            info,
            host_page_size: host_page_size(),
        }
    }
}

impl DdwBackend for VfioDdw {
    fn query(&self) -> Result<DdwCapabilities, DdwError> {
        Ok(DdwCapabilities {
            windows_supported: self.info.max_dynamic_windows,
            page_sizes: DdwPageSizes::from_host_bitmap(self.info.pgsizes),
        })
    }

    fn create(
        &mut self,
        page_shift: u32,
        window_shift: u32,
        _bus_offset: Option<u64>,
    ) -> Result<u64, DdwError> {
        let window_size = 1u64 << window_shift;
        let levels = tce_table_levels(window_size >> page_shift, self.host_page_size);
        if levels > self.info.levels {
            return Err(VfioError::TooManyLevels(levels, self.info.levels).into());
        }
        let start = self.container.tce_create(page_shift, window_size, levels)?;
        log::debug!(
            "vfio: window at {start:#x}, page shift {page_shift}, size {window_size:#x}, {levels} level(s)"
        );
        Ok(start)
    }

    fn remove(&mut self, bus_offset: u64, _window_size: u64) -> Result<(), DdwError> {
        self.container.tce_remove(bus_offset)?;
        Ok(())
    }
}

/// EEH forwarded to the host PE.
#[derive(Debug)]
pub struct VfioEeh {
    container: Arc<dyn SpaprVfioContainer>,
}

impl VfioEeh {
    pub fn new(container: Arc<dyn SpaprVfioContainer>) -> Self {
        VfioEeh { container }
    }

    fn op(&self, op: u32) -> Result<i32, EehError> {
        Ok(self.container.eeh_pe_op(op)?)
    }
}

// The host resets the MSI-X table, so the enable bit and the cached table must be cleared
// for the guest to re-enable vectors afterwards.
fn clear_msix(bus: &mut PciBus) {
    for (devfn, dev) in bus.iter_mut() {
        if !dev.is_vfio() {
            continue;
        }
        if let Some(cap) = dev.msix_cap_offset() {
            let offset = cap + PCI_MSIX_FLAGS;
            let flags = dev.read_config(offset, 2);
            if flags & PCI_MSIX_FLAGS_ENABLE != 0 {
                dev.write_config(offset, 2, flags & !PCI_MSIX_FLAGS_ENABLE);
            }
        }
        dev.msix_reset();
        log::trace!("vfio: cleared MSI-X of {devfn:#x} before reset");
    }
}

impl EehBackend for VfioEeh {
    fn set_option(&mut self, option: EehOption) -> Result<(), EehError> {
        let op = match option {
            EehOption::Disable => VFIO_EEH_PE_DISABLE,
            EehOption::Enable => VFIO_EEH_PE_ENABLE,
            EehOption::ThawIo => VFIO_EEH_PE_UNFREEZE_IO,
            EehOption::ThawDma => VFIO_EEH_PE_UNFREEZE_DMA,
        };
        self.op(op)?;
        Ok(())
    }

    fn get_state(&mut self) -> Result<u32, EehError> {
        Ok(self.op(VFIO_EEH_PE_GET_STATE)? as u32)
    }

    fn reset(&mut self, option: SlotReset, bus: &mut PciBus) -> Result<(), EehError> {
        let op = match option {
            SlotReset::Deactivate => VFIO_EEH_PE_RESET_DEACTIVATE,
            SlotReset::Hot => {
                clear_msix(bus);
                VFIO_EEH_PE_RESET_HOT
            }
            SlotReset::Fundamental => {
                clear_msix(bus);
                VFIO_EEH_PE_RESET_FUNDAMENTAL
            }
        };
        self.op(op)?;
        Ok(())
    }

    fn configure(&mut self) -> Result<(), EehError> {
        self.op(VFIO_EEH_PE_CONFIGURE)?;
        Ok(())
    }

    fn inject_error(&mut self, injection: EehInjection) -> Result<(), EehError> {
        self.container.eeh_inject_error(VfioEehPeErr {
            err_type: injection.err_type(),
            func: injection.func,
            addr: injection.addr,
            mask: injection.mask,
        })?;
        Ok(())
    }

    fn reenable(&mut self) {
        // A PE left frozen by the previous boot is thawed by enabling it again.
        if let Err(err) = self.op(VFIO_EEH_PE_ENABLE) {
            log::warn!("vfio: cannot re-enable EEH: {err}");
        }
    }
}
