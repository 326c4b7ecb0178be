// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The sPAPR platform context.
//!
//! [`SpaprMachine`] owns everything RTAS handlers touch: the token table, the host bridges,
//! the interrupt source allocator, the platform indicator word and guest memory. The embedding
//! VMM forwards `H_RTAS` hypercalls to [`SpaprMachine::h_rtas`] and drains the queued
//! [`PlatformEvent`]s after each exit.

use std::fmt::Debug;
use std::io::{Read, Write};
use std::sync::Arc;

use semver::Version;
use vm_fdt::FdtWriter;
use vm_memory::{Address, Bytes, GuestAddress, GuestMemoryMmap};

use crate::config::{ConfigError, MachineConfig, PhbBackendConfig, PhbConfig};
use crate::drc::{DrcField, DrcLocation, DrcState};
use crate::hotplug::{self, HotplugAction, HotplugError, UnplugStatus};
use crate::irq::{IrqController, IrqError, XicsIrqAllocator};
use crate::logger::{LOGGER, LoggerUpdateError};
use crate::pci::PciFunction;
use crate::persist::{
    MachineState, MigrationStream, PHB_STATE_V1, PHB_STATE_V2, PHB_STATE_V3, Persist,
    PersistError,
};
use crate::phb::persist::{PhbConstructorArgs, PhbState, PhbStateV1, PhbStateV2, PhbStateV3};
use crate::phb::{PhbError, PhbRegistry, SpaprPhb};
use crate::rtas::*;
use crate::vfio::{SpaprVfioContainer, VfioContainerFd, VfioError};
use crate::{ddw, drc, eeh, msi, phb};

/// Largest `nargs + nret` a PAPR `rtas_args` block holds.
pub const RTAS_ARGS_MAX: u32 = 16;

/// Offset of `args[0]` in a PAPR `rtas_args` block.
const RTAS_ARGS_OFFSET: u64 = 12;

/// Every RTAS call the platform implements.
const RTAS_CALLS: &[(u32, &str, RtasFn)] = &[
    (RTAS_DISPLAY_CHARACTER, "display-character", generic::display_character),
    (RTAS_GET_TIME_OF_DAY, "get-time-of-day", rtc::get_time_of_day),
    (RTAS_SET_TIME_OF_DAY, "set-time-of-day", rtc::set_time_of_day),
    (RTAS_POWER_OFF, "power-off", generic::power_off),
    (RTAS_SYSTEM_REBOOT, "system-reboot", generic::system_reboot),
    (
        RTAS_IBM_GET_SYSTEM_PARAMETER,
        "ibm,get-system-parameter",
        generic::get_system_parameter,
    ),
    (
        RTAS_IBM_SET_SYSTEM_PARAMETER,
        "ibm,set-system-parameter",
        generic::set_system_parameter,
    ),
    (RTAS_IBM_NMI_REGISTER, "ibm,nmi-register", generic::nmi_register),
    (RTAS_IBM_NMI_INTERLOCK, "ibm,nmi-interlock", generic::nmi_interlock),
    (RTAS_READ_PCI_CONFIG, "read-pci-config", phb::rtas_read_pci_config),
    (RTAS_WRITE_PCI_CONFIG, "write-pci-config", phb::rtas_write_pci_config),
    (RTAS_IBM_READ_PCI_CONFIG, "ibm,read-pci-config", phb::rtas_ibm_read_pci_config),
    (RTAS_IBM_WRITE_PCI_CONFIG, "ibm,write-pci-config", phb::rtas_ibm_write_pci_config),
    (
        RTAS_IBM_QUERY_INTERRUPT_SOURCE_NUMBER,
        "ibm,query-interrupt-source-number",
        msi::rtas_ibm_query_interrupt_source_number,
    ),
    (RTAS_IBM_CHANGE_MSI, "ibm,change-msi", msi::rtas_ibm_change_msi),
    (RTAS_SET_INDICATOR, "set-indicator", drc::rtas_set_indicator),
    (RTAS_SET_POWER_LEVEL, "set-power-level", drc::rtas_set_power_level),
    (RTAS_GET_POWER_LEVEL, "get-power-level", drc::rtas_get_power_level),
    (RTAS_GET_SENSOR_STATE, "get-sensor-state", drc::rtas_get_sensor_state),
    (
        RTAS_IBM_CONFIGURE_CONNECTOR,
        "ibm,configure-connector",
        hotplug::rtas_ibm_configure_connector,
    ),
    (RTAS_IBM_OS_TERM, "ibm,os-term", generic::os_term),
    (RTAS_IBM_SET_EEH_OPTION, "ibm,set-eeh-option", eeh::rtas_ibm_set_eeh_option),
    (
        RTAS_IBM_GET_CONFIG_ADDR_INFO2,
        "ibm,get-config-addr-info2",
        eeh::rtas_ibm_get_config_addr_info2,
    ),
    (
        RTAS_IBM_READ_SLOT_RESET_STATE2,
        "ibm,read-slot-reset-state2",
        eeh::rtas_ibm_read_slot_reset_state2,
    ),
    (RTAS_IBM_SET_SLOT_RESET, "ibm,set-slot-reset", eeh::rtas_ibm_set_slot_reset),
    (RTAS_IBM_CONFIGURE_PE, "ibm,configure-pe", eeh::rtas_ibm_configure_pe),
    (
        RTAS_IBM_SLOT_ERROR_DETAIL,
        "ibm,slot-error-detail",
        eeh::rtas_ibm_slot_error_detail,
    ),
    (
        RTAS_IBM_QUERY_PE_DMA_WINDOW,
        "ibm,query-pe-dma-window",
        ddw::rtas_ibm_query_pe_dma_window,
    ),
    (
        RTAS_IBM_CREATE_PE_DMA_WINDOW,
        "ibm,create-pe-dma-window",
        ddw::rtas_ibm_create_pe_dma_window,
    ),
    (
        RTAS_IBM_REMOVE_PE_DMA_WINDOW,
        "ibm,remove-pe-dma-window",
        ddw::rtas_ibm_remove_pe_dma_window,
    ),
    (
        RTAS_IBM_RESET_PE_DMA_WINDOW,
        "ibm,reset-pe-dma-window",
        ddw::rtas_ibm_reset_pe_dma_window,
    ),
];

/// Something the guest asked for that the VMM has to act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformEvent {
    /// power-off.
    PowerOff,
    /// system-reboot.
    Reset,
    /// ibm,os-term.
    GuestPanicked,
    /// The guest moved its clock, `offset` seconds away from host UTC.
    RtcChange {
        /// New guest RTC offset.
        offset: i64,
    },
    /// A connector changed occupancy and the guest should be notified.
    Hotplug {
        /// Whether a function arrived or is leaving.
        action: HotplugAction,
        /// Connector the event is about.
        drc_index: u32,
    },
}

/// Machine construction and management errors.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum MachineError {
    /// Invalid machine configuration: {0}
    Config(#[from] ConfigError),
    /// Cannot apply logger configuration: {0}
    Logger(#[from] LoggerUpdateError),
    /// Cannot register RTAS call: {0}
    Rtas(#[from] RtasError),
    /// Interrupt controller: {0}
    Irq(#[from] IrqError),
    /// PCI host bridge: {0}
    Phb(#[from] PhbError),
    /// Hot-plug: {0}
    Hotplug(#[from] HotplugError),
    /// VFIO: {0}
    Vfio(#[from] VfioError),
    /// Migration: {0}
    Persist(#[from] PersistError),
    /// Cannot write device tree: {0}
    Fdt(#[from] vm_fdt::Error),
}

/// An sPAPR platform: RTAS services over a set of PCI host bridges.
pub struct SpaprMachine {
    config: MachineConfig,
    guest_memory: GuestMemoryMmap,
    rtas: RtasTable,
    phbs: PhbRegistry,
    irq: XicsIrqAllocator,
    platform_state: DrcState,
    rtc_offset: i64,
    mc_in_progress: bool,
    events: Vec<PlatformEvent>,
    console: Option<Box<dyn Write + Send>>,
}

impl Debug for SpaprMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaprMachine")
            .field("config", &self.config)
            .field("rtas", &self.rtas)
            .field("phbs", &self.phbs)
            .field("irq", &self.irq)
            .field("platform_state", &self.platform_state)
            .field("rtc_offset", &self.rtc_offset)
            .field("mc_in_progress", &self.mc_in_progress)
            .field("events", &self.events)
            .field("console", &self.console.is_some())
            .finish_non_exhaustive()
    }
}

impl SpaprMachine {
    // Everything but the bridges.
    fn bare(config: MachineConfig, guest_memory: GuestMemoryMmap) -> Result<Self, MachineError> {
        if let Some(logger) = &config.logger {
            LOGGER.update(logger.clone())?;
        }

        let mut rtas = RtasTable::new();
        for (token, name, handler) in RTAS_CALLS {
            rtas.register(*token, name, *handler)?;
        }

        Ok(SpaprMachine {
            irq: XicsIrqAllocator::new(config.irq_count)?,
            config,
            guest_memory,
            rtas,
            phbs: PhbRegistry::new(),
            platform_state: DrcState::default(),
            rtc_offset: 0,
            mc_in_progress: false,
            events: Vec::new(),
            console: None,
        })
    }

    /// Builds the platform and every bridge listed in `config`.
    pub fn new(config: MachineConfig, guest_memory: GuestMemoryMmap) -> Result<Self, MachineError> {
        let mut machine = Self::bare(config, guest_memory)?;
        for phb in machine.config.phbs.clone() {
            machine.add_phb(&phb).inspect_err(|err| {
                log::error!("pci: cannot create PHB: {err}");
            })?;
        }
        log::info!(
            "rtas: machine ready with {} PHBs and {} RTAS calls",
            machine.phbs.len(),
            machine.rtas.calls().count()
        );
        Ok(machine)
    }

    fn check_buid(&self, config: &PhbConfig) -> Result<(), MachineError> {
        let buid = config.layout()?.buid;
        if self.phbs.find_by_buid(buid).is_some() {
            return Err(PhbError::DuplicateBuid(buid).into());
        }
        Ok(())
    }

    fn insert_phb(
        &mut self,
        config: &PhbConfig,
        container: Option<Arc<dyn SpaprVfioContainer>>,
    ) -> Result<u64, MachineError> {
        let mut phb = SpaprPhb::realize(config, &mut self.irq, container)?;
        if let Err(err) = self.phbs.check_conflicts(&phb) {
            phb.release_lsis(&mut self.irq);
            return Err(err.into());
        }
        let buid = phb.buid();
        self.phbs.add(phb)?;
        Ok(buid)
    }

    fn open_container(&self, iommu_group: u32) -> Result<Arc<dyn SpaprVfioContainer>, VfioError> {
        let container = VfioContainerFd::open_group(iommu_group)?;
        container.register_guest_memory(&self.guest_memory)?;
        Ok(Arc::new(container))
    }

    /// Creates a bridge. VFIO bridges open their IOMMU group here.
    pub fn add_phb(&mut self, config: &PhbConfig) -> Result<u64, MachineError> {
        self.check_buid(config)?;
        let container = match &config.backend {
            PhbBackendConfig::Emulated => None,
            PhbBackendConfig::Vfio { iommu_group } => Some(self.open_container(*iommu_group)?),
        };
        self.insert_phb(config, container)
    }

    /// Creates a VFIO bridge over an already set up container.
    pub fn add_vfio_phb(
        &mut self,
        config: &PhbConfig,
        container: Arc<dyn SpaprVfioContainer>,
    ) -> Result<u64, MachineError> {
        self.check_buid(config)?;
        self.insert_phb(config, Some(container))
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn guest_memory(&self) -> &GuestMemoryMmap {
        &self.guest_memory
    }

    pub fn rtas(&self) -> &RtasTable {
        &self.rtas
    }

    pub fn rtas_mut(&mut self) -> &mut RtasTable {
        &mut self.rtas
    }

    pub fn phbs(&self) -> &PhbRegistry {
        &self.phbs
    }

    pub fn phbs_mut(&mut self) -> &mut PhbRegistry {
        &mut self.phbs
    }

    pub fn irq(&self) -> &XicsIrqAllocator {
        &self.irq
    }

    /// The bridge `buid` together with the interrupt controller its MSIs come from.
    pub fn phb_and_irq_mut(
        &mut self,
        buid: u64,
    ) -> Option<(&mut SpaprPhb, &mut dyn IrqController)> {
        let phb = self.phbs.find_by_buid_mut(buid)?;
        Some((phb, &mut self.irq))
    }

    /// Resolves a slot or PHB connector index.
    pub fn find_drc_mut(&mut self, drc_index: u32) -> Option<(&mut SpaprPhb, DrcLocation)> {
        self.phbs.find_drc_mut(drc_index)
    }

    /// The indicator/sensor word addressed by connector index 0.
    pub fn platform_state_mut(&mut self) -> &mut DrcState {
        &mut self.platform_state
    }

    pub fn rtc_offset(&self) -> i64 {
        self.rtc_offset
    }

    pub fn set_rtc_offset(&mut self, offset: i64) {
        self.rtc_offset = offset;
    }

    pub fn mc_in_progress(&self) -> bool {
        self.mc_in_progress
    }

    pub fn set_mc_in_progress(&mut self, in_progress: bool) {
        self.mc_in_progress = in_progress;
    }

    pub fn push_event(&mut self, event: PlatformEvent) {
        self.events.push(event);
    }

    /// Drains the events queued since the last call.
    pub fn take_events(&mut self) -> Vec<PlatformEvent> {
        std::mem::take(&mut self.events)
    }

    /// Sink for display-character.
    pub fn set_console(&mut self, console: Box<dyn Write + Send>) {
        self.console = Some(console);
    }

    pub fn console_mut(&mut self) -> Option<&mut (dyn Write + Send)> {
        self.console.as_deref_mut().map(|c| c as &mut (dyn Write + Send))
    }

    fn read_be32(&self, addr: GuestAddress) -> Option<u32> {
        self.guest_memory.read_obj::<u32>(addr).ok().map(u32::from_be)
    }

    fn read_words(&self, addr: GuestAddress, count: u32) -> Option<Vec<u32>> {
        (0..u64::from(count))
            .map(|i| self.read_be32(addr.checked_add(i * 4)?))
            .collect()
    }

    fn write_words(&self, addr: GuestAddress, words: &[u32]) -> Option<()> {
        for (i, word) in (0u64..).zip(words) {
            let word_addr = addr.checked_add(i * 4)?;
            self.guest_memory.write_obj(word.to_be(), word_addr).ok()?;
        }
        Some(())
    }

    /// Runs an RTAS call whose arguments and return words live in separate guest buffers.
    pub fn rtas_call(
        &mut self,
        token: u32,
        nargs: u32,
        args_addr: GuestAddress,
        nret: u32,
        rets_addr: GuestAddress,
    ) -> HcallStatus {
        let Some(args) = self.read_words(args_addr, nargs) else {
            log::debug!("rtas: cannot read {nargs} arguments at {:#x}", args_addr.0);
            return HcallStatus::Parameter;
        };
        let mut call = RtasCall::new(token, args, nret as usize);
        let status = dispatch(self, &mut call);
        if self.write_words(rets_addr, call.rets()).is_none() {
            log::debug!("rtas: cannot write {nret} returns at {:#x}", rets_addr.0);
            return HcallStatus::Parameter;
        }
        status
    }

    /// `H_RTAS`: runs the call described by the `rtas_args` block at `rtas_args_addr`.
    pub fn h_rtas(&mut self, rtas_args_addr: GuestAddress) -> HcallStatus {
        let Some([token, nargs, nret]) = self
            .read_words(rtas_args_addr, 3)
            .and_then(|hdr| <[u32; 3]>::try_from(hdr).ok())
        else {
            return HcallStatus::Parameter;
        };
        if nargs.checked_add(nret).is_none_or(|total| total > RTAS_ARGS_MAX) {
            log::debug!("rtas: token {token:#x} overflows the argument block ({nargs}/{nret})");
            return HcallStatus::Parameter;
        }
        let Some(args_addr) = rtas_args_addr.checked_add(RTAS_ARGS_OFFSET) else {
            return HcallStatus::Parameter;
        };
        let rets_addr = args_addr.unchecked_add(u64::from(nargs) * 4);
        self.rtas_call(token, nargs, args_addr, nret, rets_addr)
    }

    /// Plugs a function at runtime. The guest is told through a [`PlatformEvent::Hotplug`].
    pub fn hotplug_add(
        &mut self,
        buid: u64,
        devfn: u8,
        dev: Box<dyn PciFunction>,
    ) -> Result<u32, MachineError> {
        Ok(hotplug::add_device(self, buid, devfn, dev, true)?)
    }

    /// Plugs a function present at boot.
    pub fn coldplug(
        &mut self,
        buid: u64,
        devfn: u8,
        dev: Box<dyn PciFunction>,
    ) -> Result<u32, MachineError> {
        Ok(hotplug::add_device(self, buid, devfn, dev, false)?)
    }

    /// Asks the guest to give up the function in `slot`.
    pub fn hotplug_remove(&mut self, buid: u64, slot: u8) -> Result<UnplugStatus, MachineError> {
        Ok(hotplug::remove_device(self, buid, slot)?)
    }

    /// System reset: bridges drop their MSIs and dynamic windows, and pending EPOW and
    /// machine check state is cleared.
    pub fn reset(&mut self) {
        for phb in self.phbs.iter_mut() {
            phb.reset(&mut self.irq);
        }
        self.platform_state.set(DrcField::Epow, 0);
        self.mc_in_progress = false;
    }

    /// Emits `/rtas` and one node per bridge into the root node being written.
    pub fn write_fdt(
        &self,
        fdt: &mut FdtWriter,
        rtas_addr: u32,
        rtas_size: u32,
    ) -> Result<(), MachineError> {
        self.rtas.write_fdt(fdt, rtas_addr, rtas_size)?;
        for phb in self.phbs.iter() {
            phb.populate_dt(fdt, self.irq.phandle(), self.config.irq_count)?;
        }
        Ok(())
    }

    /// Serializes the platform and bridge state in the `version` layout. Returns the number of
    /// bytes written.
    pub fn save<W: Write>(
        &mut self,
        writer: &mut W,
        version: &Version,
    ) -> Result<usize, MachineError> {
        for phb in self.phbs.iter_mut() {
            phb.msi.fold_legacy(&phb.bus, &mut self.irq);
        }
        let phbs: Vec<PhbState> = self.phbs.iter().map(|phb| phb.save()).collect();
        let state = MachineState {
            rtc_offset: self.rtc_offset,
            platform_state: self.platform_state.0,
            phbs,
        };

        let len = if *version == PHB_STATE_V3 {
            let state = state.try_map(|phb| phb.to_v3())?;
            MigrationStream::save(writer, version, &state)?
        } else if *version == PHB_STATE_V2 {
            let state = state.try_map(|phb| phb.to_v2())?;
            MigrationStream::save(writer, version, &state)?
        } else {
            return Err(PersistError::UnsupportedVersion(version.clone()).into());
        };
        log::info!("pci: saved {} PHBs as v{version}", self.phbs.len());
        Ok(len)
    }

    /// Rebuilds a machine from `config` and a `stream_len` byte migration stream.
    ///
    /// `config` must list the bridges of the source machine in creation order.
    pub fn restore<R: Read>(
        config: MachineConfig,
        guest_memory: GuestMemoryMmap,
        reader: &mut R,
        stream_len: usize,
    ) -> Result<Self, MachineError> {
        let stream = MigrationStream::load(reader, stream_len)?;
        let version = stream.version();
        let state: MachineState<PhbState> = if *version == PHB_STATE_V3 {
            stream
                .decode::<MachineState<PhbStateV3>>()?
                .try_map(PhbState::try_from)?
        } else if *version == PHB_STATE_V2 {
            stream
                .decode::<MachineState<PhbStateV2>>()?
                .try_map(|phb| Ok::<_, PersistError>(PhbState::from(phb)))?
        } else if *version == PHB_STATE_V1 {
            stream
                .decode::<MachineState<PhbStateV1>>()?
                .try_map(|phb| Ok::<_, PersistError>(PhbState::from(phb)))?
        } else {
            return Err(PersistError::UnsupportedVersion(version.clone()).into());
        };
        if state.phbs.len() != config.phbs.len() {
            return Err(PersistError::PhbCount(state.phbs.len(), config.phbs.len()).into());
        }

        let mut machine = Self::bare(config, guest_memory)?;
        for (phb_config, phb_state) in machine.config.phbs.clone().iter().zip(&state.phbs) {
            let container = match &phb_config.backend {
                PhbBackendConfig::Emulated => None,
                PhbBackendConfig::Vfio { iommu_group } => {
                    Some(machine.open_container(*iommu_group)?)
                }
            };
            let phb = SpaprPhb::restore(
                PhbConstructorArgs {
                    config: phb_config,
                    irq: &mut machine.irq,
                    container,
                },
                phb_state,
            )?;
            machine.phbs.add(phb)?;
        }
        machine.rtc_offset = state.rtc_offset;
        machine.platform_state = DrcState(state.platform_state);
        log::info!(
            "pci: restored {} PHBs from a v{} stream",
            machine.phbs.len(),
            stream.version()
        );
        Ok(machine)
    }
}
