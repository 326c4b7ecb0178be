// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Enhanced Error Handling.
//!
//! Every bridge forms a single partitionable endpoint (PE). The guest freezes, thaws, resets
//! and reconfigures it through the EEH RTAS calls, which are forwarded to the bridge backend.

use std::fmt::Debug;

use crate::machine::SpaprMachine;
use crate::pci::{ConfigAddress, PciBus};
use crate::rtas::{RtasCall, RtasStatus};
use crate::vfio::VfioError;

/// Highest error function accepted for injection.
pub const EEH_ERR_FUNC_MAX: u32 = 26;
/// Injection type for 32-bit addresses, as understood by the host.
pub const EEH_ERR_TYPE_32: u32 = 0;
/// Injection type for 64-bit addresses, as understood by the host.
pub const EEH_ERR_TYPE_64: u32 = 1;

const RTAS_GET_PE_ADDR: u32 = 0;
const RTAS_GET_PE_MODE: u32 = 1;
const RTAS_PE_MODE_SHARED: u32 = 2;
const RTAS_EEH_SUPPORT: u32 = 1;
// Milliseconds the guest should wait when the PE is temporarily unavailable.
const RTAS_EEH_PE_UNAVAIL_INFO: u32 = 1000;
const RTAS_EEH_PE_RECOVER_INFO: u32 = 0;
const RTAS_SLOT_TEMP_ERR_LOG: u32 = 1;
const RTAS_SLOT_PERM_ERR_LOG: u32 = 2;

/// PE state reported by an always healthy backend.
pub const EEH_PE_STATE_NORMAL: u32 = 0;

/// ibm,set-eeh-option options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EehOption {
    Disable,
    Enable,
    ThawIo,
    ThawDma,
}

impl EehOption {
    pub fn from_raw(option: u32) -> Option<EehOption> {
        match option {
            0 => Some(EehOption::Disable),
            1 => Some(EehOption::Enable),
            2 => Some(EehOption::ThawIo),
            3 => Some(EehOption::ThawDma),
            _ => None,
        }
    }
}

/// ibm,set-slot-reset options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotReset {
    /// Releases the PE from reset.
    Deactivate,
    Hot,
    Fundamental,
}

impl SlotReset {
    pub fn from_raw(option: u32) -> Option<SlotReset> {
        match option {
            0 => Some(SlotReset::Deactivate),
            1 => Some(SlotReset::Hot),
            3 => Some(SlotReset::Fundamental),
            _ => None,
        }
    }
}

/// An error to inject into a PE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EehInjection {
    /// Error function, up to [`EEH_ERR_FUNC_MAX`].
    pub func: u32,
    pub addr: u64,
    pub mask: u64,
    /// Whether `addr` and `mask` are 64-bit.
    pub is_64bit: bool,
}

impl EehInjection {
    /// Type code passed to the host.
    pub fn err_type(&self) -> u32 {
        if self.is_64bit {
            EEH_ERR_TYPE_64
        } else {
            EEH_ERR_TYPE_32
        }
    }

    fn validate(&self) -> Result<(), EehError> {
        if self.func > EEH_ERR_FUNC_MAX {
            return Err(EehError::InvalidFunction(self.func));
        }
        Ok(())
    }
}

/// EEH errors.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum EehError {
    /// Error function {0} is out of range
    InvalidFunction(u32),
    /// No bridge with BUID {0:#x}
    UnknownBuid(u64),
    /// VFIO: {0}
    Vfio(#[from] VfioError),
}

/// PE operations of one bridge.
pub trait EehBackend: Debug + Send {
    fn set_option(&mut self, option: EehOption) -> Result<(), EehError>;
    /// Current PE state word.
    fn get_state(&mut self) -> Result<u32, EehError>;
    /// Resets the PE. `bus` is the bridge bus, for backends that must quiesce functions first.
    fn reset(&mut self, option: SlotReset, bus: &mut PciBus) -> Result<(), EehError>;
    fn configure(&mut self) -> Result<(), EehError>;
    fn inject_error(&mut self, injection: EehInjection) -> Result<(), EehError>;
    /// Brings the PE back to a usable state after a bridge reset.
    fn reenable(&mut self) {}
}

/// Backend of emulated bridges: the PE never fails.
#[derive(Debug, Default)]
pub struct EmulatedEeh;

impl EehBackend for EmulatedEeh {
    fn set_option(&mut self, _option: EehOption) -> Result<(), EehError> {
        Ok(())
    }

    fn get_state(&mut self) -> Result<u32, EehError> {
        Ok(EEH_PE_STATE_NORMAL)
    }

    fn reset(&mut self, _option: SlotReset, _bus: &mut PciBus) -> Result<(), EehError> {
        Ok(())
    }

    fn configure(&mut self) -> Result<(), EehError> {
        Ok(())
    }

    fn inject_error(&mut self, injection: EehInjection) -> Result<(), EehError> {
        log::debug!("eeh: ignoring injection of function {} on an emulated PE", injection.func);
        Ok(())
    }
}

/// Injects an error into the PE of the bridge `buid`.
pub fn inject_error(
    machine: &mut SpaprMachine,
    buid: u64,
    injection: EehInjection,
) -> Result<(), EehError> {
    injection.validate()?;
    let phb = machine
        .phbs_mut()
        .find_by_buid_mut(buid)
        .ok_or(EehError::UnknownBuid(buid))?;
    phb.eeh.inject_error(injection)?;
    log::info!(
        "eeh: injected function {} at {:#x}/{:#x} on {buid:#x}",
        injection.func,
        injection.addr,
        injection.mask
    );
    Ok(())
}

fn backend_failed(buid: u64, err: EehError) -> RtasStatus {
    log::warn!("eeh: operation on {buid:#x} failed: {err}");
    RtasStatus::HwError
}

// ibm,set-eeh-option
pub(crate) fn rtas_ibm_set_eeh_option(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(4, 1)?;
    let addr = ConfigAddress(call.arg(0));
    let buid = call.arg64(1);
    let option = EehOption::from_raw(call.arg(3)).ok_or(RtasStatus::ParamError)?;

    if option == EehOption::Enable && machine.phbs().find_device(buid, addr).is_none() {
        return Err(RtasStatus::ParamError);
    }
    let phb = machine
        .phbs_mut()
        .find_by_buid_mut(buid)
        .ok_or(RtasStatus::ParamError)?;
    phb.eeh
        .set_option(option)
        .map_err(|err| backend_failed(buid, err))
}

// ibm,get-config-addr-info2
pub(crate) fn rtas_ibm_get_config_addr_info2(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(4, 2)?;
    let addr = ConfigAddress(call.arg(0));
    let buid = call.arg64(1);
    let option = call.arg(3);

    if machine.phbs().find_by_buid(buid).is_none() {
        return Err(RtasStatus::ParamError);
    }
    if option != RTAS_GET_PE_ADDR && option != RTAS_GET_PE_MODE {
        return Err(RtasStatus::ParamError);
    }
    if machine.phbs().find_device(buid, addr).is_none() {
        return Err(RtasStatus::ParamError);
    }

    if option == RTAS_GET_PE_ADDR {
        // Bus level PE. Address 0 may look invalid to the guest, hence the +1.
        call.set_ret(1, (u32::from(addr.bus()) << 16) + 1);
    } else {
        call.set_ret(1, RTAS_PE_MODE_SHARED);
    }
    Ok(())
}

// ibm,read-slot-reset-state2
pub(crate) fn rtas_ibm_read_slot_reset_state2(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    if call.nargs() != 3 || (call.nret() != 4 && call.nret() != 5) {
        return Err(RtasStatus::ParamError);
    }
    let buid = call.arg64(1);
    let phb = machine
        .phbs_mut()
        .find_by_buid_mut(buid)
        .ok_or(RtasStatus::ParamError)?;
    let state = phb
        .eeh
        .get_state()
        .map_err(|err| backend_failed(buid, err))?;

    call.set_ret(1, state);
    call.set_ret(2, RTAS_EEH_SUPPORT);
    call.set_ret(3, RTAS_EEH_PE_UNAVAIL_INFO);
    call.set_ret(4, RTAS_EEH_PE_RECOVER_INFO);
    Ok(())
}

// ibm,set-slot-reset
pub(crate) fn rtas_ibm_set_slot_reset(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(4, 1)?;
    let buid = call.arg64(1);
    let option = SlotReset::from_raw(call.arg(3)).ok_or(RtasStatus::ParamError)?;
    let phb = machine
        .phbs_mut()
        .find_by_buid_mut(buid)
        .ok_or(RtasStatus::ParamError)?;
    phb.eeh
        .reset(option, &mut phb.bus)
        .map_err(|err| backend_failed(buid, err))
}

// ibm,configure-pe
pub(crate) fn rtas_ibm_configure_pe(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(3, 1)?;
    let buid = call.arg64(1);
    let phb = machine
        .phbs_mut()
        .find_by_buid_mut(buid)
        .ok_or(RtasStatus::ParamError)?;
    phb.eeh.configure().map_err(|err| backend_failed(buid, err))
}

// ibm,slot-error-detail
pub(crate) fn rtas_ibm_slot_error_detail(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(8, 1)?;
    let buid = call.arg64(1);
    if machine.phbs().find_by_buid(buid).is_none() {
        return Err(RtasStatus::ParamError);
    }
    match call.arg(7) {
        RTAS_SLOT_TEMP_ERR_LOG | RTAS_SLOT_PERM_ERR_LOG => {
            // No error log is kept, so there is never anything to report.
            call.set_status(RtasStatus::NoErrorsFound);
            Ok(())
        }
        _ => Err(RtasStatus::ParamError),
    }
}
