// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! RTAS call registry and dispatch.
//!
//! Guests request platform services by issuing the `H_RTAS` hypercall with a pointer to an
//! argument block. The block names a token, which the [`RtasTable`] resolves to a handler.

pub mod generic;
pub mod rtc;

use std::fmt::Debug;

use vm_fdt::{Error as VmFdtError, FdtWriter};

use crate::machine::SpaprMachine;

/// First valid RTAS token.
pub const RTAS_TOKEN_BASE: u32 = 0x2000;

pub const RTAS_DISPLAY_CHARACTER: u32 = RTAS_TOKEN_BASE;
pub const RTAS_GET_TIME_OF_DAY: u32 = RTAS_TOKEN_BASE + 0x01;
pub const RTAS_SET_TIME_OF_DAY: u32 = RTAS_TOKEN_BASE + 0x02;
pub const RTAS_POWER_OFF: u32 = RTAS_TOKEN_BASE + 0x03;
pub const RTAS_SYSTEM_REBOOT: u32 = RTAS_TOKEN_BASE + 0x04;
pub const RTAS_IBM_GET_SYSTEM_PARAMETER: u32 = RTAS_TOKEN_BASE + 0x08;
pub const RTAS_IBM_SET_SYSTEM_PARAMETER: u32 = RTAS_TOKEN_BASE + 0x09;
pub const RTAS_IBM_NMI_REGISTER: u32 = RTAS_TOKEN_BASE + 0x12;
pub const RTAS_IBM_NMI_INTERLOCK: u32 = RTAS_TOKEN_BASE + 0x13;
pub const RTAS_READ_PCI_CONFIG: u32 = RTAS_TOKEN_BASE + 0x14;
pub const RTAS_WRITE_PCI_CONFIG: u32 = RTAS_TOKEN_BASE + 0x15;
pub const RTAS_IBM_READ_PCI_CONFIG: u32 = RTAS_TOKEN_BASE + 0x16;
pub const RTAS_IBM_WRITE_PCI_CONFIG: u32 = RTAS_TOKEN_BASE + 0x17;
pub const RTAS_IBM_QUERY_INTERRUPT_SOURCE_NUMBER: u32 = RTAS_TOKEN_BASE + 0x18;
pub const RTAS_IBM_CHANGE_MSI: u32 = RTAS_TOKEN_BASE + 0x19;
pub const RTAS_SET_INDICATOR: u32 = RTAS_TOKEN_BASE + 0x1A;
pub const RTAS_SET_POWER_LEVEL: u32 = RTAS_TOKEN_BASE + 0x1B;
pub const RTAS_GET_POWER_LEVEL: u32 = RTAS_TOKEN_BASE + 0x1C;
pub const RTAS_GET_SENSOR_STATE: u32 = RTAS_TOKEN_BASE + 0x1D;
pub const RTAS_IBM_CONFIGURE_CONNECTOR: u32 = RTAS_TOKEN_BASE + 0x1E;
pub const RTAS_IBM_OS_TERM: u32 = RTAS_TOKEN_BASE + 0x1F;
pub const RTAS_IBM_SET_EEH_OPTION: u32 = RTAS_TOKEN_BASE + 0x20;
pub const RTAS_IBM_GET_CONFIG_ADDR_INFO2: u32 = RTAS_TOKEN_BASE + 0x21;
pub const RTAS_IBM_READ_SLOT_RESET_STATE2: u32 = RTAS_TOKEN_BASE + 0x22;
pub const RTAS_IBM_SET_SLOT_RESET: u32 = RTAS_TOKEN_BASE + 0x23;
pub const RTAS_IBM_CONFIGURE_PE: u32 = RTAS_TOKEN_BASE + 0x24;
pub const RTAS_IBM_SLOT_ERROR_DETAIL: u32 = RTAS_TOKEN_BASE + 0x25;
pub const RTAS_IBM_QUERY_PE_DMA_WINDOW: u32 = RTAS_TOKEN_BASE + 0x26;
pub const RTAS_IBM_CREATE_PE_DMA_WINDOW: u32 = RTAS_TOKEN_BASE + 0x27;
pub const RTAS_IBM_REMOVE_PE_DMA_WINDOW: u32 = RTAS_TOKEN_BASE + 0x28;
pub const RTAS_IBM_RESET_PE_DMA_WINDOW: u32 = RTAS_TOKEN_BASE + 0x29;

/// One past the last valid RTAS token.
pub const RTAS_TOKEN_MAX: u32 = RTAS_TOKEN_BASE + 0x2A;

/// Token some early Linux debug code uses for display-character without consulting `/rtas`.
pub const RTAS_LEGACY_DISPLAY_CHARACTER: u32 = 0xa;

/// Status word written to `rets[0]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum RtasStatus {
    /// Call completed.
    Success = 0,
    /// The addressed resource failed.
    HwError = -1,
    /// Malformed or out of range request.
    ParamError = -3,
    /// Recognised parameter the platform does not let the guest change.
    NotAuthorized = -9002,
    /// Recognised but unimplemented request.
    NotSupported = -9005,
    /// Error log query found nothing to report.
    NoErrorsFound = 1,
}

impl From<RtasStatus> for u32 {
    fn from(status: RtasStatus) -> u32 {
        status as i32 as u32
    }
}

/// Hypercall level result of an `H_RTAS` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HcallStatus {
    /// A handler ran. Its outcome is in the return buffer.
    Success,
    /// No handler matched the token or the argument block was unreadable.
    Parameter,
}

/// Arguments and return buffer of one RTAS call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RtasCall {
    /// Token the guest used.
    pub token: u32,
    args: Vec<u32>,
    rets: Vec<u32>,
}

impl RtasCall {
    /// Creates a call with `nret` zeroed return words.
    pub fn new(token: u32, args: Vec<u32>, nret: usize) -> Self {
        RtasCall {
            token,
            args,
            rets: vec![0; nret],
        }
    }

    pub fn nargs(&self) -> usize {
        self.args.len()
    }

    pub fn nret(&self) -> usize {
        self.rets.len()
    }

    /// Argument word `idx`, 0 when absent.
    pub fn arg(&self, idx: usize) -> u32 {
        self.args.get(idx).copied().unwrap_or(0)
    }

    /// 64-bit value split over `args[hi]` and `args[hi + 1]`, high word first.
    pub fn arg64(&self, hi: usize) -> u64 {
        (u64::from(self.arg(hi)) << 32) | u64::from(self.arg(hi + 1))
    }

    /// Stores return word `idx`. Words past `nret` are dropped.
    pub fn set_ret(&mut self, idx: usize, value: u32) {
        if let Some(ret) = self.rets.get_mut(idx) {
            *ret = value;
        }
    }

    /// Stores a 64-bit value over `rets[hi]` and `rets[hi + 1]`, high word first.
    pub fn set_ret64(&mut self, hi: usize, value: u64) {
        self.set_ret(hi, (value >> 32) as u32);
        self.set_ret(hi + 1, value as u32);
    }

    pub fn set_status(&mut self, status: RtasStatus) {
        self.set_ret(0, status.into());
    }

    /// Discards any partial result and reports `status`.
    pub fn fail(&mut self, status: RtasStatus) {
        self.rets.iter_mut().for_each(|ret| *ret = 0);
        self.set_status(status);
    }

    /// Return buffer.
    pub fn rets(&self) -> &[u32] {
        &self.rets
    }

    /// Status word as a signed value.
    pub fn status(&self) -> i32 {
        self.rets.first().copied().unwrap_or(0) as i32
    }

    /// Fails with [`RtasStatus::ParamError`] unless the call carries exactly `nargs`
    /// arguments and `nret` return words.
    pub fn expect_counts(&self, nargs: usize, nret: usize) -> Result<(), RtasStatus> {
        if self.nargs() != nargs || self.nret() != nret {
            return Err(RtasStatus::ParamError);
        }
        Ok(())
    }
}

/// An RTAS handler.
///
/// On `Ok` the handler has filled the return buffer, whose status word defaults to
/// [`RtasStatus::Success`]. On `Err` the dispatcher replaces the buffer with the status.
pub type RtasFn = fn(&mut SpaprMachine, &mut RtasCall) -> Result<(), RtasStatus>;

/// Errors raised while building the RTAS table.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum RtasError {
    /// RTAS token {0:#x} is out of range
    InvalidToken(u32),
    /// RTAS call "{1}" is already registered as {0:#x}
    AlreadyRegistered(u32, &'static str),
    /// RTAS token {0:#x} must be registered before a wrong-endian handler
    NoPrimaryHandler(u32),
}

#[derive(Clone, Copy)]
struct RtasEntry {
    name: &'static str,
    handler: RtasFn,
    wrong_endian: Option<RtasFn>,
}

impl Debug for RtasEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RtasEntry")
            .field("name", &self.name)
            .field("wrong_endian", &self.wrong_endian.is_some())
            .finish()
    }
}

/// Token to handler registry, owned by the machine.
#[derive(Debug)]
pub struct RtasTable {
    entries: Vec<Option<RtasEntry>>,
}

impl Default for RtasTable {
    fn default() -> Self {
        Self::new()
    }
}

fn token_slot(token: u32) -> Option<usize> {
    if (RTAS_TOKEN_BASE..RTAS_TOKEN_MAX).contains(&token) {
        Some((token - RTAS_TOKEN_BASE) as usize)
    } else {
        None
    }
}

impl RtasTable {
    pub fn new() -> Self {
        RtasTable {
            entries: vec![None; (RTAS_TOKEN_MAX - RTAS_TOKEN_BASE) as usize],
        }
    }

    /// Binds `handler` to `token` under `name`.
    pub fn register(
        &mut self,
        token: u32,
        name: &'static str,
        handler: RtasFn,
    ) -> Result<(), RtasError> {
        let slot = token_slot(token).ok_or(RtasError::InvalidToken(token))?;
        if let Some(entry) = &self.entries[slot] {
            return Err(RtasError::AlreadyRegistered(token, entry.name));
        }
        self.entries[slot] = Some(RtasEntry {
            name,
            handler,
            wrong_endian: None,
        });
        Ok(())
    }

    /// Binds the handler used when the guest passes `token` byte swapped.
    pub fn register_wrong_endian(&mut self, token: u32, handler: RtasFn) -> Result<(), RtasError> {
        let slot = token_slot(token).ok_or(RtasError::InvalidToken(token))?;
        let entry = self.entries[slot]
            .as_mut()
            .ok_or(RtasError::NoPrimaryHandler(token))?;
        entry.wrong_endian = Some(handler);
        Ok(())
    }

    /// Resolves the handler for a guest supplied token.
    pub fn lookup(&self, token: u32) -> Option<RtasFn> {
        if let Some(entry) = token_slot(token).and_then(|slot| self.entries[slot].as_ref()) {
            return Some(entry.handler);
        }
        if let Some(handler) = token_slot(token.swap_bytes())
            .and_then(|slot| self.entries[slot].as_ref())
            .and_then(|entry| entry.wrong_endian)
        {
            return Some(handler);
        }
        if token == RTAS_LEGACY_DISPLAY_CHARACTER {
            return Some(generic::display_character);
        }
        None
    }

    /// Registered `(name, token)` pairs in token order.
    pub fn calls(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        self.entries
            .iter()
            .zip(RTAS_TOKEN_BASE..)
            .filter_map(|(entry, token)| entry.as_ref().map(|entry| (entry.name, token)))
    }

    /// Emits the `/rtas` node: the firmware blob location and one property per call.
    pub fn write_fdt(
        &self,
        fdt: &mut FdtWriter,
        rtas_addr: u32,
        rtas_size: u32,
    ) -> Result<(), VmFdtError> {
        let node = fdt.begin_node("rtas")?;
        fdt.property_u32("linux,rtas-base", rtas_addr)?;
        fdt.property_u32("linux,rtas-entry", rtas_addr)?;
        fdt.property_u32("rtas-size", rtas_size)?;
        for (name, token) in self.calls() {
            fdt.property_u32(name, token)?;
        }
        fdt.end_node(node)
    }
}

/// Runs `call` against `machine`, always leaving a status in `rets[0]`.
pub fn dispatch(machine: &mut SpaprMachine, call: &mut RtasCall) -> HcallStatus {
    let Some(handler) = machine.rtas().lookup(call.token) else {
        log::debug!("rtas: unknown token {:#x}", call.token);
        call.fail(RtasStatus::ParamError);
        return HcallStatus::Parameter;
    };
    if let Err(status) = handler(machine, call) {
        log::trace!("rtas: token {:#x} failed with {:?}", call.token, status);
        call.fail(status);
    }
    HcallStatus::Success
}
