// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Platform level RTAS calls: console, power, system parameters and machine check setup.

use std::io::Write;

use vm_memory::{Bytes, GuestAddress};

use crate::machine::{PlatformEvent, SpaprMachine};
use crate::rtas::{RtasCall, RtasStatus};

/// Processor module information.
pub const RTAS_SYSPARM_SPLPAR_CHARACTERISTICS: u32 = 20;
/// Diagnostics run mode.
pub const RTAS_SYSPARM_DIAGNOSTICS_RUN_MODE: u32 = 42;
/// Partition UUID.
pub const RTAS_SYSPARM_UUID: u32 = 48;

/// Hypercall the NMI trampoline uses to report a machine check.
pub const H_REPORT_MC_ERR: u32 = 0xf003;
/// Guest address of the system reset / machine check vector.
pub const MC_VECTOR_ADDR: u64 = 0x200;
// Handler addresses must be reachable by a relative branch.
const NMI_HANDLER_MASK: u32 = 0xfc00_0000;

// Machine check vector. Word 2 loads the hypercall number and word 14 branches to the guest
// handler; both are patched at registration.
const NMI_TRAMPOLINE: [u32; 16] = [
    0x7c72_43a6, // mtsprg 2,r3
    0x3860_0000, // li r3,0
    0x6063_0000, // ori r3,r3,H_REPORT_MC_ERR
    0x4400_0022, // sc 1
    0x2fa3_0000, // cmpdi cr7,r3,0
    0x409e_0008, // bne cr7,1f
    0x4800_020a, // ba 0x208
    0x7c92_43a6, // 1: mtsprg 2,r4
    0xe883_0000, // ld r4,0(r3)
    0x7c9a_03a6, // mtsrr0 r4
    0xe883_0008, // ld r4,8(r3)
    0x7c9b_03a6, // mtsrr1 r4
    0x3863_0010, // addi r3,r3,16
    0x7c92_42a6, // mfsprg r4,2
    0x4800_0002, // ba handler
    0x4800_0000, // b .
];

/// Writes one byte from `args[0]` to the machine console.
///
/// Also bound to the legacy token used by guest debug code that does not read `/rtas`.
pub fn display_character(machine: &mut SpaprMachine, call: &mut RtasCall) -> Result<(), RtasStatus> {
    let byte = call.arg(0) as u8;
    let console = machine.console_mut().ok_or(RtasStatus::HwError)?;
    console
        .write_all(&[byte])
        .and_then(|()| console.flush())
        .map_err(|err| {
            log::warn!("rtas: console write failed: {err}");
            RtasStatus::HwError
        })
}

// power-off
pub(crate) fn power_off(machine: &mut SpaprMachine, call: &mut RtasCall) -> Result<(), RtasStatus> {
    call.expect_counts(2, 1)?;
    log::info!("rtas: guest requested power off");
    machine.push_event(PlatformEvent::PowerOff);
    Ok(())
}

// system-reboot
pub(crate) fn system_reboot(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(0, 1)?;
    log::info!("rtas: guest requested reboot");
    machine.push_event(PlatformEvent::Reset);
    Ok(())
}

fn system_parameter(machine: &SpaprMachine, parameter: u32) -> Option<Vec<u8>> {
    let config = machine.config();
    match parameter {
        RTAS_SYSPARM_SPLPAR_CHARACTERISTICS => Some(
            format!(
                "MaxEntCap={},MaxPlatProcs={}",
                config.max_cpus, config.smp_cpus
            )
            .into_bytes(),
        ),
        RTAS_SYSPARM_DIAGNOSTICS_RUN_MODE => Some(vec![0]),
        RTAS_SYSPARM_UUID => Some(
            config
                .uuid
                .map(|uuid| uuid.to_vec())
                .unwrap_or_default(),
        ),
        _ => None,
    }
}

// ibm,get-system-parameter
pub(crate) fn get_system_parameter(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(3, 1)?;
    let parameter = call.arg(0);
    let buffer = GuestAddress(u64::from(call.arg(1)));
    let length = call.arg(2) as usize;

    let value = system_parameter(machine, parameter).ok_or_else(|| {
        log::debug!("rtas: system parameter {parameter} not supported");
        RtasStatus::NotSupported
    })?;

    // The buffer starts with a 16-bit length followed by as much of the value as fits.
    if length >= 2 {
        let copied = value.len().min(length - 2);
        let mut out = Vec::with_capacity(copied + 2);
        out.extend_from_slice(&(copied as u16).to_be_bytes());
        out.extend_from_slice(&value[..copied]);
        machine
            .guest_memory()
            .write_slice(&out, buffer)
            .map_err(|_| RtasStatus::HwError)?;
    }
    Ok(())
}

// ibm,set-system-parameter
pub(crate) fn set_system_parameter(
    _machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(2, 1)?;
    match call.arg(0) {
        RTAS_SYSPARM_SPLPAR_CHARACTERISTICS
        | RTAS_SYSPARM_DIAGNOSTICS_RUN_MODE
        | RTAS_SYSPARM_UUID => Err(RtasStatus::NotAuthorized),
        _ => Err(RtasStatus::NotSupported),
    }
}

// ibm,os-term
pub(crate) fn os_term(machine: &mut SpaprMachine, call: &mut RtasCall) -> Result<(), RtasStatus> {
    call.expect_counts(1, 1)?;
    log::error!("rtas: guest terminated, message at {:#x}", call.arg(0));
    machine.push_event(PlatformEvent::GuestPanicked);
    Ok(())
}

// ibm,nmi-register
pub(crate) fn nmi_register(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(2, 1)?;
    let handler = call.arg(1);
    if handler & NMI_HANDLER_MASK != 0 {
        return Err(RtasStatus::NotSupported);
    }

    let mut trampoline = NMI_TRAMPOLINE;
    trampoline[2] |= H_REPORT_MC_ERR;
    trampoline[14] |= handler;

    let big_endian = machine.config().interrupts_big_endian;
    let bytes: Vec<u8> = trampoline
        .iter()
        .flat_map(|word| match big_endian {
            true => word.to_be_bytes(),
            false => word.to_le_bytes(),
        })
        .collect();
    machine
        .guest_memory()
        .write_slice(&bytes, GuestAddress(MC_VECTOR_ADDR))
        .map_err(|_| RtasStatus::HwError)?;
    log::debug!("rtas: machine check handler at {handler:#x}");
    Ok(())
}

// ibm,nmi-interlock
pub(crate) fn nmi_interlock(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(0, 1)?;
    machine.set_mc_in_progress(false);
    Ok(())
}
