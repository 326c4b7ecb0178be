// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! sPAPR PCI host bridge emulation and the RTAS control plane that drives it.
//!
//! A [`machine::SpaprMachine`] receives the guest's `H_RTAS` hypercalls and routes them to the
//! PCI host bridges it owns: config space accesses, MSI allocation, dynamic DMA windows, EEH
//! recovery and the dynamic reconfiguration connectors used for PCI hot-plug. Bridges are
//! backed by software TCE tables or by a host IOMMU group passed through VFIO.
#![warn(clippy::undocumented_unsafe_blocks)]

/// Machine and bridge configuration.
pub mod config;
/// Dynamic DMA windows.
pub mod ddw;
/// Dynamic reconfiguration connectors.
pub mod drc;
/// Device tree fragments handed out through configure-connector.
pub mod dt;
/// Enhanced error handling.
pub mod eeh;
pub mod hotplug;
/// Interrupt source allocation.
pub mod irq;
pub mod logger;
pub mod machine;
pub mod msi;
/// Collaborator interfaces of the emulated PCI bus.
pub mod pci;
pub mod persist;
pub mod phb;
pub mod rtas;
/// Wall clock helpers.
pub mod time;
/// Host IOMMU groups passed through VFIO.
pub mod vfio;

#[cfg(test)]
pub(crate) mod test_utils;
