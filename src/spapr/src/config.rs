// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Machine and host bridge configuration.

use serde::{Deserialize, Serialize};

use crate::irq::XICS_IRQS_DEFAULT;
use crate::logger::LoggerConfig;

/// BUID of the PHB with index 0.
pub const SPAPR_PCI_BASE_BUID: u64 = 0x0800_0000_2000_0000;
/// LIOBN flag bit shared by every PHB DMA window.
pub const SPAPR_PCI_LIOBN_BASE: u32 = 0x8000_0000;
/// Base of the per-PHB window area.
pub const SPAPR_PCI_WINDOW_BASE: u64 = 0x100_0000_0000;
/// Stride between PHB window areas.
pub const SPAPR_PCI_WINDOW_SPACING: u64 = 0x10_0000_0000;
/// Offset of the MMIO window within a PHB window area.
pub const SPAPR_PCI_MMIO_WIN_OFF: u64 = 0xA000_0000;
/// Default MMIO window size.
pub const SPAPR_PCI_MMIO_WIN_SIZE: u64 = 0x2000_0000;
/// Offset of the IO window within a PHB window area.
pub const SPAPR_PCI_IO_WIN_OFF: u64 = 0x8000_0000;
/// Default IO window size.
pub const SPAPR_PCI_IO_WIN_SIZE: u64 = 0x1_0000;
/// Bus address where MSI writes are decoded.
pub const SPAPR_PCI_MSI_WINDOW: u64 = 0x400_0000_0000;
/// Default DMA window size.
pub const SPAPR_PCI_DMA_WINDOW_SIZE: u64 = 0x4000_0000;
/// Highest PHB index that still fits the window area and LIOBN layout.
pub const SPAPR_PCI_MAX_INDEX: u32 = 255;

/// LIOBN of window `window` on the PHB with `index`.
pub const fn spapr_pci_liobn(index: u32, window: u32) -> u32 {
    SPAPR_PCI_LIOBN_BASE | (index << 8) | window
}

/// Errors in a bridge configuration.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum ConfigError {
    /// Either "index" or explicit "buid", "liobn", "mem_win_addr" and "io_win_addr" may be given, not both
    IndexConflict,
    /// Missing PHB parameter "{0}"
    MissingField(&'static str),
    /// PHB index {0} is out of range
    IndexOutOfRange(u32),
    /// DMA window budget must be between 1 and 254, got {0}
    InvalidWindowBudget(u32),
    /// LIOBN {0:#x} leaves no room for {1} dynamic windows
    LiobnRange(u32, u32),
    /// Cannot parse machine configuration: {0}
    Parse(String),
}

/// Where a bridge gets its DMA windows and EEH from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhbBackendConfig {
    /// Software TCE tables, always healthy EEH.
    #[default]
    Emulated,
    /// A host IOMMU group passed through VFIO.
    Vfio {
        /// `/dev/vfio/<iommu_group>`.
        iommu_group: u32,
    },
}

fn default_true() -> bool {
    true
}

fn default_mem_win_size() -> u64 {
    SPAPR_PCI_MMIO_WIN_SIZE
}

fn default_io_win_size() -> u64 {
    SPAPR_PCI_IO_WIN_SIZE
}

fn default_ddw_windows() -> u32 {
    1
}

/// One PCI host bridge.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PhbConfig {
    /// Derives every address from the index.
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub buid: Option<u64>,
    /// LIOBN of the default DMA window.
    #[serde(default)]
    pub liobn: Option<u32>,
    #[serde(default)]
    pub mem_win_addr: Option<u64>,
    #[serde(default)]
    pub io_win_addr: Option<u64>,
    #[serde(default = "default_mem_win_size")]
    pub mem_win_size: u64,
    #[serde(default = "default_io_win_size")]
    pub io_win_size: u64,
    /// Offer dynamic DMA windows to the guest.
    #[serde(default = "default_true")]
    pub ddw: bool,
    /// Dynamic windows the emulated backend supports.
    #[serde(default = "default_ddw_windows")]
    pub ddw_windows: u32,
    #[serde(default)]
    pub backend: PhbBackendConfig,
}

impl Default for PhbConfig {
    fn default() -> Self {
        PhbConfig {
            index: None,
            buid: None,
            liobn: None,
            mem_win_addr: None,
            io_win_addr: None,
            mem_win_size: SPAPR_PCI_MMIO_WIN_SIZE,
            io_win_size: SPAPR_PCI_IO_WIN_SIZE,
            ddw: true,
            ddw_windows: 1,
            backend: PhbBackendConfig::Emulated,
        }
    }
}

/// Addresses of a bridge after resolving its configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhbLayout {
    /// Present when the bridge was configured by index.
    pub index: Option<u32>,
    pub buid: u64,
    pub dma_liobn: u32,
    pub mem_win_addr: u64,
    pub mem_win_size: u64,
    pub io_win_addr: u64,
    pub io_win_size: u64,
}

impl PhbConfig {
    /// Bridge laid out from `index`.
    pub fn with_index(index: u32) -> Self {
        PhbConfig {
            index: Some(index),
            ..Default::default()
        }
    }

    /// Computes the bridge addresses.
    pub fn layout(&self) -> Result<PhbLayout, ConfigError> {
        if self.ddw_windows == 0 || self.ddw_windows > 254 {
            return Err(ConfigError::InvalidWindowBudget(self.ddw_windows));
        }
        if let Some(index) = self.index {
            if self.buid.is_some()
                || self.liobn.is_some()
                || self.mem_win_addr.is_some()
                || self.io_win_addr.is_some()
            {
                return Err(ConfigError::IndexConflict);
            }
            if index > SPAPR_PCI_MAX_INDEX {
                return Err(ConfigError::IndexOutOfRange(index));
            }
            let windows_base = SPAPR_PCI_WINDOW_BASE + u64::from(index) * SPAPR_PCI_WINDOW_SPACING;
            return Ok(PhbLayout {
                index: Some(index),
                buid: SPAPR_PCI_BASE_BUID + u64::from(index),
                dma_liobn: spapr_pci_liobn(index, 0),
                mem_win_addr: windows_base + SPAPR_PCI_MMIO_WIN_OFF,
                mem_win_size: self.mem_win_size,
                io_win_addr: windows_base + SPAPR_PCI_IO_WIN_OFF,
                io_win_size: self.io_win_size,
            });
        }

        let buid = self.buid.ok_or(ConfigError::MissingField("buid"))?;
        let dma_liobn = self.liobn.ok_or(ConfigError::MissingField("liobn"))?;
        if self.ddw && dma_liobn.checked_add(self.ddw_windows).is_none() {
            return Err(ConfigError::LiobnRange(dma_liobn, self.ddw_windows));
        }
        Ok(PhbLayout {
            index: None,
            buid,
            dma_liobn,
            mem_win_addr: self
                .mem_win_addr
                .ok_or(ConfigError::MissingField("mem_win_addr"))?,
            mem_win_size: self.mem_win_size,
            io_win_addr: self
                .io_win_addr
                .ok_or(ConfigError::MissingField("io_win_addr"))?,
            io_win_size: self.io_win_size,
        })
    }
}

fn default_ram_size_mib() -> usize {
    128
}

fn default_cpus() -> u32 {
    1
}

fn default_guest_page_shifts() -> Vec<u32> {
    vec![12, 16, 24]
}

fn default_irq_count() -> u32 {
    XICS_IRQS_DEFAULT
}

/// Platform level configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MachineConfig {
    #[serde(default = "default_ram_size_mib")]
    pub ram_size_mib: usize,
    #[serde(default = "default_cpus")]
    pub smp_cpus: u32,
    #[serde(default = "default_cpus")]
    pub max_cpus: u32,
    /// Partition UUID reported through ibm,get-system-parameter.
    #[serde(default)]
    pub uuid: Option<[u8; 16]>,
    /// Segment page shifts the guest MMU supports.
    #[serde(default = "default_guest_page_shifts")]
    pub guest_page_shifts: Vec<u32>,
    /// Endianness the guest takes interrupts in.
    #[serde(default = "default_true")]
    pub interrupts_big_endian: bool,
    #[serde(default = "default_irq_count")]
    pub irq_count: u32,
    #[serde(default)]
    pub logger: Option<LoggerConfig>,
    #[serde(default)]
    pub phbs: Vec<PhbConfig>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            ram_size_mib: default_ram_size_mib(),
            smp_cpus: 1,
            max_cpus: 1,
            uuid: None,
            guest_page_shifts: default_guest_page_shifts(),
            interrupts_big_endian: true,
            irq_count: XICS_IRQS_DEFAULT,
            logger: None,
            phbs: Vec::new(),
        }
    }
}

impl MachineConfig {
    /// Parses a JSON machine description.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Guest RAM size in bytes.
    pub fn ram_size(&self) -> u64 {
        (self.ram_size_mib as u64) << 20
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_from_index() {
        let layout = PhbConfig::with_index(2).layout().unwrap();
        assert_eq!(layout.buid, 0x0800_0000_2000_0002);
        assert_eq!(layout.dma_liobn, 0x8000_0200);
        assert_eq!(layout.mem_win_addr, 0x120_A000_0000);
        assert_eq!(layout.io_win_addr, 0x120_8000_0000);
        assert_eq!(layout.mem_win_size, SPAPR_PCI_MMIO_WIN_SIZE);
        assert_eq!(layout.index, Some(2));
    }

    #[test]
    fn test_layout_errors() {
        let mut config = PhbConfig::with_index(0);
        config.buid = Some(1);
        assert_eq!(config.layout(), Err(ConfigError::IndexConflict));

        let config = PhbConfig {
            buid: Some(0x1000),
            liobn: Some(0x100),
            mem_win_addr: Some(0x1_0000_0000),
            ..Default::default()
        };
        assert_eq!(config.layout(), Err(ConfigError::MissingField("io_win_addr")));

        let config = PhbConfig {
            io_win_addr: Some(0x2_0000_0000),
            ..config
        };
        let layout = config.layout().unwrap();
        assert_eq!(layout.index, None);
        assert_eq!(layout.buid, 0x1000);

        assert_eq!(
            PhbConfig::with_index(256).layout(),
            Err(ConfigError::IndexOutOfRange(256))
        );
        let config = PhbConfig {
            ddw_windows: 0,
            ..PhbConfig::with_index(0)
        };
        assert_eq!(config.layout(), Err(ConfigError::InvalidWindowBudget(0)));

        let config = PhbConfig {
            index: None,
            buid: Some(0x1000),
            liobn: Some(u32::MAX - 1),
            mem_win_addr: Some(0x1_0000_0000),
            io_win_addr: Some(0x2_0000_0000),
            ddw_windows: 2,
            ..Default::default()
        };
        assert_eq!(
            config.layout(),
            Err(ConfigError::LiobnRange(u32::MAX - 1, 2))
        );
        let config = PhbConfig {
            ddw_windows: 1,
            ..config
        };
        assert_eq!(config.layout().unwrap().dma_liobn, u32::MAX - 1);
    }

    #[test]
    fn test_machine_config_json() {
        let config = MachineConfig::from_json(
            r#"{
                "ram_size_mib": 512,
                "smp_cpus": 2,
                "max_cpus": 4,
                "logger": { "level": "Debug" },
                "phbs": [
                    { "index": 0 },
                    { "index": 1, "ddw": false, "backend": { "vfio": { "iommu_group": 7 } } }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.ram_size(), 512 << 20);
        assert_eq!(config.guest_page_shifts, vec![12, 16, 24]);
        assert!(config.interrupts_big_endian);
        assert_eq!(config.phbs.len(), 2);
        assert_eq!(config.phbs[0], PhbConfig::with_index(0));
        assert!(!config.phbs[1].ddw);
        assert_eq!(
            config.phbs[1].backend,
            PhbBackendConfig::Vfio { iommu_group: 7 }
        );

        assert!(matches!(
            MachineConfig::from_json(r#"{ "ram": 1 }"#),
            Err(ConfigError::Parse(_))
        ));
    }
}
