// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Boot time device tree node of a host bridge.

use vm_fdt::{Error as VmFdtError, FdtWriter};

use super::{PCI_NUM_PINS, SpaprPhb, swizzle};
use crate::drc::DRC_TYPE_PCI;
use crate::pci::PCI_SLOT_MAX;
use crate::rtas::{
    RTAS_IBM_CREATE_PE_DMA_WINDOW, RTAS_IBM_QUERY_PE_DMA_WINDOW, RTAS_IBM_REMOVE_PE_DMA_WINDOW,
};

/// Bus address the MMIO window is decoded at.
pub const SPAPR_PCI_MEM_WIN_BUS_OFFSET: u64 = 0x8000_0000;

// Open Firmware PCI address space codes of the phys.hi cell.
const OF_SS_IO: u32 = 0x0100_0000;
const OF_SS_MEM32: u32 = 0x0200_0000;
// interrupt-map sense: level, active low.
const LSI_SENSE: u32 = 8;
const POWER_DOMAIN_NONE: u32 = 0xffff_ffff;

fn split(value: u64) -> [u32; 2] {
    [(value >> 32) as u32, value as u32]
}

fn ranges(phb: &SpaprPhb) -> Vec<u32> {
    let layout = phb.layout();
    let mut ranges = Vec::with_capacity(14);
    ranges.extend([OF_SS_IO, 0, 0]);
    ranges.extend(split(layout.io_win_addr));
    ranges.extend(split(layout.io_win_size));
    ranges.push(OF_SS_MEM32);
    ranges.extend(split(SPAPR_PCI_MEM_WIN_BUS_OFFSET));
    ranges.extend(split(layout.mem_win_addr));
    ranges.extend(split(layout.mem_win_size));
    ranges
}

fn interrupt_map(phb: &SpaprPhb, xics_phandle: u32) -> Vec<u32> {
    let mut map = Vec::with_capacity(usize::from(PCI_SLOT_MAX) * PCI_NUM_PINS * 7);
    for slot in 0..PCI_SLOT_MAX {
        for pin in 0..PCI_NUM_PINS as u8 {
            map.extend([
                u32::from(slot) << 11,
                0,
                0,
                u32::from(pin) + 1,
                xics_phandle,
                phb.lsi[swizzle(slot, pin)],
                LSI_SENSE,
            ]);
        }
    }
    map
}

// Count cell followed by one NUL-terminated string per slot.
fn counted_strings(strings: impl ExactSizeIterator<Item = String>) -> Vec<u8> {
    let mut out = (strings.len() as u32).to_be_bytes().to_vec();
    for s in strings {
        out.extend_from_slice(s.as_bytes());
        out.push(0);
    }
    out
}

fn counted_cells(values: impl ExactSizeIterator<Item = u32>) -> Vec<u32> {
    let mut out = Vec::with_capacity(values.len() + 1);
    out.push(values.len() as u32);
    out.extend(values);
    out
}

impl SpaprPhb {
    /// Emits the bridge node into `fdt`, under whatever node is currently open.
    ///
    /// Functions present at boot are not described here: the guest finds them by probing
    /// config space.
    pub fn populate_dt(
        &self,
        fdt: &mut FdtWriter,
        xics_phandle: u32,
        irq_count: u32,
    ) -> Result<(), VmFdtError> {
        let node = fdt.begin_node(&self.dt_name())?;

        fdt.property_string("device_type", "pci")?;
        fdt.property_string("compatible", "IBM,Logical_PHB")?;
        fdt.property_u32("#address-cells", 3)?;
        fdt.property_u32("#size-cells", 2)?;
        fdt.property_u32("#interrupt-cells", 1)?;
        fdt.property_null("used-by-rtas")?;
        fdt.property_array_u32("bus-range", &[0, 0xff])?;
        fdt.property_array_u32("ranges", &ranges(self))?;
        fdt.property_array_u64("reg", &[self.buid(), 0])?;
        fdt.property_u32("ibm,pci-config-space-type", 1)?;
        fdt.property_u32("ibm,pe-total-#msi", irq_count)?;

        if self.dma.ddw_enabled() {
            fdt.property_array_u32(
                "ibm,ddw-applicable",
                &[
                    RTAS_IBM_QUERY_PE_DMA_WINDOW,
                    RTAS_IBM_CREATE_PE_DMA_WINDOW,
                    RTAS_IBM_REMOVE_PE_DMA_WINDOW,
                ],
            )?;
        }

        fdt.property_array_u32("interrupt-map-mask", &[0xf800, 0, 0, 0xffff_ffff])?;
        fdt.property_array_u32("interrupt-map", &interrupt_map(self, xics_phandle))?;

        let window = self.dma.default_window();
        let mut dma_window = vec![window.liobn];
        dma_window.extend(split(window.bus_offset));
        dma_window.extend(split(window.size()));
        fdt.property_u32("ibm,#dma-address-cells", 2)?;
        fdt.property_u32("ibm,#dma-size-cells", 2)?;
        fdt.property_array_u32("ibm,dma-window", &dma_window)?;

        self.populate_drc_dt(fdt)?;

        fdt.end_node(node)
    }

    fn populate_drc_dt(&self, fdt: &mut FdtWriter) -> Result<(), VmFdtError> {
        let Some(index) = self.index() else {
            return Ok(());
        };
        let slots = self.drc.slots.len();
        let first_slot = index * u32::from(PCI_SLOT_MAX);

        fdt.property_array_u32(
            "ibm,drc-indexes",
            &counted_cells(self.drc.slot_indexes().into_iter()),
        )?;
        fdt.property_array_u32(
            "ibm,drc-power-domains",
            &counted_cells(std::iter::repeat_n(POWER_DOMAIN_NONE, slots)),
        )?;
        fdt.property(
            "ibm,drc-names",
            &counted_strings((0..slots as u32).map(|slot| format!("Slot {}", first_slot + slot))),
        )?;
        fdt.property(
            "ibm,drc-types",
            &counted_strings(std::iter::repeat_n(DRC_TYPE_PCI.to_string(), slots)),
        )?;
        fdt.property_array_u32(
            "ibm,indicator-9003",
            &counted_cells(std::iter::repeat_n(0, slots)),
        )?;
        fdt.property_array_u32("ibm,sensor-9003", &counted_cells(std::iter::repeat_n(0, slots)))?;

        if let Some(entry) = &self.drc.phb {
            fdt.property_u32("ibm,my-drc-index", entry.index)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PhbConfig, SPAPR_PCI_BASE_BUID};
    use crate::drc::slot_drc_index;
    use crate::irq::{XICS_PHANDLE, XicsIrqAllocator};

    fn cells(raw: &[u8]) -> Vec<u32> {
        raw.chunks_exact(4)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn blob(phb: &SpaprPhb) -> Vec<u8> {
        let mut fdt = FdtWriter::new().unwrap();
        let root = fdt.begin_node("").unwrap();
        phb.populate_dt(&mut fdt, XICS_PHANDLE, 1024).unwrap();
        fdt.end_node(root).unwrap();
        fdt.finish().unwrap()
    }

    #[test]
    fn test_phb_node() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let phb = SpaprPhb::realize(&PhbConfig::with_index(1), &mut irq, None).unwrap();
        let blob = blob(&phb);
        let tree = device_tree::DeviceTree::load(&blob).unwrap();
        let node = tree.find("/pci@800000020000001").unwrap();

        assert_eq!(node.prop_str("device_type").unwrap(), "pci");
        assert_eq!(node.prop_str("compatible").unwrap(), "IBM,Logical_PHB");
        assert_eq!(node.prop_u32("#address-cells").unwrap(), 3);
        assert_eq!(node.prop_u32("#interrupt-cells").unwrap(), 1);
        assert!(node.prop_raw("used-by-rtas").unwrap().is_empty());
        assert_eq!(cells(node.prop_raw("bus-range").unwrap()), vec![0, 0xff]);
        assert_eq!(
            cells(node.prop_raw("reg").unwrap()),
            vec![0x0800_0000, 0x2000_0001, 0, 0]
        );
        assert_eq!(node.prop_u32("ibm,pe-total-#msi").unwrap(), 1024);

        // IO window then MMIO window decoded at 2 GiB.
        assert_eq!(
            cells(node.prop_raw("ranges").unwrap()),
            vec![
                0x0100_0000, 0, 0, 0x110, 0x8000_0000, 0, 0x1_0000, //
                0x0200_0000, 0, 0x8000_0000, 0x110, 0xa000_0000, 0, 0x2000_0000,
            ]
        );
        assert_eq!(
            cells(node.prop_raw("ibm,ddw-applicable").unwrap()),
            vec![
                RTAS_IBM_QUERY_PE_DMA_WINDOW,
                RTAS_IBM_CREATE_PE_DMA_WINDOW,
                RTAS_IBM_REMOVE_PE_DMA_WINDOW
            ]
        );
        assert_eq!(
            cells(node.prop_raw("ibm,dma-window").unwrap()),
            vec![0x8000_0100, 0, 0, 0, 0x4000_0000]
        );
        assert_eq!(
            node.prop_u32("ibm,my-drc-index").unwrap(),
            phb.drc.phb.as_ref().unwrap().index
        );
    }

    #[test]
    fn test_interrupt_map() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let phb = SpaprPhb::realize(&PhbConfig::with_index(0), &mut irq, None).unwrap();
        let blob = blob(&phb);
        let tree = device_tree::DeviceTree::load(&blob).unwrap();
        let node = tree.find(&format!("/pci@{:x}", SPAPR_PCI_BASE_BUID)).unwrap();

        assert_eq!(
            cells(node.prop_raw("interrupt-map-mask").unwrap()),
            vec![0xf800, 0, 0, 0xffff_ffff]
        );
        let map = cells(node.prop_raw("interrupt-map").unwrap());
        assert_eq!(map.len(), 32 * 4 * 7);
        // Slot 5, INTC.
        let entry = &map[(5 * 4 + 2) * 7..(5 * 4 + 3) * 7];
        assert_eq!(
            entry,
            &[5 << 11, 0, 0, 3, XICS_PHANDLE, phb.lsi[(5 + 2) % 4], 8]
        );
    }

    #[test]
    fn test_drc_properties() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let phb = SpaprPhb::realize(&PhbConfig::with_index(2), &mut irq, None).unwrap();
        let blob = blob(&phb);
        let tree = device_tree::DeviceTree::load(&blob).unwrap();
        let node = tree.find("/pci@800000020000002").unwrap();

        let indexes = cells(node.prop_raw("ibm,drc-indexes").unwrap());
        assert_eq!(indexes.len(), 33);
        assert_eq!(indexes[0], 32);
        assert_eq!(indexes[1], slot_drc_index(2, 0));
        assert_eq!(indexes[32], slot_drc_index(2, 31));

        let domains = cells(node.prop_raw("ibm,drc-power-domains").unwrap());
        assert_eq!(domains[0], 32);
        assert!(domains[1..].iter().all(|d| *d == 0xffff_ffff));
        for name in ["ibm,indicator-9003", "ibm,sensor-9003"] {
            let values = cells(node.prop_raw(name).unwrap());
            assert_eq!(values.len(), 33);
            assert!(values[1..].iter().all(|v| *v == 0));
        }

        let names = node.prop_raw("ibm,drc-names").unwrap();
        assert_eq!(&names[..4], &32u32.to_be_bytes());
        let names: Vec<&[u8]> = names[4..].split(|b| *b == 0).collect();
        assert_eq!(names[0], b"Slot 64");
        assert_eq!(names[31], b"Slot 95");

        let types = node.prop_raw("ibm,drc-types").unwrap();
        assert_eq!(&types[..4], &32u32.to_be_bytes());
        assert_eq!(&types[4..7], b"28\0");
        assert_eq!(types.len(), 4 + 32 * 3);
    }

    #[test]
    fn test_explicit_bridge_has_no_drc_properties() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let config = PhbConfig {
            index: None,
            buid: Some(0x1234),
            liobn: Some(0x8000_1000),
            mem_win_addr: Some(0x2000_0000_0000),
            io_win_addr: Some(0x2100_0000_0000),
            ..Default::default()
        };
        let phb = SpaprPhb::realize(&config, &mut irq, None).unwrap();
        let blob = blob(&phb);
        let tree = device_tree::DeviceTree::load(&blob).unwrap();
        let node = tree.find("/pci@1234").unwrap();
        for name in ["ibm,drc-indexes", "ibm,drc-names", "ibm,my-drc-index"] {
            assert!(node.prop_raw(name).is_none(), "{name}");
        }
        assert!(node.prop_raw("ibm,dma-window").is_some());
    }

    #[test]
    fn test_ddw_disabled() {
        let mut irq = XicsIrqAllocator::new(64).unwrap();
        let config = PhbConfig {
            ddw: false,
            ..PhbConfig::with_index(0)
        };
        let phb = SpaprPhb::realize(&config, &mut irq, None).unwrap();
        let blob = blob(&phb);
        let tree = device_tree::DeviceTree::load(&blob).unwrap();
        let node = tree.find(&format!("/pci@{:x}", SPAPR_PCI_BASE_BUID)).unwrap();
        assert!(node.prop_raw("ibm,ddw-applicable").is_none());
        assert!(node.prop_raw("ibm,dma-window").is_some());
    }
}
