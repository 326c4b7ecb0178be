// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCE tables and the per-bridge IOMMU address space they are mapped into.

use std::collections::BTreeMap;

/// Read permission bit of a TCE.
pub const TCE_READ: u64 = 0x1;
/// Write permission bit of a TCE.
pub const TCE_WRITE: u64 = 0x2;
const TCE_PERM_MASK: u64 = TCE_READ | TCE_WRITE;

/// TCE table and IOMMU map errors.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq, Eq)]
pub enum TceError {
    /// IO bus address {0:#x} is outside the window
    OutOfWindow(u64),
    /// Window at bus offset {0:#x} overlaps an existing window
    Overlap(u64),
    /// Window size overflows the bus address space
    WindowSize,
}

/// One DMA window's translation table.
///
/// Entries are kept sparse since guests rarely populate a large window fully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TceTable {
    liobn: u32,
    page_shift: u32,
    bus_offset: u64,
    nb_entries: u64,
    entries: BTreeMap<u64, u64>,
}

impl TceTable {
    pub fn new(liobn: u32, page_shift: u32, bus_offset: u64, nb_entries: u64) -> Self {
        TceTable {
            liobn,
            page_shift,
            bus_offset,
            nb_entries,
            entries: BTreeMap::new(),
        }
    }

    pub fn liobn(&self) -> u32 {
        self.liobn
    }

    pub fn page_shift(&self) -> u32 {
        self.page_shift
    }

    pub fn bus_offset(&self) -> u64 {
        self.bus_offset
    }

    pub fn nb_entries(&self) -> u64 {
        self.nb_entries
    }

    /// Bytes of bus address space the window covers.
    pub fn window_size(&self) -> u64 {
        self.nb_entries << self.page_shift
    }

    fn index(&self, ioba: u64) -> Result<u64, TceError> {
        let index = ioba
            .checked_sub(self.bus_offset)
            .map(|off| off >> self.page_shift)
            .ok_or(TceError::OutOfWindow(ioba))?;
        if index >= self.nb_entries {
            return Err(TceError::OutOfWindow(ioba));
        }
        Ok(index)
    }

    /// Stores `tce` for the page containing `ioba`. A TCE without permission bits clears it.
    pub fn put(&mut self, ioba: u64, tce: u64) -> Result<(), TceError> {
        let index = self.index(ioba)?;
        if tce & TCE_PERM_MASK == 0 {
            self.entries.remove(&index);
        } else {
            self.entries.insert(index, tce);
        }
        Ok(())
    }

    /// TCE covering `ioba`, 0 when unmapped.
    pub fn get(&self, ioba: u64) -> Result<u64, TceError> {
        let index = self.index(ioba)?;
        Ok(self.entries.get(&index).copied().unwrap_or(0))
    }

    /// Guest physical address `ioba` translates to, if mapped.
    pub fn translate(&self, ioba: u64) -> Option<u64> {
        let tce = self.get(ioba).ok()?;
        if tce & TCE_PERM_MASK == 0 {
            return None;
        }
        let page_mask = (1u64 << self.page_shift) - 1;
        Some((tce & !page_mask & !TCE_PERM_MASK) | (ioba & page_mask))
    }

    /// Drops every mapping.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of live mappings.
    pub fn mapped(&self) -> usize {
        self.entries.len()
    }
}

/// Bus address space of one bridge with the DMA windows mapped into it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IommuRoot {
    // bus offset -> table
    windows: BTreeMap<u64, TceTable>,
}

impl IommuRoot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `table` at its bus offset.
    pub fn map(&mut self, table: TceTable) -> Result<(), TceError> {
        let start = table.bus_offset();
        let end = start
            .checked_add(table.window_size())
            .ok_or(TceError::WindowSize)?;
        let overlaps = self.windows.values().any(|other| {
            let other_end = other.bus_offset() + other.window_size();
            start < other_end && other.bus_offset() < end
        });
        if overlaps {
            return Err(TceError::Overlap(start));
        }
        self.windows.insert(start, table);
        Ok(())
    }

    /// Unmaps and returns the window at `bus_offset`.
    pub fn unmap(&mut self, bus_offset: u64) -> Option<TceTable> {
        self.windows.remove(&bus_offset)
    }

    pub fn find(&self, liobn: u32) -> Option<&TceTable> {
        self.windows.values().find(|table| table.liobn() == liobn)
    }

    pub fn find_mut(&mut self, liobn: u32) -> Option<&mut TceTable> {
        self.windows.values_mut().find(|table| table.liobn() == liobn)
    }

    /// Window containing bus address `addr`.
    pub fn window_at(&self, addr: u64) -> Option<&TceTable> {
        let (_, table) = self.windows.range(..=addr).next_back()?;
        (addr - table.bus_offset() < table.window_size()).then_some(table)
    }

    /// Translates a device DMA address through whichever window covers it.
    pub fn translate(&self, addr: u64) -> Option<u64> {
        self.window_at(addr)?.translate(addr)
    }

    pub fn windows(&self) -> impl Iterator<Item = &TceTable> {
        self.windows.values()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tce_put_get() {
        let mut table = TceTable::new(0x8000_0001, 12, 0x1000_0000, 16);
        assert_eq!(table.window_size(), 0x1_0000);
        table.put(0x1000_2000, 0x5000 | TCE_READ).unwrap();
        assert_eq!(table.get(0x1000_2fff), Ok(0x5000 | TCE_READ));
        assert_eq!(table.translate(0x1000_2123), Some(0x5123));
        assert_eq!(table.translate(0x1000_3000), None);
        assert_eq!(table.mapped(), 1);

        assert_eq!(
            table.put(0x1001_0000, TCE_READ),
            Err(TceError::OutOfWindow(0x1001_0000))
        );
        assert_eq!(table.get(0xfff), Err(TceError::OutOfWindow(0xfff)));

        table.put(0x1000_2000, 0).unwrap();
        assert_eq!(table.mapped(), 0);
    }

    #[test]
    fn test_iommu_root_map() {
        let mut root = IommuRoot::new();
        root.map(TceTable::new(0x8000_0000, 12, 0, 0x1000)).unwrap();
        let mut ddw = TceTable::new(0x8000_0001, 16, 0x8000_0000_0000_0000, 4);
        ddw.put(0x8000_0000_0001_0000, 0x20_0000 | TCE_WRITE).unwrap();
        root.map(ddw).unwrap();
        assert_eq!(
            root.map(TceTable::new(0x8000_0002, 12, 0x0080_0000, 0x1000)),
            Err(TceError::Overlap(0x0080_0000))
        );
        assert_eq!(root.len(), 2);

        assert_eq!(root.translate(0x8000_0000_0001_0010), Some(0x20_0010));
        assert_eq!(root.translate(0x100_0000), None);
        assert_eq!(root.window_at(0x8000_0000_0004_0000), None);
        assert_eq!(root.find(0x8000_0001).unwrap().page_shift(), 16);

        let table = root.unmap(0x8000_0000_0000_0000).unwrap();
        assert_eq!(table.liobn(), 0x8000_0001);
        assert!(root.find(0x8000_0001).is_none());
        assert!(!root.is_empty());
    }
}
