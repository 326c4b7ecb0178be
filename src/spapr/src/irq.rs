// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Interrupt source allocation on the platform interrupt controller.

use std::collections::BTreeMap;
use std::fmt::Debug;

pub use vm_allocator::AllocPolicy;
use vm_allocator::{AddressAllocator, RangeInclusive};

/// First interrupt source number handed out by the XICS source controller.
pub const XICS_IRQ_BASE: u32 = 0x1000;
/// Default number of interrupt sources.
pub const XICS_IRQS_DEFAULT: u32 = 1024;
/// Phandle of the interrupt controller node referenced from `interrupt-map`.
pub const XICS_PHANDLE: u32 = 0x1111_1111;

/// Errors from interrupt block management.
#[derive(Debug, thiserror::Error, displaydoc::Display, PartialEq)]
pub enum IrqError {
    /// Failed to allocate {0} interrupt(s): {1}
    Allocate(u32, vm_allocator::Error),
    /// Interrupt block at {0:#x} is not allocated
    NotAllocated(u32),
    /// Interrupt number {0:#x} does not fit the source number space
    OutOfRange(u64),
    /// Invalid interrupt controller range: {0}
    InvalidRange(vm_allocator::Error),
}

/// Block allocator interface of the interrupt controller.
pub trait IrqController: Debug + Send {
    /// Allocates `count` contiguous sources and returns the first one.
    ///
    /// A non-zero `hint` requests that exact first source. MSI blocks are naturally aligned to
    /// the next power of two of `count`.
    fn alloc_block(&mut self, hint: u32, count: u32, lsi: bool, msi: bool) -> Result<u32, IrqError>;
    /// Returns a block obtained from [`IrqController::alloc_block`].
    fn free_block(&mut self, first: u32, count: u32) -> Result<(), IrqError>;
    /// Whether `irq` was allocated as level sensitive.
    fn is_lsi(&self, irq: u32) -> bool;
    /// Phandle of the controller node.
    fn phandle(&self) -> u32;
}

/// XICS source controller: a flat range of interrupt numbers.
#[derive(Debug)]
pub struct XicsIrqAllocator {
    allocator: AddressAllocator,
    // first irq -> (count, lsi)
    blocks: BTreeMap<u32, (u32, bool)>,
}

impl XicsIrqAllocator {
    /// Creates a controller owning `count` sources from [`XICS_IRQ_BASE`].
    pub fn new(count: u32) -> Result<Self, IrqError> {
        Ok(XicsIrqAllocator {
            allocator: AddressAllocator::new(u64::from(XICS_IRQ_BASE), u64::from(count))
                .map_err(IrqError::InvalidRange)?,
            blocks: BTreeMap::new(),
        })
    }

    /// Number of live blocks.
    pub fn allocated_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl IrqController for XicsIrqAllocator {
    fn alloc_block(&mut self, hint: u32, count: u32, lsi: bool, msi: bool) -> Result<u32, IrqError> {
        let alignment = if msi {
            u64::from(count.next_power_of_two())
        } else {
            1
        };
        let policy = match hint {
            0 => AllocPolicy::FirstMatch,
            hint => AllocPolicy::ExactMatch(u64::from(hint)),
        };
        let range = self
            .allocator
            .allocate(u64::from(count), alignment, policy)
            .map_err(|err| IrqError::Allocate(count, err))?;
        let first =
            u32::try_from(range.start()).map_err(|_| IrqError::OutOfRange(range.start()))?;
        self.blocks.insert(first, (count, lsi));
        Ok(first)
    }

    fn free_block(&mut self, first: u32, count: u32) -> Result<(), IrqError> {
        match self.blocks.get(&first) {
            Some((allocated, _)) if *allocated == count => {}
            _ => return Err(IrqError::NotAllocated(first)),
        }
        let range = RangeInclusive::new(u64::from(first), u64::from(first) + u64::from(count) - 1)
            .map_err(|_| IrqError::NotAllocated(first))?;
        self.allocator
            .free(&range)
            .map_err(|_| IrqError::NotAllocated(first))?;
        self.blocks.remove(&first);
        Ok(())
    }

    fn is_lsi(&self, irq: u32) -> bool {
        self.blocks
            .range(..=irq)
            .next_back()
            .is_some_and(|(first, (count, lsi))| irq < first + count && *lsi)
    }

    fn phandle(&self) -> u32 {
        XICS_PHANDLE
    }
}
