// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamic Reconfiguration Connectors.
//!
//! Every hot-pluggable slot owns a connector with a packed indicator/sensor state word. The
//! guest drives the word through set-indicator and get-sensor-state. The configure-connector
//! state of a slot walks the device tree fragment staged when a function is plugged.

use crate::dt::{DtNode, FdtTag, FragmentCursor};
use crate::machine::SpaprMachine;
use crate::pci::PCI_SLOT_MAX;
use crate::rtas::{RtasCall, RtasStatus};

/// Base of slot connector indexes.
pub const DRC_INDEX_SLOT_BASE: u32 = 0x4000_0000;
/// Base of PHB connector indexes.
pub const DRC_INDEX_PHB_BASE: u32 = 0x2000_0000;
/// Connector type advertised in `ibm,drc-types` ("28" is a PCI slot).
pub const DRC_TYPE_PCI: &str = "28";

/// Size of the configure-connector work area.
pub const CC_WORK_AREA_SIZE: usize = 4096;
// Work area word indexes.
const CC_IDX_NODE_NAME_OFFSET: usize = 2;
const CC_IDX_PROP_NAME_OFFSET: usize = 2;
const CC_IDX_PROP_LEN: usize = 3;
const CC_IDX_PROP_DATA_OFFSET: usize = 4;
const CC_VAL_DATA_OFFSET: usize = (CC_IDX_PROP_DATA_OFFSET + 1) * 4;

/// Power level reported for every connector. Hot-plugged resources live in one always-on
/// power domain.
pub const DRC_POWER_LEVEL_FULL: u32 = 100;

/// Index of the connector for `slot` on the PHB with `phb_index`.
pub fn slot_drc_index(phb_index: u32, slot: u8) -> u32 {
    DRC_INDEX_SLOT_BASE + (phb_index << 8) + (u32::from(slot) << 3)
}

/// A bit field of the connector state word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrcField {
    /// 9001: 0 isolated, 1 unisolated.
    Isolation,
    /// 9005.
    GlobalInterrupt,
    /// 9006.
    ErrorLog,
    /// 9007.
    Identify,
    /// 9009.
    Reset,
    /// 9002.
    DrIndicator,
    /// Indicator 9003.
    Allocation,
    /// 9.
    Epow,
    /// Sensor 9003.
    EntitySense,
}

impl DrcField {
    const fn mask(self) -> u32 {
        match self {
            DrcField::Isolation => 0x0001,
            DrcField::GlobalInterrupt => 0x0002,
            DrcField::ErrorLog => 0x0004,
            DrcField::Identify => 0x0008,
            DrcField::Reset => 0x0010,
            DrcField::DrIndicator => 0x00e0,
            DrcField::Allocation => 0x0300,
            DrcField::Epow => 0x1c00,
            DrcField::EntitySense => 0xe000,
        }
    }

    const fn shift(self) -> u32 {
        self.mask().trailing_zeros()
    }

    /// Field addressed by a set-indicator call.
    pub fn from_indicator(indicator: u32) -> Option<DrcField> {
        match indicator {
            9003 => Some(DrcField::Allocation),
            other => Self::common(other),
        }
    }

    /// Field addressed by a get-sensor-state call.
    pub fn from_sensor(sensor: u32) -> Option<DrcField> {
        match sensor {
            9003 => Some(DrcField::EntitySense),
            other => Self::common(other),
        }
    }

    fn common(token: u32) -> Option<DrcField> {
        match token {
            9 => Some(DrcField::Epow),
            9001 => Some(DrcField::Isolation),
            9002 => Some(DrcField::DrIndicator),
            9005 => Some(DrcField::GlobalInterrupt),
            9006 => Some(DrcField::ErrorLog),
            9007 => Some(DrcField::Identify),
            9009 => Some(DrcField::Reset),
            _ => None,
        }
    }
}

pub const ENTITY_SENSE_EMPTY: u32 = 0;
pub const ENTITY_SENSE_PRESENT: u32 = 1;
pub const ENTITY_SENSE_UNUSABLE: u32 = 2;

/// Packed indicator/sensor word of a connector or of the platform.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrcState(pub u32);

impl DrcState {
    pub fn get(self, field: DrcField) -> u32 {
        (self.0 & field.mask()) >> field.shift()
    }

    pub fn set(&mut self, field: DrcField, value: u32) {
        self.0 = (self.0 & !field.mask()) | ((value << field.shift()) & field.mask());
    }
}

/// Progress of the configure-connector handshake.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectorState {
    /// Nothing attached.
    #[default]
    Idle,
    /// A fragment is staged and the guest may fetch it.
    Pending,
    /// The guest is walking the fragment.
    Active,
}

/// Continuation codes returned by ibm,configure-connector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum CcResponse {
    /// The whole fragment was delivered.
    Success = 0,
    NextSibling = 1,
    NextChild = 2,
    NextProperty = 3,
    PrevParent = 4,
    Error = -1,
}

/// Staging record for the fragment describing an attached function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigureConnector {
    /// Handshake state.
    pub state: ConnectorState,
    depth: u32,
    fragment: Option<DtNode>,
    cursor: FragmentCursor,
    /// Devfn of the attached function.
    pub devfn: Option<u8>,
}

fn put_be32(wa: &mut [u8], idx: usize, value: u32) -> bool {
    match wa.get_mut(idx * 4..idx * 4 + 4) {
        Some(word) => {
            word.copy_from_slice(&value.to_be_bytes());
            true
        }
        None => false,
    }
}

fn put_bytes(wa: &mut [u8], offset: usize, bytes: &[u8]) -> bool {
    match wa.get_mut(offset..offset + bytes.len()) {
        Some(dst) => {
            dst.copy_from_slice(bytes);
            true
        }
        None => false,
    }
}

fn put_cstr(wa: &mut [u8], offset: usize, s: &str) -> bool {
    put_bytes(wa, offset, s.as_bytes()) && put_bytes(wa, offset + s.len(), &[0])
}

impl ConfigureConnector {
    /// Stages `fragment` for the function at `devfn`.
    pub fn stage(&mut self, fragment: DtNode, devfn: u8) {
        self.fragment = Some(fragment);
        self.devfn = Some(devfn);
        self.cursor = FragmentCursor::new();
        self.depth = 0;
        self.state = ConnectorState::Pending;
    }

    /// Drops the staged fragment and returns the devfn it described.
    pub fn clear(&mut self) -> Option<u8> {
        let devfn = self.devfn.take();
        *self = ConfigureConnector::default();
        devfn
    }

    /// The staged fragment.
    pub fn fragment(&self) -> Option<&DtNode> {
        self.fragment.as_ref()
    }

    /// Delivers the next fragment tag into the work area `wa`.
    pub fn step(&mut self, wa: &mut [u8]) -> CcResponse {
        if self.state == ConnectorState::Pending {
            self.depth = 0;
            self.cursor = FragmentCursor::new();
            self.state = ConnectorState::Active;
        }
        if self.state == ConnectorState::Idle {
            return CcResponse::Error;
        }
        let Some(fragment) = &self.fragment else {
            return CcResponse::Error;
        };

        match self.cursor.next_tag(fragment) {
            FdtTag::BeginNode(name) => {
                self.depth += 1;
                if !put_be32(wa, CC_IDX_NODE_NAME_OFFSET, CC_VAL_DATA_OFFSET as u32)
                    || !put_cstr(wa, CC_VAL_DATA_OFFSET, name)
                {
                    return CcResponse::Error;
                }
                CcResponse::NextChild
            }
            FdtTag::Property(prop) => {
                let data_offset = CC_VAL_DATA_OFFSET + prop.name.len() + 1;
                let ok = put_be32(wa, CC_IDX_PROP_NAME_OFFSET, CC_VAL_DATA_OFFSET as u32)
                    && put_be32(wa, CC_IDX_PROP_LEN, prop.value.len() as u32)
                    && put_be32(wa, CC_IDX_PROP_DATA_OFFSET, data_offset as u32)
                    && put_cstr(wa, CC_VAL_DATA_OFFSET, &prop.name)
                    && put_bytes(wa, data_offset, &prop.value);
                if !ok {
                    return CcResponse::Error;
                }
                CcResponse::NextProperty
            }
            FdtTag::EndNode => {
                self.depth = self.depth.saturating_sub(1);
                if self.depth == 0 {
                    self.state = ConnectorState::Pending;
                    CcResponse::Success
                } else {
                    CcResponse::PrevParent
                }
            }
            FdtTag::End => CcResponse::Error,
        }
    }
}

/// One connector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrcEntry {
    /// Index the guest addresses the connector by.
    pub index: u32,
    /// Indicator/sensor word.
    pub state: DrcState,
    /// Removal was requested and waits for the guest to isolate the slot.
    pub awaiting_release: bool,
    /// Configure-connector staging.
    pub cc: ConfigureConnector,
}

impl DrcEntry {
    pub fn new(index: u32) -> Self {
        DrcEntry {
            index,
            state: DrcState::default(),
            awaiting_release: false,
            cc: ConfigureConnector::default(),
        }
    }

    /// The guest has isolated the slot, so the function can go away.
    pub fn is_releasable(&self) -> bool {
        self.state.get(DrcField::Isolation) == 0
    }

    /// Finishes an unplug: drops the fragment and marks the slot empty. Returns the devfn of
    /// the function the caller has to detach.
    pub fn release(&mut self) -> Option<u8> {
        let devfn = self.cc.clear();
        self.state.set(DrcField::EntitySense, ENTITY_SENSE_EMPTY);
        self.awaiting_release = false;
        devfn
    }
}

/// Connectors of one PHB: the PHB itself plus its slots.
///
/// Only bridges configured by index have connectors. Explicitly placed bridges get an empty
/// table, so their functions cannot be hot-plugged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PhbDrcTable {
    /// Connector of the bridge itself.
    pub phb: Option<DrcEntry>,
    /// Slot connectors indexed by slot number.
    pub slots: Vec<DrcEntry>,
}

/// Which connector of a PHB an index resolved to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrcLocation {
    Phb,
    Slot(u8),
}

impl PhbDrcTable {
    /// Builds the table for the PHB with `phb_index`, or an empty one without an index.
    pub fn new(phb_index: Option<u32>) -> Self {
        let Some(phb_index) = phb_index else {
            return PhbDrcTable::default();
        };
        let mut phb = DrcEntry::new(DRC_INDEX_PHB_BASE + phb_index);
        phb.state.set(DrcField::EntitySense, ENTITY_SENSE_UNUSABLE);
        PhbDrcTable {
            phb: Some(phb),
            slots: (0..PCI_SLOT_MAX)
                .map(|slot| DrcEntry::new(slot_drc_index(phb_index, slot)))
                .collect(),
        }
    }

    /// Whether the bridge has hot-plug connectors at all.
    pub fn is_empty(&self) -> bool {
        self.phb.is_none() && self.slots.is_empty()
    }

    pub fn locate(&self, index: u32) -> Option<DrcLocation> {
        if self.phb.as_ref().is_some_and(|phb| phb.index == index) {
            return Some(DrcLocation::Phb);
        }
        self.slots
            .iter()
            .position(|entry| entry.index == index)
            .map(|slot| DrcLocation::Slot(slot as u8))
    }

    pub fn entry(&self, location: DrcLocation) -> Option<&DrcEntry> {
        match location {
            DrcLocation::Phb => self.phb.as_ref(),
            DrcLocation::Slot(slot) => self.slots.get(usize::from(slot)),
        }
    }

    pub fn entry_mut(&mut self, location: DrcLocation) -> Option<&mut DrcEntry> {
        match location {
            DrcLocation::Phb => self.phb.as_mut(),
            DrcLocation::Slot(slot) => self.slots.get_mut(usize::from(slot)),
        }
    }

    /// Slot connector indexes in slot order.
    pub fn slot_indexes(&self) -> Vec<u32> {
        self.slots.iter().map(|entry| entry.index).collect()
    }
}

// set-indicator
pub(crate) fn rtas_set_indicator(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(3, 1)?;
    let indicator = call.arg(0);
    let drc_index = call.arg(1);
    let value = call.arg(2);

    let field = DrcField::from_indicator(indicator).ok_or_else(|| {
        log::debug!("drc: indicator {indicator} not implemented");
        RtasStatus::ParamError
    })?;

    if drc_index == 0 {
        machine.platform_state_mut().set(field, value);
        return Ok(());
    }

    let (phb, location) = machine.find_drc_mut(drc_index).ok_or_else(|| {
        log::debug!("drc: no connector {drc_index:#x}");
        RtasStatus::ParamError
    })?;
    let entry = phb.drc.entry_mut(location).ok_or(RtasStatus::ParamError)?;
    let isolating = field == DrcField::Isolation
        && entry.state.get(field) != value
        && value == 0
        && entry.awaiting_release;
    entry.state.set(field, value);

    if isolating && let DrcLocation::Slot(slot) = location {
        let buid = phb.buid();
        // The guest finished its side of an unplug requested earlier.
        crate::hotplug::complete_unplug(machine, buid, slot);
    }
    Ok(())
}

// get-sensor-state
pub(crate) fn rtas_get_sensor_state(
    machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(2, 2)?;
    let sensor = call.arg(0);
    let drc_index = call.arg(1);

    let state = if drc_index == 0 {
        *machine.platform_state_mut()
    } else {
        let (phb, location) = machine
            .find_drc_mut(drc_index)
            .ok_or(RtasStatus::ParamError)?;
        phb.drc.entry(location).ok_or(RtasStatus::ParamError)?.state
    };
    let field = DrcField::from_sensor(sensor).ok_or(RtasStatus::ParamError)?;
    call.set_ret(1, state.get(field));
    Ok(())
}

// set-power-level
pub(crate) fn rtas_set_power_level(
    _machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(2, 2)?;
    call.set_ret(1, DRC_POWER_LEVEL_FULL);
    Ok(())
}

// get-power-level
pub(crate) fn rtas_get_power_level(
    _machine: &mut SpaprMachine,
    call: &mut RtasCall,
) -> Result<(), RtasStatus> {
    call.expect_counts(1, 2)?;
    call.set_ret(1, DRC_POWER_LEVEL_FULL);
    Ok(())
}
