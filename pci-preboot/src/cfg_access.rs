// SPDX-License-Identifier: MIT OR Apache-2.0

//! Config-space access, presence/multi-function probing, device-type
//! classification, and the capability-chain walk (`spec.md` §4.1).

use log::trace;
use pci_raw::command::{CommandRegister, StatusRegister};

use crate::external::ConfigSpace;
use crate::sbdf::Sbdf;

/// Offset of the base address register for BAR index 0. Each subsequent
/// BAR is 4 bytes further on, per `spec.md` §4.5
/// (`R_BASE_ADDRESS_OFFSET_0 + 4*barIndex`).
pub const BAR0_OFFSET: u16 = 0x10;
const VENDOR_ID_OFFSET: u16 = 0x00;
pub(crate) const COMMAND_OFFSET: u16 = 0x04;
const STATUS_OFFSET: u16 = 0x06;
const SUBCLASS_OFFSET: u16 = 0x0A;
const BASE_CLASS_OFFSET: u16 = 0x0B;
const HEADER_TYPE_OFFSET: u16 = 0x0E;
const SECONDARY_BUS_OFFSET: u16 = 0x19;
const SUBORDINATE_BUS_OFFSET: u16 = 0x1A;
const CAPABILITIES_POINTER_OFFSET: u16 = 0x34;
const BRIDGE_MEM_BASE_LIMIT_OFFSET: u16 = 0x20;
const BRIDGE_IO_BASE_LIMIT_OFFSET: u16 = 0x1C;

/// The PCI Express Capability's id in the capability chain.
pub const PCIE_CAPABILITY_ID: u8 = 0x10;

const HEADER_TYPE_MULTI_FUNCTION_BIT: u8 = 0x80;
const HEADER_TYPE_LAYOUT_MASK: u8 = 0x7F;
const HEADER_TYPE_BRIDGE: u8 = 0x01;

/// Bounds the capability-chain walk against a corrupt or cyclic chain; no
/// PCI device legitimately has more than a handful of capabilities.
const MAX_CAPABILITY_CHAIN_LENGTH: u32 = 48;

/// Classification of a function's PCIe role, derived from the PCI Express
/// Capability's device/port type field (`spec.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    /// No PCI Express Capability; a conventional-PCI-era function.
    Legacy,
    Endpoint,
    PcieUpstreamPort,
    PcieDownstreamPort,
}

const DEVICE_PORT_TYPE_UPSTREAM_PORT: u8 = 0x5;
const DEVICE_PORT_TYPE_DOWNSTREAM_PORT: u8 = 0x6;

/// Reads and writes config space for a single segment through a
/// [`ConfigSpace`] collaborator, and derives the presence/classification
/// facts the rest of this crate needs.
#[derive(Debug, Clone, Copy)]
pub struct CfgAccess<'a> {
    config_space: &'a dyn ConfigSpace,
    ecam_base: u64,
}

impl<'a> CfgAccess<'a> {
    #[must_use]
    pub const fn new(config_space: &'a dyn ConfigSpace, ecam_base: u64) -> Self {
        Self {
            config_space,
            ecam_base,
        }
    }

    #[must_use]
    pub fn read8(&self, sbdf: Sbdf, offset: u16) -> u8 {
        unsafe { self.config_space.read8(sbdf.ecam_address(self.ecam_base, offset)) }
    }

    #[must_use]
    pub fn read16(&self, sbdf: Sbdf, offset: u16) -> u16 {
        unsafe { self.config_space.read16(sbdf.ecam_address(self.ecam_base, offset)) }
    }

    #[must_use]
    pub fn read32(&self, sbdf: Sbdf, offset: u16) -> u32 {
        unsafe { self.config_space.read32(sbdf.ecam_address(self.ecam_base, offset)) }
    }

    pub fn write8(&self, sbdf: Sbdf, offset: u16, value: u8) {
        unsafe { self.config_space.write8(sbdf.ecam_address(self.ecam_base, offset), value) }
    }

    pub fn write16(&self, sbdf: Sbdf, offset: u16, value: u16) {
        unsafe { self.config_space.write16(sbdf.ecam_address(self.ecam_base, offset), value) }
    }

    pub fn write32(&self, sbdf: Sbdf, offset: u16, value: u32) {
        unsafe { self.config_space.write32(sbdf.ecam_address(self.ecam_base, offset), value) }
    }

    /// A function is present iff its vendor id does not read as `0xFFFF`.
    #[must_use]
    pub fn is_present(&self, sbdf: Sbdf) -> bool {
        self.read16(sbdf, VENDOR_ID_OFFSET) != 0xFFFF
    }

    /// Header-type bit 7: function 0 of a multi-function device.
    #[must_use]
    pub fn is_multi_function(&self, sbdf: Sbdf) -> bool {
        self.read8(sbdf, HEADER_TYPE_OFFSET) & HEADER_TYPE_MULTI_FUNCTION_BIT != 0
    }

    #[must_use]
    pub fn header_layout(&self, sbdf: Sbdf) -> u8 {
        self.read8(sbdf, HEADER_TYPE_OFFSET) & HEADER_TYPE_LAYOUT_MASK
    }

    /// Header type 1: a PCI-to-PCI bridge.
    #[must_use]
    pub fn is_bridge(&self, sbdf: Sbdf) -> bool {
        self.header_layout(sbdf) == HEADER_TYPE_BRIDGE
    }

    #[must_use]
    pub fn command(&self, sbdf: Sbdf) -> CommandRegister {
        CommandRegister::from_bits_retain(self.read16(sbdf, COMMAND_OFFSET))
    }

    pub fn set_command(&self, sbdf: Sbdf, command: CommandRegister) {
        trace!("{:?}: command <- {:?}", sbdf, command);
        self.write16(sbdf, COMMAND_OFFSET, command.bits());
    }

    #[must_use]
    pub fn status(&self, sbdf: Sbdf) -> StatusRegister {
        StatusRegister::from_bits_retain(self.read16(sbdf, STATUS_OFFSET))
    }

    /// `(base class, subclass)`, used by [`crate::essential`]'s policy.
    #[must_use]
    pub fn class_code(&self, sbdf: Sbdf) -> (u8, u8) {
        (self.read8(sbdf, BASE_CLASS_OFFSET), self.read8(sbdf, SUBCLASS_OFFSET))
    }

    pub fn set_secondary_subordinate_bus(&self, sbdf: Sbdf, secondary: u8, subordinate: u8) {
        self.write8(sbdf, SECONDARY_BUS_OFFSET, secondary);
        self.write8(sbdf, SUBORDINATE_BUS_OFFSET, subordinate);
    }

    #[must_use]
    pub fn secondary_bus(&self, sbdf: Sbdf) -> u8 {
        self.read8(sbdf, SECONDARY_BUS_OFFSET)
    }

    #[must_use]
    pub fn subordinate_bus(&self, sbdf: Sbdf) -> u8 {
        self.read8(sbdf, SUBORDINATE_BUS_OFFSET)
    }

    /// This function's precomputed config-space base address (offset 0),
    /// cached on its [`crate::tree::DeviceRecord`].
    #[must_use]
    pub fn config_base(&self, sbdf: Sbdf) -> u64 {
        sbdf.ecam_address(self.ecam_base, 0)
    }

    pub fn write_bridge_mem_base_limit(&self, sbdf: Sbdf, register: u32) {
        self.write32(sbdf, BRIDGE_MEM_BASE_LIMIT_OFFSET, register);
    }

    pub fn write_bridge_io_base_limit(&self, sbdf: Sbdf, register: u32) {
        self.write32(sbdf, BRIDGE_IO_BASE_LIMIT_OFFSET, register);
    }

    /// Walks the capability chain looking for `id`. Returns `None`
    /// immediately (without touching the capabilities-pointer register) if
    /// the status register's "has capability list" bit is clear — the same
    /// gating the `pci_types` family uses before trusting
    /// `capability_pointer()`.
    #[must_use]
    pub fn find_capability(&self, sbdf: Sbdf, id: u8) -> Option<u16> {
        if !self.status(sbdf).contains(StatusRegister::HAS_CAPABILITY_LIST) {
            return None;
        }
        let mut pointer = self.read8(sbdf, CAPABILITIES_POINTER_OFFSET) & 0xFC;
        let mut steps = 0;
        while pointer != 0 && steps < MAX_CAPABILITY_CHAIN_LENGTH {
            let cap_id = self.read8(sbdf, u16::from(pointer));
            if cap_id == id {
                return Some(u16::from(pointer));
            }
            pointer = self.read8(sbdf, u16::from(pointer) + 1) & 0xFC;
            steps += 1;
        }
        None
    }

    /// Classifies a function's PCIe role from its PCI Express Capability's
    /// device/port type field, falling back to `Legacy` if it has none.
    #[must_use]
    pub fn device_type(&self, sbdf: Sbdf) -> DeviceType {
        let Some(offset) = self.find_capability(sbdf, PCIE_CAPABILITY_ID) else {
            return DeviceType::Legacy;
        };
        let capabilities_register = self.read16(sbdf, offset + 2);
        let device_port_type = ((capabilities_register >> 4) & 0xF) as u8;
        match device_port_type {
            DEVICE_PORT_TYPE_UPSTREAM_PORT => DeviceType::PcieUpstreamPort,
            DEVICE_PORT_TYPE_DOWNSTREAM_PORT => DeviceType::PcieDownstreamPort,
            _ => DeviceType::Endpoint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;
    use core::cell::RefCell;

    #[derive(Debug, Default)]
    struct FakeConfigSpace {
        words: RefCell<BTreeMap<u64, u32>>,
    }

    impl FakeConfigSpace {
        fn set32(&self, sbdf: Sbdf, offset: u16, value: u32) {
            let address = sbdf.ecam_address(0, offset & !0x3);
            self.words.borrow_mut().insert(address, value);
        }
    }

    impl ConfigSpace for FakeConfigSpace {
        unsafe fn read8(&self, address: u64) -> u8 {
            let shift = (address & 0x3) * 8;
            ((self.read32(address & !0x3) >> shift) & 0xFF) as u8
        }

        unsafe fn read16(&self, address: u64) -> u16 {
            let shift = (address & 0x3) * 8;
            ((self.read32(address & !0x3) >> shift) & 0xFFFF) as u16
        }

        unsafe fn read32(&self, address: u64) -> u32 {
            *self.words.borrow().get(&(address & !0x3)).unwrap_or(&0xFFFF_FFFF)
        }

        unsafe fn write8(&self, address: u64, value: u8) {
            let shift = (address & 0x3) * 8;
            let mut current = self.read32(address & !0x3);
            current = (current & !(0xFFu32 << shift)) | (u32::from(value) << shift);
            self.words.borrow_mut().insert(address & !0x3, current);
        }

        unsafe fn write16(&self, address: u64, value: u16) {
            let shift = (address & 0x3) * 8;
            let mut current = self.read32(address & !0x3);
            current = (current & !(0xFFFFu32 << shift)) | (u32::from(value) << shift);
            self.words.borrow_mut().insert(address & !0x3, current);
        }

        unsafe fn write32(&self, address: u64, value: u32) {
            self.words.borrow_mut().insert(address & !0x3, value);
        }
    }

    #[test]
    fn absent_function_reads_all_ones_vendor_id() {
        let backing = FakeConfigSpace::default();
        let access = CfgAccess::new(&backing, 0);
        assert!(!access.is_present(Sbdf::new(0, 0, 0, 0)));
    }

    #[test]
    fn present_function_is_detected() {
        let backing = FakeConfigSpace::default();
        let sbdf = Sbdf::new(0, 0, 1, 0);
        backing.set32(sbdf, VENDOR_ID_OFFSET, 0x1234_5678);
        let access = CfgAccess::new(&backing, 0);
        assert!(access.is_present(sbdf));
    }

    #[test]
    fn no_capability_list_short_circuits_before_reading_pointer() {
        let backing = FakeConfigSpace::default();
        let sbdf = Sbdf::new(0, 0, 1, 0);
        let access = CfgAccess::new(&backing, 0);
        assert_eq!(access.find_capability(sbdf, PCIE_CAPABILITY_ID), None);
        assert_eq!(access.device_type(sbdf), DeviceType::Legacy);
    }

    #[test]
    fn capability_chain_walk_finds_pcie_capability() {
        let backing = FakeConfigSpace::default();
        let sbdf = Sbdf::new(0, 0, 1, 0);
        backing.set32(sbdf, STATUS_OFFSET, u32::from(StatusRegister::HAS_CAPABILITY_LIST.bits()) << 16);
        backing.set32(sbdf, CAPABILITIES_POINTER_OFFSET, 0x40);
        // capability at 0x40: id=PCIE_CAPABILITY_ID, next=0, device/port type = downstream port (0x6)
        let pcie_cap_register = 0x6u32 << 4;
        backing.set32(sbdf, 0x40, u32::from(PCIE_CAPABILITY_ID) | (pcie_cap_register << 16));
        let access = CfgAccess::new(&backing, 0);
        assert_eq!(access.find_capability(sbdf, PCIE_CAPABILITY_ID), Some(0x40));
        assert_eq!(access.device_type(sbdf), DeviceType::PcieDownstreamPort);
    }
}
