// SPDX-License-Identifier: MIT OR Apache-2.0

//! BAR sizing by write-all-ones/read-back (`spec.md` §4.2).

use log::trace;
use pci_raw::resource::BarDecode;

use crate::cfg_access::{CfgAccess, BAR0_OFFSET};
use crate::sbdf::Sbdf;

/// A 64-bit memory BAR whose length exceeds this is `UnsupportedAbove4G`
/// (`spec.md` §1 Non-goals, §4.2, boundary case B2). 2 GiB exactly is
/// accepted.
const MAX_64BIT_LENGTH: u64 = 0x8000_0000;

const BAR_IO_BIT: u32 = 1 << 0;
const BAR_TYPE_MASK: u32 = 0b11 << 1;
const BAR_TYPE_64BIT: u32 = 0b10 << 1;
const BAR_PREFETCHABLE_BIT: u32 = 1 << 3;
const BAR_IO_DECODE_MASK: u32 = !0b11;
const BAR_MEM_DECODE_MASK: u32 = !0b1111;

/// Sizes one function's BARs by saving the original value, writing
/// all-ones, reading back the decode mask, and restoring the original
/// (`spec.md` §4.2, property R1).
#[derive(Debug, Clone, Copy)]
pub struct BarProbe<'a> {
    cfg: CfgAccess<'a>,
}

impl<'a> BarProbe<'a> {
    #[must_use]
    pub const fn new(cfg: CfgAccess<'a>) -> Self {
        Self { cfg }
    }

    /// Sizes the BAR at `bar_index` (0..5 for an endpoint, 0..1 for a
    /// bridge). Leaves the BAR's programmed value exactly as it found it.
    #[must_use]
    pub fn size(&self, sbdf: Sbdf, bar_index: u8) -> BarDecode {
        let offset = BAR0_OFFSET + 4 * u16::from(bar_index);
        let probed = self.probe_dword(sbdf, offset);

        if probed == 0 {
            return BarDecode::Absent;
        }

        if probed & BAR_IO_BIT != 0 {
            let length = (!(probed & BAR_IO_DECODE_MASK)).wrapping_add(1);
            trace!("{:?} bar{}: io, length=0x{:x}", sbdf, bar_index, length);
            return BarDecode::Io { length };
        }

        let prefetchable = probed & BAR_PREFETCHABLE_BIT != 0;

        if probed & BAR_TYPE_MASK != BAR_TYPE_64BIT {
            let length = (!(probed & BAR_MEM_DECODE_MASK)).wrapping_add(1);
            trace!("{:?} bar{}: mem32, length=0x{:x}, pf={}", sbdf, bar_index, length, prefetchable);
            return BarDecode::Mem32 { length, prefetchable };
        }

        let probed_high = self.probe_dword(sbdf, offset + 4);
        let mask = (u64::from(probed_high) << 32) | u64::from(probed & BAR_MEM_DECODE_MASK);
        let length64 = (!mask).wrapping_add(1);

        if length64 > MAX_64BIT_LENGTH {
            trace!("{:?} bar{}: mem64 length=0x{:x} exceeds 2GiB, unsupported", sbdf, bar_index, length64);
            return BarDecode::UnsupportedAbove4G;
        }

        trace!("{:?} bar{}: mem64, length=0x{:x}, pf={}", sbdf, bar_index, length64, prefetchable);
        BarDecode::Mem64 {
            length: length64 as u32,
            prefetchable,
        }
    }

    fn probe_dword(&self, sbdf: Sbdf, offset: u16) -> u32 {
        let original = self.cfg.read32(sbdf, offset);
        self.cfg.write32(sbdf, offset, 0xFFFF_FFFF);
        let probed = self.cfg.read32(sbdf, offset);
        self.cfg.write32(sbdf, offset, original);
        probed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ConfigSpace;
    use alloc::collections::BTreeMap;
    use core::cell::RefCell;

    /// Models BAR hardware directly: a write of `0xFFFF_FFFF` exposes the
    /// fixed decode mask instead of storing it, any other write programs
    /// exactly the given value.
    #[derive(Debug, Default)]
    struct FakeConfigSpace {
        decode_mask: RefCell<BTreeMap<u64, u32>>,
        programmed: RefCell<BTreeMap<u64, u32>>,
    }

    impl FakeConfigSpace {
        fn set_decode_mask(&self, sbdf: Sbdf, offset: u16, mask: u32) {
            self.decode_mask.borrow_mut().insert(sbdf.ecam_address(0, offset), mask);
        }

        fn program(&self, sbdf: Sbdf, offset: u16, value: u32) {
            self.programmed.borrow_mut().insert(sbdf.ecam_address(0, offset), value);
        }

        fn programmed_value(&self, sbdf: Sbdf, offset: u16) -> u32 {
            *self.programmed.borrow().get(&sbdf.ecam_address(0, offset)).unwrap()
        }
    }

    impl ConfigSpace for FakeConfigSpace {
        unsafe fn read8(&self, _address: u64) -> u8 {
            unimplemented!()
        }
        unsafe fn read16(&self, _address: u64) -> u16 {
            unimplemented!()
        }
        unsafe fn read32(&self, address: u64) -> u32 {
            *self.programmed.borrow().get(&address).unwrap_or(&0xFFFF_FFFF)
        }
        unsafe fn write8(&self, _address: u64, _value: u8) {
            unimplemented!()
        }
        unsafe fn write16(&self, _address: u64, _value: u16) {
            unimplemented!()
        }
        unsafe fn write32(&self, address: u64, value: u32) {
            if value == 0xFFFF_FFFF {
                let mask = *self.decode_mask.borrow().get(&address).unwrap_or(&0);
                self.programmed.borrow_mut().insert(address, mask);
            } else {
                self.programmed.borrow_mut().insert(address, value);
            }
        }
    }

    fn probe(decode_mask: u32, sbdf: Sbdf, bar_index: u8) -> BarDecode {
        let backing = FakeConfigSpace::default();
        let offset = BAR0_OFFSET + 4 * u16::from(bar_index);
        backing.set_decode_mask(sbdf, offset, decode_mask);
        let cfg = CfgAccess::new(&backing, 0);
        BarProbe::new(cfg).size(sbdf, bar_index)
    }

    #[test]
    fn absent_bar_sizes_to_zero_length() {
        assert_eq!(probe(0x0000_0000, Sbdf::new(0, 1, 0, 0), 0), BarDecode::Absent);
    }

    #[test]
    fn mem32_bar_sizes_per_s1() {
        // S1: BAR0 = 32-bit memory, size 0x1_0000
        let decode = probe(0xFFFF_0000, Sbdf::new(0, 1, 0, 0), 0);
        assert_eq!(decode, BarDecode::Mem32 { length: 0x1_0000, prefetchable: false });
    }

    #[test]
    fn io_bar_sizes_correctly() {
        let decode = probe(0xFFFF_FF01, Sbdf::new(0, 1, 0, 0), 0);
        assert_eq!(decode, BarDecode::Io { length: 0x100 });
    }

    #[test]
    fn exactly_2gib_64bit_bar_is_accepted_b2() {
        let backing = FakeConfigSpace::default();
        let sbdf = Sbdf::new(0, 1, 0, 0);
        // Two's complement of a 0x8000_0000 (2 GiB) length: high dword all
        // ones, low dword 0x8000_0000 with the 64-bit type bits set.
        backing.set_decode_mask(sbdf, BAR0_OFFSET, 0x8000_0000 | 0b0100);
        backing.set_decode_mask(sbdf, BAR0_OFFSET + 4, 0xFFFF_FFFF);
        let cfg = CfgAccess::new(&backing, 0);
        let decode = BarProbe::new(cfg).size(sbdf, 0);
        assert_eq!(decode, BarDecode::Mem64 { length: 0x8000_0000, prefetchable: false });
    }

    #[test]
    fn above_2gib_64bit_bar_is_unsupported_b2() {
        let backing = FakeConfigSpace::default();
        let sbdf = Sbdf::new(0, 1, 0, 0);
        // Two's complement of a 0x8000_1000 length: just over 2 GiB.
        backing.set_decode_mask(sbdf, BAR0_OFFSET, 0x7FFF_F000 | 0b0100);
        backing.set_decode_mask(sbdf, BAR0_OFFSET + 4, 0xFFFF_FFFF);
        let cfg = CfgAccess::new(&backing, 0);
        let decode = BarProbe::new(cfg).size(sbdf, 0);
        assert_eq!(decode, BarDecode::UnsupportedAbove4G);
    }

    #[test]
    fn restores_original_value_after_probe_r1() {
        let backing = FakeConfigSpace::default();
        let sbdf = Sbdf::new(0, 1, 0, 0);
        backing.program(sbdf, BAR0_OFFSET, 0xC000_0000);
        let cfg = CfgAccess::new(&backing, 0);
        let probe = BarProbe::new(cfg);
        let _ = probe.probe_dword(sbdf, BAR0_OFFSET);
        assert_eq!(backing.programmed_value(sbdf, BAR0_OFFSET), 0xC000_0000);
    }
}
