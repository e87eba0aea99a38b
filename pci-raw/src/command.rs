// SPDX-License-Identifier: MIT OR Apache-2.0

//! The PCI command and status registers (config-space offset `0x04`).

use bitflags::bitflags;

bitflags! {
    /// The command register. Bits `IO_ENABLE`/`MEMORY_ENABLE`/`BUS_MASTER_ENABLE`
    /// are the "decoding" and attribute-enable bits the core reads and writes.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandRegister: u16 {
        /// The function responds to I/O space accesses.
        const IO_ENABLE = 1 << 0;
        /// The function responds to memory space accesses.
        const MEMORY_ENABLE = 1 << 1;
        /// The function may act as a bus master (initiate DMA).
        const BUS_MASTER_ENABLE = 1 << 2;
        const SPECIAL_CYCLE_ENABLE = 1 << 3;
        const MEMORY_WRITE_AND_INVALIDATE = 1 << 4;
        const VGA_PALETTE_SNOOP = 1 << 5;
        const PARITY_ERROR_RESPONSE = 1 << 6;
        const SERR_ENABLE = 1 << 8;
        const FAST_BACK_TO_BACK_ENABLE = 1 << 9;
        const INTERRUPT_DISABLE = 1 << 10;
        const _ = !0;
    }
}

impl CommandRegister {
    /// A function is "decoding" (per `spec.md` §4.3) if it already claims
    /// I/O or memory transactions in its current BAR-programmed range.
    #[must_use]
    pub const fn is_decoding(self) -> bool {
        self.intersects(Self::IO_ENABLE.union(Self::MEMORY_ENABLE))
    }
}

bitflags! {
    /// The status register. Only the bit the core inspects is modeled.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StatusRegister: u16 {
        const HAS_CAPABILITY_LIST = 1 << 4;
        const _ = !0;
    }
}
