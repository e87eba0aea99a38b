// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resource-node kind tags, BAR decode results, and bridge window register
//! bit-packing (`spec.md` §3, §4.2, §6, §9).

use bitflags::bitflags;

bitflags! {
    /// Tag for a resource node, as two orthogonal bits (`spec.md` §9): which
    /// address space (`IO`/`MEM`), and whether the node is a device's own BAR
    /// or a bridge aperture propagated upward from a child bridge.
    ///
    /// Representing the 4-element set this way keeps "first node of kind in
    /// {`IoResource`, `IoAperture`}" a single `.contains(ResourceKind::IO)`
    /// test instead of a match over four variants.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceKind: u8 {
        /// Set for I/O-space nodes, clear for memory-space nodes.
        const IO = 1 << 0;
        /// Set for an aperture propagated from a child bridge, clear for a
        /// device's own BAR.
        const APERTURE = 1 << 1;
    }
}

impl ResourceKind {
    pub const IO_RESOURCE: Self = Self::IO;
    pub const MEM_RESOURCE: Self = Self::empty();
    pub const IO_APERTURE: Self = Self::IO.union(Self::APERTURE);
    pub const MEM_APERTURE: Self = Self::APERTURE;

    /// True for `IoResource`/`IoAperture`.
    #[must_use]
    pub const fn is_io(self) -> bool {
        self.contains(Self::IO)
    }

    /// True for `IoAperture`/`MemAperture`.
    #[must_use]
    pub const fn is_aperture(self) -> bool {
        self.contains(Self::APERTURE)
    }

    /// The alignment unit a node of this kind rounds length up to when it is
    /// materialized as an aperture: 1 MiB for memory, 4 KiB for I/O.
    #[must_use]
    pub const fn aperture_granularity(self) -> u64 {
        if self.is_io() {
            0x1000
        } else {
            0x10_0000
        }
    }
}

/// Result of sizing one BAR (`spec.md` §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarDecode {
    /// Slot is unimplemented.
    Absent,
    /// 32-bit I/O BAR of the given length.
    Io { length: u32 },
    /// 32-bit memory BAR.
    Mem32 { length: u32, prefetchable: bool },
    /// 64-bit memory BAR whose low-half length encodes at most 2 GiB; the
    /// core treats it as a 32-bit placement and the paired high BAR index
    /// must be skipped by the caller.
    Mem64 {
        length: u32,
        prefetchable: bool,
    },
    /// A 64-bit memory BAR whose encoded length exceeds 2 GiB. The core does
    /// not place BARs requiring a >4G-capable window; the owning device is
    /// invalidated for resource allocation.
    UnsupportedAbove4G,
}

impl BarDecode {
    /// Number of consecutive BAR slots this decode consumes (2 for a 64-bit
    /// memory BAR pair, 1 otherwise).
    #[must_use]
    pub const fn slots(self) -> u8 {
        match self {
            Self::Mem64 { .. } | Self::UnsupportedAbove4G => 2,
            _ => 1,
        }
    }
}

/// Packs a bridge's memory base/limit into the 32-bit register written at
/// offset `0x20` (`spec.md` §6): low 16 bits are `base >> 16`, high 16 bits
/// are `limit >> 16`, each with the low nibble reserved (always zero, since
/// both are 1 MiB-aligned).
#[must_use]
pub const fn encode_mem_base_limit(base: u32, limit: u32) -> u32 {
    let low = (base >> 16) & 0xFFF0;
    let high = (limit >> 16) & 0xFFF0;
    (high << 16) | low
}

/// Packs a bridge's I/O base/limit into the 32-bit register written at
/// offset `0x1C` (`spec.md` §6): low 8 bits are `base >> 8`, high 8 bits are
/// `limit >> 8`, of the low 16-bit I/O base and limit respectively. 32-bit
/// I/O is not supported by this core, so only the low 16 bits of each
/// address are ever consulted.
#[must_use]
pub const fn encode_io_base_limit(base: u16, limit: u16) -> u32 {
    let low = ((base >> 8) as u32) & 0xFF;
    let high = ((limit >> 8) as u32) & 0xFF;
    (high << 8) | low
}
