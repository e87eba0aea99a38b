// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operation and attribute vocabulary for the `Iommu` external collaborator
//! (`spec.md` §6), modeled on the EDKII IOMMU protocol's operation codes and
//! access/attribute bitflags.

use bitflags::bitflags;

newtype_enum! {
/// The kind of DMA mapping being requested of an [`Iommu`](crate) collaborator.
///
/// `_64` variants request a mapping restricted to the low 4 GiB of address
/// space, for devices whose BARs were placed as `Mem32`/`Mem64`-without-room
/// and therefore cannot be handed an address above `0xFFFF_FFFF`.
#[must_use]
pub enum IommuOperation: u32 => {
    BUS_MASTER_READ = 0,
    BUS_MASTER_WRITE = 1,
    BUS_MASTER_COMMON_BUFFER = 2,
    BUS_MASTER_READ_64 = 3,
    BUS_MASTER_WRITE_64 = 4,
    BUS_MASTER_COMMON_BUFFER_64 = 5,
    MAXIMUM = 6,
}
}

bitflags! {
    /// Attributes a device may request for an IOMMU-backed DMA mapping.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IommuAttribute: u64 {
        const MEMORY_WRITE_COMBINE = 1 << 0;
        const MEMORY_CACHED = 1 << 1;
        const DUAL_ADDRESS_CYCLE = 1 << 2;
        const MEMORY_ENCRYPTED = 1 << 3;
        const _ = !0;
    }
}

bitflags! {
    /// Access rights requested for a mapping.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IommuAccess: u64 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const _ = !0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_debug_prints_variant_name() {
        assert_eq!(format!("{:?}", IommuOperation::BUS_MASTER_COMMON_BUFFER_64), "IommuOperation::BUS_MASTER_COMMON_BUFFER_64");
    }

    #[test]
    fn access_bits_are_independent() {
        let rw = IommuAccess::READ | IommuAccess::WRITE;
        assert!(rw.contains(IommuAccess::READ));
        assert!(rw.contains(IommuAccess::WRITE));
        assert!(!IommuAccess::READ.contains(IommuAccess::WRITE));
    }
}
