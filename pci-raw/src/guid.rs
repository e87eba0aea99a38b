// SPDX-License-Identifier: MIT OR Apache-2.0

//! Well-known GUIDs published by the core.

use uguid::{guid, Guid};

/// Identifies the `DeviceFacade` interface a [`FacadeRegistry`](crate) entry
/// is published under.
pub const DEVICE_FACADE_PROTOCOL: Guid = guid!("8a219776-2ed3-42d6-9b4c-1f6e4e6c9d11");

/// Identifies the signal an orchestrator consumer waits on to learn that
/// essential-device enumeration has completed (`spec.md` §4.8, step 7).
pub const ESSENTIAL_DEVICES_READY: Guid = guid!("c8339aa0-1b0b-4cb8-9a8b-6f1a4b9d2b77");

/// Identifies the `Iommu` external collaborator interface.
pub const IOMMU_PROTOCOL: Guid = guid!("d587a5c3-4f0f-4a9a-9e6d-35bb5e8f9a2c");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guids_are_distinct() {
        assert_ne!(DEVICE_FACADE_PROTOCOL, ESSENTIAL_DEVICES_READY);
        assert_ne!(DEVICE_FACADE_PROTOCOL, IOMMU_PROTOCOL);
        assert_ne!(ESSENTIAL_DEVICES_READY, IOMMU_PROTOCOL);
    }
}
