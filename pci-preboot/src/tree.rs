// SPDX-License-Identifier: MIT OR Apache-2.0

//! The bridge/endpoint/resource tree (`spec.md` §3), realized as an arena
//! (`spec.md` §9): `Tree` owns two `Vec`s and every cross reference —
//! parent pointers, a resource node's owning device, an aperture's child
//! bridge — is a plain `Copy` index into one of them. No borrowed
//! references cross node boundaries, so the tree has no aliasing to
//! manage and is trivially inspectable from tests.

use alloc::vec::Vec;
use log::trace;

use pci_raw::command::CommandRegister;
use pci_raw::resource::ResourceKind;

use crate::external::DevicePath;
use crate::sbdf::Sbdf;

/// An index into [`Tree`]'s bridge arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BridgeId(usize);

/// An index into [`Tree`]'s device arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(usize);

/// One discovered function that participates in resource allocation:
/// every bridge, and every essential endpoint (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub sbdf: Sbdf,
    /// Precomputed ECAM base address for this function (offset 0).
    pub config_base: u64,
    pub supported_attributes: CommandRegister,
    pub current_attributes: CommandRegister,
    pub parent: Option<BridgeId>,
    /// Set by the orchestrator for essential endpoints only (`spec.md`
    /// §4.8 step 6); bridges and non-essential endpoints leave this `None`.
    pub device_path: Option<DevicePath>,
}

impl DeviceRecord {
    #[must_use]
    pub const fn new(sbdf: Sbdf, config_base: u64, supported_attributes: CommandRegister, parent: Option<BridgeId>) -> Self {
        Self {
            sbdf,
            config_base,
            supported_attributes,
            current_attributes: CommandRegister::empty(),
            parent,
            device_path: None,
        }
    }
}

/// One BAR requiring allocation, or one propagated aperture (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceNode {
    pub device: DeviceId,
    /// The BAR index (0..5) for a `*Resource` node; unused (`0`) for an
    /// aperture, which instead is looked up through `device`'s own
    /// bridge-window registers.
    pub bar_index: u8,
    pub length: u64,
    pub alignment: u64,
    pub offset: u64,
    pub kind: ResourceKind,
}

/// One bridge, including the synthetic root bridge of a host bridge
/// (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct BridgeRecord {
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    pub parent: Option<BridgeId>,
    pub device: DeviceId,
    pub children: Vec<BridgeId>,
    pub resources: Vec<ResourceNode>,
    pub endpoints: Vec<DeviceId>,
}

impl BridgeRecord {
    #[must_use]
    pub const fn new(secondary_bus: u8, subordinate_bus: u8, parent: Option<BridgeId>, device: DeviceId) -> Self {
        Self {
            secondary_bus,
            subordinate_bus,
            parent,
            device,
            children: Vec::new(),
            resources: Vec::new(),
            endpoints: Vec::new(),
        }
    }
}

/// The arena. All records for one host bridge's enumeration live here,
/// from the synthetic root allocated first (`root()`) through teardown.
#[derive(Debug, Default)]
pub struct Tree {
    bridges: Vec<BridgeRecord>,
    devices: Vec<DeviceRecord>,
}

impl Tree {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bridges: Vec::new(),
            devices: Vec::new(),
        }
    }

    /// The synthetic root bridge, which must be the first one allocated.
    #[must_use]
    pub const fn root(&self) -> BridgeId {
        BridgeId(0)
    }

    pub fn alloc_device(&mut self, record: DeviceRecord) -> DeviceId {
        self.devices.push(record);
        DeviceId(self.devices.len() - 1)
    }

    pub fn alloc_bridge(&mut self, record: BridgeRecord) -> BridgeId {
        self.bridges.push(record);
        BridgeId(self.bridges.len() - 1)
    }

    #[must_use]
    pub fn device(&self, id: DeviceId) -> &DeviceRecord {
        &self.devices[id.0]
    }

    pub fn device_mut(&mut self, id: DeviceId) -> &mut DeviceRecord {
        &mut self.devices[id.0]
    }

    #[must_use]
    pub fn bridge(&self, id: BridgeId) -> &BridgeRecord {
        &self.bridges[id.0]
    }

    pub fn bridge_mut(&mut self, id: BridgeId) -> &mut BridgeRecord {
        &mut self.bridges[id.0]
    }

    pub fn push_child(&mut self, parent: BridgeId, child: BridgeId) {
        self.bridges[parent.0].children.push(child);
    }

    pub fn push_endpoint(&mut self, bridge: BridgeId, device: DeviceId) {
        self.bridges[bridge.0].endpoints.push(device);
    }

    pub fn push_resource(&mut self, bridge: BridgeId, node: ResourceNode) {
        self.bridges[bridge.0].resources.push(node);
    }

    /// Removes every resource node on `bridge` owned by `device` (`spec.md`
    /// §4.2: an invalidated 64-bit BAR's earlier `MemResource` nodes are
    /// removed from the tree).
    pub fn remove_resources_of(&mut self, bridge: BridgeId, device: DeviceId) {
        self.bridges[bridge.0].resources.retain(|node| node.device != device);
    }

    /// Logs a post-order walk (children, then resource list, then the
    /// bridge itself) matching the lifecycle `spec.md` §3 describes, then
    /// drops the whole arena. Published facades never reference this tree
    /// (they hold their own ancestor snapshot, `spec.md` §9) so dropping it
    /// wholesale after the walk is observationally equivalent to freeing
    /// node-by-node in that order.
    pub fn teardown(self, root: BridgeId) {
        self.log_teardown_order(root);
    }

    fn log_teardown_order(&self, bridge_id: BridgeId) {
        let bridge = self.bridge(bridge_id);
        for &child in &bridge.children {
            self.log_teardown_order(child);
        }
        trace!(
            "tearing down bridge sec={}: {} resource nodes, {} endpoints",
            bridge.secondary_bus,
            bridge.resources.len(),
            bridge.endpoints.len()
        );
    }
}
