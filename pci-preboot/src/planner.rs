// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sorts, offset-assigns, and propagates apertures upward under alignment
//! and containment rules (`spec.md` §4.4). IO and MEM are planned by the
//! identical algorithm, run independently.

use alloc::vec::Vec;
use log::{debug, trace};

use pci_raw::resource::ResourceKind;

use crate::error::Result;
use crate::tree::{BridgeId, ResourceNode, Tree};

/// Rounds `value` up to the nearest multiple of `granularity`, which must
/// be a power of two.
const fn round_up(value: u64, granularity: u64) -> u64 {
    (value + granularity - 1) & !(granularity - 1)
}

/// Plans a bridge's resource tree, post-order: every descendant bridge is
/// planned (and has materialized its apertures upward) before its own
/// ancestors are planned.
#[derive(Debug, Clone, Copy)]
pub struct ResourcePlanner;

impl ResourcePlanner {
    /// Plans `bridge_id` and its whole subtree (`spec.md` §4.4, steps 1-4).
    ///
    /// Resource-node allocation is backed by `alloc::vec::Vec`; this
    /// returns `Result` for symmetry with the rest of the crate, but a
    /// genuine allocation failure here is an abort, not a recoverable
    /// error, absent `Vec::try_reserve`-based bookkeeping this core does
    /// not add.
    pub fn plan(tree: &mut Tree, bridge_id: BridgeId) -> Result<()> {
        let children: Vec<BridgeId> = tree.bridge(bridge_id).children.clone();
        for child in children {
            Self::plan(tree, child)?;
        }

        Self::plan_kind_group(tree, bridge_id, true);
        Self::plan_kind_group(tree, bridge_id, false);

        Ok(())
    }

    /// `is_io` selects the I/O or memory address space; `spec.md` calls
    /// these "kind K" ∈ {IO, MEM}, each spanning its own `*Resource` and
    /// `*Aperture` tag.
    fn plan_kind_group(tree: &mut Tree, bridge_id: BridgeId, is_io: bool) {
        let mut indices: Vec<usize> = tree
            .bridge(bridge_id)
            .resources
            .iter()
            .enumerate()
            .filter(|(_, node)| node.kind.is_io() == is_io)
            .map(|(index, _)| index)
            .collect();

        // Stable descending sort by length (largest first): minimizes
        // padding when the next node's alignment is its own length.
        indices.sort_by(|&a, &b| {
            let resources = &tree.bridge(bridge_id).resources;
            resources[b].length.cmp(&resources[a].length)
        });

        let mut offset = 0u64;
        for (rank, &index) in indices.iter().enumerate() {
            let length = tree.bridge(bridge_id).resources[index].length;
            let node_offset = if rank == 0 { 0 } else { round_up(offset, length) };
            tree.bridge_mut(bridge_id).resources[index].offset = node_offset;
            offset = node_offset + length;
            trace!("bridge sec={}: {} node[{}] offset=0x{:x} length=0x{:x}", tree.bridge(bridge_id).secondary_bus, if is_io { "io" } else { "mem" }, index, node_offset, length);
        }

        Self::materialize_aperture(tree, bridge_id, &indices, is_io);
    }

    /// Step 4: if this bridge has a parent and owns at least one resource
    /// of this kind, push one aperture node into the parent's list.
    fn materialize_aperture(tree: &mut Tree, bridge_id: BridgeId, indices: &[usize], is_io: bool) {
        let Some(parent) = tree.bridge(bridge_id).parent else {
            return;
        };
        let Some(&last_index) = indices.last() else {
            return;
        };
        let first_index = indices[0];

        let resources = &tree.bridge(bridge_id).resources;
        let last = resources[last_index];
        let first = resources[first_index];

        let kind = if is_io { ResourceKind::IO_APERTURE } else { ResourceKind::MEM_APERTURE };
        let granularity = kind.aperture_granularity();
        let length = round_up(last.offset + last.length, granularity);
        let alignment = first.alignment.max(length - 1);
        let device = tree.bridge(bridge_id).device;

        debug!(
            "bridge sec={}: materializing {:?} aperture length=0x{:x} in parent",
            tree.bridge(bridge_id).secondary_bus,
            kind,
            length
        );

        // Re-planning an already-planned tree must update this bridge's
        // existing aperture in the parent rather than add a second one
        // (`spec.md` §8, R2).
        let existing = tree.bridge(parent).resources.iter().position(|node| node.device == device && node.kind == kind);
        match existing {
            Some(index) => {
                let node = &mut tree.bridge_mut(parent).resources[index];
                node.length = length;
                node.alignment = alignment;
            }
            None => tree.push_resource(
                parent,
                ResourceNode {
                    device,
                    bar_index: 0,
                    length,
                    alignment,
                    offset: 0,
                    kind,
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbdf::Sbdf;
    use crate::tree::{BridgeRecord, DeviceRecord};
    use pci_raw::command::CommandRegister;

    fn leaf_device(tree: &mut Tree, parent: BridgeId) -> crate::tree::DeviceId {
        tree.alloc_device(DeviceRecord::new(Sbdf::new(0, 0, 0, 0), 0, CommandRegister::empty(), Some(parent)))
    }

    #[test]
    fn s2_descending_sort_and_packing() {
        let mut tree = Tree::new();
        let root_device = tree.alloc_device(DeviceRecord::new(Sbdf::new(0, 0, 0xFF, 7), 0, CommandRegister::empty(), None));
        let root = tree.alloc_bridge(BridgeRecord::new(0, 1, None, root_device));
        let bridge_device = tree.alloc_device(DeviceRecord::new(Sbdf::new(0, 0, 1, 0), 0, CommandRegister::empty(), Some(root)));
        let bridge = tree.alloc_bridge(BridgeRecord::new(1, 1, Some(root), bridge_device));
        tree.push_child(root, bridge);

        let small = leaf_device(&mut tree, bridge);
        let large = leaf_device(&mut tree, bridge);
        // Listed smallest-first; expect the planner to reorder by length.
        tree.push_resource(bridge, ResourceNode { device: small, bar_index: 0, length: 0x1_0000, alignment: 0xFFFF, offset: 0, kind: ResourceKind::MEM_RESOURCE });
        tree.push_resource(bridge, ResourceNode { device: large, bar_index: 0, length: 0x2_0000, alignment: 0x1_FFFF, offset: 0, kind: ResourceKind::MEM_RESOURCE });

        ResourcePlanner::plan(&mut tree, root).unwrap();

        let resources = &tree.bridge(bridge).resources;
        let large_node = resources.iter().find(|n| n.device == large).unwrap();
        let small_node = resources.iter().find(|n| n.device == small).unwrap();
        assert_eq!(large_node.offset, 0);
        assert_eq!(small_node.offset, 0x2_0000);

        let aperture = &tree.bridge(root).resources[0];
        assert_eq!(aperture.kind, ResourceKind::MEM_APERTURE);
        assert_eq!(aperture.length, 0x10_0000);
    }

    #[test]
    fn b1_zero_devices_produces_no_apertures() {
        let mut tree = Tree::new();
        let root_device = tree.alloc_device(DeviceRecord::new(Sbdf::new(0, 0, 0xFF, 7), 0, CommandRegister::empty(), None));
        let root = tree.alloc_bridge(BridgeRecord::new(0, 0, None, root_device));
        ResourcePlanner::plan(&mut tree, root).unwrap();
        assert!(tree.bridge(root).resources.is_empty());
    }

    #[test]
    fn r2_replanning_is_idempotent() {
        let mut tree = Tree::new();
        let root_device = tree.alloc_device(DeviceRecord::new(Sbdf::new(0, 0, 0xFF, 7), 0, CommandRegister::empty(), None));
        let root = tree.alloc_bridge(BridgeRecord::new(0, 1, None, root_device));
        let bridge_device = tree.alloc_device(DeviceRecord::new(Sbdf::new(0, 0, 1, 0), 0, CommandRegister::empty(), Some(root)));
        let bridge = tree.alloc_bridge(BridgeRecord::new(1, 1, Some(root), bridge_device));
        tree.push_child(root, bridge);
        let a = leaf_device(&mut tree, bridge);
        tree.push_resource(bridge, ResourceNode { device: a, bar_index: 0, length: 0x1_0000, alignment: 0xFFFF, offset: 0, kind: ResourceKind::MEM_RESOURCE });

        ResourcePlanner::plan(&mut tree, root).unwrap();
        let first_pass: Vec<u64> = tree.bridge(bridge).resources.iter().map(|n| n.offset).collect();
        let root_len_after_first = tree.bridge(root).resources.len();
        ResourcePlanner::plan(&mut tree, root).unwrap();
        let second_pass: Vec<u64> = tree.bridge(bridge).resources.iter().map(|n| n.offset).collect();
        assert_eq!(first_pass, second_pass);
        // The child bridge's propagated aperture in root must be updated in
        // place on replan, not duplicated.
        assert_eq!(tree.bridge(root).resources.len(), root_len_after_first);
        assert_eq!(tree.bridge(root).resources.len(), 1);
    }
}
