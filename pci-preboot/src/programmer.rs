// SPDX-License-Identifier: MIT OR Apache-2.0

//! Two-phase widen-then-tighten programming (`spec.md` §4.5).

use log::{debug, trace};

use pci_raw::resource::{encode_io_base_limit, encode_mem_base_limit};

use crate::cfg_access::{CfgAccess, BAR0_OFFSET};
use crate::error::{Error, Result};
use crate::tree::{BridgeId, Tree};

/// Writes BAR and bridge-window registers for a planned [`Tree`].
#[derive(Debug, Clone, Copy)]
pub struct Programmer<'a> {
    cfg: CfgAccess<'a>,
}

impl<'a> Programmer<'a> {
    #[must_use]
    pub const fn new(cfg: CfgAccess<'a>) -> Self {
        Self { cfg }
    }

    /// Phase A: recursively opens every non-root bridge to the host's full
    /// memory and I/O windows, so BAR writes during Phase B reach their
    /// targets through ancestors that have not yet been tightened.
    pub fn widen(&self, tree: &Tree, bridge_id: BridgeId, mem_limit: u32, io_limit: u16) {
        let bridge = tree.bridge(bridge_id);
        if bridge.parent.is_some() {
            let sbdf = tree.device(bridge.device).sbdf;
            self.cfg.write_bridge_mem_base_limit(sbdf, encode_mem_base_limit(mem_limit, mem_limit));
            self.cfg.write_bridge_io_base_limit(sbdf, encode_io_base_limit(io_limit, io_limit));
            trace!("{:?}: widened to host limits mem=0x{:x} io=0x{:x}", sbdf, mem_limit, io_limit);
        }
        for &child in &bridge.children {
            self.widen(tree, child, mem_limit, io_limit);
        }
    }

    /// Phase B, memory half.
    pub fn tighten_memory(&self, tree: &Tree, bridge_id: BridgeId, mem_base: u32, mem_limit: u32) -> Result<()> {
        self.tighten(tree, bridge_id, u64::from(mem_base), u64::from(mem_limit), false)
    }

    /// Phase B, I/O half, run independently of the memory recursion.
    pub fn tighten_io(&self, tree: &Tree, bridge_id: BridgeId, io_base: u16, io_limit: u16) -> Result<()> {
        self.tighten(tree, bridge_id, u64::from(io_base), u64::from(io_limit), true)
    }

    fn tighten(&self, tree: &Tree, bridge_id: BridgeId, base: u64, limit: u64, is_io: bool) -> Result<()> {
        for node in &tree.bridge(bridge_id).resources {
            if node.kind.is_io() != is_io {
                continue;
            }

            let device_addr = base + node.offset;
            let node_limit = device_addr + node.length - 1;
            if node_limit > limit {
                return Err(Error::OutOfResources);
            }

            if node.kind.is_aperture() {
                let child_sbdf = tree.device(node.device).sbdf;
                if is_io {
                    self.cfg.write_bridge_io_base_limit(child_sbdf, encode_io_base_limit(device_addr as u16, node_limit as u16));
                } else {
                    self.cfg.write_bridge_mem_base_limit(child_sbdf, encode_mem_base_limit(device_addr as u32, node_limit as u32));
                }
                debug!("{:?}: {} window = [0x{:x}, 0x{:x}]", child_sbdf, if is_io { "io" } else { "mem" }, device_addr, node_limit);

                let child = Self::find_child(tree, bridge_id, node.device);
                // Offset-inclusive recursive limit: base + node.offset + node.length - 1,
                // not base + node.length - 1 (spec.md §9 flags the latter as a bug).
                self.tighten(tree, child, device_addr, node_limit, is_io)?;
            } else {
                let device = tree.device(node.device);
                let offset = BAR0_OFFSET + 4 * u16::from(node.bar_index);
                self.cfg.write32(device.sbdf, offset, device_addr as u32);
                trace!("{:?}: bar{} <- 0x{:x}", device.sbdf, node.bar_index, device_addr);
            }
        }
        Ok(())
    }

    fn find_child(tree: &Tree, bridge_id: BridgeId, device: crate::tree::DeviceId) -> BridgeId {
        *tree
            .bridge(bridge_id)
            .children
            .iter()
            .find(|&&child| tree.bridge(child).device == device)
            .expect("aperture node's device always names a direct child bridge")
    }
}
