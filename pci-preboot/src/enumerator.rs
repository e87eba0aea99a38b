// SPDX-License-Identifier: MIT OR Apache-2.0

//! The two recursive traversals that assign bus numbers and populate the
//! resource tree (`spec.md` §4.3).

use log::{debug, trace, warn};

use pci_raw::command::CommandRegister;
use pci_raw::resource::{BarDecode, ResourceKind};

use crate::bar_probe::BarProbe;
use crate::cfg_access::CfgAccess;
use crate::error::{Error, Result};
use crate::essential::is_essential;
use crate::sbdf::{Sbdf, MAX_DEVICE, MAX_FUNCTION};
use crate::tree::{BridgeId, BridgeRecord, DeviceRecord, ResourceNode, Tree};

/// Attribute bits this core tracks as "supported" for every participating
/// function: the only three the facade's `attributes()` operation ever
/// inspects or enables (`spec.md` §4.6).
const SUPPORTED_ATTRIBUTES: CommandRegister = CommandRegister::IO_ENABLE
    .union(CommandRegister::MEMORY_ENABLE)
    .union(CommandRegister::BUS_MASTER_ENABLE);

const BAR_COUNT_ENDPOINT: u8 = 6;
const BAR_COUNT_BRIDGE: u8 = 2;

/// Walks a bus tree to assign bus numbers and, separately, to populate a
/// [`Tree`] with the devices and resource nodes resource allocation needs.
#[derive(Debug, Clone, Copy)]
pub struct Enumerator<'a> {
    cfg: CfgAccess<'a>,
    segment: u16,
}

impl<'a> Enumerator<'a> {
    #[must_use]
    pub const fn new(cfg: CfgAccess<'a>, segment: u16) -> Self {
        Self { cfg, segment }
    }

    /// Depth-first bus-number assignment (`spec.md` §4.3, traversal 1).
    /// `next_free_bus` is consumed monotonically across the whole walk;
    /// `bus_limit` is the host bridge's declared ceiling.
    pub fn assign_bus_numbers(&self, bus: u8, next_free_bus: &mut u8, bus_limit: u8) -> Result<()> {
        for device in 0..=MAX_DEVICE {
            let function_zero = Sbdf::new(self.segment, bus, device, 0);
            if !self.cfg.is_present(function_zero) {
                continue;
            }
            let last_function = if self.cfg.is_multi_function(function_zero) { MAX_FUNCTION } else { 0 };

            for function in 0..=last_function {
                let sbdf = Sbdf::new(self.segment, bus, device, function);
                if function > 0 && !self.cfg.is_present(sbdf) {
                    continue;
                }
                if !self.cfg.is_bridge(sbdf) {
                    continue;
                }
                if *next_free_bus > bus_limit {
                    warn!("bus {}: bridge {:?} found no free bus number below limit {}", bus, sbdf, bus_limit);
                    return Err(Error::OutOfResources);
                }

                let secondary = *next_free_bus;
                *next_free_bus += 1;
                self.cfg.set_secondary_subordinate_bus(sbdf, secondary, bus_limit);
                trace!("{:?}: secondary={} subordinate(widened)={}", sbdf, secondary, bus_limit);

                self.assign_bus_numbers(secondary, next_free_bus, bus_limit)?;

                let tightened = *next_free_bus - 1;
                self.cfg.set_secondary_subordinate_bus(sbdf, secondary, tightened);
                debug!("{:?}: secondary={} subordinate(tightened)={}", sbdf, secondary, tightened);
            }
        }
        Ok(())
    }

    /// Resource-discovery traversal (`spec.md` §4.3, traversal 2). Visits
    /// every present function on `secondary_bus`; for a bridge or a
    /// non-decoding essential endpoint, allocates a device record and
    /// probes its BARs into `bridge_id`'s resource list. A bridge also
    /// gets a child `BridgeRecord` and is recursed into.
    pub fn discover_resources(&self, tree: &mut Tree, bridge_id: BridgeId, secondary_bus: u8) {
        for device in 0..=MAX_DEVICE {
            let function_zero = Sbdf::new(self.segment, secondary_bus, device, 0);
            if !self.cfg.is_present(function_zero) {
                continue;
            }
            let last_function = if self.cfg.is_multi_function(function_zero) { MAX_FUNCTION } else { 0 };

            for function in 0..=last_function {
                let sbdf = Sbdf::new(self.segment, secondary_bus, device, function);
                if function > 0 && !self.cfg.is_present(sbdf) {
                    continue;
                }
                self.visit_function(tree, bridge_id, sbdf);
            }
        }
    }

    fn visit_function(&self, tree: &mut Tree, bridge_id: BridgeId, sbdf: Sbdf) {
        let is_bridge = self.cfg.is_bridge(sbdf);
        let (base_class, subclass) = self.cfg.class_code(sbdf);

        if !is_bridge && !is_essential(base_class, subclass) {
            trace!("{:?}: not a bridge and not essential, skipping (S4)", sbdf);
            return;
        }

        if self.cfg.command(sbdf).is_decoding() {
            debug!("{:?}: already decoding, leaving untouched (S3)", sbdf);
            return;
        }

        let device_id = tree.alloc_device(DeviceRecord::new(
            sbdf,
            self.cfg.config_base(sbdf),
            SUPPORTED_ATTRIBUTES,
            Some(bridge_id),
        ));

        if !is_bridge {
            tree.push_endpoint(bridge_id, device_id);
        }

        let bar_count = if is_bridge { BAR_COUNT_BRIDGE } else { BAR_COUNT_ENDPOINT };
        self.probe_bars(tree, bridge_id, device_id, sbdf, bar_count);

        if is_bridge {
            let secondary = self.cfg.secondary_bus(sbdf);
            let subordinate = self.cfg.subordinate_bus(sbdf);
            let child_bridge = tree.alloc_bridge(BridgeRecord::new(secondary, subordinate, Some(bridge_id), device_id));
            tree.push_child(bridge_id, child_bridge);
            debug!("{:?}: bridge, secondary={} subordinate={}", sbdf, secondary, subordinate);
            self.discover_resources(tree, child_bridge, secondary);
        }
    }

    fn probe_bars(&self, tree: &mut Tree, bridge_id: BridgeId, device_id: crate::tree::DeviceId, sbdf: Sbdf, bar_count: u8) {
        let probe = BarProbe::new(self.cfg);
        let mut bar_index = 0;
        while bar_index < bar_count {
            let decode = probe.size(sbdf, bar_index);
            match decode {
                BarDecode::Absent => {}
                BarDecode::Io { length } => {
                    self.push_bar_node(tree, bridge_id, device_id, bar_index, u64::from(length), ResourceKind::IO_RESOURCE);
                }
                BarDecode::Mem32 { length, .. } | BarDecode::Mem64 { length, .. } => {
                    self.push_bar_node(tree, bridge_id, device_id, bar_index, u64::from(length), ResourceKind::MEM_RESOURCE);
                }
                BarDecode::UnsupportedAbove4G => {
                    warn!("{:?} bar{}: >2GiB 64-bit BAR, invalidating device (S5)", sbdf, bar_index);
                    tree.remove_resources_of(bridge_id, device_id);
                    tree.device_mut(device_id).supported_attributes = CommandRegister::empty();
                }
            }
            bar_index += decode.slots();
        }
    }

    fn push_bar_node(&self, tree: &mut Tree, bridge_id: BridgeId, device_id: crate::tree::DeviceId, bar_index: u8, length: u64, kind: ResourceKind) {
        tree.push_resource(
            bridge_id,
            ResourceNode {
                device: device_id,
                bar_index,
                length,
                alignment: length - 1,
                offset: 0,
                kind,
            },
        );
    }
}
