// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sequences `spec.md` §4.8's seven steps over every host bridge the
//! [`HostBridgeProvider`] reports, then publishes the terminator-flagged
//! ready signal.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use log::{debug, error};

use pci_raw::command::CommandRegister;
use pci_raw::guid::{DEVICE_FACADE_PROTOCOL, ESSENTIAL_DEVICES_READY};

use crate::cfg_access::CfgAccess;
use crate::enumerator::Enumerator;
use crate::error::Result;
use crate::external::{ConfigSpace, DevicePath, DevicePathBuilder, FacadeRegistry, HostBridge, HostBridgeProvider, Iommu, Mmio, PortIo, Timer};
use crate::facade::{AncestorBridge, DeviceFacade};
use crate::planner::ResourcePlanner;
use crate::programmer::Programmer;
use crate::sbdf::Sbdf;
use crate::tree::{BridgeId, BridgeRecord, DeviceId, DeviceRecord, Tree};

/// Device number reserved for a host bridge's synthetic root record. Every
/// real device lives at 0..=31 ([`crate::sbdf::MAX_DEVICE`]); `0xFF`/`7`
/// marks a bridge with no addressable config space of its own, the same
/// sentinel already used by this crate's own fixtures.
const SYNTHETIC_ROOT_DEVICE: u8 = 0xFF;
const SYNTHETIC_ROOT_FUNCTION: u8 = 7;

const BRIDGE_ENABLE_ATTRIBUTES: CommandRegister =
    CommandRegister::IO_ENABLE.union(CommandRegister::MEMORY_ENABLE).union(CommandRegister::BUS_MASTER_ENABLE);

/// Drives one full enumeration pass: every collaborator this crate needs
/// that outlives the pass (`spec.md` §6) is held here; `'static`
/// references are exactly the ones a published [`DeviceFacade`] also needs
/// to keep after `run()` returns.
pub struct Orchestrator<'a> {
    config_space: &'static dyn ConfigSpace,
    ecam_base: u64,
    mmio: &'static dyn Mmio,
    port_io: &'static dyn PortIo,
    iommu: &'static dyn Iommu,
    timer: &'static dyn Timer,
    device_paths: &'a dyn DevicePathBuilder,
}

impl fmt::Debug for Orchestrator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator").field("ecam_base", &self.ecam_base).finish_non_exhaustive()
    }
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        config_space: &'static dyn ConfigSpace,
        ecam_base: u64,
        mmio: &'static dyn Mmio,
        port_io: &'static dyn PortIo,
        iommu: &'static dyn Iommu,
        timer: &'static dyn Timer,
        device_paths: &'a dyn DevicePathBuilder,
    ) -> Self {
        Self {
            config_space,
            ecam_base,
            mmio,
            port_io,
            iommu,
            timer,
            device_paths,
        }
    }

    /// Runs every host bridge `provider` reports, then publishes the
    /// terminator-flagged "PCI devices ready" signal (`spec.md` §4.8).
    pub fn run(&self, provider: &dyn HostBridgeProvider, registry: &mut dyn FacadeRegistry) {
        for host_bridge in provider.host_bridges() {
            self.run_host_bridge(&host_bridge, registry);
        }
        registry.signal_ready(ESSENTIAL_DEVICES_READY);
    }

    fn run_host_bridge(&self, host_bridge: &HostBridge, registry: &mut dyn FacadeRegistry) {
        let cfg = CfgAccess::new(self.config_space, self.ecam_base);
        let enumerator = Enumerator::new(cfg, host_bridge.segment);

        // Step 1: bus-number assignment, starting one above the host's own bus.
        let mut next_free_bus = host_bridge.bus_base.saturating_add(1);
        if let Err(e) = enumerator.assign_bus_numbers(host_bridge.bus_base, &mut next_free_bus, host_bridge.bus_limit) {
            error!("segment {}: bus-number assignment failed: {}", host_bridge.segment, e);
            return;
        }

        // Step 2: synthetic root bridge, then resource discovery.
        let mut tree = Tree::new();
        let root_sbdf = Sbdf::new(host_bridge.segment, host_bridge.bus_base, SYNTHETIC_ROOT_DEVICE, SYNTHETIC_ROOT_FUNCTION);
        let root_device = tree.alloc_device(DeviceRecord::new(root_sbdf, cfg.config_base(root_sbdf), host_bridge.supported_attributes, None));
        let root = tree.alloc_bridge(BridgeRecord::new(host_bridge.bus_base, host_bridge.bus_limit, None, root_device));
        enumerator.discover_resources(&mut tree, root, host_bridge.bus_base);

        // Step 3: plan.
        if let Err(e) = ResourcePlanner::plan(&mut tree, root) {
            error!("segment {}: resource planning failed: {}", host_bridge.segment, e);
            tree.teardown(root);
            return;
        }

        // Step 4: program.
        if let Err(e) = self.program(&tree, root, host_bridge) {
            error!("segment {}: resource programming aborted: {}", host_bridge.segment, e);
            tree.teardown(root);
            return;
        }

        // Step 5: enable bridge decoding, leaves upward.
        self.enable_bridges(&cfg, &tree, root);

        // Step 6: publish facades for every essential endpoint.
        self.publish_endpoints(&mut tree, root, host_bridge, registry);

        // Step 7: tear down.
        tree.teardown(root);
    }

    fn program(&self, tree: &Tree, root: BridgeId, host_bridge: &HostBridge) -> Result<()> {
        let programmer = Programmer::new(CfgAccess::new(self.config_space, self.ecam_base));
        programmer.widen(tree, root, host_bridge.mem_limit, host_bridge.io_limit);
        programmer.tighten_memory(tree, root, host_bridge.mem_base, host_bridge.mem_limit)?;
        programmer.tighten_io(tree, root, host_bridge.io_base, host_bridge.io_limit)?;
        Ok(())
    }

    /// Post-order: every child bridge is enabled before its parent, so an
    /// ancestor's decode window is never opened ahead of a descendant that
    /// has not yet been programmed underneath it.
    fn enable_bridges(&self, cfg: &CfgAccess<'_>, tree: &Tree, bridge_id: BridgeId) {
        for &child in &tree.bridge(bridge_id).children {
            self.enable_bridges(cfg, tree, child);
        }
        let bridge = tree.bridge(bridge_id);
        if bridge.parent.is_none() {
            return;
        }
        let device = tree.device(bridge.device);
        let enable = BRIDGE_ENABLE_ATTRIBUTES & device.supported_attributes;
        let updated = cfg.command(device.sbdf) | enable;
        cfg.set_command(device.sbdf, updated);
        debug!("{:?}: bridge command <- {:?}", device.sbdf, updated);
    }

    fn publish_endpoints(&self, tree: &mut Tree, bridge_id: BridgeId, host_bridge: &HostBridge, registry: &mut dyn FacadeRegistry) {
        for child in tree.bridge(bridge_id).children.clone() {
            self.publish_endpoints(tree, child, host_bridge, registry);
        }
        for device_id in tree.bridge(bridge_id).endpoints.clone() {
            let ancestors: Arc<[AncestorBridge]> = Arc::from(Self::ancestor_chain(tree, bridge_id));
            let path = self.device_path(tree, bridge_id, device_id, &host_bridge.device_path_prefix);
            tree.device_mut(device_id).device_path = Some(path.clone());

            let device = tree.device(device_id);
            debug!("{:?}: publishing facade at {}", device.sbdf, self.device_paths.to_text(&path));
            let facade = DeviceFacade::new(
                device.sbdf,
                self.ecam_base,
                device.supported_attributes,
                ancestors,
                self.config_space,
                self.mmio,
                self.port_io,
                self.iommu,
                self.timer,
            );
            registry.publish(DEVICE_FACADE_PROTOCOL, device.sbdf, Box::new(facade));
        }
    }

    /// Nearest ancestor first, stopping at (and excluding) the synthetic
    /// root, which has no real command register to propagate into.
    fn ancestor_chain(tree: &Tree, bridge_id: BridgeId) -> Vec<AncestorBridge> {
        let mut chain = Vec::new();
        let mut current = Some(bridge_id);
        while let Some(id) = current {
            let bridge = tree.bridge(id);
            if bridge.parent.is_none() {
                break;
            }
            let device = tree.device(bridge.device);
            chain.push(AncestorBridge { sbdf: device.sbdf, supported_attributes: device.supported_attributes });
            current = bridge.parent;
        }
        chain
    }

    /// Appends one PCI node per real ancestor function (root-most first),
    /// then the endpoint's own node, onto the host bridge's path prefix.
    fn device_path(&self, tree: &Tree, bridge_id: BridgeId, device_id: DeviceId, prefix: &DevicePath) -> DevicePath {
        let mut ancestor_functions = Vec::new();
        let mut current = Some(bridge_id);
        while let Some(id) = current {
            let bridge = tree.bridge(id);
            if bridge.parent.is_none() {
                break;
            }
            let sbdf = tree.device(bridge.device).sbdf;
            ancestor_functions.push((sbdf.device, sbdf.function));
            current = bridge.parent;
        }
        ancestor_functions.reverse();

        let mut path = prefix.clone();
        for (device, function) in ancestor_functions {
            path = self.device_paths.append_pci_node(&path, device, function);
        }
        let endpoint_sbdf = tree.device(device_id).sbdf;
        self.device_paths.append_pci_node(&path, endpoint_sbdf.device, endpoint_sbdf.function)
    }
}
