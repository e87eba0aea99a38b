// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contracts for the `EXTERNAL COLLABORATOR`s named in `spec.md` §6: the
//! ambient locate-service facility, the raw MMIO/PIO helpers, the upstream
//! IOMMU mapper, the device-path string builder, and the host-bridge
//! inventory. None of these are implemented here; this module only fixes
//! the trait boundary so `pci-preboot` stays unit-testable against fakes.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use pci_raw::command::CommandRegister;
use pci_raw::iommu::{IommuAttribute, IommuOperation};
use uguid::Guid;

use crate::error::Result;
use crate::facade::PciIo;
use crate::sbdf::Sbdf;

/// A device-path handle, opaque to this crate. Concretely a byte buffer
/// whose encoding is owned entirely by the `DevicePathBuilder` collaborator;
/// this crate only ever concatenates and forwards it.
pub type DevicePath = Vec<u8>;

/// The raw MMIO/PIO helper collaborator, config-space side. `CfgAccess`
/// computes the ECAM address from an [`Sbdf`](crate::sbdf::Sbdf) and calls
/// through here; it never touches hardware directly.
pub trait ConfigSpace {
    /// # Safety
    /// `address` must be a valid, mapped ECAM config-space address.
    unsafe fn read8(&self, address: u64) -> u8;
    /// # Safety
    /// `address` must be a valid, mapped ECAM config-space address.
    unsafe fn read16(&self, address: u64) -> u16;
    /// # Safety
    /// `address` must be a valid, mapped ECAM config-space address.
    unsafe fn read32(&self, address: u64) -> u32;
    /// # Safety
    /// `address` must be a valid, mapped ECAM config-space address.
    unsafe fn write8(&self, address: u64, value: u8);
    /// # Safety
    /// `address` must be a valid, mapped ECAM config-space address.
    unsafe fn write16(&self, address: u64, value: u16);
    /// # Safety
    /// `address` must be a valid, mapped ECAM config-space address.
    unsafe fn write32(&self, address: u64, value: u32);
}

/// The raw MMIO/PIO helper collaborator, BAR-mapped memory side. Used by
/// `DeviceFacade::mem_read`/`mem_write`/`poll_mem`/`copy_mem`; distinct from
/// [`ConfigSpace`] because a BAR window and a function's own config space
/// are different address spaces on real hardware.
pub trait Mmio {
    /// # Safety
    /// `address` must be a valid, mapped address inside a claimed BAR window.
    unsafe fn read8(&self, address: u64) -> u8;
    /// # Safety
    /// `address` must be a valid, mapped address inside a claimed BAR window.
    unsafe fn read16(&self, address: u64) -> u16;
    /// # Safety
    /// `address` must be a valid, mapped address inside a claimed BAR window.
    unsafe fn read32(&self, address: u64) -> u32;
    /// # Safety
    /// `address` must be a valid, mapped address inside a claimed BAR window.
    unsafe fn write8(&self, address: u64, value: u8);
    /// # Safety
    /// `address` must be a valid, mapped address inside a claimed BAR window.
    unsafe fn write16(&self, address: u64, value: u16);
    /// # Safety
    /// `address` must be a valid, mapped address inside a claimed BAR window.
    unsafe fn write32(&self, address: u64, value: u32);
}

/// The raw MMIO/PIO helper collaborator, port-I/O side. Used by
/// `DeviceFacade::io_read`/`io_write`/`poll_io`.
pub trait PortIo {
    /// # Safety
    /// `port` must be a valid port address for the access width.
    unsafe fn in8(&self, port: u16) -> u8;
    /// # Safety
    /// `port` must be a valid port address for the access width.
    unsafe fn in16(&self, port: u16) -> u16;
    /// # Safety
    /// `port` must be a valid port address for the access width.
    unsafe fn in32(&self, port: u16) -> u32;
    /// # Safety
    /// `port` must be a valid port address for the access width.
    unsafe fn out8(&self, port: u16, value: u8);
    /// # Safety
    /// `port` must be a valid port address for the access width.
    unsafe fn out16(&self, port: u16, value: u16);
    /// # Safety
    /// `port` must be a valid port address for the access width.
    unsafe fn out32(&self, port: u16, value: u32);
}

/// One host bridge as reported by a [`HostBridgeProvider`].
#[derive(Debug, Clone)]
pub struct HostBridge {
    pub segment: u16,
    pub bus_base: u8,
    pub bus_limit: u8,
    pub mem_base: u32,
    pub mem_limit: u32,
    pub io_base: u16,
    pub io_limit: u16,
    /// The mem-above-4G window. Read for completeness, never allocated from
    /// (`spec.md` §1 Non-goals: 64-bit-above-4G placement is out of scope).
    pub mem_above_4g_base: u64,
    pub mem_above_4g_limit: u64,
    pub supported_attributes: CommandRegister,
    pub device_path_prefix: DevicePath,
}

/// Returns the ordered list of host bridges this platform exposes.
pub trait HostBridgeProvider {
    fn host_bridges(&self) -> Vec<HostBridge>;
}

/// An opaque token for one active IOMMU mapping, returned by
/// [`Iommu::map`] and consumed by [`Iommu::unmap`].
pub type MappingToken = u64;

/// The upstream IOMMU mapping service, reached through the ambient
/// locate-service facility and modeled on the EDKII IOMMU protocol
/// (`pci_raw::iommu`).
pub trait Iommu {
    /// Maps `length` bytes at `host_address` for `operation`, returning the
    /// device-visible address and a token to later unmap it.
    fn map(&self, operation: IommuOperation, host_address: u64, length: usize) -> Result<(u64, MappingToken)>;
    fn unmap(&self, token: MappingToken) -> Result<()>;
    /// Allocates a zero-initialized, IOMMU-mapped common buffer of `pages`
    /// pages with the given attributes, returning its host address.
    fn allocate_buffer(&self, pages: usize, attribute: IommuAttribute) -> Result<u64>;
    fn free_buffer(&self, host_address: u64, pages: usize) -> Result<()>;
    /// Sets the mapping attribute mask for an already-mapped access.
    fn set_attribute(&self, token: MappingToken, attribute: IommuAttribute) -> Result<()>;
}

/// Microsecond delay collaborator, used by `poll_mem`/`poll_io`'s busy-wait.
pub trait Timer {
    fn delay_microseconds(&self, microseconds: u32);
}

/// Appends PCI device-path nodes and renders a path to text. Used only by
/// the orchestrator when building each essential endpoint's path
/// (`spec.md` §4.8 step 6).
pub trait DevicePathBuilder {
    fn append_pci_node(&self, prefix: &DevicePath, device: u8, function: u8) -> DevicePath;
    fn to_text(&self, path: &DevicePath) -> String;
}

/// The "ambient locate-service facility" outputs of `spec.md` §6: where
/// published per-endpoint facades and the final "PCI devices ready" signal
/// go. A trait rather than a process-global static so the orchestrator
/// stays unit-testable — a test registry is just a `Vec` collecting
/// publications.
pub trait FacadeRegistry {
    fn publish(&mut self, guid: Guid, sbdf: Sbdf, facade: Box<dyn PciIo>);
    /// Publishes a terminator-flagged signal with no associated facade.
    fn signal_ready(&mut self, guid: Guid);
}
