// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-endpoint access facade, published for essential devices after the
//! orchestrator hands off (`spec.md` §4.6).
//!
//! A published [`DeviceFacade`] must keep working after the [`crate::tree`]
//! arena it was discovered through is torn down: `attributes()` needs to
//! walk the parent chain to propagate an enable upward, so the facade
//! carries its own `Arc`-shared snapshot of that chain rather than a
//! reference into the arena (`spec.md` §9, "post-teardown facade safety").

use alloc::sync::Arc;
use core::fmt;

use pci_raw::command::CommandRegister;
use pci_raw::iommu::{IommuAttribute, IommuOperation};
use pci_raw::resource::{BarDecode, ResourceKind};

use crate::bar_probe::BarProbe;
use crate::cfg_access::{CfgAccess, BAR0_OFFSET};
use crate::error::{Error, Result};
use crate::external::{ConfigSpace, Iommu, MappingToken, Mmio, PortIo, Timer};
use crate::sbdf::Sbdf;

/// Access width for a `mem_read`/`mem_write`/`io_read`/`io_write`/
/// `config_read`/`config_write` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
}

impl Width {
    #[must_use]
    const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }
}

/// Which `attributes()` operation to perform (`spec.md` §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeOp {
    Get,
    GetSupported,
    Set,
    Enable,
    Disable,
}

/// A single address-space descriptor for one BAR, captured at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarAttributes {
    pub kind: ResourceKind,
    /// `16` for I/O, `32` or `64` for memory, matching the BAR's decode width.
    pub granularity: u8,
    pub prefetchable: bool,
    pub minimum: u64,
    pub length: u64,
}

/// One bridge on a published facade's ancestor chain, snapshotted at
/// publication time so it survives arena teardown.
#[derive(Debug, Clone, Copy)]
pub struct AncestorBridge {
    pub sbdf: Sbdf,
    pub supported_attributes: CommandRegister,
}

/// The dynamic-dispatch boundary a published facade is consumed through
/// (`spec.md` §9: "keep that pluggable ... because downstream services
/// depend on this shape").
pub trait PciIo {
    fn mem_read(&self, width: Width, bar: u8, offset: u64, buffer: &mut [u8]);
    fn mem_write(&self, width: Width, bar: u8, offset: u64, buffer: &[u8]);
    fn io_read(&self, width: Width, bar: u8, offset: u64, buffer: &mut [u8]);
    fn io_write(&self, width: Width, bar: u8, offset: u64, buffer: &[u8]);
    fn config_read(&self, width: Width, offset: u16, buffer: &mut [u8]);
    fn config_write(&self, width: Width, offset: u16, buffer: &[u8]);
    /// Returns the last-read value on success or timeout.
    fn poll_mem(&self, width: Width, bar: u8, offset: u64, mask: u64, value: u64, delay: u64) -> Result<u64>;
    fn poll_io(&self, width: Width, bar: u8, offset: u64, mask: u64, value: u64, delay: u64) -> Result<u64>;
    fn copy_mem(&self, dest_bar: u8, dest_offset: u64, src_bar: u8, src_offset: u64, width: Width, count: usize);
    fn map(&self, operation: IommuOperation, host_address: u64, length: usize) -> Result<(u64, MappingToken)>;
    fn unmap(&self, token: MappingToken) -> Result<()>;
    fn allocate_buffer(&self, pages: usize, attribute: IommuAttribute) -> Result<u64>;
    fn free_buffer(&self, host_address: u64, pages: usize) -> Result<()>;
    fn flush(&self);
    fn location(&self) -> Sbdf;
    fn attributes(&self, op: AttributeOp, attrs: CommandRegister) -> Result<CommandRegister>;
    fn get_bar_attributes(&self, bar: u8) -> Option<BarAttributes>;
    fn set_bar_attributes(&self, bar: u8, attributes: BarAttributes);
}

/// The one [`PciIo`] implementation this core publishes. Every collaborator
/// reference is `'static`: the config-space ECAM window, port-I/O space,
/// IOMMU service, and delay timer are all ambient platform services that
/// outlive any single enumeration pass.
pub struct DeviceFacade {
    sbdf: Sbdf,
    ecam_base: u64,
    supported_attributes: CommandRegister,
    ancestors: Arc<[AncestorBridge]>,
    config_space: &'static dyn ConfigSpace,
    mmio: &'static dyn Mmio,
    port_io: &'static dyn PortIo,
    iommu: &'static dyn Iommu,
    timer: &'static dyn Timer,
}

impl fmt::Debug for DeviceFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceFacade")
            .field("sbdf", &self.sbdf)
            .field("supported_attributes", &self.supported_attributes)
            .field("ancestors", &self.ancestors)
            .finish_non_exhaustive()
    }
}

impl DeviceFacade {
    #[must_use]
    pub fn new(
        sbdf: Sbdf,
        ecam_base: u64,
        supported_attributes: CommandRegister,
        ancestors: Arc<[AncestorBridge]>,
        config_space: &'static dyn ConfigSpace,
        mmio: &'static dyn Mmio,
        port_io: &'static dyn PortIo,
        iommu: &'static dyn Iommu,
        timer: &'static dyn Timer,
    ) -> Self {
        Self {
            sbdf,
            ecam_base,
            supported_attributes,
            ancestors,
            config_space,
            mmio,
            port_io,
            iommu,
            timer,
        }
    }

    fn cfg(&self) -> CfgAccess<'static> {
        CfgAccess::new(self.config_space, self.ecam_base)
    }

    /// Resolves a BAR's current decode base, masked per its kind
    /// (`spec.md` §4.6: "resolve the BAR at call time").
    fn bar_address(&self, bar: u8) -> u64 {
        let register = self.cfg().read32(self.sbdf, BAR0_OFFSET + 4 * u16::from(bar));
        if register & 1 != 0 {
            u64::from(register & !0b11)
        } else {
            u64::from(register & !0b1111)
        }
    }

    fn mem_access(&self, width: Width, bar: u8, offset: u64, read: bool, buffer: &mut [u8]) {
        let base = self.bar_address(bar) + offset;
        for (index, chunk) in buffer.chunks_mut(width.bytes()).enumerate() {
            let addr = base + (index * width.bytes()) as u64;
            match width {
                Width::Byte => unsafe {
                    if read {
                        chunk[0] = self.mmio.read8(addr);
                    } else {
                        self.mmio.write8(addr, chunk[0]);
                    }
                },
                Width::Word => unsafe {
                    if read {
                        chunk.copy_from_slice(&self.mmio.read16(addr).to_le_bytes());
                    } else {
                        self.mmio.write16(addr, u16::from_le_bytes([chunk[0], chunk[1]]));
                    }
                },
                Width::Dword => unsafe {
                    if read {
                        chunk.copy_from_slice(&self.mmio.read32(addr).to_le_bytes());
                    } else {
                        self.mmio.write32(addr, u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                    }
                },
            }
        }
    }

    fn io_access(&self, width: Width, bar: u8, offset: u64, read: bool, buffer: &mut [u8]) {
        let base = self.bar_address(bar) + offset;
        for (index, chunk) in buffer.chunks_mut(width.bytes()).enumerate() {
            let port = (base as u16).wrapping_add((index * width.bytes()) as u16);
            match width {
                Width::Byte => unsafe {
                    if read {
                        chunk[0] = self.port_io.in8(port);
                    } else {
                        self.port_io.out8(port, chunk[0]);
                    }
                },
                Width::Word => unsafe {
                    if read {
                        chunk.copy_from_slice(&self.port_io.in16(port).to_le_bytes());
                    } else {
                        self.port_io.out16(port, u16::from_le_bytes([chunk[0], chunk[1]]));
                    }
                },
                Width::Dword => unsafe {
                    if read {
                        chunk.copy_from_slice(&self.port_io.in32(port).to_le_bytes());
                    } else {
                        self.port_io.out32(port, u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                    }
                },
            }
        }
    }

    fn poll(&self, read_once: impl Fn() -> u64, mask: u64, value: u64, mut delay: u64) -> Result<u64> {
        loop {
            let observed = read_once();
            if observed & mask == value {
                return Ok(observed);
            }
            if delay == 0 {
                return Err(Error::Timeout);
            }
            self.timer.delay_microseconds(10);
            delay = delay.saturating_sub(100);
        }
    }

    /// Bits of `attrs` this device's command register can represent. Any
    /// bit outside `supported_attributes` makes the whole request
    /// unsupported (`spec.md` §4.6).
    fn checked_command_bits(&self, attrs: CommandRegister) -> Result<CommandRegister> {
        if attrs & !self.supported_attributes != CommandRegister::empty() {
            return Err(Error::Unsupported);
        }
        Ok(attrs)
    }

    fn enable(&self, attrs: CommandRegister) -> Result<()> {
        let requested = self.checked_command_bits(attrs)?;
        let cfg = self.cfg();
        cfg.set_command(self.sbdf, cfg.command(self.sbdf) | requested);
        // Propagate upward only on enable: widening an ancestor's decode is
        // always safe, narrowing it on a sibling's behalf is not, so
        // disable() never walks this chain.
        for ancestor in self.ancestors.iter() {
            let bits = requested & ancestor.supported_attributes;
            if bits != CommandRegister::empty() {
                cfg.set_command(ancestor.sbdf, cfg.command(ancestor.sbdf) | bits);
            }
        }
        Ok(())
    }

    fn disable(&self, attrs: CommandRegister) -> Result<()> {
        let requested = self.checked_command_bits(attrs)?;
        let cfg = self.cfg();
        cfg.set_command(self.sbdf, cfg.command(self.sbdf) & !requested);
        Ok(())
    }
}

impl PciIo for DeviceFacade {
    fn mem_read(&self, width: Width, bar: u8, offset: u64, buffer: &mut [u8]) {
        self.mem_access(width, bar, offset, true, buffer);
    }

    fn mem_write(&self, width: Width, bar: u8, offset: u64, buffer: &[u8]) {
        let mut scratch = buffer.to_vec();
        self.mem_access(width, bar, offset, false, &mut scratch);
    }

    fn io_read(&self, width: Width, bar: u8, offset: u64, buffer: &mut [u8]) {
        self.io_access(width, bar, offset, true, buffer);
    }

    fn io_write(&self, width: Width, bar: u8, offset: u64, buffer: &[u8]) {
        let mut scratch = buffer.to_vec();
        self.io_access(width, bar, offset, false, &mut scratch);
    }

    fn config_read(&self, width: Width, offset: u16, buffer: &mut [u8]) {
        let cfg = self.cfg();
        for (index, chunk) in buffer.chunks_mut(width.bytes()).enumerate() {
            let at = offset + (index * width.bytes()) as u16;
            match width {
                Width::Byte => chunk[0] = cfg.read8(self.sbdf, at),
                Width::Word => chunk.copy_from_slice(&cfg.read16(self.sbdf, at).to_le_bytes()),
                Width::Dword => chunk.copy_from_slice(&cfg.read32(self.sbdf, at).to_le_bytes()),
            }
        }
    }

    fn config_write(&self, width: Width, offset: u16, buffer: &[u8]) {
        let cfg = self.cfg();
        for (index, chunk) in buffer.chunks(width.bytes()).enumerate() {
            let at = offset + (index * width.bytes()) as u16;
            match width {
                Width::Byte => cfg.write8(self.sbdf, at, chunk[0]),
                Width::Word => cfg.write16(self.sbdf, at, u16::from_le_bytes([chunk[0], chunk[1]])),
                Width::Dword => cfg.write32(self.sbdf, at, u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            }
        }
    }

    fn poll_mem(&self, width: Width, bar: u8, offset: u64, mask: u64, value: u64, delay: u64) -> Result<u64> {
        self.poll(
            || {
                let mut buffer = [0u8; 8];
                self.mem_access(width, bar, offset, true, &mut buffer[..width.bytes()]);
                u64::from_le_bytes(buffer)
            },
            mask,
            value,
            delay,
        )
    }

    fn poll_io(&self, width: Width, bar: u8, offset: u64, mask: u64, value: u64, delay: u64) -> Result<u64> {
        self.poll(
            || {
                let mut buffer = [0u8; 8];
                self.io_access(width, bar, offset, true, &mut buffer[..width.bytes()]);
                u64::from_le_bytes(buffer)
            },
            mask,
            value,
            delay,
        )
    }

    /// A non-aliasing-safe MMIO-to-MMIO copy: when the destination overlaps
    /// and trails the source, copies back-to-front so no byte is
    /// overwritten before it is read (`spec.md` §4.6).
    fn copy_mem(&self, dest_bar: u8, dest_offset: u64, src_bar: u8, src_offset: u64, width: Width, count: usize) {
        let dest_base = self.bar_address(dest_bar) + dest_offset;
        let src_base = self.bar_address(src_bar) + src_offset;
        let step = width.bytes() as u64;
        let reverse = dest_base > src_base && dest_base < src_base + step * count as u64;

        let indices: alloc::vec::Vec<usize> = if reverse { (0..count).rev().collect() } else { (0..count).collect() };
        for index in indices {
            let src_addr = src_base + index as u64 * step;
            let dest_addr = dest_base + index as u64 * step;
            unsafe {
                match width {
                    Width::Byte => self.mmio.write8(dest_addr, self.mmio.read8(src_addr)),
                    Width::Word => self.mmio.write16(dest_addr, self.mmio.read16(src_addr)),
                    Width::Dword => self.mmio.write32(dest_addr, self.mmio.read32(src_addr)),
                }
            }
        }
    }

    fn map(&self, operation: IommuOperation, host_address: u64, length: usize) -> Result<(u64, MappingToken)> {
        self.iommu.map(operation, host_address, length)
    }

    fn unmap(&self, token: MappingToken) -> Result<()> {
        self.iommu.unmap(token)
    }

    fn allocate_buffer(&self, pages: usize, attribute: IommuAttribute) -> Result<u64> {
        self.iommu.allocate_buffer(pages, attribute)
    }

    fn free_buffer(&self, host_address: u64, pages: usize) -> Result<()> {
        self.iommu.free_buffer(host_address, pages)
    }

    fn flush(&self) {}

    fn location(&self) -> Sbdf {
        self.sbdf
    }

    fn attributes(&self, op: AttributeOp, attrs: CommandRegister) -> Result<CommandRegister> {
        match op {
            AttributeOp::Get => Ok(self.cfg().command(self.sbdf) & self.supported_attributes),
            AttributeOp::GetSupported => Ok(self.supported_attributes),
            AttributeOp::Enable => {
                self.enable(attrs)?;
                Ok(self.cfg().command(self.sbdf) & self.supported_attributes)
            }
            AttributeOp::Disable => {
                self.disable(attrs)?;
                Ok(self.cfg().command(self.sbdf) & self.supported_attributes)
            }
            AttributeOp::Set => {
                self.enable(attrs)?;
                self.disable(self.supported_attributes & !attrs)?;
                Ok(self.cfg().command(self.sbdf) & self.supported_attributes)
            }
        }
    }

    fn get_bar_attributes(&self, bar: u8) -> Option<BarAttributes> {
        let cfg = self.cfg();
        match BarProbe::new(cfg).size(self.sbdf, bar) {
            BarDecode::Absent | BarDecode::UnsupportedAbove4G => None,
            BarDecode::Io { length } => Some(BarAttributes {
                kind: ResourceKind::IO_RESOURCE,
                granularity: 16,
                prefetchable: false,
                minimum: self.bar_address(bar),
                length: u64::from(length),
            }),
            BarDecode::Mem32 { length, prefetchable } => Some(BarAttributes {
                kind: ResourceKind::MEM_RESOURCE,
                granularity: 32,
                prefetchable,
                minimum: self.bar_address(bar),
                length: u64::from(length),
            }),
            BarDecode::Mem64 { length, prefetchable } => {
                let high = cfg.read32(self.sbdf, BAR0_OFFSET + 4 * u16::from(bar) + 4);
                Some(BarAttributes {
                    kind: ResourceKind::MEM_RESOURCE,
                    granularity: 64,
                    prefetchable,
                    minimum: (u64::from(high) << 32) | self.bar_address(bar),
                    length: u64::from(length),
                })
            }
        }
    }

    /// Accepted and a no-op: attributes are not further constrained in this
    /// phase (`spec.md` §4.6).
    fn set_bar_attributes(&self, _bar: u8, _attributes: BarAttributes) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sbdf::Sbdf;
    use crate::test_support::{FakeConfigSpace, FakeMmio};
    use alloc::boxed::Box;
    use core::cell::Cell;

    struct FakeTimer {
        calls: Cell<u32>,
    }

    impl Timer for FakeTimer {
        fn delay_microseconds(&self, _microseconds: u32) {
            self.calls.set(self.calls.get() + 1);
        }
    }

    struct NopPortIo;
    impl PortIo for NopPortIo {
        unsafe fn in8(&self, _port: u16) -> u8 {
            0
        }
        unsafe fn in16(&self, _port: u16) -> u16 {
            0
        }
        unsafe fn in32(&self, _port: u16) -> u32 {
            0
        }
        unsafe fn out8(&self, _port: u16, _value: u8) {}
        unsafe fn out16(&self, _port: u16, _value: u16) {}
        unsafe fn out32(&self, _port: u16, _value: u32) {}
    }

    struct NopIommu;
    impl Iommu for NopIommu {
        fn map(&self, _operation: IommuOperation, host_address: u64, _length: usize) -> Result<(u64, MappingToken)> {
            Ok((host_address, 0))
        }
        fn unmap(&self, _token: MappingToken) -> Result<()> {
            Ok(())
        }
        fn allocate_buffer(&self, _pages: usize, _attribute: IommuAttribute) -> Result<u64> {
            Err(Error::OutOfResources)
        }
        fn free_buffer(&self, _host_address: u64, _pages: usize) -> Result<()> {
            Ok(())
        }
        fn set_attribute(&self, _token: MappingToken, _attribute: IommuAttribute) -> Result<()> {
            Ok(())
        }
    }

    static PORT_IO: NopPortIo = NopPortIo;
    static IOMMU: NopIommu = NopIommu;

    fn facade(
        backing: &'static FakeConfigSpace,
        mmio: &'static FakeMmio,
        sbdf: Sbdf,
        ancestors: &[AncestorBridge],
        timer: &'static FakeTimer,
    ) -> DeviceFacade {
        DeviceFacade::new(
            sbdf,
            0,
            CommandRegister::IO_ENABLE | CommandRegister::MEMORY_ENABLE | CommandRegister::BUS_MASTER_ENABLE,
            Arc::from(ancestors),
            backing,
            mmio,
            &PORT_IO,
            &IOMMU,
            timer,
        )
    }

    #[test]
    fn enable_sets_own_command_and_propagates_to_ancestors() {
        let backing: &'static FakeConfigSpace = Box::leak(Box::new(FakeConfigSpace::default()));
        let mmio: &'static FakeMmio = Box::leak(Box::new(FakeMmio::default()));
        let timer: &'static FakeTimer = Box::leak(Box::new(FakeTimer { calls: Cell::new(0) }));
        let sbdf = Sbdf::new(0, 2, 0, 0);
        let parent = Sbdf::new(0, 1, 1, 0);
        let ancestors = [AncestorBridge { sbdf: parent, supported_attributes: CommandRegister::MEMORY_ENABLE }];
        let device = facade(backing, mmio, sbdf, &ancestors, timer);

        device.attributes(AttributeOp::Enable, CommandRegister::MEMORY_ENABLE).unwrap();

        assert!(backing_command(backing, sbdf).contains(CommandRegister::MEMORY_ENABLE));
        assert!(backing_command(backing, parent).contains(CommandRegister::MEMORY_ENABLE));
    }

    #[test]
    fn disable_does_not_touch_ancestors() {
        let backing: &'static FakeConfigSpace = Box::leak(Box::new(FakeConfigSpace::default()));
        backing.set16(Sbdf::new(0, 1, 1, 0), 0x04, CommandRegister::MEMORY_ENABLE.bits());
        let mmio: &'static FakeMmio = Box::leak(Box::new(FakeMmio::default()));
        let timer: &'static FakeTimer = Box::leak(Box::new(FakeTimer { calls: Cell::new(0) }));
        let sbdf = Sbdf::new(0, 2, 0, 0);
        let parent = Sbdf::new(0, 1, 1, 0);
        let ancestors = [AncestorBridge { sbdf: parent, supported_attributes: CommandRegister::MEMORY_ENABLE }];
        let device = facade(backing, mmio, sbdf, &ancestors, timer);

        device.attributes(AttributeOp::Enable, CommandRegister::MEMORY_ENABLE).unwrap();
        device.attributes(AttributeOp::Disable, CommandRegister::MEMORY_ENABLE).unwrap();

        assert!(!backing_command(backing, sbdf).contains(CommandRegister::MEMORY_ENABLE));
        assert!(backing_command(backing, parent).contains(CommandRegister::MEMORY_ENABLE));
    }

    #[test]
    fn enable_rejects_unsupported_bits() {
        let backing: &'static FakeConfigSpace = Box::leak(Box::new(FakeConfigSpace::default()));
        let mmio: &'static FakeMmio = Box::leak(Box::new(FakeMmio::default()));
        let timer: &'static FakeTimer = Box::leak(Box::new(FakeTimer { calls: Cell::new(0) }));
        let sbdf = Sbdf::new(0, 2, 0, 0);
        let device = facade(backing, mmio, sbdf, &[], timer);
        let result = device.attributes(AttributeOp::Enable, CommandRegister::SERR_ENABLE);
        assert!(matches!(result, Err(Error::Unsupported)));
    }

    #[test]
    fn poll_mem_times_out_when_value_never_matches() {
        let backing: &'static FakeConfigSpace = Box::leak(Box::new(FakeConfigSpace::default()));
        let sbdf = Sbdf::new(0, 2, 0, 0);
        backing.set32(sbdf, BAR0_OFFSET, 0x2000);
        let mmio: &'static FakeMmio = Box::leak(Box::new(FakeMmio::default()));
        mmio.set32(0x2000, 0x0000_0000);
        let timer: &'static FakeTimer = Box::leak(Box::new(FakeTimer { calls: Cell::new(0) }));
        let device = facade(backing, mmio, sbdf, &[], timer);

        let result = device.poll_mem(Width::Dword, 0, 0, 0xFFFF_FFFF, 0x1234, 200);
        assert!(matches!(result, Err(Error::Timeout)));
        assert_eq!(timer.calls.get(), 2);
    }

    #[test]
    fn poll_mem_succeeds_when_value_matches() {
        let backing: &'static FakeConfigSpace = Box::leak(Box::new(FakeConfigSpace::default()));
        let sbdf = Sbdf::new(0, 2, 0, 0);
        backing.set32(sbdf, BAR0_OFFSET, 0x2000);
        let mmio: &'static FakeMmio = Box::leak(Box::new(FakeMmio::default()));
        mmio.set32(0x2000, 0x1234);
        let timer: &'static FakeTimer = Box::leak(Box::new(FakeTimer { calls: Cell::new(0) }));
        let device = facade(backing, mmio, sbdf, &[], timer);

        let result = device.poll_mem(Width::Dword, 0, 0, 0xFFFF_FFFF, 0x1234, 200);
        assert_eq!(result.unwrap(), 0x1234);
        assert_eq!(timer.calls.get(), 0);
    }

    fn backing_command(backing: &FakeConfigSpace, sbdf: Sbdf) -> CommandRegister {
        CommandRegister::from_bits_retain(backing.get32(sbdf, 0x04) as u16)
    }
}
