// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire-level types for the pre-boot PCI Express enumerator.
//!
//! This crate holds the parts of the stack that carry no algorithmic
//! content: status codes, the command/attribute register bitflags, BAR
//! decode results, bridge base/limit register bit-packing, and the
//! well-known GUIDs the enumerator publishes facades against.
//!
//! [`pci-preboot`] builds the enumerator, resource planner, and programmer
//! on top of these types.
//!
//! [`pci-preboot`]: https://example.invalid

#![cfg_attr(not(test), no_std)]
#![deny(clippy::all, missing_debug_implementations, unused)]

#[macro_use]
mod newtype;

pub mod command;
pub mod guid;
pub mod iommu;
pub mod resource;
pub mod status;

pub use status::Status;
pub use uguid::{guid, Guid};
