// SPDX-License-Identifier: MIT OR Apache-2.0

//! The error type every operation in this crate returns (`spec.md` §7).

use core::fmt;

/// Failure modes recognized by this core. See `spec.md` §7 for the
/// propagation policy each variant is subject to — most are absorbed
/// locally and never reach the orchestrator's caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The addressed function is absent (vendor id reads as `0xFFFF`).
    NoSuchDevice,
    /// The feature cannot be implemented under this core's constraints
    /// (a >2 GiB 64-bit BAR, a 32-bit I/O aperture).
    Unsupported,
    /// The allocator failed, or a programmed address would not fit the
    /// window it was to be placed in.
    OutOfResources,
    /// A poll operation exhausted its delay budget without a match.
    Timeout,
    /// An argument was out of range for the requested operation.
    InvalidParameter,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NoSuchDevice => "no such device",
            Self::Unsupported => "unsupported",
            Self::OutOfResources => "out of resources",
            Self::Timeout => "timed out",
            Self::InvalidParameter => "invalid parameter",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for Error {}

impl From<Error> for pci_raw::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::NoSuchDevice => Self::NOT_FOUND,
            Error::Unsupported => Self::UNSUPPORTED,
            Error::OutOfResources => Self::OUT_OF_RESOURCES,
            Error::Timeout => Self::TIMEOUT,
            Error::InvalidParameter => Self::INVALID_PARAMETER,
        }
    }
}

impl pci_raw::Status {
    /// Converts a collaborator-reported status code back into a `Result`,
    /// at the boundary where a collaborator reports outcomes numerically
    /// instead of through this crate's `Error`.
    pub fn to_result(self) -> Result<()> {
        match self {
            Self::SUCCESS => Ok(()),
            Self::NOT_FOUND => Err(Error::NoSuchDevice),
            Self::UNSUPPORTED => Err(Error::Unsupported),
            Self::OUT_OF_RESOURCES => Err(Error::OutOfResources),
            Self::TIMEOUT => Err(Error::Timeout),
            Self::INVALID_PARAMETER => Err(Error::InvalidParameter),
            _ => Err(Error::Unsupported),
        }
    }
}

/// The `Result` alias used throughout this crate.
pub type Result<T> = core::result::Result<T, Error>;
