// SPDX-License-Identifier: MIT OR Apache-2.0

//! Numeric status codes for collaborators that report outcomes across a
//! function-pointer or FFI-shaped boundary, rather than through a Rust
//! `Result`.

newtype_enum! {
/// Status code returned by an `EXTERNAL COLLABORATOR`-shaped interface.
///
/// Internal code in `pci-preboot` always works with
/// [`pci_preboot::error::Error`](https://example.invalid) instead; `Status`
/// exists only at the boundary where a collaborator is modeled as reporting
/// a raw outcome code (e.g. a poll operation, or a buffer allocator).
#[must_use]
pub enum Status: usize => {
    /// The operation completed successfully.
    SUCCESS = 0,
    /// The requested function was absent (`NoSuchDevice`).
    NOT_FOUND = 1,
    /// The requested operation cannot be implemented (`Unsupported`).
    UNSUPPORTED = 2,
    /// The allocator failed, or a programmed address would not fit the
    /// available window (`OutOfResources`).
    OUT_OF_RESOURCES = 3,
    /// A poll operation exhausted its delay budget (`Timeout`).
    TIMEOUT = 4,
    /// An argument was out of range for the operation (`InvalidParameter`).
    INVALID_PARAMETER = 5,
}
}

impl Status {
    /// Returns `true` if this status represents success.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn debug_prints_known_variant_name() {
        assert_eq!(format!("{:?}", Status::OUT_OF_RESOURCES), "Status::OUT_OF_RESOURCES");
    }

    #[test]
    fn debug_prints_raw_value_for_unknown_code() {
        assert_eq!(format!("{:?}", Status(0x99)), "Status(0x99)");
    }
}
