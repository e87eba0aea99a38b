// SPDX-License-Identifier: MIT OR Apache-2.0

/// Declares a C-style enum as a newtype wrapper instead of a Rust `enum`.
///
/// Several of the values modeled here (command-register widths, IOMMU
/// operations, status codes) come from a wire format that allows values this
/// crate does not enumerate. Feeding an unrecognized discriminant into a
/// genuine Rust `enum` is undefined behavior, so each is instead a tuple
/// struct of the backing integer type with associated consts for the named
/// values. Unrecognized values remain representable and comparable; they
/// just print as their raw integer in `Debug`.
macro_rules! newtype_enum {
    (
        $(#[$outer:meta])*
        pub enum $name:ident: $ty:ty => {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident = $value:expr
            ),* $(,)?
        }
    ) => {
        $(#[$outer])*
        #[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[repr(transparent)]
        pub struct $name(pub $ty);

        #[allow(non_upper_case_globals)]
        impl $name {
            $(
                $(#[$variant_meta])*
                pub const $variant: Self = Self($value);
            )*

            /// Returns the raw backing value.
            #[must_use]
            pub const fn raw(self) -> $ty {
                self.0
            }
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match *self {
                    $(Self::$variant => write!(f, concat!(stringify!($name), "::", stringify!($variant))),)*
                    Self(other) => write!(f, concat!(stringify!($name), "({:#x})"), other),
                }
            }
        }

        impl From<$ty> for $name {
            fn from(value: $ty) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $ty {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}
