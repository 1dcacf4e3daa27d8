//! Helper macros for single-field newtype handles (`struct X { inner: T }`).

/// Implement [core::ops::Deref] from a handle newtype to its `inner` field.
#[macro_export]
macro_rules! impl_deref {
    ($name: ident, $type: ty) => {
        impl core::ops::Deref for $name {
            type Target = $type;

            fn deref(&self) -> &Self::Target {
                &self.inner
            }
        }
    };
}

/// Implement conversions between a handle newtype and its `inner` field.
#[macro_export]
macro_rules! impl_conversion {
    ($name: ident, $type: ty) => {
        impl core::convert::From<$type> for $name {
            fn from(value: $type) -> Self {
                $name { inner: value }
            }
        }
        impl core::convert::From<$name> for $type {
            fn from(value: $name) -> Self {
                value.inner
            }
        }
    };
}

/// Implement pointer identity for an `Arc`-backed handle newtype.
///
/// Two handles compare equal iff they point at the same allocation, and
/// `key()` yields an address usable in ordered sets while the handle is alive.
#[macro_export]
macro_rules! impl_ptr_identity {
    ($name: ident) => {
        impl core::cmp::PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                alloc::sync::Arc::ptr_eq(&self.inner, &other.inner)
            }
        }
        impl core::cmp::Eq for $name {}
        impl core::clone::Clone for $name {
            fn clone(&self) -> Self {
                $name {
                    inner: self.inner.clone(),
                }
            }
        }
        impl $name {
            /// Address of the shared allocation.
            pub fn key(&self) -> usize {
                alloc::sync::Arc::as_ptr(&self.inner) as *const () as usize
            }
        }
    };
}
