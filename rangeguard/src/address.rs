//! Opaque address key.
//!
//! Addresses are plain integers as far as the tracker is concerned. All range
//! arithmetic happens on this type, so the tree and tracker never touch the
//! memory an address refers to.

use std::fmt;

/// An address handed out by a [`RawAllocator`](crate::allocator::RawAllocator).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one, clamped to the top of the address space.
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.saturating_add(bytes))
    }

    pub fn checked_offset(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Number of bytes from `base` up to `self`. Zero if `base` lies above.
    pub const fn distance_from(self, base: Address) -> usize {
        self.0.saturating_sub(base.0)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<usize> for Address {
    fn from(raw: usize) -> Self {
        Self(raw)
    }
}
