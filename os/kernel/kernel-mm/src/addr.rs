//! # Physical addresses and page frame numbers

use core::fmt;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};

/// A physical byte address.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(u64);

impl PhysAddr {
    #[inline]
    #[must_use]
    pub const fn new(pa: u64) -> Self {
        Self(pa)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Frame containing this address.
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> Pfn {
        Pfn(self.0 >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        Self(align_up(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(align_down(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA({:#x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

/// A page frame number; also the index handle of a page descriptor.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(pfn: u64) -> Self {
        Self(pfn)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn addr(self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn add(self, pages: u64) -> Self {
        Self(self.0 + pages)
    }

    /// The frame whose block of `order` pairs with this one.
    #[inline]
    #[must_use]
    pub const fn buddy(self, order: u8) -> Self {
        Self(self.0 ^ (1 << order))
    }

    /// Whether this frame may head a block of `order`.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, order: u8) -> bool {
        self.0 & ((1 << order) - 1) == 0
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Rounds `v` up to `align` (a power of two).
///
/// ```
/// # use kernel_mm::addr::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), 0x2000);
/// assert_eq!(align_up(0x2000, 0x1000), 0x2000);
/// ```
#[inline]
#[must_use]
pub const fn align_up(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (v + align - 1) & !(align - 1)
}

/// Rounds `v` down to `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(v: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    v & !(align - 1)
}

/// Smallest order whose block holds `bytes`.
///
/// ```
/// # use kernel_mm::addr::get_order;
/// assert_eq!(get_order(1), 0);
/// assert_eq!(get_order(4096), 0);
/// assert_eq!(get_order(4097), 1);
/// assert_eq!(get_order(5 * 4096), 3);
/// ```
#[inline]
#[must_use]
pub const fn get_order(bytes: u64) -> u8 {
    let pages = bytes.div_ceil(PAGE_SIZE);
    if pages <= 1 {
        0
    } else {
        // ceil(log2(pages)) is at most 52 here
        #[allow(clippy::cast_possible_truncation)]
        let order = (u64::BITS - (pages - 1).leading_zeros()) as u8;
        order
    }
}
