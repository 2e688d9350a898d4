//! # Page descriptors
//!
//! One [`PageDescriptor`] exists per physical page frame. The descriptor is
//! the page's identity for its whole life: the zone, node and section it
//! belongs to are packed into the flags word at boot and never change.
//!
//! ```text
//!  flags (u64)
//!  63        48 47 46 45    40 39                    16 15            0
//! ┌────────────┬─────┬────────┬────────────────────────┬───────────────┐
//! │  reserved  │zone │  node  │        section         │  state bits   │
//! └────────────┴─────┴────────┴────────────────────────┴───────────────┘
//! ```
//!
//! What the page is currently used for is an explicit [`PageRole`]. The
//! remaining words are reused according to the role:
//!
//! | field       | generic page           | hive slab head              |
//! |-------------|------------------------|-----------------------------|
//! | `ref_count` | holders − 1 (−1 free)  | holders − 1                 |
//! | `map_count` | user mappings − 1      | objects in use              |
//! | `index`     | page-cache index       | head of the slab free list  |
//! | `private`   | unused                 | next never-used slot        |
//! | links       | free / per-CPU list    | partial list                |

use crate::addr::Pfn;
use crate::flags::ZoneType;
use bitfield_struct::bitfield;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

/// "No page" / "no object" in link and free-list words.
pub const NIL: u64 = u64::MAX;

/// Stored reference count of a free page.
pub const REF_FREE: i32 = -1;

/// Stored map count of a page without user mappings.
pub const MAP_NONE: i32 = -1;

#[bitfield(u64)]
pub struct PageFlags {
    #[bits(16)]
    pub state: u16,
    #[bits(24)]
    pub section: u32,
    #[bits(6)]
    pub node: u8,
    #[bits(2)]
    pub zone: u8,
    #[bits(16)]
    __: u16,
}

bitflags! {
    /// State bits kept in the low 16 bits of [`PageFlags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageState: u16 {
        const LOCKED = 1 << 0;
        const DIRTY = 1 << 1;
        const WRITEBACK = 1 << 2;
        const REFERENCED = 1 << 3;
        const ACTIVE = 1 << 4;
        const LRU = 1 << 5;
        const UPTODATE = 1 << 6;
        /// Never handed to the page allocator (holes, boot memory).
        const RESERVED = 1 << 7;
        /// Slab is some CPU's active slab.
        const SLAB_FROZEN = 1 << 8;
    }
}

impl PageState {
    /// Bits that must be clear when a page goes back to the free lists.
    pub const CHECK_AT_FREE: Self = Self::LOCKED
        .union(Self::WRITEBACK)
        .union(Self::RESERVED)
        .union(Self::SLAB_FROZEN);
}

/// Identifies a hive allotter in slab descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HiveId(pub u16);

/// Opaque reference to the page-cache mapping a file page is indexed by.
///
/// Only the low 60 bits are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheHandle(u64);

impl CacheHandle {
    pub const MAX: u64 = (1 << ROLE_PAYLOAD_BITS) - 1;

    /// # Panics
    /// Panics if `raw` does not fit the role payload.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        assert!(raw <= Self::MAX, "cache handle out of range");
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

const ROLE_TAG_BITS: u32 = 4;
const ROLE_PAYLOAD_BITS: u32 = u64::BITS - ROLE_TAG_BITS;

/// What a page is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRole {
    /// Not managed by the page allocator.
    Reserved,
    /// Head of a free buddy block.
    Free { order: u8 },
    /// Any non-head page of a block, or a free page inside a larger block.
    Tail,
    /// Parked in a per-CPU single-page cache.
    PerCpu { cold: bool },
    /// Head of an allocated block with no more specific owner.
    Allocated { order: u8 },
    Anonymous,
    FileBacked(CacheHandle),
    SlabHead { hive: HiveId },
    SlabTail { head: Pfn },
}

impl PageRole {
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        let (tag, payload) = match self {
            Self::Reserved => (0, 0),
            Self::Free { order } => (1, order as u64),
            Self::Tail => (2, 0),
            Self::PerCpu { cold } => (3, cold as u64),
            Self::Allocated { order } => (4, order as u64),
            Self::Anonymous => (5, 0),
            Self::FileBacked(handle) => (6, handle.0),
            Self::SlabHead { hive } => (7, hive.0 as u64),
            Self::SlabTail { head } => (8, head.as_u64()),
        };
        (payload << ROLE_TAG_BITS) | tag
    }

    /// # Panics
    /// Panics on a tag no role encodes to; the descriptor is corrupted.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_bits(bits: u64) -> Self {
        let payload = bits >> ROLE_TAG_BITS;
        match bits & ((1 << ROLE_TAG_BITS) - 1) {
            0 => Self::Reserved,
            1 => Self::Free {
                order: payload as u8,
            },
            2 => Self::Tail,
            3 => Self::PerCpu { cold: payload != 0 },
            4 => Self::Allocated {
                order: payload as u8,
            },
            5 => Self::Anonymous,
            6 => Self::FileBacked(CacheHandle(payload)),
            7 => Self::SlabHead {
                hive: HiveId(payload as u16),
            },
            8 => Self::SlabTail {
                head: Pfn::new(payload),
            },
            _ => panic!("BUG: corrupted page role"),
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_free(self) -> bool {
        matches!(self, Self::Free { .. })
    }

    #[inline]
    #[must_use]
    pub const fn is_slab(self) -> bool {
        matches!(self, Self::SlabHead { .. } | Self::SlabTail { .. })
    }
}

/// Per-frame bookkeeping.
#[repr(C)]
pub struct PageDescriptor {
    flags: AtomicU64,
    ref_count: AtomicI32,
    map_count: AtomicI32,
    index: AtomicU64,
    private: AtomicU64,
    role: AtomicU64,
    prev: AtomicU64,
    next: AtomicU64,
}

impl PageDescriptor {
    /// A reserved page owned by boot code: one holder, no mappings.
    #[must_use]
    pub fn reserved(node: usize, zone: ZoneType, section: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let flags = PageFlags::new()
            .with_state(PageState::RESERVED.bits())
            .with_section(section as u32)
            .with_node(node as u8)
            .with_zone(zone as u8);
        Self {
            flags: AtomicU64::new(flags.into()),
            ref_count: AtomicI32::new(0),
            map_count: AtomicI32::new(MAP_NONE),
            index: AtomicU64::new(0),
            private: AtomicU64::new(0),
            role: AtomicU64::new(PageRole::Reserved.to_bits()),
            prev: AtomicU64::new(NIL),
            next: AtomicU64::new(NIL),
        }
    }

    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub fn node(&self) -> usize {
        usize::from(self.flags().node())
    }

    #[inline]
    pub fn zone_type(&self) -> ZoneType {
        ZoneType::from_index(usize::from(self.flags().zone()))
    }

    #[inline]
    pub fn section(&self) -> u64 {
        u64::from(self.flags().section())
    }

    #[inline]
    pub fn state(&self) -> PageState {
        PageState::from_bits_retain(self.flags().state())
    }

    /// Sets `bits`; returns the state before.
    #[inline]
    pub fn set_state(&self, bits: PageState) -> PageState {
        let old = self.flags.fetch_or(u64::from(bits.bits()), Ordering::AcqRel);
        PageState::from_bits_retain(PageFlags::from(old).state())
    }

    /// Clears `bits`; returns the state before.
    #[inline]
    pub fn clear_state(&self, bits: PageState) -> PageState {
        let old = self
            .flags
            .fetch_and(!u64::from(bits.bits()), Ordering::AcqRel);
        PageState::from_bits_retain(PageFlags::from(old).state())
    }

    #[inline]
    pub fn role(&self) -> PageRole {
        PageRole::from_bits(self.role.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_role(&self, role: PageRole) {
        self.role.store(role.to_bits(), Ordering::Release);
    }

    #[inline]
    pub(crate) fn ref_count(&self) -> &AtomicI32 {
        &self.ref_count
    }

    #[inline]
    pub(crate) fn map_count(&self) -> &AtomicI32 {
        &self.map_count
    }

    /// Raw stored reference count (holders − 1).
    #[inline]
    pub fn ref_count_raw(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn index(&self) -> u64 {
        self.index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_index(&self, index: u64) {
        self.index.store(index, Ordering::Release);
    }

    #[inline]
    pub(crate) fn private(&self) -> u64 {
        self.private.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_private(&self, value: u64) {
        self.private.store(value, Ordering::Release);
    }

    #[inline]
    pub(crate) fn link_prev(&self) -> u64 {
        self.prev.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn link_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_links(&self, prev: u64, next: u64) {
        self.prev.store(prev, Ordering::Relaxed);
        self.next.store(next, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_link_prev(&self, prev: u64) {
        self.prev.store(prev, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_link_next(&self, next: u64) {
        self.next.store(next, Ordering::Relaxed);
    }

    // Slab view of the shared words.

    #[inline]
    pub(crate) fn slab_inuse(&self) -> u32 {
        self.map_count.load(Ordering::Acquire).cast_unsigned()
    }

    #[inline]
    pub(crate) fn slab_inuse_inc(&self) {
        self.map_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after the decrement.
    ///
    /// # Panics
    /// Panics if no object was in use.
    #[inline]
    pub(crate) fn slab_inuse_dec(&self) -> u32 {
        let prev = self.map_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "BUG: slab object count underflow");
        (prev - 1).cast_unsigned()
    }

    #[inline]
    pub(crate) fn set_slab_inuse(&self, inuse: i32) {
        self.map_count.store(inuse, Ordering::Release);
    }
}

impl fmt::Debug for PageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageDescriptor")
            .field("node", &self.node())
            .field("zone", &self.zone_type())
            .field("state", &self.state())
            .field("role", &self.role())
            .field("ref_count", &self.ref_count_raw())
            .field("map_count", &self.map_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
