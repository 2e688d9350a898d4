//! # kmalloc
//!
//! General-purpose allocation on top of a fixed set of size-class hives.
//! Requests above the largest class are served as whole page blocks.

use super::{Hive, HiveConfig};
use crate::addr::{Pfn, get_order};
use crate::flags::PafFlags;
use crate::page::{HiveId, PageRole};
use crate::phys_mapper::PhysMapper;
use crate::subsystem::MemorySubsystem;
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE;
use log::{info, warn};

const CLASSES: usize = 13;

/// Object sizes of the kmalloc hives.
pub const KMALLOC_SIZES: [usize; CLASSES] = [8, 16, 32, 64, 96, 128, 192, 256, 512, 1024, 2048, 4096, 8192];

/// Largest request served from a hive.
pub const KMALLOC_MAX_CACHE_SIZE: usize = KMALLOC_SIZES[CLASSES - 1];

const NAMES: [&str; CLASSES] = [
    "kmalloc-8",
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-96",
    "kmalloc-128",
    "kmalloc-192",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1k",
    "kmalloc-2k",
    "kmalloc-4k",
    "kmalloc-8k",
];

pub(crate) struct KmallocCaches {
    hives: [Option<Hive>; CLASSES],
}

impl KmallocCaches {
    pub(crate) const fn empty() -> Self {
        Self {
            hives: [const { None }; CLASSES],
        }
    }

    pub(crate) fn create<M: PhysMapper>(mm: &MemorySubsystem<'_, M>) -> Self {
        let hives = core::array::from_fn(|i| match mm.hive_create_with(HiveConfig::new(NAMES[i], KMALLOC_SIZES[i])) {
            Ok(hive) => Some(hive),
            Err(e) => {
                warn!("{}: {e}", NAMES[i]);
                None
            }
        });
        info!("kmalloc: {CLASSES} size classes up to {KMALLOC_MAX_CACHE_SIZE} bytes");
        Self { hives }
    }

    /// Smallest class holding `size` bytes at `align`.
    ///
    /// Slots start at multiples of the class size inside page-aligned slabs,
    /// so a class is aligned to the largest power of two dividing its size.
    fn class(size: usize, align: usize) -> Option<usize> {
        KMALLOC_SIZES
            .iter()
            .position(|&class| class >= size && class % align == 0)
    }

    fn by_id(&self, hive: HiveId) -> Option<&Hive> {
        self.hives.iter().flatten().find(|h| h.id() == hive)
    }
}

impl core::fmt::Debug for KmallocCaches {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.hives.iter().flatten().map(Hive::name))
            .finish()
    }
}

impl<M: PhysMapper> MemorySubsystem<'_, M> {
    /// Allocates `size` bytes, 8-byte aligned. `None` for zero bytes or on
    /// exhaustion.
    #[track_caller]
    pub fn kmalloc(&self, size: usize, flags: PafFlags) -> Option<NonNull<u8>> {
        self.kmalloc_aligned(size, 8, flags)
    }

    /// Like [`kmalloc`](Self::kmalloc), zero-filled.
    #[track_caller]
    pub fn kzalloc(&self, size: usize, flags: PafFlags) -> Option<NonNull<u8>> {
        self.kmalloc_aligned(size, 8, flags | PafFlags::ZERO)
    }

    /// Allocates `size` bytes aligned to `align` (a power of two).
    #[track_caller]
    pub fn kmalloc_aligned(&self, size: usize, align: usize, flags: PafFlags) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        if !align.is_power_of_two() {
            warn!("kmalloc: alignment {align} is not a power of two");
            return None;
        }
        if let Some(class) = KmallocCaches::class(size, align)
            && let Some(hive) = self.kmalloc.hives[class].as_ref()
        {
            return self.hive_alloc(hive, flags);
        }
        let order = get_order(size.max(align) as u64);
        self.alloc_page_frames(None, flags, order)
            .map(|pfn| self.page_address(pfn))
    }

    /// Frees memory from [`kmalloc`](Self::kmalloc).
    ///
    /// # Panics
    /// Panics on pointers kmalloc did not return.
    #[track_caller]
    pub fn kfree(&self, ptr: NonNull<u8>) {
        let Some(pfn) = self.virt_to_pfn(ptr) else {
            panic!("BUG: kfree of {ptr:p}: not a kernel address");
        };
        let desc = self.map.page(pfn);
        match desc.role() {
            PageRole::SlabHead { .. } | PageRole::SlabTail { .. } => {
                let hive = self.kmalloc_hive_of(pfn, ptr);
                self.hive_free(hive, ptr);
            }
            PageRole::Allocated { order } if self.page_address(pfn) == ptr => {
                self.free_page_frames(pfn, order);
            }
            role => panic!("BUG: kfree of {ptr:p} in page {pfn} with role {role:?}"),
        }
    }

    /// Usable size of a kmalloc allocation.
    ///
    /// # Panics
    /// Panics on pointers kmalloc did not return.
    pub fn ksize(&self, ptr: NonNull<u8>) -> usize {
        let Some(pfn) = self.virt_to_pfn(ptr) else {
            panic!("BUG: ksize of {ptr:p}: not a kernel address");
        };
        match self.map.page(pfn).role() {
            PageRole::SlabHead { .. } | PageRole::SlabTail { .. } => {
                self.kmalloc_hive_of(pfn, ptr).object_size()
            }
            PageRole::Allocated { order } => {
                usize::try_from(PAGE_SIZE << order).unwrap_or(usize::MAX)
            }
            role => panic!("BUG: ksize of {ptr:p} in page {pfn} with role {role:?}"),
        }
    }

    fn kmalloc_hive_of(&self, pfn: Pfn, ptr: NonNull<u8>) -> &Hive {
        let head = match self.map.page(pfn).role() {
            PageRole::SlabTail { head } => head,
            _ => pfn,
        };
        let PageRole::SlabHead { hive } = self.map.page(head).role() else {
            panic!("BUG: {ptr:p} is in a corrupted slab");
        };
        match self.kmalloc.by_id(hive) {
            Some(h) => h,
            None => panic!("BUG: kfree of {ptr:p} owned by hive {hive:?}, not a kmalloc hive"),
        }
    }

    /// The kmalloc hive for objects of `size` bytes, if any.
    #[must_use]
    pub fn kmalloc_hive(&self, size: usize) -> Option<&Hive> {
        KmallocCaches::class(size, 1).and_then(|c| self.kmalloc.hives[c].as_ref())
    }
}
