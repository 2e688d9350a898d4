//! # Hive slab allocator
//!
//! A [`Hive`] hands out fixed-size objects carved from slabs, blocks of
//! `2^order` pages taken from the page allocator.
//!
//! ```text
//!            CPU 0                 CPU 1
//!        ┌────────────┐        ┌────────────┐
//!        │ active slab│        │ active slab│   lock-free, pinned
//!        │ + freelist │        │ + freelist │
//!        └─────┬──────┘        └─────┬──────┘
//!              │ refill / deactivate │
//!        ┌─────▼─────────────────────▼──────┐
//!        │   per-node partial lists (lock)  │
//!        └─────────────────┬────────────────┘
//!                          │ new / discard
//!                ┌─────────▼─────────┐
//!                │  page allocator   │
//!                └───────────────────┘
//! ```
//!
//! A slab is *frozen* while it is some CPU's active slab: that CPU allocates
//! from a private freelist and carves never-used slots. Objects freed by
//! other CPUs go to the slab's own freelist under the node lock. A slab that
//! is not frozen sits on its node's partial list exactly when it has a free
//! slot; full slabs are not tracked.

pub mod debug;
pub mod kmalloc;
mod layout;
mod slab;

pub use debug::{ObjectTrack, TrackRecord};
pub use layout::SlotLayout;

use crate::addr::Pfn;
use crate::error::HiveError;
use crate::page::{HiveId, NIL};
use crate::page_list::PageList;
use crate::phys_mapper::PhysMapper;
use crate::subsystem::MemorySubsystem;
use bitflags::bitflags;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::{MAX_CPUS, MAX_HIVES, MAX_NUMNODES};
use kernel_sync::{PerCpu, SpinLock};
use log::debug;

bitflags! {
    /// Per-hive debugging and placement options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HiveFlags: u32 {
        /// Fill freed objects with a pattern and verify it on reuse.
        const POISON = 1 << 0;
        /// Guard bytes after each object catch overruns and double frees.
        const RED_ZONE = 1 << 1;
        /// Record the last allocation and free site of each object.
        const STORE_USER = 1 << 2;
        /// Back the slabs with DMA-zone pages.
        const DMA = 1 << 3;
    }
}

/// Object constructor, run once when a slot is first handed out.
pub type HiveCtor = fn(NonNull<u8>);

/// Everything [`MemorySubsystem::hive_create_with`] needs.
#[derive(Debug, Clone, Copy)]
pub struct HiveConfig {
    pub name: &'static str,
    pub object_size: usize,
    pub align: usize,
    pub flags: HiveFlags,
    pub ctor: Option<HiveCtor>,
    /// Backing order; `None` picks one from the object size.
    pub order: Option<u8>,
    /// Empty slabs kept per node; `None` derives it from the object size.
    pub min_partial: Option<usize>,
}

impl HiveConfig {
    #[must_use]
    pub const fn new(name: &'static str, object_size: usize) -> Self {
        Self {
            name,
            object_size,
            align: 8,
            flags: HiveFlags::empty(),
            ctor: None,
            order: None,
            min_partial: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiveStats {
    pub slabs_allocated: u64,
    pub slabs_freed: u64,
    pub objects_in_use: u64,
    pub partial_slabs: usize,
}

#[derive(Debug, Default)]
struct HiveCounters {
    slabs_allocated: AtomicU64,
    slabs_freed: AtomicU64,
    objects_in_use: AtomicU64,
}

/// A CPU's active slab.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ActiveSlab {
    page: Option<Pfn>,
    /// Slot index of the first free object, or [`NIL`].
    freelist: u64,
}

impl ActiveSlab {
    const EMPTY: Self = Self {
        page: None,
        freelist: NIL,
    };
}

/// An object allotter.
pub struct Hive {
    id: HiveId,
    name: &'static str,
    layout: SlotLayout,
    flags: HiveFlags,
    ctor: Option<HiveCtor>,
    min_partial: usize,
    cpu_slabs: PerCpu<ActiveSlab, MAX_CPUS>,
    partial: [SpinLock<PageList>; MAX_NUMNODES],
    counters: HiveCounters,
}

impl Hive {
    #[must_use]
    pub const fn id(&self) -> HiveId {
        self.id
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    #[must_use]
    pub const fn flags(&self) -> HiveFlags {
        self.flags
    }

    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.layout.object_size
    }

    #[must_use]
    pub const fn min_partial(&self) -> usize {
        self.min_partial
    }

    #[must_use]
    pub fn stats(&self) -> HiveStats {
        HiveStats {
            slabs_allocated: self.counters.slabs_allocated.load(Ordering::Relaxed),
            slabs_freed: self.counters.slabs_freed.load(Ordering::Relaxed),
            objects_in_use: self.counters.objects_in_use.load(Ordering::Relaxed),
            partial_slabs: self.partial.iter().map(|p| p.lock().len()).sum(),
        }
    }
}

impl fmt::Debug for Hive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hive")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("flags", &self.flags)
            .field("min_partial", &self.min_partial)
            .finish_non_exhaustive()
    }
}

/// [`MemorySubsystem::hive_destroy`] refused: objects are still allocated.
#[derive(Debug, thiserror::Error)]
#[error("hive {} still has {in_use} objects in use", .hive.name())]
pub struct HiveBusy {
    /// The hive, handed back unchanged.
    pub hive: Hive,
    pub in_use: u64,
}

/// Allocation bitmap of hive ids.
#[derive(Debug)]
pub(crate) struct HiveIds {
    bits: [u64; MAX_HIVES / 64],
}

impl HiveIds {
    pub(crate) const fn new() -> Self {
        Self {
            bits: [0; MAX_HIVES / 64],
        }
    }

    fn alloc(&mut self) -> Option<HiveId> {
        let (word, bits) = self
            .bits
            .iter_mut()
            .enumerate()
            .find(|(_, bits)| **bits != u64::MAX)?;
        let bit = bits.trailing_ones();
        *bits |= 1 << bit;
        #[allow(clippy::cast_possible_truncation)]
        Some(HiveId((word * 64) as u16 + bit as u16))
    }

    fn release(&mut self, id: HiveId) {
        let (word, bit) = (usize::from(id.0) / 64, id.0 % 64);
        assert!(
            self.bits[word] & (1 << bit) != 0,
            "BUG: releasing unused hive id {}",
            id.0
        );
        self.bits[word] &= !(1 << bit);
    }
}

impl<M: PhysMapper> MemorySubsystem<'_, M> {
    /// Creates a hive with automatic slab order and partial-list size.
    ///
    /// # Errors
    /// See [`HiveError`].
    pub fn hive_create(
        &self,
        name: &'static str,
        object_size: usize,
        align: usize,
        flags: HiveFlags,
        ctor: Option<HiveCtor>,
    ) -> Result<Hive, HiveError> {
        self.hive_create_with(HiveConfig {
            align,
            flags,
            ctor,
            ..HiveConfig::new(name, object_size)
        })
    }

    /// # Errors
    /// See [`HiveError`].
    pub fn hive_create_with(&self, config: HiveConfig) -> Result<Hive, HiveError> {
        let mut flags = config.flags;
        if config.ctor.is_some() && flags.contains(HiveFlags::POISON) {
            debug!("hive {}: poisoning disabled, objects have a constructor", config.name);
            flags.remove(HiveFlags::POISON);
        }
        let layout = SlotLayout::compute(
            config.object_size,
            config.align,
            flags,
            config.ctor.is_some(),
            config.order,
            &self.config,
        )?;
        let id = self
            .hive_ids
            .lock()
            .alloc()
            .ok_or(HiveError::OutOfIds(MAX_HIVES))?;
        let min_partial = config
            .min_partial
            .unwrap_or_else(|| layout::default_min_partial(layout.object_size));

        debug!(
            "hive {} (id {}): {}-byte objects in {}-byte slots, {} per order-{} slab, min_partial {min_partial}",
            config.name, id.0, layout.object_size, layout.slot_size, layout.objects, layout.order
        );
        Ok(Hive {
            id,
            name: config.name,
            layout,
            flags,
            ctor: config.ctor,
            min_partial,
            cpu_slabs: PerCpu::from_fn(|_| ActiveSlab::EMPTY),
            partial: core::array::from_fn(|_| SpinLock::new(PageList::new())),
            counters: HiveCounters::default(),
        })
    }

    /// Flushes every CPU's active slab and frees all slabs of the hive.
    ///
    /// # Errors
    /// Hands the hive back while objects are still allocated from it.
    pub fn hive_destroy(&self, hive: Hive) -> Result<(), HiveBusy> {
        let in_use = hive.counters.objects_in_use.load(Ordering::Acquire);
        if in_use != 0 {
            return Err(HiveBusy { hive, in_use });
        }
        self.hive_flush_cpus(&hive);
        let mut freed = 0;
        for node in 0..MAX_NUMNODES {
            while let Some(head) = hive.partial[node].lock().pop_front(&self.map) {
                self.slab_discard(&hive, head);
                freed += 1;
            }
        }
        self.hive_ids.lock().release(hive.id);
        debug!("hive {} destroyed, {freed} slabs released", hive.name);
        Ok(())
    }

    /// Flushes every CPU's active slab and frees the empty partial slabs.
    /// Returns the number of slabs freed.
    pub fn hive_shrink(&self, hive: &Hive) -> usize {
        self.hive_flush_cpus(hive);
        let mut freed = 0;
        for node in 0..MAX_NUMNODES {
            let mut empty = PageList::new();
            {
                let mut list = hive.partial[node].lock();
                let mut cursor = list.front();
                while let Some(head) = cursor {
                    let next = self.map.page(head).link_next();
                    cursor = (next != NIL).then(|| Pfn::new(next));
                    if self.map.page(head).slab_inuse() == 0 {
                        list.remove(&self.map, head);
                        empty.push_back(&self.map, head);
                    }
                }
            }
            while let Some(head) = empty.pop_front(&self.map) {
                self.slab_discard(hive, head);
                freed += 1;
            }
        }
        debug!("hive {}: shrink released {freed} slabs", hive.name);
        freed
    }

    fn hive_flush_cpus(&self, hive: &Hive) {
        for cpu in 0..MAX_CPUS {
            let retired = {
                let mut slot = hive.cpu_slabs.pin(cpu);
                self.slab_deactivate(hive, &mut slot)
            };
            if let Some(head) = retired {
                self.slab_discard(hive, head);
            }
        }
    }

    /// Free slots left in `cpu`'s active slab.
    pub fn hive_cpu_free(&self, hive: &Hive, cpu: usize) -> usize {
        let slot = hive.cpu_slabs.pin(cpu);
        slot.page.map_or(0, |head| {
            let inuse = self.map.page(head).slab_inuse();
            hive.layout.objects.saturating_sub(inuse) as usize
        })
    }

    /// Last allocation and free site of an object of a `STORE_USER` hive.
    ///
    /// # Panics
    /// Panics if `object` is not a slot of `hive`.
    pub fn hive_object_track(&self, hive: &Hive, object: NonNull<u8>) -> Option<ObjectTrack> {
        hive.layout.track?;
        self.slab_locate(hive, object);
        // SAFETY: tracks live outside the object and are only written by the
        // allocator; reading a torn record just yields a stale site.
        unsafe {
            Some(ObjectTrack {
                alloc: debug::read_track(&hive.layout, object, debug::TrackKind::Alloc),
                free: debug::read_track(&hive.layout, object, debug::TrackKind::Free),
            })
        }
    }
}
