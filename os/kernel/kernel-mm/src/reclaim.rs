//! # Collaborators
//!
//! The allocator does not own reclaim, the page cache or CPU topology; it
//! calls out to them through these traits. Implementations must be `Sync`:
//! any CPU may call them at any time, and never with an allocator lock held.

use crate::addr::Pfn;
use crate::flags::PafFlags;
use crate::page::CacheHandle;
use crate::zone::{Watermarks, ZoneId};

/// A synchronous request to free memory in one zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkRequest {
    pub zone: ZoneId,
    /// Pages needed to get the zone back to its `high` watermark.
    pub nr_to_reclaim: u64,
    /// Order of the allocation that triggered reclaim.
    pub order: u8,
    /// Flags of that allocation; `IO` and `FS` say what reclaim may do.
    pub flags: PafFlags,
    /// Whether the caller is willing to wait for reclaim to finish.
    pub may_wait: bool,
}

/// What a reclaimer may do with the memory subsystem while shrinking.
pub trait ReclaimContext {
    /// Drops one reference to a page.
    fn release_page(&self, pfn: Pfn);

    /// Drops the caller's reference to a block of `order`.
    fn free_page_frames(&self, pfn: Pfn, order: u8);

    fn zone_free_pages(&self, zone: ZoneId) -> u64;

    fn zone_watermarks(&self, zone: ZoneId) -> Watermarks;
}

/// Shrinks caches when a zone runs low.
pub trait Reclaimer: Sync {
    /// Hint that `zone` crossed its `low` watermark; background reclaim may
    /// start. Must not block.
    fn wakeup(&self, zone: ZoneId) {
        let _ = zone;
    }

    /// Frees memory synchronously; returns the number of pages released.
    ///
    /// Allocations made from inside this call are served from the reserves
    /// and never re-enter reclaim.
    fn shrink(&self, ctx: &dyn ReclaimContext, request: &ShrinkRequest) -> u64;
}

/// Notified when the last reference to a file-backed page is dropped while
/// the page is still indexed by the page cache.
pub trait PageCacheHook: Sync {
    /// The page is already free; the hook must only drop its index entry and
    /// must not take new references.
    fn evict(&self, pfn: Pfn, cache: CacheHandle, index: u64);
}

pub trait CpuTopology: Sync {
    fn current_cpu(&self) -> usize;

    fn cpu_to_node(&self, cpu: usize) -> usize {
        let _ = cpu;
        0
    }

    /// Relative access cost; smaller is nearer.
    fn node_distance(&self, from: usize, to: usize) -> u32 {
        if from == to { 10 } else { 20 }
    }
}

/// Reclaimer that never frees anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReclaim;

impl Reclaimer for NoReclaim {
    fn shrink(&self, _ctx: &dyn ReclaimContext, _request: &ShrinkRequest) -> u64 {
        0
    }
}

/// Page-cache hook for systems without a page cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPageCache;

impl PageCacheHook for NoPageCache {
    fn evict(&self, _pfn: Pfn, _cache: CacheHandle, _index: u64) {}
}

/// A single CPU on node 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct Uniprocessor;

impl CpuTopology for Uniprocessor {
    fn current_cpu(&self) -> usize {
        0
    }
}

/// The external parts the subsystem calls into.
#[derive(Clone, Copy)]
pub struct Collaborators<'m> {
    pub reclaimer: &'m dyn Reclaimer,
    pub page_cache: &'m dyn PageCacheHook,
    pub topology: &'m dyn CpuTopology,
}

impl Default for Collaborators<'_> {
    fn default() -> Self {
        Self {
            reclaimer: &NoReclaim,
            page_cache: &NoPageCache,
            topology: &Uniprocessor,
        }
    }
}

impl core::fmt::Debug for Collaborators<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
