//! # Page areas (zones)
//!
//! One [`PageArea`] exists per node and zone type. It owns the buddy free
//! lists for its frame range, the watermarks that gate allocations from it,
//! the per-CPU page caches and a wait queue for allocators out of memory.
//!
//! ```text
//!  order   free list (heads only, each block 2^order pages, 2^order aligned)
//!  ─────   ──────────────────────────────────────────────────────────────
//!    0     [pfn 3] ⇄ [pfn 17]
//!    1     [pfn 8]
//!    2     -
//!    …
//!   10     [pfn 1024] ⇄ [pfn 2048]
//! ```
//!
//! Free lists are only touched under the area's spin lock. `free_pages`
//! mirrors the buddy total so watermark checks can read it without the lock.

use crate::addr::Pfn;
use crate::mem_map::MemMap;
use crate::page::PageRole;
use crate::page_list::PageList;
use crate::pcp::PerCpuPages;
use crate::flags::ZoneType;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::memory::{MAX_CPUS, MAX_ORDER};
use kernel_sync::{PerCpu, SpinLock, WaitQueue};
use log::info;

#[allow(clippy::cast_possible_truncation)]
const TOP_ORDER: u8 = MAX_ORDER as u8;

/// Node and zone type of a page area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ZoneId {
    pub node: usize,
    pub zone: ZoneType,
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} {}", self.node, self.zone.name())
    }
}

/// Which watermark an allocation attempt must stay above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Min,
    Low,
    High,
    /// Reserve access: only an empty zone refuses.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Watermarks {
    pub min: u64,
    pub low: u64,
    pub high: u64,
}

impl Watermarks {
    /// `low` and `high` sit a quarter and a half above `min`.
    #[must_use]
    pub const fn from_min(min: u64) -> Self {
        Self {
            min,
            low: min + min / 4,
            high: min + min / 2,
        }
    }
}

/// Buddy free lists, one per order.
#[derive(Debug, Default)]
pub struct FreeArea {
    lists: [PageList; MAX_ORDER],
}

impl FreeArea {
    #[must_use]
    pub const fn blocks(&self, order: usize) -> usize {
        self.lists[order].len()
    }
}

#[derive(Debug, Default)]
pub struct ZoneStats {
    pub(crate) allocs: AtomicU64,
    pub(crate) frees: AtomicU64,
    pub(crate) fallback_hits: AtomicU64,
    pub(crate) reclaim_calls: AtomicU64,
    pub(crate) failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStatsSnapshot {
    pub allocs: u64,
    pub frees: u64,
    pub fallback_hits: u64,
    pub reclaim_calls: u64,
    pub failures: u64,
}

impl ZoneStats {
    #[must_use]
    pub fn snapshot(&self) -> ZoneStatsSnapshot {
        ZoneStatsSnapshot {
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            fallback_hits: self.fallback_hits.load(Ordering::Relaxed),
            reclaim_calls: self.reclaim_calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Result of a full walk over an area's free lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeListReport {
    pub zone: ZoneId,
    pub free_pages: u64,
    pub blocks: [usize; MAX_ORDER],
}

pub struct PageArea {
    id: ZoneId,
    start_pfn: u64,
    end_pfn: u64,
    present_pages: u64,
    free_area: SpinLock<FreeArea>,
    free_pages: AtomicU64,
    watermarks: [AtomicU64; 3],
    pub(crate) pcp: PerCpu<PerCpuPages, MAX_CPUS>,
    pub(crate) wait: WaitQueue,
    pub(crate) stats: ZoneStats,
}

impl PageArea {
    pub(crate) fn new(id: ZoneId, start_pfn: u64, end_pfn: u64, present_pages: u64) -> Self {
        Self {
            id,
            start_pfn,
            end_pfn,
            present_pages,
            free_area: SpinLock::new(FreeArea::default()),
            free_pages: AtomicU64::new(0),
            watermarks: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
            pcp: PerCpu::from_fn(|_| PerCpuPages::new(0)),
            wait: WaitQueue::new(),
            stats: ZoneStats::default(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> ZoneId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn is_populated(&self) -> bool {
        self.present_pages > 0
    }

    #[inline]
    #[must_use]
    pub const fn present_pages(&self) -> u64 {
        self.present_pages
    }

    /// Spanned frame range `[start, end)`; may include holes.
    #[inline]
    #[must_use]
    pub const fn span(&self) -> (Pfn, Pfn) {
        (Pfn::new(self.start_pfn), Pfn::new(self.end_pfn))
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pfn: Pfn) -> bool {
        pfn.as_u64() >= self.start_pfn && pfn.as_u64() < self.end_pfn
    }

    /// Pages on the buddy lists (per-CPU caches not included).
    #[inline]
    pub fn free_pages(&self) -> u64 {
        self.free_pages.load(Ordering::Relaxed)
    }

    pub fn watermarks(&self) -> Watermarks {
        Watermarks {
            min: self.watermarks[0].load(Ordering::Relaxed),
            low: self.watermarks[1].load(Ordering::Relaxed),
            high: self.watermarks[2].load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_watermarks(&self, marks: Watermarks) {
        self.watermarks[0].store(marks.min, Ordering::Relaxed);
        self.watermarks[1].store(marks.low, Ordering::Relaxed);
        self.watermarks[2].store(marks.high, Ordering::Relaxed);
    }

    #[must_use]
    pub fn stats(&self) -> ZoneStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a block of `order` may be taken without crossing `mark`.
    pub fn watermark_ok(&self, order: u8, mark: Mark) -> bool {
        let free = self.free_pages();
        let need = 1u64 << order;
        if free < need {
            return false;
        }
        let floor = match mark {
            Mark::Ignore => return true,
            Mark::Min => self.watermarks().min,
            Mark::Low => self.watermarks().low,
            Mark::High => self.watermarks().high,
        };
        free - (need - 1) > floor
    }

    /// Whether the area has dropped to its `low` watermark.
    pub fn below_low(&self) -> bool {
        self.free_pages() <= self.watermarks().low
    }

    pub(crate) fn lock(&self) -> kernel_sync::SpinLockGuard<'_, FreeArea> {
        self.free_area.lock()
    }

    /// Number of free blocks of exactly `order`.
    pub fn free_blocks(&self, order: u8) -> usize {
        self.free_area
            .with_lock(|fa| fa.blocks(usize::from(order)))
    }

    /// Splits an order-`high` block at `pfn` down to `low`, returning the
    /// upper halves to the free lists.
    fn expand(&self, map: &MemMap<'_>, fa: &mut FreeArea, pfn: Pfn, low: u8, mut high: u8) {
        while high > low {
            high -= 1;
            let half = pfn.add(1 << high);
            map.page(half).set_role(PageRole::Free { order: high });
            fa.lists[usize::from(high)].push_front(map, half);
        }
    }

    /// Takes a block of `order` off the free lists.
    ///
    /// # Panics
    /// Panics when a listed block does not carry the matching free role.
    pub(crate) fn rmqueue(&self, map: &MemMap<'_>, fa: &mut FreeArea, order: u8) -> Option<Pfn> {
        for current in order..TOP_ORDER {
            let Some(pfn) = fa.lists[usize::from(current)].pop_front(map) else {
                continue;
            };
            let role = map.page(pfn).role();
            assert!(
                role == PageRole::Free { order: current },
                "BUG: free list corruption in {}: page {pfn} on order-{current} list has role {role:?}",
                self.id
            );
            map.page(pfn).set_role(PageRole::Tail);
            self.expand(map, fa, pfn, order, current);
            self.free_pages.fetch_sub(1u64 << order, Ordering::Relaxed);
            return Some(pfn);
        }
        None
    }

    /// Puts a block of `order` back, merging with free buddies.
    ///
    /// Every page of the block must already be `Tail` with the free
    /// reference count.
    pub(crate) fn free_one(&self, map: &MemMap<'_>, fa: &mut FreeArea, pfn: Pfn, order: u8) {
        debug_assert!(pfn.is_aligned(order), "unaligned order-{order} block {pfn}");
        let pages = 1u64 << order;
        let mut head = pfn;
        let mut order = order;
        map.page(head).set_role(PageRole::Tail);

        while usize::from(order) < MAX_ORDER - 1 {
            let buddy = head.buddy(order);
            if !self.contains(buddy) {
                break;
            }
            let Some(desc) = map.try_page(buddy) else {
                break;
            };
            if desc.role() != (PageRole::Free { order })
                || desc.node() != self.id.node
                || desc.zone_type() != self.id.zone
            {
                break;
            }
            fa.lists[usize::from(order)].remove(map, buddy);
            desc.set_role(PageRole::Tail);
            head = Pfn::new(head.as_u64() & !(1u64 << order));
            order += 1;
        }

        map.page(head).set_role(PageRole::Free { order });
        fa.lists[usize::from(order)].push_front(map, head);
        self.free_pages.fetch_add(pages, Ordering::Relaxed);
    }

    /// Walks every free list and checks block heads, alignment, zone
    /// membership and the free counter.
    ///
    /// # Panics
    /// Panics on any inconsistency.
    pub fn check_free_lists(&self, map: &MemMap<'_>) -> FreeListReport {
        let fa = self.lock();
        let mut report = FreeListReport {
            zone: self.id,
            free_pages: 0,
            blocks: [0; MAX_ORDER],
        };
        for (order, list) in fa.lists.iter().enumerate() {
            list.verify(map);
            #[allow(clippy::cast_possible_truncation)]
            let order8 = order as u8;
            for pfn in list.iter(map) {
                assert!(
                    pfn.is_aligned(order8) && self.contains(pfn),
                    "BUG: misplaced order-{order} block {pfn} in {}",
                    self.id
                );
                assert_eq!(
                    map.page(pfn).role(),
                    PageRole::Free { order: order8 },
                    "BUG: block {pfn} on order-{order} list of {}",
                    self.id
                );
                report.free_pages += 1u64 << order;
            }
            report.blocks[order] = list.len();
        }
        assert_eq!(
            report.free_pages,
            self.free_pages(),
            "BUG: free counter of {} out of sync",
            self.id
        );
        report
    }

    /// Logs a one-line summary of the area.
    pub fn show(&self) {
        if !self.is_populated() {
            return;
        }
        let marks = self.watermarks();
        let blocks: [usize; MAX_ORDER] = {
            let fa = self.lock();
            core::array::from_fn(|o| fa.blocks(o))
        };
        info!(
            "{}: free:{} min:{} low:{} high:{} present:{} blocks:{:?}",
            self.id,
            self.free_pages(),
            marks.min,
            marks.low,
            marks.high,
            self.present_pages,
            blocks
        );
    }
}

impl fmt::Debug for PageArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageArea")
            .field("id", &self.id)
            .field("span", &self.span())
            .field("present_pages", &self.present_pages)
            .field("free_pages", &self.free_pages())
            .field("watermarks", &self.watermarks())
            .finish_non_exhaustive()
    }
}
