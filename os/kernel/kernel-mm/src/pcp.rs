//! # Per-CPU page caches
//!
//! Each page area keeps, per CPU, a hot and a cold list of single pages.
//! Order-0 requests that ask for `HOT` or `COLD` are served from there and
//! only touch the zone lock once per `batch` pages.

use crate::addr::Pfn;
use crate::mem_map::MemMap;
use crate::page::PageRole;
use crate::page_list::PageList;
use crate::zone::{Mark, PageArea};
use log::trace;

#[derive(Debug, Clone, Copy)]
pub struct PcpList {
    pub(crate) pages: PageList,
    /// Refill when the count is at or below this.
    pub low: u32,
    /// Drain when the count reaches this.
    pub high: u32,
    pub batch: u32,
}

impl PcpList {
    #[inline]
    #[must_use]
    pub const fn count(&self) -> usize {
        self.pages.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PerCpuPages {
    lists: [PcpList; 2],
}

impl PerCpuPages {
    /// Hot list refills below `2 * batch` and drains at `6 * batch`; the cold
    /// list starts empty and drains at `2 * batch`.
    #[must_use]
    pub const fn new(batch: u32) -> Self {
        Self {
            lists: [
                PcpList {
                    pages: PageList::new(),
                    low: 2 * batch,
                    high: 6 * batch,
                    batch,
                },
                PcpList {
                    pages: PageList::new(),
                    low: 0,
                    high: 2 * batch,
                    batch,
                },
            ],
        }
    }

    #[inline]
    #[must_use]
    pub const fn list(&self, cold: bool) -> &PcpList {
        &self.lists[cold as usize]
    }

    #[inline]
    pub(crate) const fn list_mut(&mut self, cold: bool) -> &mut PcpList {
        &mut self.lists[cold as usize]
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.lists[0].count() + self.lists[1].count()
    }
}

/// Batch size for a zone: about a thousandth of it, capped at 512 KiB worth
/// of pages, a quarter of that, then rounded to `2^n - 1`.
#[must_use]
pub fn zone_batch_size(present_pages: u64) -> u32 {
    let batch = (present_pages / 1024).min(512 * 1024 / 4096) / 4;
    if batch == 0 {
        return 1;
    }
    let batch = batch + batch / 2;
    // (1 << fls(batch)) - 1
    let bits = u64::BITS - batch.leading_zeros();
    u32::try_from((1u64 << bits) - 1).unwrap_or(u32::MAX)
}

impl PageArea {
    /// Pops a page already cached on `cpu`'s hot or cold list. Never touches
    /// the buddy lists, so no watermark applies.
    pub(crate) fn pcp_take(&self, map: &MemMap<'_>, cpu: usize, cold: bool) -> Option<Pfn> {
        let mut pcp = self.pcp.pin(cpu);
        let pfn = pcp.list_mut(cold).pages.pop_front(map)?;
        map.page(pfn).set_role(PageRole::Tail);
        Some(pfn)
    }

    /// Takes one page from `cpu`'s hot or cold list, refilling from the
    /// buddy lists if it ran low. The refill stops before the zone drops to
    /// `mark`.
    pub(crate) fn pcp_alloc(&self, map: &MemMap<'_>, cpu: usize, cold: bool, mark: Mark) -> Option<Pfn> {
        let mut pcp = self.pcp.pin(cpu);
        let list = pcp.list_mut(cold);
        if list.count() <= list.low as usize {
            let mut fa = self.lock();
            for _ in 0..list.batch.max(1) {
                if !self.watermark_ok(0, mark) {
                    break;
                }
                let Some(pfn) = self.rmqueue(map, &mut fa, 0) else {
                    break;
                };
                map.page(pfn).set_role(PageRole::PerCpu { cold });
                list.pages.push_back(map, pfn);
            }
        }
        let pfn = list.pages.pop_front(map)?;
        map.page(pfn).set_role(PageRole::Tail);
        Some(pfn)
    }

    /// Parks a free page on `cpu`'s list, draining a batch back to the
    /// buddy lists once the list is full.
    pub(crate) fn pcp_free(&self, map: &MemMap<'_>, cpu: usize, pfn: Pfn, cold: bool) {
        let mut pcp = self.pcp.pin(cpu);
        let list = pcp.list_mut(cold);
        map.page(pfn).set_role(PageRole::PerCpu { cold });
        if cold {
            list.pages.push_back(map, pfn);
        } else {
            list.pages.push_front(map, pfn);
        }
        if list.count() >= list.high as usize {
            let batch = list.batch.max(1) as usize;
            self.pcp_drain_list(map, list, batch);
        }
    }

    fn pcp_drain_list(&self, map: &MemMap<'_>, list: &mut PcpList, count: usize) -> usize {
        let mut fa = self.lock();
        let mut drained = 0;
        while drained < count {
            let Some(pfn) = list.pages.pop_back(map) else {
                break;
            };
            self.free_one(map, &mut fa, pfn, 0);
            drained += 1;
        }
        drop(fa);
        if drained > 0 {
            self.wait.wake_all();
        }
        drained
    }

    /// Returns every page cached for `cpu` to the buddy lists.
    pub(crate) fn pcp_drain(&self, map: &MemMap<'_>, cpu: usize) -> usize {
        let mut pcp = self.pcp.pin(cpu);
        let mut drained = 0;
        for cold in [false, true] {
            let list = pcp.list_mut(cold);
            let count = list.count();
            drained += self.pcp_drain_list(map, list, count);
        }
        if drained > 0 {
            trace!("{}: drained {drained} per-CPU pages of cpu {cpu}", self.id());
        }
        drained
    }

    /// Re-sizes `cpu`'s lists for `batch`; the lists keep their pages.
    pub(crate) fn pcp_set_batch(&self, cpu: usize, batch: u32) {
        let mut pcp = self.pcp.pin(cpu);
        let fresh = PerCpuPages::new(batch);
        for cold in [false, true] {
            let list = pcp.list_mut(cold);
            let limits = fresh.list(cold);
            list.low = limits.low;
            list.high = limits.high;
            list.batch = limits.batch;
        }
    }

    /// Pages currently cached for `cpu`.
    pub fn pcp_count(&self, cpu: usize) -> usize {
        self.pcp.pin(cpu).count()
    }
}
