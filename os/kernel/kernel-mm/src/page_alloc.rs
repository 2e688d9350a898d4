//! # Page frame allocation
//!
//! The allocator walks the zone fallback list of the preferred node up to
//! three times, each time with a lower bar:
//!
//! 1. above the `low` watermark, no side effects;
//! 2. after waking and running the reclaimer for zones at or below `low`,
//!    above `min` (or anything left for `EMERG` and reclaim itself);
//! 3. for `WAIT` / `NOFAIL` callers: drain the local per-CPU caches, reclaim
//!    again, retry, and wait for frees when reclaim made no progress.
//!
//! Freeing drops a reference; the last one returns the block to its zone,
//! merging it with free buddies.

use crate::addr::{PhysAddr, Pfn};
use crate::flags::PafFlags;
use crate::node::MAX_ZONELIST;
use crate::page::{MAP_NONE, PageDescriptor, PageRole, PageState, REF_FREE};
use crate::phys_mapper::PhysMapper;
use crate::reclaim::ShrinkRequest;
use crate::subsystem::MemorySubsystem;
use crate::zone::{Mark, PageArea, ZoneId};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::{MAX_CPUS, MAX_ORDER, PAGE_SIZE};
use kernel_sync::WaitTicket;
use log::{debug, error, trace, warn};

/// Marks the current CPU as running reclaim until dropped.
struct ReclaimScope<'a>(&'a AtomicBool);

impl<'a> ReclaimScope<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Relaxed);
        Self(flag)
    }
}

impl Drop for ReclaimScope<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

impl<M: PhysMapper> MemorySubsystem<'_, M> {
    /// Allocates `2^order` contiguous frames.
    ///
    /// `node` is a preference; `None` means the calling CPU's node. Returns
    /// `None` when memory is exhausted and the flags do not allow waiting.
    ///
    /// # Panics
    /// Panics when a `NOFAIL` allocation exceeds its retry budget, or on free
    /// list corruption.
    pub fn alloc_page_frames(&self, node: Option<usize>, flags: PafFlags, order: u8) -> Option<Pfn> {
        if usize::from(order) >= MAX_ORDER {
            if !flags.contains(PafFlags::NOWARN) {
                warn!("page allocation of order {order} refused: MAX_ORDER is {MAX_ORDER}");
            }
            return None;
        }

        let cpu = self.current_cpu();
        let nid = self.resolve_node(node, cpu);
        let zonelist = self.nodes[nid].zonelist(flags.zone_type());
        let zones = zonelist.as_slice();
        let in_reclaim = self.in_reclaim[cpu].load(Ordering::Relaxed);

        if let Some(pfn) = self.get_page_from_zonelist(cpu, zones, flags, order, Mark::Low) {
            return Some(self.prep_new_page(pfn, order, flags));
        }

        if !in_reclaim {
            self.reclaim_round(cpu, zones, flags, order, flags.contains(PafFlags::WAIT));
        }

        let mark = if in_reclaim || flags.contains(PafFlags::EMERG) {
            Mark::Ignore
        } else {
            Mark::Min
        };
        if let Some(pfn) = self.get_page_from_zonelist(cpu, zones, flags, order, mark) {
            return Some(self.prep_new_page(pfn, order, flags));
        }

        if !in_reclaim && flags.intersects(PafFlags::WAIT | PafFlags::NOFAIL) {
            if let Some(pfn) = self.alloc_slowpath(cpu, zones, flags, order, mark) {
                return Some(self.prep_new_page(pfn, order, flags));
            }
        }

        if let Some(&first) = zones.first() {
            self.area(first).stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        if !flags.contains(PafFlags::NOWARN) {
            warn!(
                "page allocation failure: order {order}, flags {flags:?}, node {nid}, {} pages free",
                self.nr_free_pages()
            );
        }
        None
    }

    fn alloc_slowpath(
        &self,
        cpu: usize,
        zones: &[ZoneId],
        flags: PafFlags,
        order: u8,
        mark: Mark,
    ) -> Option<Pfn> {
        let nofail = flags.contains(PafFlags::NOFAIL);
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            self.drain_local_pages();

            let tickets: [Option<WaitTicket>; MAX_ZONELIST] =
                core::array::from_fn(|i| zones.get(i).map(|&z| self.area(z).wait.prepare()));

            let progress = self.reclaim_round(cpu, zones, flags, order, true);
            if let Some(pfn) = self.get_page_from_zonelist(cpu, zones, flags, order, mark) {
                self.cancel_tickets(zones, tickets);
                return Some(pfn);
            }

            if nofail {
                if rounds >= self.config.nofail_retry_budget {
                    self.cancel_tickets(zones, tickets);
                    error!("NOFAIL allocation of order {order} stuck after {rounds} rounds");
                    self.show_free_areas();
                    panic!("out of memory: NOFAIL allocation of order {order} cannot be satisfied");
                }
            } else if rounds >= self.config.reclaim_retries {
                self.cancel_tickets(zones, tickets);
                return None;
            }

            if progress == 0 && flags.contains(PafFlags::WAIT) {
                self.wait_for_frees(zones, tickets);
            } else {
                self.cancel_tickets(zones, tickets);
            }
        }
    }

    /// Spins until any zone of the list saw a free, or the spin budget ran
    /// out.
    fn wait_for_frees(&self, zones: &[ZoneId], tickets: [Option<WaitTicket>; MAX_ZONELIST]) {
        let woken = |tickets: &[Option<WaitTicket>]| {
            zones
                .iter()
                .zip(tickets)
                .any(|(&z, t)| t.as_ref().is_some_and(|t| self.area(z).wait.is_woken(t)))
        };
        let mut spins = 0;
        while spins < self.config.wait_spins && !woken(&tickets) {
            core::hint::spin_loop();
            spins += 1;
        }
        self.cancel_tickets(zones, tickets);
    }

    fn cancel_tickets(&self, zones: &[ZoneId], tickets: [Option<WaitTicket>; MAX_ZONELIST]) {
        for (&z, ticket) in zones.iter().zip(tickets) {
            if let Some(ticket) = ticket {
                self.area(z).wait.cancel(ticket);
            }
        }
    }

    /// Asks the reclaimer to refill every zone of the list sitting at or
    /// below `low`. No allocator lock is held across the calls.
    fn reclaim_round(&self, cpu: usize, zones: &[ZoneId], flags: PafFlags, order: u8, may_wait: bool) -> u64 {
        let _scope = ReclaimScope::enter(&self.in_reclaim[cpu]);
        let mut reclaimed = 0;
        for &zone in zones {
            let area = self.area(zone);
            if !area.below_low() {
                continue;
            }
            self.collab.reclaimer.wakeup(zone);
            let request = ShrinkRequest {
                zone,
                nr_to_reclaim: area.watermarks().high.saturating_sub(area.free_pages()).max(1 << order),
                order,
                flags,
                may_wait,
            };
            area.stats.reclaim_calls.fetch_add(1, Ordering::Relaxed);
            let got = self.collab.reclaimer.shrink(self, &request);
            debug!("{zone}: reclaim asked for {} pages, got {got}", request.nr_to_reclaim);
            reclaimed += got;
        }
        reclaimed
    }

    fn get_page_from_zonelist(
        &self,
        cpu: usize,
        zones: &[ZoneId],
        flags: PafFlags,
        order: u8,
        mark: Mark,
    ) -> Option<Pfn> {
        let cached = (order == 0 && flags.intersects(PafFlags::HOT | PafFlags::COLD))
            .then_some(flags.contains(PafFlags::COLD));
        for (i, &zone) in zones.iter().enumerate() {
            let area = self.area(zone);
            let pfn = if area.watermark_ok(order, mark) {
                self.buffered_rmqueue(area, cpu, cached, order, mark)
            } else {
                // cached pages already left the buddy lists
                cached.and_then(|cold| area.pcp_take(&self.map, cpu, cold))
            };
            if let Some(pfn) = pfn {
                if i > 0 {
                    area.stats.fallback_hits.fetch_add(1, Ordering::Relaxed);
                }
                return Some(pfn);
            }
        }
        None
    }

    fn buffered_rmqueue(
        &self,
        area: &PageArea,
        cpu: usize,
        cached: Option<bool>,
        order: u8,
        mark: Mark,
    ) -> Option<Pfn> {
        if let Some(cold) = cached {
            return area.pcp_alloc(&self.map, cpu, cold, mark);
        }
        let mut fa = area.lock();
        area.rmqueue(&self.map, &mut fa, order)
    }

    /// Turns a block fresh off the free lists into an allocated one with a
    /// single holder.
    fn prep_new_page(&self, pfn: Pfn, order: u8, flags: PafFlags) -> Pfn {
        let pages = 1u64 << order;
        for i in 0..pages {
            let desc = self.map.page(pfn.add(i));
            self.check_new_page(pfn.add(i), desc);
            desc.set_role(PageRole::Tail);
        }
        let head = self.map.page(pfn);
        head.ref_count().store(0, Ordering::Release);
        head.set_index(0);
        head.set_private(0);
        head.set_role(PageRole::Allocated { order });

        if flags.contains(PafFlags::ZERO) {
            let len = usize::try_from(pages * PAGE_SIZE).unwrap_or(usize::MAX);
            // SAFETY: the block was just taken off the free lists; nobody
            // else can reach it.
            unsafe { self.mapper.fill(pfn.addr(), 0, len) };
        }
        self.area_of(pfn).stats.allocs.fetch_add(1, Ordering::Relaxed);
        trace!("alloc order {order} at {pfn} ({flags:?})");
        pfn
    }

    fn check_new_page(&self, pfn: Pfn, desc: &PageDescriptor) {
        let refs = desc.ref_count_raw();
        let maps = desc.map_count().load(Ordering::Relaxed);
        let state = desc.state();
        if refs != REF_FREE || maps != MAP_NONE || state.intersects(PageState::CHECK_AT_FREE) {
            error!("bad page state on allocation: {pfn} {desc:?}");
            panic!("BUG: bad page state on allocation of {pfn}");
        }
        desc.clear_state(PageState::all());
    }

    /// Drops the caller's reference to a block of `order`. When it was the
    /// last one the block goes back to its zone.
    ///
    /// # Panics
    /// Panics on double free, on an order that does not match the
    /// allocation, and on pages still locked, mapped or owned by a hive.
    pub fn free_page_frames(&self, pfn: Pfn, order: u8) {
        if self.put_page_testzero(pfn) {
            let recorded = self.final_put(pfn);
            assert!(
                recorded == order,
                "BUG: page {pfn} freed as order {order} but allocated as order {recorded}"
            );
            self.free_pages_ok(pfn, order);
        }
    }

    /// Drops one reference; `true` when the page just lost its last holder.
    pub(crate) fn put_page_testzero(&self, pfn: Pfn) -> bool {
        let desc = self.map.page(pfn);
        let prev = desc.ref_count().fetch_sub(1, Ordering::AcqRel);
        if prev <= REF_FREE {
            desc.ref_count().fetch_add(1, Ordering::Relaxed);
            error!("double free of {pfn}: {desc:?}");
            panic!("BUG: freeing free page {pfn}");
        }
        prev == 0
    }

    /// Resolves the role of a page that just lost its last holder and
    /// returns the order it was allocated with.
    pub(crate) fn final_put(&self, pfn: Pfn) -> u8 {
        let desc = self.map.page(pfn);
        match desc.role() {
            PageRole::Allocated { order } => order,
            PageRole::Anonymous => 0,
            PageRole::FileBacked(cache) => {
                self.collab.page_cache.evict(pfn, cache, desc.index());
                0
            }
            role @ (PageRole::SlabHead { .. } | PageRole::SlabTail { .. }) => {
                error!("last reference to slab page {pfn} dropped: {desc:?}");
                panic!("BUG: slab page {pfn} ({role:?}) freed outside its hive");
            }
            role => {
                error!("bad page state on free: {pfn} {desc:?}");
                panic!("BUG: freeing page {pfn} in role {role:?}");
            }
        }
    }

    fn check_free_block(&self, pfn: Pfn, order: u8) {
        let head = self.map.page(pfn);
        let maps = head.map_count().load(Ordering::Acquire);
        let state = head.state();
        if maps != MAP_NONE || state.intersects(PageState::CHECK_AT_FREE) {
            error!("bad page state on free: {pfn} {head:?}");
            panic!("BUG: freeing page {pfn} that is still mapped or locked");
        }
        for i in 1..1u64 << order {
            let tail = self.map.page(pfn.add(i));
            if tail.role() != PageRole::Tail || tail.ref_count_raw() != REF_FREE {
                error!("bad tail page on free: {} {tail:?}", pfn.add(i));
                panic!("BUG: tail page {} of order-{order} block {pfn} corrupted", pfn.add(i));
            }
        }
    }

    /// Resets the head of an unreferenced block to its free shape.
    fn reset_head(&self, pfn: Pfn) {
        let head = self.map.page(pfn);
        head.clear_state(PageState::all());
        head.set_index(0);
        head.set_private(0);
        head.set_role(PageRole::Tail);
    }

    /// Returns an unreferenced block to the buddy lists and wakes waiters.
    pub(crate) fn free_pages_ok(&self, pfn: Pfn, order: u8) {
        self.check_free_block(pfn, order);
        self.reset_head(pfn);
        let area = self.area_of(pfn);
        {
            let mut fa = area.lock();
            area.free_one(&self.map, &mut fa, pfn, order);
        }
        area.stats.frees.fetch_add(1, Ordering::Relaxed);
        area.wait.wake_all();
        trace!("free order {order} at {pfn}");
    }

    /// Frees a single page into this CPU's hot cache.
    pub fn free_hot_page(&self, pfn: Pfn) {
        self.free_hot_cold_page(pfn, false);
    }

    /// Frees a single page to the tail of this CPU's cold cache.
    pub fn free_cold_page(&self, pfn: Pfn) {
        self.free_hot_cold_page(pfn, true);
    }

    fn free_hot_cold_page(&self, pfn: Pfn, cold: bool) {
        if !self.put_page_testzero(pfn) {
            return;
        }
        let order = self.final_put(pfn);
        assert!(order == 0, "BUG: order-{order} block {pfn} freed as a single page");
        self.check_free_block(pfn, 0);
        self.reset_head(pfn);
        let area = self.area_of(pfn);
        area.pcp_free(&self.map, self.current_cpu(), pfn, cold);
        area.stats.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns this CPU's cached pages to the buddy lists.
    pub fn drain_local_pages(&self) -> usize {
        let cpu = self.current_cpu();
        self.areas().map(|a| a.pcp_drain(&self.map, cpu)).sum()
    }

    /// Returns every CPU's cached pages to the buddy lists.
    ///
    /// Each CPU's cache is pinned while it is drained, so this may run
    /// concurrently with allocations on the other CPUs.
    pub fn drain_all_pages(&self) -> usize {
        (0..MAX_CPUS)
            .map(|cpu| self.areas().map(|a| a.pcp_drain(&self.map, cpu)).sum::<usize>())
            .sum()
    }

    /// One page, `None` on exhaustion.
    pub fn alloc_page(&self, flags: PafFlags) -> Option<Pfn> {
        self.alloc_page_frames(None, flags, 0)
    }

    /// One zero-filled page, returned by its kernel address.
    pub fn get_zeroed_page(&self, flags: PafFlags) -> Option<NonNull<u8>> {
        self.alloc_page(flags | PafFlags::ZERO)
            .map(|pfn| self.page_address(pfn))
    }

    pub fn free_page(&self, pfn: Pfn) {
        self.free_page_frames(pfn, 0);
    }

    /// Kernel address of a frame.
    #[must_use]
    pub fn page_address(&self, pfn: Pfn) -> NonNull<u8> {
        self.mapper.phys_to_virt(pfn.addr())
    }

    /// Frame behind a kernel address, if it has a descriptor.
    pub fn virt_to_pfn(&self, va: NonNull<u8>) -> Option<Pfn> {
        self.mapper
            .virt_to_phys(va)
            .map(PhysAddr::pfn)
            .filter(|&pfn| self.map.pfn_valid(pfn))
    }
}
