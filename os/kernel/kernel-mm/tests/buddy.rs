mod common;

use common::{MIB, PHYS_BASE, TestPhys, boot, drain, no_reserve};
use kernel_mm::{
    CacheHandle, Collaborators, MemConfig, PafFlags, PageCacheHook, PhysAddr, Pfn, ReclaimContext,
    Reclaimer, ShrinkRequest, ZoneId, ZoneType,
};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const NORMAL: ZoneId = ZoneId {
    node: 0,
    zone: ZoneType::Normal,
};

#[test]
fn boot_hands_all_but_the_tables_to_the_buddy_lists() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());

    let (lo, hi) = mm.boot_reserved();
    assert_eq!(lo, PhysAddr::new(PHYS_BASE));
    let reserved = (hi.as_u64() - lo.as_u64()).div_ceil(4096);
    assert_eq!(mm.nr_managed_pages(), 2048);
    assert_eq!(mm.nr_free_pages(), 2048 - reserved);

    let reports: Vec<_> = mm.check_free_lists().collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].zone, NORMAL);
    assert_eq!(reports[0].free_pages, mm.nr_free_pages());
    // 20..24 MiB is one aligned 4 MiB block
    assert!(reports[0].blocks[10] >= 1);
}

#[test]
fn split_leaves_one_buddy_per_order() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());

    let held = drain(&mm, 3);
    assert_eq!(mm.nr_free_pages(), 0);
    let (block, _) = held.iter().copied().find(|&(_, o)| o == 3).unwrap();
    mm.free_page_frames(block, 3);

    let area = mm.area(NORMAL);
    assert_eq!(area.free_blocks(3), 1);
    for _ in 0..4 {
        mm.alloc_page_frames(None, PafFlags::NOWARN, 0).unwrap();
    }
    assert_eq!(area.free_blocks(3), 0);
    assert_eq!(area.free_blocks(2), 1);
    assert_eq!(area.free_blocks(1), 0);
    assert_eq!(area.free_blocks(0), 0);
    assert_eq!(mm.nr_free_pages(), 4);
}

#[test]
fn freeing_everything_restores_the_free_lists() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let before = mm.zone_report(NORMAL);

    let mut held = Vec::new();
    for i in 0..200u32 {
        let order = u8::try_from(i % 5).unwrap();
        let pfn = mm.alloc_page_frames(None, PafFlags::KERNEL, order).unwrap();
        assert!(pfn.is_aligned(order));
        held.push((pfn, order));
    }
    // free in an interleaved order so merges happen in both directions
    let (even, odd): (Vec<_>, Vec<_>) = held.into_iter().enumerate().partition(|(i, _)| i % 2 == 0);
    for (_, (pfn, order)) in odd.into_iter().rev().chain(even) {
        mm.free_page_frames(pfn, order);
    }

    let after = mm.zone_report(NORMAL);
    assert_eq!(after, before);
}

#[test]
fn orders_at_or_above_max_order_are_refused() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());

    assert!(mm.alloc_page_frames(None, PafFlags::NOWARN, 11).is_none());
    let big = mm.alloc_page_frames(None, PafFlags::KERNEL, 10).unwrap();
    assert!(big.is_aligned(10));
    mm.free_page_frames(big, 10);
}

#[test]
fn zeroed_pages_are_cleared() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());

    let dirty = mm.alloc_page(PafFlags::KERNEL).unwrap();
    unsafe { mm.page_address(dirty).as_ptr().write_bytes(0x5a, 4096) };
    mm.free_page(dirty);

    // take pages until the dirtied one comes back
    let mut held = Vec::new();
    let page = loop {
        let page = mm.get_zeroed_page(PafFlags::NOWARN).unwrap();
        let pfn = mm.virt_to_pfn(page).unwrap();
        assert_eq!(mm.page_address(pfn), page);
        held.push(pfn);
        if pfn == dirty {
            break page;
        }
    };
    let bytes = unsafe { std::slice::from_raw_parts(page.as_ptr(), 4096) };
    assert!(bytes.iter().all(|&b| b == 0));
    for pfn in held {
        mm.free_page(pfn);
    }
}

#[test]
fn reserve_is_only_for_emergencies() {
    let phys = TestPhys::new(8 * MIB);
    let config = MemConfig {
        min_free_pages: Some(64),
        ..MemConfig::default()
    };
    let mm = boot(&phys, config, Collaborators::default());
    assert_eq!(mm.area(NORMAL).watermarks().min, 64);

    drain(&mm, 10);
    assert_eq!(mm.nr_free_pages(), 64);
    assert!(mm.alloc_page(PafFlags::NOWARN).is_none());
    assert!(mm.area(NORMAL).stats().failures >= 1);

    assert!(mm.alloc_page(PafFlags::EMERG | PafFlags::NOWARN).is_some());
    assert_eq!(mm.nr_free_pages(), 63);
}

#[test]
fn normal_requests_fall_back_to_dma() {
    let phys = TestPhys::new(8 * MIB);
    let config = MemConfig {
        dma_limit: PhysAddr::new(PHYS_BASE + 4 * MIB),
        ..no_reserve()
    };
    let mm = boot(&phys, config, Collaborators::default());
    let dma = ZoneId {
        node: 0,
        zone: ZoneType::Dma,
    };
    assert_eq!(mm.area(dma).present_pages(), 1024);
    assert_eq!(mm.area(NORMAL).present_pages(), 1024);

    let from_dma = mm.alloc_page(PafFlags::DMA).unwrap();
    assert_eq!(mm.zone_type_of(from_dma.addr()), ZoneType::Dma);

    let pfn = loop {
        let pfn = mm.alloc_page(PafFlags::NOWARN).unwrap();
        if mm.zone_type_of(pfn.addr()) == ZoneType::Dma {
            break pfn;
        }
    };
    assert_eq!(mm.area(NORMAL).free_pages(), 0);
    assert_eq!(mm.area(dma).stats().fallback_hits, 1);
    mm.free_page(pfn);
}

#[test]
fn per_cpu_pages_are_cached_until_drained() {
    let phys = TestPhys::new(8 * MIB);
    let config = MemConfig {
        pcp_batch: Some(4),
        ..no_reserve()
    };
    let mm = boot(&phys, config, Collaborators::default());
    let area = mm.area(NORMAL);
    let free = mm.nr_free_pages();

    let hot = mm.alloc_page(PafFlags::KERNEL | PafFlags::HOT).unwrap();
    assert_eq!(area.pcp_count(0), 3);
    assert_eq!(mm.nr_free_pages(), free - 4);

    mm.free_hot_page(hot);
    assert_eq!(area.pcp_count(0), 4);
    assert_eq!(mm.page_ref_count(hot), 0);

    // at the refill mark: another batch comes in before the pop
    let again = mm.alloc_page(PafFlags::KERNEL | PafFlags::HOT).unwrap();
    assert_eq!(again, hot, "hot list is LIFO");
    assert_eq!(area.pcp_count(0), 7);
    mm.free_cold_page(again);
    assert_eq!(area.pcp_count(0), 8);

    assert_eq!(mm.drain_local_pages(), 8);
    assert_eq!(area.pcp_count(0), 0);
    assert_eq!(mm.nr_free_pages(), free);
    mm.check_free_lists().for_each(drop);
}

#[test]
fn references_keep_a_page_alive() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let free = mm.nr_free_pages();

    let pfn = mm.alloc_page(PafFlags::KERNEL).unwrap();
    assert_eq!(mm.page_ref_count(pfn), 1);
    mm.hold(pfn);
    assert!(mm.try_hold(pfn));
    assert_eq!(mm.page_ref_count(pfn), 3);

    mm.release(pfn);
    mm.free_page(pfn);
    assert_eq!(mm.page_ref_count(pfn), 1);
    assert_eq!(mm.nr_free_pages(), free - 1);

    mm.release(pfn);
    assert_eq!(mm.page_ref_count(pfn), 0);
    assert!(!mm.try_hold(pfn));
    assert_eq!(mm.nr_free_pages(), free);
}

#[test]
#[should_panic(expected = "freeing free page")]
fn double_free_is_fatal() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let pfn = mm.alloc_page(PafFlags::KERNEL).unwrap();
    mm.free_page(pfn);
    mm.free_page(pfn);
}

#[test]
#[should_panic(expected = "allocated as order 2")]
fn freeing_with_the_wrong_order_is_fatal() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let pfn = mm.alloc_page_frames(None, PafFlags::KERNEL, 2).unwrap();
    mm.free_page_frames(pfn, 1);
}

#[test]
fn mappings_are_counted_separately() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let pfn = mm.alloc_page(PafFlags::USER_PAGE).unwrap();
    mm.set_page_anonymous(pfn);

    assert_eq!(mm.page_mapcount(pfn), 0);
    assert!(mm.page_add_mapping(pfn));
    assert!(!mm.page_add_mapping(pfn));
    assert_eq!(mm.page_mapcount(pfn), 2);
    assert!(!mm.page_remove_mapping(pfn));
    assert!(mm.page_remove_mapping(pfn));

    assert!(mm.try_lock_page(pfn));
    assert!(!mm.try_lock_page(pfn));
    mm.unlock_page(pfn);
    assert!(mm.set_page_dirty(pfn));
    assert!(mm.clear_page_dirty(pfn));
    mm.release(pfn);
    assert_eq!(mm.page_ref_count(pfn), 0);
}

#[test]
#[should_panic(expected = "still mapped or locked")]
fn freeing_a_mapped_page_is_fatal() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let pfn = mm.alloc_page(PafFlags::KERNEL).unwrap();
    mm.page_add_mapping(pfn);
    mm.free_page(pfn);
}

#[derive(Default)]
struct CountingCache {
    evicted: Mutex<Vec<(Pfn, CacheHandle, u64)>>,
}

impl PageCacheHook for CountingCache {
    fn evict(&self, pfn: Pfn, cache: CacheHandle, index: u64) {
        self.evicted.lock().unwrap().push((pfn, cache, index));
    }
}

#[test]
fn last_reference_evicts_file_pages() {
    let phys = TestPhys::new(8 * MIB);
    let cache = CountingCache::default();
    let collab = Collaborators {
        page_cache: &cache,
        ..Collaborators::default()
    };
    let mm = boot(&phys, no_reserve(), collab);

    let pfn = mm.alloc_page(PafFlags::KERNEL).unwrap();
    mm.set_page_file_backed(pfn, CacheHandle::new(7), 3);
    mm.hold(pfn);
    mm.release(pfn);
    assert!(cache.evicted.lock().unwrap().is_empty());

    mm.release(pfn);
    assert_eq!(
        cache.evicted.lock().unwrap().as_slice(),
        &[(pfn, CacheHandle::new(7), 3)]
    );
    assert_eq!(mm.page_ref_count(pfn), 0);
}

/// Frees pages it was handed earlier when asked to shrink.
#[derive(Default)]
struct StashReclaimer {
    stash: Mutex<Vec<(Pfn, u8)>>,
    shrinks: AtomicUsize,
    wakeups: AtomicUsize,
}

impl Reclaimer for StashReclaimer {
    fn wakeup(&self, _zone: ZoneId) {
        self.wakeups.fetch_add(1, Ordering::SeqCst);
    }

    fn shrink(&self, ctx: &dyn ReclaimContext, request: &ShrinkRequest) -> u64 {
        self.shrinks.fetch_add(1, Ordering::SeqCst);
        assert!(request.nr_to_reclaim >= 1);
        assert!(ctx.zone_free_pages(request.zone) <= ctx.zone_watermarks(request.zone).low);
        let mut stash = self.stash.lock().unwrap();
        let mut freed = 0;
        while let Some((pfn, order)) = stash.pop() {
            ctx.free_page_frames(pfn, order);
            freed += 1 << order;
        }
        freed
    }
}

#[test]
fn exhausted_zone_asks_the_reclaimer() {
    let phys = TestPhys::new(8 * MIB);
    let reclaimer = StashReclaimer::default();
    let collab = Collaborators {
        reclaimer: &reclaimer,
        ..Collaborators::default()
    };
    let mm = boot(&phys, no_reserve(), collab);

    let mut held = drain(&mm, 10);
    assert_eq!(mm.nr_free_pages(), 0);
    let before = reclaimer.shrinks.load(Ordering::SeqCst);
    let (victim, order) = held.pop().unwrap();
    reclaimer.stash.lock().unwrap().push((victim, order));

    let pfn = mm.alloc_page(PafFlags::KERNEL).unwrap();
    assert!(reclaimer.shrinks.load(Ordering::SeqCst) > before);
    assert!(reclaimer.wakeups.load(Ordering::SeqCst) > 0);
    assert!(reclaimer.stash.lock().unwrap().is_empty());
    assert_eq!(mm.nr_free_pages(), (1 << order) - 1);
    assert!(mm.area(NORMAL).stats().reclaim_calls > 0);

    mm.free_page(pfn);
    for (pfn, order) in held {
        mm.free_page_frames(pfn, order);
    }
    mm.check_free_lists().for_each(drop);
}

/// Boots with `min = 64` (`low = 80`) and leaves exactly `free` pages on the
/// buddy lists.
fn boot_at<'m>(
    phys: &'m TestPhys,
    reclaimer: &'m StashReclaimer,
    pcp_batch: Option<u32>,
    free: u64,
) -> kernel_mm::MemorySubsystem<'m, TestPhys> {
    let config = MemConfig {
        min_free_pages: Some(64),
        pcp_batch,
        ..MemConfig::default()
    };
    let collab = Collaborators {
        reclaimer,
        ..Collaborators::default()
    };
    let mm = boot(phys, config, collab);
    let spare: Vec<_> = (64..free)
        .map(|_| mm.alloc_page(PafFlags::KERNEL).unwrap())
        .collect();
    let _held = drain(&mm, 10);
    assert_eq!(mm.nr_free_pages(), 64);
    for pfn in spare {
        mm.free_page(pfn);
    }
    assert_eq!(mm.nr_free_pages(), free);
    mm
}

#[test]
fn zone_below_low_is_reclaimed_before_serving() {
    let phys = TestPhys::new(8 * MIB);
    let reclaimer = StashReclaimer::default();
    let mm = boot_at(&phys, &reclaimer, None, 74);
    let marks = mm.area(NORMAL).watermarks();
    assert_eq!((marks.min, marks.low), (64, 80));
    let shrinks = reclaimer.shrinks.load(Ordering::SeqCst);
    let wakeups = reclaimer.wakeups.load(Ordering::SeqCst);

    assert!(mm.alloc_page(PafFlags::ATOMIC | PafFlags::NOWARN).is_some());
    assert_eq!(reclaimer.shrinks.load(Ordering::SeqCst), shrinks + 1);
    assert_eq!(reclaimer.wakeups.load(Ordering::SeqCst), wakeups + 1);
    assert_eq!(mm.nr_free_pages(), 73);
}

#[test]
fn hot_refill_stops_at_the_watermark() {
    let phys = TestPhys::new(8 * MIB);
    let reclaimer = StashReclaimer::default();
    let mm = boot_at(&phys, &reclaimer, Some(31), 81);
    let area = mm.area(NORMAL);
    let shrinks = reclaimer.shrinks.load(Ordering::SeqCst);

    // one page above low: the refill may only take that one
    assert!(mm.alloc_page(PafFlags::HOT | PafFlags::NOWARN).is_some());
    assert_eq!(mm.nr_free_pages(), 80);
    assert_eq!(area.pcp_count(0), 0);
    assert_eq!(reclaimer.shrinks.load(Ordering::SeqCst), shrinks);

    // at low: reclaim first, then refill down to min and no further
    assert!(mm.alloc_page(PafFlags::HOT | PafFlags::NOWARN).is_some());
    assert_eq!(reclaimer.shrinks.load(Ordering::SeqCst), shrinks + 1);
    assert_eq!(mm.nr_free_pages(), 64);
    assert_eq!(area.pcp_count(0), 15);

    // the zone refuses, the cached pages still serve
    assert!(mm.alloc_page(PafFlags::ATOMIC | PafFlags::HOT).is_some());
    assert_eq!(area.pcp_count(0), 14);
    assert_eq!(mm.nr_free_pages(), 64);
    assert_eq!(reclaimer.shrinks.load(Ordering::SeqCst), shrinks + 1);
}

#[test]
fn atomic_allocations_fail_fast_without_reclaimable_memory() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let _held = drain(&mm, 10);
    assert!(mm.alloc_page(PafFlags::ATOMIC | PafFlags::NOWARN).is_none());
    // WAIT gives up after its retry budget when reclaim frees nothing
    assert!(mm.alloc_page(PafFlags::KERNEL | PafFlags::NOWARN).is_none());
}
