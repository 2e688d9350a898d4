//! # Page references and mappings
//!
//! The stored reference count is the number of holders minus one, so a free
//! page reads −1 and a page with one holder reads 0. The same convention
//! holds for the map count. References are counted on the head page of a
//! block; tail pages stay at −1.

use crate::addr::Pfn;
use crate::page::{CacheHandle, MAP_NONE, PageRole, PageState, REF_FREE};
use crate::phys_mapper::PhysMapper;
use crate::subsystem::MemorySubsystem;
use core::sync::atomic::Ordering;
use log::error;

impl<M: PhysMapper> MemorySubsystem<'_, M> {
    /// Takes an extra reference.
    ///
    /// # Panics
    /// Panics if the page is free.
    pub fn hold(&self, pfn: Pfn) {
        let desc = self.map.page(pfn);
        let prev = desc.ref_count().fetch_add(1, Ordering::Relaxed);
        if prev <= REF_FREE {
            desc.ref_count().fetch_sub(1, Ordering::Relaxed);
            error!("hold on free page {pfn}: {desc:?}");
            panic!("BUG: taking a reference to free page {pfn}");
        }
    }

    /// Takes an extra reference unless the page is free.
    pub fn try_hold(&self, pfn: Pfn) -> bool {
        let refs = self.map.page(pfn).ref_count();
        let mut cur = refs.load(Ordering::Relaxed);
        while cur > REF_FREE {
            match refs.compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
        false
    }

    /// Drops a reference; the last one frees the page (evicting it from the
    /// page cache first if it is file backed).
    ///
    /// # Panics
    /// Panics on a free page and on the invariants [`free_page_frames`]
    /// checks.
    ///
    /// [`free_page_frames`]: Self::free_page_frames
    pub fn release(&self, pfn: Pfn) {
        if self.put_page_testzero(pfn) {
            let order = self.final_put(pfn);
            self.free_pages_ok(pfn, order);
        }
    }

    /// Number of holders; 0 for a free page.
    #[must_use]
    pub fn page_ref_count(&self, pfn: Pfn) -> u32 {
        (self.map.page(pfn).ref_count_raw() + 1).cast_unsigned()
    }

    fn assert_mappable(&self, pfn: Pfn) {
        let role = self.map.page(pfn).role();
        assert!(
            matches!(
                role,
                PageRole::Allocated { order: 0 } | PageRole::Anonymous | PageRole::FileBacked(_)
            ),
            "BUG: page {pfn} in role {role:?} cannot be mapped"
        );
    }

    /// Records a user mapping; `true` for the first one.
    ///
    /// # Panics
    /// Panics on pages that are not single, allocated, non-slab pages.
    pub fn page_add_mapping(&self, pfn: Pfn) -> bool {
        self.assert_mappable(pfn);
        self.map.page(pfn).map_count().fetch_add(1, Ordering::AcqRel) == MAP_NONE
    }

    /// Drops a user mapping; `true` when it was the last one.
    ///
    /// # Panics
    /// Panics if the page has no mappings.
    pub fn page_remove_mapping(&self, pfn: Pfn) -> bool {
        self.assert_mappable(pfn);
        let maps = self.map.page(pfn).map_count();
        let prev = maps.fetch_sub(1, Ordering::AcqRel);
        if prev <= MAP_NONE {
            maps.fetch_add(1, Ordering::Relaxed);
            panic!("BUG: unmapping page {pfn} that has no mappings");
        }
        prev == 0
    }

    /// Number of user mappings.
    #[must_use]
    pub fn page_mapcount(&self, pfn: Pfn) -> u32 {
        let desc = self.map.page(pfn);
        if desc.role().is_slab() {
            return 0;
        }
        (desc.map_count().load(Ordering::Acquire) + 1).cast_unsigned()
    }

    /// Marks a single allocated page as anonymous memory.
    ///
    /// # Panics
    /// Panics unless the page is a plain order-0 allocation.
    pub fn set_page_anonymous(&self, pfn: Pfn) {
        let desc = self.map.page(pfn);
        let role = desc.role();
        assert!(
            role == PageRole::Allocated { order: 0 },
            "BUG: page {pfn} in role {role:?} cannot become anonymous"
        );
        desc.set_role(PageRole::Anonymous);
    }

    /// Indexes a single allocated page in the page cache.
    ///
    /// # Panics
    /// Panics unless the page is a plain or anonymous order-0 allocation.
    pub fn set_page_file_backed(&self, pfn: Pfn, cache: CacheHandle, index: u64) {
        let desc = self.map.page(pfn);
        let role = desc.role();
        assert!(
            matches!(role, PageRole::Allocated { order: 0 } | PageRole::Anonymous),
            "BUG: page {pfn} in role {role:?} cannot join the page cache"
        );
        desc.set_index(index);
        desc.set_role(PageRole::FileBacked(cache));
    }

    /// Drops the anonymous or page-cache identity of a page.
    pub fn clear_page_mapping(&self, pfn: Pfn) {
        let desc = self.map.page(pfn);
        if matches!(desc.role(), PageRole::Anonymous | PageRole::FileBacked(_)) {
            desc.set_index(0);
            desc.set_role(PageRole::Allocated { order: 0 });
        }
    }

    #[must_use]
    pub fn page_state(&self, pfn: Pfn) -> PageState {
        self.map.page(pfn).state()
    }

    /// Sets the lock bit; `true` if it was clear.
    pub fn try_lock_page(&self, pfn: Pfn) -> bool {
        !self
            .map
            .page(pfn)
            .set_state(PageState::LOCKED)
            .contains(PageState::LOCKED)
    }

    /// Spins until the page lock is taken.
    pub fn lock_page(&self, pfn: Pfn) {
        while !self.try_lock_page(pfn) {
            while self.page_state(pfn).contains(PageState::LOCKED) {
                core::hint::spin_loop();
            }
        }
    }

    /// # Panics
    /// Panics if the page was not locked.
    pub fn unlock_page(&self, pfn: Pfn) {
        let before = self.map.page(pfn).clear_state(PageState::LOCKED);
        assert!(
            before.contains(PageState::LOCKED),
            "BUG: unlocking page {pfn} that is not locked"
        );
    }

    /// Marks the page dirty; `true` if it was clean.
    pub fn set_page_dirty(&self, pfn: Pfn) -> bool {
        !self
            .map
            .page(pfn)
            .set_state(PageState::DIRTY)
            .contains(PageState::DIRTY)
    }

    /// Clears the dirty bit; `true` if it was set.
    pub fn clear_page_dirty(&self, pfn: Pfn) -> bool {
        self.map
            .page(pfn)
            .clear_state(PageState::DIRTY)
            .contains(PageState::DIRTY)
    }

    /// Sets the writeback bit; a page under writeback cannot be freed.
    pub fn set_page_writeback(&self, pfn: Pfn) -> bool {
        !self
            .map
            .page(pfn)
            .set_state(PageState::WRITEBACK)
            .contains(PageState::WRITEBACK)
    }

    /// Ends writeback and wakes allocators waiting on the page's zone.
    pub fn end_page_writeback(&self, pfn: Pfn) {
        self.map.page(pfn).clear_state(PageState::WRITEBACK);
        self.area_of(pfn).wait.wake_all();
    }

    /// Marks the page recently used; `true` if it was not.
    pub fn mark_page_referenced(&self, pfn: Pfn) -> bool {
        !self
            .map
            .page(pfn)
            .set_state(PageState::REFERENCED)
            .contains(PageState::REFERENCED)
    }
}
