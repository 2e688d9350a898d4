//! Slab state machine: object allocation and free, slab activation,
//! deactivation, creation and discard.

use super::debug::{self, RedZone, TrackKind};
use super::{ActiveSlab, Hive, HiveFlags};
use crate::addr::{PhysAddr, Pfn};
use crate::flags::PafFlags;
use crate::page::{MAP_NONE, NIL, PageRole, PageState};
use crate::phys_mapper::PhysMapper;
use crate::subsystem::MemorySubsystem;
use core::panic::Location;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use kernel_info::memory::MAX_NUMNODES;
use kernel_sync::PerCpuGuard;
use log::{error, trace};

/// An object just taken off a slab.
struct Taken {
    head: Pfn,
    index: u64,
    /// Never handed out before.
    fresh: bool,
}

impl<M: PhysMapper> MemorySubsystem<'_, M> {
    /// Allocates one object.
    ///
    /// Returns `None` when no slab has room and the page allocator cannot
    /// provide a new one under `flags`.
    ///
    /// # Panics
    /// Panics when a debug check finds a corrupted free object.
    #[track_caller]
    pub fn hive_alloc(&self, hive: &Hive, flags: PafFlags) -> Option<NonNull<u8>> {
        let caller = Location::caller();
        loop {
            let cpu = self.current_cpu();
            let mut slot = hive.cpu_slabs.pin(cpu);
            if let Some(taken) = self.slab_take_object(hive, &mut slot) {
                drop(slot);
                return Some(self.object_allocated(hive, &taken, flags, cpu, caller));
            }

            let retired = self.slab_deactivate(hive, &mut slot);
            let refilled = self.slab_take_partial(hive, &mut slot, cpu);
            drop(slot);
            if let Some(head) = retired {
                self.slab_discard(hive, head);
            }
            if refilled {
                continue;
            }

            // The page allocator may reclaim, and reclaim may free objects of
            // this hive, so no pin is held across it.
            let head = self.slab_new(hive, flags)?;
            let mut slot = hive.cpu_slabs.pin(self.current_cpu());
            if slot.page.is_none() {
                self.map.page(head).set_state(PageState::SLAB_FROZEN);
                slot.page = Some(head);
                slot.freelist = NIL;
            } else {
                let node = self.map.page(head).node();
                hive.partial[node].lock().push_front(&self.map, head);
            }
        }
    }

    /// Returns an object to its slab.
    ///
    /// # Panics
    /// Panics if `object` does not belong to `hive`, is not the start of a
    /// slot, or is freed twice.
    #[track_caller]
    pub fn hive_free(&self, hive: &Hive, object: NonNull<u8>) {
        let caller = Location::caller();
        let (head, index) = self.slab_locate(hive, object);
        let cpu = self.current_cpu();
        self.object_freed(hive, object, cpu, caller);
        hive.counters.objects_in_use.fetch_sub(1, Ordering::Relaxed);

        let mut slot = hive.cpu_slabs.pin(cpu);
        if slot.page == Some(head) {
            self.check_not_free(hive, head, slot.freelist, index, object);
            {
                let desc = self.map.page(head);
                let _list = hive.partial[desc.node()].lock();
                self.check_not_free(hive, head, desc.index(), index, object);
            }
            self.write_free_ptr(hive, head, index, slot.freelist);
            slot.freelist = index;
            if self.map.page(head).slab_inuse_dec() == 0 {
                let retired = self.slab_deactivate(hive, &mut slot);
                drop(slot);
                if let Some(head) = retired {
                    self.slab_discard(hive, head);
                }
            }
            return;
        }
        drop(slot);
        self.slab_free_remote(hive, head, index, object);
    }

    /// Finds the slab head and slot index of an object.
    pub(crate) fn slab_locate(&self, hive: &Hive, object: NonNull<u8>) -> (Pfn, u64) {
        let Some(pa) = self.mapper.virt_to_phys(object) else {
            panic!("BUG: hive {}: {object:p} is not a kernel address", hive.name);
        };
        let Some(desc) = self.map.try_page(pa.pfn()) else {
            panic!("BUG: hive {}: {object:p} has no page descriptor", hive.name);
        };
        let head = match desc.role() {
            PageRole::SlabHead { .. } => pa.pfn(),
            PageRole::SlabTail { head } => head,
            role => {
                error!("hive {}: free of {object:p} in a non-slab page: {desc:?}", hive.name);
                panic!("BUG: hive {}: {object:p} lives in a page with role {role:?}", hive.name);
            }
        };
        match self.map.page(head).role() {
            PageRole::SlabHead { hive: id } if id == hive.id => {}
            role => panic!(
                "BUG: object {object:p} freed to hive {} ({:?}) but its slab is {role:?}",
                hive.name, hive.id
            ),
        }
        let offset = pa.as_u64() - head.addr().as_u64();
        let slot_size = hive.layout.slot_size as u64;
        let index = offset / slot_size;
        assert!(
            offset % slot_size == 0 && index < u64::from(hive.layout.objects),
            "BUG: hive {}: {object:p} is not the start of a slot",
            hive.name
        );
        (head, index)
    }

    #[inline]
    fn slot_pa(&self, hive: &Hive, head: Pfn, index: u64) -> PhysAddr {
        head.addr().offset(hive.layout.slot_offset(index))
    }

    fn read_free_ptr(&self, hive: &Hive, head: Pfn, index: u64) -> u64 {
        let at = self.slot_pa(hive, head, index).offset(hive.layout.free_ptr as u64);
        // SAFETY: free slots belong to the allocator; the free pointer word
        // is 8-byte aligned inside the slot.
        let next = unsafe { self.mapper.read_u64(at) };
        if next != NIL && next >= u64::from(hive.layout.objects) {
            error!("hive {}: slab {head} slot {index} has free pointer {next:#x}", hive.name);
            panic!("BUG: hive {}: free list of slab {head} corrupted", hive.name);
        }
        next
    }

    /// Panics if slot `index` is already on the freelist starting at `first`.
    /// Release builds only compare against the list head.
    fn check_not_free(&self, hive: &Hive, head: Pfn, first: u64, index: u64, object: NonNull<u8>) {
        let mut cursor = first;
        let mut walked = 0;
        while cursor != NIL {
            if cursor == index {
                error!("hive {}: slab {head} slot {index} is already free", hive.name);
                panic!("BUG: hive {}: double free of {object:p}", hive.name);
            }
            if !cfg!(debug_assertions) {
                break;
            }
            walked += 1;
            assert!(
                walked <= hive.layout.objects,
                "BUG: hive {}: free list of slab {head} loops",
                hive.name
            );
            cursor = self.read_free_ptr(hive, head, cursor);
        }
    }

    fn write_free_ptr(&self, hive: &Hive, head: Pfn, index: u64, next: u64) {
        let at = self.slot_pa(hive, head, index).offset(hive.layout.free_ptr as u64);
        // SAFETY: as in `read_free_ptr`; the slot was just freed.
        unsafe { self.mapper.write_u64(at, next) };
    }

    /// Pops from the CPU freelist, carves a fresh slot, or picks up objects
    /// other CPUs freed to the active slab.
    fn slab_take_object(&self, hive: &Hive, slot: &mut PerCpuGuard<'_, ActiveSlab>) -> Option<Taken> {
        let head = slot.page?;
        let desc = self.map.page(head);
        if slot.freelist == NIL {
            let cursor = desc.private();
            if cursor < u64::from(hive.layout.objects) {
                desc.set_private(cursor + 1);
                desc.slab_inuse_inc();
                return Some(Taken {
                    head,
                    index: cursor,
                    fresh: true,
                });
            }
            let remote = {
                let _list = hive.partial[desc.node()].lock();
                let first = desc.index();
                desc.set_index(NIL);
                first
            };
            if remote == NIL {
                return None;
            }
            slot.freelist = remote;
        }
        let index = slot.freelist;
        slot.freelist = self.read_free_ptr(hive, head, index);
        desc.slab_inuse_inc();
        Some(Taken {
            head,
            index,
            fresh: false,
        })
    }

    fn object_allocated(
        &self,
        hive: &Hive,
        taken: &Taken,
        flags: PafFlags,
        cpu: usize,
        caller: &'static Location<'static>,
    ) -> NonNull<u8> {
        let pa = self.slot_pa(hive, taken.head, taken.index);
        let object = self.mapper.phys_to_virt(pa);
        let layout = &hive.layout;
        // SAFETY: the slot was just taken off a freelist or carved; nobody
        // else can reach it.
        unsafe {
            if taken.fresh {
                debug::clear_tracks(layout, object);
                if hive.flags.contains(HiveFlags::RED_ZONE) {
                    debug::set_red_zone(layout, object, debug::RED_ACTIVE);
                }
                if let Some(ctor) = hive.ctor {
                    ctor(object);
                }
            } else {
                if hive.flags.contains(HiveFlags::POISON)
                    && let Some(at) = debug::check_poison(layout, object)
                {
                    error!("hive {}: object {pa} modified after free at offset {at}", hive.name);
                    panic!("BUG: hive {}: use after free of {object:p}", hive.name);
                }
                if hive.flags.contains(HiveFlags::RED_ZONE) {
                    if debug::check_red_zone(layout, object) != RedZone::Inactive {
                        error!("hive {}: red zone of free object {pa} overwritten", hive.name);
                        panic!("BUG: hive {}: red zone of free object {object:p} corrupted", hive.name);
                    }
                    debug::set_red_zone(layout, object, debug::RED_ACTIVE);
                }
            }
            if flags.contains(PafFlags::ZERO) {
                object.as_ptr().write_bytes(0, layout.object_size);
            }
            debug::write_track(layout, object, TrackKind::Alloc, caller, cpu);
        }
        hive.counters.objects_in_use.fetch_add(1, Ordering::Relaxed);
        trace!("hive {}: alloc {object:p} from slab {}", hive.name, taken.head);
        object
    }

    fn object_freed(&self, hive: &Hive, object: NonNull<u8>, cpu: usize, caller: &'static Location<'static>) {
        let layout = &hive.layout;
        // SAFETY: `slab_locate` proved `object` is a slot of this hive; the
        // caller owns it until it is on a freelist.
        unsafe {
            if hive.flags.contains(HiveFlags::RED_ZONE) {
                match debug::check_red_zone(layout, object) {
                    RedZone::Active => debug::set_red_zone(layout, object, debug::RED_INACTIVE),
                    RedZone::Inactive => {
                        error!("hive {}: {object:p} freed twice", hive.name);
                        panic!("BUG: hive {}: double free of {object:p}", hive.name);
                    }
                    RedZone::Corrupt => {
                        error!("hive {}: write past the end of {object:p}", hive.name);
                        panic!("BUG: hive {}: red zone of {object:p} overwritten", hive.name);
                    }
                }
            }
            if hive.flags.contains(HiveFlags::POISON) {
                debug::poison(layout, object);
            }
            debug::write_track(layout, object, TrackKind::Free, caller, cpu);
        }
        trace!("hive {}: free {object:p}", hive.name);
    }

    /// Frees an object of a slab that is not this CPU's active slab.
    fn slab_free_remote(&self, hive: &Hive, head: Pfn, index: u64, object: NonNull<u8>) {
        let desc = self.map.page(head);
        let objects = hive.layout.objects;
        let discard = {
            let mut list = hive.partial[desc.node()].lock();
            let first = desc.index();
            self.check_not_free(hive, head, first, index, object);
            self.write_free_ptr(hive, head, index, first);
            desc.set_index(index);

            let was_full = desc.slab_inuse() == objects;
            let inuse = desc.slab_inuse_dec();
            if desc.state().contains(PageState::SLAB_FROZEN) {
                // the owning CPU picks the object up on its next refill
                false
            } else if inuse == 0 {
                let others = if was_full { list.len() } else { list.len() - 1 };
                if others >= hive.min_partial {
                    if !was_full {
                        list.remove(&self.map, head);
                    }
                    true
                } else {
                    if was_full {
                        list.push_back(&self.map, head);
                    }
                    false
                }
            } else {
                if was_full {
                    list.push_back(&self.map, head);
                }
                false
            }
        };
        if discard {
            self.slab_discard(hive, head);
        }
    }

    /// Hands the CPU's active slab back to its node. Returns the slab if it
    /// is empty and the node already keeps `min_partial` others.
    pub(crate) fn slab_deactivate(&self, hive: &Hive, slot: &mut PerCpuGuard<'_, ActiveSlab>) -> Option<Pfn> {
        let head = slot.page.take()?;
        let freelist = core::mem::replace(&mut slot.freelist, NIL);
        let desc = self.map.page(head);

        let mut tail = freelist;
        let mut walked = 0;
        while tail != NIL {
            let next = self.read_free_ptr(hive, head, tail);
            if next == NIL {
                break;
            }
            tail = next;
            walked += 1;
            assert!(
                walked < hive.layout.objects,
                "BUG: hive {}: cycle in the free list of slab {head}",
                hive.name
            );
        }

        let mut list = hive.partial[desc.node()].lock();
        if freelist != NIL {
            self.write_free_ptr(hive, head, tail, desc.index());
            desc.set_index(freelist);
        }
        desc.clear_state(PageState::SLAB_FROZEN);
        let inuse = desc.slab_inuse();
        if inuse == 0 && list.len() >= hive.min_partial {
            return Some(head);
        }
        if inuse < hive.layout.objects {
            list.push_front(&self.map, head);
        }
        None
    }

    /// Activates a partial slab, local node first.
    fn slab_take_partial(&self, hive: &Hive, slot: &mut PerCpuGuard<'_, ActiveSlab>, cpu: usize) -> bool {
        let local = self.collab.topology.cpu_to_node(cpu).min(MAX_NUMNODES - 1);
        let nodes = core::iter::once(local).chain((0..MAX_NUMNODES).filter(|&n| n != local));
        for node in nodes {
            let mut list = hive.partial[node].lock();
            let Some(head) = list.pop_front(&self.map) else {
                continue;
            };
            let desc = self.map.page(head);
            desc.set_state(PageState::SLAB_FROZEN);
            slot.freelist = desc.index();
            desc.set_index(NIL);
            slot.page = Some(head);
            return true;
        }
        false
    }

    /// Takes a block from the page allocator and turns it into an empty slab.
    fn slab_new(&self, hive: &Hive, flags: PafFlags) -> Option<Pfn> {
        let mut page_flags = flags.for_slab_pages();
        if hive.flags.contains(HiveFlags::DMA) {
            page_flags |= PafFlags::DMA;
        }
        let order = hive.layout.order;
        let head = self.alloc_page_frames(None, page_flags, order)?;
        let desc = self.map.page(head);
        desc.set_slab_inuse(0);
        desc.set_index(NIL);
        desc.set_private(0);
        for i in 1..1u64 << order {
            self.map.page(head.add(i)).set_role(PageRole::SlabTail { head });
        }
        desc.set_role(PageRole::SlabHead { hive: hive.id });
        hive.counters.slabs_allocated.fetch_add(1, Ordering::Relaxed);
        trace!("hive {}: new order-{order} slab {head}", hive.name);
        Some(head)
    }

    /// Gives an empty slab's pages back to the page allocator.
    pub(crate) fn slab_discard(&self, hive: &Hive, head: Pfn) {
        let desc = self.map.page(head);
        assert!(
            desc.slab_inuse() == 0,
            "BUG: hive {}: discarding slab {head} with objects in use",
            hive.name
        );
        let order = hive.layout.order;
        desc.set_slab_inuse(MAP_NONE);
        desc.set_index(0);
        desc.set_private(0);
        desc.clear_state(PageState::SLAB_FROZEN);
        for i in 1..1u64 << order {
            self.map.page(head.add(i)).set_role(PageRole::Tail);
        }
        desc.set_role(PageRole::Allocated { order });
        hive.counters.slabs_freed.fetch_add(1, Ordering::Relaxed);
        trace!("hive {}: discard slab {head}", hive.name);
        self.free_page_frames(head, order);
    }
}
