//! # Bring-up
//!
//! [`MemoryBoot`] collects the region registry and the boot allocator, and
//! [`MemoryBoot::finish`] turns them into a live [`MemorySubsystem`]:
//!
//! ```text
//!  add_memory_region*  ─►  init_boot_mem_area  ─►  alloc_boot_mem_*  ─►  finish
//!                                                                          │
//!   section table ◄── descriptor arena ◄── zones ◄── free lists ◄──────────┘
//!        └──► watermarks ──► per-CPU batches ──► boot memory released ──► kmalloc
//! ```

use crate::addr::{PhysAddr, Pfn};
use crate::bootmem::BootMem;
use crate::config::MemConfig;
use crate::error::RegionError;
use crate::flags::ZoneType;
use crate::hive::HiveIds;
use crate::hive::kmalloc::KmallocCaches;
use crate::mem_map::{MemMap, SectionInfo};
use crate::node::MemoryNode;
use crate::page::{PageDescriptor, PageRole, PageState, REF_FREE};
use crate::phys_mapper::PhysMapper;
use crate::reclaim::Collaborators;
use crate::region::RegionRegistry;
use crate::subsystem::MemorySubsystem;
use crate::zone::{PageArea, ZoneId};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_info::memory::{MAX_NUMNODES, MAX_ORDER, NR_ZONES, PAGE_SIZE, SECTION_SHIFT};
use kernel_sync::SpinLock;
use log::{info, warn};

/// Boot-time builder of the memory subsystem.
pub struct MemoryBoot<'m, M: PhysMapper> {
    mapper: &'m M,
    config: MemConfig,
    regions: RegionRegistry,
    bootmem: Option<BootMem>,
}

impl<'m, M: PhysMapper> MemoryBoot<'m, M> {
    #[must_use]
    pub const fn new(mapper: &'m M, config: MemConfig) -> Self {
        Self {
            mapper,
            config,
            regions: RegionRegistry::new(),
            bootmem: None,
        }
    }

    /// Registers usable RAM on node 0.
    ///
    /// # Errors
    /// See [`RegionRegistry::add`]; a rejected region is logged and skipped.
    pub fn add_memory_region(&mut self, base: PhysAddr, size: u64) -> Result<(), RegionError> {
        self.regions.add(base, size, 0)
    }

    /// # Errors
    /// See [`RegionRegistry::add`].
    pub fn add_memory_region_on_node(
        &mut self,
        base: PhysAddr,
        size: u64,
        node: usize,
    ) -> Result<(), RegionError> {
        self.regions.add(base, size, node)
    }

    #[must_use]
    pub const fn regions(&self) -> &RegionRegistry {
        &self.regions
    }

    /// Reserves `[start, end)` for the boot allocator.
    ///
    /// # Panics
    /// Panics if the area was already set or does not lie inside one
    /// registered region.
    pub fn init_boot_mem_area(&mut self, start: PhysAddr, end: PhysAddr) {
        assert!(self.bootmem.is_none(), "boot memory area already set");
        let boot = BootMem::new(start, end);
        let inside = self
            .regions
            .iter()
            .any(|r| r.base <= boot.start() && boot.end() <= r.end);
        assert!(
            inside,
            "boot memory area {start}..{end} is not inside a registered region"
        );
        info!("boot memory area {}..{}", boot.start(), boot.end());
        self.bootmem = Some(boot);
    }

    fn boot(&mut self) -> &mut BootMem {
        match self.bootmem.as_mut() {
            Some(boot) => boot,
            None => panic!("BUG: boot memory area not initialized"),
        }
    }

    /// # Panics
    /// Panics when boot memory is exhausted.
    pub fn alloc_boot_mem_temporary(&mut self, size: u64, align: u64) -> PhysAddr {
        self.boot().alloc_temporary(size, align)
    }

    /// # Panics
    /// Panics when boot memory is exhausted.
    pub fn alloc_boot_mem_permanent(&mut self, size: u64, align: u64) -> PhysAddr {
        self.boot().alloc_permanent(size, align)
    }

    /// # Panics
    /// Panics if not even one bucket fits.
    pub fn alloc_boot_mem_stretch(&mut self, bucket_size: u64, max_order: u8) -> (PhysAddr, u8) {
        self.boot().alloc_stretch(bucket_size, max_order)
    }

    /// Builds the descriptor table and the zones, hands all free memory to
    /// the buddy lists and creates the kmalloc hives.
    ///
    /// # Panics
    /// Panics without registered memory or boot area, or when boot memory
    /// cannot hold the tables.
    #[must_use]
    pub fn finish(mut self, collab: Collaborators<'m>) -> MemorySubsystem<'m, M> {
        let Some(mut boot) = self.bootmem.take() else {
            panic!("BUG: boot memory area not initialized");
        };
        let Some((span_start, span_end)) = self.regions.span() else {
            panic!("no memory regions registered");
        };
        let regions = &self.regions;
        let config = self.config;
        let start_pfn = span_start.as_u64();

        let first_section = start_pfn >> SECTION_SHIFT;
        let wanted = ((span_end.as_u64() - 1) >> SECTION_SHIFT) - first_section + 1;
        #[allow(clippy::cast_possible_truncation)]
        let wanted_order = wanted.next_power_of_two().trailing_zeros() as u8;
        let (sections_pa, order) =
            boot.alloc_stretch(size_of::<SectionInfo>() as u64, wanted_order);
        let nr_sections = wanted.min(1 << order);
        let mut end_pfn = span_end.as_u64();
        if nr_sections < wanted {
            end_pfn = (first_section + nr_sections) << SECTION_SHIFT;
            warn!(
                "section table holds {nr_sections} of {wanted} sections; memory above {} ignored",
                Pfn::new(end_pfn).addr()
            );
        }

        // SAFETY: fresh permanent boot memory, page aligned, never freed.
        let sections = unsafe {
            carve_table(self.mapper, sections_pa, to_usize(nr_sections), |i| {
                let lo = (first_section + i as u64) << SECTION_SHIFT;
                let hi = lo + (1 << SECTION_SHIFT);
                let owner = regions.iter().find(|r| r.pages_in(lo, hi) > 0);
                #[allow(clippy::cast_possible_truncation)]
                SectionInfo {
                    node: owner.map_or(0, |r| r.node as u8),
                    present: owner.is_some(),
                }
            })
        };

        let nr_pages = end_pfn - start_pfn;
        let arena_pa = boot.alloc_permanent(nr_pages * size_of::<PageDescriptor>() as u64, 64);
        // SAFETY: as above; 64-byte alignment covers the descriptor.
        let descs = unsafe {
            carve_table(self.mapper, arena_pa, to_usize(nr_pages), |i| {
                let pfn = start_pfn + i as u64;
                let section = pfn >> SECTION_SHIFT;
                let node = regions.find(Pfn::new(pfn)).map_or_else(
                    || usize::from(sections[to_usize(section - first_section)].node),
                    |r| r.node,
                );
                PageDescriptor::reserved(node, config.zone_of_pfn(pfn), section)
            })
        };
        let map = MemMap::new(descs, start_pfn, sections, first_section);

        let nodes: [MemoryNode; MAX_NUMNODES] = core::array::from_fn(|node| {
            MemoryNode::new(
                node,
                ZoneType::ALL.map(|zone| {
                    let (zlo, zhi) = config.zone_pfn_range(zone);
                    let (lo, hi) = (zlo.max(start_pfn), zhi.min(end_pfn));
                    let mut span = (u64::MAX, 0);
                    let mut present = 0;
                    for r in regions.iter().filter(|r| r.node == node) {
                        let pages = r.pages_in(lo, hi);
                        if pages > 0 {
                            present += pages;
                            span.0 = span.0.min(r.start_pfn().as_u64().max(lo));
                            span.1 = span.1.max(r.end_pfn().as_u64().min(hi));
                        }
                    }
                    if present == 0 {
                        span = (lo, lo);
                    }
                    PageArea::new(ZoneId { node, zone }, span.0, span.1, present)
                }),
            )
        });

        let mut mm = MemorySubsystem {
            mapper: self.mapper,
            config,
            map,
            nodes,
            collab,
            in_reclaim: core::array::from_fn(|_| AtomicBool::new(false)),
            min_free_pages: AtomicU64::new(0),
            hive_ids: SpinLock::new(HiveIds::new()),
            kmalloc: KmallocCaches::empty(),
            boot_reserved: (boot.start(), boot.start()),
        };

        let mut populated = [[false; NR_ZONES]; MAX_NUMNODES];
        for (node, row) in populated.iter_mut().enumerate() {
            for zone in ZoneType::ALL {
                row[zone.index()] = mm.nodes[node].zone(zone).is_populated();
            }
        }
        let topology = collab.topology;
        for node in &mut mm.nodes {
            node.build_zonelists(&populated, |a, b| topology.node_distance(a, b));
        }

        // Everything registered except the boot area.
        let (boot_lo, boot_hi) = (boot.start().pfn().as_u64(), boot.end().pfn().as_u64());
        for r in regions.iter() {
            let lo = r.start_pfn().as_u64().max(start_pfn);
            let hi = r.end_pfn().as_u64().min(end_pfn);
            mm.seed_free_range(lo, hi.min(boot_lo).max(lo));
            mm.seed_free_range(lo.max(boot_hi), hi);
        }

        let lowmem = mm
            .areas()
            .filter(|a| a.id().zone != ZoneType::User)
            .map(PageArea::present_pages)
            .sum::<u64>();
        let lowmem = if lowmem == 0 { mm.nr_managed_pages() } else { lowmem };
        mm.min_free_pages
            .store(config.effective_min_free_pages(lowmem), Ordering::Relaxed);
        mm.setup_watermarks();
        mm.setup_pcp_batches();

        let (released_lo, released_hi) = boot.retire();
        mm.boot_reserved = (boot.start(), released_lo);
        let hi = released_hi.pfn().as_u64().min(end_pfn);
        mm.seed_free_range(released_lo.pfn().as_u64().min(hi), hi);

        info!(
            "memory: {} regions, {} pages managed, {} free, {} descriptors ({} KiB), {} sections",
            regions.len(),
            mm.nr_managed_pages(),
            mm.nr_free_pages(),
            nr_pages,
            nr_pages * size_of::<PageDescriptor>() as u64 / 1024,
            nr_sections
        );
        for area in mm.areas() {
            let (lo, hi) = area.span();
            info!(
                "{}: {}..{} present {} pages",
                area.id(),
                lo.addr(),
                hi.addr(),
                area.present_pages()
            );
        }

        mm.kmalloc = KmallocCaches::create(&mm);
        mm
    }
}

impl<M: PhysMapper> MemorySubsystem<'_, M> {
    /// Hands the registered frames `[lo, hi)` to the buddy lists in the
    /// largest aligned blocks that stay within one zone.
    fn seed_free_range(&self, lo: u64, hi: u64) {
        let mut pfn = lo;
        while pfn < hi {
            let zone = self.map.zone_of(Pfn::new(pfn));
            #[allow(clippy::cast_possible_truncation)]
            let mut order = (MAX_ORDER - 1) as u8;
            while order > 0 {
                let end = pfn + (1 << order);
                if Pfn::new(pfn).is_aligned(order)
                    && end <= hi
                    && self.map.zone_of(Pfn::new(end - 1)) == zone
                {
                    break;
                }
                order -= 1;
            }
            let pages = 1u64 << order;
            for p in pfn..pfn + pages {
                let desc = self.map.page(Pfn::new(p));
                desc.clear_state(PageState::RESERVED);
                desc.ref_count().store(REF_FREE, Ordering::Relaxed);
                desc.set_role(PageRole::Tail);
            }
            let area = self.area_of(Pfn::new(pfn));
            let mut fa = area.lock();
            area.free_one(&self.map, &mut fa, Pfn::new(pfn), order);
            pfn += pages;
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn to_usize(v: u64) -> usize {
    v as usize
}

/// Writes `len` values into boot memory and returns them as a slice.
///
/// # Safety
/// `[pa, pa + len * size_of::<T>())` must be boot memory that is never freed,
/// aligned for `T` and not referenced elsewhere.
unsafe fn carve_table<'m, T, M: PhysMapper>(
    mapper: &'m M,
    pa: PhysAddr,
    len: usize,
    mut init: impl FnMut(usize) -> T,
) -> &'m [T] {
    debug_assert!(pa.as_u64().is_multiple_of(align_of::<T>() as u64));
    debug_assert!(PAGE_SIZE.is_multiple_of(align_of::<T>() as u64));
    let base = mapper.phys_to_virt(pa).cast::<T>();
    for i in 0..len {
        // SAFETY: in bounds of the caller's range, which nobody else uses.
        unsafe { base.add(i).write(init(i)) };
    }
    // SAFETY: all `len` elements were just initialized; the mapper keeps the
    // memory mapped for `'m`.
    unsafe { core::slice::from_raw_parts(base.as_ptr(), len) }
}
