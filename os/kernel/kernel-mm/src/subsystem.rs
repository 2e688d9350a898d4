//! # The memory subsystem context
//!
//! [`MemorySubsystem`] owns everything the allocators share: the descriptor
//! table, the nodes with their page areas, the kmalloc hives and the
//! collaborators. It is built once by [`MemoryBoot::finish`] and then only
//! used through `&self`.
//!
//! [`MemoryBoot::finish`]: crate::boot::MemoryBoot::finish

use crate::addr::{PhysAddr, Pfn};
use crate::config::MemConfig;
use crate::flags::ZoneType;
use crate::hive::HiveIds;
use crate::hive::kmalloc::KmallocCaches;
use crate::mem_map::MemMap;
use crate::node::MemoryNode;
use crate::pcp::zone_batch_size;
use crate::phys_mapper::PhysMapper;
use crate::reclaim::{Collaborators, ReclaimContext};
use crate::zone::{FreeListReport, PageArea, Watermarks, ZoneId};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_info::memory::{MAX_CPUS, MAX_NUMNODES};
use kernel_sync::SpinLock;
use log::{debug, info};

pub struct MemorySubsystem<'m, M: PhysMapper> {
    pub(crate) mapper: &'m M,
    pub(crate) config: MemConfig,
    pub(crate) map: MemMap<'m>,
    pub(crate) nodes: [MemoryNode; MAX_NUMNODES],
    pub(crate) collab: Collaborators<'m>,
    /// Per CPU: currently inside a reclaim callback.
    pub(crate) in_reclaim: [AtomicBool; MAX_CPUS],
    pub(crate) min_free_pages: AtomicU64,
    pub(crate) hive_ids: SpinLock<HiveIds>,
    pub(crate) kmalloc: KmallocCaches,
    /// Permanent boot allocations (descriptor and section tables).
    pub(crate) boot_reserved: (PhysAddr, PhysAddr),
}

impl<'m, M: PhysMapper> MemorySubsystem<'m, M> {
    #[must_use]
    pub const fn config(&self) -> &MemConfig {
        &self.config
    }

    #[must_use]
    pub const fn mem_map(&self) -> &MemMap<'m> {
        &self.map
    }

    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// # Panics
    /// Panics if `node` is out of range.
    #[must_use]
    pub fn node(&self, node: usize) -> &MemoryNode {
        &self.nodes[node]
    }

    pub fn online_nodes(&self) -> impl Iterator<Item = &MemoryNode> {
        self.nodes.iter().filter(|n| n.is_online())
    }

    /// # Panics
    /// Panics if `zone.node` is out of range.
    #[must_use]
    pub fn area(&self, zone: ZoneId) -> &PageArea {
        self.nodes[zone.node].zone(zone.zone)
    }

    /// Page area a frame belongs to.
    #[must_use]
    pub fn area_of(&self, pfn: Pfn) -> &PageArea {
        let desc = self.map.page(pfn);
        self.nodes[desc.node()].zone(desc.zone_type())
    }

    /// All page areas holding memory.
    pub fn areas(&self) -> impl Iterator<Item = &PageArea> {
        self.nodes
            .iter()
            .flat_map(|n| n.zones.iter())
            .filter(|a| a.is_populated())
    }

    #[inline]
    pub(crate) fn current_cpu(&self) -> usize {
        self.collab.topology.current_cpu()
    }

    /// Node to allocate from: the hint if it is online, else the CPU's node,
    /// else the first online node.
    pub(crate) fn resolve_node(&self, hint: Option<usize>, cpu: usize) -> usize {
        let online = |n: usize| n < MAX_NUMNODES && self.nodes[n].is_online();
        let preferred = hint.unwrap_or_else(|| self.collab.topology.cpu_to_node(cpu));
        if online(preferred) {
            return preferred;
        }
        (0..MAX_NUMNODES).find(|&n| online(n)).unwrap_or(0)
    }

    /// Pages on the buddy lists of every zone.
    pub fn nr_free_pages(&self) -> u64 {
        self.areas().map(PageArea::free_pages).sum()
    }

    /// Pages handed to the page allocator at boot.
    pub fn nr_managed_pages(&self) -> u64 {
        self.areas().map(PageArea::present_pages).sum()
    }

    /// Re-derives every zone's watermarks from a new global `min`.
    ///
    /// The reserve is split across zones in proportion to their size.
    pub fn set_min_free_pages(&self, pages: u64) {
        self.min_free_pages.store(pages, Ordering::Relaxed);
        self.setup_watermarks();
    }

    pub(crate) fn setup_watermarks(&self) {
        let total = self.nr_managed_pages().max(1);
        let min_total = self.min_free_pages.load(Ordering::Relaxed);
        for area in self.areas() {
            let share = u128::from(min_total) * u128::from(area.present_pages()) / u128::from(total);
            let marks = Watermarks::from_min(u64::try_from(share).unwrap_or(u64::MAX));
            area.set_watermarks(marks);
            debug!(
                "{}: watermarks min {} low {} high {}",
                area.id(),
                marks.min,
                marks.low,
                marks.high
            );
        }
    }

    pub(crate) fn setup_pcp_batches(&self) {
        for area in self.areas() {
            let batch = self
                .config
                .pcp_batch
                .unwrap_or_else(|| zone_batch_size(area.present_pages()));
            for cpu in 0..MAX_CPUS {
                area.pcp_set_batch(cpu, batch);
            }
        }
    }

    /// Walks every free list, checking the buddy invariants.
    ///
    /// # Panics
    /// Panics on any corruption.
    pub fn check_free_lists(&self) -> impl Iterator<Item = FreeListReport> + '_ {
        self.areas().map(|a| a.check_free_lists(&self.map))
    }

    /// Free-list report of one zone.
    ///
    /// # Panics
    /// Panics on corruption or if `zone.node` is out of range.
    #[must_use]
    pub fn zone_report(&self, zone: ZoneId) -> FreeListReport {
        self.area(zone).check_free_lists(&self.map)
    }

    /// Logs per-zone free memory.
    pub fn show_free_areas(&self) {
        info!(
            "free pages: {} of {} managed",
            self.nr_free_pages(),
            self.nr_managed_pages()
        );
        for area in self.areas() {
            area.show();
        }
    }

    /// Physical range of the boot allocations that are never freed.
    #[must_use]
    pub const fn boot_reserved(&self) -> (PhysAddr, PhysAddr) {
        self.boot_reserved
    }

    /// Zone type of a physical address under this configuration.
    #[must_use]
    pub const fn zone_type_of(&self, pa: PhysAddr) -> ZoneType {
        self.config.zone_of_pfn(pa.pfn().as_u64())
    }
}

impl<M: PhysMapper> ReclaimContext for MemorySubsystem<'_, M> {
    fn release_page(&self, pfn: Pfn) {
        self.release(pfn);
    }

    fn free_page_frames(&self, pfn: Pfn, order: u8) {
        Self::free_page_frames(self, pfn, order);
    }

    fn zone_free_pages(&self, zone: ZoneId) -> u64 {
        self.area(zone).free_pages()
    }

    fn zone_watermarks(&self, zone: ZoneId) -> Watermarks {
        self.area(zone).watermarks()
    }
}

impl<M: PhysMapper> fmt::Debug for MemorySubsystem<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySubsystem")
            .field("map", &self.map)
            .field("free_pages", &self.nr_free_pages())
            .field("managed_pages", &self.nr_managed_pages())
            .finish_non_exhaustive()
    }
}
