//! # Runtime tunables

use crate::addr::PhysAddr;
use crate::flags::ZoneType;
use kernel_info::memory::{DIRECT_ZONE_LIMIT, DMA_ZONE_LIMIT, PAGE_SHIFT};

/// Runtime configuration of the memory subsystem.
///
/// Table sizes are compile-time constants in [`kernel_info::memory`]; these
/// are the knobs that may differ per machine or per test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemConfig {
    /// Physical addresses below this limit belong to the DMA zone.
    pub dma_limit: PhysAddr,
    /// Physical addresses below this limit (and above `dma_limit`) belong to
    /// the Normal zone; everything above is the User zone.
    pub direct_limit: PhysAddr,
    /// Pages kept back across all zones as the `min` watermark.
    /// `None` derives it from the amount of memory.
    pub min_free_pages: Option<u64>,
    /// Per-CPU cache batch; `None` derives it from the zone size.
    pub pcp_batch: Option<u32>,
    /// Reclaim-and-retry rounds before a `WAIT` allocation gives up.
    pub reclaim_retries: u32,
    /// Rounds after which a `NOFAIL` allocation is declared hopeless.
    pub nofail_retry_budget: u32,
    /// Polls spent on a zone wait queue per round.
    pub wait_spins: u32,
    /// Largest backing order a hive picks on its own.
    pub hive_max_order: u8,
    /// Objects per slab a hive tries to reach when picking its order.
    pub hive_min_objects: u32,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            dma_limit: PhysAddr::new(DMA_ZONE_LIMIT),
            direct_limit: PhysAddr::new(DIRECT_ZONE_LIMIT),
            min_free_pages: None,
            pcp_batch: None,
            reclaim_retries: 16,
            nofail_retry_budget: 1 << 16,
            wait_spins: 1 << 12,
            hive_max_order: 3,
            hive_min_objects: 16,
        }
    }
}

impl MemConfig {
    /// Zone a frame number falls into.
    #[must_use]
    pub const fn zone_of_pfn(&self, pfn: u64) -> ZoneType {
        if pfn < self.dma_limit.as_u64() >> PAGE_SHIFT {
            ZoneType::Dma
        } else if pfn < self.direct_limit.as_u64() >> PAGE_SHIFT {
            ZoneType::Normal
        } else {
            ZoneType::User
        }
    }

    /// Frame range `[start, end)` of a zone type.
    #[must_use]
    pub const fn zone_pfn_range(&self, zone: ZoneType) -> (u64, u64) {
        let dma = self.dma_limit.as_u64() >> PAGE_SHIFT;
        let direct = self.direct_limit.as_u64() >> PAGE_SHIFT;
        match zone {
            ZoneType::Dma => (0, dma),
            ZoneType::Normal => (dma, direct),
            ZoneType::User => (direct, u64::MAX),
        }
    }

    /// `min_free_pages` if set, otherwise `sqrt(16 * lowmem_kib)` KiB clamped
    /// to 128 KiB ..= 64 MiB.
    #[must_use]
    pub fn effective_min_free_pages(&self, lowmem_pages: u64) -> u64 {
        if let Some(pages) = self.min_free_pages {
            return pages;
        }
        let lowmem_kib = lowmem_pages << (PAGE_SHIFT - 10);
        let kib = (lowmem_kib * 16).isqrt().clamp(128, 65_536);
        kib >> (PAGE_SHIFT - 10)
    }
}
