//! # Region registry
//!
//! Physical memory extents discovered at boot. The registry is filled once,
//! before the boot allocator exists, and only read afterwards.

use crate::addr::{PhysAddr, Pfn};
use crate::error::RegionError;
use kernel_info::memory::{MAX_MEMORY_REGIONS, MAX_NUMNODES, PAGE_SIZE};
use log::{debug, warn};

/// A page-aligned extent of usable RAM on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: PhysAddr,
    /// Exclusive.
    pub end: PhysAddr,
    pub node: usize,
}

impl MemoryRegion {
    const EMPTY: Self = Self {
        base: PhysAddr::new(0),
        end: PhysAddr::new(0),
        node: 0,
    };

    #[inline]
    #[must_use]
    pub const fn start_pfn(&self) -> Pfn {
        self.base.pfn()
    }

    #[inline]
    #[must_use]
    pub const fn end_pfn(&self) -> Pfn {
        self.end.pfn()
    }

    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        self.end_pfn().as_u64() - self.start_pfn().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn contains_pfn(&self, pfn: Pfn) -> bool {
        pfn.as_u64() >= self.start_pfn().as_u64() && pfn.as_u64() < self.end_pfn().as_u64()
    }

    /// Number of this region's pages inside `[start, end)`.
    #[must_use]
    pub fn pages_in(&self, start: u64, end: u64) -> u64 {
        let lo = self.start_pfn().as_u64().max(start);
        let hi = self.end_pfn().as_u64().min(end);
        hi.saturating_sub(lo)
    }
}

/// Fixed-capacity, base-sorted table of [`MemoryRegion`]s.
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    regions: [MemoryRegion; MAX_MEMORY_REGIONS],
    len: usize,
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            regions: [MemoryRegion::EMPTY; MAX_MEMORY_REGIONS],
            len: 0,
        }
    }

    /// Registers `[base, base + size)` on `node`, shrunk to whole pages.
    ///
    /// # Errors
    /// The region is dropped (and a warning logged) when the table is full,
    /// when no whole page remains, when it overlaps a registered region or
    /// when `node` is out of range.
    pub fn add(&mut self, base: PhysAddr, size: u64, node: usize) -> Result<(), RegionError> {
        let result = self.try_add(base, size, node);
        if let Err(e) = result {
            warn!("memory region ignored: {e}");
        }
        result
    }

    fn try_add(&mut self, base: PhysAddr, size: u64, node: usize) -> Result<(), RegionError> {
        if node >= MAX_NUMNODES {
            return Err(RegionError::InvalidNode { node });
        }
        if self.len == MAX_MEMORY_REGIONS {
            return Err(RegionError::TableFull {
                base,
                size,
                max: MAX_MEMORY_REGIONS,
            });
        }
        let start = base.align_up(PAGE_SIZE);
        let end = PhysAddr::new(base.as_u64().saturating_add(size)).align_down(PAGE_SIZE);
        if end <= start {
            return Err(RegionError::Empty { base, size });
        }
        if self.iter().any(|r| start < r.end && r.base < end) {
            return Err(RegionError::Overlap { base, size });
        }

        let region = MemoryRegion {
            base: start,
            end,
            node,
        };
        let at = self.iter().position(|r| r.base > start).unwrap_or(self.len);
        self.regions.copy_within(at..self.len, at + 1);
        self.regions[at] = region;
        self.len += 1;
        debug!("memory region {start}..{end} on node {node}");
        Ok(())
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions[..self.len].iter()
    }

    #[must_use]
    pub fn find(&self, pfn: Pfn) -> Option<&MemoryRegion> {
        self.iter().find(|r| r.contains_pfn(pfn))
    }

    /// Lowest and one-past-highest frame of all regions.
    #[must_use]
    pub fn span(&self) -> Option<(Pfn, Pfn)> {
        let first = self.iter().next()?;
        let last = self.iter().map(MemoryRegion::end_pfn).max()?;
        Some((first.start_pfn(), last))
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.iter().map(MemoryRegion::pages).sum()
    }
}
