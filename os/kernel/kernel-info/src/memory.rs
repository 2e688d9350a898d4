//! # Memory Layout

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of a page frame in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Number of buddy orders. Blocks range from order 0 (one page) to
/// `MAX_ORDER - 1` (1024 pages, 4 MiB).
pub const MAX_ORDER: usize = 11;

/// Upper bound of CPUs the per-CPU tables are sized for.
pub const MAX_CPUS: usize = 8;

/// Upper bound of NUMA nodes.
pub const MAX_NUMNODES: usize = 4;

/// Zone types per node: DMA, Normal, User.
pub const NR_ZONES: usize = 3;

/// log2 of the pages per descriptor-table section.
pub const SECTION_SHIFT: u32 = 15;

/// Pages per section (128 MiB of physical memory with 4 KiB pages).
pub const PAGES_PER_SECTION: u64 = 1 << SECTION_SHIFT;

/// Regions the boot-time registry can hold.
pub const MAX_MEMORY_REGIONS: usize = 32;

/// Hive allotters that can exist at once.
pub const MAX_HIVES: usize = 256;

/// Default upper bound (exclusive) of the DMA zone.
pub const DMA_ZONE_LIMIT: u64 = 16 * 1024 * 1024;

/// Default upper bound (exclusive) of the permanently mapped Normal zone.
pub const DIRECT_ZONE_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

const _: () = {
    assert!(PAGE_SIZE == 4096);
    assert!(MAX_ORDER >= 1 && MAX_ORDER <= 16);
    assert!(MAX_NUMNODES <= 64, "node id is stored in 6 bits");
    assert!(NR_ZONES <= 4, "zone id is stored in 2 bits");
    assert!(SECTION_SHIFT as usize >= MAX_ORDER - 1);
    assert!(DMA_ZONE_LIMIT.is_multiple_of(PAGE_SIZE));
    assert!(DIRECT_ZONE_LIMIT > DMA_ZONE_LIMIT);
};
