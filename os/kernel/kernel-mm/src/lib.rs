//! # Kernel Physical Memory Management
//!
//! This crate owns every physical page of the machine once firmware hands
//! over its memory map: it tracks each page in a descriptor table, hands out
//! power-of-two blocks through a zoned buddy allocator and carves small
//! objects from those blocks with the hive slab allocator.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        kmalloc / kfree, KernelHeap (GlobalAlloc)    │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Hive slab allocator                    │
//! │    • Per-CPU active slabs, per-node partial lists   │
//! │    • Poisoning, red zones, call-site tracking       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Buddy page allocator                   │
//! │    • Nodes → zones → free areas of order 0..11      │
//! │    • Per-CPU hot/cold page caches                   │
//! │    • Watermarks, zone fallback, reclaim signaling   │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │       Page descriptor table (mem_map, sections)     │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │      Region registry and boot memory allocator      │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Bring-up
//!
//! [`MemoryBoot`] collects the firmware regions and an early allocation
//! window. [`MemoryBoot::finish`] lays the descriptor table out in boot
//! memory, builds nodes and zones, seeds the free lists and returns the
//! running [`MemorySubsystem`]. Everything after that goes through the
//! subsystem handle.
//!
//! ```ignore
//! let mut boot = MemoryBoot::new(&HhdmPhysMapper, MemConfig::default());
//! for region in usable_regions {
//!     boot.add_memory_region(region.base, region.len)?;
//! }
//! boot.init_boot_mem_area(PhysAddr::new(0x20_0000), PhysAddr::new(0x120_0000));
//! let mm = boot.finish(Collaborators::default());
//!
//! let page = mm.alloc_page(PafFlags::KERNEL);
//! let buf = mm.kmalloc(200, PafFlags::KERNEL);
//! ```
//!
//! The physical-to-virtual translation is abstracted behind [`PhysMapper`];
//! the kernel uses [`HhdmPhysMapper`], tests run on a host buffer.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod addr;
pub mod boot;
pub mod bootmem;
pub mod config;
pub mod error;
pub mod flags;
pub mod global;
pub mod hive;
pub mod mem_map;
pub mod node;
pub mod page;
pub mod page_alloc;
pub mod page_list;
pub mod page_ref;
pub mod pcp;
pub mod phys_mapper;
pub mod reclaim;
pub mod region;
pub mod subsystem;
pub mod zone;

pub use addr::{PhysAddr, Pfn, get_order};
pub use boot::MemoryBoot;
pub use config::MemConfig;
pub use error::{AlreadyInstalled, HiveError, RegionError};
pub use flags::{PafFlags, ZoneType};
pub use global::{HeapBackend, KernelHeap, global, install_global};
pub use hive::kmalloc::{KMALLOC_MAX_CACHE_SIZE, KMALLOC_SIZES};
pub use hive::{Hive, HiveBusy, HiveConfig, HiveCtor, HiveFlags, HiveStats, ObjectTrack, TrackRecord};
pub use page::{CacheHandle, HiveId, PageRole, PageState};
pub use phys_mapper::{HhdmPhysMapper, PhysMapper};
pub use reclaim::{
    Collaborators, CpuTopology, NoPageCache, NoReclaim, PageCacheHook, ReclaimContext, Reclaimer,
    ShrinkRequest, Uniprocessor,
};
pub use subsystem::MemorySubsystem;
pub use zone::{FreeListReport, Mark, Watermarks, ZoneId, ZoneStatsSnapshot};
