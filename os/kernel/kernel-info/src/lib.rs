//! # Kernel Memory Configuration
//!
//! Compile-time constants shared by the physical memory subsystem and its
//! consumers. Everything here is a `const` so table sizes (per-CPU arrays,
//! per-node arrays, free-list orders) are fixed at build time and checked by
//! `const` assertions rather than at boot.
//!
//! ## Physical address space
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  DMA zone (< DMA_ZONE_LIMIT)    │  legacy device reachable
//! 16 MiB      ├─────────────────────────────────┤
//!             │  Normal zone                    │  permanently direct-mapped
//!             │  (< DIRECT_ZONE_LIMIT)          │  kernel memory
//! 4 GiB       ├─────────────────────────────────┤
//!             │  User zone                      │  everything above, preferred
//!             │                                 │  for user pages
//!             └─────────────────────────────────┘
//! ```
//!
//! The zone limits are defaults; the memory subsystem accepts runtime
//! overrides. The page-descriptor table is indexed by section
//! (`PAGES_PER_SECTION` pages each) so a section's node and presence are one
//! table lookup away.
//!
//! ## Virtual address space
//!
//! Physical memory is reachable through the Higher Half Direct Map at
//! [`memory::HHDM_BASE`]: `va = HHDM_BASE + pa`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
