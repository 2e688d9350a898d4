#![allow(dead_code)]

use kernel_mm::{Collaborators, MemConfig, MemoryBoot, MemorySubsystem, PhysAddr, PhysMapper};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;

/// Physical address the host buffer pretends to start at; above the default
/// DMA limit so everything lands in the Normal zone.
pub const PHYS_BASE: u64 = 0x100_0000;

pub const MIB: u64 = 1 << 20;

/// Host memory standing in for physical RAM.
///
/// Aligned to the largest buddy block so that physically aligned blocks are
/// aligned in the buffer too.
pub struct TestPhys {
    base: NonNull<u8>,
    layout: Layout,
}

impl TestPhys {
    pub fn new(size: u64) -> Self {
        let layout = Layout::from_size_align(usize::try_from(size).unwrap(), 4 << 20).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("host allocation");
        Self { base, layout }
    }

    pub fn size(&self) -> u64 {
        self.layout.size() as u64
    }
}

impl Drop for TestPhys {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

unsafe impl Send for TestPhys {}
unsafe impl Sync for TestPhys {}

// SAFETY: the buffer lives as long as the mapper and is contiguous.
unsafe impl PhysMapper for TestPhys {
    fn phys_to_virt(&self, pa: PhysAddr) -> NonNull<u8> {
        let off = pa.as_u64() - PHYS_BASE;
        assert!(off < self.size(), "{pa} outside test memory");
        unsafe { self.base.add(usize::try_from(off).unwrap()) }
    }

    fn virt_to_phys(&self, va: NonNull<u8>) -> Option<PhysAddr> {
        let off = (va.as_ptr() as usize).checked_sub(self.base.as_ptr() as usize)? as u64;
        (off < self.size()).then(|| PhysAddr::new(PHYS_BASE + off))
    }
}

/// Config with no reserve, so tests can drain memory completely.
pub fn no_reserve() -> MemConfig {
    MemConfig {
        min_free_pages: Some(0),
        ..MemConfig::default()
    }
}

/// One region covering all of `phys`, with the first MiB as boot memory.
pub fn boot<'m>(
    phys: &'m TestPhys,
    config: MemConfig,
    collab: Collaborators<'m>,
) -> MemorySubsystem<'m, TestPhys> {
    let mut boot = MemoryBoot::new(phys, config);
    boot.add_memory_region(PhysAddr::new(PHYS_BASE), phys.size())
        .unwrap();
    boot.init_boot_mem_area(PhysAddr::new(PHYS_BASE), PhysAddr::new(PHYS_BASE + MIB));
    boot.finish(collab)
}

/// Takes every free block of `order` and below; returns them by order.
pub fn drain(mm: &MemorySubsystem<'_, TestPhys>, order: u8) -> Vec<(kernel_mm::Pfn, u8)> {
    let flags = kernel_mm::PafFlags::NOWARN;
    let mut taken = Vec::new();
    for o in (0..=order).rev() {
        while let Some(pfn) = mm.alloc_page_frames(None, flags, o) {
            taken.push((pfn, o));
        }
    }
    taken
}
