//! # Global heap
//!
//! The subsystem is passed around by reference, except for one anchor: the
//! kernel's `#[global_allocator]` needs a static to reach it. After boot the
//! kernel leaks its [`MemorySubsystem`] and installs it here once.
//!
//! ```ignore
//! #[global_allocator]
//! static HEAP: KernelHeap = KernelHeap;
//!
//! let mm: &'static _ = Box::leak(...);
//! kernel_mm::install_global(mm)?;
//! ```

use crate::error::AlreadyInstalled;
use crate::flags::PafFlags;
use crate::phys_mapper::PhysMapper;
use crate::subsystem::MemorySubsystem;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_sync::SyncOnceCell;

/// Object-safe view of a memory subsystem for the global allocator.
pub trait HeapBackend: Sync {
    fn heap_alloc(&self, size: usize, align: usize, flags: PafFlags) -> Option<NonNull<u8>>;

    fn heap_free(&self, ptr: NonNull<u8>);
}

impl<M: PhysMapper> HeapBackend for MemorySubsystem<'_, M> {
    fn heap_alloc(&self, size: usize, align: usize, flags: PafFlags) -> Option<NonNull<u8>> {
        self.kmalloc_aligned(size, align, flags)
    }

    fn heap_free(&self, ptr: NonNull<u8>) {
        self.kfree(ptr);
    }
}

static GLOBAL: SyncOnceCell<&'static dyn HeapBackend> = SyncOnceCell::new();

/// Anchors the subsystem [`KernelHeap`] allocates from.
///
/// # Errors
/// Fails if a subsystem is already installed.
pub fn install_global(backend: &'static dyn HeapBackend) -> Result<(), AlreadyInstalled> {
    GLOBAL.set(backend).map(|_| ()).map_err(|_| AlreadyInstalled)
}

/// The installed subsystem, if any.
pub fn global() -> Option<&'static dyn HeapBackend> {
    GLOBAL.get().copied()
}

/// `GlobalAlloc` over the installed subsystem's kmalloc.
///
/// Allocations before [`install_global`] fail with a null pointer.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelHeap;

impl KernelHeap {
    fn alloc_with(layout: Layout, flags: PafFlags) -> *mut u8 {
        global()
            .and_then(|heap| heap.heap_alloc(layout.size().max(1), layout.align(), flags))
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        Self::alloc_with(layout, PafFlags::KERNEL)
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` must come from this allocator.
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(heap), Some(ptr)) = (global(), NonNull::new(ptr)) {
            heap.heap_free(ptr);
        }
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies.
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        Self::alloc_with(layout, PafFlags::KERNEL | PafFlags::ZERO)
    }
}
