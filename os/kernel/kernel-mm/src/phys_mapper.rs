//! # Physical memory access
//!
//! The allocator never dereferences a physical address directly. Every touch of
//! page contents (descriptor arena, zeroing, slab free pointers, debug
//! patterns) goes through a [`PhysMapper`], so the same code runs against the
//! kernel's higher-half direct map and against plain heap memory in tests.

use crate::addr::PhysAddr;
use core::ptr::NonNull;
use kernel_info::memory::HHDM_BASE;

/// Translation between physical addresses and kernel pointers.
///
/// # Safety
/// For every physical address inside registered memory, [`phys_to_virt`]
/// must return a pointer that stays valid for reads and writes for as long
/// as the mapper is alive, physically contiguous ranges must be virtually
/// contiguous, and [`virt_to_phys`] must invert [`phys_to_virt`] exactly.
///
/// [`phys_to_virt`]: PhysMapper::phys_to_virt
/// [`virt_to_phys`]: PhysMapper::virt_to_phys
pub unsafe trait PhysMapper: Sync {
    fn phys_to_virt(&self, pa: PhysAddr) -> NonNull<u8>;

    /// `None` for pointers outside the mapped physical range.
    fn virt_to_phys(&self, va: NonNull<u8>) -> Option<PhysAddr>;

    /// Fills `len` bytes starting at `pa`.
    ///
    /// # Safety
    /// The range must be mapped memory the caller exclusively owns.
    unsafe fn fill(&self, pa: PhysAddr, byte: u8, len: usize) {
        // SAFETY: forwarded to the caller.
        unsafe { self.phys_to_virt(pa).as_ptr().write_bytes(byte, len) };
    }

    /// # Safety
    /// `pa` must be 8-byte aligned mapped memory not concurrently written.
    unsafe fn read_u64(&self, pa: PhysAddr) -> u64 {
        // SAFETY: forwarded to the caller.
        unsafe { self.phys_to_virt(pa).cast::<u64>().read() }
    }

    /// # Safety
    /// `pa` must be 8-byte aligned mapped memory the caller exclusively owns.
    unsafe fn write_u64(&self, pa: PhysAddr, value: u64) {
        // SAFETY: forwarded to the caller.
        unsafe { self.phys_to_virt(pa).cast::<u64>().write(value) };
    }
}

/// [`PhysMapper`] for kernels with a higher-half direct map: `va = HHDM_BASE + pa`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HhdmPhysMapper;

// SAFETY: the HHDM covers all physical memory for the kernel's lifetime.
unsafe impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_virt(&self, pa: PhysAddr) -> NonNull<u8> {
        let va = HHDM_BASE + pa.as_u64();
        #[allow(clippy::cast_possible_truncation)]
        let ptr = core::ptr::with_exposed_provenance_mut::<u8>(va as usize);
        // SAFETY: HHDM_BASE is non-zero and pa is small enough not to wrap.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    #[inline]
    fn virt_to_phys(&self, va: NonNull<u8>) -> Option<PhysAddr> {
        (va.as_ptr().expose_provenance() as u64)
            .checked_sub(HHDM_BASE)
            .map(PhysAddr::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhdm_round_trip() {
        let m = HhdmPhysMapper;
        let pa = PhysAddr::new(0x1234_5000);
        let va = m.phys_to_virt(pa);
        assert_eq!(va.as_ptr().addr() as u64, HHDM_BASE + 0x1234_5000);
        assert_eq!(m.virt_to_phys(va), Some(pa));
    }

    #[test]
    fn low_pointers_are_not_direct_mapped() {
        let mut x = 0u8;
        assert_eq!(HhdmPhysMapper.virt_to_phys(NonNull::from(&mut x)), None);
    }
}
