//! # Boot allocator
//!
//! A bump allocator over one reserved physical range, used before the page
//! allocator exists.
//!
//! ```text
//! start                                                            end
//! ┌──────────────────┬──────────────────────────┬──────────────────┐
//! │ permanent  ───►  │           free           │  ◄─── temporary  │
//! └──────────────────┴──────────────────────────┴──────────────────┘
//!                    perm                       temp
//! ```
//!
//! Permanent allocations (descriptor arena, section table) are never freed.
//! Everything from the first page after the permanent part to `end` goes to
//! the page allocator once it is live, temporary allocations included.

use crate::addr::{PhysAddr, align_down, align_up};
use kernel_info::memory::PAGE_SIZE;
use log::debug;

#[derive(Debug)]
pub struct BootMem {
    start: u64,
    end: u64,
    perm: u64,
    temp: u64,
    retired: bool,
}

impl BootMem {
    /// # Panics
    /// Panics on an empty or inverted range.
    #[must_use]
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        let start = align_up(start.as_u64(), PAGE_SIZE);
        let end = align_down(end.as_u64(), PAGE_SIZE);
        assert!(start < end, "boot memory area {start:#x}..{end:#x} is empty");
        Self {
            start,
            end,
            perm: start,
            temp: end,
            retired: false,
        }
    }

    fn assert_live(&self) {
        assert!(
            !self.retired,
            "BUG: boot allocator used after the page allocator went live"
        );
    }

    #[must_use]
    pub const fn start(&self) -> PhysAddr {
        PhysAddr::new(self.start)
    }

    #[must_use]
    pub const fn end(&self) -> PhysAddr {
        PhysAddr::new(self.end)
    }

    /// Bytes between the two cursors.
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.temp - self.perm
    }

    /// # Panics
    /// Panics when the boot area is exhausted or already retired.
    pub fn alloc_permanent(&mut self, size: u64, align: u64) -> PhysAddr {
        self.assert_live();
        let at = align_up(self.perm, align.max(1));
        let end = at.checked_add(size);
        match end {
            Some(end) if end <= self.temp => {
                self.perm = end;
                PhysAddr::new(at)
            }
            _ => panic!(
                "boot memory exhausted: permanent {size:#x} bytes, {:#x} left",
                self.remaining()
            ),
        }
    }

    /// # Panics
    /// Panics when the boot area is exhausted or already retired.
    pub fn alloc_temporary(&mut self, size: u64, align: u64) -> PhysAddr {
        self.assert_live();
        let at = self
            .temp
            .checked_sub(size)
            .map(|top| align_down(top, align.max(1)));
        match at {
            Some(at) if at >= self.perm => {
                self.temp = at;
                PhysAddr::new(at)
            }
            _ => panic!(
                "boot memory exhausted: temporary {size:#x} bytes, {:#x} left",
                self.remaining()
            ),
        }
    }

    /// Permanent table of `bucket_size << order` bytes, with the largest
    /// `order <= max_order` that uses at most half of what is left.
    ///
    /// # Panics
    /// Panics if not even a single bucket fits.
    pub fn alloc_stretch(&mut self, bucket_size: u64, max_order: u8) -> (PhysAddr, u8) {
        self.assert_live();
        let budget = self
            .temp
            .saturating_sub(align_up(self.perm, PAGE_SIZE))
            / 2;
        // orders whose size does not fit in a u64 are skipped
        let fit = (0..=max_order).rev().find_map(|o| {
            let bytes = 1u64
                .checked_shl(u32::from(o))
                .and_then(|buckets| bucket_size.checked_mul(buckets))?;
            (bytes <= budget).then_some((o, bytes))
        });
        let Some((order, bytes)) = fit else {
            panic!("boot memory exhausted: no room for a {bucket_size}-byte bucket");
        };
        let pa = self.alloc_permanent(bytes, PAGE_SIZE);
        debug!("boot stretch table: {} buckets at {pa}", 1u64 << order);
        (pa, order)
    }

    /// Ends the boot allocator's life and returns the page range to hand to
    /// the page allocator.
    pub(crate) fn retire(&mut self) -> (PhysAddr, PhysAddr) {
        self.assert_live();
        self.retired = true;
        (
            PhysAddr::new(align_up(self.perm, PAGE_SIZE)),
            PhysAddr::new(self.end),
        )
    }
}
