//! # Allocation flags and zone types

use bitflags::bitflags;
use kernel_info::memory::NR_ZONES;

bitflags! {
    /// Page/object allocation flags.
    ///
    /// Zone placement (`DMA`, `USER`), behaviour under pressure (`WAIT`,
    /// `EMERG`, `NOFAIL`) and cache hints (`HOT`, `COLD`) combine freely.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PafFlags: u32 {
        /// Memory must come from the DMA zone.
        const DMA = 1 << 0;
        /// Prefer the User zone (highest placement).
        const USER = 1 << 1;
        /// Zero the memory before returning it.
        const ZERO = 1 << 2;
        /// The allocation can be reclaimed later.
        const RECLAIMABLE = 1 << 3;
        /// Reclaim may start I/O.
        const IO = 1 << 4;
        /// Reclaim may call into the filesystem.
        const FS = 1 << 5;
        /// The caller may block waiting for memory.
        const WAIT = 1 << 6;
        /// May dip below the `min` watermark.
        const EMERG = 1 << 7;
        /// Order-0 request served from the cold per-CPU list.
        const COLD = 1 << 8;
        /// Order-0 request served from the hot per-CPU list.
        const HOT = 1 << 9;
        /// Retry until it succeeds.
        const NOFAIL = 1 << 10;
        /// Do not log allocation failures.
        const NOWARN = 1 << 11;

        const ATOMIC = 0;
        const NOIO = Self::WAIT.bits();
        const NOFS = Self::WAIT.bits() | Self::IO.bits();
        const KERNEL = Self::WAIT.bits() | Self::IO.bits() | Self::FS.bits();
        const USER_PAGE = Self::KERNEL.bits() | Self::USER.bits();
    }
}

impl PafFlags {
    /// Highest zone the request may be served from.
    #[must_use]
    pub const fn zone_type(self) -> ZoneType {
        if self.contains(Self::DMA) {
            ZoneType::Dma
        } else if self.contains(Self::USER) {
            ZoneType::User
        } else {
            ZoneType::Normal
        }
    }

    /// Flags that matter when a hive asks for backing pages.
    #[must_use]
    pub const fn for_slab_pages(self) -> Self {
        self.difference(Self::ZERO.union(Self::HOT).union(Self::COLD))
    }
}

/// Zone types, lowest placement first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ZoneType {
    Dma = 0,
    Normal = 1,
    User = 2,
}

impl ZoneType {
    pub const ALL: [Self; NR_ZONES] = [Self::Dma, Self::Normal, Self::User];

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// # Panics
    /// Panics on an index that does not name a zone.
    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Dma,
            1 => Self::Normal,
            2 => Self::User,
            _ => panic!("BUG: invalid zone index"),
        }
    }

    /// This zone and every zone below it, highest first.
    pub fn fallback(self) -> impl Iterator<Item = Self> {
        Self::ALL[..=self.index()].iter().rev().copied()
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dma => "DMA",
            Self::Normal => "Normal",
            Self::User => "User",
        }
    }
}
