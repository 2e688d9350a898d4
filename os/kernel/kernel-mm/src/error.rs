use crate::addr::PhysAddr;

/// Why a memory region was not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("region table is full ({max} entries), dropping {base} +{size:#x}")]
    TableFull { base: PhysAddr, size: u64, max: usize },
    #[error("region {base} +{size:#x} holds no whole page")]
    Empty { base: PhysAddr, size: u64 },
    #[error("region {base} +{size:#x} overlaps a registered region")]
    Overlap { base: PhysAddr, size: u64 },
    #[error("node {node} is out of range")]
    InvalidNode { node: usize },
}

/// Why a hive could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HiveError {
    #[error("object size must be non-zero")]
    ZeroSize,
    #[error("alignment {0} is not a power of two no larger than a page")]
    BadAlign(usize),
    #[error("a slab of order {order} holds no {slot_size}-byte slot")]
    ZeroCapacity { slot_size: usize, order: u8 },
    #[error("{slot_size}-byte slots do not fit any slab order")]
    TooLarge { slot_size: usize },
    #[error("all {0} hive ids are in use")]
    OutOfIds(usize),
}

/// [`install_global`](crate::global::install_global) was called twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("a global memory subsystem is already installed")]
pub struct AlreadyInstalled;
