//! Slot layout and slab sizing.
//!
//! ```text
//!  slot (slot_size bytes, aligned to `align`)
//! ┌──────────────────┬────────────┬──────────┬──────────────────────┬─────┐
//! │ object           │  red zone  │ free ptr │ alloc / free tracks  │ pad │
//! │ object_size      │ RED_ZONE   │ (debug)  │ STORE_USER           │     │
//! └──────────────────┴────────────┴──────────┴──────────────────────┴─────┘
//! ```
//!
//! Without debug flags or constructor the free pointer lives in the first
//! word of the object itself.

use super::HiveFlags;
use crate::config::MemConfig;
use crate::error::HiveError;
use kernel_info::memory::{MAX_ORDER, PAGE_SIZE};

#[allow(clippy::cast_possible_truncation)]
const PAGE: usize = PAGE_SIZE as usize;

/// Bytes of one recorded call site.
pub(crate) const TRACK_SIZE: usize = 16;

/// Guard word placed after the rounded-up object.
const RED_ZONE_WORD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLayout {
    pub object_size: usize,
    pub slot_size: usize,
    pub align: usize,
    pub order: u8,
    pub objects: u32,
    /// Offset of the free pointer within a slot.
    pub(crate) free_ptr: usize,
    /// Red zone is `[object_size, red_zone_end)`; empty without `RED_ZONE`.
    pub(crate) red_zone_end: usize,
    /// Offset of the two call-site records.
    pub(crate) track: Option<usize>,
}

impl SlotLayout {
    /// # Errors
    /// Rejects empty objects, bad alignments, explicit orders without room
    /// for a single slot and slots larger than the largest block.
    pub fn compute(
        object_size: usize,
        align: usize,
        flags: HiveFlags,
        has_ctor: bool,
        order: Option<u8>,
        config: &MemConfig,
    ) -> Result<Self, HiveError> {
        if object_size == 0 {
            return Err(HiveError::ZeroSize);
        }
        if !align.is_power_of_two() || align > PAGE {
            return Err(HiveError::BadAlign(align));
        }
        let align = align.max(8);
        let max_block = PAGE << (MAX_ORDER - 1);
        if object_size > max_block {
            return Err(HiveError::TooLarge {
                slot_size: object_size,
            });
        }

        let mut offset = object_size.next_multiple_of(8);
        let red_zone_end = if flags.contains(HiveFlags::RED_ZONE) {
            offset += RED_ZONE_WORD;
            offset
        } else {
            object_size
        };
        let free_ptr = if has_ctor || flags.intersects(HiveFlags::POISON | HiveFlags::RED_ZONE) {
            offset += 8;
            offset - 8
        } else {
            0
        };
        let track = flags.contains(HiveFlags::STORE_USER).then(|| {
            offset += 2 * TRACK_SIZE;
            offset - 2 * TRACK_SIZE
        });
        let slot_size = offset.next_multiple_of(align);

        let (order, objects) = match order {
            Some(order) => {
                let objects = objects_in(order, slot_size);
                if objects == 0 {
                    return Err(HiveError::ZeroCapacity { slot_size, order });
                }
                (order, objects)
            }
            None => slab_order(slot_size, config.hive_max_order, config.hive_min_objects)?,
        };

        Ok(Self {
            object_size,
            slot_size,
            align,
            order,
            objects,
            free_ptr,
            red_zone_end,
            track,
        })
    }

    /// Whether the free pointer overlaps the object.
    #[must_use]
    pub const fn inline_free_ptr(&self) -> bool {
        self.free_ptr < self.object_size
    }

    /// Byte offset of slot `index` from the start of the slab.
    #[inline]
    #[must_use]
    pub const fn slot_offset(&self, index: u64) -> u64 {
        index * self.slot_size as u64
    }
}

fn objects_in(order: u8, slot_size: usize) -> u32 {
    if usize::from(order) >= MAX_ORDER {
        return 0;
    }
    u32::try_from((PAGE << order) / slot_size).unwrap_or(u32::MAX)
}

/// Smallest order that fits `min_objects` slots while wasting at most an
/// eighth of the slab. The object target is halved down to one before
/// settling for any order that fits a single slot.
fn slab_order(slot_size: usize, max_order: u8, min_objects: u32) -> Result<(u8, u32), HiveError> {
    #[allow(clippy::cast_possible_truncation)]
    let max_order = max_order.min((MAX_ORDER - 1) as u8);
    let mut wanted = min_objects.max(1);
    loop {
        for order in 0..=max_order {
            let objects = objects_in(order, slot_size);
            let bytes = PAGE << order;
            let waste = bytes - objects as usize * slot_size;
            if objects >= wanted && waste * 8 <= bytes {
                return Ok((order, objects));
            }
        }
        if wanted == 1 {
            break;
        }
        wanted /= 2;
    }
    #[allow(clippy::cast_possible_truncation)]
    (0..MAX_ORDER as u8)
        .map(|order| (order, objects_in(order, slot_size)))
        .find(|&(_, objects)| objects > 0)
        .ok_or(HiveError::TooLarge { slot_size })
}

/// Partial slabs kept around per node: grows with the object size.
pub(crate) fn default_min_partial(object_size: usize) -> usize {
    (object_size.ilog2() / 2).clamp(5, 10) as usize
}
