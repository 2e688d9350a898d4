//! Poisoning, red zones and call-site tracking.

use super::layout::{SlotLayout, TRACK_SIZE};
use core::panic::Location;
use core::ptr::NonNull;

/// Fill of a freed object.
pub const POISON_FREE: u8 = 0x6b;
/// Last byte of a freed object.
pub const POISON_END: u8 = 0xa5;
/// Red zone of an object in use.
pub const RED_ACTIVE: u8 = 0xcc;
/// Red zone of a free object.
pub const RED_INACTIVE: u8 = 0xbb;

/// A recorded allocation or free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackRecord {
    pub location: &'static Location<'static>,
    pub cpu: usize,
}

/// Last allocation and free of an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectTrack {
    pub alloc: Option<TrackRecord>,
    pub free: Option<TrackRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedZone {
    Active,
    Inactive,
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackKind {
    Alloc = 0,
    Free = 1,
}

/// # Safety
/// `slot` must point to a mapped slot of `layout` owned by the caller.
unsafe fn bytes<'a>(slot: NonNull<u8>, start: usize, end: usize) -> &'a mut [u8] {
    // SAFETY: forwarded to the caller.
    unsafe { core::slice::from_raw_parts_mut(slot.as_ptr().add(start), end - start) }
}

/// # Safety
/// See [`bytes`].
pub(crate) unsafe fn set_red_zone(layout: &SlotLayout, slot: NonNull<u8>, pattern: u8) {
    // SAFETY: forwarded to the caller.
    unsafe { bytes(slot, layout.object_size, layout.red_zone_end) }.fill(pattern);
}

/// # Safety
/// See [`bytes`].
pub(crate) unsafe fn check_red_zone(layout: &SlotLayout, slot: NonNull<u8>) -> RedZone {
    // SAFETY: forwarded to the caller.
    let zone = unsafe { bytes(slot, layout.object_size, layout.red_zone_end) };
    if zone.iter().all(|&b| b == RED_ACTIVE) {
        RedZone::Active
    } else if zone.iter().all(|&b| b == RED_INACTIVE) {
        RedZone::Inactive
    } else {
        RedZone::Corrupt
    }
}

/// # Safety
/// See [`bytes`].
pub(crate) unsafe fn poison(layout: &SlotLayout, slot: NonNull<u8>) {
    // SAFETY: forwarded to the caller.
    let object = unsafe { bytes(slot, 0, layout.object_size) };
    object.fill(POISON_FREE);
    if let Some(last) = object.last_mut() {
        *last = POISON_END;
    }
}

/// Offset of the first byte that differs from the poison pattern.
///
/// # Safety
/// See [`bytes`].
pub(crate) unsafe fn check_poison(layout: &SlotLayout, slot: NonNull<u8>) -> Option<usize> {
    // SAFETY: forwarded to the caller.
    let object = unsafe { bytes(slot, 0, layout.object_size) };
    let last = object.len() - 1;
    object.iter().enumerate().find_map(|(i, &b)| {
        let want = if i == last { POISON_END } else { POISON_FREE };
        (b != want).then_some(i)
    })
}

/// # Safety
/// See [`bytes`].
pub(crate) unsafe fn clear_tracks(layout: &SlotLayout, slot: NonNull<u8>) {
    if let Some(offset) = layout.track {
        // SAFETY: forwarded to the caller.
        unsafe { bytes(slot, offset, offset + 2 * TRACK_SIZE) }.fill(0);
    }
}

/// # Safety
/// See [`bytes`].
pub(crate) unsafe fn write_track(
    layout: &SlotLayout,
    slot: NonNull<u8>,
    kind: TrackKind,
    location: &'static Location<'static>,
    cpu: usize,
) {
    let Some(offset) = layout.track else {
        return;
    };
    let words = [
        core::ptr::from_ref(location).expose_provenance() as u64,
        cpu as u64 + 1,
    ];
    // SAFETY: the track area is 8-byte aligned and inside the slot.
    unsafe {
        let at = slot
            .as_ptr()
            .add(offset + kind as usize * TRACK_SIZE)
            .cast::<[u64; 2]>();
        at.write(words);
    }
}

/// # Safety
/// See [`bytes`]; the track area must only have been written by
/// [`write_track`].
pub(crate) unsafe fn read_track(layout: &SlotLayout, slot: NonNull<u8>, kind: TrackKind) -> Option<TrackRecord> {
    let offset = layout.track?;
    // SAFETY: as in `write_track`.
    let [addr, cpu] = unsafe {
        slot.as_ptr()
            .add(offset + kind as usize * TRACK_SIZE)
            .cast::<[u64; 2]>()
            .read()
    };
    if cpu == 0 {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let ptr = core::ptr::with_exposed_provenance::<Location<'static>>(addr as usize);
    // SAFETY: `addr` was exposed from a `&'static Location` in `write_track`.
    let location = unsafe { &*ptr };
    #[allow(clippy::cast_possible_truncation)]
    let cpu = (cpu - 1) as usize;
    Some(TrackRecord { location, cpu })
}
