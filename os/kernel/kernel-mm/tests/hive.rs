mod common;

use common::{MIB, TestPhys, boot, no_reserve};
use kernel_mm::{
    Collaborators, Hive, HiveConfig, HiveError, HiveFlags, KMALLOC_MAX_CACHE_SIZE, KMALLOC_SIZES,
    MemorySubsystem, PafFlags,
};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

fn obj64(min_partial: Option<usize>) -> HiveConfig {
    HiveConfig {
        order: Some(0),
        min_partial,
        ..HiveConfig::new("obj64", 64)
    }
}

fn alloc_n(mm: &MemorySubsystem<'_, TestPhys>, hive: &Hive, n: usize) -> Vec<NonNull<u8>> {
    (0..n)
        .map(|_| mm.hive_alloc(hive, PafFlags::KERNEL).unwrap())
        .collect()
}

#[test]
fn slab_overflow_takes_a_second_slab() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create_with(obj64(None)).unwrap();
    assert_eq!(hive.layout().objects, 64);

    let objs = alloc_n(&mm, &hive, 65);
    let stats = hive.stats();
    assert_eq!(stats.slabs_allocated, 2);
    assert_eq!(stats.objects_in_use, 65);

    let mut sorted: Vec<_> = objs.iter().map(|p| p.as_ptr() as usize).collect();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 65, "objects are distinct");
    assert!(sorted.iter().all(|a| a % 8 == 0));

    for obj in objs {
        mm.hive_free(&hive, obj);
    }
    assert_eq!(hive.stats().objects_in_use, 0);
    assert_eq!(mm.hive_cpu_free(&hive, 0), 0);
    mm.hive_destroy(hive).unwrap();
}

#[test]
fn empty_slabs_are_released_beyond_min_partial() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let free = mm.nr_free_pages();

    let eager = mm.hive_create_with(obj64(Some(0))).unwrap();
    let obj = mm.hive_alloc(&eager, PafFlags::KERNEL).unwrap();
    assert_eq!(mm.nr_free_pages(), free - 1);
    mm.hive_free(&eager, obj);
    assert_eq!(eager.stats().slabs_freed, 1);
    assert_eq!(eager.stats().partial_slabs, 0);
    assert_eq!(mm.nr_free_pages(), free);

    let keeper = mm.hive_create_with(obj64(None)).unwrap();
    assert_eq!(keeper.min_partial(), 5);
    let obj = mm.hive_alloc(&keeper, PafFlags::KERNEL).unwrap();
    mm.hive_free(&keeper, obj);
    assert_eq!(keeper.stats().slabs_freed, 0);
    assert_eq!(keeper.stats().partial_slabs, 1);
    assert_eq!(mm.nr_free_pages(), free - 1);

    assert_eq!(mm.hive_shrink(&keeper), 1);
    assert_eq!(mm.nr_free_pages(), free);
    mm.hive_destroy(eager).unwrap();
    mm.hive_destroy(keeper).unwrap();
}

#[test]
fn freed_objects_are_reused_first() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create("lifo", 48, 8, HiveFlags::empty(), None).unwrap();

    let objs = alloc_n(&mm, &hive, 4);
    mm.hive_free(&hive, objs[2]);
    mm.hive_free(&hive, objs[1]);
    assert_eq!(mm.hive_alloc(&hive, PafFlags::KERNEL), Some(objs[1]));
    assert_eq!(mm.hive_alloc(&hive, PafFlags::KERNEL), Some(objs[2]));
    assert_eq!(hive.stats().objects_in_use, 4);
    for obj in objs {
        mm.hive_free(&hive, obj);
    }
    mm.hive_destroy(hive).unwrap();
}

static CTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

fn ctor(obj: NonNull<u8>) {
    CTOR_CALLS.fetch_add(1, Ordering::SeqCst);
    unsafe { obj.as_ptr().write_bytes(0x11, 32) };
}

#[test]
fn constructor_runs_once_per_slot() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm
        .hive_create("ctor", 32, 8, HiveFlags::POISON, Some(ctor))
        .unwrap();
    assert!(!hive.flags().contains(HiveFlags::POISON));
    assert!(!hive.layout().inline_free_ptr());

    let objs = alloc_n(&mm, &hive, 3);
    mm.hive_free(&hive, objs[0]);
    let again = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    assert_eq!(again, objs[0]);
    assert_eq!(CTOR_CALLS.load(Ordering::SeqCst), 3);
    // constructed state survives a free
    let bytes = unsafe { std::slice::from_raw_parts(again.as_ptr(), 32) };
    assert!(bytes.iter().all(|&b| b == 0x11));
}

#[test]
fn zeroed_objects() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create("zero", 100, 8, HiveFlags::empty(), None).unwrap();

    let a = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    unsafe { a.as_ptr().write_bytes(0xff, 100) };
    mm.hive_free(&hive, a);
    let b = mm.hive_alloc(&hive, PafFlags::KERNEL | PafFlags::ZERO).unwrap();
    assert_eq!(a, b);
    let bytes = unsafe { std::slice::from_raw_parts(b.as_ptr(), 100) };
    assert!(bytes.iter().all(|&x| x == 0));
}

#[test]
fn creation_rejects_impossible_layouts() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());

    let zero_cap = HiveConfig {
        order: Some(0),
        ..HiveConfig::new("huge", 8192)
    };
    assert!(matches!(
        mm.hive_create_with(zero_cap),
        Err(HiveError::ZeroCapacity { order: 0, .. })
    ));
    assert_eq!(
        mm.hive_create("empty", 0, 8, HiveFlags::empty(), None).unwrap_err(),
        HiveError::ZeroSize
    );
    assert_eq!(
        mm.hive_create("odd", 16, 24, HiveFlags::empty(), None).unwrap_err(),
        HiveError::BadAlign(24)
    );
}

#[test]
fn destroy_refuses_while_objects_are_live() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let free = mm.nr_free_pages();
    let hive = mm.hive_create_with(obj64(None)).unwrap();

    let obj = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    let busy = mm.hive_destroy(hive).unwrap_err();
    assert_eq!(busy.in_use, 1);
    assert!(busy.to_string().contains("obj64"));

    let hive = busy.hive;
    mm.hive_free(&hive, obj);
    mm.hive_destroy(hive).unwrap();
    assert_eq!(mm.nr_free_pages(), free);
}

#[test]
fn remote_frees_reach_the_slab() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create_with(obj64(Some(0))).unwrap();

    // fill the first slab so it is retired full, then free into it
    let first = alloc_n(&mm, &hive, 64);
    let extra = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    assert_eq!(hive.stats().partial_slabs, 0);

    mm.hive_free(&hive, first[10]);
    assert_eq!(hive.stats().partial_slabs, 1, "full slab rejoins the partial list");
    for &obj in &first[..10] {
        mm.hive_free(&hive, obj);
    }
    for &obj in &first[11..] {
        mm.hive_free(&hive, obj);
    }
    assert_eq!(hive.stats().slabs_freed, 1);
    assert_eq!(hive.stats().partial_slabs, 0);

    mm.hive_free(&hive, extra);
    assert_eq!(hive.stats().objects_in_use, 0);
    mm.hive_destroy(hive).unwrap();
}

#[test]
fn store_user_records_call_sites() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm
        .hive_create("tracked", 40, 8, HiveFlags::STORE_USER, None)
        .unwrap();

    let keep = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    let (obj, line) = (mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap(), line!());
    let track = mm.hive_object_track(&hive, obj).unwrap();
    let alloc = track.alloc.unwrap();
    assert_eq!(alloc.location.line(), line);
    assert!(alloc.location.file().ends_with("hive.rs"));
    assert_eq!(alloc.cpu, 0);
    assert!(track.free.is_none());

    let free_line = line!() + 1;
    mm.hive_free(&hive, obj);
    let track = mm.hive_object_track(&hive, obj).unwrap();
    assert_eq!(track.free.unwrap().location.line(), free_line);

    let plain = mm.hive_create("plain", 40, 8, HiveFlags::empty(), None).unwrap();
    let other = mm.hive_alloc(&plain, PafFlags::KERNEL).unwrap();
    assert!(mm.hive_object_track(&plain, other).is_none());
    mm.hive_free(&plain, other);
    mm.hive_free(&hive, keep);
}

#[test]
#[should_panic(expected = "double free")]
fn red_zone_catches_double_free() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create("rz", 60, 8, HiveFlags::RED_ZONE, None).unwrap();
    let _keep = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    let obj = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    mm.hive_free(&hive, obj);
    mm.hive_free(&hive, obj);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_behind_the_freelist_head_is_fatal() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create("plain", 64, 8, HiveFlags::empty(), None).unwrap();
    let objs = alloc_n(&mm, &hive, 4);
    mm.hive_free(&hive, objs[0]);
    mm.hive_free(&hive, objs[1]);
    mm.hive_free(&hive, objs[0]);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_to_a_parked_slab_is_fatal() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create("plain", 64, 8, HiveFlags::empty(), None).unwrap();
    let objs = alloc_n(&mm, &hive, 4);
    mm.hive_free(&hive, objs[0]);
    mm.hive_free(&hive, objs[1]);
    // the active slab moves to the partial list with its freelist
    assert_eq!(mm.hive_shrink(&hive), 0);
    mm.hive_free(&hive, objs[0]);
}

#[test]
#[should_panic(expected = "overwritten")]
fn red_zone_catches_overruns() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create("rz", 60, 8, HiveFlags::RED_ZONE, None).unwrap();
    let obj = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    unsafe { obj.as_ptr().add(60).write(0) };
    mm.hive_free(&hive, obj);
}

#[test]
#[should_panic(expected = "use after free")]
fn poison_catches_writes_after_free() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create("poison", 64, 8, HiveFlags::POISON, None).unwrap();
    let _keep = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    let obj = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    mm.hive_free(&hive, obj);
    unsafe { obj.as_ptr().add(5).write(1) };
    let _ = mm.hive_alloc(&hive, PafFlags::KERNEL);
}

#[test]
#[should_panic(expected = "not the start of a slot")]
fn interior_pointers_are_rejected() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create_with(obj64(None)).unwrap();
    let obj = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    mm.hive_free(&hive, unsafe { obj.add(8) });
}

#[test]
fn kmalloc_picks_the_smallest_class() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let free = mm.nr_free_pages();

    let small = mm.kmalloc(100, PafFlags::KERNEL).unwrap();
    assert_eq!(mm.ksize(small), 128);
    assert_eq!(mm.kmalloc_hive(100).unwrap().name(), "kmalloc-128");
    assert_eq!(mm.kmalloc_hive(8).unwrap().name(), "kmalloc-8");
    assert!(mm.kmalloc_hive(KMALLOC_MAX_CACHE_SIZE + 1).is_none());

    let aligned = mm.kmalloc_aligned(24, 64, PafFlags::KERNEL).unwrap();
    assert_eq!(aligned.as_ptr() as usize % 64, 0);
    assert_eq!(mm.ksize(aligned), 64);

    let zeroed = mm.kzalloc(300, PafFlags::KERNEL).unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(zeroed.as_ptr(), 300) };
    assert!(bytes.iter().all(|&b| b == 0));

    assert!(mm.kmalloc(0, PafFlags::KERNEL).is_none());
    assert!(mm.kmalloc_aligned(16, 3, PafFlags::KERNEL).is_none());

    mm.kfree(small);
    mm.kfree(aligned);
    mm.kfree(zeroed);
    for size in KMALLOC_SIZES {
        mm.hive_shrink(mm.kmalloc_hive(size).unwrap());
    }
    assert_eq!(mm.nr_free_pages(), free);
}

#[test]
fn large_kmalloc_uses_whole_pages() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let free = mm.nr_free_pages();

    let big = mm.kmalloc(KMALLOC_MAX_CACHE_SIZE + 1, PafFlags::KERNEL).unwrap();
    assert_eq!(mm.ksize(big), 16384);
    assert_eq!(big.as_ptr() as usize % 16384, 0);
    assert_eq!(mm.nr_free_pages(), free - 4);
    mm.kfree(big);
    assert_eq!(mm.nr_free_pages(), free);
}

#[test]
#[should_panic(expected = "kfree")]
fn kfree_of_a_plain_hive_object_is_fatal() {
    let phys = TestPhys::new(8 * MIB);
    let mm = boot(&phys, no_reserve(), Collaborators::default());
    let hive = mm.hive_create_with(obj64(None)).unwrap();
    let obj = mm.hive_alloc(&hive, PafFlags::KERNEL).unwrap();
    mm.kfree(obj);
}
