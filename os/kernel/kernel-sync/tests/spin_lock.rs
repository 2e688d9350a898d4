use kernel_sync::{SpinLock, SyncOnceCell};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::{panic, thread};

#[test]
fn guard_releases_on_drop() {
    let l = SpinLock::new(0_u32);
    {
        let mut g = l.lock();
        *g = 41;
        assert!(l.is_locked());
    }
    assert!(!l.is_locked());
    *l.lock() += 1;
    assert_eq!(l.into_inner(), 42);
}

#[test]
fn try_lock_fails_while_held() {
    let l = SpinLock::new(1u8);
    let held = l.try_lock().expect("uncontended try_lock");
    assert!(l.try_lock().is_none());
    drop(held);
    assert!(l.try_lock().is_some());
}

#[test]
fn with_lock_returns_closure_result() {
    let l = SpinLock::new(Vec::<u64>::new());
    let len = l.with_lock(|v| {
        v.extend([1, 2, 3]);
        v.len()
    });
    assert_eq!(len, 3);
    assert_eq!(l.lock().as_slice(), &[1, 2, 3]);
}

#[test]
fn contended_counter_is_exact() {
    let threads = 8;
    let iters = 5_000;

    let lock = Arc::new(SpinLock::new(0usize));
    let in_cs = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let in_cs = Arc::clone(&in_cs);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..iters {
                    lock.with_lock(|v| {
                        assert_eq!(in_cs.fetch_add(1, Ordering::SeqCst), 0);
                        *v += 1;
                        in_cs.fetch_sub(1, Ordering::SeqCst);
                    });
                    thread::yield_now();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(lock.with_lock(|v| *v), threads * iters);
}

#[test]
fn panic_inside_critical_section_unlocks() {
    let l = SpinLock::new(0u32);
    let res = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        l.with_lock(|v| {
            *v = 123;
            panic!("boom");
        });
    }));
    assert!(res.is_err());
    assert_eq!(l.with_lock(|v| *v), 123);
}

#[test]
fn once_cell_set_is_first_writer_wins() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(7u32), Ok(&7));
    assert_eq!(cell.set(8u32), Err(8));
    assert_eq!(*cell.get_or_init(|| 9), 7);
    assert!(cell.is_initialized());
}

#[test]
fn once_cell_initializes_once_under_contention() {
    let cell = Arc::new(SyncOnceCell::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cell = Arc::clone(&cell);
            let calls = Arc::clone(&calls);
            thread::spawn(move || {
                *cell.get_or_init(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    String::from("mm")
                }) == "mm"
            })
        })
        .collect();
    for h in handles {
        assert!(h.join().unwrap());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
