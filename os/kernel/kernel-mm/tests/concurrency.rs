mod common;

use common::{MIB, TestPhys, boot};
use kernel_mm::{Collaborators, CpuTopology, HiveConfig, MemConfig, PafFlags};
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::{Barrier, Mutex};
use std::thread;

thread_local! {
    static CPU: Cell<usize> = const { Cell::new(0) };
}

/// Every test thread plays one CPU.
struct ThreadCpus;

impl CpuTopology for ThreadCpus {
    fn current_cpu(&self) -> usize {
        CPU.with(Cell::get)
    }
}

struct SendPtr(NonNull<u8>);

unsafe impl Send for SendPtr {}

#[test]
fn cpus_allocate_and_free_concurrently() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 300;

    let phys = TestPhys::new(16 * MIB);
    let config = MemConfig {
        min_free_pages: Some(0),
        pcp_batch: Some(8),
        ..MemConfig::default()
    };
    let collab = Collaborators {
        topology: &ThreadCpus,
        ..Collaborators::default()
    };
    let mm = boot(&phys, config, collab);
    let free = mm.nr_free_pages();
    let hive = mm
        .hive_create_with(HiveConfig {
            min_partial: Some(1),
            ..HiveConfig::new("shared", 72)
        })
        .unwrap();

    // objects each thread hands to its neighbour for a remote free
    let mailboxes: Vec<Mutex<Vec<SendPtr>>> = (0..THREADS).map(|_| Mutex::default()).collect();
    let start = Barrier::new(THREADS);

    thread::scope(|s| {
        for cpu in 0..THREADS {
            let (mm, hive, mailboxes, start) = (&mm, &hive, &mailboxes, &start);
            s.spawn(move || {
                CPU.with(|c| c.set(cpu + 1));
                start.wait();
                let mut pages = Vec::new();
                let mut objs = Vec::new();
                for round in 0..ROUNDS {
                    let flags = if round % 2 == 0 {
                        PafFlags::KERNEL | PafFlags::HOT
                    } else {
                        PafFlags::KERNEL
                    };
                    let order = u8::try_from(round % 3).unwrap();
                    pages.push((mm.alloc_page_frames(None, flags, order).unwrap(), order));
                    objs.push(mm.hive_alloc(hive, PafFlags::KERNEL).unwrap());
                    let small = mm.kmalloc(24 + round % 200, PafFlags::KERNEL).unwrap();
                    mm.kfree(small);

                    if round % 4 == 3 {
                        let (pfn, order) = pages.swap_remove(0);
                        if order == 0 {
                            mm.free_hot_page(pfn);
                        } else {
                            mm.free_page_frames(pfn, order);
                        }
                        let neighbour = (cpu + 1) % THREADS;
                        mailboxes[neighbour]
                            .lock()
                            .unwrap()
                            .push(SendPtr(objs.pop().unwrap()));
                    }
                    let inbox: Vec<_> = mailboxes[cpu].lock().unwrap().drain(..).collect();
                    for SendPtr(obj) in inbox {
                        mm.hive_free(hive, obj);
                    }
                }
                for (pfn, order) in pages {
                    mm.free_page_frames(pfn, order);
                }
                for obj in objs {
                    mm.hive_free(hive, obj);
                }
            });
        }
    });

    for mailbox in &mailboxes {
        for SendPtr(obj) in mailbox.lock().unwrap().drain(..) {
            mm.hive_free(&hive, obj);
        }
    }
    assert_eq!(hive.stats().objects_in_use, 0);
    mm.hive_destroy(hive).unwrap();
    mm.drain_all_pages();
    for size in kernel_mm::KMALLOC_SIZES {
        mm.hive_shrink(mm.kmalloc_hive(size).unwrap());
    }
    assert_eq!(mm.nr_free_pages(), free);
    mm.check_free_lists().for_each(drop);
}
