//! # Kernel synchronization primitives
//!
//! The memory subsystem runs without a scheduler underneath it, so every
//! primitive here is a busy-waiting one:
//!
//! * [`SpinLock`] guards zone free lists and hive partial lists.
//! * [`PerCpu`] holds per-CPU state (page caches, active slabs); pinning a
//!   slot stands in for disabling preemption on the owning CPU.
//! * [`WaitQueue`] lets an allocator that ran out of memory wait for the next
//!   free without holding any lock.
//! * [`SyncOnceCell`] anchors the global memory subsystem.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod per_cpu;
mod spin_lock;
mod sync_once_cell;
mod wait_queue;

pub use per_cpu::{PerCpu, PerCpuGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
pub use wait_queue::{WaitQueue, WaitTicket};
