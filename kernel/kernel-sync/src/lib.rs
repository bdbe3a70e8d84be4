//! # Kernel Synchronization Primitives
//!
//! Spin-based mutual exclusion for the memory subsystem. Every shared
//! structure in the VM layer is guarded by a [`SpinLock`]:
//!
//! - one lock per physical region's frame bitmap,
//! - one lock per address space (regions, range allocator, page directory),
//! - one lock per backing object's page-slot vector.
//!
//! ## Lock ordering
//!
//! To stay deadlock-free, code must acquire locks in this order and never
//! the reverse:
//!
//! 1. address-space lock
//! 2. backing-object slot lock
//! 3. physical-region bitmap lock
//!
//! The fault path additionally drops the address-space lock before any
//! operation that can block the calling thread (demand-paging I/O) and
//! re-validates afterwards.

#![cfg_attr(not(test), no_std)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
