//! # Virtual Memory Management
//!
//! The upper half of the memory subsystem: virtual range reservation,
//! memory-backing objects, regions, address spaces, and the page-fault
//! state machine that ties them to the physical layer.
//!
//! The moving parts, leaf-first:
//!
//! - [`VirtualRangeAllocator`] — finds and reserves non-overlapping
//!   virtual ranges inside one address space.
//! - [`VmObject`] — what fills a set of pages and how faults on them
//!   resolve: anonymous zero-fill, demand-paged file content (private
//!   copy-on-write or shared write-through), physically contiguous DMA
//!   memory, or purgeable memory the kernel may reclaim while volatile.
//! - [`Region`] — a backing object's pages bound into a virtual range
//!   with permissions and sharing mode; the unit of mmap/munmap/mprotect.
//! - [`AddressSpace`] — one process's page directory, range allocator and
//!   regions under a single lock.
//! - [`MemoryManager`] — the coordinator and fault handler.
//!
//! ## Ownership
//!
//! Regions hold counted references to objects; objects own their frames
//! through the slot `Arc`s; page directories record only frame numbers.
//! Lifetime is therefore explicit and the reference graph acyclic: when
//! the last region of an object goes, the object goes, and its frames
//! return to the allocator.
//!
//! ## The fault path
//!
//! A fault never crosses the kernel boundary as an exception: the state
//! machine in [`MemoryManager::page_fault`] returns a [`FaultOutcome`]
//! value and the trap dispatcher delivers the signal of a fatal one.
//! Faults resolve against the backing object without the address-space
//! lock held, so demand-paging I/O blocks only the faulting thread.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod collab;
mod error;
mod manager;
mod object;
mod range_alloc;
mod region;
mod space;

pub use collab::{FaultSignal, InodeId, IoHandle, PageStore, ThreadId, ThreadServices};
pub use error::{FaultError, FaultOutcome, IoError, RangeError, VmError};
pub use manager::{BackingSpec, MemoryManager, PurgeConfig, Sharing};
pub use object::{
    ContentState, PageSlot, ResolveContext, ResolvedPage, VmObject, VmObjectKind,
};
pub use range_alloc::VirtualRangeAllocator;
pub use region::Region;
pub use space::AddressSpace;

use bitflags::bitflags;

bitflags! {
    /// Permission bits of a region.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Access: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// The access a faulting instruction attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    /// The permission this access requires of the region.
    #[must_use]
    pub fn required(self) -> Access {
        match self {
            Self::Read => Access::READ,
            Self::Write => Access::WRITE,
            Self::Execute => Access::EXECUTE,
        }
    }
}

/// Privilege of the faulting context, as reported by the trap dispatcher.
/// A kernel-mode fault on an unmapped address is a kernel bug and fatal
/// to the kernel; the same fault from user code is fatal only to the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultContext {
    User,
    Kernel,
}
