//! # Physical Frame Allocator
//!
//! Tracks every physical 4 KiB frame the boot memory map hands us and owns
//! the lifetime of frames that are in use:
//!
//! - [`PhysicalRegion`] — one contiguous run of frames with a bitmap of
//!   free/used state behind its own [`SpinLock`](kernel_sync::SpinLock), so
//!   allocation on one region never contends with another.
//! - [`PhysicalPage`] / [`PageRef`] — an allocated frame. `PageRef` is an
//!   `Arc`, and the `Arc` strong count *is* the frame's reference count:
//!   when the last holder drops, the frame returns to its region's bitmap
//!   automatically.
//! - [`FrameAllocator`] — the facade over all regions: single frames,
//!   eagerly zeroed frames, physically contiguous runs for DMA-capable
//!   backing objects, and total/free/used accounting.
//!
//! Allocation never blocks; it fails fast with [`OutOfMemory`] and the
//! caller decides what that means (syscall error or fault signal).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod allocator;
mod boot_map;
mod page;
mod region;

pub use allocator::FrameAllocator;
pub use boot_map::{MemoryKind, MemoryMapEntry};
pub use page::{PageRef, PhysicalPage, ref_count};
pub use region::PhysicalRegion;

/// Physical frame or metadata allocation failed. Recoverable; never panics
/// the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of physical memory")]
pub struct OutOfMemory;
