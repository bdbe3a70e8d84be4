//! # Typed Memory Addresses
//!
//! Thin newtypes that keep the memory subsystem honest about which kind of
//! number it is holding:
//!
//! - [`PhysicalAddress`] — a location in host RAM.
//! - [`PageFrameNumber`] — a physical 4 KiB frame, i.e. a physical address
//!   with the low [`PAGE_SHIFT`] bits stripped.
//! - [`VirtualAddress`] — a location in some address space.
//! - [`VirtualRange`] — a page-aligned `[base, base + size)` window of one
//!   address space.
//!
//! Mixing the two address kinds is a classic source of silent corruption;
//! carrying the intent in the type makes those bugs fail to compile.
//!
//! The crate also hosts the [`PhysMapper`] trait: the single seam through
//! which the rest of the subsystem turns a physical address into a usable
//! pointer (identity map, higher-half direct map, or a simulated RAM buffer
//! in host tests).
//!
//! The design assumes a flat physical address space describable by frame
//! numbers and a single 4 KiB page size.

#![cfg_attr(not(test), no_std)]

mod address;
mod mapper;
mod range;

pub use address::{PageFrameNumber, PhysicalAddress, VirtualAddress};
pub use mapper::{PhysMapper, copy_frame, frame_bytes, zero_frame};
pub use range::VirtualRange;

/// Log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of one page/frame in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// [`PAGE_SIZE`] as a `usize`, for indexing and buffer types.
pub const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(4096, 4096), 4096);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + (a - 1)` must not overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0, 4096), 0);
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(4097, 4096), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    (x + a - 1) & !(a - 1)
}

/// Whether `x` is a multiple of the page size.
///
/// ```rust
/// # use kernel_memory_addresses::is_page_aligned;
/// assert!(is_page_aligned(0));
/// assert!(is_page_aligned(0x3000));
/// assert!(!is_page_aligned(0x3001));
/// ```
#[inline(always)]
#[must_use]
pub const fn is_page_aligned(x: u64) -> bool {
    x & (PAGE_SIZE - 1) == 0
}
