//! # Page Directory Management
//!
//! The hardware-facing translation structure for one address space, using a
//! two-level scheme over a 32-bit virtual window:
//!
//! ```text
//! | 31‒22     | 21‒12    | 11‒0   |
//! | directory | table    | offset |
//! ```
//!
//! A 1024-entry page directory points at 1024-entry page tables; every leaf
//! maps one 4 KiB page. Directory and table frames live in physical memory
//! and are reached through the [`PhysMapper`] seam, so the same code runs
//! against real paging structures in the kernel and against simulated RAM
//! in host tests.
//!
//! The upper quarter of the window (above [`KERNEL_BASE`]) is the kernel
//! half: its page tables are built once at boot as a [`KernelTables`]
//! template and aliased read-only into every address space's directory, so
//! kernel mappings are permanent and identical everywhere.
//!
//! ## TLB discipline
//!
//! Every mutation ([`PageDirectory::map`], [`unmap`](PageDirectory::unmap),
//! [`set_flags`](PageDirectory::set_flags)) invalidates the affected
//! translation through [`TlbMaintenance`] **before returning**, and callers
//! perform mutations under the owning address space's lock. Together this
//! guarantees no CPU can observe a half-updated table: the shootdown has
//! completed on every CPU before the lock is released. Stale translations
//! are a silent-corruption hazard, not a performance detail.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod directory;
mod entry;

pub use directory::{KernelTables, PageDirectory};
pub use entry::{EntryFlags, PageEntryBits, PageTable, TABLE_ENTRIES};

use kernel_memory_addresses::{PageFrameNumber, VirtualAddress};

/// First virtual address of the kernel half.
pub const KERNEL_BASE: u64 = 0xC000_0000;

/// One past the last virtual address of the two-level window.
pub const ADDRESS_SPACE_END: u64 = 0x1_0000_0000;

/// Directory slot of the first kernel-half table.
pub const KERNEL_SPLIT_SLOT: u32 = (KERNEL_BASE >> 22) as u32;

/// Directory slot (bits 31..22) of a virtual address.
#[inline]
#[must_use]
pub const fn directory_index(va: VirtualAddress) -> u32 {
    debug_assert!(va.as_u64() < ADDRESS_SPACE_END);
    ((va.as_u64() >> 22) & 0x3FF) as u32
}

/// Table slot (bits 21..12) of a virtual address.
#[inline]
#[must_use]
pub const fn table_index(va: VirtualAddress) -> u32 {
    ((va.as_u64() >> 12) & 0x3FF) as u32
}

/// Translation-cache maintenance collaborator.
///
/// Implementations broadcast the invalidation to **every** CPU that may
/// hold a cached translation for the given address space (an IPI-based
/// shootdown on real hardware, a recording sink in tests) and must not
/// return until all of them acknowledged. The page directory calls this
/// while its owner still holds the address-space lock.
pub trait TlbMaintenance {
    /// Invalidate the translation of one page in the space rooted at `root`.
    fn invalidate_page(&self, root: PageFrameNumber, va: VirtualAddress);

    /// Invalidate every translation of the space rooted at `root`.
    fn invalidate_all(&self, root: PageFrameNumber);
}
