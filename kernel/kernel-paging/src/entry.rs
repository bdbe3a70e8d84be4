use bitfield_struct::bitfield;
use bitflags::bitflags;
use kernel_memory_addresses::PageFrameNumber;

/// Entries per page directory or page table (4096 bytes / 4 bytes each).
pub const TABLE_ENTRIES: usize = 1024;

/// One 32-bit entry of a page directory or page table, in its raw bitfield
/// form. Models the common superset of both levels: a directory entry
/// points at a table frame, a table entry (leaf) maps a 4 KiB page.
///
/// Bits 9–11 are available to the OS; bit 9 carries the software
/// no-execute marker (the two-level format has no hardware NX bit).
#[bitfield(u32)]
pub struct PageEntryBits {
    /// Present (bit 0). Clear means "not mapped"; any access faults.
    pub present: bool,
    /// Writable (bit 1). Clear makes the page read-only, which is how
    /// copy-on-write frames trap their first write.
    pub writable: bool,
    /// User-accessible (bit 2). Clear restricts the page to kernel mode.
    pub user: bool,
    /// Write-through caching (bit 3).
    pub write_through: bool,
    /// Cache disable (bit 4).
    pub cache_disabled: bool,
    /// Accessed (bit 5); set by hardware on first access.
    pub accessed: bool,
    /// Dirty (bit 6, leaf only); set by hardware on first write.
    pub dirty: bool,
    /// Page-size flag (bit 7). Always clear; large pages are not modeled.
    pub large_page: bool,
    /// Global (bit 8, leaf only); spared from address-space switches.
    pub global: bool,
    /// Software no-execute marker (bit 9, OS-available).
    pub no_execute: bool,
    #[bits(2)]
    __: u8,
    /// Physical frame number of the leaf page or next-level table.
    #[bits(20)]
    pub frame: u32,
}

impl PageEntryBits {
    /// A present leaf entry for `frame` with the given software flags.
    #[must_use]
    pub fn leaf(frame: PageFrameNumber, flags: EntryFlags) -> Self {
        Self::new()
            .with_present(true)
            .with_frame(frame.as_u64() as u32)
            .with_writable(flags.contains(EntryFlags::WRITABLE))
            .with_user(flags.contains(EntryFlags::USER))
            .with_global(flags.contains(EntryFlags::GLOBAL))
            .with_no_execute(flags.contains(EntryFlags::NO_EXECUTE))
    }

    /// A present directory entry pointing at the table in `frame`.
    ///
    /// Intermediate entries are always writable; per-page protection lives
    /// in the leaf. `user` must be set for any table reachable from user
    /// mode.
    #[must_use]
    pub fn table(frame: PageFrameNumber, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_frame(frame.as_u64() as u32)
            .with_writable(true)
            .with_user(user)
    }

    /// Frame number carried by this entry.
    #[must_use]
    pub fn frame_number(self) -> PageFrameNumber {
        PageFrameNumber::new(u64::from(self.frame()))
    }

    /// The software flag view of a leaf entry.
    #[must_use]
    pub fn flags(self) -> EntryFlags {
        let mut flags = EntryFlags::empty();
        flags.set(EntryFlags::WRITABLE, self.writable());
        flags.set(EntryFlags::USER, self.user());
        flags.set(EntryFlags::GLOBAL, self.global());
        flags.set(EntryFlags::NO_EXECUTE, self.no_execute());
        flags
    }
}

bitflags! {
    /// Software view of the permission bits of a leaf entry.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct EntryFlags: u32 {
        const WRITABLE   = 1 << 0;
        const USER       = 1 << 1;
        const GLOBAL     = 1 << 2;
        const NO_EXECUTE = 1 << 3;
    }
}

/// One 4 KiB page directory or page table frame.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; TABLE_ENTRIES],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub fn entry(&self, index: u32) -> PageEntryBits {
        self.entries[index as usize]
    }

    #[inline]
    pub fn set_entry(&mut self, index: u32, entry: PageEntryBits) {
        self.entries[index as usize] = entry;
    }

    /// Clear every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PageEntryBits::new(); TABLE_ENTRIES];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips_frame_and_flags() {
        let entry = PageEntryBits::leaf(
            PageFrameNumber::new(0xABCDE),
            EntryFlags::WRITABLE | EntryFlags::USER | EntryFlags::NO_EXECUTE,
        );
        assert!(entry.present());
        assert_eq!(entry.frame_number(), PageFrameNumber::new(0xABCDE));
        assert_eq!(
            entry.flags(),
            EntryFlags::WRITABLE | EntryFlags::USER | EntryFlags::NO_EXECUTE
        );
        assert!(!entry.global());
    }

    #[test]
    fn non_present_entry_is_zero() {
        assert_eq!(PageEntryBits::new().into_bits(), 0);
    }

    #[test]
    fn table_entry_is_writable_non_leaf() {
        let entry = PageEntryBits::table(PageFrameNumber::new(7), true);
        assert!(entry.present());
        assert!(entry.writable());
        assert!(entry.user());
        assert!(!entry.large_page());
        assert_eq!(entry.frame_number().as_u64(), 7);
    }
}
