use kernel_memory_addresses::PhysicalAddress;

/// Classification of one boot memory map entry.
///
/// Only [`Conventional`](MemoryKind::Conventional) memory goes under
/// allocator management; everything else (firmware tables, MMIO holes,
/// kernel image) is left alone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    /// Usable RAM.
    Conventional,
    /// Anything the allocator must not touch.
    Reserved,
}

/// One entry of the boot memory map, as handed over by the platform's
/// early-boot code.
#[derive(Copy, Clone, Debug)]
pub struct MemoryMapEntry {
    /// First byte of the run. Rounded up to a page boundary on ingestion.
    pub base: PhysicalAddress,
    /// Length of the run in 4 KiB pages.
    pub page_count: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn conventional(base: PhysicalAddress, page_count: u64) -> Self {
        Self {
            base,
            page_count,
            kind: MemoryKind::Conventional,
        }
    }

    #[must_use]
    pub const fn reserved(base: PhysicalAddress, page_count: u64) -> Self {
        Self {
            base,
            page_count,
            kind: MemoryKind::Reserved,
        }
    }
}
