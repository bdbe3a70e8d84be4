use crate::{PAGE_SIZE, VirtualAddress, is_page_aligned};
use core::fmt;

/// A page-aligned `[base, base + size)` window of one address space.
///
/// Both `base` and `size` are multiples of [`PAGE_SIZE`](crate::PAGE_SIZE);
/// construction asserts this in debug builds. Regions and the virtual range
/// allocator deal exclusively in these ranges, which is what keeps the
/// "used ranges never overlap" invariant checkable in one place.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let r = VirtualRange::new(VirtualAddress::new(0x10000), 3 * PAGE_SIZE);
/// assert_eq!(r.page_count(), 3);
/// assert!(r.contains_address(VirtualAddress::new(0x12fff)));
/// assert!(!r.contains_address(VirtualAddress::new(0x13000)));
/// assert_eq!(r.page_index_of(VirtualAddress::new(0x11004)), Some(1));
/// ```
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct VirtualRange {
    base: VirtualAddress,
    size: u64,
}

impl VirtualRange {
    /// Create a range. `base` and `size` must be page-aligned.
    #[inline]
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        debug_assert!(base.is_page_aligned());
        debug_assert!(is_page_aligned(size));
        Self { base, size }
    }

    /// Range spanning `pages` pages starting at `base`.
    #[inline]
    #[must_use]
    pub const fn from_page_span(base: VirtualAddress, pages: u64) -> Self {
        Self::new(base, pages * PAGE_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.size == 0
    }

    /// One past the last address of the range.
    #[inline]
    #[must_use]
    pub const fn end(self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }

    #[inline]
    #[must_use]
    pub const fn page_count(self) -> u64 {
        self.size / PAGE_SIZE
    }

    #[inline]
    #[must_use]
    pub const fn contains_address(self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() < self.end().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn contains_range(self, other: Self) -> bool {
        other.base.as_u64() >= self.base.as_u64()
            && other.end().as_u64() <= self.end().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.base.as_u64() < other.end().as_u64() && other.base.as_u64() < self.end().as_u64()
    }

    /// Range-relative page index of `va`, if `va` lies within the range.
    #[inline]
    #[must_use]
    pub const fn page_index_of(self, va: VirtualAddress) -> Option<usize> {
        if self.contains_address(va) {
            Some(((va.as_u64() - self.base.as_u64()) / PAGE_SIZE) as usize)
        } else {
            None
        }
    }

    /// Base address of the `index`-th page of the range.
    #[inline]
    #[must_use]
    pub const fn page_base(self, index: u64) -> VirtualAddress {
        debug_assert!(index < self.page_count());
        VirtualAddress::new(self.base.as_u64() + index * PAGE_SIZE)
    }

    /// Iterate over the page base addresses of the range.
    pub fn pages(self) -> impl Iterator<Item = VirtualAddress> {
        (0..self.page_count()).map(move |i| self.page_base(i))
    }
}

impl fmt::Debug for VirtualRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VirtualRange({:#x}..{:#x})",
            self.base.as_u64(),
            self.end().as_u64()
        )
    }
}
