use crate::error::RangeError;
use alloc::collections::BTreeMap;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, VirtualRange, align_up, is_page_aligned};

/// Free-range tracking for one address space.
///
/// Keeps the free space as an ordered map of `base → size`; everything not
/// in the map is in use. Adjacent free runs are coalesced on deallocation,
/// so two entries are never contiguous. Callers hold the address space's
/// lock; the allocator itself is plain data.
#[derive(Clone)]
pub struct VirtualRangeAllocator {
    window: VirtualRange,
    free: BTreeMap<u64, u64>,
}

impl VirtualRangeAllocator {
    /// An allocator with the entire `window` free.
    #[must_use]
    pub fn new(window: VirtualRange) -> Self {
        let mut free = BTreeMap::new();
        if !window.is_empty() {
            free.insert(window.base().as_u64(), window.size());
        }
        Self { window, free }
    }

    /// The window this allocator manages.
    #[must_use]
    pub fn window(&self) -> VirtualRange {
        self.window
    }

    /// Reserve a free range of `size` bytes aligned to `alignment`.
    ///
    /// When `hint` names an address, the range at the hint is tried first
    /// (placement policy only; a taken hint falls back to the search).
    ///
    /// # Errors
    /// [`RangeError::NoSpace`] when no free run can hold the request.
    pub fn allocate(
        &mut self,
        size: u64,
        alignment: u64,
        hint: Option<VirtualAddress>,
    ) -> Result<VirtualRange, RangeError> {
        debug_assert!(is_page_aligned(size) && size > 0);
        debug_assert!(alignment.is_power_of_two() && alignment >= PAGE_SIZE);

        if let Some(hint) = hint {
            let base = align_up(hint.as_u64(), alignment);
            if let Ok(range) = self.allocate_specific(VirtualAddress::new(base), size) {
                return Ok(range);
            }
        }

        let found = self.free.iter().find_map(|(&base, &len)| {
            let aligned = align_up(base, alignment);
            (aligned + size <= base + len).then_some((base, len, aligned))
        });
        let Some((base, len, aligned)) = found else {
            return Err(RangeError::NoSpace);
        };

        self.free.remove(&base);
        if aligned > base {
            self.free.insert(base, aligned - base);
        }
        if aligned + size < base + len {
            self.free.insert(aligned + size, base + len - (aligned + size));
        }
        Ok(VirtualRange::new(VirtualAddress::new(aligned), size))
    }

    /// Reserve exactly `[base, base + size)` (fixed-address mmap).
    ///
    /// # Errors
    /// [`RangeError::Conflict`] when any part of the range is already in
    /// use or lies outside the window.
    pub fn allocate_specific(
        &mut self,
        base: VirtualAddress,
        size: u64,
    ) -> Result<VirtualRange, RangeError> {
        debug_assert!(is_page_aligned(size) && size > 0);
        let want = VirtualRange::new(base, size);
        if !self.window.contains_range(want) {
            return Err(RangeError::Conflict);
        }

        // the free run starting at or before `base` must cover the request
        let (&run_base, &run_len) = self
            .free
            .range(..=base.as_u64())
            .next_back()
            .ok_or(RangeError::Conflict)?;
        if base.as_u64() + size > run_base + run_len {
            return Err(RangeError::Conflict);
        }

        self.free.remove(&run_base);
        if base.as_u64() > run_base {
            self.free.insert(run_base, base.as_u64() - run_base);
        }
        let end = base.as_u64() + size;
        if end < run_base + run_len {
            self.free.insert(end, run_base + run_len - end);
        }
        Ok(want)
    }

    /// Return `range` to the free set, coalescing with its neighbors.
    pub fn deallocate(&mut self, range: VirtualRange) {
        debug_assert!(self.window.contains_range(range));
        let mut base = range.base().as_u64();
        let mut len = range.size();

        // merge with the run ending exactly at `base`
        if let Some((&prev_base, &prev_len)) = self.free.range(..base).next_back()
            && prev_base + prev_len == base
        {
            self.free.remove(&prev_base);
            base = prev_base;
            len += prev_len;
        }
        // merge with the run starting exactly at the end
        if let Some(&next_len) = self.free.get(&(range.end().as_u64())) {
            self.free.remove(&range.end().as_u64());
            len += next_len;
        }
        debug_assert!(!self.free.contains_key(&base), "double free of a range");
        self.free.insert(base, len);
    }
}
