use crate::range_alloc::VirtualRangeAllocator;
use crate::region::Region;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_memory_addresses::{PageFrameNumber, PhysMapper, VirtualAddress, VirtualRange};
use kernel_paging::{EntryFlags, PageDirectory};
use kernel_sync::{SpinLock, SpinLockGuard};

/// One process's view of memory: a page directory, the free-range
/// tracking, and the regions bound into it, all guarded by a single lock.
///
/// Concurrent mmap/munmap/fault within one process serialize on that
/// lock; page directory mutation happens under it and completes its TLB
/// shootdown before the lock drops. Destroying the space (last `Arc`
/// dropped) releases every region, which in turn releases object and
/// frame references.
pub struct AddressSpace {
    inner: SpinLock<SpaceInner>,
}

pub(crate) struct SpaceInner {
    pub(crate) directory: PageDirectory,
    pub(crate) ranges: VirtualRangeAllocator,
    /// Regions keyed by their base address.
    pub(crate) regions: BTreeMap<u64, Region>,
}

impl AddressSpace {
    pub(crate) fn new(directory: PageDirectory, window: VirtualRange) -> Self {
        Self {
            inner: SpinLock::new(SpaceInner {
                directory,
                ranges: VirtualRangeAllocator::new(window),
                regions: BTreeMap::new(),
            }),
        }
    }

    /// Assemble a space from already-built parts (fork).
    pub(crate) fn from_parts(
        directory: PageDirectory,
        ranges: VirtualRangeAllocator,
        regions: BTreeMap<u64, Region>,
    ) -> Self {
        Self {
            inner: SpinLock::new(SpaceInner {
                directory,
                ranges,
                regions,
            }),
        }
    }

    pub(crate) fn lock(&self) -> SpinLockGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    /// Root table frame (the hardware register value for this space).
    #[must_use]
    pub fn root_frame(&self) -> PageFrameNumber {
        self.inner.lock().directory.root_frame()
    }

    /// Current translation of `va`, for diagnostics and tests.
    #[must_use]
    pub fn translate<M: PhysMapper>(
        &self,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<(PageFrameNumber, EntryFlags)> {
        self.inner.lock().directory.translate(mapper, va)
    }

    /// Snapshot of every region's virtual range, in address order.
    #[must_use]
    pub fn region_ranges(&self) -> Vec<VirtualRange> {
        self.inner
            .lock()
            .regions
            .values()
            .map(Region::range)
            .collect()
    }
}

impl SpaceInner {
    /// The region containing `va`, if any.
    pub(crate) fn region_covering(&self, va: VirtualAddress) -> Option<&Region> {
        self.regions
            .range(..=va.as_u64())
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.range().contains_address(va))
    }

    /// If a region straddles `at`, split it there so `at` becomes a
    /// region boundary. Required before partial munmap/mprotect.
    pub(crate) fn split_boundary(&mut self, at: VirtualAddress) {
        let straddler = self
            .region_covering(at)
            .map(|region| region.range().base().as_u64())
            .filter(|&base| base < at.as_u64());
        if let Some(base) = straddler
            && let Some(region) = self.regions.remove(&base)
        {
            let (left, right) = region.split_at(at.as_u64() - base);
            self.regions.insert(left.range().base().as_u64(), left);
            self.regions.insert(right.range().base().as_u64(), right);
        }
    }

    /// Remove and return every region lying inside `range`. Callers split
    /// the boundaries first, so containment is exact.
    pub(crate) fn take_regions_within(&mut self, range: VirtualRange) -> Vec<Region> {
        let bases: Vec<u64> = self
            .regions
            .range(range.base().as_u64()..range.end().as_u64())
            .map(|(&base, _)| base)
            .collect();
        bases
            .into_iter()
            .filter_map(|base| {
                if self.regions[&base].range().end().as_u64() <= range.end().as_u64() {
                    self.regions.remove(&base)
                } else {
                    None
                }
            })
            .collect()
    }
}
