use crate::{
    MemoryKind, MemoryMapEntry, OutOfMemory, PageRef, PhysicalPage, region::PhysicalRegion,
};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysMapper, align_down, align_up, zero_frame};
use log::{debug, info, warn};

/// System-wide physical frame allocator.
///
/// Owns one [`PhysicalRegion`] per conventional run of the boot memory
/// map. Initialized once at boot and alive for the kernel's lifetime;
/// concurrency is handled inside each region, so `&self` is enough for
/// every operation.
pub struct FrameAllocator {
    regions: Vec<Arc<PhysicalRegion>>,
}

impl FrameAllocator {
    /// Build the allocator from the boot memory map.
    ///
    /// Reserved entries are skipped; conventional entries are trimmed to
    /// page boundaries. Entries that vanish after trimming are dropped.
    #[must_use]
    pub fn from_memory_map(entries: &[MemoryMapEntry]) -> Self {
        let mut regions = Vec::new();
        for entry in entries {
            if entry.kind != MemoryKind::Conventional || entry.page_count == 0 {
                continue;
            }
            let start = align_up(entry.base.as_u64(), PAGE_SIZE);
            let end = align_down(entry.base.as_u64() + entry.page_count * PAGE_SIZE, PAGE_SIZE);
            if end <= start {
                continue;
            }
            let frames = (end - start) / PAGE_SIZE;
            let base_frame = kernel_memory_addresses::PhysicalAddress::new(start).frame();
            debug!(
                "physical region: {} frames at {:?}",
                frames, base_frame
            );
            regions.push(Arc::new(PhysicalRegion::new(base_frame, frames)));
        }
        let allocator = Self { regions };
        info!(
            "frame allocator: {} regions, {} frames ({} KiB)",
            allocator.regions.len(),
            allocator.total_frames(),
            allocator.total_frames() * (PAGE_SIZE / 1024)
        );
        allocator
    }

    /// Allocate one frame. The contents are whatever the previous tenant
    /// left behind; callers that hand memory to user space must use
    /// [`allocate_zero_frame`](Self::allocate_zero_frame) instead.
    ///
    /// # Errors
    /// [`OutOfMemory`] when every region is exhausted.
    pub fn allocate_frame(&self) -> Result<PageRef, OutOfMemory> {
        for region in &self.regions {
            if let Some(frame) = region.take_one() {
                return Ok(Arc::new(PhysicalPage::new(frame, false, Arc::clone(region))));
            }
        }
        warn!("frame allocation failed: all regions exhausted");
        Err(OutOfMemory)
    }

    /// Allocate one frame and eagerly zero it through `mapper`, so the new
    /// owner can never observe a previous tenant's data.
    ///
    /// # Errors
    /// [`OutOfMemory`] when every region is exhausted.
    pub fn allocate_zero_frame<M: PhysMapper>(&self, mapper: &M) -> Result<PageRef, OutOfMemory> {
        let page = self.allocate_frame()?;
        // Safety: the frame was just handed out by the allocator and has a
        // single owner.
        unsafe { zero_frame(mapper, page.frame()) };
        Ok(page)
    }

    /// Allocate the distinguished shared zero frame. Called once at boot
    /// by the memory manager; the returned page carries the
    /// `shared_zero` marker that keeps it read-only in every mapping.
    ///
    /// # Errors
    /// [`OutOfMemory`] when every region is exhausted.
    pub fn allocate_shared_zero_frame<M: PhysMapper>(
        &self,
        mapper: &M,
    ) -> Result<PageRef, OutOfMemory> {
        for region in &self.regions {
            if let Some(frame) = region.take_one() {
                // Safety: freshly allocated, single owner.
                unsafe { zero_frame(mapper, frame) };
                return Ok(Arc::new(PhysicalPage::new(frame, true, Arc::clone(region))));
            }
        }
        Err(OutOfMemory)
    }

    /// Allocate `count` physically consecutive frames (DMA-capable backing
    /// objects). The frames are returned as individual refcounted pages;
    /// contiguity is a property of their frame numbers.
    ///
    /// # Errors
    /// [`OutOfMemory`] when no region holds a long enough free run.
    pub fn allocate_contiguous(&self, count: u64) -> Result<Vec<PageRef>, OutOfMemory> {
        for region in &self.regions {
            if let Some(start) = region.take_run(count) {
                let pages = (0..count)
                    .map(|i| {
                        Arc::new(PhysicalPage::new(start.plus(i), false, Arc::clone(region)))
                    })
                    .collect();
                return Ok(pages);
            }
        }
        warn!("contiguous allocation of {count} frames failed");
        Err(OutOfMemory)
    }

    /// Total frames under management.
    #[must_use]
    pub fn total_frames(&self) -> u64 {
        self.regions.iter().map(|r| r.total_frames()).sum()
    }

    /// Frames currently free.
    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.regions.iter().map(|r| r.free_frames()).sum()
    }

    /// Frames currently allocated.
    #[must_use]
    pub fn used_frames(&self) -> u64 {
        self.total_frames() - self.free_frames()
    }
}
