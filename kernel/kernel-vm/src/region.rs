use crate::Access;
use crate::object::{VmObject, VmObjectKind};
use alloc::sync::Arc;
use kernel_frames::{FrameAllocator, OutOfMemory, PageRef, ref_count};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysMapper, VirtualAddress, VirtualRange, is_page_aligned,
};
use kernel_paging::{EntryFlags, PageDirectory, TlbMaintenance};

/// A backing object's pages bound into one virtual range of one address
/// space, with access permissions and sharing mode. The unit of
/// mmap/munmap/mprotect.
///
/// Owned exclusively by its address space and mutated under that space's
/// lock. Holds one counted reference to its object; many regions may share
/// one object (shared mappings, or a split mapping).
pub struct Region {
    range: VirtualRange,
    object: Arc<VmObject>,
    /// Object page backing the first page of the range.
    offset_pages: u64,
    access: Access,
    shared: bool,
    /// Writes must duplicate shared frames before going through.
    cow: bool,
}

impl Region {
    #[must_use]
    pub fn new(
        range: VirtualRange,
        object: Arc<VmObject>,
        offset_pages: u64,
        access: Access,
        shared: bool,
    ) -> Self {
        debug_assert!(offset_pages + range.page_count() <= object.size_pages());
        let cow = !shared && object.is_cow_capable();
        Self {
            range,
            object,
            offset_pages,
            access,
            shared,
            cow,
        }
    }

    #[must_use]
    pub fn range(&self) -> VirtualRange {
        self.range
    }

    #[must_use]
    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    #[must_use]
    pub fn access(&self) -> Access {
        self.access
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    #[must_use]
    pub fn is_cow(&self) -> bool {
        self.cow
    }

    #[must_use]
    pub fn offset_pages(&self) -> u64 {
        self.offset_pages
    }

    /// Object page index backing `va`, if `va` lies in this region.
    #[must_use]
    pub fn object_index_of(&self, va: VirtualAddress) -> Option<usize> {
        self.range
            .page_index_of(va)
            .map(|i| i + self.offset_pages as usize)
    }

    /// Virtual page base mapping object page `index`, if this region
    /// covers it.
    #[must_use]
    pub fn page_base_of(&self, index: usize) -> Option<VirtualAddress> {
        let index = (index as u64).checked_sub(self.offset_pages)?;
        (index < self.range.page_count()).then(|| self.range.page_base(index))
    }

    pub fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    /// Hardware flags for one page of this region. `frame_writable` is
    /// the object's verdict on the frame (private, non-zero, not awaiting
    /// dirty tracking).
    #[must_use]
    pub fn entry_flags(&self, frame_writable: bool) -> EntryFlags {
        let mut flags = EntryFlags::USER;
        if self.access.contains(Access::WRITE) && frame_writable {
            flags |= EntryFlags::WRITABLE;
        }
        if !self.access.contains(Access::EXECUTE) {
            flags |= EntryFlags::NO_EXECUTE;
        }
        flags
    }

    /// Conservative writability of an already materialized frame, for
    /// bulk mapping outside the fault path: shared frames, the zero
    /// frame, and dirty-tracked file pages stay read-only and earn their
    /// write bit through a fault.
    fn frame_writable_eagerly(&self, page: &PageRef) -> bool {
        if page.is_shared_zero() {
            return false;
        }
        if matches!(self.object.kind(), VmObjectKind::InodeShared { .. }) {
            return false;
        }
        !(self.cow && ref_count(page) > 1)
    }

    /// Install every materialized page of this region into `directory`.
    ///
    /// # Errors
    /// [`OutOfMemory`] if the directory needs a table it cannot allocate.
    pub fn map_into<P: PhysMapper + TlbMaintenance>(
        &self,
        directory: &PageDirectory,
        platform: &P,
        frames: &FrameAllocator,
    ) -> Result<(), OutOfMemory> {
        if !self.access.contains(Access::READ) {
            return Ok(());
        }
        for (index, page) in self.object.resolved_pages() {
            let Some(va) = self.page_base_of(index) else {
                continue;
            };
            let flags = self.entry_flags(self.frame_writable_eagerly(&page));
            directory.map(platform, frames, va, page.frame(), flags)?;
        }
        Ok(())
    }

    /// Remove every page of this region from `directory`. Frames stay
    /// alive through the object's slots; only translations go away.
    pub fn unmap_from<P: PhysMapper + TlbMaintenance>(
        &self,
        directory: &PageDirectory,
        platform: &P,
    ) {
        for va in self.range.pages() {
            directory.unmap(platform, va);
        }
    }

    /// Divide the region at `offset` bytes from its base into two regions
    /// over the same object. Coverage and permissions are preserved
    /// exactly; `offset` must be page-aligned and strictly inside.
    #[must_use]
    pub fn split_at(self, offset: u64) -> (Self, Self) {
        assert!(
            is_page_aligned(offset) && offset > 0 && offset < self.range.size(),
            "region split must fall on an interior page boundary"
        );
        let left = Self {
            range: VirtualRange::new(self.range.base(), offset),
            object: Arc::clone(&self.object),
            offset_pages: self.offset_pages,
            access: self.access,
            shared: self.shared,
            cow: self.cow,
        };
        let right = Self {
            range: VirtualRange::new(self.range.base() + offset, self.range.size() - offset),
            object: self.object,
            offset_pages: self.offset_pages + offset / PAGE_SIZE,
            access: self.access,
            shared: self.shared,
            cow: self.cow,
        };
        (left, right)
    }

    /// The child's copy of this region for fork. Shared regions reference
    /// the same object; private regions get a slot-sharing clone, which
    /// raises every frame's reference count and thereby re-arms
    /// copy-on-write for both sides.
    #[must_use]
    pub fn clone_for_fork(&self) -> Self {
        Self {
            range: self.range,
            object: self.object.clone_for_fork(),
            offset_pages: self.offset_pages,
            access: self.access,
            shared: self.shared,
            cow: self.cow,
        }
    }
}
