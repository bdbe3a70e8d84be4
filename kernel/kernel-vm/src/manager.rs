use crate::collab::{FaultSignal, InodeId, PageStore, ThreadId, ThreadServices};
use crate::error::{FaultError, FaultOutcome, IoError, VmError};
use crate::object::{ContentState, ResolveContext, VmObject, VmObjectKind};
use crate::region::Region;
use crate::space::AddressSpace;
use crate::{Access, AccessKind, FaultContext};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use kernel_frames::{FrameAllocator, OutOfMemory, PageRef};
use kernel_memory_addresses::{
    PAGE_SIZE, PageFrameNumber, PhysMapper, VirtualAddress, VirtualRange, is_page_aligned,
};
use kernel_paging::{EntryFlags, KERNEL_BASE, KernelTables, PageDirectory, TlbMaintenance};
use kernel_sync::SpinLock;
use log::{debug, info, warn};

/// Reclaim policy for purgeable memory. The trigger is a tunable low
/// watermark, not a fixed constant.
#[derive(Debug, Clone, Copy)]
pub struct PurgeConfig {
    /// Reclaim volatile pages when fewer free frames remain than this.
    pub low_watermark_frames: u64,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            low_watermark_frames: 64,
        }
    }
}

/// What should back a new region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingSpec {
    /// Zero-filled memory, materialized on demand.
    Anonymous,
    /// Pages of a file.
    Inode { inode: InodeId },
    /// Physically consecutive frames, materialized up front (DMA).
    Contiguous,
    /// Anonymous memory that may be marked volatile and reclaimed.
    Purgeable,
}

/// Sharing mode of a new region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sharing {
    /// Writes stay private to this mapping (copy-on-write where needed).
    Private,
    /// Writes are visible to every mapping of the same object.
    Shared,
}

/// Top-level coordinator of the subsystem: owns the frame allocator, the
/// shared zero frame and the kernel table template, tracks every address
/// space and purgeable object, and implements the page-fault state
/// machine.
///
/// `P` is the platform seam: physical memory access plus TLB shootdown.
pub struct MemoryManager<P: PhysMapper + TlbMaintenance> {
    platform: P,
    frames: Arc<FrameAllocator>,
    store: Arc<dyn PageStore>,
    threads: Arc<dyn ThreadServices>,
    kernel_tables: Arc<KernelTables>,
    /// The distinguished read-only zero frame; its marker keeps it from
    /// ever being mapped writable.
    zero_page: PageRef,
    config: PurgeConfig,
    spaces: SpinLock<Vec<Weak<AddressSpace>>>,
    purgeable: SpinLock<Vec<Weak<VmObject>>>,
}

impl<P: PhysMapper + TlbMaintenance> MemoryManager<P> {
    /// Bring up the subsystem: build the kernel table template from the
    /// kernel's permanent mappings and allocate the shared zero frame.
    ///
    /// # Errors
    /// [`OutOfMemory`] if boot-time allocation fails.
    pub fn new(
        platform: P,
        frames: Arc<FrameAllocator>,
        store: Arc<dyn PageStore>,
        threads: Arc<dyn ThreadServices>,
        kernel_mappings: impl IntoIterator<Item = (VirtualAddress, PageFrameNumber, EntryFlags)>,
        config: PurgeConfig,
    ) -> Result<Self, OutOfMemory> {
        let kernel_tables = KernelTables::build(&platform, &frames, kernel_mappings)?;
        let zero_page = frames.allocate_shared_zero_frame(&platform)?;
        info!(
            "memory manager up: {} frames total, zero frame {:?}",
            frames.total_frames(),
            zero_page.frame()
        );
        Ok(Self {
            platform,
            frames,
            store,
            threads,
            kernel_tables,
            zero_page,
            config,
            spaces: SpinLock::new(Vec::new()),
            purgeable: SpinLock::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// Frame number of the shared zero page.
    #[must_use]
    pub fn zero_frame(&self) -> PageFrameNumber {
        self.zero_page.frame()
    }

    fn resolve_context(&self) -> ResolveContext<'_, P> {
        ResolveContext {
            mapper: &self.platform,
            frames: &self.frames,
            zero_page: &self.zero_page,
            store: self.store.as_ref(),
            threads: self.threads.as_ref(),
        }
    }

    /// A fresh address space with an empty user half and the shared
    /// kernel half.
    ///
    /// # Errors
    /// [`OutOfMemory`] if the root table cannot be allocated.
    pub fn create_address_space(&self) -> Result<Arc<AddressSpace>, OutOfMemory> {
        let directory =
            PageDirectory::new(&self.platform, &self.frames, Arc::clone(&self.kernel_tables))?;
        // page zero stays unmapped so null dereferences fault
        let window = VirtualRange::new(VirtualAddress::new(PAGE_SIZE), KERNEL_BASE - PAGE_SIZE);
        let space = Arc::new(AddressSpace::new(directory, window));
        let mut spaces = self.spaces.lock();
        spaces.retain(|weak| weak.strong_count() > 0);
        spaces.push(Arc::downgrade(&space));
        Ok(space)
    }

    /// Bind a new region into `space`.
    ///
    /// # Errors
    /// [`VmError::BadRange`] for an empty or unaligned size,
    /// [`VmError::Range`] when no virtual range fits,
    /// [`VmError::OutOfMemory`] when backing allocation fails.
    pub fn create_region(
        &self,
        space: &AddressSpace,
        spec: BackingSpec,
        hint: Option<VirtualAddress>,
        size: u64,
        access: Access,
        sharing: Sharing,
    ) -> Result<VirtualRange, VmError> {
        if size == 0 || !is_page_aligned(size) {
            return Err(VmError::BadRange);
        }
        let pages = size / PAGE_SIZE;
        let shared = sharing == Sharing::Shared;

        let mut inner = space.lock();
        let range = inner.ranges.allocate(size, PAGE_SIZE, hint)?;

        let object = match spec {
            BackingSpec::Anonymous => VmObject::anonymous(pages, shared),
            BackingSpec::Inode { inode } => VmObject::inode(pages, inode, shared),
            BackingSpec::Contiguous => match self.frames.allocate_contiguous(pages) {
                Ok(run) => VmObject::contiguous(run),
                Err(e) => {
                    inner.ranges.deallocate(range);
                    return Err(e.into());
                }
            },
            BackingSpec::Purgeable => {
                let object = VmObject::purgeable(pages);
                let mut purgeable = self.purgeable.lock();
                purgeable.retain(|weak| weak.strong_count() > 0);
                purgeable.push(Arc::downgrade(&object));
                object
            }
        };

        let region = Region::new(range, object, 0, access, shared);
        // contiguous objects are fully materialized; map them up front so
        // no fault ever hits them
        if let Err(e) = region.map_into(&inner.directory, &self.platform, &self.frames) {
            region.unmap_from(&inner.directory, &self.platform);
            inner.ranges.deallocate(range);
            return Err(e.into());
        }
        inner.regions.insert(range.base().as_u64(), region);
        debug!("created region {range:?} ({spec:?}, {sharing:?})");
        Ok(range)
    }

    /// Unbind `range` from `space`, splitting any region it partially
    /// covers. Unmapping an already unmapped hole is not an error.
    ///
    /// # Errors
    /// Currently infallible beyond range validation; the `Result` keeps
    /// the syscall surface uniform.
    pub fn destroy_region(&self, space: &AddressSpace, range: VirtualRange) -> Result<(), VmError> {
        if range.is_empty() {
            return Err(VmError::BadRange);
        }
        let mut inner = space.lock();
        inner.split_boundary(range.base());
        inner.split_boundary(range.end());
        for region in inner.take_regions_within(range) {
            region.unmap_from(&inner.directory, &self.platform);
            inner.ranges.deallocate(region.range());
        }
        Ok(())
    }

    /// Change the permissions of every region page inside `range`,
    /// splitting partially covered regions.
    ///
    /// Live translations are downgraded to read-only rather than
    /// rewritten as writable: a later write faults and re-earns its write
    /// bit through the object, which keeps copy-on-write and dirty
    /// tracking decisions in one place.
    ///
    /// # Errors
    /// [`VmError::BadRange`] for an empty range.
    pub fn change_permissions(
        &self,
        space: &AddressSpace,
        range: VirtualRange,
        access: Access,
    ) -> Result<(), VmError> {
        if range.is_empty() {
            return Err(VmError::BadRange);
        }
        let mut inner = space.lock();
        inner.split_boundary(range.base());
        inner.split_boundary(range.end());

        // reborrow so the region and directory borrows stay disjoint
        let inner = &mut *inner;
        let bases: Vec<u64> = inner
            .regions
            .range(range.base().as_u64()..range.end().as_u64())
            .filter(|(_, region)| range.contains_range(region.range()))
            .map(|(&base, _)| base)
            .collect();
        for base in bases {
            let Some(region) = inner.regions.get_mut(&base) else {
                continue;
            };
            region.set_access(access);
            if access.contains(Access::READ) {
                let read_only = region.entry_flags(false);
                for va in region.range().pages() {
                    inner.directory.set_flags(&self.platform, va, read_only);
                }
            } else {
                // no access at all: tear the translations down
                for va in region.range().pages() {
                    inner.directory.unmap(&self.platform, va);
                }
            }
        }
        Ok(())
    }

    /// Fork `parent` into a new address space. Shared regions alias the
    /// same objects; private regions are cloned with frame sharing, and
    /// every writable translation of a copy-on-write region is downgraded
    /// to read-only on **both** sides so the first write from either
    /// process duplicates the frame.
    ///
    /// # Errors
    /// [`OutOfMemory`] if directory or table frames cannot be allocated.
    pub fn fork_address_space(
        &self,
        parent: &AddressSpace,
    ) -> Result<Arc<AddressSpace>, OutOfMemory> {
        let parent_inner = parent.lock();
        let child_directory = parent_inner
            .directory
            .clone_structure(&self.platform, &self.frames)?;

        let mut child_regions = alloc::collections::BTreeMap::new();
        for (&base, region) in &parent_inner.regions {
            let child_region = region.clone_for_fork();
            // a cloned purgeable object is new to the reclaim registry
            if child_region.object().kind() == VmObjectKind::Purgeable
                && !Arc::ptr_eq(child_region.object(), region.object())
            {
                let mut purgeable = self.purgeable.lock();
                purgeable.retain(|weak| weak.strong_count() > 0);
                purgeable.push(Arc::downgrade(child_region.object()));
            }
            if region.is_cow() {
                for va in region.range().pages() {
                    let Some((_, flags)) = parent_inner.directory.translate(&self.platform, va)
                    else {
                        continue;
                    };
                    if flags.contains(EntryFlags::WRITABLE) {
                        let armed = flags - EntryFlags::WRITABLE;
                        parent_inner.directory.set_flags(&self.platform, va, armed);
                        child_directory.set_flags(&self.platform, va, armed);
                    }
                }
            }
            child_regions.insert(base, child_region);
        }

        let child = Arc::new(AddressSpace::from_parts(
            child_directory,
            parent_inner.ranges.clone(),
            child_regions,
        ));
        drop(parent_inner);

        let mut spaces = self.spaces.lock();
        spaces.retain(|weak| weak.strong_count() > 0);
        spaces.push(Arc::downgrade(&child));
        debug!("forked address space, root {:?}", child.root_frame());
        Ok(child)
    }

    /// The page-fault state machine. Returns the outcome to the trap
    /// dispatcher; never panics for user faults.
    ///
    /// The space lock is dropped across `resolve_page` (which may block
    /// on store I/O) and the region re-validated afterwards; a mapping
    /// that vanished mid-fault reads as a segmentation violation, the
    /// same as if the munmap had won the race outright, and a permission
    /// revoked mid-fault as a protection violation. A writable
    /// copy-on-write verdict is re-confirmed with the object before the
    /// mapping goes in — a fork in the window turns the frame shared, so
    /// the fault is redone and duplicates.
    ///
    /// # Panics
    /// When kernel code itself faults on an unmapped address. That is a
    /// kernel bug; continuing would corrupt silently.
    pub fn page_fault(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        access: AccessKind,
        context: FaultContext,
    ) -> FaultOutcome {
        let page_va = va.page_base();

        loop {
            let (object, index) = {
                let inner = space.lock();
                let Some(region) = inner.region_covering(page_va) else {
                    drop(inner);
                    assert!(
                        context != FaultContext::Kernel,
                        "kernel page fault at {va:?} with no covering region"
                    );
                    warn!("segmentation violation at {va:?}");
                    return FaultOutcome::Fatal(FaultSignal::SegmentationViolation);
                };
                if !region.access().contains(access.required()) {
                    return FaultOutcome::Fatal(FaultError::BadAccess.signal());
                }
                let Some(index) = region.object_index_of(page_va) else {
                    return FaultOutcome::Fatal(FaultSignal::SegmentationViolation);
                };
                (Arc::clone(region.object()), index)
            };

            let resolved = match object.resolve_page(index, access, &self.resolve_context()) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!("fault at {va:?} failed: {e}");
                    return FaultOutcome::Fatal(e.signal());
                }
            };

            let inner = space.lock();
            let Some(region) = inner.region_covering(page_va) else {
                return FaultOutcome::Fatal(FaultSignal::SegmentationViolation);
            };
            if !Arc::ptr_eq(region.object(), &object)
                || region.object_index_of(page_va) != Some(index)
            {
                return FaultOutcome::Fatal(FaultSignal::SegmentationViolation);
            }
            if !region.access().contains(access.required()) {
                return FaultOutcome::Fatal(FaultError::BadAccess.signal());
            }
            if resolved.writable
                && region.is_cow()
                && !object.slot_is_private(index, &resolved.page)
            {
                // a fork raced us between resolve and map; our frame may
                // now be shared, so the write verdict is stale
                drop(inner);
                drop(resolved);
                continue;
            }
            let flags = region.entry_flags(resolved.writable);
            return match inner.directory.map(
                &self.platform,
                &self.frames,
                page_va,
                resolved.page.frame(),
                flags,
            ) {
                Ok(_) => FaultOutcome::Resolved,
                Err(e) => {
                    warn!("fault at {va:?} could not map: {e}");
                    FaultOutcome::Fatal(FaultSignal::BusError)
                }
            };
        }
    }

    /// Run the fault machine and deliver the signal of a fatal outcome to
    /// `thread`. The glue the trap dispatcher calls.
    pub fn dispatch_fault(
        &self,
        space: &AddressSpace,
        thread: ThreadId,
        va: VirtualAddress,
        access: AccessKind,
        context: FaultContext,
    ) -> FaultOutcome {
        let outcome = self.page_fault(space, va, access, context);
        if let FaultOutcome::Fatal(signal) = outcome {
            self.threads.deliver_fault_signal(thread, signal);
        }
        outcome
    }

    /// Write every dirty page of a shared file object back through the
    /// store. Cleaned pages have their live translations downgraded to
    /// read-only so the next write dirties them again; pages whose
    /// writeback fails stay dirty.
    ///
    /// # Errors
    /// [`IoError`] if any page failed; the rest were still attempted.
    pub fn flush_dirty_pages(&self, object: &Arc<VmObject>) -> Result<(), IoError> {
        let VmObjectKind::InodeShared { inode } = object.kind() else {
            return Ok(());
        };
        let mut failed = false;
        let mut cleaned = Vec::new();
        for (index, frame) in object.take_dirty() {
            if self.store.write_page(inode, index, frame).is_ok() {
                cleaned.push(index as usize);
            } else {
                object.mark_dirty(index as usize);
                failed = true;
            }
        }
        self.write_protect(object, &cleaned);
        if failed { Err(IoError) } else { Ok(()) }
    }

    /// Flush the dirty pages of every shared file object mapped inside
    /// `range` (msync glue).
    ///
    /// # Errors
    /// [`VmError::Io`] if any writeback failed.
    pub fn sync_range(&self, space: &AddressSpace, range: VirtualRange) -> Result<(), VmError> {
        let objects: Vec<Arc<VmObject>> = {
            let inner = space.lock();
            inner
                .regions
                .values()
                .filter(|region| region.range().intersects(range))
                .map(|region| Arc::clone(region.object()))
                .collect()
        };
        let mut failed = false;
        for object in objects {
            failed |= self.flush_dirty_pages(&object).is_err();
        }
        if failed { Err(IoError.into()) } else { Ok(()) }
    }

    /// Downgrade every live translation of the given object pages to
    /// read-only, in every registered space.
    fn write_protect(&self, object: &Arc<VmObject>, indices: &[usize]) {
        if indices.is_empty() {
            return;
        }
        let spaces: Vec<Arc<AddressSpace>> = {
            let spaces = self.spaces.lock();
            spaces.iter().filter_map(Weak::upgrade).collect()
        };
        for space in spaces {
            let inner = space.lock();
            for region in inner
                .regions
                .values()
                .filter(|region| Arc::ptr_eq(region.object(), object))
            {
                for &index in indices {
                    if let Some(va) = region.page_base_of(index)
                        && let Some((_, flags)) = inner.directory.translate(&self.platform, va)
                        && flags.contains(EntryFlags::WRITABLE)
                    {
                        inner
                            .directory
                            .set_flags(&self.platform, va, flags - EntryFlags::WRITABLE);
                    }
                }
            }
        }
    }

    fn purgeable_span(
        space: &AddressSpace,
        range: VirtualRange,
    ) -> Result<(Arc<VmObject>, core::ops::Range<usize>), VmError> {
        let inner = space.lock();
        let region = inner
            .region_covering(range.base())
            .filter(|region| region.range().contains_range(range))
            .ok_or(VmError::NoSuchRegion)?;
        if region.object().kind() != VmObjectKind::Purgeable {
            return Err(VmError::NoSuchRegion);
        }
        let Some(start) = region.object_index_of(range.base()) else {
            return Err(VmError::NoSuchRegion);
        };
        Ok((
            Arc::clone(region.object()),
            start..start + range.page_count() as usize,
        ))
    }

    /// Make the purgeable pages under `range` eligible for reclaim.
    ///
    /// # Errors
    /// [`VmError::NoSuchRegion`] unless one purgeable region covers the
    /// whole range.
    pub fn mark_volatile(&self, space: &AddressSpace, range: VirtualRange) -> Result<(), VmError> {
        let (object, span) = Self::purgeable_span(space, range)?;
        object.mark_volatile(span);
        Ok(())
    }

    /// Re-pin the purgeable pages under `range` and report whether their
    /// content survived.
    ///
    /// # Errors
    /// [`VmError::NoSuchRegion`] unless one purgeable region covers the
    /// whole range.
    pub fn mark_nonvolatile(
        &self,
        space: &AddressSpace,
        range: VirtualRange,
    ) -> Result<ContentState, VmError> {
        let (object, span) = Self::purgeable_span(space, range)?;
        Ok(object.mark_nonvolatile(span))
    }

    /// Reclaim volatile purgeable pages if free frames fell under the
    /// configured watermark. Returns the number of frames reclaimed.
    pub fn reclaim_if_pressured(&self) -> u64 {
        if self.frames.free_frames() >= self.config.low_watermark_frames {
            return 0;
        }
        let objects: Vec<Arc<VmObject>> = {
            let mut purgeable = self.purgeable.lock();
            purgeable.retain(|weak| weak.strong_count() > 0);
            purgeable.iter().filter_map(Weak::upgrade).collect()
        };

        let mut reclaimed = 0;
        for object in objects {
            let purged = object.purge_volatile();
            if purged.is_empty() {
                continue;
            }
            self.unmap_purged(&object, &purged);
            reclaimed += purged.len() as u64;
            // frames return to their regions as `purged` drops here
        }
        if reclaimed > 0 {
            warn!("memory pressure: reclaimed {reclaimed} volatile frames");
        }
        reclaimed
    }

    /// Tear down every live translation of just-purged pages, in every
    /// registered space. Matching on the frame number means a slot that
    /// already refaulted to a fresh frame is left alone.
    fn unmap_purged(&self, object: &Arc<VmObject>, purged: &[(usize, PageRef)]) {
        let spaces: Vec<Arc<AddressSpace>> = {
            let spaces = self.spaces.lock();
            spaces.iter().filter_map(Weak::upgrade).collect()
        };
        for space in spaces {
            let inner = space.lock();
            for region in inner
                .regions
                .values()
                .filter(|region| Arc::ptr_eq(region.object(), object))
            {
                for (index, page) in purged {
                    if let Some(va) = region.page_base_of(*index)
                        && let Some((pfn, _)) = inner.directory.translate(&self.platform, va)
                        && pfn == page.frame()
                    {
                        inner.directory.unmap(&self.platform, va);
                    }
                }
            }
        }
    }
}
