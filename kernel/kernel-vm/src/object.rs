use crate::collab::{InodeId, PageStore, ThreadServices};
use crate::error::FaultError;
use crate::AccessKind;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_frames::{FrameAllocator, PageRef, ref_count};
use kernel_memory_addresses::{PageFrameNumber, PhysMapper, copy_frame};
use kernel_sync::SpinLock;
use log::{debug, trace};

/// What fills the pages of a [`VmObject`] and how a fault on them resolves.
///
/// The variant set is closed by kernel policy; each fault class is one arm
/// of [`VmObject::resolve_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmObjectKind {
    /// Zero-filled memory. Private instances use the shared system zero
    /// frame until first write; shared instances materialize real frames
    /// immediately so every mapper observes the same storage.
    Anonymous { shared: bool },

    /// A file's pages, copy-on-write: reads are demand-paged from the
    /// store, writes never reach the file.
    InodePrivate { inode: InodeId },

    /// A file's pages, write-through: writes mark the page dirty for
    /// writeback through the store.
    InodeShared { inode: InodeId },

    /// Physically contiguous frames, fully materialized at creation
    /// (DMA). A fault on these pages is a kernel bug.
    Contiguous,

    /// Anonymous memory whose volatile ranges the kernel may silently
    /// reclaim under pressure.
    Purgeable,
}

/// One logical page of an object.
#[derive(Clone)]
pub enum PageSlot {
    /// Never materialized; the kind decides what a fault produces.
    Unresolved,

    /// Backed by a frame. The slot's `Arc` is the object's ownership
    /// share of the frame.
    Resolved(PageRef),

    /// Was volatile and got reclaimed. The owner learns on next access
    /// or on [`VmObject::mark_nonvolatile`].
    Purged,
}

/// Outcome of [`VmObject::mark_nonvolatile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentState {
    /// No page of the range was reclaimed; the data is intact.
    Preserved,

    /// At least one page was reclaimed; the range reads as zeros.
    Purged,
}

struct ObjectState {
    slots: Vec<PageSlot>,
    /// Written pages awaiting writeback. `InodeShared` only.
    dirty: BTreeSet<usize>,
    /// Pages currently eligible for reclaim. `Purgeable` only.
    volatile: BTreeSet<usize>,
    /// Pages whose frame is known private to this object. A raw frame
    /// reference count over-counts while a resolved page is still in a
    /// faulter's hands, so copy-on-write decisions trust this set first;
    /// it is emptied on fork, when the frames genuinely become shared.
    private: BTreeSet<usize>,
}

/// A frame resolved by the fault path, plus whether its mapping may be
/// writable. `writable` is the object's verdict only; the region's
/// permissions still apply on top.
pub struct ResolvedPage {
    pub page: PageRef,
    pub writable: bool,
}

/// Everything [`VmObject::resolve_page`] needs from the outside world.
pub struct ResolveContext<'a, M: PhysMapper> {
    pub mapper: &'a M,
    pub frames: &'a FrameAllocator,
    /// The distinguished read-only zero frame.
    pub zero_page: &'a PageRef,
    pub store: &'a dyn PageStore,
    pub threads: &'a dyn ThreadServices,
}

/// A memory-backing object: an ordered sequence of page slots plus the
/// policy for resolving faults on them.
///
/// Regions hold counted references to their object; the object in turn
/// owns its frames through the slot `Arc`s. Page directories reference
/// frames only by number, which keeps the ownership graph acyclic.
///
/// The slot vector lives behind a [`SpinLock`]; that lock is what makes
/// concurrent copy-on-write faults on the same page pick exactly one
/// winner, and what serializes purge against refault. The lock is never
/// held across blocking store I/O.
pub struct VmObject {
    kind: VmObjectKind,
    size_pages: u64,
    state: SpinLock<ObjectState>,
}

impl VmObject {
    fn with_slots(kind: VmObjectKind, slots: Vec<PageSlot>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            size_pages: slots.len() as u64,
            state: SpinLock::new(ObjectState {
                slots,
                dirty: BTreeSet::new(),
                volatile: BTreeSet::new(),
                private: BTreeSet::new(),
            }),
        })
    }

    #[must_use]
    pub fn anonymous(pages: u64, shared: bool) -> Arc<Self> {
        Self::with_slots(
            VmObjectKind::Anonymous { shared },
            alloc::vec![PageSlot::Unresolved; pages as usize],
        )
    }

    #[must_use]
    pub fn inode(pages: u64, inode: InodeId, shared: bool) -> Arc<Self> {
        let kind = if shared {
            VmObjectKind::InodeShared { inode }
        } else {
            VmObjectKind::InodePrivate { inode }
        };
        Self::with_slots(kind, alloc::vec![PageSlot::Unresolved; pages as usize])
    }

    /// A fully materialized object over physically consecutive frames.
    #[must_use]
    pub fn contiguous(frames: Vec<PageRef>) -> Arc<Self> {
        let slots = frames.into_iter().map(PageSlot::Resolved).collect();
        Self::with_slots(VmObjectKind::Contiguous, slots)
    }

    #[must_use]
    pub fn purgeable(pages: u64) -> Arc<Self> {
        Self::with_slots(
            VmObjectKind::Purgeable,
            alloc::vec![PageSlot::Unresolved; pages as usize],
        )
    }

    #[must_use]
    pub fn kind(&self) -> VmObjectKind {
        self.kind
    }

    #[must_use]
    pub fn size_pages(&self) -> u64 {
        self.size_pages
    }

    /// Whether writes to a shared frame of this object must duplicate it.
    #[must_use]
    pub fn is_cow_capable(&self) -> bool {
        matches!(
            self.kind,
            VmObjectKind::Anonymous { shared: false }
                | VmObjectKind::InodePrivate { .. }
                | VmObjectKind::Purgeable
        )
    }

    /// Produce the frame backing page `index`, materializing or
    /// duplicating it as the kind and access demand.
    ///
    /// Called from the fault path with no address-space lock held. May
    /// block the calling thread on store I/O; the slot lock is dropped
    /// around that wait and the slot re-checked afterwards, so of two
    /// concurrent faulters exactly one installs the frame and the other
    /// adopts it.
    ///
    /// # Errors
    /// [`FaultError::Io`] when the demand-paging read fails,
    /// [`FaultError::OutOfMemory`] when no frame is available.
    ///
    /// # Panics
    /// On an unresolved page of a [`Contiguous`](VmObjectKind::Contiguous)
    /// object or an index beyond the extent. Both are kernel bugs;
    /// continuing would risk silent corruption.
    pub fn resolve_page<M: PhysMapper>(
        &self,
        index: usize,
        access: AccessKind,
        ctx: &ResolveContext<'_, M>,
    ) -> Result<ResolvedPage, FaultError> {
        assert!(
            (index as u64) < self.size_pages,
            "page index {index} beyond object extent"
        );
        let write = access == AccessKind::Write;

        loop {
            let mut state = self.state.lock();

            let resolved = match &state.slots[index] {
                PageSlot::Resolved(page) => {
                    let shared = page.is_shared_zero()
                        || (!state.private.contains(&index) && ref_count(page) > 1);
                    Some((Arc::clone(page), shared))
                }
                _ => None,
            };
            if let Some((page, shared)) = resolved {
                if write && shared && self.is_cow_capable() {
                    let fresh = if page.is_shared_zero() {
                        ctx.frames.allocate_zero_frame(ctx.mapper)?
                    } else {
                        let fresh = ctx.frames.allocate_frame()?;
                        // Safety: `fresh` has a single owner; `page` is
                        // kept alive by our clone.
                        unsafe { copy_frame(ctx.mapper, page.frame(), fresh.frame()) };
                        fresh
                    };
                    trace!(
                        "cow: page {index} {:?} -> {:?}",
                        page.frame(),
                        fresh.frame()
                    );
                    state.slots[index] = PageSlot::Resolved(Arc::clone(&fresh));
                    state.private.insert(index);
                    return Ok(ResolvedPage {
                        page: fresh,
                        writable: true,
                    });
                }
                if write && matches!(self.kind, VmObjectKind::InodeShared { .. }) {
                    state.dirty.insert(index);
                }
                let writable = match self.kind {
                    // write-only-after-fault keeps dirty tracking honest
                    VmObjectKind::InodeShared { .. } => write,
                    _ if self.is_cow_capable() => !shared,
                    _ => !page.is_shared_zero(),
                };
                if writable && self.is_cow_capable() {
                    // the frame is exclusive again (e.g. the other fork
                    // side dropped); record that so the writable verdict
                    // stays checkable until the mapping is installed
                    state.private.insert(index);
                }
                return Ok(ResolvedPage { page, writable });
            }

            if matches!(state.slots[index], PageSlot::Purged) {
                // reclaimed while volatile; the owner gets fresh zeros
                let page = ctx.frames.allocate_zero_frame(ctx.mapper)?;
                state.slots[index] = PageSlot::Resolved(Arc::clone(&page));
                state.private.insert(index);
                return Ok(ResolvedPage {
                    page,
                    writable: true,
                });
            }

            match self.kind {
                VmObjectKind::Anonymous { shared } => {
                    let (page, writable) = if write || shared {
                        (ctx.frames.allocate_zero_frame(ctx.mapper)?, true)
                    } else {
                        // zero-page-then-COW: reads share the system zero
                        // frame read-only, the first write promotes
                        (Arc::clone(ctx.zero_page), false)
                    };
                    state.slots[index] = PageSlot::Resolved(Arc::clone(&page));
                    if writable && !shared {
                        state.private.insert(index);
                    }
                    return Ok(ResolvedPage { page, writable });
                }
                VmObjectKind::Purgeable => {
                    let (page, writable) = if write {
                        (ctx.frames.allocate_zero_frame(ctx.mapper)?, true)
                    } else {
                        (Arc::clone(ctx.zero_page), false)
                    };
                    state.slots[index] = PageSlot::Resolved(Arc::clone(&page));
                    if writable {
                        state.private.insert(index);
                    }
                    return Ok(ResolvedPage { page, writable });
                }
                VmObjectKind::InodePrivate { inode } | VmObjectKind::InodeShared { inode } => {
                    // demand paging blocks; the slot lock must not be
                    // held across the wait
                    drop(state);
                    let page = ctx.frames.allocate_frame()?;
                    let handle = ctx.store.begin_read(inode, index as u64, page.frame())?;
                    ctx.threads.block_current_thread_on(handle);
                    ctx.store.finish_read(handle)?;

                    let mut state = self.state.lock();
                    if !matches!(state.slots[index], PageSlot::Unresolved) {
                        // another faulter installed the page while we
                        // were blocked; our frame goes back unused
                        drop(state);
                        continue;
                    }
                    state.slots[index] = PageSlot::Resolved(Arc::clone(&page));
                    let writable = match self.kind {
                        VmObjectKind::InodeShared { .. } => {
                            if write {
                                state.dirty.insert(index);
                            }
                            write
                        }
                        _ => {
                            state.private.insert(index);
                            true
                        }
                    };
                    return Ok(ResolvedPage { page, writable });
                }
                VmObjectKind::Contiguous => {
                    panic!("fault on unresolved page {index} of a contiguous object")
                }
            }
        }
    }

    /// Whether page `index` still holds `page` as a known-private frame.
    ///
    /// The fault path resolves without the address-space lock, so a fork
    /// can slip in between a writable resolve and the installation of the
    /// mapping and turn the frame shared (it clears the private set). The
    /// fault path re-checks with this before mapping a copy-on-write page
    /// writable and redoes the fault when the verdict no longer holds.
    #[must_use]
    pub fn slot_is_private(&self, index: usize, page: &PageRef) -> bool {
        let state = self.state.lock();
        match &state.slots[index] {
            PageSlot::Resolved(current) => {
                Arc::ptr_eq(current, page) && state.private.contains(&index)
            }
            _ => false,
        }
    }

    /// The frame currently backing page `index`, if materialized.
    #[must_use]
    pub fn page_at(&self, index: usize) -> Option<PageRef> {
        match &self.state.lock().slots[index] {
            PageSlot::Resolved(page) => Some(Arc::clone(page)),
            _ => None,
        }
    }

    /// Snapshot of every materialized page, for bulk mapping.
    #[must_use]
    pub fn resolved_pages(&self) -> Vec<(usize, PageRef)> {
        self.state
            .lock()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                PageSlot::Resolved(page) => Some((i, Arc::clone(page))),
                _ => None,
            })
            .collect()
    }

    /// Duplicate this private object for fork: the child object shares
    /// every materialized frame with the parent (raising its reference
    /// count, which is what re-arms copy-on-write on both sides).
    #[must_use]
    pub fn clone_for_fork(self: &Arc<Self>) -> Arc<Self> {
        if !self.is_cow_capable() {
            // shared objects are shared, not cloned
            return Arc::clone(self);
        }
        let mut state = self.state.lock();
        // both sides now share every frame again
        state.private.clear();
        let object = Self::with_slots(self.kind, state.slots.clone());
        object.state.lock().volatile = state.volatile.clone();
        object
    }

    /// Drain the dirty set, returning each page's index and frame for
    /// writeback. The caller re-marks pages whose writeback fails.
    #[must_use]
    pub fn take_dirty(&self) -> Vec<(u64, PageFrameNumber)> {
        let mut state = self.state.lock();
        let dirty = core::mem::take(&mut state.dirty);
        dirty
            .into_iter()
            .filter_map(|i| match &state.slots[i] {
                PageSlot::Resolved(page) => Some((i as u64, page.frame())),
                _ => None,
            })
            .collect()
    }

    /// Re-mark a page dirty (failed writeback).
    pub fn mark_dirty(&self, index: usize) {
        self.state.lock().dirty.insert(index);
    }

    /// Make `pages` eligible for silent reclaim. `Purgeable` objects only.
    pub fn mark_volatile(&self, pages: Range<usize>) {
        debug_assert!(matches!(self.kind, VmObjectKind::Purgeable));
        debug_assert!(pages.end as u64 <= self.size_pages);
        self.state.lock().volatile.extend(pages);
    }

    /// Take `pages` out of reclaim eligibility and report whether their
    /// content survived. Purged slots reset to unresolved so the next
    /// access sees fresh zeros.
    pub fn mark_nonvolatile(&self, pages: Range<usize>) -> ContentState {
        debug_assert!(matches!(self.kind, VmObjectKind::Purgeable));
        let mut state = self.state.lock();
        let mut survived = true;
        for index in pages {
            state.volatile.remove(&index);
            if matches!(state.slots[index], PageSlot::Purged) {
                state.slots[index] = PageSlot::Unresolved;
                survived = false;
            }
        }
        if survived {
            ContentState::Preserved
        } else {
            ContentState::Purged
        }
    }

    /// Reclaim every materialized volatile page, marking its slot purged.
    ///
    /// Returns the taken pages so the caller can tear down any live
    /// translations before letting the frames go: a concurrent fault
    /// either still sees the old frame (kept alive by the returned `Arc`
    /// until the caller drops it) or sees the purged slot and
    /// materializes a fresh one.
    #[must_use]
    pub fn purge_volatile(&self) -> Vec<(usize, PageRef)> {
        let mut state = self.state.lock();
        let volatile: Vec<usize> = state.volatile.iter().copied().collect();
        let mut purged = Vec::new();
        for index in volatile {
            if matches!(state.slots[index], PageSlot::Resolved(_)) {
                let slot = core::mem::replace(&mut state.slots[index], PageSlot::Purged);
                state.private.remove(&index);
                if let PageSlot::Resolved(page) = slot {
                    purged.push((index, page));
                }
            }
        }
        if !purged.is_empty() {
            debug!("purged {} volatile pages", purged.len());
        }
        purged
    }
}
