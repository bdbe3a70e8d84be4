use crate::{
    EntryFlags, KERNEL_SPLIT_SLOT, PageEntryBits, PageTable, TlbMaintenance, directory_index,
    table_index,
};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_frames::{FrameAllocator, OutOfMemory, PageRef};
use kernel_memory_addresses::{PageFrameNumber, PhysMapper, VirtualAddress};
use kernel_sync::SpinLock;
use log::trace;

/// Map a physical page-table frame and return a mutable reference to it.
///
/// # Safety
/// `frame` must hold a page table owned by this subsystem, and the caller
/// must hold whatever lock makes the access exclusive (the owning address
/// space's lock, or sole ownership during construction).
#[inline]
unsafe fn table_mut<'a, M: PhysMapper>(mapper: &M, frame: PageFrameNumber) -> &'a mut PageTable {
    unsafe { mapper.phys_to_mut::<PageTable>(frame.base()) }
}

/// The kernel half's page tables, built once at boot and aliased into
/// every address space's directory. The template owns its table frames;
/// directories reference them through shared [`PageRef`]s, so the frames
/// live as long as any address space does.
pub struct KernelTables {
    /// Directory slot → table frame, ascending.
    tables: Vec<(u32, PageRef)>,
}

impl KernelTables {
    /// Build the template from the kernel's permanent mappings.
    ///
    /// Every mapping must lie in the kernel half; the leaves are installed
    /// with [`EntryFlags::GLOBAL`] forced and `USER` stripped.
    ///
    /// # Errors
    /// [`OutOfMemory`] if a table frame cannot be allocated.
    pub fn build<M: PhysMapper>(
        mapper: &M,
        frames: &FrameAllocator,
        mappings: impl IntoIterator<Item = (VirtualAddress, PageFrameNumber, EntryFlags)>,
    ) -> Result<Arc<Self>, OutOfMemory> {
        let mut tables: BTreeMap<u32, PageRef> = BTreeMap::new();
        for (va, frame, flags) in mappings {
            let slot = directory_index(va);
            debug_assert!(slot >= KERNEL_SPLIT_SLOT, "kernel mapping below split");
            let table = match tables.get(&slot) {
                Some(table) => Arc::clone(table),
                None => {
                    let table = frames.allocate_zero_frame(mapper)?;
                    tables.insert(slot, Arc::clone(&table));
                    table
                }
            };
            let leaf = PageEntryBits::leaf(frame, (flags | EntryFlags::GLOBAL) - EntryFlags::USER);
            // Safety: freshly allocated table frames, sole owner during boot.
            unsafe { table_mut(mapper, table.frame()) }.set_entry(table_index(va), leaf);
        }
        Ok(Arc::new(Self {
            tables: tables.into_iter().collect(),
        }))
    }

    /// An empty template (no permanent kernel mappings). Useful for tests.
    #[must_use]
    pub fn empty() -> Arc<Self> {
        Arc::new(Self { tables: Vec::new() })
    }
}

/// The two-level translation structure for one address space.
///
/// Owns its root frame and the user-half table frames; leaf frames are
/// referenced only by frame number (the backing objects own them). All
/// mutation must happen under the owning address space's lock; every
/// mutation completes its TLB shootdown before returning.
pub struct PageDirectory {
    root: PageRef,
    /// User-half directory slot → table frame.
    tables: SpinLock<BTreeMap<u32, PageRef>>,
    kernel: Arc<KernelTables>,
}

impl PageDirectory {
    /// Create a directory with an empty user half and the kernel half
    /// aliased from `kernel`.
    ///
    /// # Errors
    /// [`OutOfMemory`] if the root frame cannot be allocated.
    pub fn new<M: PhysMapper>(
        mapper: &M,
        frames: &FrameAllocator,
        kernel: Arc<KernelTables>,
    ) -> Result<Self, OutOfMemory> {
        let root = frames.allocate_zero_frame(mapper)?;
        // Safety: the root frame was just allocated; we are the only owner.
        let root_table = unsafe { table_mut(mapper, root.frame()) };
        for (slot, table) in &kernel.tables {
            root_table.set_entry(*slot, PageEntryBits::table(table.frame(), false));
        }
        Ok(Self {
            root,
            tables: SpinLock::new(BTreeMap::new()),
            kernel,
        })
    }

    /// Physical frame of the root table (what the hardware register would
    /// be loaded with on a context switch).
    #[inline]
    #[must_use]
    pub fn root_frame(&self) -> PageFrameNumber {
        self.root.frame()
    }

    /// Install a leaf mapping `va → frame` and invalidate the translation
    /// everywhere. Replaces any existing leaf and returns its frame number.
    ///
    /// # Errors
    /// [`OutOfMemory`] if a new page table is needed and cannot be
    /// allocated; the directory is unchanged in that case.
    pub fn map<P: PhysMapper + TlbMaintenance>(
        &self,
        platform: &P,
        frames: &FrameAllocator,
        va: VirtualAddress,
        frame: PageFrameNumber,
        flags: EntryFlags,
    ) -> Result<Option<PageFrameNumber>, OutOfMemory> {
        let slot = directory_index(va);
        debug_assert!(slot < KERNEL_SPLIT_SLOT, "mapping into the kernel half");
        debug_assert!(va.is_page_aligned());

        let table_frame = {
            let mut tables = self.tables.lock();
            match tables.get(&slot) {
                Some(table) => table.frame(),
                None => {
                    let table = frames.allocate_zero_frame(platform)?;
                    let table_frame = table.frame();
                    // Safety: mutation under the owning space's lock.
                    unsafe { table_mut(platform, self.root.frame()) }
                        .set_entry(slot, PageEntryBits::table(table_frame, true));
                    tables.insert(slot, table);
                    table_frame
                }
            }
        };

        // Safety: mutation under the owning space's lock.
        let table = unsafe { table_mut(platform, table_frame) };
        let index = table_index(va);
        let previous = table.entry(index);
        table.set_entry(index, PageEntryBits::leaf(frame, flags));
        platform.invalidate_page(self.root_frame(), va);

        trace!("map {va:?} -> {frame:?} ({flags:?})");
        Ok(previous.present().then(|| previous.frame_number()))
    }

    /// Remove the leaf mapping of `va`, invalidate it everywhere, and
    /// return the frame it mapped.
    pub fn unmap<P: PhysMapper + TlbMaintenance>(
        &self,
        platform: &P,
        va: VirtualAddress,
    ) -> Option<PageFrameNumber> {
        let slot = directory_index(va);
        debug_assert!(slot < KERNEL_SPLIT_SLOT, "unmapping the kernel half");
        let table_frame = self.tables.lock().get(&slot).map(|t| t.frame())?;

        // Safety: mutation under the owning space's lock.
        let table = unsafe { table_mut(platform, table_frame) };
        let index = table_index(va);
        let entry = table.entry(index);
        if !entry.present() {
            return None;
        }
        table.set_entry(index, PageEntryBits::new());
        platform.invalidate_page(self.root_frame(), va);
        Some(entry.frame_number())
    }

    /// Translate a virtual page to its mapped frame and flags.
    #[must_use]
    pub fn translate<M: PhysMapper>(
        &self,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<(PageFrameNumber, EntryFlags)> {
        let slot = directory_index(va);
        // Safety: reads are safe under any of the involved locks; the root
        // frame is owned by this directory.
        let root = unsafe { table_mut(mapper, self.root.frame()) };
        let pde = root.entry(slot);
        if !pde.present() {
            return None;
        }
        // Safety: present directory entries always point at live tables.
        let table = unsafe { table_mut(mapper, pde.frame_number()) };
        let pte = table.entry(table_index(va));
        pte.present().then(|| (pte.frame_number(), pte.flags()))
    }

    /// Update the flags of an existing leaf without changing the frame.
    /// Returns `false` if `va` has no mapping.
    pub fn set_flags<P: PhysMapper + TlbMaintenance>(
        &self,
        platform: &P,
        va: VirtualAddress,
        flags: EntryFlags,
    ) -> bool {
        let slot = directory_index(va);
        debug_assert!(slot < KERNEL_SPLIT_SLOT);
        let Some(table_frame) = self.tables.lock().get(&slot).map(|t| t.frame()) else {
            return false;
        };
        // Safety: mutation under the owning space's lock.
        let table = unsafe { table_mut(platform, table_frame) };
        let index = table_index(va);
        let entry = table.entry(index);
        if !entry.present() {
            return false;
        }
        table.set_entry(index, PageEntryBits::leaf(entry.frame_number(), flags));
        platform.invalidate_page(self.root_frame(), va);
        true
    }

    /// Duplicate the table *structure* for fork: the user half gets fresh
    /// table frames holding copies of the parent's entries (same leaf
    /// frames — page sharing is the backing objects' business), the kernel
    /// half keeps aliasing the shared template.
    ///
    /// # Errors
    /// [`OutOfMemory`] if a frame cannot be allocated.
    pub fn clone_structure<M: PhysMapper>(
        &self,
        mapper: &M,
        frames: &FrameAllocator,
    ) -> Result<Self, OutOfMemory> {
        let clone = Self::new(mapper, frames, Arc::clone(&self.kernel))?;
        let parent_tables = self.tables.lock();
        let mut child_tables = clone.tables.lock();
        // Safety: the child root is exclusively ours; the parent is read
        // under its space's lock.
        let child_root = unsafe { table_mut(mapper, clone.root.frame()) };
        for (slot, parent_table) in parent_tables.iter() {
            let child_table = frames.allocate_zero_frame(mapper)?;
            // Safety: as above.
            let src = unsafe { table_mut(mapper, parent_table.frame()) };
            let dst = unsafe { table_mut(mapper, child_table.frame()) };
            for index in 0..crate::TABLE_ENTRIES as u32 {
                dst.set_entry(index, src.entry(index));
            }
            child_root.set_entry(*slot, PageEntryBits::table(child_table.frame(), true));
            child_tables.insert(*slot, child_table);
        }
        drop(child_tables);
        Ok(clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KERNEL_BASE;
    use core::cell::{RefCell, UnsafeCell};
    use kernel_frames::MemoryMapEntry;
    use kernel_memory_addresses::{PAGE_BYTES, PAGE_SIZE, PhysicalAddress};

    /// Simulated RAM plus a recording TLB sink.
    #[repr(align(4096))]
    struct Frame(UnsafeCell<[u8; PAGE_BYTES]>);

    struct Platform {
        frames: Vec<Frame>,
        invalidations: RefCell<Vec<(PageFrameNumber, VirtualAddress)>>,
    }

    impl Platform {
        fn new(count: usize) -> Self {
            let mut frames = Vec::with_capacity(count);
            frames.resize_with(count, || Frame(UnsafeCell::new([0; PAGE_BYTES])));
            Self {
                frames,
                invalidations: RefCell::new(Vec::new()),
            }
        }
    }

    impl PhysMapper for Platform {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let index = (pa.as_u64() / PAGE_SIZE) as usize;
            unsafe { &mut *self.frames[index].0.get().cast::<T>() }
        }
    }

    impl TlbMaintenance for Platform {
        fn invalidate_page(&self, root: PageFrameNumber, va: VirtualAddress) {
            self.invalidations.borrow_mut().push((root, va));
        }

        fn invalidate_all(&self, _root: PageFrameNumber) {}
    }

    fn setup(frames: u64) -> (Platform, FrameAllocator) {
        let platform = Platform::new(frames as usize);
        let alloc = FrameAllocator::from_memory_map(&[MemoryMapEntry::conventional(
            PhysicalAddress::zero(),
            frames,
        )]);
        (platform, alloc)
    }

    fn va(addr: u64) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    #[test]
    fn map_then_translate() {
        let (platform, alloc) = setup(32);
        let pd = PageDirectory::new(&platform, &alloc, KernelTables::empty()).unwrap();

        let frame = PageFrameNumber::new(20);
        let previous = pd
            .map(&platform, &alloc, va(0x40_0000), frame, EntryFlags::WRITABLE)
            .unwrap();
        assert_eq!(previous, None);

        let (mapped, flags) = pd.translate(&platform, va(0x40_0000)).unwrap();
        assert_eq!(mapped, frame);
        assert_eq!(flags, EntryFlags::WRITABLE);
        assert!(pd.translate(&platform, va(0x40_1000)).is_none());
    }

    #[test]
    fn map_replaces_and_reports_previous_frame() {
        let (platform, alloc) = setup(32);
        let pd = PageDirectory::new(&platform, &alloc, KernelTables::empty()).unwrap();

        pd.map(&platform, &alloc, va(0x1000), PageFrameNumber::new(20), EntryFlags::empty())
            .unwrap();
        let previous = pd
            .map(&platform, &alloc, va(0x1000), PageFrameNumber::new(21), EntryFlags::empty())
            .unwrap();
        assert_eq!(previous, Some(PageFrameNumber::new(20)));
        let (mapped, _) = pd.translate(&platform, va(0x1000)).unwrap();
        assert_eq!(mapped, PageFrameNumber::new(21));
    }

    #[test]
    fn every_mutation_invalidates_the_translation() {
        let (platform, alloc) = setup(32);
        let pd = PageDirectory::new(&platform, &alloc, KernelTables::empty()).unwrap();
        let root = pd.root_frame();
        let addr = va(0x80_3000);

        pd.map(&platform, &alloc, addr, PageFrameNumber::new(25), EntryFlags::WRITABLE)
            .unwrap();
        pd.set_flags(&platform, addr, EntryFlags::empty());
        pd.unmap(&platform, addr);

        let invalidations = platform.invalidations.borrow();
        assert_eq!(invalidations.len(), 3);
        assert!(invalidations.iter().all(|&(r, v)| r == root && v == addr));
    }

    #[test]
    fn unmap_returns_the_frame_once() {
        let (platform, alloc) = setup(32);
        let pd = PageDirectory::new(&platform, &alloc, KernelTables::empty()).unwrap();

        pd.map(&platform, &alloc, va(0x2000), PageFrameNumber::new(22), EntryFlags::empty())
            .unwrap();
        assert_eq!(pd.unmap(&platform, va(0x2000)), Some(PageFrameNumber::new(22)));
        assert_eq!(pd.unmap(&platform, va(0x2000)), None);
        assert!(pd.translate(&platform, va(0x2000)).is_none());
    }

    #[test]
    fn set_flags_keeps_the_frame() {
        let (platform, alloc) = setup(32);
        let pd = PageDirectory::new(&platform, &alloc, KernelTables::empty()).unwrap();

        pd.map(&platform, &alloc, va(0x5000), PageFrameNumber::new(23), EntryFlags::WRITABLE)
            .unwrap();
        assert!(pd.set_flags(&platform, va(0x5000), EntryFlags::empty()));
        let (mapped, flags) = pd.translate(&platform, va(0x5000)).unwrap();
        assert_eq!(mapped, PageFrameNumber::new(23));
        assert_eq!(flags, EntryFlags::empty());
        assert!(!pd.set_flags(&platform, va(0x6000), EntryFlags::WRITABLE));
    }

    #[test]
    fn kernel_half_is_shared_between_directories() {
        let (platform, alloc) = setup(64);
        let kernel_frame = PageFrameNumber::new(60);
        let kernel = KernelTables::build(
            &platform,
            &alloc,
            [(va(KERNEL_BASE), kernel_frame, EntryFlags::WRITABLE)],
        )
        .unwrap();

        let a = PageDirectory::new(&platform, &alloc, Arc::clone(&kernel)).unwrap();
        let b = PageDirectory::new(&platform, &alloc, kernel).unwrap();

        let (fa, flags_a) = a.translate(&platform, va(KERNEL_BASE)).unwrap();
        let (fb, flags_b) = b.translate(&platform, va(KERNEL_BASE)).unwrap();
        assert_eq!(fa, kernel_frame);
        assert_eq!(fb, kernel_frame);
        assert_eq!(flags_a, flags_b);
        assert!(flags_a.contains(EntryFlags::GLOBAL));
        assert!(!flags_a.contains(EntryFlags::USER));
    }

    #[test]
    fn clone_structure_copies_leaves_but_not_tables() {
        let (platform, alloc) = setup(64);
        let parent = PageDirectory::new(&platform, &alloc, KernelTables::empty()).unwrap();
        parent
            .map(&platform, &alloc, va(0x3000), PageFrameNumber::new(40), EntryFlags::WRITABLE)
            .unwrap();

        let child = parent.clone_structure(&platform, &alloc).unwrap();
        assert_ne!(child.root_frame(), parent.root_frame());

        // same leaf frame visible in both
        let (pf, _) = parent.translate(&platform, va(0x3000)).unwrap();
        let (cf, _) = child.translate(&platform, va(0x3000)).unwrap();
        assert_eq!(pf, cf);

        // changes to one directory do not leak into the other
        child.unmap(&platform, va(0x3000));
        assert!(parent.translate(&platform, va(0x3000)).is_some());
        assert!(child.translate(&platform, va(0x3000)).is_none());
    }

    #[test]
    fn dropping_a_directory_releases_its_table_frames() {
        let (platform, alloc) = setup(32);
        let before = alloc.free_frames();
        let pd = PageDirectory::new(&platform, &alloc, KernelTables::empty()).unwrap();
        pd.map(&platform, &alloc, va(0x1000), PageFrameNumber::new(30), EntryFlags::empty())
            .unwrap();
        assert!(alloc.free_frames() < before);
        drop(pd);
        assert_eq!(alloc.free_frames(), before);
    }
}
