//! Simulated platform for exercising the full subsystem on the host:
//! RAM as a vector of aligned buffers, a recording TLB sink, an
//! in-memory page store and a recording scheduler fake.

#![allow(dead_code)]

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kernel_frames::{FrameAllocator, MemoryMapEntry};
use kernel_memory_addresses::{
    PAGE_BYTES, PAGE_SIZE, PageFrameNumber, PhysMapper, PhysicalAddress, VirtualAddress,
    frame_bytes,
};
use kernel_paging::{EntryFlags, TlbMaintenance};
use kernel_vm::{
    AccessKind, FaultContext, FaultOutcome, FaultSignal, InodeId, IoError, IoHandle,
    MemoryManager, PageStore, PurgeConfig, ThreadId, ThreadServices, AddressSpace,
};

#[repr(align(4096))]
struct Frame(UnsafeCell<[u8; PAGE_BYTES]>);

struct SimInner {
    frames: Vec<Frame>,
    invalidations: Mutex<Vec<(PageFrameNumber, VirtualAddress)>>,
}

// frames are handed out as &mut through PhysMapper; exclusivity is the
// allocator's and the locks' job, exactly as on hardware
unsafe impl Sync for SimInner {}
unsafe impl Send for SimInner {}

/// Cheaply cloneable handle to one simulated machine.
#[derive(Clone)]
pub struct SimPlatform(Arc<SimInner>);

impl SimPlatform {
    pub fn new(frames: usize) -> Self {
        let mut buffer = Vec::with_capacity(frames);
        buffer.resize_with(frames, || Frame(UnsafeCell::new([0xAA; PAGE_BYTES])));
        Self(Arc::new(SimInner {
            frames: buffer,
            invalidations: Mutex::new(Vec::new()),
        }))
    }

    pub fn invalidation_count(&self) -> usize {
        self.0.invalidations.lock().unwrap().len()
    }
}

impl PhysMapper for SimPlatform {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let index = (pa.as_u64() / PAGE_SIZE) as usize;
        unsafe { &mut *self.0.frames[index].0.get().cast::<T>() }
    }
}

impl TlbMaintenance for SimPlatform {
    fn invalidate_page(&self, root: PageFrameNumber, va: VirtualAddress) {
        self.0.invalidations.lock().unwrap().push((root, va));
    }

    fn invalidate_all(&self, _root: PageFrameNumber) {}
}

/// In-memory inode pages with recorded writebacks and injectable read
/// failures.
pub struct FakeStore {
    platform: SimPlatform,
    pages: Mutex<HashMap<(InodeId, u64), [u8; PAGE_BYTES]>>,
    pending: Mutex<HashMap<u64, (InodeId, u64, PageFrameNumber)>>,
    next_handle: AtomicU64,
    pub writebacks: Mutex<Vec<(InodeId, u64, u8)>>,
    pub fail_reads: AtomicBool,
}

impl FakeStore {
    pub fn new(platform: SimPlatform) -> Arc<Self> {
        Arc::new(Self {
            platform,
            pages: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            writebacks: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
        })
    }

    /// Seed page `index` of `inode` with `fill` bytes.
    pub fn put_page(&self, inode: InodeId, index: u64, fill: u8) {
        self.pages
            .lock()
            .unwrap()
            .insert((inode, index), [fill; PAGE_BYTES]);
    }
}

impl PageStore for FakeStore {
    fn begin_read(
        &self,
        inode: InodeId,
        page_index: u64,
        destination: PageFrameNumber,
    ) -> Result<IoHandle, IoError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(IoError);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.pending
            .lock()
            .unwrap()
            .insert(handle, (inode, page_index, destination));
        Ok(IoHandle(handle))
    }

    fn finish_read(&self, handle: IoHandle) -> Result<(), IoError> {
        let (inode, index, destination) = self
            .pending
            .lock()
            .unwrap()
            .remove(&handle.0)
            .ok_or(IoError)?;
        let content = self
            .pages
            .lock()
            .unwrap()
            .get(&(inode, index))
            .copied()
            .unwrap_or([0; PAGE_BYTES]);
        unsafe { frame_bytes(&self.platform, destination) }.copy_from_slice(&content);
        Ok(())
    }

    fn write_page(
        &self,
        inode: InodeId,
        page_index: u64,
        source: PageFrameNumber,
    ) -> Result<(), IoError> {
        let first = unsafe { frame_bytes(&self.platform, source) }[0];
        self.writebacks
            .lock()
            .unwrap()
            .push((inode, page_index, first));
        Ok(())
    }
}

/// Records who blocked and which signals were delivered.
#[derive(Default)]
pub struct FakeThreads {
    pub blocked: Mutex<Vec<IoHandle>>,
    pub signals: Mutex<Vec<(ThreadId, FaultSignal)>>,
}

impl ThreadServices for FakeThreads {
    fn block_current_thread_on(&self, handle: IoHandle) {
        self.blocked.lock().unwrap().push(handle);
    }

    fn deliver_fault_signal(&self, thread: ThreadId, signal: FaultSignal) {
        self.signals.lock().unwrap().push((thread, signal));
    }
}

pub struct Harness {
    pub platform: SimPlatform,
    pub mgr: MemoryManager<SimPlatform>,
    pub store: Arc<FakeStore>,
    pub threads: Arc<FakeThreads>,
}

pub fn harness(total_frames: u64) -> Harness {
    harness_with(total_frames, PurgeConfig::default())
}

pub fn harness_with(total_frames: u64, config: PurgeConfig) -> Harness {
    let platform = SimPlatform::new(total_frames as usize);
    let frames = Arc::new(FrameAllocator::from_memory_map(&[
        MemoryMapEntry::conventional(PhysicalAddress::zero(), total_frames),
    ]));
    let store = FakeStore::new(platform.clone());
    let threads = Arc::new(FakeThreads::default());
    let mgr = MemoryManager::new(
        platform.clone(),
        frames,
        store.clone(),
        threads.clone(),
        std::iter::empty::<(VirtualAddress, PageFrameNumber, EntryFlags)>(),
        config,
    )
    .unwrap();
    Harness {
        platform,
        mgr,
        store,
        threads,
    }
}

/// Emulate one user-mode byte read: walk the table like the MMU would,
/// faulting until the page is present.
pub fn read_at(h: &Harness, space: &AddressSpace, va: VirtualAddress) -> Result<u8, FaultSignal> {
    loop {
        if let Some((pfn, _)) = space.translate(&h.platform, va.page_base()) {
            let bytes = unsafe { frame_bytes(&h.platform, pfn) };
            return Ok(bytes[va.offset_in_page() as usize]);
        }
        match h.mgr.page_fault(space, va, AccessKind::Read, FaultContext::User) {
            FaultOutcome::Resolved => {}
            FaultOutcome::Fatal(signal) => return Err(signal),
        }
    }
}

/// Emulate one user-mode byte write, faulting on absence or a read-only
/// mapping (how copy-on-write gets triggered on hardware).
pub fn write_at(
    h: &Harness,
    space: &AddressSpace,
    va: VirtualAddress,
    value: u8,
) -> Result<(), FaultSignal> {
    loop {
        if let Some((pfn, flags)) = space.translate(&h.platform, va.page_base())
            && flags.contains(EntryFlags::WRITABLE)
        {
            let bytes = unsafe { frame_bytes(&h.platform, pfn) };
            bytes[va.offset_in_page() as usize] = value;
            return Ok(());
        }
        match h.mgr.page_fault(space, va, AccessKind::Write, FaultContext::User) {
            FaultOutcome::Resolved => {}
            FaultOutcome::Fatal(signal) => return Err(signal),
        }
    }
}

pub fn va(addr: u64) -> VirtualAddress {
    VirtualAddress::new(addr)
}
