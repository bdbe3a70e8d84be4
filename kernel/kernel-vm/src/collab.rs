//! Seams to the subsystems this crate deliberately does not own: the
//! filesystem's page interface and the scheduler's blocking/signalling
//! machinery. Production wires these to the real kernel services; tests
//! substitute recording fakes.

use crate::error::IoError;
use kernel_memory_addresses::PageFrameNumber;

/// Opaque identity of a file providing pages to an inode-backed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InodeId(pub u64);

/// Opaque identity of a thread, for fault signal delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub u64);

/// Token for one in-flight page store operation; the faulting thread
/// blocks on it until the store completes the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle(pub u64);

/// Signal kinds deliverable to a faulting thread. Process-fatal by
/// default, never kernel-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultSignal {
    /// No region covers the faulting address.
    SegmentationViolation,

    /// The backing store failed, or memory ran out mid-fault.
    BusError,

    /// The region exists but forbids the attempted access.
    ProtectionViolation,
}

/// The filesystem collaborator: page-granular file I/O.
///
/// Reads are split in two so the fault path can block the faulting thread
/// between them: [`begin_read`](Self::begin_read) starts the transfer into
/// `destination` and returns a handle, the caller blocks on the handle
/// through [`ThreadServices::block_current_thread_on`], and
/// [`finish_read`](Self::finish_read) collects the result. A thread
/// blocked this way is reaped only after the transfer completes.
pub trait PageStore: Send + Sync {
    /// Start reading page `page_index` of `inode` into `destination`.
    ///
    /// # Errors
    /// [`IoError`] if the transfer cannot be started.
    fn begin_read(
        &self,
        inode: InodeId,
        page_index: u64,
        destination: PageFrameNumber,
    ) -> Result<IoHandle, IoError>;

    /// Collect the result of a completed transfer.
    ///
    /// # Errors
    /// [`IoError`] if the transfer failed.
    fn finish_read(&self, handle: IoHandle) -> Result<(), IoError>;

    /// Write page `page_index` of `inode` back from `source` (dirty-page
    /// writeback of shared file mappings). Synchronous.
    ///
    /// # Errors
    /// [`IoError`] if the write fails.
    fn write_page(
        &self,
        inode: InodeId,
        page_index: u64,
        source: PageFrameNumber,
    ) -> Result<(), IoError>;
}

/// The scheduler collaborator.
pub trait ThreadServices: Send + Sync {
    /// Suspend the calling thread until the store operation behind
    /// `handle` completes. The only blocking point on the fault path.
    fn block_current_thread_on(&self, handle: IoHandle);

    /// Deliver a fault signal to `thread`.
    fn deliver_fault_signal(&self, thread: ThreadId, signal: FaultSignal);
}
