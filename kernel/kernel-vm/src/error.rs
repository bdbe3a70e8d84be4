use crate::collab::FaultSignal;
use kernel_frames::OutOfMemory;

/// A read or write through the page store failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("backing store I/O failed")]
pub struct IoError;

/// Virtual range allocation failure. Recoverable; surfaces at the
/// mmap-style call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    /// No free range of the requested size and alignment exists.
    #[error("no virtual range of the requested size is available")]
    NoSpace,

    /// The requested fixed range overlaps an existing mapping.
    #[error("the requested virtual range conflicts with an existing mapping")]
    Conflict,
}

/// Why a page could not be resolved on the fault path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    /// The access requires a permission the mapping does not grant.
    #[error("access not permitted by the mapping")]
    BadAccess,

    /// The demand-paging read from the backing store failed.
    #[error(transparent)]
    Io(#[from] IoError),

    /// No frame could be allocated for the page.
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
}

impl FaultError {
    /// The signal delivered to the faulting thread for this error. The
    /// process may die; the kernel carries on.
    #[must_use]
    pub fn signal(self) -> FaultSignal {
        match self {
            Self::BadAccess => FaultSignal::ProtectionViolation,
            Self::Io(_) | Self::OutOfMemory(_) => FaultSignal::BusError,
        }
    }
}

/// What became of one page fault. Returned to the trap dispatcher, which
/// resumes the thread or performs the signal delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The mapping was installed; re-run the faulting instruction.
    Resolved,

    /// Fatal to the access. Deliver the signal to the faulting thread.
    Fatal(FaultSignal),
}

/// Umbrella error at the syscall-facing surface of the memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Io(#[from] IoError),

    /// The given range or address is not covered by a suitable region.
    #[error("no region covers the given range")]
    NoSuchRegion,

    /// A range argument was not page-aligned or was empty.
    #[error("range is empty or not page-aligned")]
    BadRange,
}
