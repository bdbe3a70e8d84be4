use crate::region::PhysicalRegion;
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::PageFrameNumber;

/// A shared, reference-counted handle to an allocated [`PhysicalPage`].
///
/// The `Arc` strong count is the frame's reference count: backing objects
/// hold one reference per slot, forked objects hold another, and a count
/// greater than one is exactly the "shared frame" condition that triggers
/// copy-on-write. Page directories never hold a `PageRef`; they store only
/// the non-owning frame number.
pub type PageRef = Arc<PhysicalPage>;

/// Current reference count of a frame.
#[inline]
#[must_use]
pub fn ref_count(page: &PageRef) -> usize {
    Arc::strong_count(page)
}

/// One allocated physical frame.
///
/// Holds the frame number, the "shared zero page" marker, and a handle to
/// the owning region so the frame can return to that region's bitmap when
/// the last [`PageRef`] drops. There is no explicit free operation.
pub struct PhysicalPage {
    frame: PageFrameNumber,
    shared_zero: bool,
    owner: Arc<PhysicalRegion>,
}

impl PhysicalPage {
    pub(crate) fn new(frame: PageFrameNumber, shared_zero: bool, owner: Arc<PhysicalRegion>) -> Self {
        debug_assert!(owner.owns(frame));
        Self {
            frame,
            shared_zero,
            owner,
        }
    }

    /// The physical frame this page occupies.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PageFrameNumber {
        self.frame
    }

    /// Whether this is the system-wide shared zero frame. Such a frame is
    /// only ever mapped read-only; a write fault promotes the mapping to a
    /// private frame instead.
    #[inline]
    #[must_use]
    pub const fn is_shared_zero(&self) -> bool {
        self.shared_zero
    }
}

impl Drop for PhysicalPage {
    fn drop(&mut self) {
        self.owner.release(self.frame);
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("frame", &self.frame)
            .field("shared_zero", &self.shared_zero)
            .finish()
    }
}
