use crate::{PAGE_BYTES, PageFrameNumber, PhysicalAddress};

/// Converts physical addresses to usable pointers in the current virtual
/// address space.
///
/// The kernel implements this over its identity map or higher-half direct
/// map; host tests implement it over an owned buffer of 4 KiB-aligned
/// frames. Everything that touches frame contents — zero-fill, copy-on-write
/// duplication, demand-paged reads, page-table walks — goes through this
/// seam, which is what keeps the rest of the subsystem testable off target.
pub trait PhysMapper {
    /// Convert a physical address to a mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped and writable in the current address space for
    ///   the lifetime the caller holds the reference.
    /// - The bytes at `pa` must be a valid `T`, and the caller must not
    ///   create aliasing references to them.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// View the contents of a physical frame as a byte array.
///
/// # Safety
/// The frame must be RAM owned by the caller (e.g. handed out by the frame
/// allocator) and not concurrently aliased through another reference.
#[inline]
#[must_use]
pub unsafe fn frame_bytes<'a, M: PhysMapper>(
    mapper: &M,
    frame: PageFrameNumber,
) -> &'a mut [u8; PAGE_BYTES] {
    unsafe { mapper.phys_to_mut::<[u8; PAGE_BYTES]>(frame.base()) }
}

/// Overwrite a frame with zeroes.
///
/// # Safety
/// Same requirements as [`frame_bytes`].
#[inline]
pub unsafe fn zero_frame<M: PhysMapper>(mapper: &M, frame: PageFrameNumber) {
    unsafe { frame_bytes(mapper, frame) }.fill(0);
}

/// Copy the contents of frame `src` into frame `dst`.
///
/// # Safety
/// Same requirements as [`frame_bytes`], for both frames; `src` and `dst`
/// must be distinct frames.
#[inline]
pub unsafe fn copy_frame<M: PhysMapper>(
    mapper: &M,
    src: PageFrameNumber,
    dst: PageFrameNumber,
) {
    debug_assert!(src != dst);
    let from = unsafe { frame_bytes(mapper, src) };
    let to = unsafe { frame_bytes(mapper, dst) };
    to.copy_from_slice(from);
}
