use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::PageFrameNumber;
use kernel_sync::SpinLock;

const BITS_PER_WORD: u64 = u64::BITS as u64;

/// Free/used state of one region's frames. A set bit means *allocated*.
///
/// First-fit with a rotating hint: single-frame allocation resumes where
/// the previous one left off, so sequential allocations walk the region
/// instead of hammering its first free word.
struct FrameBitmap {
    words: Vec<u64>,
    frames: u64,
    free: u64,
    hint: u64,
}

impl FrameBitmap {
    fn new(frames: u64) -> Self {
        let words = frames.div_ceil(BITS_PER_WORD) as usize;
        Self {
            words: vec![0; words],
            frames,
            free: frames,
            hint: 0,
        }
    }

    #[inline]
    fn is_set(&self, index: u64) -> bool {
        self.words[(index / BITS_PER_WORD) as usize] & (1 << (index % BITS_PER_WORD)) != 0
    }

    #[inline]
    fn set(&mut self, index: u64) {
        debug_assert!(!self.is_set(index), "frame double-allocated");
        self.words[(index / BITS_PER_WORD) as usize] |= 1 << (index % BITS_PER_WORD);
        self.free -= 1;
    }

    #[inline]
    fn clear(&mut self, index: u64) {
        debug_assert!(self.is_set(index), "frame double-freed");
        self.words[(index / BITS_PER_WORD) as usize] &= !(1 << (index % BITS_PER_WORD));
        self.free += 1;
    }

    /// Allocate one frame, scanning from the hint and wrapping once.
    fn take_one(&mut self) -> Option<u64> {
        if self.free == 0 {
            return None;
        }
        let start = self.hint;
        let mut index = start;
        loop {
            if !self.is_set(index) {
                self.set(index);
                self.hint = (index + 1) % self.frames;
                return Some(index);
            }
            index = (index + 1) % self.frames;
            if index == start {
                return None;
            }
        }
    }

    /// Allocate `count` physically consecutive frames, first fit from the
    /// start of the region (contiguity beats hint locality here).
    fn take_run(&mut self, count: u64) -> Option<u64> {
        if count == 0 || count > self.free {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.frames {
            if self.is_set(index) {
                run_len = 0;
                run_start = index + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    for i in run_start..run_start + count {
                        self.set(i);
                    }
                    return Some(run_start);
                }
            }
        }
        None
    }
}

/// A contiguous run of physical frames under allocator management.
///
/// Created at boot from the memory map and never destroyed. The free
/// bitmap sits behind a per-region spin lock so that allocation pressure
/// on one region does not serialize the others.
pub struct PhysicalRegion {
    base: PageFrameNumber,
    frames: u64,
    bitmap: SpinLock<FrameBitmap>,
}

impl PhysicalRegion {
    #[must_use]
    pub fn new(base: PageFrameNumber, frames: u64) -> Self {
        Self {
            base,
            frames,
            bitmap: SpinLock::new(FrameBitmap::new(frames)),
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PageFrameNumber {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.frames
    }

    #[inline]
    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.bitmap.lock().free
    }

    /// Whether `frame` belongs to this region.
    #[inline]
    #[must_use]
    pub fn owns(&self, frame: PageFrameNumber) -> bool {
        frame >= self.base && frame.as_u64() < self.base.as_u64() + self.frames
    }

    /// Allocate one frame from this region.
    pub(crate) fn take_one(&self) -> Option<PageFrameNumber> {
        let index = self.bitmap.lock().take_one()?;
        Some(self.base.plus(index))
    }

    /// Allocate `count` consecutive frames from this region.
    pub(crate) fn take_run(&self, count: u64) -> Option<PageFrameNumber> {
        let start = self.bitmap.lock().take_run(count)?;
        Some(self.base.plus(start))
    }

    /// Return a frame to the free bitmap. Called from [`PhysicalPage`]'s
    /// drop when the last reference goes away.
    ///
    /// [`PhysicalPage`]: crate::PhysicalPage
    pub(crate) fn release(&self, frame: PageFrameNumber) {
        debug_assert!(self.owns(frame));
        self.bitmap.lock().clear(frame.as_u64() - self.base.as_u64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_one_rotates_and_wraps() {
        let region = PhysicalRegion::new(PageFrameNumber::new(16), 4);
        let a = region.take_one().unwrap();
        let b = region.take_one().unwrap();
        assert_eq!(a, PageFrameNumber::new(16));
        assert_eq!(b, PageFrameNumber::new(17));

        region.release(a);
        // hint sits past `b`; the free frame behind it is still found
        let c = region.take_one().unwrap();
        let d = region.take_one().unwrap();
        let e = region.take_one().unwrap();
        assert_eq!(c, PageFrameNumber::new(18));
        assert_eq!(d, PageFrameNumber::new(19));
        assert_eq!(e, a);
        assert!(region.take_one().is_none());
    }

    #[test]
    fn take_run_finds_contiguous_gap() {
        let region = PhysicalRegion::new(PageFrameNumber::new(0), 8);
        let first = region.take_one().unwrap(); // frame 0
        let _second = region.take_one().unwrap(); // frame 1
        region.release(first);

        // the single free frame 0 cannot satisfy a run of 3
        let run = region.take_run(3).unwrap();
        assert_eq!(run, PageFrameNumber::new(2));
        assert_eq!(region.free_frames(), 8 - 4);
    }

    #[test]
    fn take_run_larger_than_free_fails() {
        let region = PhysicalRegion::new(PageFrameNumber::new(0), 4);
        assert!(region.take_run(5).is_none());
        assert_eq!(region.free_frames(), 4);
    }

    #[test]
    fn release_restores_free_count() {
        let region = PhysicalRegion::new(PageFrameNumber::new(0), 64 + 3);
        let mut taken = Vec::new();
        for _ in 0..67 {
            taken.push(region.take_one().unwrap());
        }
        assert_eq!(region.free_frames(), 0);
        for frame in taken {
            region.release(frame);
        }
        assert_eq!(region.free_frames(), 67);
    }
}
