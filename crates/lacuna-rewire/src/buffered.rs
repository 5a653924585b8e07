//! Spare-buffer pool on top of [`RewiredMemory`].

use crate::rewired::RewiredMemory;
use lacuna_common::Result;
use std::ptr::NonNull;
use tracing::trace;

/// A rewired span plus a pool of spare extents.
///
/// A spread engine that works backwards through a window acquires a spare
/// buffer whenever source and destination extents overlap, writes the new
/// layout into the buffer, and later swaps the buffer's frames into place,
/// releasing the displaced frames back into the pool.
///
/// Acquire and swap-release must pair exactly: every buffer handed out by
/// [`acquire_buffer`] must be returned through [`swap_and_release`] before
/// the spread finishes.
///
/// [`acquire_buffer`]: BufferedRewiredMemory::acquire_buffer
/// [`swap_and_release`]: BufferedRewiredMemory::swap_and_release
pub struct BufferedRewiredMemory {
    mem: RewiredMemory,
    /// Spare extents not currently handed out.
    spare: Vec<NonNull<u8>>,
    handed_out: usize,
}

impl BufferedRewiredMemory {
    /// Creates a span of `num_extents` extents with an empty spare pool.
    pub fn new(pages_per_extent: usize, num_extents: usize) -> Result<Self> {
        Ok(Self {
            mem: RewiredMemory::new(pages_per_extent, num_extents)?,
            spare: Vec::new(),
            handed_out: 0,
        })
    }

    /// Hands out one spare extent, allocating a fresh one if the pool is dry.
    ///
    /// The contents of the returned buffer are unspecified.
    pub fn acquire_buffer(&mut self) -> Result<*mut u8> {
        let buffer = match self.spare.pop() {
            Some(buffer) => buffer,
            None => self.mem.alloc_spare_extent()?,
        };
        self.handed_out += 1;
        trace!(addr = ?buffer.as_ptr(), in_use = self.handed_out, "buffer acquired");
        Ok(buffer.as_ptr())
    }

    /// Swaps the frames backing `src` into the extent at `dst` and returns
    /// `src` to the spare pool.
    ///
    /// `dst` keeps its virtual address and now shows the bytes written into
    /// `src`; the contents of `src` become unspecified.
    pub fn swap_and_release(&mut self, dst: *mut u8, src: *mut u8) -> Result<()> {
        assert!(self.handed_out > 0, "swap_and_release without acquire");
        self.mem.swap_frames(dst, src)?;
        self.spare.push(NonNull::new(src).expect("null spare buffer"));
        self.handed_out -= 1;
        trace!(dst = ?dst, in_use = self.handed_out, "buffer swapped in");
        Ok(())
    }

    /// Returns a buffer to the spare pool without swapping its frames.
    ///
    /// For callers that installed the buffer's contents by other means (or
    /// not at all); the frames keep backing the spare's virtual range and
    /// the buffer is handed out again by the next acquire.
    pub fn release_buffer(&mut self, src: *mut u8) {
        assert!(self.handed_out > 0, "release_buffer without acquire");
        self.spare.push(NonNull::new(src).expect("null spare buffer"));
        self.handed_out -= 1;
        trace!(src = ?src, in_use = self.handed_out, "buffer returned unswapped");
    }

    /// Number of buffers currently handed out.
    pub fn get_used_buffers(&self) -> usize {
        self.handed_out
    }

    /// Appends `delta_extents` extents of logically zeroed memory.
    pub fn extend(&mut self, delta_extents: usize) -> Result<()> {
        self.mem.extend(delta_extents)
    }

    /// Returns whether [`extend`](Self::extend) of `delta_extents` can succeed.
    pub fn can_extend(&self, delta_extents: usize) -> bool {
        self.mem.can_extend(delta_extents)
    }

    /// Start of the logical content.
    pub fn start_address(&self) -> *mut u8 {
        self.mem.start_address()
    }

    /// Extent size in bytes.
    pub fn extent_size(&self) -> usize {
        self.mem.extent_size()
    }

    /// Current logical content size in bytes.
    pub fn len_bytes(&self) -> usize {
        self.mem.len_bytes()
    }

    /// Total reserved span in bytes.
    pub fn max_memory(&self) -> usize {
        self.mem.max_memory()
    }

    /// Number of logical extents currently mapped.
    pub fn num_extents(&self) -> usize {
        self.mem.num_extents()
    }
}
