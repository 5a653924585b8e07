//! Virtual extent ranges backed by swappable physical frames.

use lacuna_common::{os_page_size, LacunaError, Result};
use std::io;
use std::ptr::NonNull;
use tracing::debug;

/// Sentinel for a slot of the virtual span with no frame mapped.
const UNMAPPED: usize = usize::MAX;

/// How much larger than the initial content the virtual reservation is.
///
/// The span can absorb this many doublings in place before the owner has
/// to fall back to allocating a fresh workspace.
const RESERVATION_FACTOR: usize = 64;

/// A range of virtual memory whose extents are backed by interchangeable
/// physical frames.
///
/// The span is reserved once (`PROT_NONE`, no commit) and subdivided into
/// extents of `pages_per_extent` OS pages. Each mapped extent views one
/// extent-sized frame of an anonymous memfd. Two mapped extents can have
/// their frames exchanged: the virtual addresses never change, only the
/// physical backing moves.
///
/// Logical content grows from the bottom of the span ([`extend`]); spare
/// extents (see [`crate::BufferedRewiredMemory`]) are carved from the top,
/// so the two never collide until the reservation is exhausted.
///
/// [`extend`]: RewiredMemory::extend
pub struct RewiredMemory {
    fd: libc::c_int,
    base: NonNull<u8>,
    extent_size: usize,
    max_extents: usize,
    num_extents: usize,
    /// Lowest slot handed out from the top of the span.
    top_slot: usize,
    /// Per-slot file offset (in extents) of the backing frame.
    frames: Vec<usize>,
}

impl RewiredMemory {
    /// Creates a span holding `num_extents` extents of `pages_per_extent`
    /// pages each, with reserve room for in-place growth.
    pub fn new(pages_per_extent: usize, num_extents: usize) -> Result<Self> {
        Self::with_reservation(
            pages_per_extent,
            num_extents,
            num_extents.saturating_mul(RESERVATION_FACTOR),
        )
    }

    /// Creates a span with an explicit reservation of `max_extents`.
    pub fn with_reservation(
        pages_per_extent: usize,
        num_extents: usize,
        max_extents: usize,
    ) -> Result<Self> {
        assert!(pages_per_extent.is_power_of_two());
        assert!(num_extents >= 1);
        let max_extents = max_extents.max(num_extents + 2);

        let extent_size = pages_per_extent * os_page_size();
        let span_bytes = max_extents
            .checked_mul(extent_size)
            .filter(|&b| b <= isize::MAX as usize)
            .ok_or_else(|| LacunaError::invalid_parameter("max_extents", max_extents))?;

        // SAFETY: plain syscall; the name is a valid nul-terminated string.
        let fd = unsafe {
            libc::memfd_create(b"lacuna-rewire\0".as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(LacunaError::Io(io::Error::last_os_error()));
        }

        // Reserve the whole span with no backing; failure paths below rely
        // on Drop for the unmap and the close.
        // SAFETY: fresh anonymous reservation, no aliasing possible.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                span_bytes,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: fd is open and owned by this function.
            unsafe { libc::close(fd) };
            return Err(LacunaError::AllocationFailed {
                bytes: span_bytes,
                source: err,
            });
        }

        let mut mem = Self {
            fd,
            base: NonNull::new(base as *mut u8).expect("mmap returned null"),
            extent_size,
            max_extents,
            num_extents: 0,
            top_slot: max_extents,
            frames: vec![UNMAPPED; max_extents],
        };

        // Size the file for the full reservation; frames are committed
        // lazily by the kernel on first touch.
        // SAFETY: fd is a valid memfd.
        if unsafe { libc::ftruncate(mem.fd, span_bytes as libc::off_t) } != 0 {
            return Err(LacunaError::Io(io::Error::last_os_error()));
        }

        mem.map_bottom(num_extents)?;
        debug!(
            extents = num_extents,
            extent_size, max_extents, "rewired span allocated"
        );
        Ok(mem)
    }

    /// Maps `delta` fresh extents at the bottom watermark.
    fn map_bottom(&mut self, delta: usize) -> Result<()> {
        let first = self.num_extents;
        if first + delta > self.top_slot {
            return Err(LacunaError::ReservationExhausted {
                requested: delta,
                available: self.top_slot - first,
            });
        }

        // SAFETY: [first, first+delta) lies inside the reserved span and is
        // currently PROT_NONE; MAP_FIXED replaces it atomically. The file
        // offsets are fresh (offset == slot for bottom mappings).
        let addr = unsafe {
            libc::mmap(
                self.slot_address(first).as_ptr() as *mut libc::c_void,
                delta * self.extent_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd,
                (first * self.extent_size) as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(LacunaError::AllocationFailed {
                bytes: delta * self.extent_size,
                source: io::Error::last_os_error(),
            });
        }

        for slot in first..first + delta {
            self.frames[slot] = slot;
        }
        self.num_extents = first + delta;
        Ok(())
    }

    /// Appends `delta_extents` extents of logically zeroed memory.
    pub fn extend(&mut self, delta_extents: usize) -> Result<()> {
        debug!(
            current = self.num_extents,
            delta = delta_extents,
            "extending rewired span"
        );
        self.map_bottom(delta_extents)
    }

    /// Returns whether `extend(delta_extents)` can succeed.
    pub fn can_extend(&self, delta_extents: usize) -> bool {
        self.num_extents + delta_extents <= self.top_slot
    }

    /// Maps one spare extent from the top of the span.
    pub(crate) fn alloc_spare_extent(&mut self) -> Result<NonNull<u8>> {
        if self.top_slot <= self.num_extents {
            return Err(LacunaError::ReservationExhausted {
                requested: 1,
                available: 0,
            });
        }
        let slot = self.top_slot - 1;

        // SAFETY: the slot is inside the reserved span, currently PROT_NONE,
        // and its identity file offset has never been used.
        let addr = unsafe {
            libc::mmap(
                self.slot_address(slot).as_ptr() as *mut libc::c_void,
                self.extent_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd,
                (slot * self.extent_size) as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(LacunaError::AllocationFailed {
                bytes: self.extent_size,
                source: io::Error::last_os_error(),
            });
        }

        self.top_slot = slot;
        self.frames[slot] = slot;
        Ok(self.slot_address(slot))
    }

    /// Exchanges the physical frames backing the extents at `a` and `b`.
    ///
    /// Both addresses must be extent-aligned and mapped. Afterwards each
    /// virtual range shows the bytes the other one showed before the call.
    pub fn swap_frames(&mut self, a: *mut u8, b: *mut u8) -> Result<()> {
        let slot_a = self.slot_of(a);
        let slot_b = self.slot_of(b);
        assert_ne!(self.frames[slot_a], UNMAPPED, "swap of an unmapped extent");
        assert_ne!(self.frames[slot_b], UNMAPPED, "swap of an unmapped extent");

        self.remap(slot_a, self.frames[slot_b])?;
        self.remap(slot_b, self.frames[slot_a])?;
        self.frames.swap(slot_a, slot_b);
        Ok(())
    }

    /// Points the extent at `slot` at the frame at file offset `frame`.
    fn remap(&self, slot: usize, frame: usize) -> Result<()> {
        // SAFETY: slot is a mapped extent inside the span; MAP_FIXED
        // atomically replaces its mapping with a view of `frame`.
        let addr = unsafe {
            libc::mmap(
                self.slot_address(slot).as_ptr() as *mut libc::c_void,
                self.extent_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                self.fd,
                (frame * self.extent_size) as libc::off_t,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(LacunaError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn slot_of(&self, addr: *mut u8) -> usize {
        let offset = (addr as usize)
            .checked_sub(self.base.as_ptr() as usize)
            .expect("address below the rewired span");
        assert!(offset % self.extent_size == 0, "address not extent-aligned");
        let slot = offset / self.extent_size;
        assert!(slot < self.max_extents, "address above the rewired span");
        slot
    }

    fn slot_address(&self, slot: usize) -> NonNull<u8> {
        // SAFETY: the span is a single allocation of max_extents extents.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(slot * self.extent_size)) }
    }

    /// Start of the logical content.
    pub fn start_address(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Extent size in bytes.
    pub fn extent_size(&self) -> usize {
        self.extent_size
    }

    /// Current logical content size in bytes.
    pub fn len_bytes(&self) -> usize {
        self.num_extents * self.extent_size
    }

    /// Total reserved span in bytes.
    pub fn max_memory(&self) -> usize {
        self.max_extents * self.extent_size
    }

    /// Number of logical extents currently mapped.
    pub fn num_extents(&self) -> usize {
        self.num_extents
    }
}

impl Drop for RewiredMemory {
    fn drop(&mut self) {
        // SAFETY: base/span_bytes describe the single reservation made in
        // with_reservation; fd is owned by this value.
        unsafe {
            libc::munmap(
                self.base.as_ptr() as *mut libc::c_void,
                self.max_extents * self.extent_size,
            );
            libc::close(self.fd);
        }
    }
}

// SAFETY: the span and the memfd are owned exclusively by this value.
unsafe impl Send for RewiredMemory {}
