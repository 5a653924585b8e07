//! Extent-by-extent spreading through the rewiring facility.

use crate::PackedMemoryArray;
use lacuna_rewire::BufferedRewiredMemory;
use std::collections::VecDeque;
use tracing::{trace, warn};

/// Frame-swapping spread engine for windows of at least one extent.
///
/// Walks the window's extents from highest to lowest. An extent whose
/// unread source elements all lie below it is written in place; otherwise
/// the new layout goes into a spare buffer from the rewiring facility and
/// the buffer's frames are swapped into the destination once the read
/// cursor has moved past it. The working set never doubles: at most a few
/// extra extents are live at a time.
///
/// The engine itself cannot fail: when the facility cannot hand out
/// another spare, or a frame remap is refused under memory pressure, the
/// affected extent degrades to heap scratch installed by copy and the
/// spread carries on.
///
/// Two optional inputs ride along:
/// - a sorted batch, merged element by element during redistribution
///   (bulk loading);
/// - one pending element, placed after redistribution by a walk over the
///   fresh segment minima (point insert).
pub(crate) struct RewiringSpread<'a> {
    pma: &'a mut PackedMemoryArray,
    window_start: usize,
    window_length: usize,
    /// Elements to distribute: window content plus batch, excluding the
    /// pending element.
    cardinality: usize,
    segments_per_extent: usize,
    batch: &'a [(i64, i64)],
    insert: Option<(i64, i64)>,
    /// Read cursor into the element arrays; everything below is unread.
    /// -1 once the window content is depleted.
    position: i64,
    /// Read cursor into the batch: index of the last unread entry.
    batch_position: i64,
    /// Extents written into spare buffers, oldest first.
    pending_swaps: VecDeque<PendingSwap>,
    keys_base: *mut i64,
    values_base: *mut i64,
}

struct PendingSwap {
    extent: i64,
    keys: ExtentBuffer,
    values: ExtentBuffer,
}

/// Scratch holding one extent's final layout until the read cursor leaves
/// the extent.
enum ExtentBuffer {
    /// A spare extent of the rewiring facility, installed by frame swap.
    Spare(*mut i64),
    /// Plain heap memory, installed by copy. Fallback when no spare is
    /// available.
    Heap(Vec<i64>),
}

impl ExtentBuffer {
    fn as_mut_ptr(&mut self) -> *mut i64 {
        match self {
            ExtentBuffer::Spare(ptr) => *ptr,
            ExtentBuffer::Heap(scratch) => scratch.as_mut_ptr(),
        }
    }
}

impl<'a> RewiringSpread<'a> {
    /// Prepares a spread of `cardinality` elements over
    /// `[window_start, window_start + window_length)`, reading the window
    /// content backwards from its last occupied position and `batch` from
    /// its end.
    pub(crate) fn new(
        pma: &'a mut PackedMemoryArray,
        window_start: usize,
        window_length: usize,
        cardinality: usize,
        batch: &'a [(i64, i64)],
    ) -> Self {
        let segments_per_extent = pma.storage.segments_per_extent();
        let window_end = window_start + window_length - 1;
        let position = pma.storage.content_end(window_start, window_end) as i64;
        let keys_base = pma.storage.keys_ptr();
        let values_base = pma.storage.values_ptr();
        Self {
            pma,
            window_start,
            window_length,
            cardinality,
            segments_per_extent,
            batch,
            insert: None,
            position,
            batch_position: batch.len() as i64 - 1,
            pending_swaps: VecDeque::new(),
            keys_base,
            values_base,
        }
    }

    /// Registers the single element to place after redistribution.
    pub(crate) fn set_element_to_insert(&mut self, key: i64, value: i64) {
        assert!(self.insert.is_none(), "an element to insert is already set");
        self.insert = Some((key, value));
    }

    /// Overrides the read cursor (resize-up: the content ends where the old
    /// capacity ended, not at the end of the window).
    pub(crate) fn set_start_position(&mut self, position: usize) {
        let segment = Self::div_floor(position as i64 - 1, self.capacity());
        assert!(
            segment >= self.window_start as i64
                && segment < (self.window_start + self.window_length) as i64,
            "start position outside the window"
        );
        self.position = position as i64;
    }

    pub(crate) fn execute(mut self) {
        debug_assert!(self.window_length % self.segments_per_extent == 0);
        debug_assert!(self.used_buffers() == 0, "spare pool not drained");
        trace!(
            window_start = self.window_start,
            window_length = self.window_length,
            cardinality = self.cardinality,
            batch = self.batch.len(),
            "rewiring spread"
        );

        let num_extents = self.window_length / self.segments_per_extent;
        let elements_per_extent = self.cardinality / num_extents;
        let odd_extents = self.cardinality % num_extents;
        for extent in (0..num_extents).rev() {
            self.spread_extent(
                extent as i64,
                elements_per_extent + usize::from(extent < odd_extents),
            );
        }
        assert!(
            self.used_buffers() == 0 && self.pending_swaps.is_empty(),
            "all acquired buffers must be installed before the spread returns"
        );

        self.update_segment_sizes();
        self.update_index();
    }

    fn capacity(&self) -> i64 {
        self.pma.storage.segment_capacity as i64
    }

    fn div_floor(a: i64, b: i64) -> i64 {
        a.div_euclid(b)
    }

    fn position_to_extent(&self, position: i64) -> i64 {
        let c = self.capacity();
        let segment = Self::div_floor(position - self.window_start as i64 * c, c);
        Self::div_floor(segment, self.segments_per_extent as i64)
    }

    /// Extent (window-relative) holding the last unread element.
    fn current_extent(&self) -> i64 {
        self.position_to_extent(self.position - 1)
    }

    /// Element offset of `extent` within the arrays.
    fn extent_offset(&self, extent: i64) -> i64 {
        self.window_start as i64 * self.capacity()
            + extent * self.segments_per_extent as i64 * self.capacity()
    }

    fn used_buffers(&self) -> usize {
        self.pma.storage.used_rewire_buffers()
    }

    fn spread_extent(&mut self, extent: i64, num_elements: usize) {
        // overlap: the read cursor has not yet left this extent
        let use_rewiring = self.current_extent() >= extent;
        if use_rewiring {
            let extent_elements = self.segments_per_extent * self.pma.storage.segment_capacity;
            let (keys_mem, values_mem) = self
                .pma
                .storage
                .rewired_mut()
                .expect("rewiring spread on a direct workspace");
            let (mut keys, mut values) = match (keys_mem.acquire_buffer(), values_mem.acquire_buffer()) {
                (Ok(keys), Ok(values)) => {
                    trace!(extent, "spread into spare buffer");
                    (
                        ExtentBuffer::Spare(keys as *mut i64),
                        ExtentBuffer::Spare(values as *mut i64),
                    )
                }
                (keys, values) => {
                    // reservation exhausted: this extent goes through heap
                    // scratch and is installed by copy instead of swap
                    warn!(extent, "no spare buffers, falling back to heap scratch");
                    if let Ok(keys) = keys {
                        keys_mem.release_buffer(keys);
                    }
                    if let Ok(values) = values {
                        values_mem.release_buffer(values);
                    }
                    (
                        ExtentBuffer::Heap(vec![0i64; extent_elements]),
                        ExtentBuffer::Heap(vec![0i64; extent_elements]),
                    )
                }
            };
            // heap buffers keep their allocation address when the value
            // moves into the queue, so the pointers stay valid
            let buffer_keys = keys.as_mut_ptr();
            let buffer_values = values.as_mut_ptr();
            self.pending_swaps.push_back(PendingSwap { extent, keys, values });
            self.spread_elements(buffer_keys, buffer_values, 0, num_elements);
        } else {
            trace!(extent, "spread in place");
            let offset = self.extent_offset(extent);
            self.spread_elements(self.keys_base, self.values_base, offset, num_elements);
        }
        self.reclaim_past_extents();
    }

    /// Installs every buffered extent the read cursor has moved past.
    fn reclaim_past_extents(&mut self) {
        let current = self.current_extent();
        while self
            .pending_swaps
            .front()
            .is_some_and(|swap| swap.extent > current)
        {
            let swap = self.pending_swaps.pop_front().expect("front checked");
            let offset = self.extent_offset(swap.extent);
            let extent_elements = self.segments_per_extent * self.pma.storage.segment_capacity;
            // SAFETY: offset lies inside the mapped element spans.
            let keys_dst = unsafe { self.keys_base.offset(offset as isize) };
            let values_dst = unsafe { self.values_base.offset(offset as isize) };
            let (keys_mem, values_mem) = self
                .pma
                .storage
                .rewired_mut()
                .expect("rewiring spread on a direct workspace");
            install_extent(keys_mem, swap.keys, keys_dst, extent_elements);
            install_extent(values_mem, swap.values, values_dst, extent_elements);
        }
    }

    /// Writes the final layout of one extent, reading the window content
    /// and the batch backwards and taking the larger head at each slot.
    ///
    /// `dst_offset` positions the extent within `dst_keys`/`dst_values`:
    /// the arrays themselves for an in-place spread, zero for a spare
    /// buffer.
    fn spread_elements(
        &mut self,
        dst_keys: *mut i64,
        dst_values: *mut i64,
        dst_offset: i64,
        num_elements: usize,
    ) {
        let c = self.capacity();
        let spe = self.segments_per_extent as i64;
        let elements_per_segment = num_elements as i64 / spe;
        let odd_segments = num_elements as i64 % spe;
        debug_assert!(
            elements_per_segment + i64::from(odd_segments > 0) <= c,
            "segment overfilled by the spread"
        );

        let window_start = self.window_start as i64;
        let sizes = self.pma.storage.sizes();

        // input 1: the window content, walked backwards in double-segment runs
        let mut in1_segment = Self::div_floor(self.position - 1, 2 * c) * 2;
        let mut in1_offset = 0i64;
        let mut in1_index = -1i64;
        if in1_segment >= window_start {
            in1_offset = in1_segment * c + c - sizes[in1_segment as usize] as i64;
            let run = self.position - in1_offset;
            debug_assert!(run > 0 && run <= 2 * c);
            in1_index = run - 1;
        }

        // input 2: the batch, walked backwards
        let mut in2_index = self.batch_position;

        let mut out_segment = spe - 2;
        while out_segment >= 0 {
            let run_lhs = elements_per_segment + i64::from(out_segment < odd_segments);
            let run_rhs = elements_per_segment + i64::from(out_segment + 1 < odd_segments);
            let out_base = dst_offset + out_segment * c + (c - run_lhs);
            let mut k = run_lhs + run_rhs - 1;

            while k >= 0 && in1_index >= 0 && in2_index >= 0 {
                // SAFETY: in1_offset + in1_index indexes a live element of
                // the key span; out_base + k lies inside the destination
                // extent.
                unsafe {
                    let in1_key = *self.keys_base.offset((in1_offset + in1_index) as isize);
                    if in1_key > self.batch[in2_index as usize].0 {
                        *dst_keys.offset((out_base + k) as isize) = in1_key;
                        *dst_values.offset((out_base + k) as isize) =
                            *self.values_base.offset((in1_offset + in1_index) as isize);
                        in1_index -= 1;
                        if in1_index < 0 && in1_segment > window_start {
                            in1_segment -= 2;
                            let run = sizes[in1_segment as usize] as i64
                                + sizes[in1_segment as usize + 1] as i64;
                            in1_offset =
                                in1_segment * c + c - sizes[in1_segment as usize] as i64;
                            in1_index = run - 1;
                        }
                    } else {
                        let (key, value) = self.batch[in2_index as usize];
                        *dst_keys.offset((out_base + k) as isize) = key;
                        *dst_values.offset((out_base + k) as isize) = value;
                        in2_index -= 1;
                    }
                }
                k -= 1;
            }

            while k >= 0 && in1_index >= 0 {
                // SAFETY: as above.
                unsafe {
                    *dst_keys.offset((out_base + k) as isize) =
                        *self.keys_base.offset((in1_offset + in1_index) as isize);
                    *dst_values.offset((out_base + k) as isize) =
                        *self.values_base.offset((in1_offset + in1_index) as isize);
                }
                in1_index -= 1;
                if in1_index < 0 && in1_segment > window_start {
                    in1_segment -= 2;
                    let run = sizes[in1_segment as usize] as i64
                        + sizes[in1_segment as usize + 1] as i64;
                    in1_offset = in1_segment * c + c - sizes[in1_segment as usize] as i64;
                    in1_index = run - 1;
                }
                k -= 1;
            }

            while k >= 0 && in2_index >= 0 {
                let (key, value) = self.batch[in2_index as usize];
                // SAFETY: out_base + k lies inside the destination extent.
                unsafe {
                    *dst_keys.offset((out_base + k) as isize) = key;
                    *dst_values.offset((out_base + k) as isize) = value;
                }
                in2_index -= 1;
                k -= 1;
            }

            out_segment -= 2;
        }

        self.position = if in1_index >= 0 {
            in1_offset + in1_index + 1
        } else {
            -1
        };
        self.batch_position = in2_index;
    }

    /// Records the even distribution as the new per-segment cardinalities,
    /// mirroring the per-extent split used while spreading.
    fn update_segment_sizes(&mut self) {
        let num_extents = self.window_length / self.segments_per_extent;
        let elements_per_extent = self.cardinality / num_extents;
        let odd_extents = self.cardinality % num_extents;

        let segments_per_extent = self.segments_per_extent;
        let window_start = self.window_start;
        let (_, _, sizes) = self.pma.storage.parts_mut();
        let mut segment = window_start;
        for extent in 0..num_extents {
            let extent_cardinality = elements_per_extent + usize::from(extent < odd_extents);
            let elements_per_segment = extent_cardinality / segments_per_extent;
            let odd_segments = extent_cardinality % segments_per_extent;
            for j in 0..segments_per_extent {
                sizes[segment] = (elements_per_segment + usize::from(j < odd_segments)) as u16;
                segment += 1;
            }
        }
    }

    /// Refreshes the window's separators and places the pending element.
    ///
    /// The element goes into the segment preceding the first separator
    /// above its key (the first segment when it is the new global minimum,
    /// the last when it is above everything).
    fn update_index(&mut self) {
        let Some((key, value)) = self.insert.take() else {
            self.pma
                .refresh_window_separators(self.window_start, self.window_length);
            return;
        };

        let mut insert = Some((key, value));
        for i in 0..self.window_length {
            let segment = self.window_start + i;
            let mut minimum = self.pma.storage.minimum(segment);
            if let Some((key, value)) = insert {
                if key < minimum {
                    if i > 0 {
                        self.pma.storage.insert_unsafe(segment - 1, key, value);
                    } else {
                        minimum = key;
                        self.pma.storage.insert_unsafe(segment, key, value);
                    }
                    insert = None;
                }
            }
            self.pma.index.set_separator_key(segment, minimum);
        }
        if let Some((key, value)) = insert {
            // above every separator: append to the final window segment
            let last = self.window_start + self.window_length - 1;
            self.pma.storage.insert_unsafe(last, key, value);
        }
    }
}

/// Makes `dst` show the contents of a finished extent buffer.
///
/// A spare buffer is installed by swapping its physical frames into the
/// destination's virtual range; if the remap is refused under memory
/// pressure the contents are copied instead and the buffer goes back to
/// the pool unswapped. Heap scratch is always copied. The destination
/// extent is fully consumed by the time this runs, so a direct copy
/// cannot clobber unread input.
fn install_extent(
    mem: &mut BufferedRewiredMemory,
    buffer: ExtentBuffer,
    dst: *mut i64,
    extent_elements: usize,
) {
    match buffer {
        ExtentBuffer::Spare(src) => {
            if let Err(err) = mem.swap_and_release(dst as *mut u8, src as *mut u8) {
                warn!(%err, "frame swap failed, copying the extent instead");
                // SAFETY: src and dst are distinct mapped extents of
                // `extent_elements` elements each.
                unsafe { std::ptr::copy_nonoverlapping(src, dst, extent_elements) };
                mem.release_buffer(src as *mut u8);
            }
        }
        ExtentBuffer::Heap(scratch) => {
            // SAFETY: dst is a mapped extent of `extent_elements` elements.
            unsafe { std::ptr::copy_nonoverlapping(scratch.as_ptr(), dst, extent_elements) };
        }
    }
}
