//! Sparse-array backing store of the packed memory array.

use lacuna_common::config::ELEMENT_SIZE;
use lacuna_common::{os_page_size, AlignedArray, Result};
use lacuna_rewire::{BufferedRewiredMemory, RewiredMemory};
use std::ops::Range;
use tracing::debug;

/// Backing memory of one storage generation.
///
/// Small stores use plain aligned heap arrays; once the element arrays
/// reach one rewiring extent, the store switches to rewired spans so that
/// large windows can be redistributed by frame swapping instead of copies.
pub(crate) enum Workspace {
    Direct {
        keys: AlignedArray<i64>,
        values: AlignedArray<i64>,
        sizes: AlignedArray<u16>,
    },
    Rewired {
        keys: BufferedRewiredMemory,
        values: BufferedRewiredMemory,
        sizes: RewiredMemory,
    },
}

impl Workspace {
    /// Allocates a workspace for `num_segments` segments, picking the
    /// allocation mode from the element-array footprint.
    ///
    /// Nothing leaks on a partial failure: whatever was acquired before the
    /// failing allocation is released when the partial value drops.
    pub(crate) fn allocate(
        segment_capacity: usize,
        pages_per_extent: usize,
        num_segments: usize,
    ) -> Result<Workspace> {
        let extent_size = pages_per_extent * os_page_size();
        let element_bytes = num_segments * segment_capacity * ELEMENT_SIZE;
        // at least 2 entries: sizes[1] = 0 is the pairwise-iteration
        // sentinel while the store holds a single segment
        let sizes_len = num_segments.max(2);

        if element_bytes >= extent_size {
            let element_extents = element_bytes / extent_size;
            let sizes_bytes = sizes_len * std::mem::size_of::<u16>();
            let sizes_extents = sizes_bytes.div_ceil(extent_size).max(1);
            debug!(num_segments, element_bytes, "allocating rewired workspace");
            Ok(Workspace::Rewired {
                keys: BufferedRewiredMemory::new(pages_per_extent, element_extents)?,
                values: BufferedRewiredMemory::new(pages_per_extent, element_extents)?,
                sizes: RewiredMemory::new(pages_per_extent, sizes_extents)?,
            })
        } else {
            debug!(num_segments, element_bytes, "allocating direct workspace");
            Ok(Workspace::Direct {
                keys: AlignedArray::zeroed(num_segments * segment_capacity)?,
                values: AlignedArray::zeroed(num_segments * segment_capacity)?,
                sizes: AlignedArray::zeroed(sizes_len)?,
            })
        }
    }
}

/// The sparse array: two parallel element arrays partitioned into
/// fixed-capacity segments, plus one cardinality per segment.
///
/// Even segments pack their elements to the right edge, odd segments to the
/// left edge, so segments `2k` and `2k+1` form one contiguous run flanked
/// by the gaps of the pair.
pub(crate) struct Storage {
    pub(crate) segment_capacity: usize,
    pub(crate) pages_per_extent: usize,
    pub(crate) number_segments: usize,
    pub(crate) capacity: usize,
    pub(crate) height: u32,
    pub(crate) cardinality: usize,
    workspace: Workspace,
}

impl Storage {
    /// Creates a store with a single empty segment.
    pub(crate) fn new(segment_capacity: usize, pages_per_extent: usize) -> Result<Self> {
        Self::with_segments(segment_capacity, pages_per_extent, 1)
    }

    /// Creates an empty store with `num_segments` segments (a power of two).
    pub(crate) fn with_segments(
        segment_capacity: usize,
        pages_per_extent: usize,
        num_segments: usize,
    ) -> Result<Self> {
        assert!(num_segments.is_power_of_two());
        let workspace = Workspace::allocate(segment_capacity, pages_per_extent, num_segments)?;
        Ok(Self {
            segment_capacity,
            pages_per_extent,
            number_segments: num_segments,
            capacity: num_segments * segment_capacity,
            height: Self::height_for(num_segments),
            cardinality: 0,
            workspace,
        })
    }

    /// Calibrator tree height for `num_segments` segments.
    pub(crate) fn height_for(num_segments: usize) -> u32 {
        num_segments.trailing_zeros() + 1
    }

    /// Replaces the workspace wholesale (resize), returning the old one.
    ///
    /// The caller streams the old content into the new layout and drops the
    /// returned generation when done; the drop releases its memory even if
    /// streaming bails out early.
    pub(crate) fn swap_workspace(&mut self, workspace: Workspace, num_segments: usize) -> Storage {
        let old_segments = self.number_segments;
        self.number_segments = num_segments;
        self.capacity = num_segments * self.segment_capacity;
        self.height = Self::height_for(num_segments);
        let old_workspace = std::mem::replace(&mut self.workspace, workspace);
        Storage {
            segment_capacity: self.segment_capacity,
            pages_per_extent: self.pages_per_extent,
            number_segments: old_segments,
            capacity: old_segments * self.segment_capacity,
            height: Self::height_for(old_segments),
            cardinality: self.cardinality,
            workspace: old_workspace,
        }
    }

    /// Appends `delta_segments` segments in place. Rewired mode only.
    pub(crate) fn extend(&mut self, delta_segments: usize) -> Result<()> {
        let Workspace::Rewired { keys, values, sizes } = &mut self.workspace else {
            panic!("extend on a direct workspace");
        };

        let extent_size = keys.extent_size();
        let bytes_per_segment = self.segment_capacity * ELEMENT_SIZE;
        let segments_after = self.number_segments + delta_segments;

        let element_extents_now = (self.number_segments * bytes_per_segment).div_ceil(extent_size);
        let element_extents_total = (segments_after * bytes_per_segment).div_ceil(extent_size);
        let element_extents_required = element_extents_total - element_extents_now;

        let bytes_per_size = std::mem::size_of::<u16>();
        let sizes_extents_now = (self.number_segments * bytes_per_size)
            .div_ceil(extent_size)
            .max(1);
        let sizes_extents_total = (segments_after * bytes_per_size)
            .div_ceil(extent_size)
            .max(1);
        let sizes_extents_required = sizes_extents_total - sizes_extents_now;

        if element_extents_required > 0 {
            keys.extend(element_extents_required)?;
            values.extend(element_extents_required)?;
        }
        if sizes_extents_required > 0 {
            sizes.extend(sizes_extents_required)?;
        }

        self.number_segments = segments_after;
        self.capacity = segments_after * self.segment_capacity;
        self.height = Self::height_for(segments_after);
        debug!(
            segments = segments_after,
            extents = element_extents_required,
            "storage extended in place"
        );
        Ok(())
    }

    /// Returns whether an in-place [`extend`](Self::extend) by
    /// `delta_segments` can succeed.
    pub(crate) fn can_extend(&self, delta_segments: usize) -> bool {
        let Workspace::Rewired { keys, values, sizes } = &self.workspace else {
            return false;
        };
        let extent_size = keys.extent_size();
        let bytes_per_segment = self.segment_capacity * ELEMENT_SIZE;
        let segments_after = self.number_segments + delta_segments;
        let element_extents_required = (segments_after * bytes_per_segment).div_ceil(extent_size)
            - (self.number_segments * bytes_per_segment).div_ceil(extent_size);
        let sizes_extents_required = (segments_after * std::mem::size_of::<u16>())
            .div_ceil(extent_size)
            .max(1)
            - (self.number_segments * std::mem::size_of::<u16>())
                .div_ceil(extent_size)
                .max(1);
        keys.can_extend(element_extents_required)
            && values.can_extend(element_extents_required)
            && sizes.can_extend(sizes_extents_required)
    }

    pub(crate) fn is_rewired(&self) -> bool {
        matches!(self.workspace, Workspace::Rewired { .. })
    }

    /// Extent size in bytes for this configuration (both allocation modes).
    pub(crate) fn extent_size(&self) -> usize {
        self.pages_per_extent * os_page_size()
    }

    /// Number of segments covered by one extent.
    pub(crate) fn segments_per_extent(&self) -> usize {
        self.extent_size() / (self.segment_capacity * ELEMENT_SIZE)
    }

    /// The rewired element spans, when in rewired mode.
    pub(crate) fn rewired_mut(
        &mut self,
    ) -> Option<(&mut BufferedRewiredMemory, &mut BufferedRewiredMemory)> {
        match &mut self.workspace {
            Workspace::Rewired { keys, values, .. } => Some((keys, values)),
            Workspace::Direct { .. } => None,
        }
    }

    pub(crate) fn keys(&self) -> &[i64] {
        match &self.workspace {
            Workspace::Direct { keys, .. } => &keys.as_slice()[..self.capacity],
            // SAFETY: the span start is valid for `capacity` i64 reads; the
            // workspace is exclusively owned by this store.
            Workspace::Rewired { keys, .. } => unsafe {
                std::slice::from_raw_parts(keys.start_address() as *const i64, self.capacity)
            },
        }
    }

    pub(crate) fn values(&self) -> &[i64] {
        match &self.workspace {
            Workspace::Direct { values, .. } => &values.as_slice()[..self.capacity],
            // SAFETY: as in keys().
            Workspace::Rewired { values, .. } => unsafe {
                std::slice::from_raw_parts(values.start_address() as *const i64, self.capacity)
            },
        }
    }

    pub(crate) fn sizes(&self) -> &[u16] {
        let len = self.number_segments.max(2);
        match &self.workspace {
            Workspace::Direct { sizes, .. } => &sizes.as_slice()[..len],
            // SAFETY: the sizes span holds at least `len` u16 entries.
            Workspace::Rewired { sizes, .. } => unsafe {
                std::slice::from_raw_parts(sizes.start_address() as *const u16, len)
            },
        }
    }

    /// Mutable views of the three arrays at once.
    pub(crate) fn parts_mut(&mut self) -> (&mut [i64], &mut [i64], &mut [u16]) {
        let capacity = self.capacity;
        let sizes_len = self.number_segments.max(2);
        match &mut self.workspace {
            Workspace::Direct { keys, values, sizes } => (
                &mut keys.as_mut_slice()[..capacity],
                &mut values.as_mut_slice()[..capacity],
                &mut sizes.as_mut_slice()[..sizes_len],
            ),
            // SAFETY: the three spans are disjoint mappings, each valid for
            // the stated length; &mut self guarantees exclusivity.
            Workspace::Rewired { keys, values, sizes } => unsafe {
                (
                    std::slice::from_raw_parts_mut(keys.start_address() as *mut i64, capacity),
                    std::slice::from_raw_parts_mut(values.start_address() as *mut i64, capacity),
                    std::slice::from_raw_parts_mut(sizes.start_address() as *mut u16, sizes_len),
                )
            },
        }
    }

    /// Spare buffers currently handed out by the rewired element spans.
    pub(crate) fn used_rewire_buffers(&self) -> usize {
        match &self.workspace {
            Workspace::Rewired { keys, values, .. } => {
                keys.get_used_buffers() + values.get_used_buffers()
            }
            Workspace::Direct { .. } => 0,
        }
    }

    /// Raw base pointer of the key array.
    ///
    /// Used by the rewiring spread engine, which interleaves writes through
    /// this pointer with frame swaps; the pointer stays valid across swaps
    /// because the virtual addresses never move.
    pub(crate) fn keys_ptr(&self) -> *mut i64 {
        match &self.workspace {
            Workspace::Direct { keys, .. } => keys.as_ptr(),
            Workspace::Rewired { keys, .. } => keys.start_address() as *mut i64,
        }
    }

    /// Raw base pointer of the value array.
    pub(crate) fn values_ptr(&self) -> *mut i64 {
        match &self.workspace {
            Workspace::Direct { values, .. } => values.as_ptr(),
            Workspace::Rewired { values, .. } => values.start_address() as *mut i64,
        }
    }

    /// Occupied index range of `segment` within the element arrays.
    pub(crate) fn segment_range(&self, segment: usize) -> Range<usize> {
        let base = segment * self.segment_capacity;
        let size = self.sizes()[segment] as usize;
        if segment % 2 == 0 {
            base + self.segment_capacity - size..base + self.segment_capacity
        } else {
            base..base + size
        }
    }

    /// One past the last occupied element slot at or below `segment`,
    /// skipping trailing empty segments down to `window_start`.
    ///
    /// This is where a backward spread starts reading; pointing it at an
    /// empty trailing segment would make it misjudge its first run.
    pub(crate) fn content_end(&self, window_start: usize, mut segment: usize) -> usize {
        let sizes = self.sizes();
        while segment > window_start && sizes[segment] == 0 {
            segment -= 1;
        }
        let size = sizes[segment] as usize;
        if size == 0 {
            window_start * self.segment_capacity
        } else if segment % 2 == 0 {
            (segment + 1) * self.segment_capacity
        } else {
            segment * self.segment_capacity + size
        }
    }

    /// Minimum key of a non-empty `segment`, O(1) from the packing parity.
    pub(crate) fn minimum(&self, segment: usize) -> i64 {
        debug_assert!(segment < self.number_segments);
        debug_assert!(self.sizes()[segment] > 0, "minimum of an empty segment");
        let c = self.segment_capacity;
        if segment % 2 == 0 {
            self.keys()[(segment + 1) * c - self.sizes()[segment] as usize]
        } else {
            self.keys()[segment * c]
        }
    }

    /// Inserts into a non-full segment by parity-directed shifting.
    ///
    /// Returns whether the inserted key became the segment minimum, so the
    /// caller can refresh the separator index. The key must not already be
    /// present and the segment must not be full.
    pub(crate) fn insert_unsafe(&mut self, segment: usize, key: i64, value: i64) -> bool {
        let c = self.segment_capacity;
        let (keys, values, sizes) = self.parts_mut();
        let size = sizes[segment] as usize;
        debug_assert!(size < c, "insert into a full segment");
        let base = segment * c;
        let keys = &mut keys[base..base + c];
        let values = &mut values[base..base + c];

        let minimum;
        if segment % 2 == 0 {
            // even: packed right, grow toward the left edge
            let stop = c - 1;
            let start = c - size - 1;
            let mut i = start;
            while i < stop && keys[i + 1] < key {
                keys[i] = keys[i + 1];
                i += 1;
            }
            keys[i] = key;
            for j in start..i {
                values[j] = values[j + 1];
            }
            values[i] = value;
            minimum = i == start;
        } else {
            // odd: packed left, grow toward the right edge
            let mut i = size;
            while i > 0 && keys[i - 1] > key {
                keys[i] = keys[i - 1];
                i -= 1;
            }
            keys[i] = key;
            let mut j = size;
            while j > i {
                values[j] = values[j - 1];
                j -= 1;
            }
            values[i] = value;
            minimum = i == 0;
        }

        sizes[segment] += 1;
        self.cardinality += 1;
        minimum
    }

    /// Bytes held by the element and cardinality arrays.
    pub(crate) fn memory_footprint(&self) -> usize {
        std::mem::size_of::<Self>()
            + match &self.workspace {
                Workspace::Direct { keys, values, sizes } => {
                    (keys.len() + values.len()) * ELEMENT_SIZE
                        + sizes.len() * std::mem::size_of::<u16>()
                }
                Workspace::Rewired { keys, values, sizes } => {
                    keys.len_bytes() + values.len_bytes() + sizes.len_bytes()
                }
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct_storage() -> Storage {
        // 1 segment of 64 elements: 512 bytes, well under one extent
        Storage::new(64, 16).unwrap()
    }

    #[test]
    fn test_new_single_segment() {
        let storage = direct_storage();
        assert_eq!(storage.number_segments, 1);
        assert_eq!(storage.capacity, 64);
        assert_eq!(storage.height, 1);
        assert_eq!(storage.cardinality, 0);
        assert!(!storage.is_rewired());
    }

    #[test]
    fn test_sizes_sentinel() {
        let storage = direct_storage();
        // pairwise iteration reads sizes[1] even with one segment
        assert_eq!(storage.sizes().len(), 2);
        assert_eq!(storage.sizes()[1], 0);
    }

    #[test]
    fn test_height_for() {
        assert_eq!(Storage::height_for(1), 1);
        assert_eq!(Storage::height_for(2), 2);
        assert_eq!(Storage::height_for(8), 4);
        assert_eq!(Storage::height_for(1024), 11);
    }

    #[test]
    fn test_insert_even_segment_packs_right() {
        let mut storage = direct_storage();
        assert!(storage.insert_unsafe(0, 50, 500));
        assert!(storage.insert_unsafe(0, 30, 300)); // new minimum
        assert!(!storage.insert_unsafe(0, 40, 400)); // middle

        assert_eq!(storage.cardinality, 3);
        assert_eq!(storage.sizes()[0], 3);
        assert_eq!(storage.segment_range(0), 61..64);
        assert_eq!(&storage.keys()[61..64], &[30, 40, 50]);
        assert_eq!(&storage.values()[61..64], &[300, 400, 500]);
        assert_eq!(storage.minimum(0), 30);
    }

    #[test]
    fn test_insert_odd_segment_packs_left() {
        let mut storage = Storage::with_segments(64, 16, 2).unwrap();
        assert!(storage.insert_unsafe(1, 50, 500));
        assert!(!storage.insert_unsafe(1, 70, 700));
        assert!(storage.insert_unsafe(1, 10, 100)); // new minimum

        assert_eq!(storage.sizes()[1], 3);
        assert_eq!(storage.segment_range(1), 64..67);
        assert_eq!(&storage.keys()[64..67], &[10, 50, 70]);
        assert_eq!(&storage.values()[64..67], &[100, 500, 700]);
        assert_eq!(storage.minimum(1), 10);
    }

    #[test]
    fn test_rewired_mode_selected_by_footprint() {
        // 2 segments of 256 elements = 4096 bytes = one single-page extent
        let storage = Storage::with_segments(256, 1, 2).unwrap();
        assert!(storage.is_rewired());
        assert_eq!(storage.segments_per_extent(), 2);
        assert!(storage.keys().iter().all(|&k| k == 0));
    }

    #[test]
    fn test_extend_rewired() {
        let mut storage = Storage::with_segments(256, 1, 2).unwrap();
        let (keys, _, sizes) = storage.parts_mut();
        keys[511] = 42;
        sizes[0] = 1;

        storage.extend(2).unwrap();
        assert_eq!(storage.number_segments, 4);
        assert_eq!(storage.capacity, 1024);
        assert_eq!(storage.height, 3);
        // old content survives, appended space is zeroed
        assert_eq!(storage.keys()[511], 42);
        assert!(storage.keys()[512..].iter().all(|&k| k == 0));
    }

    #[test]
    fn test_swap_workspace_hands_back_old_generation() {
        let mut storage = direct_storage();
        storage.insert_unsafe(0, 7, 70);

        let fresh = Workspace::allocate(64, 16, 2).unwrap();
        let old = storage.swap_workspace(fresh, 2);

        assert_eq!(storage.number_segments, 2);
        assert_eq!(storage.capacity, 128);
        assert_eq!(old.number_segments, 1);
        assert_eq!(old.keys()[63], 7);
        assert!(storage.keys().iter().all(|&k| k == 0));
    }

    #[test]
    fn test_memory_footprint() {
        let storage = direct_storage();
        // 2 arrays of 64 i64 plus 2 u16 cardinalities
        assert!(storage.memory_footprint() >= 64 * 8 * 2 + 4);
    }
}
