//! Adaptive rebalancing: window search, in-place spreading, resizing.

use crate::rewire_spread::RewiringSpread;
use crate::storage::Workspace;
use crate::{PackedMemoryArray, Result};
use lacuna_common::config::ELEMENT_SIZE;
use tracing::{debug, trace, warn};

/// An element that did not fit its target segment and rides along with the
/// spread that makes room for it.
#[derive(Clone, Copy)]
pub(crate) struct SpreadInsert {
    pub(crate) key: i64,
    pub(crate) value: i64,
    pub(crate) segment: usize,
}

impl PackedMemoryArray {
    /// Restores the density invariant around `segment_id` after an
    /// overflow (`pending` carries the element that did not fit) or an
    /// underflow (`pending` is `None`).
    ///
    /// Ascends the calibrator tree, doubling and aligning the window, until
    /// the window density falls inside the height's band; then spreads the
    /// window, or resizes the whole store when even the root is outside
    /// its band.
    pub(crate) fn rebalance(
        &mut self,
        segment_id: usize,
        pending: Option<(i64, i64)>,
    ) -> Result<()> {
        let is_insert = pending.is_some();
        let c = self.storage.segment_capacity;
        // an in-progress insert is part of the window it could not enter
        let mut num_elements = if is_insert {
            c + 1
        } else {
            self.storage.sizes()[segment_id] as usize
        };
        // height-1 bootstrap band: a lone segment may fill completely and
        // may empty completely before its first ascent
        let mut lower = 0.0f64;
        let mut upper = 1.0f64;
        let mut density = num_elements as f64 / c as f64;
        let mut height = 1u32;
        let mut window_length = 1usize;
        let mut window_id = segment_id;
        let mut window_start = segment_id;

        if self.storage.height > 1 {
            let sizes = self.storage.sizes();
            let mut index_left = segment_id as i64 - 1;
            let mut index_right = segment_id + 1;
            loop {
                height += 1;
                window_length *= 2;
                window_id /= 2;
                window_start = window_id * window_length;
                let window_end = window_start + window_length;
                let bounds = self.bounds.thresholds(height);
                lower = bounds.0;
                upper = bounds.1;

                while index_left >= window_start as i64 {
                    num_elements += sizes[index_left as usize] as usize;
                    index_left -= 1;
                }
                while index_right < window_end {
                    num_elements += sizes[index_right] as usize;
                    index_right += 1;
                }

                density = num_elements as f64 / (window_length * c) as f64;
                trace!(height, window_start, window_length, density, "window ascent");

                let outside =
                    (is_insert && density > upper) || (!is_insert && density < lower);
                if !(outside && height < self.storage.height) {
                    break;
                }
            }
        }

        if (is_insert && density <= upper) || (!is_insert && density >= lower) {
            debug!(window_start, window_length, num_elements, "spread");
            let insert = pending.map(|(key, value)| SpreadInsert {
                key,
                value,
                segment: segment_id,
            });
            self.spread(num_elements, window_start, window_length, insert);
            Ok(())
        } else {
            debug!(
                capacity = self.storage.capacity,
                is_insert, "resize: the root is outside its density band"
            );
            self.resize(pending)
        }
    }

    /// Evenly redistributes `cardinality` elements (including a pending
    /// insert) over the window, choosing the spread engine by footprint.
    fn spread(
        &mut self,
        cardinality: usize,
        window_start: usize,
        window_length: usize,
        insert: Option<SpreadInsert>,
    ) {
        let window_bytes = window_length * self.storage.segment_capacity * ELEMENT_SIZE;
        if self.storage.is_rewired() && window_bytes >= self.storage.extent_size() {
            self.stats.spreads_rewired += 1;
            // the engine distributes the existing elements; the pending one
            // is placed by its index-update pass
            let distributed = cardinality - usize::from(insert.is_some());
            let mut engine =
                RewiringSpread::new(self, window_start, window_length, distributed, &[]);
            if let Some(insert) = insert {
                engine.set_element_to_insert(insert.key, insert.value);
            }
            engine.execute();
        } else {
            self.stats.spreads_two_copy += 1;
            self.spread_two_copies(cardinality, window_start, window_length, insert);
        }
    }

    /// Compact-then-redistribute spread for windows below one extent.
    ///
    /// Working backwards pair by pair, first compacts every element run to
    /// the high end of the window (the trailing four segments go to a
    /// scratch buffer so redistribution can never overrun its input),
    /// merging the pending element into its run on the way; then deals the
    /// compacted stream back out pair by pair at the target sizes.
    fn spread_two_copies(
        &mut self,
        cardinality: usize,
        segment_start: usize,
        num_segments: usize,
        insert: Option<SpreadInsert>,
    ) {
        let c = self.storage.segment_capacity;
        debug_assert!(segment_start % 2 == 0, "window starts on an even segment");
        debug_assert!(num_segments % 2 == 0, "window is a whole number of pairs");
        let insert_segment: i64 = insert
            .as_ref()
            .map_or(-1, |i| i.segment as i64 - segment_start as i64);

        let chunk2_capacity = 4 * c + 1;
        let mut chunk2_keys = vec![0i64; chunk2_capacity];
        let mut chunk2_values = vec![0i64; chunk2_capacity];
        let chunk2_start;
        let chunk2_len;

        {
            let (keys_all, values_all, sizes_all) = self.storage.parts_mut();
            let keys = &mut keys_all[segment_start * c..(segment_start + num_segments) * c];
            let values = &mut values_all[segment_start * c..(segment_start + num_segments) * c];
            let sizes = &mut sizes_all[segment_start..segment_start + num_segments];

            // 1) compact towards the high end, trailing pairs first
            let mut seg: i64 = num_segments as i64 - 2;
            let mut run_start =
                (seg as usize + 1) * c - sizes[seg as usize] as usize;
            let mut run_end =
                run_start + sizes[seg as usize] as usize + sizes[seg as usize + 1] as usize;

            let mut space_left = chunk2_capacity;
            let mut copied_segments = 0;
            while seg >= 0 && copied_segments < 4 {
                let elements = run_end - run_start;
                if insert_segment == seg || insert_segment == seg + 1 {
                    let ins = insert.as_ref().expect("insert segment implies insert");
                    merge_one_into(
                        &keys[run_start..run_end],
                        &values[run_start..run_end],
                        &mut chunk2_keys[space_left - elements - 1..space_left],
                        &mut chunk2_values[space_left - elements - 1..space_left],
                        ins.key,
                        ins.value,
                    );
                    space_left -= 1;
                } else {
                    chunk2_keys[space_left - elements..space_left]
                        .copy_from_slice(&keys[run_start..run_end]);
                    chunk2_values[space_left - elements..space_left]
                        .copy_from_slice(&values[run_start..run_end]);
                }
                space_left -= elements;

                seg -= 2;
                if seg >= 0 {
                    run_start = (seg as usize + 1) * c - sizes[seg as usize] as usize;
                    run_end = run_start
                        + sizes[seg as usize] as usize
                        + sizes[seg as usize + 1] as usize;
                }
                copied_segments += 2;
            }
            chunk2_start = space_left;
            chunk2_len = chunk2_capacity - space_left;

            // the rest compacts in place, right behind the scratch content
            let mut chunk1_current = num_segments * c;
            while seg >= 0 {
                let elements = run_end - run_start;
                if insert_segment == seg || insert_segment == seg + 1 {
                    let ins = insert.as_ref().expect("insert segment implies insert");
                    // stage the run out of line so the +1 merge cannot trip
                    // over its own source
                    let run_keys = keys[run_start..run_end].to_vec();
                    let run_values = values[run_start..run_end].to_vec();
                    merge_one_into(
                        &run_keys,
                        &run_values,
                        &mut keys[chunk1_current - elements - 1..chunk1_current],
                        &mut values[chunk1_current - elements - 1..chunk1_current],
                        ins.key,
                        ins.value,
                    );
                    chunk1_current -= 1;
                } else {
                    keys.copy_within(run_start..run_end, chunk1_current - elements);
                    values.copy_within(run_start..run_end, chunk1_current - elements);
                }
                chunk1_current -= elements;

                seg -= 2;
                if seg >= 0 {
                    run_start = (seg as usize + 1) * c - sizes[seg as usize] as usize;
                    run_end = run_start
                        + sizes[seg as usize] as usize
                        + sizes[seg as usize + 1] as usize;
                }
            }
            let chunk1_start = chunk1_current;
            let chunk1_len = num_segments * c - chunk1_current;

            // 2) target sizes, extras in the lowest-indexed segments
            let eps = cardinality / num_segments;
            let odd = cardinality % num_segments;
            for (i, size) in sizes.iter_mut().enumerate() {
                *size = (eps + usize::from(i < odd)) as u16;
            }

            // 3) deal the stream back out, pair by pair
            let mut on_chunk1 = chunk1_len > 0;
            let mut input_pos = 0usize;
            let mut input_len = if on_chunk1 { chunk1_len } else { chunk2_len };
            for i in (0..num_segments).step_by(2) {
                let out_start = (i + 1) * c - sizes[i] as usize;
                let out_end = out_start + sizes[i] as usize + sizes[i + 1] as usize;
                let mut out = out_start;
                while out < out_end {
                    let n = (out_end - out).min(input_len - input_pos);
                    debug_assert!(n > 0, "input stream exhausted before the window filled");
                    if on_chunk1 {
                        keys.copy_within(
                            chunk1_start + input_pos..chunk1_start + input_pos + n,
                            out,
                        );
                        values.copy_within(
                            chunk1_start + input_pos..chunk1_start + input_pos + n,
                            out,
                        );
                    } else {
                        keys[out..out + n].copy_from_slice(
                            &chunk2_keys[chunk2_start + input_pos..chunk2_start + input_pos + n],
                        );
                        values[out..out + n].copy_from_slice(
                            &chunk2_values[chunk2_start + input_pos..chunk2_start + input_pos + n],
                        );
                    }
                    out += n;
                    input_pos += n;
                    if on_chunk1 && input_pos == input_len {
                        on_chunk1 = false;
                        input_pos = 0;
                        input_len = chunk2_len;
                    }
                }
            }
        }

        if insert.is_some() {
            self.storage.cardinality += 1;
        }
        self.refresh_window_separators(segment_start, num_segments);
    }

    /// Doubles (insert) or halves (delete) the backing store.
    fn resize(&mut self, pending: Option<(i64, i64)>) -> Result<()> {
        let element_bytes =
            self.storage.number_segments * self.storage.segment_capacity * ELEMENT_SIZE;
        if let Some((key, value)) = pending {
            // rewired fast path: double in place and spread through the
            // rewiring engine instead of copying into a fresh workspace
            if self.storage.is_rewired()
                && element_bytes >= self.storage.extent_size()
                && self.storage.can_extend(self.storage.number_segments)
            {
                self.resize_rewire(key, value)?;
                self.bounds.regenerate(self.storage.height);
                return Ok(());
            }
        }
        self.resize_general(pending)?;
        self.bounds.regenerate(self.storage.height);
        Ok(())
    }

    /// In-place doubling through `Storage::extend` plus a rewiring spread.
    fn resize_rewire(&mut self, key: i64, value: i64) -> Result<()> {
        let segments_before = self.storage.number_segments;
        let segments_after = segments_before * 2;
        debug!(segments_before, segments_after, "resize up in place");

        self.storage.extend(segments_before)?;
        self.index.rebuild(segments_after);

        let start_position = self.storage.content_end(0, segments_before - 1);
        let cardinality = self.storage.cardinality;
        let mut engine = RewiringSpread::new(self, 0, segments_after, cardinality, &[]);
        engine.set_element_to_insert(key, value);
        engine.set_start_position(start_position);
        engine.execute();

        self.stats.spreads_rewired += 1;
        self.stats.resizes_up += 1;
        Ok(())
    }

    /// Resize by streaming every element into a freshly allocated
    /// workspace at the new capacity.
    ///
    /// The old generation is swapped out first and dropped at the end, so
    /// its memory is released on every exit path. A failed allocation for
    /// a shrink is not an error: the store stays valid, merely under-dense.
    fn resize_general(&mut self, pending: Option<(i64, i64)>) -> Result<()> {
        let is_insert = pending.is_some();
        let c = self.storage.segment_capacity;
        let new_capacity = if is_insert {
            self.storage.capacity * 2
        } else {
            self.storage.capacity / 2
        };
        let num_segments = new_capacity / c;
        debug!(
            old_capacity = self.storage.capacity,
            new_capacity, num_segments, "resize"
        );

        let workspace =
            match Workspace::allocate(c, self.storage.pages_per_extent, num_segments) {
                Ok(workspace) => workspace,
                Err(err) if !is_insert => {
                    warn!(%err, "skipping resize down, store stays under-dense");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };
        let old = self.storage.swap_workspace(workspace, num_segments);
        self.index.rebuild(num_segments);

        let cardinality = self.storage.cardinality;
        let eps = cardinality / num_segments;
        let odd = cardinality % num_segments;

        let old_keys = old.keys();
        let old_values = old.values();
        let old_sizes = old.sizes();

        // input cursor over the old generation; deletes may leave empty
        // segments behind, skip them
        let mut in_seg = 0usize;
        while in_seg < old.number_segments && old_sizes[in_seg] == 0 {
            in_seg += 1;
        }
        let mut in_len = if in_seg < old.number_segments {
            old_sizes[in_seg] as usize
        } else {
            0
        };
        let mut in_pos = if in_seg < old.number_segments {
            in_seg * c + if in_seg % 2 == 0 { c - in_len } else { 0 }
        } else {
            0
        };

        let mut pending = pending;
        for j in 0..num_segments {
            let target = eps + usize::from(j < odd);
            {
                let (keys, values, sizes) = self.storage.parts_mut();
                sizes[j] = target as u16;
                let mut out = j * c + if j % 2 == 0 { c - target } else { 0 };
                let mut remaining = target;
                while remaining > 0 {
                    let n = remaining.min(in_len);
                    debug_assert!(n > 0, "old generation exhausted early");
                    keys[out..out + n].copy_from_slice(&old_keys[in_pos..in_pos + n]);
                    values[out..out + n].copy_from_slice(&old_values[in_pos..in_pos + n]);
                    out += n;
                    in_pos += n;
                    in_len -= n;
                    remaining -= n;
                    if in_len == 0 {
                        in_seg += 1;
                        while in_seg < old.number_segments && old_sizes[in_seg] == 0 {
                            in_seg += 1;
                        }
                        if in_seg < old.number_segments {
                            in_len = old_sizes[in_seg] as usize;
                            in_pos = in_seg * c + if in_seg % 2 == 0 { c - in_len } else { 0 };
                        }
                    }
                }
            }

            // place the pending element as soon as its key precedes the
            // last key dealt into this segment
            if let Some((key, value)) = pending {
                if target > 0 {
                    let last = self.storage.keys()[self.last_occupied(j)];
                    if key < last {
                        self.storage.insert_unsafe(j, key, value);
                        pending = None;
                    }
                }
            }
        }
        // a key above everything goes into the final segment
        if let Some((key, value)) = pending {
            self.storage.insert_unsafe(num_segments - 1, key, value);
        }

        self.refresh_window_separators(0, num_segments);
        if is_insert {
            self.stats.resizes_up += 1;
        } else {
            self.stats.resizes_down += 1;
        }
        Ok(())
    }

    /// Index of the last occupied slot of a non-empty segment.
    fn last_occupied(&self, segment: usize) -> usize {
        let range = self.storage.segment_range(segment);
        range.end - 1
    }
}

/// Ascending merge of one extra element into a sorted run.
///
/// `dst` is exactly one slot longer than `src`; the slices must not alias.
pub(crate) fn merge_one_into(
    src_keys: &[i64],
    src_values: &[i64],
    dst_keys: &mut [i64],
    dst_values: &mut [i64],
    key: i64,
    value: i64,
) {
    debug_assert_eq!(dst_keys.len(), src_keys.len() + 1);
    let mut i = 0;
    while i < src_keys.len() && src_keys[i] < key {
        dst_keys[i] = src_keys[i];
        dst_values[i] = src_values[i];
        i += 1;
    }
    dst_keys[i] = key;
    dst_values[i] = value;
    dst_keys[i + 1..].copy_from_slice(&src_keys[i..]);
    dst_values[i + 1..].copy_from_slice(&src_values[i..]);
}
