//! Bulk loading of pre-sorted batches.

use crate::rewire_spread::RewiringSpread;
use crate::storage::Workspace;
use crate::{PackedMemoryArray, Result};
use lacuna_common::config::ELEMENT_SIZE;
use tracing::{debug, trace};

/// One maximal slice of the batch whose keys all target the same segment,
/// later fused with neighbouring runs into a shared rebalancing window.
#[derive(Debug, Clone)]
struct RunInfo {
    /// First batch index of the run.
    run_start: usize,
    run_length: usize,
    /// Window content plus the run (and any fused neighbours).
    cardinality: usize,
    window_start: usize,
    window_length: usize,
    /// Cleared when the run is absorbed by a neighbour's window.
    valid: bool,
}

impl RunInfo {
    fn new(run_start: usize, segment: usize) -> Self {
        Self {
            run_start,
            run_length: 1,
            cardinality: 0,
            window_start: segment,
            window_length: 1,
            valid: true,
        }
    }
}

impl PackedMemoryArray {
    /// Merges a sorted batch of distinct new keys into the index.
    ///
    /// Observationally equivalent to inserting the batch elements one by
    /// one, but runs targeting the same neighbourhood share a single
    /// redistribution, and an overfull root triggers one resize sized for
    /// the whole batch instead of a cascade of doublings.
    pub fn load_sorted(&mut self, batch: &[(i64, i64)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        debug_assert!(
            batch.windows(2).all(|w| w[0].0 < w[1].0),
            "batch must be sorted by strictly ascending key"
        );
        self.stats.bulk_loads += 1;
        debug!(batch = batch.len(), "bulk load");

        if self.is_empty() {
            return self.load_empty(batch);
        }

        let mut runs = self.generate_runs(batch);
        self.stats.bulk_runs += runs.len() as u64;
        if self.fuse_runs(&mut runs) {
            self.load_resize(batch)
        } else {
            self.load_spread(batch, &runs)
        }
    }

    /// Splits the batch at every target-segment change.
    fn generate_runs(&self, batch: &[(i64, i64)]) -> Vec<RunInfo> {
        let num_segments = self.storage.number_segments;
        let mut runs = Vec::new();

        let mut i = 0;
        while i < batch.len() {
            let segment = self.index.find(batch[i].0);
            // keys up to the next segment's minimum stay in this run
            let max = if segment + 1 < num_segments {
                self.index.get_separator_key(segment + 1)
            } else {
                i64::MAX
            };

            let mut entry = RunInfo::new(i, segment);
            i += 1;
            while i < batch.len() && batch[i].0 <= max {
                entry.run_length += 1;
                i += 1;
            }
            entry.cardinality = self.storage.sizes()[segment] as usize + entry.run_length;
            trace!(
                segment,
                run_start = entry.run_start,
                run_length = entry.run_length,
                "batch run"
            );
            runs.push(entry);
        }
        runs
    }

    /// Ascends the calibrator tree for each run; a window that grows into a
    /// neighbouring run absorbs it and keeps climbing.
    ///
    /// Returns `true` when some window reaches the root still above the
    /// upper threshold, i.e. the whole store has to resize.
    fn fuse_runs(&mut self, runs: &mut [RunInfo]) -> bool {
        let c = self.storage.segment_capacity;
        let total = runs.len();

        for i in 0..total {
            if !runs[i].valid {
                continue;
            }
            let segment_id = runs[i].window_start;
            debug_assert_eq!(runs[i].window_length, 1, "run already fused");

            let mut num_elements = runs[i].cardinality;
            let mut theta = self.bounds.leaf_upper();
            let mut density = num_elements as f64 / c as f64;
            let mut height = 1u32;
            let mut window_length = 1usize;
            let mut window_id = segment_id;
            let mut window_start = segment_id;

            if self.storage.height > 1 && density > theta {
                let mut windex_left = segment_id as i64 - 1;
                let mut windex_right = segment_id + 1;

                // nearest live runs on either side
                let mut sindex_left = i as i64 - 1;
                let mut srun_left: i64 = -1;
                while sindex_left >= 0 && srun_left < 0 {
                    let s = sindex_left as usize;
                    if runs[s].valid {
                        srun_left = (runs[s].window_start + runs[s].window_length - 1) as i64;
                    } else {
                        sindex_left -= 1;
                    }
                }
                let mut sindex_right = i + 1;
                let mut srun_right: i64 = -1;
                while sindex_right < total && srun_right < 0 {
                    if runs[sindex_right].valid {
                        srun_right = runs[sindex_right].window_start as i64;
                    } else {
                        sindex_right += 1;
                    }
                }

                loop {
                    height += 1;
                    window_length *= 2;
                    window_id /= 2;
                    window_start = window_id * window_length;
                    let window_end = window_start + window_length;
                    theta = self.bounds.thresholds(height).1;

                    while windex_left >= window_start as i64 {
                        if windex_left == srun_left {
                            // absorb the left neighbour, batch share included
                            let left = sindex_left as usize;
                            num_elements += runs[left].cardinality;
                            runs[i].run_start = runs[left].run_start;
                            runs[i].run_length += runs[left].run_length;
                            runs[left].valid = false;
                            self.stats.bulk_runs_fused += 1;
                            windex_left = runs[left].window_start as i64 - 1;

                            sindex_left -= 1;
                            srun_left = -1;
                            while sindex_left >= 0 && srun_left < 0 {
                                let s = sindex_left as usize;
                                if runs[s].valid {
                                    srun_left =
                                        (runs[s].window_start + runs[s].window_length - 1) as i64;
                                } else {
                                    sindex_left -= 1;
                                }
                            }
                        } else {
                            num_elements += self.storage.sizes()[windex_left as usize] as usize;
                            windex_left -= 1;
                        }
                    }
                    while windex_right < window_end {
                        if windex_right as i64 == srun_right {
                            // absorb the right neighbour
                            let right = sindex_right;
                            num_elements += runs[right].cardinality;
                            runs[i].run_length += runs[right].run_length;
                            runs[right].valid = false;
                            self.stats.bulk_runs_fused += 1;
                            windex_right = runs[right].window_start + runs[right].window_length;

                            sindex_right += 1;
                            srun_right = -1;
                            while sindex_right < total && srun_right < 0 {
                                if runs[sindex_right].valid {
                                    srun_right = runs[sindex_right].window_start as i64;
                                } else {
                                    sindex_right += 1;
                                }
                            }
                        } else {
                            num_elements += self.storage.sizes()[windex_right] as usize;
                            windex_right += 1;
                        }
                    }

                    density = num_elements as f64 / (window_length * c) as f64;
                    if !(density > theta && height < self.storage.height) {
                        break;
                    }
                }
            }

            runs[i].window_start = window_start;
            runs[i].window_length = window_length;
            runs[i].cardinality = num_elements;

            if window_length == self.storage.number_segments && density > theta {
                debug!("bulk load exceeds the root threshold, resize requested");
                return true;
            }
        }
        false
    }

    /// Applies every surviving run: point insert, single-segment merge, or
    /// merge-and-spread over the fused window.
    fn load_spread(&mut self, batch: &[(i64, i64)], runs: &[RunInfo]) -> Result<()> {
        let c = self.storage.segment_capacity;
        for run in runs.iter().filter(|r| r.valid) {
            let slice = &batch[run.run_start..run.run_start + run.run_length];
            if run.window_length == 1 {
                if run.run_length == 1 {
                    // fusion guarantees the segment has room
                    let (key, value) = slice[0];
                    self.insert_common(run.window_start, key, value)?;
                } else {
                    self.load_merge_single(run.window_start, slice, run.cardinality);
                }
            } else {
                let window_bytes = run.window_length * c * ELEMENT_SIZE;
                if self.storage.is_rewired() && window_bytes >= self.storage.extent_size() {
                    self.stats.spreads_rewired += 1;
                    let engine = RewiringSpread::new(
                        self,
                        run.window_start,
                        run.window_length,
                        run.cardinality,
                        slice,
                    );
                    engine.execute();
                    self.storage.cardinality += run.run_length;
                } else {
                    self.stats.spreads_two_copy += 1;
                    self.load_merge_multi(run.window_start, run.window_length, slice, run.cardinality);
                }
            }
        }
        Ok(())
    }

    /// Stream-merges one run with the current content of its segment.
    fn load_merge_single(&mut self, segment: usize, run: &[(i64, i64)], cardinality: usize) {
        let c = self.storage.segment_capacity;
        {
            let (keys_all, values_all, sizes) = self.storage.parts_mut();
            let base = segment * c;
            let keys = &mut keys_all[base..base + c];
            let values = &mut values_all[base..base + c];
            let input_size = sizes[segment] as usize;
            debug_assert_eq!(input_size + run.len(), cardinality);

            // stage the current content; the merged result overlaps it
            let in_start = if segment % 2 == 0 { c - input_size } else { 0 };
            let input_keys = keys[in_start..in_start + input_size].to_vec();
            let input_values = values[in_start..in_start + input_size].to_vec();

            let out_start = if segment % 2 == 0 { c - cardinality } else { 0 };
            let out_end = if segment % 2 == 0 { c } else { cardinality };

            let mut out = out_start;
            let mut a = 0;
            let mut b = 0;
            while a < input_size && b < run.len() {
                if run[b].0 < input_keys[a] {
                    keys[out] = run[b].0;
                    values[out] = run[b].1;
                    b += 1;
                } else {
                    keys[out] = input_keys[a];
                    values[out] = input_values[a];
                    a += 1;
                }
                out += 1;
            }
            if a < input_size {
                let remaining = input_size - a;
                keys[out..out + remaining].copy_from_slice(&input_keys[a..]);
                values[out..out + remaining].copy_from_slice(&input_values[a..]);
                out += remaining;
            }
            while b < run.len() {
                keys[out] = run[b].0;
                values[out] = run[b].1;
                b += 1;
                out += 1;
            }
            debug_assert_eq!(out, out_end);

            sizes[segment] = cardinality as u16;
        }
        self.storage.cardinality += run.len();
        let minimum = self.storage.minimum(segment);
        self.index.set_separator_key(segment, minimum);
    }

    /// Two-copy merge-and-spread: compacts the window content to its high
    /// end (the tail going to a scratch buffer), then redistributes while
    /// merging the batch run in.
    fn load_merge_multi(
        &mut self,
        window_start: usize,
        window_length: usize,
        run: &[(i64, i64)],
        cardinality: usize,
    ) {
        let c = self.storage.segment_capacity;
        debug_assert!(window_start % 2 == 0 && window_length % 2 == 0);
        debug_assert!(window_length * c >= cardinality);

        let eps = cardinality / window_length;
        let odd = cardinality % window_length;
        let chunk2_capacity = (c + window_length / (eps + 1)) * 2;
        let mut chunk2_keys = vec![0i64; chunk2_capacity];
        let mut chunk2_values = vec![0i64; chunk2_capacity];

        {
            let (keys_all, values_all, sizes_all) = self.storage.parts_mut();
            let keys = &mut keys_all[window_start * c..(window_start + window_length) * c];
            let values = &mut values_all[window_start * c..(window_start + window_length) * c];
            let sizes = &mut sizes_all[window_start..window_start + window_length];

            // 1) compact towards the high end; the scratch takes the tail
            let mut seg: i64 = window_length as i64 - 2;
            let mut run_lo = (seg as usize + 1) * c - sizes[seg as usize] as usize;
            let mut run_cur =
                run_lo + sizes[seg as usize] as usize + sizes[seg as usize + 1] as usize;

            let mut space_left = chunk2_capacity;
            while seg >= 0 && space_left > 0 {
                let n = space_left.min(run_cur - run_lo);
                chunk2_keys[space_left - n..space_left]
                    .copy_from_slice(&keys[run_cur - n..run_cur]);
                chunk2_values[space_left - n..space_left]
                    .copy_from_slice(&values[run_cur - n..run_cur]);
                run_cur -= n;
                space_left -= n;
                if run_cur <= run_lo {
                    seg -= 2;
                    if seg >= 0 {
                        run_lo = (seg as usize + 1) * c - sizes[seg as usize] as usize;
                        run_cur = run_lo
                            + sizes[seg as usize] as usize
                            + sizes[seg as usize + 1] as usize;
                    }
                }
            }
            let chunk2_start = space_left;
            let chunk2_len = chunk2_capacity - space_left;

            let mut chunk1_current = window_length * c;
            while seg >= 0 {
                let n = run_cur - run_lo;
                if n > 0 {
                    keys.copy_within(run_lo..run_cur, chunk1_current - n);
                    values.copy_within(run_lo..run_cur, chunk1_current - n);
                    chunk1_current -= n;
                }
                seg -= 2;
                if seg >= 0 {
                    run_lo = (seg as usize + 1) * c - sizes[seg as usize] as usize;
                    run_cur =
                        run_lo + sizes[seg as usize] as usize + sizes[seg as usize + 1] as usize;
                }
            }
            let chunk1_start = chunk1_current;
            let chunk1_len = window_length * c - chunk1_current;

            // 2) target sizes
            for (i, size) in sizes.iter_mut().enumerate() {
                *size = (eps + usize::from(i < odd)) as u16;
            }

            // 3) merge the window stream with the batch run, pair by pair
            let mut on_chunk1 = chunk1_len > 0;
            let mut input_pos = 0usize;
            let mut input_len = if on_chunk1 { chunk1_len } else { chunk2_len };
            let mut b = 0usize;
            for i in (0..window_length).step_by(2) {
                let out_start = (i + 1) * c - sizes[i] as usize;
                let out_end = out_start + sizes[i] as usize + sizes[i + 1] as usize;
                let mut out = out_start;

                while out < out_end && input_pos < input_len && b < run.len() {
                    let (in_key, in_value) = if on_chunk1 {
                        (
                            keys[chunk1_start + input_pos],
                            values[chunk1_start + input_pos],
                        )
                    } else {
                        (
                            chunk2_keys[chunk2_start + input_pos],
                            chunk2_values[chunk2_start + input_pos],
                        )
                    };
                    if in_key <= run[b].0 {
                        keys[out] = in_key;
                        values[out] = in_value;
                        input_pos += 1;
                        if on_chunk1 && input_pos == input_len {
                            on_chunk1 = false;
                            input_pos = 0;
                            input_len = chunk2_len;
                        }
                    } else {
                        keys[out] = run[b].0;
                        values[out] = run[b].1;
                        b += 1;
                    }
                    out += 1;
                }
                while out < out_end && input_pos < input_len {
                    let n = (out_end - out).min(input_len - input_pos);
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
                while out < out_end && b < run.len() {
                    keys[out] = run[b].0;
                    values[out] = run[b].1;
                    b += 1;
                    out += 1;
                }
            }
        }

        self.storage.cardinality += run.len();
        self.refresh_window_separators(window_start, window_length);
    }

    /// Resizes the whole store to fit the existing content plus the batch,
    /// merging both into the new layout in one pass.
    fn load_resize(&mut self, batch: &[(i64, i64)]) -> Result<()> {
        let c = self.storage.segment_capacity;
        let cardinality = self.storage.cardinality + batch.len();
        let target_density = self.bounds.root_upper();
        let capacity = ((cardinality as f64 / target_density).ceil() as usize).next_power_of_two();
        let num_segments = capacity / c;
        debug_assert!(num_segments > self.storage.number_segments);

        let element_bytes =
            self.storage.number_segments * self.storage.segment_capacity * ELEMENT_SIZE;
        let delta = num_segments - self.storage.number_segments;
        if self.storage.is_rewired()
            && element_bytes >= self.storage.extent_size()
            && self.storage.can_extend(delta)
        {
            self.load_resize_rewire(batch, num_segments)?;
        } else {
            self.load_resize_general(batch, num_segments)?;
        }
        self.bounds.regenerate(self.storage.height);
        self.stats.resizes_up += 1;
        Ok(())
    }

    /// In-place variant: extend the rewired span, then bulk-spread the old
    /// content and the batch together.
    fn load_resize_rewire(&mut self, batch: &[(i64, i64)], num_segments: usize) -> Result<()> {
        let segments_before = self.storage.number_segments;
        debug!(segments_before, num_segments, "bulk resize in place");
        self.storage.extend(num_segments - segments_before)?;
        self.index.rebuild(num_segments);

        let cardinality = self.storage.cardinality + batch.len();
        let start_position = self.storage.content_end(0, segments_before - 1);
        let mut engine = RewiringSpread::new(self, 0, num_segments, cardinality, batch);
        engine.set_start_position(start_position);
        engine.execute();

        self.storage.cardinality = cardinality;
        self.stats.spreads_rewired += 1;
        Ok(())
    }

    /// Copying variant: allocate a fresh workspace and merge-stream the
    /// old generation and the batch into it.
    fn load_resize_general(&mut self, batch: &[(i64, i64)], num_segments: usize) -> Result<()> {
        let c = self.storage.segment_capacity;
        let cardinality = self.storage.cardinality + batch.len();
        debug!(
            segments = num_segments,
            cardinality, "bulk resize into a fresh workspace"
        );
        let workspace = Workspace::allocate(c, self.storage.pages_per_extent, num_segments)?;
        let old = self.storage.swap_workspace(workspace, num_segments);
        self.index.rebuild(num_segments);
        self.storage.cardinality = cardinality;

        let eps = cardinality / num_segments;
        let odd = cardinality % num_segments;

        let old_keys = old.keys();
        let old_values = old.values();
        let old_sizes = old.sizes();

        // input cursor over the old generation, double-segment runs;
        // in_pos == in_end encodes exhaustion
        let mut in_seg = 0usize;
        let mut in_pos = 0usize;
        let mut in_end = 0usize;
        advance_pair_cursor(
            old_sizes,
            c,
            old.number_segments,
            &mut in_seg,
            &mut in_pos,
            &mut in_end,
            true,
        );

        let mut b = 0usize;
        for j in (0..num_segments).step_by(2) {
            let size_lhs = eps + usize::from(j < odd);
            let size_rhs = eps + usize::from(j + 1 < odd);
            {
                let (keys, values, sizes) = self.storage.parts_mut();
                sizes[j] = size_lhs as u16;
                sizes[j + 1] = size_rhs as u16;
                let out_start = (j + 1) * c - size_lhs;
                let out_end = out_start + size_lhs + size_rhs;
                let mut out = out_start;

                while out < out_end && in_pos < in_end && b < batch.len() {
                    if old_keys[in_pos] < batch[b].0 {
                        keys[out] = old_keys[in_pos];
                        values[out] = old_values[in_pos];
                        in_pos += 1;
                        if in_pos == in_end {
                            advance_pair_cursor(
                                old_sizes,
                                c,
                                old.number_segments,
                                &mut in_seg,
                                &mut in_pos,
                                &mut in_end,
                                false,
                            );
                        }
                    } else {
                        keys[out] = batch[b].0;
                        values[out] = batch[b].1;
                        b += 1;
                    }
                    out += 1;
                }
                while out < out_end && in_pos < in_end {
                    let n = (out_end - out).min(in_end - in_pos);
                    keys[out..out + n].copy_from_slice(&old_keys[in_pos..in_pos + n]);
                    values[out..out + n].copy_from_slice(&old_values[in_pos..in_pos + n]);
                    out += n;
                    in_pos += n;
                    if in_pos == in_end {
                        advance_pair_cursor(
                            old_sizes,
                            c,
                            old.number_segments,
                            &mut in_seg,
                            &mut in_pos,
                            &mut in_end,
                            false,
                        );
                    }
                }
                while out < out_end && b < batch.len() {
                    keys[out] = batch[b].0;
                    values[out] = batch[b].1;
                    b += 1;
                    out += 1;
                }
                debug_assert_eq!(out, out_end, "merge streams exhausted early");
            }
        }

        self.refresh_window_separators(0, num_segments);
        Ok(())
    }

    /// Direct load into an empty store.
    fn load_empty(&mut self, batch: &[(i64, i64)]) -> Result<()> {
        let c = self.storage.segment_capacity;
        if c as f64 * self.bounds.leaf_upper() >= batch.len() as f64 {
            self.load_empty_single(batch);
            Ok(())
        } else {
            self.load_empty_multi(batch)
        }
    }

    /// The batch fits one segment at leaf density: write it into segment 0.
    fn load_empty_single(&mut self, batch: &[(i64, i64)]) {
        let c = self.storage.segment_capacity;
        {
            let (keys, values, sizes) = self.storage.parts_mut();
            let out_start = c - batch.len();
            for (i, &(key, value)) in batch.iter().enumerate() {
                keys[out_start + i] = key;
                values[out_start + i] = value;
            }
            sizes[0] = batch.len() as u16;
        }
        self.storage.cardinality = batch.len();
        self.index.set_separator_key(0, batch[0].0);
    }

    /// Allocate a store sized for the batch at the bulk target density and
    /// deal the batch out evenly.
    fn load_empty_multi(&mut self, batch: &[(i64, i64)]) -> Result<()> {
        let c = self.storage.segment_capacity;
        let target_density = self.bounds.bulk_target_density();
        let capacity = ((batch.len() as f64 / target_density).ceil() as usize).next_power_of_two();
        let num_segments = capacity / c;
        debug!(
            batch = batch.len(),
            num_segments, "bulk load into empty store"
        );

        let workspace = Workspace::allocate(c, self.storage.pages_per_extent, num_segments)?;
        let _old = self.storage.swap_workspace(workspace, num_segments);
        self.index.rebuild(num_segments);
        self.storage.cardinality = batch.len();

        let eps = batch.len() / num_segments;
        let odd = batch.len() % num_segments;
        {
            let (keys, values, sizes) = self.storage.parts_mut();
            for i in 0..num_segments {
                sizes[i] = (eps + usize::from(i < odd)) as u16;
            }
            let mut idx = 0;
            for i in (0..num_segments).step_by(2) {
                let out_start = (i + 1) * c - sizes[i] as usize;
                let out_end = out_start + sizes[i] as usize + sizes[i + 1] as usize;
                for out in out_start..out_end {
                    keys[out] = batch[idx].0;
                    values[out] = batch[idx].1;
                    idx += 1;
                }
            }
            debug_assert_eq!(idx, batch.len());
        }

        self.refresh_window_separators(0, num_segments);
        self.bounds.regenerate(self.storage.height);
        Ok(())
    }
}

/// Advances a double-segment read cursor to the next non-empty pair;
/// leaves `in_pos == in_end` when the old generation is exhausted.
fn advance_pair_cursor(
    old_sizes: &[u16],
    c: usize,
    num_segments: usize,
    in_seg: &mut usize,
    in_pos: &mut usize,
    in_end: &mut usize,
    init: bool,
) {
    let mut seg = if init { 0 } else { *in_seg + 2 };
    loop {
        if seg >= num_segments {
            *in_seg = seg;
            *in_pos = 0;
            *in_end = 0;
            return;
        }
        let lhs = old_sizes[seg] as usize;
        let rhs = if seg + 1 < num_segments {
            old_sizes[seg + 1] as usize
        } else {
            0
        };
        if lhs + rhs > 0 {
            *in_seg = seg;
            *in_pos = (seg + 1) * c - lhs;
            *in_end = *in_pos + lhs + rhs;
            return;
        }
        seg += 2;
    }
}
