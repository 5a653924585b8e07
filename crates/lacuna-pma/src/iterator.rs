//! Ordered iteration and range aggregation over the sparse array.

use crate::storage::Storage;
use crate::PackedMemoryArray;

/// Lazy ordered iterator over the elements of `[min_key, max_key]`.
///
/// Walks the double-segment runs of the sparse array: segments `2k` and
/// `2k + 1` store their elements contiguously, so the iterator crosses one
/// gap per pair instead of one per segment.
///
/// The iterator borrows the index; mutating operations invalidate it at
/// compile time.
pub struct RangeIter<'a> {
    storage: &'a Storage,
    offset: usize,
    stop: usize,
    /// One past the last qualifying position in the whole array.
    index_max: usize,
    next_segment: usize,
}

impl<'a> RangeIter<'a> {
    pub(crate) fn empty(storage: &'a Storage) -> Self {
        Self {
            storage,
            offset: 0,
            stop: 0,
            index_max: 0,
            next_segment: 0,
        }
    }

    /// Builds an iterator over `[key_min, key_max]` restricted to the
    /// segment range `[segment_start, segment_end]` reported by the
    /// separator index.
    pub(crate) fn new(
        storage: &'a Storage,
        segment_start: usize,
        segment_end: usize,
        key_min: i64,
        key_max: i64,
    ) -> Self {
        if segment_start > segment_end || segment_end >= storage.number_segments {
            return Self::empty(storage);
        }
        let c = storage.segment_capacity;
        let keys = storage.keys();
        let sizes = storage.sizes();
        let num_segments = storage.number_segments;

        // first qualifying position: scan forward from segment_start
        let mut segment_id = segment_start;
        let mut stop = 0usize;
        let mut offset = 0usize;
        let mut notfound = true;
        while notfound && segment_id < num_segments {
            let start;
            if segment_id % 2 == 0 {
                stop = (segment_id + 1) * c;
                start = stop - sizes[segment_id] as usize;
            } else {
                start = segment_id * c;
                stop = start + sizes[segment_id] as usize;
            }
            offset = start;
            while offset < stop && keys[offset] < key_min {
                offset += 1;
            }
            notfound = offset == stop;
            if notfound {
                segment_id += 1;
            }
        }

        let mut next_segment = segment_id + 1;
        if segment_id % 2 == 0 && next_segment < num_segments {
            // the odd partner continues the run without a gap
            stop = next_segment * c + sizes[next_segment] as usize;
            next_segment += 1;
        }

        if notfound || keys[offset] > key_max {
            return Self::empty(storage);
        }

        // last qualifying position: scan backward from segment_end
        let interval_start = segment_id as i64;
        let mut seg = segment_end as i64;
        let mut upper: i64 = -1;
        let mut upper_found = false;
        while !upper_found && seg >= interval_start {
            let start;
            let lowest; // first index below the occupied region
            if seg % 2 == 0 {
                start = (seg + 1) * c as i64 - 1;
                lowest = start - sizes[seg as usize] as i64;
            } else {
                lowest = seg * c as i64 - 1;
                start = lowest + sizes[seg as usize] as i64;
            }
            upper = start;
            while upper > lowest && keys[upper as usize] > key_max {
                upper -= 1;
            }
            upper_found = upper > lowest;
            if !upper_found {
                seg -= 1;
            }
        }

        if !upper_found || (upper as usize) < offset {
            return Self::empty(storage);
        }
        let index_max = upper as usize + 1;
        Self {
            storage,
            offset,
            stop: stop.min(index_max),
            index_max,
            next_segment,
        }
    }

    /// Positions the cursor at the next double-segment run.
    fn next_sequence(&mut self) {
        let c = self.storage.segment_capacity;
        let sizes = self.storage.sizes();
        let num_segments = self.storage.number_segments;
        let segment = self.next_segment;
        if segment >= num_segments {
            return;
        }
        if segment % 2 == 0 {
            self.offset = segment * c + c - sizes[segment] as usize;
            let partner = segment + 1;
            let mut stop = partner * c;
            if partner < num_segments {
                stop += sizes[partner] as usize;
            }
            self.stop = stop.min(self.index_max);
            self.next_segment += 2;
        } else {
            self.offset = segment * c;
            self.stop = (self.offset + sizes[segment] as usize).min(self.index_max);
            self.next_segment += 1;
        }
    }
}

impl Iterator for RangeIter<'_> {
    type Item = (i64, i64);

    fn next(&mut self) -> Option<(i64, i64)> {
        if self.offset >= self.stop {
            return None;
        }
        let result = (
            self.storage.keys()[self.offset],
            self.storage.values()[self.offset],
        );
        self.offset += 1;
        while self.offset >= self.stop && self.next_segment < self.storage.number_segments {
            self.next_sequence();
        }
        Some(result)
    }
}

/// Aggregates of a key range, computed without materialising it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SumResult {
    pub num_elements: u64,
    pub sum_keys: i64,
    pub sum_values: i64,
    pub first_key: i64,
    pub last_key: i64,
}

impl PackedMemoryArray {
    /// Ordered iterator over the elements with keys in
    /// `[min_key, max_key]`. An inverted range yields an empty iterator.
    pub fn range(&self, min_key: i64, max_key: i64) -> RangeIter<'_> {
        if self.is_empty() || min_key > max_key {
            return RangeIter::empty(&self.storage);
        }
        RangeIter::new(
            &self.storage,
            self.index.find_first(min_key),
            self.index.find_last(max_key),
            min_key,
            max_key,
        )
    }

    /// Ordered iterator over every element.
    pub fn iter(&self) -> RangeIter<'_> {
        if self.is_empty() {
            return RangeIter::empty(&self.storage);
        }
        RangeIter::new(
            &self.storage,
            0,
            self.storage.number_segments - 1,
            i64::MIN,
            i64::MAX,
        )
    }

    /// Count, key sum, value sum, and endpoints of `[min_key, max_key]`,
    /// accumulated run by run.
    pub fn sum(&self, min_key: i64, max_key: i64) -> SumResult {
        if min_key > max_key || self.is_empty() {
            return SumResult::default();
        }
        let segment_start = self.index.find_first(min_key);
        let segment_end = self.index.find_last(max_key);
        if segment_end < segment_start {
            return SumResult::default();
        }

        let storage = &self.storage;
        let c = storage.segment_capacity;
        let keys = storage.keys();
        let values = storage.values();
        let sizes = storage.sizes();
        let num_segments = storage.number_segments;

        // first qualifying position
        let mut segment_id = segment_start;
        let mut stop = 0usize;
        let mut offset = 0usize;
        let mut notfound = true;
        while notfound && segment_id < num_segments {
            let start;
            if segment_id % 2 == 0 {
                stop = (segment_id + 1) * c;
                start = stop - sizes[segment_id] as usize;
            } else {
                start = segment_id * c;
                stop = start + sizes[segment_id] as usize;
            }
            offset = start;
            while offset < stop && keys[offset] < min_key {
                offset += 1;
            }
            notfound = offset == stop;
            if notfound {
                segment_id += 1;
            }
        }
        if segment_id % 2 == 0 && segment_id + 1 < num_segments {
            stop = (segment_id + 1) * c + sizes[segment_id + 1] as usize;
        }
        if notfound || keys[offset] > max_key {
            return SumResult::default();
        }

        // last qualifying position
        let end = {
            let interval_start = segment_id as i64;
            let mut seg = segment_end as i64;
            let mut upper: i64 = -1;
            let mut upper_found = false;
            while !upper_found && seg >= interval_start {
                let start;
                let lowest;
                if seg % 2 == 0 {
                    start = (seg + 1) * c as i64 - 1;
                    lowest = start - sizes[seg as usize] as i64;
                } else {
                    lowest = seg * c as i64 - 1;
                    start = lowest + sizes[seg as usize] as i64;
                }
                upper = start;
                while upper > lowest && keys[upper as usize] > max_key {
                    upper -= 1;
                }
                upper_found = upper > lowest;
                if !upper_found {
                    seg -= 1;
                }
            }
            if !upper_found {
                return SumResult::default();
            }
            upper as usize + 1
        };
        if end <= offset {
            return SumResult::default();
        }
        stop = stop.min(end);

        let mut result = SumResult {
            first_key: keys[offset],
            last_key: keys[end - 1],
            ..Default::default()
        };
        while offset < end {
            result.num_elements += (stop - offset) as u64;
            while offset < stop {
                result.sum_keys = result.sum_keys.wrapping_add(keys[offset]);
                result.sum_values = result.sum_values.wrapping_add(values[offset]);
                offset += 1;
            }

            // jump to the next even segment, i.e. the next run
            segment_id += 1 + usize::from(segment_id % 2 == 0);
            if segment_id < num_segments {
                let size_lhs = sizes[segment_id] as usize;
                let size_rhs = sizes[segment_id + 1] as usize;
                offset = (segment_id + 1) * c - size_lhs;
                stop = end.min(offset + size_lhs + size_rhs);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::{IndexConfig, PackedMemoryArray};

    fn populated(count: i64) -> PackedMemoryArray {
        let mut pma = PackedMemoryArray::new(IndexConfig {
            segment_capacity: 32,
            ..Default::default()
        })
        .unwrap();
        for i in 0..count {
            pma.insert(i * 10, i).unwrap();
        }
        pma
    }

    #[test]
    fn test_iter_yields_all_in_order() {
        let pma = populated(200);
        let keys: Vec<i64> = pma.iter().map(|(k, _)| k).collect();
        assert_eq!(keys.len(), 200);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(keys[0], 0);
        assert_eq!(keys[199], 1990);
    }

    #[test]
    fn test_range_inclusive_bounds() {
        let pma = populated(100);
        let keys: Vec<i64> = pma.range(250, 500).map(|(k, _)| k).collect();
        assert_eq!(keys, (25..=50).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_range_between_keys() {
        let pma = populated(100);
        // bounds that match no stored key exactly
        let keys: Vec<i64> = pma.range(251, 499).map(|(k, _)| k).collect();
        assert_eq!(keys, (26..=49).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_range_empty_cases() {
        let pma = populated(100);
        assert_eq!(pma.range(500, 250).count(), 0); // inverted
        assert_eq!(pma.range(2000, 3000).count(), 0); // above everything
        assert_eq!(pma.range(-50, -1).count(), 0); // below everything
        assert_eq!(pma.range(251, 259).count(), 0); // inside a gap
    }

    #[test]
    fn test_range_on_empty_structure() {
        let pma = PackedMemoryArray::with_defaults().unwrap();
        assert_eq!(pma.iter().count(), 0);
        assert_eq!(pma.range(0, 100).count(), 0);
    }

    #[test]
    fn test_range_matches_filtered_iter() {
        let pma = populated(300);
        for (lo, hi) in [(0, 2990), (15, 1205), (1000, 1000), (123, 456)] {
            let filtered: Vec<_> = pma.iter().filter(|&(k, _)| k >= lo && k <= hi).collect();
            let ranged: Vec<_> = pma.range(lo, hi).collect();
            assert_eq!(filtered, ranged, "range [{lo}, {hi}]");
        }
    }

    #[test]
    fn test_sum_sparse_range() {
        // S = {10, 20, ..., 1000}; sum over [25, 255]
        let mut pma = PackedMemoryArray::new(IndexConfig {
            segment_capacity: 32,
            ..Default::default()
        })
        .unwrap();
        for i in 1..=100 {
            pma.insert(i * 10, i * 10).unwrap();
        }
        let result = pma.sum(25, 255);
        assert_eq!(result.num_elements, 23);
        assert_eq!(result.sum_keys, (3..=25).map(|i| i * 10).sum::<i64>());
        assert_eq!(result.sum_values, result.sum_keys);
        assert_eq!(result.first_key, 30);
        assert_eq!(result.last_key, 250);
    }

    #[test]
    fn test_sum_matches_range() {
        let pma = populated(500);
        for (lo, hi) in [(0, 5000), (77, 1234), (4000, 4990), (-10, 3)] {
            let mut expected = crate::SumResult::default();
            let mut first = None;
            let mut last = None;
            for (k, v) in pma.range(lo, hi) {
                expected.num_elements += 1;
                expected.sum_keys += k;
                expected.sum_values += v;
                first.get_or_insert(k);
                last = Some(k);
            }
            expected.first_key = first.unwrap_or(0);
            expected.last_key = last.unwrap_or(0);
            assert_eq!(pma.sum(lo, hi), expected, "sum [{lo}, {hi}]");
        }
    }

    #[test]
    fn test_sum_empty_and_inverted() {
        let pma = populated(10);
        assert_eq!(pma.sum(95, 5), crate::SumResult::default());
        assert_eq!(pma.sum(91, 99), crate::SumResult::default());
        let empty = PackedMemoryArray::with_defaults().unwrap();
        assert_eq!(empty.sum(0, 100), crate::SumResult::default());
    }
}
