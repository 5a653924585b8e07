//! B+-tree-shaped flat array over segment separator keys.

/// Static search index over segment minima.
///
/// One separator key is stored per segment: the minimum key of that segment
/// (`i64::MIN` for segment 0 while the structure is empty). Above the
/// separator array sit derived levels of fan-out `node_capacity`, each entry
/// mirroring the first separator of its child node, so a lookup touches one
/// node per level instead of binary-searching the whole array.
///
/// The shape is static for a given segment count: no splits, no merges.
/// [`rebuild`] re-derives it when the storage resizes;
/// [`set_separator_key`] refreshes one leaf slot and the ancestor entries
/// covering it.
///
/// Empty segments inherit the minimum of the next non-empty segment, so
/// separators are non-decreasing but not necessarily distinct. [`find`]
/// resolves a run of equal separators to its last segment (the one that
/// actually holds elements), [`find_first`] to its first.
///
/// [`rebuild`]: StaticIndex::rebuild
/// [`set_separator_key`]: StaticIndex::set_separator_key
/// [`find`]: StaticIndex::find
/// [`find_first`]: StaticIndex::find_first
pub struct StaticIndex {
    node_capacity: usize,
    separators: Vec<i64>,
    /// Derived levels, bottom-up. Entry `j` of level `l` mirrors
    /// `separators[j * node_capacity^(l+1)]`.
    levels: Vec<Vec<i64>>,
}

impl StaticIndex {
    /// Creates an index for `num_segments` segments, all separators
    /// initialised to `i64::MIN`.
    pub fn new(node_capacity: usize, num_segments: usize) -> Self {
        assert!(node_capacity >= 2);
        let mut index = Self {
            node_capacity,
            separators: Vec::new(),
            levels: Vec::new(),
        };
        index.rebuild(num_segments);
        index
    }

    /// Re-derives the tree shape for `new_segment_count` segments.
    ///
    /// All separators reset to `i64::MIN`; the caller repopulates them with
    /// [`set_separator_key`](Self::set_separator_key) while streaming the
    /// storage into its new layout.
    pub fn rebuild(&mut self, new_segment_count: usize) {
        assert!(new_segment_count >= 1);
        self.separators.clear();
        self.separators.resize(new_segment_count, i64::MIN);
        self.levels.clear();

        let mut len = new_segment_count;
        while len > self.node_capacity {
            len = len.div_ceil(self.node_capacity);
            self.levels.push(vec![i64::MIN; len]);
        }
    }

    /// Records `key` as the minimum of `segment`.
    pub fn set_separator_key(&mut self, segment: usize, key: i64) {
        self.separators[segment] = key;

        let mut idx = segment;
        for level in &mut self.levels {
            if idx % self.node_capacity != 0 {
                break;
            }
            idx /= self.node_capacity;
            level[idx] = key;
        }
    }

    /// Returns the separator key of `segment`.
    pub fn get_separator_key(&self, segment: usize) -> i64 {
        self.separators[segment]
    }

    /// Returns the unique segment that may contain `key`: the largest
    /// segment whose separator is at most `key`, or 0 if there is none.
    pub fn find(&self, key: i64) -> usize {
        let mut node = 0;
        for level in self.levels.iter().rev() {
            node = self.node_search(level, node, key);
        }
        self.node_search(&self.separators, node, key)
    }

    /// Returns the first segment of the separator run selected by `key`.
    ///
    /// Lower endpoint of a segment range covering `[key, ..]`.
    pub fn find_first(&self, key: i64) -> usize {
        let mut segment = self.find(key);
        while segment > 0 && self.separators[segment - 1] == self.separators[segment] {
            segment -= 1;
        }
        segment
    }

    /// Upper endpoint of a segment range covering `[.., key]`.
    pub fn find_last(&self, key: i64) -> usize {
        self.find(key)
    }

    /// Number of segments covered by the index.
    pub fn num_segments(&self) -> usize {
        self.separators.len()
    }

    /// Bytes of heap and inline state held by the index.
    pub fn memory_footprint(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.separators.capacity() * std::mem::size_of::<i64>()
            + self
                .levels
                .iter()
                .map(|l| l.capacity() * std::mem::size_of::<i64>())
                .sum::<usize>()
    }

    /// Scans one node for the last entry at most `key`.
    ///
    /// Returns the absolute child index; the node's first entry when no
    /// entry qualifies (only possible in node 0, where it clamps to 0).
    fn node_search(&self, entries: &[i64], node: usize, key: i64) -> usize {
        let start = node * self.node_capacity;
        let end = (start + self.node_capacity).min(entries.len());
        let mut pos = start;
        for (i, &separator) in entries[start..end].iter().enumerate() {
            if separator <= key {
                pos = start + i;
            } else {
                break;
            }
        }
        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::prelude::*;
    use rand::Rng;

    /// Reference implementation: linear scan for the last separator <= key.
    fn find_by_scan(separators: &[i64], key: i64) -> usize {
        let mut result = 0;
        for (i, &s) in separators.iter().enumerate() {
            if s <= key {
                result = i;
            }
        }
        result
    }

    fn populated(node_capacity: usize, separators: &[i64]) -> StaticIndex {
        let mut index = StaticIndex::new(node_capacity, separators.len());
        for (i, &s) in separators.iter().enumerate() {
            index.set_separator_key(i, s);
        }
        index
    }

    #[test]
    fn test_empty_structure_separator() {
        let index = StaticIndex::new(4, 1);
        assert_eq!(index.get_separator_key(0), i64::MIN);
        assert_eq!(index.find(0), 0);
        assert_eq!(index.find(i64::MIN), 0);
        assert_eq!(index.find(i64::MAX), 0);
    }

    #[test]
    fn test_find_single_level() {
        let index = populated(4, &[10, 20, 30]);
        assert_eq!(index.find(5), 0); // below all separators
        assert_eq!(index.find(10), 0);
        assert_eq!(index.find(19), 0);
        assert_eq!(index.find(20), 1);
        assert_eq!(index.find(35), 2);
    }

    #[test]
    fn test_find_multi_level() {
        // 16 segments with node capacity 4 builds two derived levels
        let separators: Vec<i64> = (0..16).map(|i| i * 100).collect();
        let index = populated(4, &separators);
        assert_eq!(index.levels.len(), 2);

        for key in [-1, 0, 99, 100, 777, 1500, 1599, 100_000] {
            assert_eq!(index.find(key), find_by_scan(&separators, key), "key {key}");
        }
    }

    #[test]
    fn test_duplicate_separators_resolve_last_and_first() {
        // segments 1 and 2 are empty: they inherit segment 3's minimum
        let index = populated(4, &[10, 40, 40, 40, 80]);
        assert_eq!(index.find(40), 3);
        assert_eq!(index.find(50), 3);
        assert_eq!(index.find_first(40), 1);
        assert_eq!(index.find_last(40), 3);
        assert_eq!(index.find_first(10), 0);
    }

    #[test]
    fn test_set_separator_propagates_to_ancestors() {
        let mut index = populated(4, &(0..64).map(|i| i * 10).collect::<Vec<_>>());
        // segment 16 heads a level-1 node and a level-2 entry
        index.set_separator_key(16, 155);
        assert_eq!(index.levels[0][4], 155);
        assert_eq!(index.levels[1][1], 155);
        assert_eq!(index.find(156), 16);

        // a non-head segment touches no ancestors
        index.set_separator_key(17, 165);
        assert_eq!(index.levels[0][4], 155);
    }

    #[test]
    fn test_rebuild_changes_shape() {
        let mut index = StaticIndex::new(4, 4);
        assert!(index.levels.is_empty());

        index.rebuild(64);
        assert_eq!(index.num_segments(), 64);
        assert_eq!(index.levels.len(), 2);
        assert!(index.separators.iter().all(|&s| s == i64::MIN));

        index.rebuild(2);
        assert_eq!(index.num_segments(), 2);
        assert!(index.levels.is_empty());
    }

    #[test]
    fn test_find_matches_scan_on_random_data() {
        let mut rng = StdRng::seed_from_u64(7);
        for &n in &[1usize, 2, 5, 16, 33, 250, 1024] {
            let mut separators: Vec<i64> = (0..n).map(|_| rng.gen_range(-1000..1000)).collect();
            separators.sort_unstable();
            let index = populated(8, &separators);
            for _ in 0..200 {
                let key = rng.gen_range(-1100..1100);
                assert_eq!(index.find(key), find_by_scan(&separators, key));
            }
        }
    }

    #[test]
    fn test_memory_footprint_grows_with_segments() {
        let small = StaticIndex::new(8, 8);
        let large = StaticIndex::new(8, 4096);
        assert!(large.memory_footprint() > small.memory_footprint());
    }

    proptest! {
        #[test]
        fn prop_find_matches_scan(
            mut separators in prop::collection::vec(-10_000i64..10_000, 1..200),
            keys in prop::collection::vec(-11_000i64..11_000, 1..50),
            node_capacity in 2usize..32,
        ) {
            separators.sort_unstable();
            let index = populated(node_capacity, &separators);
            for key in keys {
                prop_assert_eq!(index.find(key), find_by_scan(&separators, key));
            }
        }

        #[test]
        fn prop_find_first_heads_duplicate_run(
            mut separators in prop::collection::vec(-50i64..50, 1..100),
            key in -60i64..60,
            node_capacity in 2usize..16,
        ) {
            separators.sort_unstable();
            let index = populated(node_capacity, &separators);
            let first = index.find_first(key);
            let last = index.find_last(key);
            prop_assert!(first <= last);
            prop_assert_eq!(separators[first], separators[last]);
            if first > 0 {
                prop_assert!(separators[first - 1] < separators[first]);
            }
        }
    }
}
