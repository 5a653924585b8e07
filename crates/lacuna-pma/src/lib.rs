//! Packed memory array: an adaptive in-memory ordered index.
//!
//! Maps `i64` keys to `i64` values through a sparse sorted array divided
//! into fixed-capacity segments. Gaps between elements amortise insertion;
//! a calibrator tree of density thresholds decides how far a rebalance has
//! to reach; large windows are redistributed by remapping physical page
//! frames instead of copying. A static B+-tree-shaped index over segment
//! minima answers point and range lookups in logarithmic time.

mod bulk;
mod density;
mod diagnostics;
mod iterator;
mod rebalance;
mod rewire_spread;
mod storage;

pub use diagnostics::{OpStats, SegmentStats};
pub use iterator::{RangeIter, SumResult};
pub use lacuna_common::{DensityConfig, IndexConfig, LacunaError, Result};

use density::DensityBounds;
use lacuna_index::StaticIndex;
use storage::Storage;
use tracing::{debug, warn};

/// An ordered index from `i64` keys to `i64` values backed by a packed
/// memory array.
///
/// Single-writer: every operation runs to completion on the calling
/// thread. Iterators borrow the structure and are invalidated by any
/// subsequent mutation (the borrow checker enforces this).
pub struct PackedMemoryArray {
    storage: Storage,
    index: StaticIndex,
    bounds: DensityBounds,
    stats: OpStats,
}

impl PackedMemoryArray {
    /// Creates an empty index with the given configuration.
    pub fn new(config: IndexConfig) -> Result<Self> {
        let config = config.validated()?;
        let storage = Storage::new(config.segment_capacity, config.pages_per_extent)?;
        let index = StaticIndex::new(config.index_node_capacity, 1);
        let bounds = DensityBounds::new(config.density, storage.height);
        debug!(
            segment_capacity = config.segment_capacity,
            pages_per_extent = config.pages_per_extent,
            "packed memory array created"
        );
        Ok(Self {
            storage,
            index,
            bounds,
            stats: OpStats::default(),
        })
    }

    /// Creates an empty index with the default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(IndexConfig::default())
    }

    /// Number of elements stored.
    pub fn len(&self) -> usize {
        self.storage.cardinality
    }

    /// Returns whether the index holds no elements.
    pub fn is_empty(&self) -> bool {
        self.storage.cardinality == 0
    }

    /// Inserts `key` with `value`. Keys are unique; inserting a key that is
    /// already present is unspecified.
    ///
    /// Fails only when growing the store hits an allocation failure, in
    /// which case the structure is unchanged.
    pub fn insert(&mut self, key: i64, value: i64) -> Result<()> {
        if self.is_empty() {
            self.insert_empty(key, value);
            return Ok(());
        }
        let segment = self.index.find(key);
        self.insert_common(segment, key, value)
    }

    /// First insert into a completely empty structure.
    fn insert_empty(&mut self, key: i64, value: i64) {
        debug_assert!(self.is_empty());
        self.index.set_separator_key(0, key);
        let c = self.storage.segment_capacity;
        let (keys, values, sizes) = self.storage.parts_mut();
        sizes[0] = 1;
        keys[c - 1] = key;
        values[c - 1] = value;
        self.storage.cardinality = 1;
    }

    /// Inserts into the segment selected by the separator index.
    pub(crate) fn insert_common(&mut self, segment: usize, key: i64, value: i64) -> Result<()> {
        debug_assert!(!self.is_empty());
        if self.storage.sizes()[segment] as usize == self.storage.segment_capacity {
            self.rebalance(segment, Some((key, value)))
        } else {
            if self.storage.insert_unsafe(segment, key, value) {
                self.index.set_separator_key(segment, key);
            }
            Ok(())
        }
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: i64) -> Option<i64> {
        if self.is_empty() {
            return None;
        }
        let segment = self.index.find(key);
        let c = self.storage.segment_capacity;
        let range = self.storage.segment_range(segment);
        let position = {
            let keys = self.storage.keys();
            range.clone().find(|&i| keys[i] == key)?
        };

        let value;
        let was_minimum = position == range.start;
        {
            let (keys, values, _) = self.storage.parts_mut();
            value = values[position];
            if segment % 2 == 0 {
                // even: vacate the left edge of the packed region
                for j in (range.start + 1..=position).rev() {
                    keys[j] = keys[j - 1];
                    values[j] = values[j - 1];
                }
            } else {
                // odd: close the gap toward the left
                for j in position..range.end - 1 {
                    keys[j] = keys[j + 1];
                    values[j] = values[j + 1];
                }
            }
        }
        let new_size = {
            let (_, _, sizes) = self.storage.parts_mut();
            sizes[segment] -= 1;
            sizes[segment] as usize
        };
        self.storage.cardinality -= 1;

        if self.storage.cardinality == 0 {
            self.index.set_separator_key(0, i64::MIN);
        } else if was_minimum && new_size > 0 {
            let minimum = self.storage.minimum(segment);
            self.index.set_separator_key(segment, minimum);
        }

        // under the leaf lower bound the neighbourhood has to be rebalanced
        if self.storage.cardinality > 0 && self.storage.number_segments > 1 {
            let minimum_size =
                ((self.bounds.thresholds(1).0 * c as f64) as usize).max(1);
            if new_size < minimum_size {
                // spreads cannot fail and a shrink that cannot allocate is
                // skipped inside resize, so this stays a removal either way
                if let Err(err) = self.rebalance(segment, None) {
                    warn!(%err, "rebalance after delete skipped, store stays under-dense");
                }
            }
        }

        Some(value)
    }

    /// Looks up the value stored under `key`.
    pub fn get(&self, key: i64) -> Option<i64> {
        if self.is_empty() {
            return None;
        }
        let segment = self.index.find(key);
        let range = self.storage.segment_range(segment);
        let keys = self.storage.keys();
        let position = range.clone().find(|&i| keys[i] == key)?;
        Some(self.storage.values()[position])
    }

    /// Refreshes the separator keys of a window after a redistribution.
    ///
    /// An empty segment inherits the minimum of the nearest non-empty
    /// segment to its right (or of the segment after the window), keeping
    /// the separator sequence non-decreasing.
    pub(crate) fn refresh_window_separators(&mut self, window_start: usize, window_length: usize) {
        let window_end = window_start + window_length;
        let mut carry = if window_end < self.storage.number_segments {
            self.index.get_separator_key(window_end)
        } else {
            i64::MAX
        };
        for segment in (window_start..window_end).rev() {
            if self.storage.sizes()[segment] > 0 {
                carry = self.storage.minimum(segment);
            }
            self.index.set_separator_key(segment, carry);
        }
    }

    /// Operation counters (spreads, resizes, bulk runs).
    pub fn stats(&self) -> &OpStats {
        &self.stats
    }

    /// Bytes held by the storage arrays and the separator index.
    pub fn memory_footprint(&self) -> usize {
        std::mem::size_of::<Self>() + self.storage.memory_footprint() + self.index.memory_footprint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> IndexConfig {
        IndexConfig {
            segment_capacity: 32,
            index_node_capacity: 8,
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_to_single_element() {
        let mut pma = PackedMemoryArray::new(small_config()).unwrap();
        assert!(pma.is_empty());
        assert_eq!(pma.get(42), None);

        pma.insert(42, 7).unwrap();
        assert_eq!(pma.get(42), Some(7));
        assert_eq!(pma.len(), 1);
        assert_eq!(pma.iter().collect::<Vec<_>>(), vec![(42, 7)]);
    }

    #[test]
    fn test_insert_within_one_segment() {
        let mut pma = PackedMemoryArray::new(small_config()).unwrap();
        for key in [5, 3, 9, 1, 7] {
            pma.insert(key, key * 10).unwrap();
        }
        assert_eq!(pma.len(), 5);
        assert_eq!(
            pma.iter().map(|(k, _)| k).collect::<Vec<_>>(),
            vec![1, 3, 5, 7, 9]
        );
        assert_eq!(pma.get(7), Some(70));
        assert_eq!(pma.get(2), None);
        pma.validate().unwrap();
    }

    #[test]
    fn test_remove_returns_prior_value() {
        let mut pma = PackedMemoryArray::new(small_config()).unwrap();
        pma.insert(10, 100).unwrap();
        pma.insert(20, 200).unwrap();

        assert_eq!(pma.remove(10), Some(100));
        assert_eq!(pma.remove(10), None);
        assert_eq!(pma.len(), 1);
        assert_eq!(pma.get(20), Some(200));
    }

    #[test]
    fn test_remove_last_element_resets_separator() {
        let mut pma = PackedMemoryArray::new(small_config()).unwrap();
        pma.insert(5, 50).unwrap();
        assert_eq!(pma.remove(5), Some(50));
        assert!(pma.is_empty());

        // the structure is reusable after being emptied
        pma.insert(3, 30).unwrap();
        assert_eq!(pma.get(3), Some(30));
    }

    #[test]
    fn test_grow_past_one_segment() {
        let mut pma = PackedMemoryArray::new(small_config()).unwrap();
        for i in 1..=200 {
            pma.insert(i, i).unwrap();
        }
        assert_eq!(pma.len(), 200);
        pma.validate().unwrap();
        for i in 1..=200 {
            assert_eq!(pma.get(i), Some(i), "key {i}");
        }
        assert!(pma.stats().resizes_up >= 1);
    }

    #[test]
    fn test_reverse_insertion_order() {
        let mut pma = PackedMemoryArray::new(small_config()).unwrap();
        for i in (1..=300).rev() {
            pma.insert(i, -i).unwrap();
        }
        pma.validate().unwrap();
        let collected: Vec<_> = pma.iter().collect();
        assert_eq!(collected.len(), 300);
        assert!(collected.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_memory_footprint_nonzero() {
        let pma = PackedMemoryArray::new(small_config()).unwrap();
        assert!(pma.memory_footprint() > 32 * 8 * 2);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = IndexConfig {
            segment_capacity: 8,
            ..Default::default()
        };
        assert!(PackedMemoryArray::new(config).is_err());
    }
}
