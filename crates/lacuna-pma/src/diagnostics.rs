//! Integrity checking, dumps, and operation counters.

use crate::{PackedMemoryArray, Result};
use lacuna_common::LacunaError;
use std::io::Write;

/// Counters of the structural operations performed since construction.
#[derive(Debug, Default, Clone)]
pub struct OpStats {
    /// Spreads executed by the compact-and-redistribute engine.
    pub spreads_two_copy: u64,
    /// Spreads executed by the frame-swapping engine.
    pub spreads_rewired: u64,
    pub resizes_up: u64,
    pub resizes_down: u64,
    pub bulk_loads: u64,
    /// Runs generated across all bulk loads.
    pub bulk_runs: u64,
    /// Runs absorbed into a neighbour's window during fusion.
    pub bulk_runs_fused: u64,
}

/// Distribution of the per-segment cardinalities.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentStats {
    pub num_segments: usize,
    pub cardinality_min: usize,
    pub cardinality_max: usize,
    pub cardinality_avg: f64,
    pub cardinality_stddev: f64,
    pub cardinality_median: f64,
}

impl PackedMemoryArray {
    /// Checks every structural invariant; returns
    /// [`LacunaError::Corrupted`] naming the first violation.
    ///
    /// Covers: per-segment bounds, global key order, separator agreement,
    /// cardinality accounting, and the pairwise-iteration sentinel.
    pub fn validate(&self) -> Result<()> {
        let c = self.storage.segment_capacity;
        let num_segments = self.storage.number_segments;
        let sizes = self.storage.sizes();
        let keys = self.storage.keys();

        if num_segments == 1 && sizes[1] != 0 {
            return Err(LacunaError::Corrupted("sentinel sizes[1] overwritten".into()));
        }

        let mut total = 0usize;
        let mut previous_key: Option<i64> = None;
        let mut previous_separator = i64::MIN;
        for segment in 0..num_segments {
            let size = sizes[segment] as usize;
            if size > c {
                return Err(LacunaError::Corrupted(format!(
                    "segment {segment} holds {size} elements, capacity is {c}"
                )));
            }
            total += size;

            let separator = self.index.get_separator_key(segment);
            if separator < previous_separator {
                return Err(LacunaError::Corrupted(format!(
                    "separator of segment {segment} decreases: {separator} < {previous_separator}"
                )));
            }
            previous_separator = separator;

            let range = self.storage.segment_range(segment);
            for position in range.clone() {
                let key = keys[position];
                if let Some(previous) = previous_key {
                    if key <= previous {
                        return Err(LacunaError::Corrupted(format!(
                            "key order violated at position {position}: {key} <= {previous}"
                        )));
                    }
                }
                previous_key = Some(key);
            }
            if size > 0 && separator != keys[range.start] {
                return Err(LacunaError::Corrupted(format!(
                    "separator of segment {segment} is {separator}, minimum is {}",
                    keys[range.start]
                )));
            }
        }

        if total != self.storage.cardinality {
            return Err(LacunaError::Corrupted(format!(
                "cardinality mismatch: registered {}, counted {total}",
                self.storage.cardinality
            )));
        }
        if self.is_empty() && self.index.get_separator_key(0) != i64::MIN {
            return Err(LacunaError::Corrupted(
                "empty structure must report i64::MIN as separator 0".into(),
            ));
        }
        Ok(())
    }

    /// Writes a human-readable segment dump.
    pub fn dump(&self, out: &mut impl Write) -> std::io::Result<()> {
        writeln!(
            out,
            "[pma] cardinality: {}, capacity: {}, height: {}, segments: {} x {}",
            self.storage.cardinality,
            self.storage.capacity,
            self.storage.height,
            self.storage.number_segments,
            self.storage.segment_capacity,
        )?;
        if self.is_empty() {
            return writeln!(out, "-- empty --");
        }

        let keys = self.storage.keys();
        let values = self.storage.values();
        for segment in 0..self.storage.number_segments {
            write!(
                out,
                "[{segment}] separator: {}:",
                self.index.get_separator_key(segment)
            )?;
            for position in self.storage.segment_range(segment) {
                write!(out, " <{}, {}>", keys[position], values[position])?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    /// Snapshot of the per-segment cardinalities, lowest segment first.
    pub fn segment_cardinalities(&self) -> Vec<usize> {
        self.storage.sizes()[..self.storage.number_segments]
            .iter()
            .map(|&s| s as usize)
            .collect()
    }

    /// Distribution statistics over the per-segment cardinalities.
    pub fn segment_stats(&self) -> SegmentStats {
        let mut cardinalities = self.segment_cardinalities();
        let n = cardinalities.len();
        let sum: usize = cardinalities.iter().sum();
        let avg = sum as f64 / n as f64;
        let variance = cardinalities
            .iter()
            .map(|&s| (s as f64 - avg).powi(2))
            .sum::<f64>()
            / n as f64;

        cardinalities.sort_unstable();
        let median = if n % 2 == 1 {
            cardinalities[n / 2] as f64
        } else {
            (cardinalities[n / 2 - 1] + cardinalities[n / 2]) as f64 / 2.0
        };

        SegmentStats {
            num_segments: n,
            cardinality_min: cardinalities[0],
            cardinality_max: cardinalities[n - 1],
            cardinality_avg: avg,
            cardinality_stddev: variance.sqrt(),
            cardinality_median: median,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{IndexConfig, PackedMemoryArray};

    fn populated() -> PackedMemoryArray {
        let mut pma = PackedMemoryArray::new(IndexConfig {
            segment_capacity: 32,
            ..Default::default()
        })
        .unwrap();
        for i in 0..250 {
            pma.insert(i, i).unwrap();
        }
        pma
    }

    #[test]
    fn test_validate_accepts_healthy_structure() {
        let pma = populated();
        pma.validate().unwrap();
    }

    #[test]
    fn test_validate_accepts_empty_structure() {
        let pma = PackedMemoryArray::with_defaults().unwrap();
        pma.validate().unwrap();
    }

    #[test]
    fn test_dump_mentions_every_element() {
        let mut pma = PackedMemoryArray::with_defaults().unwrap();
        pma.insert(42, 7).unwrap();
        pma.insert(17, 3).unwrap();

        let mut buffer = Vec::new();
        pma.dump(&mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("<42, 7>"));
        assert!(text.contains("<17, 3>"));
        assert!(text.contains("cardinality: 2"));
    }

    #[test]
    fn test_dump_empty() {
        let pma = PackedMemoryArray::with_defaults().unwrap();
        let mut buffer = Vec::new();
        pma.dump(&mut buffer).unwrap();
        assert!(String::from_utf8(buffer).unwrap().contains("-- empty --"));
    }

    #[test]
    fn test_segment_stats_accounting() {
        let pma = populated();
        let stats = pma.segment_stats();
        assert_eq!(stats.num_segments, pma.segment_cardinalities().len());
        assert!(stats.cardinality_min <= stats.cardinality_max);
        assert!((stats.cardinality_avg * stats.num_segments as f64 - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_op_stats_accumulate() {
        let pma = populated();
        let stats = pma.stats();
        assert!(stats.spreads_two_copy + stats.spreads_rewired + stats.resizes_up >= 1);
    }
}
