//! Configuration structures for Lacuna.

use crate::error::{LacunaError, Result};
use crate::mem::os_page_size;
use serde::{Deserialize, Serialize};

/// Size of one stored element (key or value) in bytes.
pub const ELEMENT_SIZE: usize = std::mem::size_of::<i64>();

/// Smallest admissible segment capacity, in elements.
pub const MIN_SEGMENT_CAPACITY: usize = 32;

/// Largest admissible segment capacity; segment sizes are stored as u16.
pub const MAX_SEGMENT_CAPACITY: usize = u16::MAX as usize;

/// Density thresholds of the calibrator tree.
///
/// A window of height `h` in a tree of height `H` must keep its fill
/// fraction inside the band obtained by interpolating linearly between
/// the leaf bounds (`h = 1`) and the root bounds (`h = H`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DensityConfig {
    /// Upper fill bound of a single segment.
    pub leaf_upper: f64,
    /// Upper fill bound of the whole array.
    pub root_upper: f64,
    /// Lower fill bound of the whole array; falling below it halves the array.
    pub root_lower: f64,
    /// Lower fill bound of a single segment. Zero allows empty segments.
    pub leaf_lower: f64,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            leaf_upper: 0.75,
            root_upper: 0.5,
            root_lower: 0.08,
            leaf_lower: 0.0,
        }
    }
}

impl DensityConfig {
    /// Checks ordering and hysteresis of the four bounds.
    ///
    /// `2 * root_lower <= root_upper` keeps the band reachable after a
    /// resize in either direction: halving the array doubles the density,
    /// doubling it halves the density.
    pub fn validate(&self) -> Result<()> {
        let in_unit = |name: &'static str, v: f64| -> Result<()> {
            if !(0.0..=1.0).contains(&v) || v.is_nan() {
                return Err(LacunaError::invalid_parameter(name, v));
            }
            Ok(())
        };
        in_unit("leaf_upper", self.leaf_upper)?;
        in_unit("root_upper", self.root_upper)?;
        in_unit("root_lower", self.root_lower)?;
        in_unit("leaf_lower", self.leaf_lower)?;

        if self.leaf_lower > self.root_lower {
            return Err(LacunaError::invalid_parameter(
                "leaf_lower",
                format!("{} > root_lower {}", self.leaf_lower, self.root_lower),
            ));
        }
        if self.root_upper > self.leaf_upper {
            return Err(LacunaError::invalid_parameter(
                "root_upper",
                format!("{} > leaf_upper {}", self.root_upper, self.leaf_upper),
            ));
        }
        if 2.0 * self.root_lower > self.root_upper {
            return Err(LacunaError::invalid_parameter(
                "root_lower",
                format!("{} (must be at most root_upper / 2)", self.root_lower),
            ));
        }
        Ok(())
    }
}

/// Construction parameters for a packed memory array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Number of elements per segment. Rounded up to a power of two.
    pub segment_capacity: usize,
    /// Fan-out of one node of the static separator index.
    pub index_node_capacity: usize,
    /// Number of OS pages per rewiring extent. Must be a power of two.
    pub pages_per_extent: usize,
    /// Density thresholds of the calibrator tree.
    pub density: DensityConfig,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            segment_capacity: 64,
            index_node_capacity: 64,
            pages_per_extent: 16,
            density: DensityConfig::default(),
        }
    }
}

impl IndexConfig {
    /// Normalises and validates the configuration.
    ///
    /// The segment capacity is rounded up to a power of two and must lie in
    /// `[MIN_SEGMENT_CAPACITY, MAX_SEGMENT_CAPACITY]`, its byte size must
    /// divide the OS page size, and one extent must hold at least two
    /// segments (the rewiring engines operate on even/odd segment pairs).
    pub fn validated(mut self) -> Result<Self> {
        let requested = self.segment_capacity;
        self.segment_capacity = self
            .segment_capacity
            .checked_next_power_of_two()
            .filter(|&c| c <= MAX_SEGMENT_CAPACITY)
            .ok_or_else(|| LacunaError::invalid_parameter("segment_capacity", requested))?;
        if self.segment_capacity < MIN_SEGMENT_CAPACITY {
            return Err(LacunaError::invalid_parameter("segment_capacity", requested));
        }

        let page_size = os_page_size();
        let segment_bytes = self.segment_capacity * ELEMENT_SIZE;
        if page_size % segment_bytes != 0 {
            return Err(LacunaError::invalid_parameter(
                "segment_capacity",
                format!(
                    "{} ({} bytes does not divide the page size {})",
                    self.segment_capacity, segment_bytes, page_size
                ),
            ));
        }

        if !self.pages_per_extent.is_power_of_two() {
            return Err(LacunaError::invalid_parameter(
                "pages_per_extent",
                self.pages_per_extent,
            ));
        }
        let extent_bytes = self.pages_per_extent * page_size;
        if extent_bytes < 2 * segment_bytes {
            return Err(LacunaError::invalid_parameter(
                "pages_per_extent",
                format!(
                    "{} (one extent must hold at least two segments)",
                    self.pages_per_extent
                ),
            ));
        }

        if self.index_node_capacity < 2 {
            return Err(LacunaError::invalid_parameter(
                "index_node_capacity",
                self.index_node_capacity,
            ));
        }

        self.density.validate()?;
        Ok(self)
    }

    /// Returns the extent size in bytes for this configuration.
    pub fn extent_bytes(&self) -> usize {
        self.pages_per_extent * os_page_size()
    }
}
