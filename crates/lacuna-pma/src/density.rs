//! Density calibrator: per-height fill bounds of the rebalancing windows.

use lacuna_common::DensityConfig;

/// Computes and caches the density band of every calibrator-tree height.
///
/// A window of height `h` (1 = one segment, `H` = the whole array) must
/// keep its fill fraction within `thresholds(h)`; outside the band the
/// rebalancer widens the window or, at the root, resizes the store.
///
/// The band interpolates linearly between the leaf bounds at `h = 1` and
/// the root bounds at `h = H`, so the upper bound relaxes toward the
/// leaves (a lone segment may run nearly full) while the lower bound
/// relaxes toward zero (a lone segment may run empty). The cache is keyed
/// by the tree height and regenerated whenever the store resizes.
pub(crate) struct DensityBounds {
    config: DensityConfig,
    tree_height: u32,
    /// `(lower, upper)` per window height, index 0 unused.
    cache: Vec<(f64, f64)>,
}

impl DensityBounds {
    pub(crate) fn new(config: DensityConfig, tree_height: u32) -> Self {
        let mut bounds = Self {
            config,
            tree_height: 0,
            cache: Vec::new(),
        };
        bounds.regenerate(tree_height);
        bounds
    }

    /// Pure interpolation for a window of height `h` in a tree of height `H`.
    pub(crate) fn thresholds_for(config: &DensityConfig, h: u32, tree_height: u32) -> (f64, f64) {
        debug_assert!(h >= 1 && h <= tree_height);
        if tree_height <= 1 {
            return (config.leaf_lower, config.leaf_upper);
        }
        let t = (h - 1) as f64 / (tree_height - 1) as f64;
        let lower = config.leaf_lower + (config.root_lower - config.leaf_lower) * t;
        let upper = config.leaf_upper + (config.root_upper - config.leaf_upper) * t;
        (lower, upper)
    }

    /// Rebuilds the cache for a tree of height `tree_height`.
    pub(crate) fn regenerate(&mut self, tree_height: u32) {
        self.tree_height = tree_height;
        self.cache.clear();
        self.cache.push((f64::NAN, f64::NAN)); // heights are 1-based
        for h in 1..=tree_height {
            self.cache
                .push(Self::thresholds_for(&self.config, h, tree_height));
        }
    }

    /// Cached `(lower, upper)` band of a window of height `h`.
    pub(crate) fn thresholds(&self, h: u32) -> (f64, f64) {
        self.cache[h as usize]
    }

    pub(crate) fn tree_height(&self) -> u32 {
        self.tree_height
    }

    pub(crate) fn leaf_upper(&self) -> f64 {
        self.config.leaf_upper
    }

    pub(crate) fn root_upper(&self) -> f64 {
        self.config.root_upper
    }

    pub(crate) fn leaf_lower(&self) -> f64 {
        self.config.leaf_lower
    }

    /// Target density of a bulk load into empty storage: halfway between
    /// the root and leaf upper bounds, so the load neither wastes space nor
    /// forces an immediate resize on the next insert.
    pub(crate) fn bulk_target_density(&self) -> f64 {
        (self.config.root_upper + self.config.leaf_upper) / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_bounds(tree_height: u32) -> DensityBounds {
        DensityBounds::new(DensityConfig::default(), tree_height)
    }

    #[test]
    fn test_anchors_exact() {
        let bounds = default_bounds(8);
        let (leaf_lower, leaf_upper) = bounds.thresholds(1);
        let (root_lower, root_upper) = bounds.thresholds(8);
        assert_eq!(leaf_lower, 0.0);
        assert_eq!(leaf_upper, 0.75);
        assert_eq!(root_lower, 0.08);
        assert_eq!(root_upper, 0.5);
    }

    #[test]
    fn test_single_segment_tree() {
        let bounds = default_bounds(1);
        assert_eq!(bounds.thresholds(1), (0.0, 0.75));
    }

    #[test]
    fn test_monotone_toward_root() {
        let bounds = default_bounds(12);
        for h in 1..12 {
            let (lower, upper) = bounds.thresholds(h);
            let (next_lower, next_upper) = bounds.thresholds(h + 1);
            assert!(next_upper <= upper, "upper must not increase, h={h}");
            assert!(next_lower >= lower, "lower must not decrease, h={h}");
            assert!(lower < upper, "band must be non-empty, h={h}");
        }
    }

    #[test]
    fn test_regenerate_on_new_height() {
        let mut bounds = default_bounds(4);
        let before = bounds.thresholds(4);
        assert_eq!(before, (0.08, 0.5));

        bounds.regenerate(8);
        assert_eq!(bounds.tree_height(), 8);
        assert_eq!(bounds.thresholds(8), (0.08, 0.5));
        // height 4 now sits mid-band instead of at the root
        let (lower, upper) = bounds.thresholds(4);
        assert!(lower > 0.0 && lower < 0.08);
        assert!(upper > 0.5 && upper < 0.75);
    }

    #[test]
    fn test_cache_matches_pure_function() {
        let config = DensityConfig::default();
        let bounds = DensityBounds::new(config, 10);
        for h in 1..=10 {
            assert_eq!(
                bounds.thresholds(h),
                DensityBounds::thresholds_for(&config, h, 10)
            );
        }
    }

    #[test]
    fn test_bulk_target_density() {
        let bounds = default_bounds(3);
        assert_eq!(bounds.bulk_target_density(), 0.625);
    }
}
