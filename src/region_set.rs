//! Bin partition of progress-coordinate space.
//!
//! `RegionSet` is an injected collaborator: the core never chooses a
//! binning scheme. `RectilinearRegionSet` is a concrete implementation
//! good enough to drive the resampler and the integration tests,
//! grounded in `original_source/binning.py`'s `RectilinearRegionSet`
//! (bins are the Cartesian product of per-dimension boundary lists).

use bisection::bisect_left;

/// Observable per-bin statistics, accumulated by [`RegionSet::add`] and
/// reset by [`RegionSet::reset_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BinStats {
    pub count: u64,
    pub weight: f64,
    pub target_count: u64,
}

/// The observable contract of a bin partition. Stable bin order: the
/// index passed to and returned from every method is the bin's position
/// in that stable enumeration.
pub trait RegionSet {
    fn n_bins(&self) -> usize;
    fn n_dim(&self) -> usize;

    /// `Some(initial_state_index)` if this bin is a target (sink) that
    /// recycles absorbed particles to the named initial state.
    fn sink_initial_state(&self, bin: usize) -> Option<usize>;

    /// Maps one progress-coordinate vector to a bin index.
    fn bin_index(&self, pcoord: &[f64]) -> usize;

    /// Maps a sequence of progress-coordinate vectors to bin indices,
    /// in input order. Pure: repeated calls with the same input give
    /// the same output.
    fn map_to_bins(&self, pcoords: &[Vec<f64>]) -> Vec<usize> {
        pcoords.iter().map(|p| self.bin_index(p)).collect()
    }

    /// Maps every frame of a single trajectory (one segment's full
    /// `pcoord` array) to bin indices. Used by the out-of-scope
    /// bin-assignment analysis utility; kept here because it is part of
    /// the RegionSet's observable contract.
    fn map_to_all_indices(&self, trajectory: &[Vec<f64>]) -> Vec<usize> {
        trajectory.iter().map(|p| self.bin_index(p)).collect()
    }

    /// Clears accumulated `count`/`weight` on every bin; `target_count`
    /// is unaffected (it is a property of the partition, not of a
    /// particular particle set).
    fn reset_stats(&mut self);

    /// Accumulates one particle's weight into the named bin's stats.
    fn add(&mut self, bin: usize, weight: f64);

    /// A snapshot of every bin's accumulated stats, in enumeration order.
    fn stats(&self) -> &[BinStats];

    /// Changes iff the partition (bin boundaries/target counts/sinks)
    /// changes; stable across `reset_stats`/`add` calls.
    fn identity_hash(&self) -> u64;
}

/// A bin partition built from the Cartesian product of per-dimension
/// boundary lists, mirroring WESTPA's `RectilinearRegionSet`.
#[derive(Debug, Clone)]
pub struct RectilinearRegionSet {
    /// `boundaries[d]` is the sorted list of bin edges for dimension
    /// `d`; dimension `d` has `boundaries[d].len() - 1` bins.
    boundaries: Vec<Vec<f64>>,
    /// Per-bin target occupancy, in row-major (dim 0 slowest) order over
    /// the Cartesian product of per-dimension bin indices.
    target_counts: Vec<u64>,
    /// `sinks[bin] = Some(initial_state_index)` for target bins.
    sinks: Vec<Option<usize>>,
    stats: Vec<BinStats>,
    hash: u64,
}

impl RectilinearRegionSet {
    /// `boundaries` is one sorted edge list per dimension (length =
    /// n_bins_in_dim + 1). `target_counts` and `sinks` are in row-major
    /// order over the Cartesian product, dimension 0 varying slowest.
    pub fn new(
        boundaries: Vec<Vec<f64>>,
        target_counts: Vec<u64>,
        sinks: Vec<Option<usize>>,
    ) -> Self {
        let n_bins: usize = boundaries.iter().map(|b| b.len() - 1).product();
        assert_eq!(target_counts.len(), n_bins, "target_counts must cover every bin");
        assert_eq!(sinks.len(), n_bins, "sinks must cover every bin");

        let hash = Self::compute_hash(&boundaries, &target_counts, &sinks);
        let stats = target_counts
            .iter()
            .map(|&t| BinStats { count: 0, weight: 0.0, target_count: t })
            .collect();

        RectilinearRegionSet { boundaries, target_counts, sinks, stats, hash }
    }

    fn compute_hash(
        boundaries: &[Vec<f64>],
        target_counts: &[u64],
        sinks: &[Option<usize>],
    ) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        for dim in boundaries {
            for edge in dim {
                edge.to_bits().hash(&mut hasher);
            }
            0xFFFF_u64.hash(&mut hasher); // dimension separator
        }
        target_counts.hash(&mut hasher);
        sinks.hash(&mut hasher);
        hasher.finish()
    }

    fn dim_bin_count(&self, dim: usize) -> usize {
        self.boundaries[dim].len() - 1
    }

    /// Locates the bin index within one dimension via binary search over
    /// sorted boundaries using `bisection` for sorted-position lookup.
    fn dim_index(&self, dim: usize, value: f64) -> usize {
        let edges = &self.boundaries[dim];
        let n_bins = edges.len() - 1;
        let pos = bisect_left(edges, &value);
        // bisect_left(edges, value) is the count of edges strictly less
        // than value; the enclosing bin is one to the left of that,
        // clamped to the valid range (values at/outside the outer edges
        // fall in the first/last bin).
        pos.saturating_sub(1).min(n_bins - 1)
    }
}

impl RegionSet for RectilinearRegionSet {
    fn n_bins(&self) -> usize {
        self.target_counts.len()
    }

    fn n_dim(&self) -> usize {
        self.boundaries.len()
    }

    fn sink_initial_state(&self, bin: usize) -> Option<usize> {
        self.sinks[bin]
    }

    fn bin_index(&self, pcoord: &[f64]) -> usize {
        assert_eq!(pcoord.len(), self.n_dim(), "pcoord dimensionality mismatch");
        let mut idx = 0usize;
        for (dim, &value) in pcoord.iter().enumerate() {
            idx = idx * self.dim_bin_count(dim) + self.dim_index(dim, value);
        }
        idx
    }

    fn reset_stats(&mut self) {
        for (stat, &target) in self.stats.iter_mut().zip(self.target_counts.iter()) {
            *stat = BinStats { count: 0, weight: 0.0, target_count: target };
        }
    }

    fn add(&mut self, bin: usize, weight: f64) {
        self.stats[bin].count += 1;
        self.stats[bin].weight += weight;
    }

    fn stats(&self) -> &[BinStats] {
        &self.stats
    }

    fn identity_hash(&self) -> u64 {
        self.hash
    }
}

impl RectilinearRegionSet {
    pub fn target_count(&self, bin: usize) -> u64 {
        self.target_counts[bin]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_dim_three_bins() -> RectilinearRegionSet {
        // bins: [-inf,0), [0,1), [1,inf)
        RectilinearRegionSet::new(
            vec![vec![f64::NEG_INFINITY, 0.0, 1.0, f64::INFINITY]],
            vec![4, 4, 4],
            vec![None, None, None],
        )
    }

    #[test]
    fn bin_index_picks_correct_bin() {
        let rs = one_dim_three_bins();
        assert_eq!(rs.bin_index(&[-5.0]), 0);
        assert_eq!(rs.bin_index(&[0.5]), 1);
        assert_eq!(rs.bin_index(&[50.0]), 2);
    }

    #[test]
    fn map_to_bins_is_pure() {
        let rs = one_dim_three_bins();
        let pts = vec![vec![-1.0], vec![0.2], vec![3.0]];
        let first = rs.map_to_bins(&pts);
        let second = rs.map_to_bins(&pts);
        assert_eq!(first, second);
    }

    #[test]
    fn identity_hash_changes_with_partition() {
        let rs_a = one_dim_three_bins();
        let rs_b = RectilinearRegionSet::new(
            vec![vec![f64::NEG_INFINITY, 0.0, f64::INFINITY]],
            vec![4, 4],
            vec![None, None],
        );
        assert_ne!(rs_a.identity_hash(), rs_b.identity_hash());

        let rs_c = one_dim_three_bins();
        assert_eq!(rs_a.identity_hash(), rs_c.identity_hash());
    }

    #[test]
    fn stats_accumulate_and_reset() {
        let mut rs = one_dim_three_bins();
        rs.add(1, 0.25);
        rs.add(1, 0.25);
        assert_eq!(rs.stats()[1].count, 2);
        assert!((rs.stats()[1].weight - 0.5).abs() < 1e-12);
        rs.reset_stats();
        assert_eq!(rs.stats()[1].count, 0);
        assert_eq!(rs.stats()[1].weight, 0.0);
    }
}
