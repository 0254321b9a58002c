//! The persistent-store contract and an in-memory implementation of it,
//! sufficient to exercise the driver's crash-resume semantics in tests.
//! A production deployment replaces `MemoryDataManager` with an
//! HDF5-backed one without the driver changing at all; persistent
//! storage is explicitly out of scope for the core's design.

use crate::region_set::RegionSet;
use crate::resampler::RecycleStats;
use crate::segment::Segment;

/// Per-iteration record.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IterSummary {
    pub n_particles: usize,
    pub norm: f64,
    pub target_flux: f64,
    pub target_hits: u64,
    pub min_bin_prob: f64,
    pub max_bin_prob: f64,
    pub bin_dyn_range: f64,
    pub min_seg_prob: f64,
    pub max_seg_prob: f64,
    pub seg_dyn_range: f64,
    pub walltime: f64,
    pub cputime: f64,
}

/// The persistent store contract.
pub trait DataManager {
    fn current_iteration(&self) -> u64;
    fn set_current_iteration(&mut self, n_iter: u64);

    /// Ordered so indexing by `seg_id` yields that segment.
    fn get_segments(&self, n_iter: u64) -> Vec<Segment>;
    fn update_segments(&mut self, n_iter: u64, segments: &[Segment]);

    fn get_iter_summary(&self, n_iter: u64) -> IterSummary;
    fn update_iter_summary(&mut self, n_iter: u64, summary: IterSummary);

    fn write_bin_data(&mut self, n_iter: u64, region_set: &dyn RegionSet);
    fn write_recycling_data(&mut self, n_iter: u64, recycle_from: &[RecycleStats]);

    /// Registers `new_segments` (with seg_ids assigned densely, 0-based)
    /// as iteration `n_iter`'s segments.
    fn prepare_iteration(
        &mut self,
        n_iter: u64,
        new_segments: Vec<Segment>,
        pcoord_ndim: usize,
        pcoord_len: usize,
    );

    /// Durability barrier; the in-memory store has none beyond its
    /// existing writes, but the call is still threaded through every
    /// commit point so that swapping in a durable store changes no
    /// call ordering.
    fn flush_backing(&mut self) {}
}

#[derive(Debug, Clone)]
struct IterationRecord {
    segments: Vec<Segment>,
    summary: IterSummary,
    bin_counts: Vec<u64>,
    bin_probs: Vec<f64>,
    recycle_from: Vec<RecycleStats>,
    pcoord_ndim: usize,
    pcoord_len: usize,
}

/// An in-process store behind the `DataManager` trait.
#[derive(Debug, Default)]
pub struct MemoryDataManager {
    current_iteration: u64,
    iterations: std::collections::BTreeMap<u64, IterationRecord>,
}

impl MemoryDataManager {
    pub fn new(n_iter: u64, initial_segments: Vec<Segment>, pcoord_ndim: usize, pcoord_len: usize) -> Self {
        let mut iterations = std::collections::BTreeMap::new();
        iterations.insert(
            n_iter,
            IterationRecord {
                segments: initial_segments,
                summary: IterSummary::default(),
                bin_counts: Vec::new(),
                bin_probs: Vec::new(),
                recycle_from: Vec::new(),
                pcoord_ndim,
                pcoord_len,
            },
        );
        MemoryDataManager { current_iteration: n_iter, iterations }
    }

    fn record(&self, n_iter: u64) -> &IterationRecord {
        self.iterations
            .get(&n_iter)
            .unwrap_or_else(|| panic!("no such iteration {n_iter} in store"))
    }

    fn record_mut(&mut self, n_iter: u64) -> &mut IterationRecord {
        self.iterations
            .get_mut(&n_iter)
            .unwrap_or_else(|| panic!("no such iteration {n_iter} in store"))
    }
}

impl DataManager for MemoryDataManager {
    fn current_iteration(&self) -> u64 {
        self.current_iteration
    }

    fn set_current_iteration(&mut self, n_iter: u64) {
        self.current_iteration = n_iter;
    }

    fn get_segments(&self, n_iter: u64) -> Vec<Segment> {
        self.record(n_iter).segments.clone()
    }

    fn update_segments(&mut self, n_iter: u64, segments: &[Segment]) {
        self.record_mut(n_iter).segments = segments.to_vec();
    }

    fn get_iter_summary(&self, n_iter: u64) -> IterSummary {
        self.record(n_iter).summary.clone()
    }

    fn update_iter_summary(&mut self, n_iter: u64, summary: IterSummary) {
        self.record_mut(n_iter).summary = summary;
    }

    fn write_bin_data(&mut self, n_iter: u64, region_set: &dyn RegionSet) {
        let stats = region_set.stats();
        let record = self.record_mut(n_iter);
        record.bin_counts = stats.iter().map(|s| s.count).collect();
        record.bin_probs = stats.iter().map(|s| s.weight).collect();
    }

    fn write_recycling_data(&mut self, n_iter: u64, recycle_from: &[RecycleStats]) {
        self.record_mut(n_iter).recycle_from = recycle_from.to_vec();
    }

    fn prepare_iteration(
        &mut self,
        n_iter: u64,
        mut new_segments: Vec<Segment>,
        pcoord_ndim: usize,
        pcoord_len: usize,
    ) {
        for (i, segment) in new_segments.iter_mut().enumerate() {
            segment.seg_id = Some(i as u32);
        }
        self.iterations.insert(
            n_iter,
            IterationRecord {
                segments: new_segments,
                summary: IterSummary::default(),
                bin_counts: Vec::new(),
                bin_probs: Vec::new(),
                recycle_from: Vec::new(),
                pcoord_ndim,
                pcoord_len,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegStatus;
    use std::collections::BTreeSet;

    fn seed_segment(seg_id: u32) -> Segment {
        Segment {
            seg_id: Some(seg_id),
            weight: 0.5,
            status: SegStatus::Prepared,
            pcoord: vec![vec![0.0], vec![]],
            parent_ids: BTreeSet::new(),
            p_parent_id: None,
            n_parents: 0,
            endpoint_type: None,
            cputime: 0.0,
            walltime: 0.0,
        }
    }

    #[test]
    fn round_trips_segments_and_assigns_dense_ids() {
        let mut dm = MemoryDataManager::new(0, vec![seed_segment(0), seed_segment(1)], 1, 2);
        assert_eq!(dm.current_iteration(), 0);
        let segs = dm.get_segments(0);
        assert_eq!(segs.len(), 2);

        let next = vec![
            Segment { seg_id: None, ..seed_segment(0) },
            Segment { seg_id: None, ..seed_segment(0) },
            Segment { seg_id: None, ..seed_segment(0) },
        ];
        dm.prepare_iteration(1, next, 1, 2);
        let assigned = dm.get_segments(1);
        let ids: Vec<u32> = assigned.iter().map(|s| s.seg_id.unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
