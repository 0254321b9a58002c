//! The iteration driver: the one-iteration state machine that advances
//! the ensemble by one step. Transitions `COMMIT_ENDPOINTS`,
//! `COMMIT_ENDPOINT_TYPES`, `COMMIT_NEXT`, and `ADVANCE` are durable --
//! each flushes the store before the next transition is allowed, so a
//! crash at any point resumes deterministically.

use std::collections::BTreeSet;

use crate::data_manager::{DataManager, IterSummary};
use crate::error::{Result, WeError};
use crate::particle::{ParentRef, Particle};
use crate::region_set::RegionSet;
use crate::resampler::run_we;
use crate::resource_tracker::ResourceTracker;
use crate::segment::{EndpointType, SegStatus, Segment};
use crate::system::SystemDriver;
use crate::work_manager::WorkManager;

/// Result of running one iteration.
#[derive(Debug)]
pub enum IterationOutcome {
    /// The iteration completed and the store now points at `next_iter`.
    Advanced { next_iter: u64 },
}

/// The one-iteration state machine. Owns no collaborators across
/// threads -- they are borrowed mutably for the duration of
/// `run_iteration`. Carries no state of its own across iterations: the
/// one thing that used to live here (whether this iteration's
/// `BIN_INITIAL`/`STATS`/`PREPARE` steps still need to run) is a
/// property of the segments loaded for *this* call, not of how many
/// iterations this process has run before, so it is recomputed every
/// call instead of cached on `Driver`.
pub struct Driver;

impl Driver {
    pub fn new() -> Self {
        Driver
    }

    /// Runs iteration `n_iter` to completion, mutating `data_manager`
    /// and `system`'s region set and returning the iteration this
    /// process should run next.
    pub fn run_iteration(
        &mut self,
        n_iter: u64,
        data_manager: &mut dyn DataManager,
        work_manager: &mut dyn WorkManager,
        system: &mut dyn SystemDriver,
        rtracker: &mut ResourceTracker,
    ) -> Result<IterationOutcome> {
        rtracker.begin("iteration");

        // LOAD_SEGMENTS
        let mut segments = data_manager.get_segments(n_iter);
        let weights: Vec<f64> = segments.iter().map(|s| s.weight).collect();
        if weights.iter().any(|&w| !(w > 0.0)) {
            return Err(WeError::invariant("segment loaded with non-positive weight"));
        }
        let norm: f64 = weights.iter().sum();

        // True when every segment of this iteration already reached
        // COMPLETE in a prior process's invocation before a crash --
        // mirrors the source's `len(segs_to_run) == len(segments)`
        // guard, but evaluated fresh for this iteration's segments each
        // call rather than cached across iterations.
        let all_complete_already =
            !segments.is_empty() && segments.iter().all(|s| s.status == SegStatus::Complete);

        if !all_complete_already {
            // BIN_INITIAL
            let region_set = system.region_set_mut();
            region_set.reset_stats();
            let start_points: Vec<Vec<f64>> = segments.iter().map(|s| s.start_pcoord().to_vec()).collect();
            let bin_indices = region_set.map_to_bins(&start_points);
            for (idx, segment) in bin_indices.iter().zip(segments.iter()) {
                region_set.add(*idx, segment.weight);
            }

            // STATS
            let stats = region_set.stats().to_vec();
            let summary = compute_iter_stats(&segments, &stats, norm)?;
            data_manager.write_bin_data(n_iter, system.region_set());
            data_manager.update_iter_summary(n_iter, summary);

            // PREPARE
            work_manager.prepare_iteration(n_iter, &segments);
            system.preprocess_iteration(n_iter, &segments)?;

            // PROPAGATE
            rtracker.begin("propagation");
            work_manager.propagate(&mut segments);
            rtracker.end("propagation");

            // VERIFY happens in-memory, before any commit: a failed
            // propagation must leave the store exactly as it was before
            // this call, so COMMIT_ENDPOINTS only executes once every
            // segment is known to be COMPLETE.
            let failed_seg_ids: Vec<u32> = segments
                .iter()
                .filter(|s| s.status != SegStatus::Complete)
                .filter_map(|s| s.seg_id)
                .collect();
            if !failed_seg_ids.is_empty() {
                return Err(WeError::Propagation { failed_seg_ids });
            }

            // COMMIT_ENDPOINTS
            data_manager.update_segments(n_iter, &segments);
            data_manager.flush_backing();
        }

        // POSTPROCESS
        system.postprocess_iteration(n_iter, &segments)?;
        let endpoint_particles: Vec<Particle> = segments
            .iter()
            .map(|s| {
                let seg_id = s
                    .seg_id
                    .ok_or_else(|| WeError::Load(format!("segment loaded for iteration {n_iter} has no seg_id")))?;
                Ok(Particle::endpoint(seg_id, s.weight, s.end_pcoord().to_vec()))
            })
            .collect::<Result<Vec<_>>>()?;

        // RESAMPLE
        rtracker.begin("we_core");
        let initial_pcoords: Vec<Vec<f64>> = system.initial_states().iter().map(|i| i.pcoord.clone()).collect();
        let resample_result = run_we(endpoint_particles, system.region_set(), &initial_pcoords)?;
        rtracker.end("we_core");

        let n_segments = segments.len() as u32;
        verify_termination_coverage(n_segments, &resample_result.recycle_terminations, &resample_result.merge_terminations, &resample_result.next_particles)?;

        data_manager.write_recycling_data(n_iter, &resample_result.recycle_from);
        let mut summary = data_manager.get_iter_summary(n_iter);
        summary.target_flux = resample_result.recycle_to.iter().map(|r| r.weight).sum();
        summary.target_hits = resample_result.recycle_to.iter().map(|r| r.count).sum();
        data_manager.update_iter_summary(n_iter, summary);

        // ASSIGN_ENDPOINT_TYPES
        for segment in segments.iter_mut() {
            segment.endpoint_type = Some(EndpointType::Continues);
        }
        for &seg_id in &resample_result.recycle_terminations {
            set_endpoint_type(&mut segments, seg_id, EndpointType::Recycled)?;
        }
        for &seg_id in &resample_result.merge_terminations {
            set_endpoint_type(&mut segments, seg_id, EndpointType::Merged)?;
        }

        // COMMIT_ENDPOINT_TYPES
        data_manager.update_segments(n_iter, &segments);
        data_manager.flush_backing();
        work_manager.finalize_iteration(n_iter, &segments);

        // MATERIALIZE_NEXT
        rtracker.begin("prep_next_iter");
        let pcoord_len = system.pcoord_len();
        let mut new_segments = Vec::with_capacity(resample_result.next_particles.len());
        for particle in resample_result.next_particles {
            new_segments.push(materialize_segment(particle, pcoord_len)?);
        }

        // COMMIT_NEXT
        data_manager.prepare_iteration(n_iter + 1, new_segments, system.pcoord_ndim(), pcoord_len);
        rtracker.end("prep_next_iter");

        // ADVANCE
        data_manager.set_current_iteration(n_iter + 1);
        data_manager.flush_backing();

        rtracker.end("iteration");
        Ok(IterationOutcome::Advanced { next_iter: n_iter + 1 })
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

fn set_endpoint_type(segments: &mut [Segment], seg_id: u32, kind: EndpointType) -> Result<()> {
    let segment = segments
        .iter_mut()
        .find(|s| s.seg_id == Some(seg_id))
        .ok_or_else(|| WeError::invariant(format!("termination set names unknown seg_id {seg_id}")))?;
    segment.endpoint_type = Some(kind);
    Ok(())
}

/// Checks that `recycle_terminations`, `merge_terminations`, and the
/// ancestors appearing in `next_particles` are pairwise disjoint and
/// together cover every seg_id of iteration n.
fn verify_termination_coverage(
    n_segments: u32,
    recycle_terminations: &BTreeSet<u32>,
    merge_terminations: &BTreeSet<u32>,
    next_particles: &[Particle],
) -> Result<()> {
    let mut ancestors: BTreeSet<u32> = BTreeSet::new();
    for particle in next_particles {
        if let Some(ParentRef::Segment(id)) = particle.p_parent_id {
            ancestors.insert(id);
        }
        for parent in &particle.parent_ids {
            if let ParentRef::Segment(id) = parent {
                ancestors.insert(*id);
            }
        }
    }

    for seg_id in 0..n_segments {
        let in_recycle = recycle_terminations.contains(&seg_id);
        let in_merge = merge_terminations.contains(&seg_id);
        let in_ancestors = ancestors.contains(&seg_id);
        let coverage = [in_recycle, in_merge, in_ancestors].iter().filter(|b| **b).count();
        if coverage != 1 {
            return Err(WeError::invariant(format!(
                "seg_id {seg_id} covered by {coverage} termination categories (expected exactly 1)"
            )));
        }
    }
    Ok(())
}

fn materialize_segment(particle: Particle, pcoord_len: usize) -> Result<Segment> {
    let (p_parent_id, parent_ids) = match particle.p_parent_id {
        None => {
            if !particle.parent_ids.is_empty() {
                return Err(WeError::invariant(
                    "particle with no p_parent_id carries non-empty parent_ids",
                ));
            }
            let seg_id = particle.seg_id.ok_or_else(|| {
                WeError::invariant("particle with no p_parent_id and no seg_id")
            })?;
            let reference = if particle.from_recycle {
                ParentRef::Recycled(seg_id)
            } else {
                ParentRef::Segment(seg_id)
            };
            (reference, BTreeSet::from([reference]))
        }
        Some(p_parent_id) => {
            if particle.parent_ids.is_empty() {
                return Err(WeError::invariant(
                    "split/merged particle carries empty parent_ids",
                ));
            }
            if particle.seg_id.is_some() {
                return Err(WeError::invariant(
                    "split/merged particle unexpectedly carries a seg_id",
                ));
            }
            (p_parent_id, particle.parent_ids)
        }
    };

    Segment::new_prepared(particle.weight, particle.pcoord, pcoord_len, p_parent_id, parent_ids)
}

fn compute_iter_stats(
    segments: &[Segment],
    bin_stats: &[crate::region_set::BinStats],
    norm: f64,
) -> Result<IterSummary> {
    let seg_weights: Vec<f64> = segments.iter().map(|s| s.weight).collect();
    let (min_seg, max_seg) = min_max_nonzero(&seg_weights);

    let bin_weights: Vec<f64> = bin_stats.iter().filter(|b| b.target_count != 0).map(|b| b.weight).collect();
    let (min_bin, max_bin) = min_max_nonzero(&bin_weights);

    Ok(IterSummary {
        n_particles: segments.len(),
        norm,
        target_flux: 0.0,
        target_hits: 0,
        min_bin_prob: min_bin,
        max_bin_prob: max_bin,
        bin_dyn_range: (max_bin / min_bin).ln(),
        min_seg_prob: min_seg,
        max_seg_prob: max_seg,
        seg_dyn_range: (max_seg / min_seg).ln(),
        walltime: 0.0,
        cputime: 0.0,
    })
}

/// Min/max over non-zero values; empty (or all-zero) input yields NaN
/// sentinels rather than an error -- the iteration is vacuous, not
/// erroneous.
fn min_max_nonzero(values: &[f64]) -> (f64, f64) {
    let nonzero: Vec<f64> = values.iter().copied().filter(|&w| w != 0.0).collect();
    if nonzero.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let min = nonzero.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::data_manager::MemoryDataManager;
    use crate::region_set::RectilinearRegionSet;
    use crate::system::{InitialState, Propagator, ToyLinearSystem, ToyPropagator};
    use crate::work_manager::{SerialWorkManager, WorkManager};

    const PCOORD_LEN: usize = 3;

    fn demo_system() -> ToyLinearSystem {
        // One bin, target occupancy 4, no sinks -- isolates split/merge
        // behavior from recycling.
        let region_set =
            RectilinearRegionSet::new(vec![vec![f64::NEG_INFINITY, f64::INFINITY]], vec![4], vec![None]);
        let initial_states = vec![InitialState { label: "start".to_string(), pcoord: vec![0.0] }];
        ToyLinearSystem::new(region_set, Vec::new(), initial_states, PCOORD_LEN)
    }

    fn seed_at(weight: f64) -> Segment {
        Segment {
            seg_id: None,
            weight,
            status: SegStatus::Prepared,
            pcoord: vec![vec![0.0], vec![], vec![]],
            parent_ids: BTreeSet::new(),
            p_parent_id: None,
            n_parents: 0,
            endpoint_type: None,
            cputime: 0.0,
            walltime: 0.0,
        }
    }

    fn fresh_run() -> (MemoryDataManager, ToyLinearSystem, SerialWorkManager<ToyPropagator>) {
        let mut dm = MemoryDataManager::new(0, Vec::new(), 1, PCOORD_LEN);
        dm.prepare_iteration(0, vec![seed_at(0.3), seed_at(0.7)], 1, PCOORD_LEN);
        let system = demo_system();
        let wm = SerialWorkManager::new(ToyPropagator { drift: 0.0, jitter_sd: 0.01 });
        (dm, system, wm)
    }

    #[test]
    fn three_iterations_hold_target_count_and_lineage() {
        let (mut dm, mut system, mut wm) = fresh_run();
        let mut driver = Driver::new();
        let mut rtracker = ResourceTracker::new();

        let mut n_iter = 0;
        for _ in 0..3 {
            let IterationOutcome::Advanced { next_iter } =
                driver.run_iteration(n_iter, &mut dm, &mut wm, &mut system, &mut rtracker).unwrap();
            n_iter = next_iter;

            let segments = dm.get_segments(n_iter);
            assert_eq!(segments.len(), 4);
            let total: f64 = segments.iter().map(|s| s.weight).sum();
            assert!((total - 1.0).abs() < 1e-9);
            for segment in &segments {
                assert!(!segment.parent_ids.is_empty());
                for parent in &segment.parent_ids {
                    assert!(
                        matches!(parent, ParentRef::Segment(_)),
                        "unexpected lineage reference {parent:?} with no recycling configured"
                    );
                }
            }
        }
    }

    /// A propagator that always fails the segment named `fails_seg_id`,
    /// used to exercise the VERIFY-before-commit path.
    struct FailingPropagator {
        fails_seg_id: u32,
    }

    impl Propagator for FailingPropagator {
        fn propagate_one(&self, segment: &mut Segment) {
            if segment.seg_id == Some(self.fails_seg_id) {
                segment.status = SegStatus::Failed;
            } else {
                segment.status = SegStatus::Complete;
            }
        }
    }

    #[test]
    fn failed_propagation_leaves_the_store_unchanged() {
        let (mut dm, mut system, _) = fresh_run();
        let mut wm = SerialWorkManager::new(FailingPropagator { fails_seg_id: 0 });
        let mut driver = Driver::new();
        let mut rtracker = ResourceTracker::new();

        let err = driver.run_iteration(0, &mut dm, &mut wm, &mut system, &mut rtracker).unwrap_err();
        match err {
            WeError::Propagation { failed_seg_ids } => assert_eq!(failed_seg_ids, vec![0]),
            other => panic!("expected Propagation error, got {other:?}"),
        }

        assert_eq!(dm.current_iteration(), 0);
        let segments = dm.get_segments(0);
        assert!(segments.iter().all(|s| s.status == SegStatus::Prepared));
    }

    #[test]
    fn resume_after_simulated_crash_matches_an_uninterrupted_run() {
        let (mut dm_a, mut system_a, mut wm_a) = fresh_run();
        let mut single_driver = Driver::new();
        let mut rtracker = ResourceTracker::new();
        let mut n_iter = 0;
        for _ in 0..3 {
            let IterationOutcome::Advanced { next_iter } = single_driver
                .run_iteration(n_iter, &mut dm_a, &mut wm_a, &mut system_a, &mut rtracker)
                .unwrap();
            n_iter = next_iter;
        }
        let uninterrupted = dm_a.get_segments(3);

        let (mut dm_b, mut system_b, mut wm_b) = fresh_run();
        let mut rtracker_b = ResourceTracker::new();
        let mut crash_driver = Driver::new();
        let mut n_iter_b = 0;
        for _ in 0..2 {
            let IterationOutcome::Advanced { next_iter } = crash_driver
                .run_iteration(n_iter_b, &mut dm_b, &mut wm_b, &mut system_b, &mut rtracker_b)
                .unwrap();
            n_iter_b = next_iter;
        }
        // Simulate a process restart: a brand-new `Driver` against the
        // same store, resuming at the iteration the store says is current.
        drop(crash_driver);
        assert_eq!(dm_b.current_iteration(), n_iter_b);
        let mut resumed_driver = Driver::new();
        let IterationOutcome::Advanced { next_iter } = resumed_driver
            .run_iteration(n_iter_b, &mut dm_b, &mut wm_b, &mut system_b, &mut rtracker_b)
            .unwrap();
        let resumed = dm_b.get_segments(next_iter);

        assert_eq!(uninterrupted.len(), resumed.len());
        let mut weights_a: Vec<f64> = uninterrupted.iter().map(|s| s.weight).collect();
        let mut weights_b: Vec<f64> = resumed.iter().map(|s| s.weight).collect();
        weights_a.sort_by(|a, b| a.partial_cmp(b).unwrap());
        weights_b.sort_by(|a, b| a.partial_cmp(b).unwrap());
        for (a, b) in weights_a.iter().zip(weights_b.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
        let mut lineage_a: Vec<BTreeSet<ParentRef>> =
            uninterrupted.iter().map(|s| s.parent_ids.clone()).collect();
        let mut lineage_b: Vec<BTreeSet<ParentRef>> = resumed.iter().map(|s| s.parent_ids.clone()).collect();
        lineage_a.sort_by_key(|set| set.iter().map(|p| p.seg_id()).min());
        lineage_b.sort_by_key(|set| set.iter().map(|p| p.seg_id()).min());
        assert_eq!(lineage_a, lineage_b);
    }
}
