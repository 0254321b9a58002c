//! The work manager adapter: the abstract capability set the driver
//! requires to dispatch propagation. Concurrency and partial-failure
//! policy inside `propagate` are the work manager's problem; the driver
//! only inspects final segment status afterward.

use rayon::prelude::*;

use crate::segment::Segment;
use crate::system::Propagator;

/// The work manager's capability set.
pub trait WorkManager {
    /// One-time bring-up; may block.
    fn prepare_workers(&mut self) {}

    /// If false, the caller should delegate everything to the work
    /// manager and return -- this process is a worker, not the server.
    /// Both concrete implementations here are always the server.
    fn is_server(&self) -> bool {
        true
    }

    fn prepare_iteration(&mut self, _n_iter: u64, _segments: &[Segment]) {}

    /// Blocks until every `Prepared` segment in `segments` has
    /// transitioned to `Complete` or `Failed`.
    fn propagate(&self, segments: &mut [Segment]);

    fn finalize_iteration(&mut self, _n_iter: u64, _segments: &[Segment]) {}

    fn shutdown(&mut self, _code: i32) {}
}

/// Propagates segments one at a time on the calling thread. Grounded in
/// `original_source/sim_manager.py`'s `wemd.work_managers.serial`.
pub struct SerialWorkManager<P: Propagator> {
    propagator: P,
}

impl<P: Propagator> SerialWorkManager<P> {
    pub fn new(propagator: P) -> Self {
        SerialWorkManager { propagator }
    }
}

impl<P: Propagator> WorkManager for SerialWorkManager<P> {
    fn propagate(&self, segments: &mut [Segment]) {
        for segment in segments.iter_mut() {
            if segment.status == crate::segment::SegStatus::Prepared {
                segment.status = crate::segment::SegStatus::Running;
                self.propagator.propagate_one(segment);
            }
        }
    }
}

/// Propagates the batch of `Prepared` segments across a rayon thread
/// pool, using `rayon` for data parallelism, matching
/// `wemd.work_managers.threads`.
pub struct ThreadedWorkManager<P: Propagator> {
    propagator: P,
    pool: rayon::ThreadPool,
}

impl<P: Propagator> ThreadedWorkManager<P> {
    pub fn new(propagator: P, n_threads: usize) -> Self {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .expect("failed to build propagation thread pool");
        ThreadedWorkManager { propagator, pool }
    }
}

impl<P: Propagator> WorkManager for ThreadedWorkManager<P> {
    fn propagate(&self, segments: &mut [Segment]) {
        let propagator = &self.propagator;
        self.pool.install(|| {
            segments.par_iter_mut().for_each(|segment| {
                if segment.status == crate::segment::SegStatus::Prepared {
                    segment.status = crate::segment::SegStatus::Running;
                    propagator.propagate_one(segment);
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegStatus;
    use crate::system::ToyPropagator;
    use std::collections::BTreeSet;

    fn prepared_segment(seg_id: u32) -> Segment {
        Segment {
            seg_id: Some(seg_id),
            weight: 1.0,
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
    fn serial_propagates_all_prepared_segments() {
        let wm = SerialWorkManager::new(ToyPropagator { drift: 0.1, jitter_sd: 0.01 });
        let mut segments = vec![prepared_segment(0), prepared_segment(1)];
        wm.propagate(&mut segments);
        assert!(segments.iter().all(|s| s.status == SegStatus::Complete));
    }

    #[test]
    fn threaded_propagates_all_prepared_segments() {
        let wm = ThreadedWorkManager::new(ToyPropagator { drift: 0.1, jitter_sd: 0.01 }, 2);
        let mut segments: Vec<Segment> = (0..8).map(prepared_segment).collect();
        wm.propagate(&mut segments);
        assert!(segments.iter().all(|s| s.status == SegStatus::Complete));
    }
}
