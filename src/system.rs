//! The system driver contract: the seam where the physical system, its
//! progress coordinate, and its binning scheme are injected. The core
//! never defines any of these.
//!
//! `ToyLinearSystem`/`ToyPropagator` are a deterministic stand-in for
//! "an external physical simulator" -- enough to drive the integration
//! tests and the `wed` example binary, never a physical model.

use rand::distributions::Distribution;
use rand::SeedableRng;
use statrs::distribution::Normal;

use crate::error::{Result, WeError};
use crate::region_set::RegionSet;
use crate::segment::Segment;

/// A named initial state particles are recycled to.
#[derive(Debug, Clone)]
pub struct InitialState {
    pub label: String,
    pub pcoord: Vec<f64>,
}

/// A named target (sink) state.
#[derive(Debug, Clone)]
pub struct TargetState {
    pub label: String,
    pub initial_state: usize,
}

/// The system driver contract: the bin partition, the per-iteration
/// pre/post hooks, and the target/initial state tables.
pub trait SystemDriver {
    fn region_set(&self) -> &dyn RegionSet;
    fn region_set_mut(&mut self) -> &mut dyn RegionSet;

    fn target_states(&self) -> &[TargetState];
    fn initial_states(&self) -> &[InitialState];

    fn pcoord_ndim(&self) -> usize;
    fn pcoord_len(&self) -> usize;

    /// Called once per iteration, before propagation.
    fn preprocess_iteration(&self, n_iter: u64, segments: &[Segment]) -> Result<()>;
    /// Called once per iteration, after propagation, before resampling.
    fn postprocess_iteration(&self, n_iter: u64, segments: &[Segment]) -> Result<()>;

    /// Checks that every recycling target names an initial state that
    /// actually exists: both the `target_states()` table and the bin
    /// partition's own sink mapping (`RegionSet::sink_initial_state`) are
    /// checked, since either can carry a bad index. Called once, before
    /// the run loop starts -- `Config` has no access to these tables
    /// (they come from the system driver, not the configuration file),
    /// so this is the earliest point a real check is possible.
    fn validate(&self) -> Result<()> {
        let n_initial = self.initial_states().len();
        for target in self.target_states() {
            if target.initial_state >= n_initial {
                return Err(WeError::Config(format!(
                    "target '{}' names out-of-range initial state {} (have {n_initial})",
                    target.label, target.initial_state
                )));
            }
        }
        for bin in 0..self.region_set().n_bins() {
            if let Some(initial_state) = self.region_set().sink_initial_state(bin) {
                if initial_state >= n_initial {
                    return Err(WeError::Config(format!(
                        "bin {bin} recycles to out-of-range initial state {initial_state} (have {n_initial})"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The propagator contract: advances every `Prepared` segment to
/// `Complete` (or `Failed`), filling in `pcoord[1..L-1]`, `cputime`, and
/// `walltime`. This is the "external executable" seam -- concrete
/// wiring to a real simulator is out of scope.
pub trait Propagator: Send + Sync {
    fn propagate_one(&self, segment: &mut Segment);
}

/// A deterministic 1-D drift-plus-jitter propagator: each step advances
/// the pcoord by a fixed drift and a small Gaussian jitter drawn from a
/// per-segment seeded RNG (seeded from `seg_id`, so re-propagating the
/// same segment is reproducible even though the run as a whole is not
/// serialized to a single RNG stream).
pub struct ToyPropagator {
    pub drift: f64,
    pub jitter_sd: f64,
}

impl Propagator for ToyPropagator {
    fn propagate_one(&self, segment: &mut Segment) {
        let seed = segment.seg_id.unwrap_or(0) as u64;
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let jitter = Normal::new(0.0, self.jitter_sd.max(f64::MIN_POSITIVE))
            .expect("jitter_sd must be finite and non-negative");
        let len = segment.pcoord.len();
        for i in 1..len {
            let prev = segment.pcoord[i - 1].clone();
            let next: Vec<f64> = prev
                .iter()
                .map(|&x| x + self.drift + jitter.sample(&mut rng))
                .collect();
            segment.pcoord[i] = next;
        }
        segment.status = crate::segment::SegStatus::Complete;
        segment.walltime = 0.0;
        segment.cputime = 0.0;
    }
}

use crate::region_set::RectilinearRegionSet;

/// A one-dimensional toy system: a single progress coordinate, bins from
/// a `RectilinearRegionSet`, and a drift-plus-jitter propagator.
pub struct ToyLinearSystem {
    region_set: RectilinearRegionSet,
    target_states: Vec<TargetState>,
    initial_states: Vec<InitialState>,
    pcoord_len: usize,
}

impl ToyLinearSystem {
    pub fn new(
        region_set: RectilinearRegionSet,
        target_states: Vec<TargetState>,
        initial_states: Vec<InitialState>,
        pcoord_len: usize,
    ) -> Self {
        ToyLinearSystem { region_set, target_states, initial_states, pcoord_len }
    }
}

impl SystemDriver for ToyLinearSystem {
    fn region_set(&self) -> &dyn RegionSet {
        &self.region_set
    }

    fn region_set_mut(&mut self) -> &mut dyn RegionSet {
        &mut self.region_set
    }

    fn target_states(&self) -> &[TargetState] {
        &self.target_states
    }

    fn initial_states(&self) -> &[InitialState] {
        &self.initial_states
    }

    fn pcoord_ndim(&self) -> usize {
        1
    }

    fn pcoord_len(&self) -> usize {
        self.pcoord_len
    }

    fn preprocess_iteration(&self, _n_iter: u64, _segments: &[Segment]) -> Result<()> {
        Ok(())
    }

    fn postprocess_iteration(&self, _n_iter: u64, _segments: &[Segment]) -> Result<()> {
        Ok(())
    }
}
