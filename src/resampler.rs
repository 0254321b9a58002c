//! The weighted-ensemble resampler: split, merge, and recycle over a
//! bin-partitioned particle set, preserving total weight.

use std::collections::BTreeSet;

use ordered_float::OrderedFloat;

use crate::error::{Result, WeError};
use crate::particle::{ParentRef, Particle};
use crate::region_set::RegionSet;

/// Per-region aggregated recycling counts/probabilities
/// (`recycle_from`/`recycle_to`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecycleStats {
    pub count: u64,
    pub weight: f64,
}

/// Output of one call to [`run_we`].
#[derive(Debug)]
pub struct ResampleResult {
    pub next_particles: Vec<Particle>,
    pub recycle_terminations: BTreeSet<u32>,
    pub merge_terminations: BTreeSet<u32>,
    /// Indexed by target (sink) bin.
    pub recycle_from: Vec<RecycleStats>,
    /// Indexed by initial state.
    pub recycle_to: Vec<RecycleStats>,
    pub recycled_particles: Vec<Particle>,
}

const WEIGHT_TOLERANCE: f64 = 1e-12;

/// Runs the three-phase weighted-ensemble resampling algorithm over
/// `endpoint_particles` (one per segment of iteration n).
///
/// `initial_states` is indexed by initial-state index and gives the
/// pcoord a recycled particle is re-injected at: a recycling source
/// must name an initial state, so the mapping is deterministic by
/// index, not weighted.
pub fn run_we(
    endpoint_particles: Vec<Particle>,
    region_set: &dyn RegionSet,
    initial_states: &[Vec<f64>],
) -> Result<ResampleResult> {
    let total_in: f64 = endpoint_particles.iter().map(|p| p.weight).sum();

    let n_bins = region_set.n_bins();
    let mut bins: Vec<Vec<Particle>> = (0..n_bins).map(|_| Vec::new()).collect();
    let mut recycle_terminations: BTreeSet<u32> = BTreeSet::new();
    let mut merge_terminations: BTreeSet<u32> = BTreeSet::new();
    let mut recycle_from = vec![RecycleStats::default(); n_bins];
    let mut recycle_to = vec![RecycleStats::default(); initial_states.len()];
    let mut recycled_particles: Vec<Particle> = Vec::new();

    // Phase 1: Recycle.
    for particle in endpoint_particles {
        let bin_idx = region_set.bin_index(&particle.pcoord);
        match region_set.sink_initial_state(bin_idx) {
            Some(initial_state) => {
                let seg_id = particle.seg_id.ok_or_else(|| {
                    WeError::invariant("endpoint particle missing seg_id at recycle phase")
                })?;
                if initial_state >= initial_states.len() {
                    return Err(WeError::invariant(format!(
                        "recycling source at bin {bin_idx} names out-of-range initial state {initial_state}"
                    )));
                }

                recycle_from[bin_idx].count += 1;
                recycle_from[bin_idx].weight += particle.weight;
                recycle_terminations.insert(seg_id);
                recycle_to[initial_state].count += 1;
                recycle_to[initial_state].weight += particle.weight;

                let reinjected = Particle {
                    seg_id: Some(seg_id),
                    weight: particle.weight,
                    pcoord: initial_states[initial_state].clone(),
                    p_parent_id: None,
                    parent_ids: BTreeSet::new(),
                    from_recycle: true,
                };
                recycled_particles.push(reinjected.clone());

                let home_bin = region_set.bin_index(&reinjected.pcoord);
                bins[home_bin].push(reinjected);
            }
            None => bins[bin_idx].push(particle),
        }
    }

    // Phase 2: bin-local split/merge.
    for (bin_idx, bin) in bins.iter_mut().enumerate() {
        if region_set.sink_initial_state(bin_idx).is_some() {
            // Sinks are never targets of split/merge; recycled arrivals
            // were already placed in their *destination* bin above,
            // which by construction (an initial state is never itself a
            // sink) falls through to the `None` arm next time round.
            continue;
        }
        let target = region_set.stats()[bin_idx].target_count;
        if target == 0 || bin.is_empty() {
            continue;
        }
        resample_bin(bin, target as usize, &mut merge_terminations)?;
    }

    let mut next_particles: Vec<Particle> = Vec::new();
    for bin in bins {
        next_particles.extend(bin);
    }

    let total_out: f64 = next_particles.iter().map(|p| p.weight).sum();
    if (total_out - total_in).abs() > WEIGHT_TOLERANCE * total_in.max(1.0) {
        return Err(WeError::invariant(format!(
            "weight conservation violated: in={total_in}, out={total_out}"
        )));
    }
    if !recycle_terminations.is_disjoint(&merge_terminations) {
        return Err(WeError::invariant(
            "recycle_terminations and merge_terminations overlap",
        ));
    }

    Ok(ResampleResult {
        next_particles,
        recycle_terminations,
        merge_terminations,
        recycle_from,
        recycle_to,
        recycled_particles,
    })
}

/// Splits or merges the particles of one bin down to exactly `target`
/// particles. `merge_terminations` accumulates the seg_ids of
/// iteration n consumed (not surviving as primary) by a merge.
fn resample_bin(bin: &mut Vec<Particle>, target: usize, merge_terminations: &mut BTreeSet<u32>) -> Result<()> {
    while bin.len() < target {
        let current = bin.len();
        let n_copies = div_ceil(target, current);
        let pick = argmax_weight(bin)?;
        let original = bin.remove(pick);
        let ref_ = original.identity_ref()?;
        let copies = split_particle(&original, n_copies, ref_);
        bin.extend(copies);
    }

    while bin.len() > target {
        let (i_lo, i_hi) = two_lowest_weight_indices(bin)?;
        // Remove the higher index first so the lower index stays valid.
        let (lo_idx, hi_idx) = if i_lo < i_hi { (i_lo, i_hi) } else { (i_hi, i_lo) };
        let second = bin.remove(hi_idx);
        let first = bin.remove(lo_idx);
        let survivor = merge_particles(first, second, merge_terminations)?;
        bin.push(survivor);
    }
    Ok(())
}

fn div_ceil(target: usize, current: usize) -> usize {
    (target + current - 1) / current
}

/// Identity-reference seg_ids for every particle in `bin`, in order;
/// computed once so the sort/max comparators below never need to fail.
fn tie_break_keys(bin: &[Particle]) -> Result<Vec<u32>> {
    bin.iter().map(|p| p.identity_ref().map(|r| r.seg_id())).collect()
}

/// Index of the highest-weight particle; ties broken by lower `seg_id`
/// (or, for particles with no direct seg_id, by their identity
/// reference's seg_id).
fn argmax_weight(bin: &[Particle]) -> Result<usize> {
    let keys = tie_break_keys(bin)?;
    bin.iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            OrderedFloat(a.weight)
                .cmp(&OrderedFloat(b.weight))
                .then_with(|| keys[*ib].cmp(&keys[*ia]))
        })
        .map(|(idx, _)| idx)
        .ok_or_else(|| WeError::invariant("argmax_weight called on empty bin"))
}

/// Indices of the two lowest-weight particles, ties broken by lower
/// `seg_id` first.
fn two_lowest_weight_indices(bin: &[Particle]) -> Result<(usize, usize)> {
    let keys = tie_break_keys(bin)?;
    let mut order: Vec<usize> = (0..bin.len()).collect();
    order.sort_by(|&a, &b| {
        OrderedFloat(bin[a].weight)
            .cmp(&OrderedFloat(bin[b].weight))
            .then_with(|| keys[a].cmp(&keys[b]))
    });
    Ok((order[0], order[1]))
}

fn split_particle(original: &Particle, n_copies: usize, ref_: ParentRef) -> Vec<Particle> {
    let share = original.weight / n_copies as f64;
    let mut copies = Vec::with_capacity(n_copies);
    let mut running = 0.0;
    for i in 0..n_copies {
        let weight = if i + 1 == n_copies {
            original.weight - running
        } else {
            running += share;
            share
        };
        copies.push(Particle {
            seg_id: None,
            weight,
            pcoord: original.pcoord.clone(),
            p_parent_id: Some(ref_),
            parent_ids: BTreeSet::from([ref_]),
            from_recycle: false,
        });
    }
    copies
}

fn merge_particles(
    first: Particle,
    second: Particle,
    merge_terminations: &mut BTreeSet<u32>,
) -> Result<Particle> {
    let first_key = first.identity_ref()?.seg_id();
    let second_key = second.identity_ref()?.seg_id();
    let (heavier, lighter) = if first.weight > second.weight
        || (first.weight == second.weight && first_key <= second_key)
    {
        (first, second)
    } else {
        (second, first)
    };

    let heavy_ref = heavier.identity_ref()?;
    let light_ref = lighter.identity_ref()?;

    let mut parent_ids: BTreeSet<ParentRef> = if heavier.parent_ids.is_empty() {
        BTreeSet::from([heavy_ref])
    } else {
        heavier.parent_ids.clone()
    };
    let light_parents: BTreeSet<ParentRef> = if lighter.parent_ids.is_empty() {
        BTreeSet::from([light_ref])
    } else {
        lighter.parent_ids.clone()
    };
    parent_ids.extend(light_parents.iter().copied());

    for p in &parent_ids {
        if *p != heavy_ref {
            if let ParentRef::Segment(id) = p {
                merge_terminations.insert(*id);
            }
        }
    }

    Ok(Particle {
        seg_id: None,
        weight: heavier.weight + lighter.weight,
        pcoord: heavier.pcoord,
        p_parent_id: Some(heavy_ref),
        parent_ids,
        from_recycle: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region_set::RectilinearRegionSet;

    fn single_bin(target: u64) -> RectilinearRegionSet {
        RectilinearRegionSet::new(
            vec![vec![f64::NEG_INFINITY, f64::INFINITY]],
            vec![target],
            vec![None],
        )
    }

    #[test]
    fn split_conserves_weight_and_sets_lineage() {
        let rs = single_bin(3);
        let particles = vec![Particle::endpoint(0, 1.0, vec![0.0])];
        let result = run_we(particles, &rs, &[]).unwrap();

        assert_eq!(result.next_particles.len(), 3);
        let total: f64 = result.next_particles.iter().map(|p| p.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
        for p in &result.next_particles {
            assert_eq!(p.parent_ids, BTreeSet::from([ParentRef::Segment(0)]));
        }
        assert!(result.merge_terminations.is_empty());
        assert!(result.recycle_terminations.is_empty());
    }

    #[test]
    fn merge_conserves_weight_and_unions_parents() {
        let rs = single_bin(1);
        let particles = vec![
            Particle::endpoint(0, 0.25, vec![0.0]),
            Particle::endpoint(1, 0.75, vec![0.0]),
        ];
        let result = run_we(particles, &rs, &[]).unwrap();

        assert_eq!(result.next_particles.len(), 1);
        let survivor = &result.next_particles[0];
        assert!((survivor.weight - 1.0).abs() < 1e-12);
        assert_eq!(survivor.p_parent_id, Some(ParentRef::Segment(1)));
        assert_eq!(
            survivor.parent_ids,
            BTreeSet::from([ParentRef::Segment(0), ParentRef::Segment(1)])
        );
        assert_eq!(result.merge_terminations, BTreeSet::from([0]));
    }

    #[test]
    fn recycle_reinjects_at_initial_state() {
        let rs = RectilinearRegionSet::new(
            vec![vec![f64::NEG_INFINITY, 0.5, f64::INFINITY]],
            vec![4, 0],
            vec![None, Some(0)],
        );
        let initial_states = vec![vec![-10.0]];
        let particles = vec![
            Particle::endpoint(0, 0.4, vec![0.2]),
            Particle::endpoint(1, 0.6, vec![0.9]),
        ];
        let result = run_we(particles, &rs, &initial_states).unwrap();

        assert_eq!(result.recycle_terminations, BTreeSet::from([1]));
        assert_eq!(result.recycle_from[1].count, 1);
        assert!((result.recycle_from[1].weight - 0.6).abs() < 1e-12);

        let total: f64 = result.next_particles.iter().map(|p| p.weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }
}
