use std::collections::BTreeSet;

use crate::error::{Result, WeError};
use crate::particle::ParentRef;

/// Status of a segment within one iteration's lifecycle: created
/// `Prepared`, mutated by the propagator to `Running` then
/// `Complete`/`Failed`, then sealed (endpoint_type assigned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum SegStatus {
    Prepared,
    Running,
    Complete,
    Failed,
}

/// Assigned after resampling of the iteration this segment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EndpointType {
    Continues,
    Merged,
    Recycled,
}

/// One trajectory step belonging to iteration `n_iter`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Segment {
    /// Dense 0-based index, assigned at materialization; `None` until
    /// the store assigns one.
    pub seg_id: Option<u32>,
    pub weight: f64,
    pub status: SegStatus,
    /// Length-`L` sequence of progress-coordinate vectors; element 0 is
    /// the start point (inherited from the parent), element `L-1` is
    /// the endpoint. Unset frames (not yet propagated) are empty.
    pub pcoord: Vec<Vec<f64>>,
    pub parent_ids: BTreeSet<ParentRef>,
    pub p_parent_id: Option<ParentRef>,
    pub n_parents: usize,
    pub endpoint_type: Option<EndpointType>,
    pub cputime: f64,
    pub walltime: f64,
}

impl Segment {
    /// Construct a freshly materialized segment (`Prepared`, pcoord
    /// frames 1..L unset), validating Global Invariant 2 (positivity).
    pub fn new_prepared(
        weight: f64,
        start_pcoord: Vec<f64>,
        pcoord_len: usize,
        p_parent_id: ParentRef,
        parent_ids: BTreeSet<ParentRef>,
    ) -> Result<Self> {
        if !(weight > 0.0) {
            return Err(WeError::invariant(format!(
                "segment materialized with non-positive weight {weight}"
            )));
        }
        let mut pcoord = Vec::with_capacity(pcoord_len);
        pcoord.push(start_pcoord);
        for _ in 1..pcoord_len {
            pcoord.push(Vec::new());
        }
        Ok(Segment {
            seg_id: None,
            weight,
            status: SegStatus::Prepared,
            pcoord,
            n_parents: parent_ids.len(),
            parent_ids,
            p_parent_id: Some(p_parent_id),
            endpoint_type: None,
            cputime: 0.0,
            walltime: 0.0,
        })
    }

    pub fn start_pcoord(&self) -> &[f64] {
        &self.pcoord[0]
    }

    pub fn end_pcoord(&self) -> &[f64] {
        self.pcoord.last().expect("segment has no pcoord frames")
    }
}
