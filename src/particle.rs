use std::collections::BTreeSet;

use crate::error::{Result, WeError};

/// A reference to a lineage source: either a concrete segment of the
/// previous iteration, or a recycle sentinel wrapping the seg_id whose
/// endpoint was absorbed at a target and re-injected at an initial state.
///
/// This replaces the source driver's convention of encoding "recycled"
/// via the sign of `seg_id` with an explicit variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParentRef {
    /// An ordinary segment of the previous iteration.
    Segment(u32),
    /// A recycle source: the previous iteration's segment whose endpoint
    /// was absorbed at a target bin and re-injected at an initial state.
    Recycled(u32),
}

impl ParentRef {
    /// The iteration-n seg_id this reference names, regardless of
    /// whether it is a plain segment or a recycle source.
    pub fn seg_id(&self) -> u32 {
        match self {
            ParentRef::Segment(id) | ParentRef::Recycled(id) => *id,
        }
    }
}

/// The lightweight particle form used as both input and output of the
/// resampler.
#[derive(Debug, Clone)]
pub struct Particle {
    /// Only meaningful for particles that have not yet been split or
    /// merged: points back to the originating segment of the previous
    /// iteration.
    pub seg_id: Option<u32>,
    pub weight: f64,
    /// A single progress-coordinate vector (not a trajectory).
    pub pcoord: Vec<f64>,
    /// Set once this particle has resulted from a split or a merge.
    pub p_parent_id: Option<ParentRef>,
    pub parent_ids: BTreeSet<ParentRef>,
    /// True if this particle is a re-injection produced by the recycle
    /// phase rather than a plain propagated endpoint.
    pub from_recycle: bool,
}

impl Particle {
    /// Construct a fresh endpoint particle from a propagated segment.
    /// Carries no parentage yet -- that is assigned by split/merge/emit.
    pub fn endpoint(seg_id: u32, weight: f64, pcoord: Vec<f64>) -> Self {
        Particle {
            seg_id: Some(seg_id),
            weight,
            pcoord,
            p_parent_id: None,
            parent_ids: BTreeSet::new(),
            from_recycle: false,
        }
    }

    /// The terminal lineage reference of this particle: its own
    /// `p_parent_id` if it has already been split or merged, otherwise
    /// the reference derived from its originating seg_id.
    ///
    /// Every particle the resampler builds sets one of the two, so this
    /// only errs if a bin member was constructed outside that
    /// discipline; callers should treat it as a store-level invariant
    /// violation rather than recover from it.
    pub fn identity_ref(&self) -> Result<ParentRef> {
        match self.p_parent_id {
            Some(p) => Ok(p),
            None => {
                let id = self
                    .seg_id
                    .ok_or_else(|| WeError::invariant("particle with no lineage and no seg_id"))?;
                Ok(if self.from_recycle {
                    ParentRef::Recycled(id)
                } else {
                    ParentRef::Segment(id)
                })
            }
        }
    }
}
