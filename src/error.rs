use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, WeError>;

/// Error taxonomy of the driver, matching the classes the core is
/// required to distinguish: configuration, load, invariant, and
/// propagation failures. Wall-clock exhaustion is not an error (see
/// [`crate::run_loop::RunOutcome`]).
#[derive(Debug, Error)]
pub enum WeError {
    /// A required configuration key was missing, or a named driver is
    /// not in the collaborator registry.
    #[error("configuration error: {0}")]
    Config(String),

    /// The persistent store could not be read, or its schema does not
    /// match what the driver expects on resume.
    #[error("load error: {0}")]
    Load(String),

    /// A global invariant (weight conservation, dense seg_ids, weight
    /// positivity, termination-set disjointness, ...) was violated.
    /// `detail` identifies the offending entity.
    #[error("invariant violation: {detail}")]
    Invariant { detail: String },

    /// One or more segments did not reach `COMPLETE` status after
    /// `propagate()` returned.
    #[error("propagation failed for segments: {failed_seg_ids:?}")]
    Propagation { failed_seg_ids: Vec<u32> },
}

impl WeError {
    pub fn invariant(detail: impl Into<String>) -> Self {
        WeError::Invariant { detail: detail.into() }
    }
}
