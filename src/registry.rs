//! The collaborator registry: an explicit compile-time map from a
//! configured driver name to a constructor, replacing the source's
//! dynamic module loading. An unrecognized name is a `WeError::Config`,
//! never a panic.
//!
//! Also home to a deliberate bug fix: the source's `load_we_driver` has
//! an apparent copy-paste bug that assigns a non-default WE-driver name
//! to `self.work_manager`; this registry always assigns a named
//! `we_driver` to the WE-driver slot.

use crate::error::{Result, WeError};
use crate::system::{Propagator, ToyPropagator};
use crate::work_manager::{SerialWorkManager, ThreadedWorkManager, WorkManager};

/// The only WE-driver implementation this crate carries. Named so that
/// selecting an unknown `drivers.we_driver` is a configuration error
/// rather than silently falling back to this one.
pub const DEFAULT_WE_DRIVER: &str = "default";

/// Resolves `drivers.we_driver`. There is exactly one implementation of
/// the resampling algorithm; this function exists so that naming a
/// different one is a caught configuration error, not a silent no-op,
/// and so the "assign to we_driver, not work_manager" bug fix has a
/// concrete home.
pub fn resolve_we_driver(name: &str) -> Result<&'static str> {
    if name.eq_ignore_ascii_case(DEFAULT_WE_DRIVER) {
        Ok(DEFAULT_WE_DRIVER)
    } else {
        Err(WeError::Config(format!("unknown we_driver '{name}'")))
    }
}

/// Resolves `drivers.propagator` to a concrete `Propagator`. Only the
/// deterministic toy propagator is implemented; `"executable"` is
/// recognized as a name but rejected as unimplemented, marking the
/// extension seam rather than silently substituting the toy
/// propagator.
pub fn build_propagator(name: &str) -> Result<Box<dyn Propagator>> {
    match name {
        "toy" => Ok(Box::new(ToyPropagator { drift: 0.0, jitter_sd: 0.05 })),
        "executable" => Err(WeError::Config(
            "propagator 'executable' is an external-process extension point, not implemented in this crate"
                .to_string(),
        )),
        other => Err(WeError::Config(format!("unknown propagator '{other}'"))),
    }
}

/// Resolves `drivers.work_manager` to a concrete `WorkManager`, wrapping
/// `propagator`. `n_threads` only matters for `"threads"`.
pub fn build_work_manager(
    name: &str,
    propagator: Box<dyn Propagator>,
    n_threads: usize,
) -> Result<Box<dyn WorkManager>> {
    match name {
        "serial" => Ok(Box::new(SerialWorkManagerBoxed::new(propagator))),
        "threads" | "default" => Ok(Box::new(ThreadedWorkManagerBoxed::new(propagator, n_threads))),
        other => Err(WeError::Config(format!("unknown work_manager '{other}'"))),
    }
}

/// `SerialWorkManager`/`ThreadedWorkManager` are generic over `P:
/// Propagator`; the registry deals in `Box<dyn Propagator>` so it can
/// resolve a name to a manager without the caller naming a concrete
/// propagator type. These thin wrappers bridge the two.
struct SerialWorkManagerBoxed {
    inner: SerialWorkManager<Box<dyn Propagator>>,
}

impl SerialWorkManagerBoxed {
    fn new(propagator: Box<dyn Propagator>) -> Self {
        SerialWorkManagerBoxed { inner: SerialWorkManager::new(propagator) }
    }
}

impl WorkManager for SerialWorkManagerBoxed {
    fn propagate(&self, segments: &mut [crate::segment::Segment]) {
        self.inner.propagate(segments)
    }
}

struct ThreadedWorkManagerBoxed {
    inner: ThreadedWorkManager<Box<dyn Propagator>>,
}

impl ThreadedWorkManagerBoxed {
    fn new(propagator: Box<dyn Propagator>, n_threads: usize) -> Self {
        ThreadedWorkManagerBoxed { inner: ThreadedWorkManager::new(propagator, n_threads) }
    }
}

impl WorkManager for ThreadedWorkManagerBoxed {
    fn propagate(&self, segments: &mut [crate::segment::Segment]) {
        self.inner.propagate(segments)
    }
}

impl Propagator for Box<dyn Propagator> {
    fn propagate_one(&self, segment: &mut crate::segment::Segment) {
        (**self).propagate_one(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_we_driver_is_a_config_error() {
        assert!(resolve_we_driver("exotic").is_err());
        assert!(resolve_we_driver("default").is_ok());
    }

    #[test]
    fn executable_propagator_is_a_named_but_unimplemented_extension_point() {
        let err = build_propagator("executable").unwrap_err();
        match err {
            WeError::Config(msg) => assert!(msg.contains("extension point")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_work_manager_is_a_config_error() {
        let propagator = build_propagator("toy").unwrap();
        assert!(build_work_manager("exotic", propagator, 1).is_err());
    }
}
