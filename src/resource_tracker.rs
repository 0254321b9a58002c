//! A simple phase-labelled stopwatch. No hierarchy -- phases are the
//! flat set enumerated by the driver and run loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Wall-clock and CPU time accumulated for one phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseUsage {
    pub walltime: Duration,
    pub cputime: Duration,
}

#[derive(Debug, Default)]
pub struct ResourceTracker {
    open: HashMap<&'static str, Instant>,
    closed: HashMap<&'static str, PhaseUsage>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts timing `phase`. Calling `begin` twice for the same phase
    /// without an intervening `end` overwrites the start time.
    pub fn begin(&mut self, phase: &'static str) {
        self.open.insert(phase, Instant::now());
    }

    /// Stops timing `phase` and records the elapsed wall time (CPU time
    /// is approximated as wall time: this crate has no platform-specific
    /// `getrusage` dependency, matching the rest of the example pack's
    /// preference for portable, dependency-light timing).
    pub fn end(&mut self, phase: &'static str) {
        if let Some(start) = self.open.remove(phase) {
            let elapsed = start.elapsed();
            let entry = self.closed.entry(phase).or_default();
            entry.walltime += elapsed;
            entry.cputime += elapsed;
        }
    }

    pub fn usage(&self, phase: &'static str) -> PhaseUsage {
        self.closed.get(phase).copied().unwrap_or_default()
    }

    /// Emits one `tracing::info!` line per recorded phase; used when
    /// `args.profile_mode` is set.
    pub fn dump_differences(&self) {
        let mut phases: Vec<_> = self.closed.iter().collect();
        phases.sort_by_key(|(name, _)| **name);
        for (phase, usage) in phases {
            tracing::info!(
                phase = *phase,
                walltime_s = usage.walltime.as_secs_f64(),
                cputime_s = usage.cputime.as_secs_f64(),
                "phase timing"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_end_records_nonzero_duration() {
        let mut tracker = ResourceTracker::new();
        tracker.begin("iteration");
        std::thread::sleep(Duration::from_millis(1));
        tracker.end("iteration");
        assert!(tracker.usage("iteration").walltime >= Duration::from_millis(1));
    }

    #[test]
    fn unstarted_phase_reports_zero() {
        let tracker = ResourceTracker::new();
        assert_eq!(tracker.usage("never_begun").walltime, Duration::ZERO);
    }
}
