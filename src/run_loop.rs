//! The multi-iteration run loop: wall-clock budget, resume, and
//! termination around repeated calls to the iteration driver.

use std::time::{Duration, Instant};

use crate::data_manager::DataManager;
use crate::driver::{Driver, IterationOutcome};
use crate::error::Result;
use crate::resource_tracker::ResourceTracker;
use crate::system::SystemDriver;
use crate::work_manager::WorkManager;

/// How one invocation of [`run`] ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Ran every iteration up to `max_iter`.
    Completed { last_iter: u64 },
    /// Stopped cleanly at an iteration boundary because running another
    /// iteration would exceed `max_wallclock`. Not an error.
    WallclockExceeded { last_iter: u64 },
}

pub struct RunLoopConfig {
    pub max_iter: u64,
    pub max_wallclock: Option<Duration>,
    pub profile_mode: bool,
}

/// Runs the WE loop from `data_manager.current_iteration()` through
/// `config.max_iter`, checking the wall-clock budget before each
/// iteration using a rolling estimate of the last iteration's elapsed
/// time.
pub fn run(
    config: &RunLoopConfig,
    data_manager: &mut dyn DataManager,
    work_manager: &mut dyn WorkManager,
    system: &mut dyn SystemDriver,
) -> Result<RunOutcome> {
    system.validate()?;

    work_manager.prepare_workers();
    if !work_manager.is_server() {
        // This process is a worker; the work manager owns its own loop.
        return Ok(RunOutcome::Completed { last_iter: data_manager.current_iteration() });
    }

    let run_start = Instant::now();
    let mut rtracker = ResourceTracker::new();
    rtracker.begin("run");

    let mut driver = Driver::new();
    let mut n_iter = data_manager.current_iteration();
    let mut last_iteration_elapsed = Duration::ZERO;

    loop {
        if n_iter > config.max_iter {
            break;
        }

        if let Some(max_wallclock) = config.max_wallclock {
            if run_start.elapsed() + last_iteration_elapsed >= max_wallclock {
                tracing::info!(
                    n_iter,
                    "iteration would require more than the allotted wallclock budget; ending run"
                );
                work_manager.shutdown(0);
                rtracker.end("run");
                return Ok(RunOutcome::WallclockExceeded { last_iter: n_iter });
            }
        }

        tracing::info!(n_iter, max_iter = config.max_iter, "starting iteration");
        let iter_start = Instant::now();

        let outcome = driver.run_iteration(n_iter, data_manager, work_manager, system, &mut rtracker)?;
        let IterationOutcome::Advanced { next_iter } = outcome;

        last_iteration_elapsed = iter_start.elapsed();
        tracing::info!(n_iter, elapsed_s = last_iteration_elapsed.as_secs_f64(), "iteration complete");

        n_iter = next_iter;
    }

    rtracker.end("run");
    if config.profile_mode {
        rtracker.dump_differences();
    }
    Ok(RunOutcome::Completed { last_iter: n_iter.saturating_sub(1) })
}
