//! Thin runnable shell around the weighted-ensemble driver. CLI argument
//! parsing and logging configuration are explicitly out of scope for
//! the core; this binary exists so the crate is runnable end to end,
//! wiring the in-memory collaborators over a toy system.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use weighted_ensemble::config::Config;
use weighted_ensemble::data_manager::{DataManager, MemoryDataManager};
use weighted_ensemble::region_set::RectilinearRegionSet;
use weighted_ensemble::registry::{build_propagator, build_work_manager, resolve_we_driver};
use weighted_ensemble::run_loop::{self, RunLoopConfig, RunOutcome};
use weighted_ensemble::segment::{SegStatus, Segment};
use weighted_ensemble::system::{InitialState, TargetState, ToyLinearSystem};

#[derive(Parser, Debug)]
#[clap(name = "wed", about = "Weighted ensemble sampling driver")]
struct Cli {
    /// Path to a TOML configuration file; if omitted, built-in defaults
    /// are used for a small demonstration run.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Overrides `limits.max_iterations`.
    #[clap(long)]
    max_iterations: Option<u64>,

    /// Overrides `args.profile_mode`.
    #[clap(long)]
    profile: bool,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    match run(cli, config) {
        Ok(RunOutcome::Completed { last_iter }) => {
            tracing::info!(last_iter, "run complete");
            std::process::exit(0);
        }
        Ok(RunOutcome::WallclockExceeded { last_iter }) => {
            tracing::info!(last_iter, "wallclock budget exhausted; clean shutdown");
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            std::process::exit(1);
        }
    }
}

fn load_config(cli: &Cli) -> weighted_ensemble::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| weighted_ensemble::WeError::Config(format!("reading {path:?}: {e}")))?;
            Config::from_toml_str(&text)?
        }
        None => Config::default(),
    };
    if config.drivers.propagator.is_none() {
        config.drivers.propagator = Some("toy".to_string());
    }
    if config.system.system_driver.is_none() {
        config.system.system_driver = Some("toy".to_string());
    }
    if cli.profile {
        config.args.profile_mode = true;
    }
    if let Some(max_iter) = cli.max_iterations {
        config.limits.max_iterations = Some(max_iter);
    }
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli, config: Config) -> weighted_ensemble::Result<RunOutcome> {
    let _ = resolve_we_driver(&config.drivers.we_driver)?;

    let propagator = build_propagator(config.drivers.propagator.as_deref().unwrap())?;
    let mut work_manager = build_work_manager(&config.drivers.work_manager, propagator, num_cpus())?;

    let region_set = RectilinearRegionSet::new(
        vec![vec![f64::NEG_INFINITY, 2.0, 5.0, 8.0, f64::INFINITY]],
        vec![8, 8, 8, 0],
        vec![None, None, None, Some(0)],
    );
    let initial_states = vec![InitialState { label: "start".to_string(), pcoord: vec![0.0] }];
    let target_states = vec![TargetState { label: "sink".to_string(), initial_state: 0 }];
    let mut system = ToyLinearSystem::new(region_set, target_states, initial_states, 5);

    let seed_segments: Vec<Segment> = (0..4)
        .map(|_| Segment {
            seg_id: None,
            weight: 0.25,
            status: SegStatus::Prepared,
            pcoord: vec![vec![0.0], vec![], vec![], vec![], vec![]],
            parent_ids: Default::default(),
            p_parent_id: None,
            n_parents: 0,
            endpoint_type: None,
            cputime: 0.0,
            walltime: 0.0,
        })
        .collect();
    let mut data_manager = MemoryDataManager::new(0, Vec::new(), 1, 5);
    data_manager.prepare_iteration(0, seed_segments, 1, 5);

    let max_iter = config.limits.max_iterations.unwrap_or(data_manager.current_iteration() + 1);
    let run_config = RunLoopConfig {
        max_iter,
        max_wallclock: config.limits.max_wallclock_secs.map(Duration::from_secs),
        profile_mode: config.args.profile_mode,
    };
    let _ = cli;

    run_loop::run(&run_config, &mut data_manager, work_manager.as_mut(), &mut system)
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}
