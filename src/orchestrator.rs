// Part of seml.

//! Lifecycle Orchestrator — the `start` verb: validates flag combinations,
//! transitions staged experiments to PENDING, and routes them to the Slurm
//! Dispatcher or the Local Worker.
//!
//! Flag-validation order and the debug/debug-server forced-flag set are
//! grounded on `original_source/src/seml/start.py::start_experiments`. The
//! `run()`-taking-parsed-args-and-a-configuration shape is grounded on
//! `row::cli::submit::run`.

use std::collections::HashMap;

use log::info;

use crate::chunker;
use crate::config::Configuration;
use crate::scheduler::slurm;
use crate::storage::{Filter, Status, Storage};
use crate::worker::{self, OutputMode, WorkerOptions};
use crate::{Error, Result};

/// Parsed `start` arguments, independent of the `clap` definitions in
/// `cli::start` so this module stays testable without a `clap::Parser`.
#[derive(Debug, Clone, Default)]
pub struct StartArgs {
    pub collection: String,
    pub local: bool,
    pub sacred_id: Option<i64>,
    pub batch_id: Option<i64>,
    pub filter_status: Option<Status>,
    pub num_exps: i64,
    pub post_mortem: bool,
    pub debug: bool,
    pub debug_server: bool,
    pub output_to_console: bool,
    pub no_file_output: bool,
    pub steal_slurm: bool,
    pub no_worker: bool,
    pub worker_gpus: Option<String>,
    pub worker_cpus: Option<u32>,
    pub worker_environment_vars: HashMap<String, String>,
}

fn validate(args: &StartArgs) -> Result<()> {
    if !args.local {
        if args.steal_slurm
            || args.no_worker
            || args.worker_gpus.is_some()
            || args.worker_cpus.is_some()
            || !args.worker_environment_vars.is_empty()
        {
            return Err(Error::ArgumentError(
                "local-only flags (--steal-slurm, --no-worker, --worker-gpus, --worker-cpus, --worker-environment-vars) require --local".to_string(),
            ));
        }
        if !args.debug && !args.debug_server && (args.post_mortem || args.output_to_console) {
            return Err(Error::ArgumentError(
                "--post-mortem and --output-to-console require --local or --debug in Slurm mode".to_string(),
            ));
        }
    }
    Ok(())
}

/// Apply the distilled spec's §4.8 forced-flag rule for `--debug`/`--debug-server`.
fn apply_debug_overrides(mut args: StartArgs) -> (StartArgs, bool) {
    let forced = args.debug || args.debug_server;
    if forced {
        args.num_exps = 1;
        args.post_mortem = true;
        args.output_to_console = true;
    }
    (args, forced)
}

fn staged_filter(args: &StartArgs) -> Filter {
    Filter {
        id: args.sacred_id,
        batch_id: args.batch_id,
        statuses: Some(vec![args.filter_status.unwrap_or(Status::Staged)]),
        slurm_array_present: None,
        limit: None,
    }
}

/// Entry point for the `start` verb.
pub fn start(storage: &Storage, configuration: &Configuration, args: &StartArgs) -> Result<()> {
    validate(args)?;
    let (args, debug_forced) = apply_debug_overrides(args.clone());
    let use_srun = debug_forced;

    let filter = staged_filter(&args);
    let mut staged = storage.find(&filter)?;
    if args.num_exps > 0 {
        staged.truncate(args.num_exps as usize);
    }

    if staged.is_empty() {
        info!("No staged experiments match the given filter.");
        return Ok(());
    }

    let ids: Vec<i64> = staged.iter().map(|e| e.id).collect();

    if args.local {
        storage.bulk_update(&ids, Status::Pending)?;
        if args.no_worker {
            info!("{} experiment(s) transitioned to PENDING; --no-worker given, not starting a worker loop.", ids.len());
            return Ok(());
        }
        let output_mode = if args.no_file_output {
            OutputMode::TerminalOnly
        } else if args.output_to_console {
            OutputMode::Tee
        } else {
            OutputMode::FileOnly
        };
        let worker_options = WorkerOptions {
            collection: args.collection.clone(),
            unobserved: debug_forced,
            steal_slurm: args.steal_slurm,
            max_jobs: if args.num_exps > 0 { Some(args.num_exps as u32) } else { None },
            output_mode,
            extra_env: args.worker_environment_vars.clone(),
            batch_id: args.batch_id,
            sacred_id: args.sacred_id,
            gpus: args.worker_gpus.clone(),
            cpus: args.worker_cpus,
        };
        worker::run(storage, configuration, &worker_options)?;
        return Ok(());
    }

    if use_srun {
        let exp = staged.first().expect("staged is non-empty");
        return slurm::run_srun(&exp.slurm.sbatch_options, &args.collection, exp.id);
    }

    // Slurm-bound experiments stay STAGED until `dispatch_array` transitions
    // them to PENDING together with their `slurm.array_id`/`task_id` — never
    // bulk-transitioned up front, or an unrelated local worker could claim
    // them before they're ever dispatched.
    let experiments_per_job = staged
        .first()
        .and_then(|e| e.slurm.experiments_per_job)
        .unwrap_or(1) as usize;
    let chunks = chunker::chunk_experiments(staged, experiments_per_job);
    let arrays = chunker::group_into_arrays(chunks);

    for array in &arrays {
        slurm::dispatch_array(storage, configuration, &args.collection, array)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Experiment, SemlInfo, SlurmInfo};
    use serial_test::parallel;

    fn staged(id: i64, batch_id: i64) -> Experiment {
        Experiment {
            id,
            batch_id,
            status: Status::Staged,
            config: serde_json::json!({"lr": 0.1}),
            config_unresolved: None,
            seml: SemlInfo {
                executable: Some("train.py".to_string()),
                ..Default::default()
            },
            slurm: SlurmInfo {
                experiments_per_job: Some(1),
                ..Default::default()
            },
        }
    }

    #[test]
    #[parallel]
    fn rejects_local_only_flags_without_local() {
        let args = StartArgs {
            collection: "col".to_string(),
            steal_slurm: true,
            ..Default::default()
        };
        let err = validate(&args).unwrap_err();
        assert!(matches!(err, Error::ArgumentError(_)));
    }

    #[test]
    #[parallel]
    fn rejects_post_mortem_in_plain_slurm_mode() {
        let args = StartArgs {
            collection: "col".to_string(),
            post_mortem: true,
            ..Default::default()
        };
        let err = validate(&args).unwrap_err();
        assert!(matches!(err, Error::ArgumentError(_)));
    }

    #[test]
    #[parallel]
    fn debug_forces_single_experiment_and_post_mortem() {
        let args = StartArgs {
            collection: "col".to_string(),
            debug: true,
            local: true,
            ..Default::default()
        };
        let (applied, forced) = apply_debug_overrides(args);
        assert!(forced);
        assert_eq!(applied.num_exps, 1);
        assert!(applied.post_mortem);
        assert!(applied.output_to_console);
    }

    #[test]
    #[parallel]
    fn no_staged_experiments_is_a_no_op() {
        let storage = Storage::in_memory().unwrap();
        let configuration = Configuration::default();
        let args = StartArgs {
            collection: "col".to_string(),
            local: true,
            num_exps: 1,
            ..Default::default()
        };
        // With no staged docs and a local run, `worker::run` would otherwise
        // execute; this early-return path means no panic / no login-node
        // check runs.
        storage.save(&staged(1, 1)).unwrap();
        storage.bulk_update(&[1], Status::Completed).unwrap();
        let result = start(&storage, &configuration, &args);
        assert!(result.is_ok());
    }
}
