// Part of seml.

use std::collections::HashMap;

use clap::Args;

use seml::config::Configuration;
use seml::orchestrator::{self, StartArgs};
use seml::storage::{Status, Storage};
use seml::Result;

/// Arguments for `seml start`.
#[derive(Args, Debug)]
pub struct Start {
    /// Name of the collection whose staged experiments should be started.
    pub collection: String,

    /// Run locally instead of submitting to Slurm.
    #[arg(long)]
    pub local: bool,

    /// Only start the experiment with this id.
    #[arg(long, value_name = "ID")]
    pub sacred_id: Option<i64>,

    /// Only start experiments from this batch.
    #[arg(long, value_name = "ID")]
    pub batch_id: Option<i64>,

    /// Restrict to experiments matching this JSON filter dict (currently
    /// only the `status` key is honored).
    #[arg(long, value_name = "JSON")]
    pub filter_dict: Option<String>,

    /// Maximum number of experiments to start (0 = unlimited).
    #[arg(short = 'n', long, default_value_t = 0)]
    pub num_exps: i64,

    /// Drop into a post-mortem debugger on failure.
    #[arg(long)]
    pub post_mortem: bool,

    /// Run exactly one experiment locally, unobserved, with post-mortem and
    /// console output forced on.
    #[arg(long)]
    pub debug: bool,

    /// Like `--debug`, but additionally wait for a `debugpy` client to
    /// attach before running.
    #[arg(long)]
    pub debug_server: bool,

    /// Stream experiment output to the console instead of (or in addition
    /// to) a log file.
    #[arg(long)]
    pub output_to_console: bool,

    /// Never write a per-experiment output file.
    #[arg(long)]
    pub no_file_output: bool,

    /// (Local worker only) also claim PENDING experiments dispatched to
    /// Slurm, cancelling their Slurm task.
    #[arg(long)]
    pub steal_slurm: bool,

    /// (Local worker only) transition experiments to PENDING without
    /// starting a worker loop to run them.
    #[arg(long)]
    pub no_worker: bool,

    /// (Local worker only) GPUs to make visible to experiments, forwarded
    /// as `CUDA_VISIBLE_DEVICES`.
    #[arg(long, value_name = "SPEC")]
    pub worker_gpus: Option<String>,

    /// (Local worker only) CPU affinity count advertised to experiments.
    #[arg(long, value_name = "N")]
    pub worker_cpus: Option<u32>,

    /// (Local worker only) extra `KEY=VALUE` environment variables, given
    /// as a JSON object.
    #[arg(long, value_name = "JSON")]
    pub worker_environment_vars: Option<String>,
}

fn parse_filter_status(filter_dict: &Option<String>) -> Result<Option<Status>> {
    let Some(raw) = filter_dict else {
        return Ok(None);
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| seml::Error::ArgumentError(format!("invalid --filter-dict JSON: {e}")))?;
    let Some(status) = value.get("status").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    Status::from_str(status)
        .map(Some)
        .ok_or_else(|| seml::Error::ArgumentError(format!("unknown status {status:?} in --filter-dict")))
}

fn parse_env_vars(raw: &Option<String>) -> Result<HashMap<String, String>> {
    let Some(raw) = raw else {
        return Ok(HashMap::new());
    };
    let value: HashMap<String, String> =
        serde_json::from_str(raw).map_err(|e| seml::Error::ArgumentError(format!("invalid --worker-environment-vars JSON: {e}")))?;
    Ok(value)
}

pub fn run(storage: &Storage, configuration: &Configuration, args: &Start) -> Result<()> {
    let start_args = StartArgs {
        collection: args.collection.clone(),
        local: args.local,
        sacred_id: args.sacred_id,
        batch_id: args.batch_id,
        filter_status: parse_filter_status(&args.filter_dict)?,
        num_exps: args.num_exps,
        post_mortem: args.post_mortem,
        debug: args.debug,
        debug_server: args.debug_server,
        output_to_console: args.output_to_console,
        no_file_output: args.no_file_output,
        steal_slurm: args.steal_slurm,
        no_worker: args.no_worker,
        worker_gpus: args.worker_gpus.clone(),
        worker_cpus: args.worker_cpus,
        worker_environment_vars: parse_env_vars(&args.worker_environment_vars)?,
    };
    orchestrator::start(storage, configuration, &start_args)
}
