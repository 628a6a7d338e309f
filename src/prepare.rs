// Part of seml.

//! Preparation Hook — invoked once per experiment id from inside a Slurm
//! task (or an interactive `srun`), atomically transitions PENDING→RUNNING,
//! and prints the final shell command for the caller's template to `eval`.
//!
//! Grounded on `original_source/src/seml/start.py`'s
//! `get_experiment_and_set_running` (the two-predicate CAS) and
//! `prepare_experiment` (exit codes, rank detection, seed injection).

use log::warn;

use crate::config::Configuration;
use crate::materializer::{self, MaterializeOptions};
use crate::storage::{ClaimContext, Filter, Status, Storage};
use crate::{Error, Result};

/// Exit-code-bearing outcome of a preparation attempt (distilled spec
/// §4.7): 0 on success (with the command to print), 3 when the id exists
/// but cannot be claimed, 4 when it does not exist at all.
pub enum Outcome {
    Ready { command: String, debug_attach_url: Option<String> },
    NotClaimable,
    NotFound,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Ready { .. } => 0,
            Outcome::NotClaimable => 3,
            Outcome::NotFound => 4,
        }
    }
}

/// Options gathered from the `prepare-experiment` CLI verb.
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    pub collection: String,
    pub verbose: bool,
    pub unobserved: bool,
    pub post_mortem: bool,
    pub stored_sources_dir: Option<std::path::PathBuf>,
    pub debug_server: bool,
}

fn claim_context_from_env() -> ClaimContext {
    let array_id = std::env::var("SLURM_ARRAY_JOB_ID").ok().and_then(|s| s.parse().ok());
    let task_id = std::env::var("SLURM_ARRAY_TASK_ID").ok().and_then(|s| s.parse().ok());
    match (array_id, task_id) {
        (Some(array_id), Some(task_id)) => ClaimContext::SlurmTask { array_id, task_id },
        _ => ClaimContext::Local,
    }
}

/// Whether this rank is the "local main" (per-node) process: `SLURM_LOCALID`
/// absent (single-process launch) or equal to 0.
fn is_local_main_process() -> bool {
    std::env::var("SLURM_LOCALID")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map_or(true, |id| id == 0)
}

/// Whether this rank is the "global main" process: `SLURM_PROCID` absent or
/// equal to 0.
fn is_global_main_process() -> bool {
    std::env::var("SLURM_PROCID")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .map_or(true, |id| id == 0)
}

fn is_running_in_multi_process() -> bool {
    std::env::var("SLURM_NTASKS")
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .is_some_and(|n| n > 1)
}

/// Run the Preparation Hook for one experiment id.
pub fn prepare(storage: &Storage, configuration: &Configuration, experiment_id: i64, options: &PrepareOptions) -> Result<Outcome> {
    let exists = storage
        .find_one(&Filter {
            id: Some(experiment_id),
            ..Default::default()
        })?
        .is_some();
    if !exists {
        return Ok(Outcome::NotFound);
    }

    // `prepare_experiment` (`original_source/start.py`): only the local-main
    // rank claims and transitions the experiment at all; every other rank on
    // the node exits 0 without touching the database.
    if !is_local_main_process() {
        return Ok(Outcome::Ready {
            command: String::new(),
            debug_attach_url: None,
        });
    }

    let claim_context = claim_context_from_env();
    let Some(mut doc) = storage.claim_for_run(experiment_id, options.unobserved, claim_context)? else {
        return Ok(Outcome::NotClaimable);
    };

    if let Some(dir) = &options.stored_sources_dir {
        let manifest = doc.seml.source_files.clone().unwrap_or_default();
        if !manifest.is_empty() {
            crate::snapshot::restore(storage, &manifest, dir)?;
        }
    }

    if !is_global_main_process() {
        // Non-global ranks neither touch the database nor print anything.
        return Ok(Outcome::Ready {
            command: String::new(),
            debug_attach_url: None,
        });
    }

    if is_running_in_multi_process() {
        let has_fixed_seed = doc
            .config
            .as_object()
            .and_then(|m| m.get(&configuration.seed_config_key))
            .is_some();
        if !has_fixed_seed {
            let seed = generate_seed();
            if let Some(map) = doc.config.as_object_mut() {
                map.insert(configuration.seed_config_key.clone(), serde_json::json!(seed));
            }
        }
    }

    let unresolved_options = MaterializeOptions {
        resolved: false,
        verbose: options.verbose,
        unobserved: options.unobserved,
        post_mortem: options.post_mortem,
        debug_server: options.debug_server,
        db_collection: Some(options.collection.clone()),
        ..MaterializeOptions::for_execution()
    };
    let resolved_options = MaterializeOptions {
        resolved: true,
        ..unresolved_options.clone()
    };

    let resolved = materializer::materialize(configuration, &doc, &resolved_options)?;
    let unresolved = materializer::materialize(configuration, &doc, &unresolved_options)?;

    if !options.unobserved {
        doc.seml.command = Some(resolved.full_command.clone());
        doc.seml.command_unresolved = Some(unresolved.full_command.clone());
        if let Err(e) = storage.save(&doc) {
            warn!("Failed to persist materialized command for experiment {experiment_id}: {e}");
            return Err(e);
        }
    }

    Ok(Outcome::Ready {
        command: resolved.full_command,
        debug_attach_url: resolved.debug_attach_url,
    })
}

fn generate_seed() -> u32 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    nanos ^ std::process::id()
}
