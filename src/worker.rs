// Part of seml.

//! Local Worker — a cooperative loop that claims pending experiments and
//! runs their materialized command as a child process.
//!
//! Claim-loop and `run_one` semantics are grounded on
//! `original_source/src/seml/start.py`'s `start_local_worker`,
//! `start_local_job`, and `check_compute_node`. The spawn-and-poll idiom
//! (piped output, `Arc<AtomicBool>` termination flag registered via
//! `signal-hook`) is grounded on `row::scheduler::bash::Bash::submit`, but
//! deliberately redesigned per the re-architecture guidance: SIGINT here
//! only stops the claim loop from picking up further work. It does not
//! signal the in-flight child — row's `Bash::submit` sends the child
//! `SIGINT` on `should_terminate`; that behavior is wrong for SEML, where
//! the child is an external experiment process that should be allowed to
//! reach its own terminal state.
//!
//! Open question 1 (distilled spec §9) is intentionally left unresolved
//! here: if this process is killed outright (`SIGKILL`, OOM, node failure)
//! while a child is RUNNING, the document stays RUNNING forever. No
//! heartbeat or reaper is implemented.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::Configuration;
use crate::materializer::{self, MaterializeOptions};
use crate::storage::{ClaimContext, Experiment, Filter, Status, Storage};
use crate::{Error, Result};

/// How the child's stdout/stderr are handled (distilled spec §4.6.1 step 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    FileOnly,
    Tee,
    TerminalOnly,
}

/// Options threaded through the claim loop and `run_one`, gathered from the
/// `start` CLI verb and the Lifecycle Orchestrator's flag validation.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub collection: String,
    pub unobserved: bool,
    pub steal_slurm: bool,
    pub max_jobs: Option<u32>,
    pub output_mode: OutputMode,
    pub extra_env: HashMap<String, String>,
    pub batch_id: Option<i64>,
    pub sacred_id: Option<i64>,
    /// `--worker-gpus`: composed into `CUDA_VISIBLE_DEVICES` for the child.
    pub gpus: Option<String>,
    /// `--worker-cpus`: composed into `OMP_NUM_THREADS` for the child.
    pub cpus: Option<u32>,
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| {
            fs::read_to_string("/proc/sys/kernel/hostname")
                .ok()
                .map(|s| s.trim().to_string())
        })
        .unwrap_or_default()
}

/// `check_compute_node` (`original_source/start.py`): refuse to run compute
/// experiments on a login node.
fn check_compute_node(configuration: &Configuration) -> Result<()> {
    let host = hostname();
    if configuration.login_node_names.iter().any(|n| n == &host) {
        return Err(Error::LoginNodeRefused);
    }
    Ok(())
}

fn base_filter(options: &WorkerOptions) -> Filter {
    Filter {
        id: options.sacred_id,
        batch_id: options.batch_id,
        statuses: Some(vec![Status::Pending]),
        slurm_array_present: if options.steal_slurm { None } else { Some(false) },
        limit: None,
    }
}

/// Register a SIGINT/SIGTERM handler that flips an `AtomicBool` rather than
/// killing anything — the claim loop below observes it between iterations.
fn install_termination_flag() -> Result<Arc<AtomicBool>> {
    let should_terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&should_terminate))
        .map_err(Error::IO)?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&should_terminate))
        .map_err(Error::IO)?;
    Ok(should_terminate)
}

/// Run the claim loop until no matching experiment remains, `max_jobs` have
/// completed, or the user interrupts.
pub fn run(storage: &Storage, configuration: &Configuration, options: &WorkerOptions) -> Result<()> {
    check_compute_node(configuration)?;

    let should_terminate = install_termination_flag()?;
    let mut jobs_done: u32 = 0;

    loop {
        if should_terminate.load(Ordering::Relaxed) {
            info!("Interrupted; no longer claiming new work.");
            break;
        }
        if let Some(max) = options.max_jobs {
            if jobs_done >= max {
                break;
            }
        }

        let filter = base_filter(options);
        let candidates = storage.find(&filter)?;
        let Some(candidate) = candidates.into_iter().next() else {
            break;
        };

        let was_stolen = candidate.slurm.array_id.is_some();
        let Some(mut doc) = storage.claim_for_run(candidate.id, options.unobserved, ClaimContext::Local)? else {
            // Lost the race; try again.
            continue;
        };

        if was_stolen {
            let old_array_id = candidate.slurm.array_id;
            let old_task_id = candidate.slurm.task_id;
            doc.slurm.array_id = None;
            doc.slurm.task_id = None;
            storage.save(&doc)?;
            if let (Some(array_id), Some(task_id)) = (old_array_id, old_task_id) {
                cancel_slurm_task(array_id, task_id)?;
            }
        }

        run_one(storage, configuration, options, &doc)?;
        jobs_done += 1;
    }

    Ok(())
}

/// `scancel <id>_<task>` — invoked strictly after the document has already
/// been cleaned up, never before (testable property 6: "steal safety").
fn cancel_slurm_task(array_id: i64, task_id: i64) -> Result<()> {
    debug!("Cancelling stolen Slurm task {array_id}_{task_id}.");
    let status = Command::new("scancel")
        .arg(format!("{array_id}_{task_id}"))
        .status()
        .map_err(|e| Error::SpawnProcess("scancel".into(), e))?;
    if !status.success() {
        warn!("scancel {array_id}_{task_id} exited with a non-zero status; the task may already be gone.");
    }
    Ok(())
}

struct TempWorkingDirectory {
    path: PathBuf,
    previous_cwd: Option<PathBuf>,
}

impl Drop for TempWorkingDirectory {
    fn drop(&mut self) {
        if let Some(previous) = &self.previous_cwd {
            let _ = std::env::set_current_dir(previous);
        }
        let _ = fs::remove_dir_all(&self.path);
    }
}

/// `run_one` (distilled spec §4.6.1): materialize, prepare the filesystem,
/// spawn, and report the outcome without ever overwriting a status Sacred
/// itself is responsible for.
fn run_one(storage: &Storage, configuration: &Configuration, options: &WorkerOptions, exp: &Experiment) -> Result<()> {
    let materialize_options = MaterializeOptions {
        resolved: true,
        unobserved: options.unobserved,
        db_collection: Some(options.collection.clone()),
        ..MaterializeOptions::for_execution()
    };
    let command = materializer::materialize(configuration, exp, &materialize_options)?;

    let mut guard = None;
    let mut env: HashMap<String, String> = options.extra_env.clone();
    if let Some(gpus) = &options.gpus {
        env.insert("CUDA_VISIBLE_DEVICES".to_string(), gpus.clone());
    }
    if let Some(cpus) = options.cpus {
        env.insert("OMP_NUM_THREADS".to_string(), cpus.to_string());
    }

    if exp.seml.source_files.as_ref().is_some_and(|f| !f.is_empty()) {
        let temp_dir = PathBuf::from(&configuration.tmp_directory).join(format!("seml-run-{}-{}", exp.id, uuid::Uuid::new_v4()));
        fs::create_dir_all(&temp_dir).map_err(|e| Error::DirectoryCreate(temp_dir.clone(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&temp_dir, fs::Permissions::from_mode(0o700));
        }
        let manifest = exp.seml.source_files.clone().unwrap_or_default();
        crate::snapshot::restore(storage, &manifest, &temp_dir)?;
        let existing_pythonpath = env.get("PYTHONPATH").cloned().unwrap_or_default();
        env.insert(
            "PYTHONPATH".to_string(),
            format!("{}:{existing_pythonpath}", temp_dir.display()),
        );
        guard = Some(TempWorkingDirectory {
            path: temp_dir,
            previous_cwd: None,
        });
    } else if let Some(working_dir) = &exp.seml.working_dir {
        let previous_cwd = std::env::current_dir().ok();
        std::env::set_current_dir(working_dir).map_err(Error::IO)?;
        guard = Some(TempWorkingDirectory {
            path: PathBuf::from(working_dir),
            previous_cwd,
        });
    }

    // `start_local_job` (`original_source/start.py`): derive the output
    // path from the experiment's name/id rather than relying on one
    // already being present — an ordinary local run starts from STAGED
    // with no pre-existing `seml.output_file`.
    let output_file = if options.output_mode == OutputMode::TerminalOnly {
        None
    } else if let Some(existing) = &exp.seml.output_file {
        Some(existing.clone())
    } else {
        let name = exp.seml.name.clone().unwrap_or_else(|| "exp".to_string());
        let output_dir = exp.seml.output_dir.clone().unwrap_or_else(|| configuration.tmp_directory.clone());
        fs::create_dir_all(&output_dir).map_err(|e| Error::DirectoryCreate(PathBuf::from(&output_dir), e))?;
        Some(format!("{output_dir}/{name}_{}.out", exp.id))
    };

    let slurm_job_id = std::env::var("SLURM_JOBID").ok().and_then(|s| s.parse::<i64>().ok());
    if !options.unobserved && (output_file != exp.seml.output_file || slurm_job_id.is_some()) {
        let mut updated = exp.clone();
        updated.seml.output_file = output_file.clone();
        if let Some(job_id) = slurm_job_id {
            updated.slurm.array_id = Some(job_id);
            updated.slurm.task_id = Some(0);
        }
        storage.save(&updated)?;
    }

    let mut shell_command = command.full_command.clone();
    if let Some(conda_env) = &exp.seml.conda_environment {
        shell_command = format!("conda activate {conda_env} && {shell_command} && conda deactivate");
    }

    debug!("Spawning experiment {}.", exp.id);
    let mut process = Command::new("bash");
    process.arg("-c").arg(&shell_command).envs(&env);

    let outcome = match (options.output_mode, &output_file) {
        (OutputMode::FileOnly, Some(path)) => spawn_with_file_output(process, path, false),
        (OutputMode::Tee, Some(path)) => spawn_with_file_output(process, path, true),
        _ => spawn_inherited(process),
    };

    drop(guard);

    match outcome {
        Ok(true) => {
            info!("Experiment {} finished.", exp.id);
            Ok(())
        }
        Ok(false) => {
            warn!("Experiment {} exited non-zero; its own process owns the terminal status.", exp.id);
            Ok(())
        }
        Err(io_err) => {
            warn!("I/O error running experiment {}: {io_err}", exp.id);
            if !options.unobserved {
                let mut failed = exp.clone();
                failed.status = Status::Failed;
                storage.save(&failed)?;
            }
            Ok(())
        }
    }
}

fn spawn_inherited(mut process: Command) -> std::io::Result<bool> {
    process.stdin(Stdio::null()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
    let status = process.spawn()?.wait()?;
    Ok(status.success())
}

fn spawn_with_file_output(mut process: Command, output_file: &str, tee: bool) -> std::io::Result<bool> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(output_file)?;

    process.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = process.spawn()?;

    let mut stdout = child.stdout.take().expect("piped stdout");
    let mut stderr = child.stderr.take().expect("piped stderr");

    let stdout_handle = std::thread::spawn(move || -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut stdout, &mut buf)?;
        Ok(buf)
    });
    let mut stderr_buf = Vec::new();
    std::io::Read::read_to_end(&mut stderr, &mut stderr_buf)?;
    let stdout_buf = stdout_handle.join().expect("stdout reader thread should not panic")?;

    file.write_all(&stdout_buf)?;
    file.write_all(&stderr_buf)?;
    if tee {
        std::io::stdout().write_all(&stdout_buf)?;
        std::io::stderr().write_all(&stderr_buf)?;
    }

    let status = child.wait()?;
    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SemlInfo;
    use serial_test::serial;

    #[test]
    #[serial]
    fn check_compute_node_refuses_login_host() {
        let mut configuration = Configuration::default();
        configuration.login_node_names = vec![hostname()];
        let err = check_compute_node(&configuration).unwrap_err();
        assert!(matches!(err, Error::LoginNodeRefused));
    }

    #[test]
    #[serial]
    fn check_compute_node_allows_unlisted_host() {
        let mut configuration = Configuration::default();
        configuration.login_node_names = vec!["definitely-not-this-host".to_string()];
        assert!(check_compute_node(&configuration).is_ok());
    }

    #[test]
    #[serial]
    fn run_one_without_output_file_spawns_inherited() {
        let storage = Storage::in_memory().unwrap();
        let exp = Experiment {
            id: 1,
            batch_id: 1,
            status: Status::Running,
            config: serde_json::json!({}),
            config_unresolved: None,
            seml: SemlInfo {
                executable: Some("true".to_string()),
                ..Default::default()
            },
            slurm: crate::storage::SlurmInfo::default(),
        };
        let configuration = Configuration::default();
        let options = WorkerOptions {
            collection: "col".to_string(),
            unobserved: true,
            steal_slurm: false,
            max_jobs: None,
            output_mode: OutputMode::TerminalOnly,
            extra_env: HashMap::new(),
            batch_id: None,
            sacred_id: None,
            gpus: None,
            cpus: None,
        };
        // materializer will prepend "python"; 'true' as argv is still a
        // fine smoke test of the spawn path not panicking.
        let result = run_one(&storage, &configuration, &options, &exp);
        assert!(result.is_ok());
    }

    #[test]
    #[serial]
    fn run_one_composes_gpu_and_cpu_env_vars() {
        let storage = Storage::in_memory().unwrap();
        let exp = Experiment {
            id: 2,
            batch_id: 1,
            status: Status::Running,
            config: serde_json::json!({}),
            config_unresolved: None,
            seml: SemlInfo {
                executable: Some("true".to_string()),
                ..Default::default()
            },
            slurm: crate::storage::SlurmInfo::default(),
        };
        let configuration = Configuration::default();
        let options = WorkerOptions {
            collection: "col".to_string(),
            unobserved: true,
            steal_slurm: false,
            max_jobs: None,
            output_mode: OutputMode::TerminalOnly,
            extra_env: HashMap::new(),
            batch_id: None,
            sacred_id: None,
            gpus: Some("0,1".to_string()),
            cpus: Some(4),
        };
        let result = run_one(&storage, &configuration, &options, &exp);
        assert!(result.is_ok());
    }
}
