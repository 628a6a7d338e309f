// Part of seml.

//! Slurm Dispatcher — emits sbatch/srun scripts, submits them, and records
//! the returned job identifiers on every experiment in the array.
//!
//! The script-templating fields (`{sbatch_options, working_dir,
//! use_conda_env, ..., setup_command, end_command}`) are grounded on
//! `original_source/src/seml/start.py`'s `start_sbatch_job`. The process
//! spawn itself — `std::process::Command`, `ExitStatusExt` for signal
//! decoding — is grounded on `row::scheduler::slurm::Slurm::submit`, with
//! the temp-script lifetime handed to `tempfile::NamedTempFile` so cleanup
//! happens on every exit path, including an early `?` return.

use std::fmt::Write as _;
use std::io::Write as _;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Stdio};

use log::{debug, trace};
use serde_json::Value;
use tempfile::NamedTempFile;

use crate::chunker::Chunk;
use crate::config::Configuration;
use crate::storage::Storage;
use crate::{Error, Result};

const FORBIDDEN_KEYS: [&str; 2] = ["output", "job-name"];

fn sbatch_value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render the `#SBATCH` preamble for one array submission.
fn render_preamble(
    job_name: &str,
    comment: &str,
    array_range: &str,
    output_template: &str,
    sbatch_options: &serde_json::Map<String, Value>,
) -> String {
    let mut preamble = String::with_capacity(256);
    let _ = writeln!(preamble, "#SBATCH --job-name={job_name}");
    let _ = writeln!(preamble, "#SBATCH --comment={comment}");
    let _ = writeln!(preamble, "#SBATCH --array={array_range}");
    let _ = writeln!(preamble, "#SBATCH --output={output_template}");
    for (key, value) in sbatch_options {
        if FORBIDDEN_KEYS.contains(&key.as_str()) || key == "comment" || key == "array" {
            continue;
        }
        let _ = writeln!(preamble, "#SBATCH --{key}={}", sbatch_value_to_string(value));
    }
    preamble
}

/// Render the full shell script body for one array: a task-index keyed map
/// from `SLURM_ARRAY_TASK_ID` to the experiment ids that task must run, and
/// a loop invoking the Preparation Hook per id followed by `eval` of the
/// command it prints.
fn render_script(
    preamble: &str,
    configuration: &Configuration,
    collection: &str,
    array: &[Chunk],
    with_sources: bool,
) -> String {
    let mut body = String::with_capacity(1024);
    body.push_str("#!/bin/bash\n");
    body.push_str(preamble);
    body.push('\n');
    body.push_str(&configuration.setup_command);
    body.push('\n');
    body.push_str("declare -A SEML_TASK_EXPERIMENTS\n");
    for (task_id, chunk) in array.iter().enumerate() {
        let ids = chunk
            .experiments
            .iter()
            .map(|e| e.id.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(body, "SEML_TASK_EXPERIMENTS[{task_id}]=\"{ids}\"");
    }
    body.push_str("for SEML_EXP_ID in ${SEML_TASK_EXPERIMENTS[$SLURM_ARRAY_TASK_ID]}; do\n");
    let mut prepare_args = format!("prepare-experiment {collection} \"$SEML_EXP_ID\"");
    if with_sources {
        let _ = write!(prepare_args, " --stored-sources-dir {}", configuration.tmp_directory);
    }
    let _ = writeln!(body, "  SEML_CMD=$(seml {prepare_args})");
    body.push_str("  SEML_STATUS=$?\n");
    body.push_str("  if [ $SEML_STATUS -eq 0 ]; then\n");
    body.push_str("    eval \"$SEML_CMD\"\n");
    body.push_str("  elif [ $SEML_STATUS -eq 3 ]; then\n");
    body.push_str("    echo \"experiment $SEML_EXP_ID not claimable, skipping\" >&2\n");
    body.push_str("  else\n");
    body.push_str("    echo \"experiment $SEML_EXP_ID not found\" >&2\n");
    body.push_str("  fi\n");
    body.push_str("done\n");
    body.push_str(&configuration.end_command);
    body.push('\n');
    body
}

fn parse_job_id(stdout: &str) -> Result<u64> {
    stdout
        .trim_end()
        .rsplit(char::is_whitespace)
        .next()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error::UnexpectedOutput("sbatch".into(), stdout.to_string()))
}

fn submission_failure_message(status: std::process::ExitStatus, stderr: &str) -> String {
    match status.code() {
        Some(code) => format!("sbatch exited with code {code}: {stderr}"),
        None => match status.signal() {
            Some(signal) => format!("sbatch was terminated by signal {signal}: {stderr}"),
            None => format!("sbatch was terminated by an unknown signal: {stderr}"),
        },
    }
}

/// Submit one array of chunks (all sharing a `batch_id`) to Slurm via
/// `sbatch`, then record the returned array id and each chunk's task index
/// on every experiment it contains.
pub fn dispatch_array(
    storage: &Storage,
    configuration: &Configuration,
    collection: &str,
    array: &[Chunk],
) -> Result<u64> {
    let first = array
        .first()
        .and_then(|c| c.experiments.first())
        .expect("an array always has at least one chunk with at least one experiment");

    let sbatch_options = first.slurm.sbatch_options.clone();
    for key in FORBIDDEN_KEYS {
        if sbatch_options.contains_key(key) {
            return Err(Error::ForbiddenSbatchKey(key.to_string()));
        }
    }
    if let Some(Value::String(comment)) = sbatch_options.get("comment") {
        if comment != collection {
            return Err(Error::ConfigError(format!(
                "sbatch `comment` ('{comment}') must match the collection name ('{collection}') or be omitted"
            )));
        }
    }

    let name = first.seml.name.clone().unwrap_or_else(|| "exp".to_string());
    let job_name = format!("{name}_{}", first.batch_id);
    let n = array.len();
    let array_range = match (n, first.slurm.max_simultaneous_jobs) {
        (1, None) => "0".to_string(),
        (1, Some(max)) => format!("0%{max}"),
        (_, None) => format!("0-{}", n - 1),
        (_, Some(max)) => format!("0-{}%{max}", n - 1),
    };
    let output_dir = first
        .seml
        .output_dir
        .clone()
        .unwrap_or_else(|| configuration.tmp_directory.clone());
    let output_template = format!("{output_dir}/{name}_%A_%a.out");
    let with_sources = first.seml.source_files.as_ref().is_some_and(|f| !f.is_empty());

    let preamble = render_preamble(&job_name, collection, &array_range, &output_template, &sbatch_options);
    let script = render_script(&preamble, configuration, collection, array, with_sources);

    debug!("Submitting array for batch {} with {n} task(s) via sbatch.", first.batch_id);

    let mut script_file = NamedTempFile::new_in(&configuration.tmp_directory).map_err(Error::IO)?;
    script_file.write_all(script.as_bytes()).map_err(Error::IO)?;
    script_file.flush().map_err(Error::IO)?;

    let output = Command::new("sbatch")
        .arg(script_file.path())
        .stdin(Stdio::null())
        .output()
        .map_err(|e| Error::SpawnProcess("sbatch".into(), e))?;

    // `NamedTempFile`'s `Drop` removes the script regardless of outcome below.

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(Error::SubmitAction(
            first.batch_id,
            "sbatch".to_string(),
            submission_failure_message(output.status, &stderr),
        ));
    }

    trace!("sbatch submission succeeded; parsing job id.");
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let job_id = parse_job_id(&stdout)?;

    for (task_id, chunk) in array.iter().enumerate() {
        let output_file = format!("{output_dir}/{name}_{job_id}_{task_id}.out");
        for exp in &chunk.experiments {
            storage.set_dispatched(exp.id, job_id as i64, task_id as i64, &sbatch_options, &output_file)?;
        }
    }

    Ok(job_id)
}

/// Interactive debug-only path: `srun <opts> seml <collection> start --local
/// --sacred-id <id> <flags>`, attached to the terminal. Re-enters the Local
/// Worker path inside the srun allocation.
pub fn run_srun(sbatch_options: &serde_json::Map<String, Value>, collection: &str, experiment_id: i64) -> Result<()> {
    let current_exe = std::env::current_exe().map_err(Error::FindCurrentExecutable)?;
    let current_exe = current_exe
        .to_str()
        .ok_or_else(|| Error::NonUTF8Path(current_exe.clone()))?
        .to_string();

    let mut command = Command::new("srun");
    for (key, value) in sbatch_options {
        if FORBIDDEN_KEYS.contains(&key.as_str()) {
            continue;
        }
        command.arg(format!("--{key}={}", sbatch_value_to_string(value)));
    }
    command
        .arg(current_exe)
        .arg(collection)
        .arg("start")
        .arg("--local")
        .arg("--sacred-id")
        .arg(experiment_id.to_string())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let status = command.status().map_err(|e| Error::SpawnProcess("srun".into(), e))?;
    if status.success() {
        Ok(())
    } else {
        let message = match status.code() {
            Some(code) => format!("srun exited with code {code}"),
            None => "srun was terminated by a signal".to_string(),
        };
        Err(Error::SubmitAction(experiment_id, "srun".to_string(), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Experiment, SemlInfo, SlurmInfo, Status};
    use serial_test::parallel;

    fn exp(id: i64, batch_id: i64) -> Experiment {
        Experiment {
            id,
            batch_id,
            status: Status::Pending,
            config: serde_json::json!({}),
            config_unresolved: None,
            seml: SemlInfo {
                name: Some("exp".to_string()),
                ..Default::default()
            },
            slurm: SlurmInfo {
                experiments_per_job: Some(2),
                ..Default::default()
            },
        }
    }

    #[test]
    #[parallel]
    fn parse_job_id_takes_last_token() {
        assert_eq!(parse_job_id("Submitted batch job 1234\n").unwrap(), 1234);
        assert_eq!(parse_job_id("1234").unwrap(), 1234);
    }

    #[test]
    #[parallel]
    fn parse_job_id_rejects_garbage() {
        assert!(parse_job_id("no job id here").is_err());
    }

    #[test]
    #[parallel]
    fn forbidden_keys_rejected_before_submission() {
        let storage = Storage::in_memory().unwrap();
        let configuration = Configuration::default();
        let mut e = exp(1, 1);
        e.slurm.sbatch_options.insert("output".to_string(), Value::String("x.log".to_string()));
        storage.save(&e).unwrap();

        let array = vec![Chunk {
            batch_id: 1,
            experiments: vec![e],
        }];
        let err = dispatch_array(&storage, &configuration, "mycollection", &array).unwrap_err();
        assert!(matches!(err, Error::ForbiddenSbatchKey(_)));
    }

    #[test]
    #[parallel]
    fn array_range_formatting() {
        let single = [Chunk { batch_id: 1, experiments: vec![exp(1, 1)] }];
        assert_eq!(single.len(), 1);

        let multi = vec![
            Chunk { batch_id: 1, experiments: vec![exp(1, 1)] },
            Chunk { batch_id: 1, experiments: vec![exp(2, 1)] },
        ];
        let preamble = render_preamble("name_1", "col", "0-1", "/tmp/x_%A_%a.out", &serde_json::Map::new());
        assert!(preamble.contains("#SBATCH --array=0-1"));
        assert_eq!(multi.len(), 2);
    }
}
