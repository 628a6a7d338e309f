// Part of seml.

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;
use rusqlite::Connection;
use serial_test::serial;

/// Build a fresh `seml.db` in `temp` with the schema `Storage::init_schema`
/// creates, seeded with one STAGED experiment per `(id, batch_id)` pair.
fn seed_database(temp: &TempDir, experiments: &[(i64, i64)]) -> std::path::PathBuf {
    let db_path = temp.child("seml.db");
    let conn = Connection::open(db_path.path()).unwrap();
    conn.execute_batch(
        "CREATE TABLE experiments (
            id INTEGER PRIMARY KEY,
            batch_id INTEGER NOT NULL,
            status TEXT NOT NULL,
            data TEXT NOT NULL
        );
        CREATE INDEX idx_experiments_status ON experiments(status);
        CREATE INDEX idx_experiments_batch_id ON experiments(batch_id);
        CREATE TABLE snapshots (
            hash TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            content BLOB NOT NULL,
            PRIMARY KEY (hash, relative_path)
        );",
    )
    .unwrap();

    for (id, batch_id) in experiments {
        let data = serde_json::json!({
            "id": id,
            "batch_id": batch_id,
            "status": "STAGED",
            "config": {"lr": 0.01},
            "config_unresolved": null,
            "seml": {"executable": "echo"},
            "slurm": {"experiments_per_job": 1},
        });
        conn.execute(
            "INSERT INTO experiments (id, batch_id, status, data) VALUES (?1, ?2, 'STAGED', ?3)",
            rusqlite::params![id, batch_id, data.to_string()],
        )
        .unwrap();
    }

    db_path.path().to_path_buf()
}

fn seml_cmd(temp: &TempDir, db_path: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("seml").unwrap();
    cmd.current_dir(temp.path())
        .env("SEML_HOME", "/not/a/path")
        .env_remove("SLURM_ARRAY_JOB_ID")
        .env_remove("SLURM_ARRAY_TASK_ID")
        .env_remove("SLURM_LOCALID")
        .env_remove("SLURM_PROCID")
        .env_remove("SLURM_NTASKS")
        .arg("--database")
        .arg(db_path);
    cmd
}

#[test]
#[serial]
fn help() {
    Command::cargo_bin("seml")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: seml"));
}

#[test]
#[serial]
fn requires_subcommand() {
    Command::cargo_bin("seml")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
#[serial]
fn print_command_resolved() {
    let temp = TempDir::new().unwrap();
    let db = seed_database(&temp, &[(1, 1)]);

    seml_cmd(&temp, &db)
        .args(["print-command", "mycollection", "--sacred-id", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("echo"))
        .stdout(predicate::str::contains("lr=0.01"));
}

#[test]
#[serial]
fn print_command_unresolved_uses_json_encoding() {
    let temp = TempDir::new().unwrap();
    let db = seed_database(&temp, &[(1, 1)]);

    seml_cmd(&temp, &db)
        .args(["print-command", "mycollection", "--sacred-id", "1", "--unresolved"])
        .assert()
        .success()
        .stdout(predicate::str::contains("lr=0.01"));
}

#[test]
#[serial]
fn prepare_experiment_not_found_exits_4() {
    let temp = TempDir::new().unwrap();
    let db = seed_database(&temp, &[]);

    seml_cmd(&temp, &db)
        .args(["prepare-experiment", "mycollection", "42"])
        .assert()
        .code(4);
}

#[test]
#[serial]
fn prepare_experiment_not_claimable_exits_3() {
    let temp = TempDir::new().unwrap();
    let db = seed_database(&temp, &[(1, 1)]);
    // Not PENDING, so the CAS predicate never matches.
    seml_cmd(&temp, &db)
        .args(["prepare-experiment", "mycollection", "1"])
        .assert()
        .code(3);
}

#[test]
#[serial]
fn start_local_debug_runs_one_experiment_unobserved() {
    let temp = TempDir::new().unwrap();
    let db = seed_database(&temp, &[(1, 1), (2, 1)]);

    seml_cmd(&temp, &db)
        .args(["start", "mycollection", "--local", "--debug"])
        .assert()
        .success();

    // Exactly one experiment should have been claimed and run; the other
    // stays PENDING, matching --debug's forced num_exps=1.
    let conn = Connection::open(&db).unwrap();
    let mut stmt = conn
        .prepare("SELECT status FROM experiments ORDER BY id")
        .unwrap();
    let statuses: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().any(|s| s != "PENDING"));
}

#[test]
#[serial]
fn start_rejects_local_only_flags_without_local() {
    let temp = TempDir::new().unwrap();
    let db = seed_database(&temp, &[(1, 1)]);

    seml_cmd(&temp, &db)
        .args(["start", "mycollection", "--steal-slurm"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--local"));
}

#[test]
#[serial]
fn start_no_staged_experiments_is_a_no_op() {
    let temp = TempDir::new().unwrap();
    let db = seed_database(&temp, &[]);

    seml_cmd(&temp, &db)
        .args(["start", "mycollection", "--local"])
        .assert()
        .success();
}
