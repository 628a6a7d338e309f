//! Storage Gateway — typed, atomic operations against the experiment
//! collection.
//!
//! Grounded on `hiq-lab-arvak/crates/arvak-sched/src/persistence/sqlite_store.rs`:
//! documents are stored as a JSON blob (`data`) alongside denormalized,
//! indexed columns (`status`, `batch_id`) so `find`/`count` can build a
//! `WHERE` clause without deserializing every row. Unlike that store's
//! load-modify-save `update_status`, `claim_for_run` here is a single
//! `UPDATE ... WHERE ... RETURNING data` — SQLite's single-writer
//! transaction model makes this the CAS the spec's atomic-claim property
//! requires, without needing an external lock.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::{Error, Result};

/// The closed set of states an experiment document may be in (distilled
/// spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Staged,
    Queued,
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
    Killed,
}

impl Status {
    /// States the dispatch engine must never overwrite (testable property
    /// 7: "No terminal overwrite").
    pub const TERMINAL: [Status; 4] = [
        Status::Completed,
        Status::Failed,
        Status::Interrupted,
        Status::Killed,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Staged => "STAGED",
            Status::Queued => "QUEUED",
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Interrupted => "INTERRUPTED",
            Status::Killed => "KILLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Status> {
        match s.to_ascii_uppercase().as_str() {
            "STAGED" => Some(Status::Staged),
            "QUEUED" => Some(Status::Queued),
            "PENDING" => Some(Status::Pending),
            "RUNNING" => Some(Status::Running),
            "COMPLETED" => Some(Status::Completed),
            "FAILED" => Some(Status::Failed),
            "INTERRUPTED" => Some(Status::Interrupted),
            "KILLED" => Some(Status::Killed),
            _ => None,
        }
    }
}

/// The `slurm` sub-record (distilled spec §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlurmInfo {
    #[serde(default)]
    pub sbatch_options: serde_json::Map<String, Value>,
    pub experiments_per_job: Option<u32>,
    pub max_simultaneous_jobs: Option<u32>,
    pub array_id: Option<i64>,
    pub task_id: Option<i64>,
}

/// The `seml` sub-record (distilled spec §3, supplemented with `name` per
/// `original_source/start.py::get_exp_name`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemlInfo {
    pub executable: Option<String>,
    pub working_dir: Option<String>,
    pub conda_environment: Option<String>,
    pub output_dir: Option<String>,
    /// Content-addressed references into the Source Snapshot Store
    /// (relative path + SHA-256 hash per captured file).
    pub source_files: Option<Vec<crate::snapshot::SnapshottedFile>>,
    pub description: Option<String>,
    pub name: Option<String>,
    pub command: Option<String>,
    pub command_unresolved: Option<String>,
    pub output_file: Option<String>,
    pub temp_dir: Option<String>,
}

/// The experiment document — the single authoritative record (distilled
/// spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub batch_id: i64,
    pub status: Status,
    #[serde(default)]
    pub config: Value,
    pub config_unresolved: Option<Value>,
    #[serde(default)]
    pub seml: SemlInfo,
    #[serde(default)]
    pub slurm: SlurmInfo,
}

/// Context under which a claim is attempted — the two atomic-update
/// predicates named in the distilled spec §4.1, made an explicit type so
/// the caller cannot accidentally pick the wrong one (Design Notes: "the
/// two-variant predicate must be expressed as two distinct atomic-update
/// templates").
#[derive(Debug, Clone, Copy)]
pub enum ClaimContext {
    /// Running inside the Slurm task that was originally dispatched for
    /// this experiment.
    SlurmTask { array_id: i64, task_id: i64 },
    /// Local worker (including a "stealing" worker) or an interactive
    /// `srun` invocation.
    Local,
}

/// A query filter shared by `find`, `find_one`, `count`, and `update_many`.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub id: Option<i64>,
    pub batch_id: Option<i64>,
    pub statuses: Option<Vec<Status>>,
    /// `Some(true)`: only documents with `slurm.array_id` present.
    /// `Some(false)`: only documents without it.
    pub slurm_array_present: Option<bool>,
    pub limit: Option<i64>,
}

impl Filter {
    fn build_where(&self) -> (String, Vec<rusqlite::types::Value>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(id) = self.id {
            clauses.push("id = ?".to_string());
            values.push(rusqlite::types::Value::Integer(id));
        }
        if let Some(batch_id) = self.batch_id {
            clauses.push("batch_id = ?".to_string());
            values.push(rusqlite::types::Value::Integer(batch_id));
        }
        if let Some(statuses) = &self.statuses {
            let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
            clauses.push(format!("status IN ({placeholders})"));
            for s in statuses {
                values.push(rusqlite::types::Value::Text(s.as_str().to_string()));
            }
        }
        if let Some(present) = self.slurm_array_present {
            if present {
                clauses.push("json_extract(data, '$.slurm.array_id') IS NOT NULL".to_string());
            } else {
                clauses.push("json_extract(data, '$.slurm.array_id') IS NULL".to_string());
            }
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        (where_clause, values)
    }
}

/// Synchronous SQLite-backed Storage Gateway.
///
/// One database file per project, matching the spec's "one collection per
/// project" — accessed synchronously because the dispatch engine is
/// single-threaded, blocking code (no tokio runtime is pulled in just to
/// await SQL calls that return in microseconds).
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open (creating if necessary) the database at `path`.
    pub fn open(path: &Path) -> Result<Storage> {
        let conn = Connection::open(path)?;
        let storage = Storage { conn };
        storage.init_schema()?;
        Ok(storage)
    }

    /// Open an in-memory database, used by tests.
    pub fn in_memory() -> Result<Storage> {
        let conn = Connection::open_in_memory()?;
        let storage = Storage { conn };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS experiments (
                id INTEGER PRIMARY KEY,
                batch_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_experiments_status ON experiments(status);
            CREATE INDEX IF NOT EXISTS idx_experiments_batch_id ON experiments(batch_id);

            CREATE TABLE IF NOT EXISTS snapshots (
                hash TEXT NOT NULL,
                relative_path TEXT NOT NULL,
                content BLOB NOT NULL,
                PRIMARY KEY (hash, relative_path)
            );",
        )?;
        Ok(())
    }

    /// Insert or fully replace a document. Used by the staging pipeline
    /// (out of scope here) and by tests to seed fixtures.
    pub fn save(&self, exp: &Experiment) -> Result<()> {
        let data = serde_json::to_string(exp)?;
        self.conn.execute(
            "INSERT INTO experiments (id, batch_id, status, data) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET batch_id = ?2, status = ?3, data = ?4",
            params![exp.id, exp.batch_id, exp.status.as_str(), data],
        )?;
        Ok(())
    }

    fn row_to_experiment(row: &Row) -> rusqlite::Result<Experiment> {
        let data: String = row.get(0)?;
        serde_json::from_str(&data)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
    }

    /// `find(filter) -> sequence` (distilled spec §4.1).
    pub fn find(&self, filter: &Filter) -> Result<Vec<Experiment>> {
        let (where_clause, values) = filter.build_where();
        let limit_clause = match filter.limit {
            Some(n) => format!(" LIMIT {n}"),
            None => String::new(),
        };
        let sql = format!("SELECT data FROM experiments {where_clause} ORDER BY id{limit_clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_experiment)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// `find_one(filter)` (distilled spec §4.1).
    pub fn find_one(&self, filter: &Filter) -> Result<Option<Experiment>> {
        let mut narrowed = filter.clone();
        narrowed.limit = Some(1);
        Ok(self.find(&narrowed)?.into_iter().next())
    }

    /// `count(filter)` (distilled spec §4.1).
    pub fn count(&self, filter: &Filter) -> Result<i64> {
        let (where_clause, values) = filter.build_where();
        let sql = format!("SELECT COUNT(*) FROM experiments {where_clause}");
        let mut stmt = self.conn.prepare(&sql)?;
        let count: i64 = stmt.query_row(params_from_iter(values), |r| r.get(0))?;
        Ok(count)
    }

    /// `claim_for_run(id, unobserved) -> document | null` (distilled spec
    /// §4.1). Atomic compare-and-set: exactly one concurrent caller against
    /// the same `id` observes a changed row (testable property 1).
    pub fn claim_for_run(
        &self,
        id: i64,
        unobserved: bool,
        context: ClaimContext,
    ) -> Result<Option<Experiment>> {
        if unobserved {
            // Returns the document without mutation.
            return self.find_one(&Filter {
                id: Some(id),
                ..Default::default()
            });
        }

        let sql = match context {
            ClaimContext::SlurmTask { .. } => {
                "UPDATE experiments
                 SET status = 'RUNNING', data = json_set(data, '$.status', 'RUNNING')
                 WHERE id = ?1
                   AND (
                        status = 'PENDING'
                        OR (
                            json_extract(data, '$.slurm.array_id') = ?2
                            AND json_extract(data, '$.slurm.task_id') = ?3
                        )
                   )
                 RETURNING data"
            }
            ClaimContext::Local => {
                "UPDATE experiments
                 SET status = 'RUNNING',
                     data = json_set(json_set(json_set(data, '$.status', 'RUNNING'),
                                               '$.slurm.array_id', NULL),
                                     '$.slurm.task_id', NULL)
                 WHERE id = ?1 AND status = 'PENDING'
                 RETURNING data"
            }
        };

        let mut stmt = self.conn.prepare(sql)?;
        let result = match context {
            ClaimContext::SlurmTask { array_id, task_id } => stmt
                .query_row(params![id, array_id, task_id], Self::row_to_experiment)
                .optional()?,
            ClaimContext::Local => stmt
                .query_row(params![id], Self::row_to_experiment)
                .optional()?,
        };
        Ok(result)
    }

    /// `update_many(filter, update)`: bulk status transition matching an
    /// arbitrary filter (distilled spec §4.1). Never touches a document
    /// whose current status is terminal (invariant 4).
    pub fn update_many(&self, filter: &Filter, new_status: Status) -> Result<usize> {
        let (where_clause, mut values) = filter.build_where();
        let terminal_guard = Status::TERMINAL
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = if where_clause.is_empty() {
            format!("UPDATE experiments SET status = ?1, data = json_set(data, '$.status', ?1) WHERE status NOT IN ({terminal_guard})")
        } else {
            format!(
                "UPDATE experiments SET status = ?1, data = json_set(data, '$.status', ?1) {where_clause} AND status NOT IN ({terminal_guard})"
            )
        };
        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(new_status.as_str().to_string())];
        params.append(&mut values);
        let affected = self.conn.execute(&sql, params_from_iter(params))?;
        Ok(affected)
    }

    /// `bulk_update(ops)`: transition an explicit list of ids (distilled
    /// spec §4.1 and `original_source/start.py::prepare_staged_experiments`'s
    /// `num_exps > 0` branch, which updates only the chosen subset).
    pub fn bulk_update(&self, ids: &[i64], new_status: Status) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let terminal_guard = Status::TERMINAL
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE experiments SET status = ?1, data = json_set(data, '$.status', ?1)
             WHERE id IN ({placeholders}) AND status NOT IN ({terminal_guard})"
        );
        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(new_status.as_str().to_string())];
        params.extend(ids.iter().map(|id| rusqlite::types::Value::Integer(*id)));
        let affected = self.conn.execute(&sql, params_from_iter(params))?;
        Ok(affected)
    }

    /// `set_dispatched(id, array_id, task_id, sbatch_options, output_file)`
    /// (distilled spec §4.1), called once per experiment right after a
    /// `sbatch` submission succeeds.
    pub fn set_dispatched(
        &self,
        id: i64,
        array_id: i64,
        task_id: i64,
        sbatch_options: &serde_json::Map<String, Value>,
        output_file: &str,
    ) -> Result<()> {
        let mut exp = self
            .find_one(&Filter {
                id: Some(id),
                ..Default::default()
            })?
            .ok_or(Error::ExperimentNotFound(id))?;

        if exp.status.is_terminal() {
            return Ok(());
        }

        exp.status = Status::Pending;
        exp.slurm.array_id = Some(array_id);
        exp.slurm.task_id = Some(task_id);
        exp.slurm.sbatch_options = sbatch_options.clone();
        exp.seml.output_file = Some(output_file.to_string());
        self.save(&exp)
    }

    /// Store a snapshot blob under its content hash and path, skipping the
    /// write if an entry already exists for that `(hash, relative_path)`
    /// pair — the Source Snapshot Store's restore/store operations are
    /// content-addressed and therefore naturally idempotent.
    pub fn store_snapshot_blob(&self, hash: &str, relative_path: &str, content: &[u8]) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO snapshots (hash, relative_path, content) VALUES (?1, ?2, ?3)",
            params![hash, relative_path, content],
        )?;
        Ok(())
    }

    /// Load a previously stored snapshot blob, if present.
    pub fn load_snapshot_blob(&self, hash: &str, relative_path: &str) -> Result<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT content FROM snapshots WHERE hash = ?1 AND relative_path = ?2",
                params![hash, relative_path],
                |r| r.get(0),
            )
            .optional()
            .map_err(Error::from)
    }
}
