// Part of seml.

#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::must_use_candidate)]
#![warn(clippy::format_push_string)]

pub mod chunker;
pub mod config;
pub mod materializer;
pub mod orchestrator;
pub mod prepare;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod worker;

use std::path::PathBuf;

/// Name of the SQLite database file inside a project directory.
pub const DATABASE_FILE_NAME: &str = "seml.db";

/// Name of the project configuration file.
pub const CONFIG_FILE_NAME: &str = "seml.toml";

/// Errors that may be encountered when using the seml crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // I/O errors
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Unable to read '{0}': {1}")]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("Unable to write '{0}': {1}")]
    FileWrite(PathBuf, #[source] std::io::Error),

    #[error("Unable to create directory '{0}': {1}")]
    DirectoryCreate(PathBuf, #[source] std::io::Error),

    #[error("Non-UTF-8 path '{0}'")]
    NonUTF8Path(PathBuf),

    #[error("No home directory")]
    NoHome,

    #[error("Unable to find the path to the current executable: {0}")]
    FindCurrentExecutable(#[source] std::io::Error),

    #[error("Unable to spawn '{0}': {1}")]
    SpawnProcess(String, #[source] std::io::Error),

    // serialization errors
    #[error("Unable to parse '{0}':\n{1}")]
    TOMLParse(PathBuf, #[source] toml::de::Error),

    #[error("Unable to parse JSON: {0}")]
    JSONParse(#[source] serde_json::Error),

    // storage errors (spec §7: MongoDBError / StorageError)
    #[error("Storage error: {0}")]
    StorageError(#[from] rusqlite::Error),

    #[error("Experiment {0} not found.")]
    ExperimentNotFound(i64),

    // config / argument errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Argument error: {0}")]
    ArgumentError(String),

    #[error("Refusing to run a compute experiment on a login node. Use Slurm or a compute node.")]
    LoginNodeRefused,

    // materializer errors
    #[error("No executable found for experiment {0}.")]
    MissingExecutable(i64),

    #[error("Interpolation reference '{0}' not found while materializing experiment {1}.")]
    InterpolationNotFound(String, i64),

    #[error("Interpolation source '{0}' is not in the configured whitelist.")]
    InterpolationNotWhitelisted(String),

    // dispatch errors
    #[error("Error submitting batch {0} via {1}: {2}")]
    SubmitAction(i64, String, String),

    #[error("Unexpected output from {0}: {1}")]
    UnexpectedOutput(String, String),

    #[error("Can't set sbatch `{0}` explicitly; seml manages that field.")]
    ForbiddenSbatchKey(String),

    // worker errors
    #[error("Error executing experiment {0}: {1}")]
    ChildFailure(i64, String),

    #[error("Interrupted")]
    Interrupted,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JSONParse(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
