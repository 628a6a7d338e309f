// Part of seml.

#![warn(clippy::pedantic)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

mod cli;

use cli::{ColorMode, Commands, Options};
use seml::config::Configuration;
use seml::storage::Storage;

/// Resolve the database path: `--database`/`SEML_DATABASE` (handled by
/// `clap`'s `env` attribute), else a `seml.db` next to the current
/// directory's configuration search root.
fn resolve_database_path(options: &Options) -> PathBuf {
    options
        .global
        .database
        .clone()
        .unwrap_or_else(|| PathBuf::from(seml::DATABASE_FILE_NAME))
}

/// Parses arguments, runs the requested verb, and returns the process exit
/// code. `prepare-experiment` is the only verb with a non-1 failure code
/// (3/4, per the dispatch contract); every other verb's failures exit 1.
fn run() -> ExitCode {
    let options = Options::parse();

    match options.global.color {
        ColorMode::Never => console::set_colors_enabled(false),
        ColorMode::Always => console::set_colors_enabled(true),
        ColorMode::Auto => (),
    }

    let log_level = match options.verbose.log_level_filter() {
        clap_verbosity_flag::LevelFilter::Off => "off",
        clap_verbosity_flag::LevelFilter::Error => "error",
        clap_verbosity_flag::LevelFilter::Warn => "warn",
        clap_verbosity_flag::LevelFilter::Info => "info",
        clap_verbosity_flag::LevelFilter::Debug => "debug",
        clap_verbosity_flag::LevelFilter::Trace => "trace",
    };
    let env = env_logger::Env::default().filter_or("SEML_LOG", log_level);
    env_logger::Builder::from_env(env).format_timestamp(None).init();

    let configuration = match Configuration::open() {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let database_path = resolve_database_path(&options);
    let storage = match Storage::open(&database_path) {
        Ok(s) => s,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match options.command {
        Commands::Start(args) => match cli::start::run(&storage, &configuration, &args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e}");
                ExitCode::FAILURE
            }
        },
        Commands::PrepareExperiment(args) => match cli::prepare_experiment::run(&storage, &configuration, &args) {
            Ok(code) => ExitCode::from(code as u8),
            Err(e) => {
                error!("{e}");
                ExitCode::FAILURE
            }
        },
        Commands::PrintCommand(args) => match cli::print_command::run(&storage, &configuration, &args) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn main() -> ExitCode {
    run()
}
