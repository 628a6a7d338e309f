// Part of seml.

pub mod prepare_experiment;
pub mod print_command;
pub mod start;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};

/// SEML dispatches and tracks Sacred experiments on Slurm clusters and
/// local workers.
#[derive(Parser, Debug)]
#[command(name = "seml", version, about, long_about = None)]
pub struct Options {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOptions {
    /// When to print colored output.
    #[arg(long, value_name = "WHEN", value_enum, default_value_t = ColorMode::Auto, global = true, env = "SEML_COLOR", display_order = 2)]
    pub color: ColorMode,

    /// Path to the project's SQLite database file.
    #[arg(long, value_name = "PATH", global = true, env = "SEML_DATABASE", display_order = 2)]
    pub database: Option<std::path::PathBuf>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Transition staged experiments to PENDING and dispatch them.
    ///
    /// `seml start` selects staged experiments (optionally narrowed by
    /// `--sacred-id`/`--batch-id`), transitions them to PENDING, and either
    /// submits Slurm array jobs or runs a local worker loop.
    ///
    /// EXAMPLES
    ///
    /// * Run one staged experiment locally:
    ///
    ///   seml start mycollection --local -n 1
    ///
    /// * Dispatch all staged experiments to Slurm:
    ///
    ///   seml start mycollection
    ///
    /// * Attach a debugger to the next staged experiment:
    ///
    ///   seml start mycollection --local --debug
    ///
    Start(start::Start),

    /// Claim an experiment and print the command to run it.
    ///
    /// Invoked from inside a Slurm task template; not intended for direct
    /// interactive use. Exits 3 if the experiment is not claimable, 4 if it
    /// does not exist.
    PrepareExperiment(prepare_experiment::PrepareExperiment),

    /// Print the materialized command for matching experiments without
    /// running them.
    ///
    /// EXAMPLES
    ///
    /// * Print the resolved command for experiment 42:
    ///
    ///   seml print-command mycollection --sacred-id 42
    ///
    PrintCommand(print_command::PrintCommand),
}
