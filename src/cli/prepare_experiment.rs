// Part of seml.

use clap::Args;

use seml::config::Configuration;
use seml::prepare::{self, Outcome, PrepareOptions};
use seml::storage::Storage;
use seml::Result;

/// Arguments for `seml prepare-experiment`.
#[derive(Args, Debug)]
pub struct PrepareExperiment {
    /// Name of the collection the experiment belongs to.
    pub collection: String,

    /// Id of the experiment to claim and prepare.
    pub id: i64,

    /// Log the claimed experiment's final command at info level.
    #[arg(long)]
    pub verbose: bool,

    /// Claim the experiment without observing it with Sacred.
    #[arg(long)]
    pub unobserved: bool,

    /// Attach a post-mortem debugger on failure.
    #[arg(long)]
    pub post_mortem: bool,

    /// Restore the experiment's snapshotted sources into this directory
    /// before printing the command.
    #[arg(long, value_name = "PATH")]
    pub stored_sources_dir: Option<std::path::PathBuf>,

    /// Wait for a `debugpy` client to attach before running.
    #[arg(long)]
    pub debug_server: bool,
}

/// Run the preparation hook and return its exit code. The caller (`main`)
/// is responsible for actually exiting the process with this code.
pub fn run(storage: &Storage, configuration: &Configuration, args: &PrepareExperiment) -> Result<i32> {
    let options = PrepareOptions {
        collection: args.collection.clone(),
        verbose: args.verbose,
        unobserved: args.unobserved,
        post_mortem: args.post_mortem,
        stored_sources_dir: args.stored_sources_dir.clone(),
        debug_server: args.debug_server,
    };
    let outcome = prepare::prepare(storage, configuration, args.id, &options)?;
    let exit_code = outcome.exit_code();
    if let Outcome::Ready { command, debug_attach_url } = outcome {
        if !command.is_empty() {
            if args.verbose {
                log::info!("prepared experiment {}: {command}", args.id);
            }
            if let Some(url) = debug_attach_url {
                eprintln!("Attach your debugger at: {url}");
            }
            println!("{command}");
        }
    }
    Ok(exit_code)
}
