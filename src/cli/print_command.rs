// Part of seml.

use clap::Args;

use seml::config::Configuration;
use seml::materializer::{self, MaterializeOptions};
use seml::storage::{Filter, Storage};
use seml::Result;

/// Arguments for `seml print-command`.
#[derive(Args, Debug)]
pub struct PrintCommand {
    /// Name of the collection to print commands for.
    pub collection: String,

    /// Only print the command for this experiment id.
    #[arg(long, value_name = "ID")]
    pub sacred_id: Option<i64>,

    /// Only print commands for experiments in this batch.
    #[arg(long, value_name = "ID")]
    pub batch_id: Option<i64>,

    /// Use each experiment's unresolved config, JSON-encoded, instead of
    /// the resolved Python-repr-encoded command that would actually run.
    #[arg(long)]
    pub unresolved: bool,

    /// Print `${a.b.c}` references verbatim instead of expanding them.
    #[arg(long)]
    pub no_resolve_interpolations: bool,
}

pub fn run(storage: &Storage, configuration: &Configuration, args: &PrintCommand) -> Result<()> {
    let filter = Filter {
        id: args.sacred_id,
        batch_id: args.batch_id,
        statuses: None,
        slurm_array_present: None,
        limit: None,
    };
    let experiments = storage.find(&filter)?;

    let options = MaterializeOptions {
        resolved: !args.unresolved,
        use_json_encoding: args.unresolved,
        resolve_interpolations: !args.no_resolve_interpolations,
        db_collection: Some(args.collection.clone()),
        ..Default::default()
    };

    for experiment in &experiments {
        let command = materializer::materialize(configuration, experiment, &options)?;
        println!("{}", command.full_command);
    }
    Ok(())
}
