//! Command Materializer — turns an experiment document's config into the
//! shell command line that actually runs it.
//!
//! Semantics are grounded on `original_source/src/seml/start.py`:
//! `get_command_from_exp` (interpreter/executable/overrides assembly),
//! `value_to_string` (Python-repr-compatible scalar encoding, since the
//! target process is a Sacred experiment that parses `key=value` the way
//! Python's `ast.literal_eval`/`json.loads` would), `get_shell_command`
//! (shell-quoted assembly), and `_generate_debug_attach_url`. The
//! `${a.b.c}` interpolation mechanism reuses the fallible
//! regex-`replace_all` idiom from
//! `row::scheduler::bash::BashScriptBuilder::substitute`, adapted from
//! row's `{...}`/JSON-pointer syntax to SEML's dotted-path syntax.

use std::net::TcpListener;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use shell_quote::{Bash, Quote};

use crate::config::Configuration;
use crate::storage::Experiment;
use crate::{Error, Result};

/// Flags that shape materialization — the Sacred command-line switches
/// plus the debug-server knobs from `original_source/start.py::start_experiments`.
#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    /// Use `config` (default: `false` uses `config_unresolved` when present).
    pub resolved: bool,
    /// Suppress the default `--force` flag (Sacred otherwise refuses to
    /// overwrite an existing run id).
    pub verbose: bool,
    pub unobserved: bool,
    pub post_mortem: bool,
    pub debug: bool,
    pub debug_server: bool,
    pub db_collection: Option<String>,
    /// Expand `${a.b.c}` references before encoding overrides. `print-command
    /// --no-resolve-interpolations` sets this to `false` to show the raw,
    /// uninterpolated config instead.
    pub resolve_interpolations: bool,
    /// Encode override values as JSON instead of Python-repr. `print-command
    /// --unresolved` pairs this with `resolved: false` for IDE consumption.
    pub use_json_encoding: bool,
}

impl MaterializeOptions {
    /// The defaults used when actually running an experiment: interpolate
    /// and encode the way Sacred's Python CLI parser expects.
    pub fn for_execution() -> Self {
        Self {
            resolve_interpolations: true,
            use_json_encoding: false,
            ..Default::default()
        }
    }
}

/// The materialized command, ready to hand to a process spawn.
#[derive(Debug, Clone)]
pub struct MaterializedCommand {
    pub interpreter: String,
    pub full_command: String,
    pub debug_attach_url: Option<String>,
}

fn interpolation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([a-zA-Z0-9_]+(?:\.[a-zA-Z0-9_]+)*)\}").expect("valid regex"))
}

/// Resolve a dotted path (`a.b.c`) against a JSON context built from the
/// whitelisted sources.
fn resolve_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn value_to_interpolated_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace every `${a.b.c}` occurrence in `input` with the resolved value
/// from `context`, restricted to sources named in `whitelist`.
fn interpolate_str(input: &str, context: &Value, whitelist: &[String], exp_id: i64) -> Result<String> {
    let re = interpolation_regex();
    let mut last_end = 0;
    let mut out = String::with_capacity(input.len());
    for m in re.captures_iter(input) {
        let whole = m.get(0).expect("group 0 always present");
        let path = &m[1];
        let root = path.split('.').next().expect("non-empty path");
        if !whitelist.iter().any(|w| w == root) {
            return Err(Error::InterpolationNotWhitelisted(root.to_string()));
        }
        let resolved = resolve_path(context, path)
            .ok_or_else(|| Error::InterpolationNotFound(path.to_string(), exp_id))?;
        out.push_str(&input[last_end..whole.start()]);
        out.push_str(&value_to_interpolated_string(resolved));
        last_end = whole.end();
    }
    out.push_str(&input[last_end..]);
    Ok(out)
}

/// Recursively interpolate every string leaf of `value`.
fn interpolate_value(value: &Value, context: &Value, whitelist: &[String], exp_id: i64) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(interpolate_str(s, context, whitelist, exp_id)?)),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_value(item, context, whitelist, exp_id)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate_value(v, context, whitelist, exp_id)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// `value_to_string` (`original_source/start.py`): encode a scalar the way
/// Sacred's command-line override parser expects — Python-literal booleans
/// and `None`, single-quoted strings, JSON for everything else.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        Value::Bool(b) => if *b { "True" } else { "False" }.to_string(),
        Value::Null => "None".to_string(),
        other => other.to_string(),
    }
}

/// `get_config_overrides` (`original_source/start.py`): `key=value` tokens
/// for every top-level config field, encoded with the caller's chosen
/// scalar encoder (Python-repr or JSON).
fn config_overrides_with(config: &Value, encode: fn(&Value) -> String) -> Vec<String> {
    let Some(map) = config.as_object() else {
        return Vec::new();
    };
    map.iter().map(|(k, v)| format!("{k}={}", encode(v))).collect()
}

/// `get_command_from_exp`'s `generate_named_configs` split
/// (`original_source/start.py`): in unresolved mode, a top-level key
/// prefixed with `prefix` selects a Sacred named config rather than setting
/// a value. Returns `(remaining config, named-config bare tokens)`.
fn split_named_configs(config: &Value, resolved: bool, prefix: &str) -> (Value, Vec<String>) {
    let Some(map) = config.as_object() else {
        return (config.clone(), Vec::new());
    };
    if resolved {
        return (config.clone(), Vec::new());
    }
    let mut remaining = serde_json::Map::with_capacity(map.len());
    let mut named_configs = Vec::new();
    for (k, v) in map {
        if let Some(name) = k.strip_prefix(prefix) {
            named_configs.push(name.to_string());
        } else {
            remaining.insert(k.clone(), v.clone());
        }
    }
    (Value::Object(remaining), named_configs)
}

/// Bind an ephemeral localhost port, matching `find_free_port`'s
/// bind-then-release technique.
fn find_free_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(Error::IO)?;
    Ok(listener.local_addr().map_err(Error::IO)?.port())
}

/// `_generate_debug_attach_url` (`original_source/start.py`): a
/// `vscode://` deep link the user can click to attach a debugger.
fn debug_attach_url(host: &str, port: u16) -> String {
    format!("vscode://ms-python.debugpy/attach?host={host}&port={port}")
}

/// Build the full shell command for `experiment`.
///
/// Implements `get_command_from_exp` + `get_shell_command`: selects
/// `config` or `config_unresolved`, interpolates `${...}` references,
/// injects the synthetic `db_collection`/`overwrite` overrides, assembles
/// Sacred flags, and shell-quotes every token via `shell-quote`.
pub fn materialize(
    configuration: &Configuration,
    experiment: &Experiment,
    options: &MaterializeOptions,
) -> Result<MaterializedCommand> {
    let executable = experiment
        .seml
        .executable
        .clone()
        .ok_or(Error::MissingExecutable(experiment.id))?;

    let source_config = if options.resolved {
        &experiment.config
    } else {
        experiment
            .config_unresolved
            .as_ref()
            .unwrap_or(&experiment.config)
    };

    let context = serde_json::json!({
        "config": experiment.config,
        "config_unresolved": experiment.config_unresolved.clone().unwrap_or(Value::Null),
    });

    let interpolated = if options.resolve_interpolations {
        interpolate_value(
            source_config,
            &context,
            &configuration.interpolation_whitelist,
            experiment.id,
        )?
    } else {
        source_config.clone()
    };

    // In unresolved mode, keys prefixed with the configured named-config
    // token (e.g. `+my_variant`) select a Sacred named config instead of
    // setting a value; they become bare tokens in argv_tail rather than
    // `key=value` pairs, and only unresolved mode has them at all (resolved
    // configs have already had named configs applied by the staging
    // pipeline).
    let (config_map, named_configs) = split_named_configs(&interpolated, options.resolved, &configuration.named_config_prefix);

    let encode: fn(&Value) -> String = if options.use_json_encoding {
        |v| v.to_string()
    } else {
        value_to_string
    };

    let mut overrides = config_overrides_with(&config_map, encode);
    if let Some(collection) = &options.db_collection {
        overrides.push(format!("db_collection={}", encode(&Value::String(collection.clone()))));
    }
    if !options.unobserved {
        overrides.push(format!("overwrite={}", experiment.id));
    }
    overrides.extend(named_configs);

    let mut flags = Vec::new();
    if !options.verbose {
        flags.push("--force".to_string());
    }
    if options.unobserved {
        flags.push("--unobserved".to_string());
    }
    if options.post_mortem {
        flags.push("--pdb".to_string());
    }
    if options.debug {
        flags.push("--debug".to_string());
    }

    let (interpreter, debug_attach_url) = if options.debug_server {
        let port = find_free_port()?;
        let interpreter = format!("python -m debugpy --listen 0.0.0.0:{port} --wait-for-client");
        (interpreter, Some(debug_attach_url("localhost", port)))
    } else {
        ("python".to_string(), None)
    };

    let mut tokens: Vec<String> = vec![executable.clone(), "with".to_string()];
    tokens.extend(overrides);
    tokens.extend(flags);

    let quoted_tokens: Vec<String> = tokens
        .iter()
        .map(|t| <Bash as Quote<String>>::quote(t))
        .collect();

    let full_command = format!("{interpreter} {}", quoted_tokens.join(" "));

    Ok(MaterializedCommand {
        interpreter,
        full_command,
        debug_attach_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SemlInfo, SlurmInfo, Status};
    use serial_test::parallel;

    fn base_experiment() -> Experiment {
        Experiment {
            id: 5,
            batch_id: 1,
            status: Status::Pending,
            config: serde_json::json!({"lr": 0.01, "name": "run-a", "flag": true}),
            config_unresolved: None,
            seml: SemlInfo {
                executable: Some("train.py".to_string()),
                ..Default::default()
            },
            slurm: SlurmInfo::default(),
        }
    }

    #[test]
    #[parallel]
    fn basic_command_has_overwrite_and_overrides() {
        let config = Configuration::default();
        let exp = base_experiment();
        let cmd = materialize(&config, &exp, &MaterializeOptions::for_execution()).unwrap();
        assert!(cmd.full_command.contains("train.py"));
        assert!(cmd.full_command.contains("overwrite=5"));
        assert!(cmd.full_command.contains("lr=0.01"));
        assert!(cmd.full_command.contains("flag=True"));
        assert!(cmd.full_command.contains("train.py with"));
        let overrides_pos = cmd.full_command.find("lr=0.01").unwrap();
        let force_pos = cmd.full_command.find("--force").unwrap();
        assert!(overrides_pos < force_pos, "overrides must precede flags: {}", cmd.full_command);
    }

    #[test]
    #[parallel]
    fn missing_executable_errors() {
        let config = Configuration::default();
        let mut exp = base_experiment();
        exp.seml.executable = None;
        let err = materialize(&config, &exp, &MaterializeOptions::for_execution()).unwrap_err();
        assert!(matches!(err, Error::MissingExecutable(5)));
    }

    #[test]
    #[parallel]
    fn interpolation_resolves_against_whitelist() {
        let config = Configuration::default();
        let mut exp = base_experiment();
        exp.config = serde_json::json!({"lr": 0.01, "tag": "prefix-${config.lr}"});
        let cmd = materialize(&config, &exp, &MaterializeOptions::for_execution()).unwrap();
        assert!(cmd.full_command.contains("prefix-0.01"));
    }

    #[test]
    #[parallel]
    fn interpolation_outside_whitelist_errors() {
        let config = Configuration::default();
        let mut exp = base_experiment();
        exp.config = serde_json::json!({"tag": "${slurm.array_id}"});
        let err = materialize(&config, &exp, &MaterializeOptions::for_execution()).unwrap_err();
        assert!(matches!(err, Error::InterpolationNotWhitelisted(_)));
    }

    #[test]
    #[parallel]
    fn debug_server_produces_attach_url() {
        let config = Configuration::default();
        let exp = base_experiment();
        let options = MaterializeOptions {
            debug_server: true,
            ..Default::default()
        };
        let cmd = materialize(&config, &exp, &options).unwrap();
        assert!(cmd.interpreter.contains("debugpy"));
        assert!(cmd.debug_attach_url.unwrap().starts_with("vscode://"));
    }

    #[test]
    #[parallel]
    fn sacred_flags_are_appended() {
        let config = Configuration::default();
        let exp = base_experiment();
        let options = MaterializeOptions {
            unobserved: true,
            ..Default::default()
        };
        let cmd = materialize(&config, &exp, &options).unwrap();
        assert!(cmd.full_command.contains("--force"));
        assert!(cmd.full_command.contains("--unobserved"));
        assert!(!cmd.full_command.contains("overwrite="));
    }

    #[test]
    #[parallel]
    fn verbose_suppresses_force_flag() {
        let config = Configuration::default();
        let exp = base_experiment();
        let options = MaterializeOptions {
            verbose: true,
            ..Default::default()
        };
        let cmd = materialize(&config, &exp, &options).unwrap();
        assert!(!cmd.full_command.contains("--force"));
    }

    #[test]
    #[parallel]
    fn named_config_keys_become_bare_tokens_in_unresolved_mode() {
        let config = Configuration::default();
        let mut exp = base_experiment();
        exp.config_unresolved = Some(serde_json::json!({"lr": 0.01, "+my_variant": true}));
        let options = MaterializeOptions {
            resolved: false,
            ..Default::default()
        };
        let cmd = materialize(&config, &exp, &options).unwrap();
        assert!(cmd.full_command.contains("my_variant"));
        assert!(!cmd.full_command.contains("+my_variant"));
    }
}
