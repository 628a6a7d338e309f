//! Project-level configuration.
//!
//! Mirrors the merge strategy of row's `cluster::Configuration::open`: a
//! compiled-in default is overridden field-by-field by an optional
//! `seml.toml` found via `$SEML_HOME` or the user's home directory, falling
//! back to the project directory itself.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::{Error, Result, CONFIG_FILE_NAME};

/// Hostnames on which the local worker refuses to run (spec §4.6:
/// `check_compute_node`).
fn default_login_node_names() -> Vec<String> {
    Vec::new()
}

fn default_tmp_directory() -> String {
    "/tmp".to_string()
}

fn default_named_config_prefix() -> String {
    "+".to_string()
}

fn default_seed_config_key() -> String {
    "seed".to_string()
}

fn default_interpolation_whitelist() -> Vec<String> {
    vec!["config".to_string(), "config_unresolved".to_string()]
}

fn default_setup_command() -> String {
    String::new()
}

fn default_end_command() -> String {
    String::new()
}

/// Project configuration, loaded from `seml.toml` and merged with built-in
/// defaults.
///
/// Design Notes (distilled spec §9): "Global `SETTINGS` singleton →
/// injected configuration" — every component that previously would have
/// reached into a global takes a `&Configuration` instead.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Hostnames that refuse to run compute experiments directly.
    #[serde(default = "default_login_node_names")]
    pub login_node_names: Vec<String>,

    /// Directory used for per-run temp directories and submission scripts.
    #[serde(default = "default_tmp_directory")]
    pub tmp_directory: String,

    /// Prefix distinguishing a named-config token from a `k=v` override.
    #[serde(default = "default_named_config_prefix")]
    pub named_config_prefix: String,

    /// Whitelisted top-level sources for `${a.b.c}` interpolation.
    #[serde(default = "default_interpolation_whitelist")]
    pub interpolation_whitelist: Vec<String>,

    /// Config key under which a per-experiment random seed is recorded.
    #[serde(default = "default_seed_config_key")]
    pub seed_config_key: String,

    /// Shell snippet spliced before the experiment loop in the sbatch
    /// template (conda activation, module loads, ...).
    #[serde(default = "default_setup_command")]
    pub setup_command: String,

    /// Shell snippet spliced after the experiment loop in the sbatch
    /// template.
    #[serde(default = "default_end_command")]
    pub end_command: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            login_node_names: default_login_node_names(),
            tmp_directory: default_tmp_directory(),
            named_config_prefix: default_named_config_prefix(),
            interpolation_whitelist: default_interpolation_whitelist(),
            seed_config_key: default_seed_config_key(),
            setup_command: default_setup_command(),
            end_command: default_end_command(),
        }
    }
}

impl Configuration {
    /// Parse a configuration from a TOML string.
    pub fn parse_str(s: &str) -> Result<Configuration> {
        toml::from_str(s).map_err(|e| Error::TOMLParse(PathBuf::from("<string>"), e))
    }

    /// Open the user's configuration file, falling back to defaults when
    /// none is present.
    ///
    /// Search order, matching `row::cluster::Configuration::open`:
    /// 1. `$SEML_HOME/seml.toml`
    /// 2. `~/.config/seml/seml.toml`
    /// 3. compiled-in default
    pub fn open() -> Result<Configuration> {
        let home = match env::var_os("SEML_HOME") {
            Some(path) => Some(PathBuf::from(path)),
            None => home::home_dir().map(|h| h.join(".config").join("seml")),
        };

        match home {
            Some(dir) => Self::open_from_path(&dir.join(CONFIG_FILE_NAME)),
            None => Ok(Configuration::default()),
        }
    }

    /// Open a configuration file at an explicit path, returning the default
    /// configuration when the file does not exist.
    pub fn open_from_path(path: &Path) -> Result<Configuration> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                toml::from_str(&contents).map_err(|e| Error::TOMLParse(path.to_path_buf(), e))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Configuration::default()),
            Err(e) => Err(Error::FileRead(path.to_path_buf(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::parallel;

    #[test]
    #[parallel]
    fn defaults() {
        let config = Configuration::default();
        assert_eq!(config.tmp_directory, "/tmp");
        assert_eq!(config.named_config_prefix, "+");
        assert!(config.login_node_names.is_empty());
    }

    #[test]
    #[parallel]
    fn parse_partial() {
        let config = Configuration::parse_str(
            r#"
            login_node_names = ["login01", "login02"]
            tmp_directory = "/scratch/tmp"
            "#,
        )
        .expect("valid config");

        assert_eq!(config.login_node_names, vec!["login01", "login02"]);
        assert_eq!(config.tmp_directory, "/scratch/tmp");
        // unspecified fields fall back to defaults
        assert_eq!(config.named_config_prefix, "+");
    }

    #[test]
    #[parallel]
    fn open_missing_file_returns_default() {
        let config = Configuration::open_from_path(Path::new("/nonexistent/seml.toml"))
            .expect("missing file falls back to defaults");
        assert_eq!(config.tmp_directory, "/tmp");
    }
}
