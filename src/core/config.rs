//! Runtime configuration.
//!
//! Built-in defaults are overlaid by a user YAML file (top-level keys replace
//! the default wholesale) and then by command-line overrides. The result is
//! validated once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::utils::io;

const REDACTED: &str = "******";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_fuel_ip")]
    pub fuel_ip: String,

    #[serde(default = "default_fuel_port")]
    pub fuel_port: u16,

    #[serde(default = "default_fuel_credential")]
    pub fuel_user: String,

    #[serde(default = "default_fuel_credential")]
    pub fuel_pass: String,

    #[serde(default = "default_fuel_credential")]
    pub fuel_tenant: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_http_proxy: Option<String>,

    #[serde(default = "default_ssh_opts")]
    pub ssh_opts: Vec<String>,

    #[serde(default)]
    pub env_vars: Vec<String>,

    /// Per-command timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default = "default_maxthreads")]
    pub maxthreads: usize,

    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default)]
    pub filters: Filters,
}

/// Environment and node selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    /// Environment (cluster) ids.
    #[serde(default)]
    pub cluster: Vec<u32>,

    /// Node ids.
    #[serde(default)]
    pub id: Vec<u32>,
}

fn default_fuel_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_fuel_port() -> u16 {
    8000
}

fn default_fuel_credential() -> String {
    "admin".to_string()
}

fn default_ssh_opts() -> Vec<String> {
    [
        "-oConnectTimeout=2",
        "-oStrictHostKeyChecking=no",
        "-oUserKnownHostsFile=/dev/null",
        "-oLogLevel=error",
        "-lroot",
        "-oBatchMode=yes",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_timeout() -> u64 {
    15
}

fn default_maxthreads() -> usize {
    100
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/root")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fuel_ip: default_fuel_ip(),
            fuel_port: default_fuel_port(),
            fuel_user: default_fuel_credential(),
            fuel_pass: default_fuel_credential(),
            fuel_tenant: default_fuel_credential(),
            fuel_http_proxy: None,
            ssh_opts: default_ssh_opts(),
            env_vars: Vec::new(),
            timeout: default_timeout(),
            maxthreads: default_maxthreads(),
            work_dir: default_work_dir(),
            filters: Filters::default(),
        }
    }
}

/// Command-line values layered over the configuration file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub config_file: Option<PathBuf>,
    pub env: Vec<u32>,
    pub node: Vec<u32>,
}

impl Config {
    /// Build the effective configuration: defaults, user file, overrides.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = match &overrides.config_file {
            Some(path) => Self::from_file(&expand_tilde(path))?,
            None => Self::default(),
        };

        if !overrides.env.is_empty() {
            config.filters.cluster = overrides.env.clone();
        }
        if !overrides.node.is_empty() {
            config.filters.id = overrides.node.clone();
        }

        config.validate()?;
        tracing::debug!(config = ?config.redacted(), "configuration loaded");
        Ok(config)
    }

    /// Defaults with the top-level keys of `path` replacing theirs.
    pub fn from_file(path: &Path) -> Result<Self> {
        let user: Value = io::load_yaml_file(path)?;
        let user = match user {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(Error::config_invalid_yaml(
                    path.display().to_string(),
                    format!("expected a mapping at the top level, found {}", kind_of(&other)),
                ))
            }
        };

        let mut merged = match serde_json::to_value(Self::default()) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        for (key, value) in user {
            merged.insert(key, value);
        }

        serde_json::from_value(Value::Object(merged)).map_err(|e| {
            Error::config_invalid_value(path.display().to_string(), None, e.to_string())
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.fuel_ip.trim().is_empty() {
            return Err(Error::config_invalid_value(
                "fuel_ip",
                Some(self.fuel_ip.clone()),
                "fuel_ip must not be empty",
            ));
        }
        if self.maxthreads == 0 {
            return Err(Error::config_invalid_value(
                "maxthreads",
                Some("0".to_string()),
                "maxthreads must be at least 1",
            ));
        }
        if self.timeout == 0 {
            return Err(Error::config_invalid_value(
                "timeout",
                Some("0".to_string()),
                "timeout must be at least 1 second",
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Look up a single option by name.
    pub fn get(&self, key: &str) -> Result<Value> {
        let value = serde_json::to_value(self.redacted())
            .map_err(|e| Error::internal_json(e.to_string(), Some("serialize config".into())))?;
        value
            .get(key)
            .cloned()
            .ok_or_else(|| Error::config_missing_key(key))
    }

    /// Copy safe to print: the password is masked.
    pub fn redacted(&self) -> Self {
        Self {
            fuel_pass: REDACTED.to_string(),
            ..self.clone()
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).to_string())
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.fuel_ip, "127.0.0.1");
        assert_eq!(config.fuel_port, 8000);
        assert_eq!(config.timeout, 15);
        assert_eq!(config.maxthreads, 100);
        assert!(config.ssh_opts.contains(&"-oBatchMode=yes".to_string()));
        assert!(config.filters.cluster.is_empty());
    }

    #[test]
    fn user_file_replaces_top_level_keys() {
        let file = config_file("timeout: 60\nssh_opts: ['-lstack']\nfilters:\n  id: [3]\n");
        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.timeout, 60);
        assert_eq!(config.ssh_opts, vec!["-lstack".to_string()]);
        // `filters` is replaced as a whole, so `cluster` falls back to empty.
        assert_eq!(config.filters, Filters { cluster: vec![], id: vec![3] });
        assert_eq!(config.fuel_port, 8000);
    }

    #[test]
    fn empty_mapping_yields_defaults() {
        let file = config_file("{}\n");
        assert_eq!(Config::from_file(file.path()).unwrap(), Config::default());
    }

    #[test]
    fn wrong_value_type_is_invalid_value() {
        let file = config_file("maxthreads: many\n");
        let err = Config::from_file(file.path()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn non_mapping_document_is_rejected() {
        let file = config_file("- a\n- b\n");
        let err = Config::from_file(file.path()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidYaml);
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let file = config_file("filters:\n  cluster: [1]\n  id: [2]\n");
        let overrides = ConfigOverrides {
            config_file: Some(file.path().to_path_buf()),
            env: vec![7],
            node: vec![],
        };
        let config = Config::load(&overrides).unwrap();
        assert_eq!(config.filters.cluster, vec![7]);
        assert_eq!(config.filters.id, vec![2]);
    }

    #[test]
    fn zero_maxthreads_fails_validation() {
        let file = config_file("maxthreads: 0\n");
        let overrides = ConfigOverrides {
            config_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let err = Config::load(&overrides).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
        assert_eq!(err.details["key"], "maxthreads");
    }

    #[test]
    fn zero_timeout_and_empty_ip_fail_validation() {
        let config = Config {
            timeout: 0,
            ..Config::default()
        };
        assert_eq!(config.validate().unwrap_err().details["key"], "timeout");

        let config = Config {
            fuel_ip: " ".to_string(),
            ..Config::default()
        };
        assert_eq!(config.validate().unwrap_err().details["key"], "fuel_ip");
    }

    #[test]
    fn get_reports_unknown_options() {
        let config = Config::default();
        assert_eq!(config.get("timeout").unwrap(), serde_json::json!(15));
        let err = config.get("no_such_option").unwrap_err();
        assert_eq!(err.code, ErrorCode::ConfigMissingKey);
    }

    #[test]
    fn tilde_expands_to_home() {
        let expanded = expand_tilde(Path::new("~/mupdate.yaml"));
        if std::env::var_os("HOME").is_some() {
            assert!(!expanded.to_string_lossy().starts_with('~'));
        }
        assert!(expanded.ends_with("mupdate.yaml"));
        assert_eq!(expand_tilde(Path::new("/etc/x.yaml")), PathBuf::from("/etc/x.yaml"));
    }

    #[test]
    fn redacted_masks_password_only() {
        let config = Config {
            fuel_pass: "secret".to_string(),
            ..Config::default()
        };
        let shown = config.redacted();
        assert_eq!(shown.fuel_pass, REDACTED);
        assert_eq!(shown.fuel_user, config.fuel_user);
        assert_eq!(config.get("fuel_pass").unwrap(), serde_json::json!(REDACTED));
    }
}
