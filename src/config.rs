//! Configuration for the cluster coordinator.
//!
//! Settings come from an optional TOML file with a `[cluster]` table and are
//! then overridden by environment variables:
//!
//! - `CLUSTER_MAX_WORKERS` - requested worker count
//! - `CLUSTER_ENV` - informational environment name
//! - `CLUSTER_LOG_FORMAT` - `pretty` or `json`
//!
//! The effective pool size is computed by [`PoolConfiguration::effective_workers`].

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment variable with the requested worker count.
pub const MAX_WORKERS_ENV: &str = "CLUSTER_MAX_WORKERS";
/// Environment variable with the informational environment name.
pub const ENV_NAME_ENV: &str = "CLUSTER_ENV";
/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "CLUSTER_LOG_FORMAT";

const DEFAULT_ENV_NAME: &str = "development";

/// Output format for the coordinator's log sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!(
                "unknown log format '{other}' (expected 'pretty' or 'json')"
            ))),
        }
    }
}

/// Non-fatal problems found while assembling the configuration.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Cluster settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Requested number of workers. Capped by hardware concurrency.
    #[serde(default)]
    pub max_workers: Option<usize>,
    /// Informational environment name reported in the start record.
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub log_format: LogFormat,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cluster: ClusterConfig,
}

impl ClusterConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::io(format!("reading {}", path.display()), e))?;

        Self::parse(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str::<ConfigFile>(content).map(|file| file.cluster)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> ValidationResult {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Invalid values are reported as warnings and leave the current
    /// setting untouched.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ValidationResult
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();

        if let Some(raw) = lookup(MAX_WORKERS_ENV) {
            match parse_worker_count(&raw) {
                Some(count) => self.max_workers = Some(count),
                None => warnings.push(format!(
                    "{MAX_WORKERS_ENV}='{raw}' is not a worker count, using hardware concurrency"
                )),
            }
        }

        if let Some(env) = lookup(ENV_NAME_ENV)
            && !env.trim().is_empty()
        {
            self.env = Some(env);
        }

        if let Some(raw) = lookup(LOG_FORMAT_ENV) {
            match raw.parse::<LogFormat>() {
                Ok(format) => self.log_format = format,
                Err(e) => warnings.push(e.to_string()),
            }
        }

        ValidationResult { warnings }
    }

    /// Environment name, falling back to `development`.
    pub fn env_name(&self) -> &str {
        self.env.as_deref().unwrap_or(DEFAULT_ENV_NAME)
    }

    /// Pool sizing inputs for this host.
    pub fn pool(&self) -> PoolConfiguration {
        PoolConfiguration {
            requested: self.max_workers,
            hardware: num_cpus::get(),
        }
    }
}

/// Parse a requested worker count. Only unsigned integers are accepted.
fn parse_worker_count(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok()
}

/// Inputs to the worker count computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfiguration {
    pub requested: Option<usize>,
    pub hardware: usize,
}

impl PoolConfiguration {
    /// Number of workers to fork.
    ///
    /// A requested count of zero is honoured and yields an empty pool.
    pub fn effective_workers(&self) -> usize {
        match self.requested {
            Some(requested) => requested.min(self.hardware),
            None => self.hardware,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_requested_above_hardware_is_capped() {
        let pool = PoolConfiguration {
            requested: Some(4),
            hardware: 2,
        };
        assert_eq!(pool.effective_workers(), 2);
    }

    #[test]
    fn test_absent_request_uses_hardware() {
        let pool = PoolConfiguration {
            requested: None,
            hardware: 8,
        };
        assert_eq!(pool.effective_workers(), 8);
    }

    #[test]
    fn test_zero_request_yields_empty_pool() {
        let pool = PoolConfiguration {
            requested: Some(0),
            hardware: 8,
        };
        assert_eq!(pool.effective_workers(), 0);
    }

    #[test]
    fn test_env_override_worker_count() {
        let mut config = ClusterConfig::default();
        let result = config.apply_overrides(lookup(&[(MAX_WORKERS_ENV, " 3 ")]));
        assert!(!result.has_warnings());
        assert_eq!(config.max_workers, Some(3));
    }

    #[test]
    fn test_env_invalid_worker_count_is_ignored() {
        for raw in ["", "abc", "-1", "2.5"] {
            let mut config = ClusterConfig::default();
            let result = config.apply_overrides(lookup(&[(MAX_WORKERS_ENV, raw)]));
            assert!(result.has_warnings(), "'{raw}' should warn");
            assert_eq!(config.max_workers, None, "'{raw}' should be ignored");
        }
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = ClusterConfig::parse(
            r#"
[cluster]
max_workers = 6
env = "staging"
"#,
        )
        .unwrap();

        let result = config.apply_overrides(lookup(&[
            (MAX_WORKERS_ENV, "2"),
            (ENV_NAME_ENV, "production"),
            (LOG_FORMAT_ENV, "JSON"),
        ]));

        assert!(!result.has_warnings());
        assert_eq!(config.max_workers, Some(2));
        assert_eq!(config.env_name(), "production");
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_unknown_log_format_warns() {
        let mut config = ClusterConfig::default();
        let result = config.apply_overrides(lookup(&[(LOG_FORMAT_ENV, "xml")]));
        assert!(result.has_warnings());
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_empty_file_uses_defaults() {
        let config = ClusterConfig::parse("").unwrap();
        assert_eq!(config.max_workers, None);
        assert_eq!(config.env_name(), "development");
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_parse_rejects_negative_workers() {
        assert!(ClusterConfig::parse("[cluster]\nmax_workers = -1\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.toml");
        fs::write(&path, "[cluster]\nmax_workers = 1\nlog_format = \"json\"\n").unwrap();

        let config = ClusterConfig::load_from(&path).unwrap();
        assert_eq!(config.max_workers, Some(1));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = ClusterConfig::load_from("definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    proptest! {
        /// The pool never exceeds the hardware and an absent request fills it.
        #[test]
        fn effective_workers_invariant(requested in proptest::option::of(0usize..512), hardware in 1usize..256) {
            let pool = PoolConfiguration { requested, hardware };
            let effective = pool.effective_workers();

            prop_assert!(effective <= hardware);
            match requested {
                Some(r) => prop_assert_eq!(effective, r.min(hardware)),
                None => prop_assert_eq!(effective, hardware),
            }
        }
    }
}
