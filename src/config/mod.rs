//! Configuration module
//!
//! Queue settings come from defaults, an optional YAML/JSON file and
//! `TESTQUEUE_*` environment overrides, in that order.

mod env;
mod file;

pub use env::{print_env_help, EnvBuilder, EnvConfig, EnvGuard};
pub use file::{expand_path, find_config_file, is_yaml_file};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::results::RetentionPolicy;

/// Queue configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Background workers; 0 runs the queue in poll mode
    pub workers: usize,

    /// Maximum characters kept per output stream before truncation
    pub max_output: usize,

    /// Maximum runs kept in the history log
    pub max_runs: Option<usize>,

    /// Byte budget for side-output files
    pub max_bytes: Option<u64>,

    /// Test runner timeout in seconds
    pub timeout_secs: u64,

    /// Finished runs kept in memory
    pub history_capacity: usize,

    /// Idle worker re-check interval in milliseconds
    pub idle_interval_ms: u64,

    /// Directory holding the history log and side outputs
    pub data_dir: PathBuf,

    /// External test runner
    pub runner: RunnerConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_output: 4000,
            max_runs: None,
            max_bytes: None,
            timeout_secs: 180,
            history_capacity: 200,
            idle_interval_ms: 500,
            data_dir: default_data_dir(),
            runner: RunnerConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Resolve the effective configuration: explicit file, else the file
    /// named by `TESTQUEUE_CONFIG`, else a discovered file, else defaults;
    /// then environment overrides.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let env = EnvConfig::load();
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env.config_file.as_deref().map(expand_path))
            .or_else(find_config_file);

        let base = match path {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        let config = base.with_env(&env);
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides
    pub fn with_env(mut self, env: &EnvConfig) -> Self {
        if let Some(workers) = env.workers {
            self.workers = workers;
        }
        if let Some(max_output) = env.max_output {
            self.max_output = max_output;
        }
        if let Some(max_runs) = env.max_runs {
            self.max_runs = (max_runs > 0).then_some(max_runs as usize);
        }
        if let Some(max_bytes) = env.max_bytes {
            self.max_bytes = (max_bytes > 0).then_some(max_bytes as u64);
        }
        if let Some(timeout) = env.timeout {
            self.timeout_secs = timeout;
        }
        if let Some(history) = env.history {
            self.history_capacity = history;
        }
        if let Some(dir) = &env.data_dir {
            self.data_dir = expand_path(dir);
        }
        if let Some(program) = &env.runner {
            self.runner.program = program.clone();
            self.runner.args.clear();
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be greater than zero");
        }
        if self.history_capacity == 0 {
            anyhow::bail!("history_capacity must be greater than zero");
        }
        if self.runner.program.trim().is_empty() {
            anyhow::bail!("runner.program must not be empty");
        }
        Ok(())
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy::new()
            .max_runs(self.max_runs.unwrap_or(0))
            .max_bytes(self.max_bytes.unwrap_or(0))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms.max(1))
    }

    /// Builder-style override of the data directory
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    pub fn with_max_runs(mut self, max_runs: usize) -> Self {
        self.max_runs = (max_runs > 0).then_some(max_runs);
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = (max_bytes > 0).then_some(max_bytes);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// External test runner command
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Program to spawn
    pub program: String,

    /// Arguments placed before the selection arguments
    pub args: Vec<String>,

    /// Root searched when resolving module filters
    pub tests_root: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            args: vec!["-m".to_string(), "pytest".to_string(), "-q".to_string()],
            tests_root: PathBuf::from("tests"),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("testqueue"))
        .unwrap_or_else(|| PathBuf::from("data").join("devtools"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.workers, 0);
        assert_eq!(config.max_output, 4000);
        assert_eq!(config.timeout_secs, 180);
        assert_eq!(config.history_capacity, 200);
        assert!(config.max_runs.is_none());
        assert_eq!(config.retention(), RetentionPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env = EnvConfig {
            workers: Some(2),
            max_output: Some(60),
            max_runs: Some(3),
            max_bytes: Some(-1),
            data_dir: Some("/tmp/tq".to_string()),
            runner: Some("pytest".to_string()),
            ..Default::default()
        };
        let config = QueueConfig::default().with_env(&env);
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_output, 60);
        assert_eq!(config.max_runs, Some(3));
        assert_eq!(config.max_bytes, None);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/tq"));
        assert_eq!(config.runner.program, "pytest");
        assert!(config.runner.args.is_empty());
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("testqueue.yaml");
        let config = QueueConfig::default()
            .with_workers(3)
            .with_max_runs(50)
            .with_data_dir(dir.path());
        config.save(&path).unwrap();

        let loaded = QueueConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("testqueue.json");
        std::fs::write(&path, r#"{"workers": 4, "max_bytes": 1024}"#).unwrap();

        let loaded = QueueConfig::load(&path).unwrap();
        assert_eq!(loaded.workers, 4);
        assert_eq!(loaded.max_bytes, Some(1024));
        assert_eq!(loaded.max_output, 4000);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = QueueConfig::default().with_timeout(0);
        assert!(config.validate().is_err());
    }
}
