//! Environment variable configuration
//!
//! Provides `TESTQUEUE_*` overrides for the queue configuration.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "TESTQUEUE";

/// Configuration read from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Worker count from TESTQUEUE_WORKERS
    pub workers: Option<usize>,
    /// Output cap from TESTQUEUE_MAX_OUTPUT
    pub max_output: Option<usize>,
    /// History line bound from TESTQUEUE_MAX_RUNS (<= 0 disables)
    pub max_runs: Option<i64>,
    /// Side-output byte budget from TESTQUEUE_MAX_BYTES (<= 0 disables)
    pub max_bytes: Option<i64>,
    /// Runner timeout from TESTQUEUE_TIMEOUT
    pub timeout: Option<u64>,
    /// In-memory history capacity from TESTQUEUE_HISTORY
    pub history: Option<usize>,
    /// Data directory from TESTQUEUE_DATA_DIR
    pub data_dir: Option<String>,
    /// Runner program from TESTQUEUE_RUNNER
    pub runner: Option<String>,
    /// Config file from TESTQUEUE_CONFIG
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            workers: get_env_parse("WORKERS"),
            max_output: get_env_parse("MAX_OUTPUT"),
            max_runs: get_env_parse("MAX_RUNS"),
            max_bytes: get_env_parse("MAX_BYTES"),
            timeout: get_env_parse("TIMEOUT"),
            history: get_env_parse("HISTORY"),
            data_dir: get_env("DATA_DIR"),
            runner: get_env("RUNNER"),
            config_file: get_env("CONFIG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.workers.is_some()
            || self.max_output.is_some()
            || self.max_runs.is_some()
            || self.max_bytes.is_some()
            || self.timeout.is_some()
            || self.history.is_some()
            || self.data_dir.is_some()
            || self.runner.is_some()
            || self.config_file.is_some()
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {ENV_PREFIX}_WORKERS:     {:?}", self.workers);
        println!("  {ENV_PREFIX}_MAX_OUTPUT:  {:?}", self.max_output);
        println!("  {ENV_PREFIX}_MAX_RUNS:    {:?}", self.max_runs);
        println!("  {ENV_PREFIX}_MAX_BYTES:   {:?}", self.max_bytes);
        println!("  {ENV_PREFIX}_TIMEOUT:     {:?}", self.timeout);
        println!("  {ENV_PREFIX}_HISTORY:     {:?}", self.history);
        println!("  {ENV_PREFIX}_DATA_DIR:    {:?}", self.data_dir);
        println!("  {ENV_PREFIX}_RUNNER:      {:?}", self.runner);
        println!("  {ENV_PREFIX}_CONFIG:      {:?}", self.config_file);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Get environment variable and parse to type; unparseable values are ignored
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    fn var(mut self, name: &str, value: impl ToString) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    pub fn workers(self, workers: usize) -> Self {
        self.var("WORKERS", workers)
    }

    pub fn max_output(self, max_output: usize) -> Self {
        self.var("MAX_OUTPUT", max_output)
    }

    pub fn max_runs(self, max_runs: i64) -> Self {
        self.var("MAX_RUNS", max_runs)
    }

    pub fn max_bytes(self, max_bytes: i64) -> Self {
        self.var("MAX_BYTES", max_bytes)
    }

    pub fn timeout(self, timeout: u64) -> Self {
        self.var("TIMEOUT", timeout)
    }

    pub fn data_dir(self, dir: impl Into<String>) -> Self {
        self.var("DATA_DIR", dir.into())
    }

    /// Set a raw value, e.g. to exercise parsing of bad input
    pub fn raw(self, name: &str, value: impl Into<String>) -> Self {
        self.var(name, value.into())
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all TESTQUEUE environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_WORKERS      Background workers (0 = poll mode)");
    println!("  {ENV_PREFIX}_MAX_OUTPUT   Characters kept per output stream");
    println!("  {ENV_PREFIX}_MAX_RUNS     Runs kept in the history log (<= 0 disables)");
    println!("  {ENV_PREFIX}_MAX_BYTES    Byte budget for saved outputs (<= 0 disables)");
    println!("  {ENV_PREFIX}_TIMEOUT      Test runner timeout in seconds");
    println!("  {ENV_PREFIX}_HISTORY      Finished runs kept in memory");
    println!("  {ENV_PREFIX}_DATA_DIR     Directory for history and outputs");
    println!("  {ENV_PREFIX}_RUNNER       Test runner program");
    println!("  {ENV_PREFIX}_CONFIG       Path to configuration file");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_WORKERS=2");
    println!("  export {ENV_PREFIX}_MAX_RUNS=500");
    println!("  testqueue batch --count 3 -k metrics");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment is process-global
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_env_config_default() {
        let config = EnvConfig::default();
        assert!(config.workers.is_none());
        assert!(!config.has_any());
    }

    #[test]
    fn test_env_builder() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvBuilder::new()
            .workers(2)
            .max_runs(3)
            .max_bytes(0)
            .timeout(60)
            .data_dir("/tmp/testqueue")
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.workers, Some(2));
        assert_eq!(config.max_runs, Some(3));
        assert_eq!(config.max_bytes, Some(0));
        assert_eq!(config.timeout, Some(60));
        assert_eq!(config.data_dir.as_deref(), Some("/tmp/testqueue"));
        assert!(config.has_any());
    }

    #[test]
    fn test_unparseable_values_ignored() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvBuilder::new()
            .raw("WORKERS", "two")
            .raw("MAX_OUTPUT", "  ")
            .apply_scoped();

        let config = EnvConfig::load();
        assert_eq!(config.workers, None);
        assert_eq!(config.max_output, None);
    }

    #[test]
    fn test_guard_restores() {
        let _lock = ENV_LOCK.lock().unwrap();
        {
            let _guard = EnvBuilder::new().max_output(10).apply_scoped();
            assert_eq!(EnvConfig::load().max_output, Some(10));
        }
        assert_eq!(EnvConfig::load().max_output, None);
    }
}
