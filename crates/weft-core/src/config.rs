use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Top-level weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
}

/// Where the SQLite databases live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding state.db, dead_letter.db, handoffs.db and events.db.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String { "~/.weft/data".to_string() }

/// Retry configuration for step dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    /// Upper bound on a single backoff sleep.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    /// Perturb each delay by a factor in 0.8..1.2.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// Sleep at least as long as the classifier suggests (e.g. 60s on 429).
    #[serde(default = "default_respect_retry_after")]
    pub respect_retry_after: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            backoff_base: default_backoff_base(),
            max_delay_secs: default_max_delay(),
            jitter: default_jitter(),
            respect_retry_after: default_respect_retry_after(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_delay() -> f64 { 1.0 }
fn default_backoff_base() -> f64 { 2.0 }
fn default_max_delay() -> f64 { 300.0 }
fn default_jitter() -> bool { true }
fn default_respect_retry_after() -> bool { true }

/// Circuit breaker configuration, shared by every protected dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before admitting a probe.
    #[serde(default = "default_cool_down_secs")]
    pub cool_down_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down_secs: default_cool_down_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }
}

fn default_failure_threshold() -> u32 { 5 }
fn default_cool_down_secs() -> u64 { 60 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default step deadline when neither the step nor the definition sets one.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
    /// Interpreter used to launch SCRIPT steps (None = execute the path directly).
    #[serde(default)]
    pub script_interpreter: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
            script_interpreter: None,
        }
    }
}

fn default_step_timeout() -> u64 { 600 }

/// Event log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogConfig {
    /// Mirror every event to `<jsonl_dir>/<correlation_id>.jsonl` when set.
    #[serde(default)]
    pub jsonl_dir: Option<String>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            jsonl_dir: None,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

fn default_broadcast_capacity() -> usize { 256 }

/// Static agent directory used when no external discovery service is wired.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub known: Vec<String>,
    /// Shell command per agent id for the command-backed agent executor.
    /// The command reads the step input as JSON on stdin and writes its
    /// output to stdout.
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

impl AgentsConfig {
    /// Every agent id named in `known` or `commands`.
    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .known
            .iter()
            .chain(self.commands.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

impl WeftConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Default config location: `~/.weft/config.toml`.
    pub fn default_path() -> PathBuf {
        expand_home("~/.weft/config.toml")
    }

    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.storage.data_dir)
    }

    /// Resolve the JSONL mirror directory, if configured.
    pub fn jsonl_dir(&self) -> Option<PathBuf> {
        self.event_log.jsonl_dir.as_deref().map(expand_home)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_WEFT_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_WEFT_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_WEFT_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_WEFT_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_WEFT_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: WeftConfig = toml::from_str("").unwrap();
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_secs, 1.0);
        assert_eq!(config.retry.backoff_base, 2.0);
        assert!(config.retry.respect_retry_after);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.cool_down(), Duration::from_secs(60));
        assert_eq!(config.executor.step_timeout_secs, 600);
        assert_eq!(config.event_log.broadcast_capacity, 256);
        assert!(config.agents.known.is_empty());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let toml_str = r#"
[retry]
max_attempts = 5
jitter = false

[agents]
known = ["researcher", "writer"]
"#;
        let config: WeftConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.max_delay_secs, 300.0);
        assert_eq!(config.agents.known, vec!["researcher", "writer"]);
    }

    #[test]
    fn test_agent_ids_merge_known_and_commands() {
        let toml_str = r#"
[agents]
known = ["writer", "researcher"]

[agents.commands]
reviewer = "python review.py"
writer = "./write.sh"
"#;
        let config: WeftConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.agents.agent_ids(), vec!["researcher", "reviewer", "writer"]);
        assert_eq!(config.agents.commands["reviewer"], "python review.py");
    }

    #[test]
    fn test_data_dir_absolute_is_untouched() {
        let mut config = WeftConfig::default();
        config.storage.data_dir = "/var/lib/weft".into();
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/weft"));
    }
}
