use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level stepflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Hard cap on node dispatches per run; exceeding it is treated as an
    /// infinite loop.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Fall back to the first declared node when no `start` node exists.
    #[serde(default)]
    pub allow_implicit_entry: bool,
    /// Per-subscriber buffer size of the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            allow_implicit_entry: false,
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_max_steps() -> usize { 1000 }
fn default_event_capacity() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    /// Default wall-clock budget for a single step.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Time between the termination request and a forced kill.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Captured stdout/stderr beyond this many bytes is dropped.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Base directory for relative script paths (default: current dir).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Pass the parent environment through to steps.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: bool,
    /// Script extension → interpreter program.
    #[serde(default = "default_interpreters")]
    pub interpreters: HashMap<String, String>,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            kill_grace_ms: default_kill_grace_ms(),
            max_output_bytes: default_max_output_bytes(),
            working_dir: None,
            inherit_env: default_inherit_env(),
            interpreters: default_interpreters(),
        }
    }
}

impl InvokerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

fn default_timeout_secs() -> u64 { 60 }
fn default_kill_grace_ms() -> u64 { 2000 }
fn default_max_output_bytes() -> usize { 1024 * 1024 }
fn default_inherit_env() -> bool { true }

fn default_interpreters() -> HashMap<String, String> {
    HashMap::from([
        ("py".to_string(), "python3".to_string()),
        ("sh".to_string(), "sh".to_string()),
    ])
}

/// Run event sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Print events to the console.
    #[serde(default = "default_true")]
    pub console: bool,
    /// Write events as JSONL under `log_dir`.
    #[serde(default = "default_true")]
    pub file: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Number of events kept by the in-memory buffer.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console: true,
            file: true,
            log_dir: default_log_dir(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

fn default_true() -> bool { true }
fn default_log_dir() -> String { "logs".to_string() }
fn default_memory_capacity() -> usize { 500 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| FlowError::Config(e.to_string()))
    }

    /// Like [`load`](Self::load), but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(FlowError::ConfigNotFound(_)) if !path.exists() => Ok(Self::default()),
            other => other,
        }
    }

    /// Resolve the log directory (expand ~).
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.log.log_dir)
    }

    /// Resolve the step working directory, if one is configured.
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.invoker.working_dir.as_deref().map(expand_home)
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
