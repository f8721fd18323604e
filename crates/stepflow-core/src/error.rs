use std::time::Duration;

use thiserror::Error;

use crate::types::{Finding, Severity};

/// Why a single step's external process did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    /// The process ran and exited with a nonzero status.
    Exit { code: Option<i32>, stderr: String },
    /// The process exceeded its wall-clock budget and was terminated.
    Timeout { timeout: Duration, stderr: String },
    /// The process could not be started at all.
    Spawn(String),
}

impl StepFailure {
    pub fn stderr(&self) -> &str {
        match self {
            Self::Exit { stderr, .. } | Self::Timeout { stderr, .. } => stderr,
            Self::Spawn(message) => message,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exit { code: Some(code), stderr } if stderr.is_empty() => {
                write!(f, "exit code {}", code)
            }
            Self::Exit { code: Some(code), stderr } => {
                write!(f, "exit code {}: {}", code, stderr.trim_end())
            }
            Self::Exit { code: None, stderr } => {
                write!(f, "terminated by signal: {}", stderr.trim_end())
            }
            Self::Timeout { timeout, .. } if timeout.subsec_nanos() == 0 => {
                write!(f, "timed out after {}s", timeout.as_secs())
            }
            Self::Timeout { timeout, .. } => write!(f, "timed out after {}ms", timeout.as_millis()),
            Self::Spawn(message) => write!(f, "failed to start: {}", message),
        }
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    // Pre-flight
    #[error("Workflow validation failed: {}", summarize_findings(.0))]
    Validation(Vec<Finding>),

    // Step errors
    #[error("Step '{node_id}' failed: {failure}")]
    Execution { node_id: String, failure: StepFailure },

    #[error("Condition evaluation failed at '{node_id}': {message}")]
    Evaluation { node_id: String, message: String },

    #[error("Node '{node_id}' was revisited; infinite loop detected")]
    InfiniteLoop { node_id: String },

    #[error("Could not parse output of step '{node_id}': {message}")]
    Parse { node_id: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    // Workflow document errors
    #[error("Workflow error: {0}")]
    Workflow(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Stable, machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Execution { .. } => "execution",
            Self::Evaluation { .. } => "evaluation",
            Self::InfiniteLoop { .. } => "infinite_loop",
            Self::Parse { .. } => "parse",
            Self::Cancelled => "cancelled",
            Self::Workflow(_) => "workflow",
            Self::Config(_) | Self::ConfigNotFound(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// The node the error originated at, when there is one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Execution { node_id, .. }
            | Self::Evaluation { node_id, .. }
            | Self::InfiniteLoop { node_id }
            | Self::Parse { node_id, .. } => Some(node_id),
            Self::Validation(findings) => findings
                .iter()
                .find(|f| f.severity == Severity::Error)
                .and_then(|f| f.node_id.as_deref()),
            _ => None,
        }
    }
}

fn summarize_findings(findings: &[Finding]) -> String {
    let errors: Vec<String> = findings
        .iter()
        .filter(|f| f.severity == Severity::Error)
        .map(|f| f.to_string())
        .collect();
    match errors.len() {
        0 => "no errors".to_string(),
        1 => errors[0].clone(),
        n => format!("{} errors; first: {}", n, errors[0]),
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;
