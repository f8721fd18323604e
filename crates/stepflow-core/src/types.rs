use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Variable name → JSON value. Used for workflow seed variables,
/// context snapshots, and step output deltas.
pub type ContextMap = BTreeMap<String, serde_json::Value>;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Process exit code for a CLI wrapper: 0 completed, 1 failed, 2 stopped.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Stopped => 2,
            Self::Idle | Self::Running | Self::Failed => 1,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Kind of a run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Success,
    Failure,
    Info,
    Warning,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
        }
    }
}

/// A single progress event emitted during a run.
///
/// Events are strictly ordered by `seq` within a run. The final event of a
/// run carries its terminal `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: RunId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub kind: EventKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_snapshot: Option<ContextMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
}

impl RunEvent {
    /// Whether this is the final event of its run.
    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }
}

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A single validation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub severity: Severity,
    pub node_id: Option<String>,
    pub message: String,
}

impl Finding {
    pub fn error(node_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            node_id,
            message: message.into(),
        }
    }

    pub fn warning(node_id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            node_id,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        match &self.node_id {
            Some(id) => write!(f, "{} [{}]: {}", level, id, self.message),
            None => write!(f, "{}: {}", level, self.message),
        }
    }
}

/// Input handed to a step invoker. The context is a snapshot, never a
/// live handle into the run's state.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub node_id: String,
    pub label: String,
    pub script: String,
    pub context: ContextMap,
    /// Per-step override of the invoker's default timeout.
    pub timeout: Option<Duration>,
}

/// Successful result of a step invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Variables to merge into the run context.
    pub update: ContextMap,
    /// Captured standard output, trimmed.
    pub stdout: String,
    /// Non-fatal problem reading the output (the step still counts as run).
    pub warning: Option<String>,
}

impl StepOutput {
    pub fn with_update(update: ContextMap) -> Self {
        Self {
            update,
            ..Default::default()
        }
    }
}
