//! Action reports and action errors

use serde::Serialize;

use crate::event::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Kill,
    Hash,
    Set,
    NetworkFilter,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Kill => "kill",
            ActionKind::Hash => "hash",
            ActionKind::Set => "set",
            ActionKind::NetworkFilter => "network_filter",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Performed,
    PartiallyPerformed,
    Disarmed,
    Failed,
    /// Hash waiting for its trigger
    Pending,
    /// Hash computed
    Done,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Performed => "performed",
            ActionStatus::PartiallyPerformed => "partially_performed",
            ActionStatus::Disarmed => "disarmed",
            ActionStatus::Failed => "failed",
            ActionStatus::Pending => "pending",
            ActionStatus::Done => "done",
        }
    }
}

/// What completed a deferred hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HashTrigger {
    ProcessExit,
    Timeout,
}

/// Outcome of one action executed for one matched event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionReport {
    pub id: String,
    pub rule_id: String,
    pub kind: ActionKind,
    pub status: ActionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Value written by a set action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Processes signalled by a kill action
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(rename = "file.hashes", skip_serializing_if = "Vec::is_empty")]
    pub hashes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<HashTrigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ns: Option<u64>,
}

impl ActionReport {
    pub fn new(rule_id: &str, kind: ActionKind) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            rule_id: rule_id.to_string(),
            kind,
            status: ActionStatus::Pending,
            scope: None,
            signal: None,
            value: None,
            pids: Vec::new(),
            file_path: None,
            hashes: Vec::new(),
            trigger: None,
            error: None,
            created_at_ns: unix_nanos(),
            completed_at_ns: None,
        }
    }

    pub fn complete(&mut self, status: ActionStatus) {
        self.status = status;
        self.completed_at_ns = Some(unix_nanos());
    }

    pub fn fail(&mut self, error: &ActionError) {
        self.error = Some(error.to_string());
        self.complete(ActionStatus::Failed);
    }

    pub fn is_final(&self) -> bool {
        self.status != ActionStatus::Pending
    }
}

/// Nanoseconds since the unix epoch
pub fn unix_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Error type for action execution. Recorded in the report, never propagated.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionError {
    /// Signal delivery failed for a reason other than the process being gone
    Signal { pid: u32, reason: String },
    /// Process exited before it could be signalled
    ProcessGone(u32),
    /// The event carries nothing the action can apply to
    NoTarget(String),
    /// Target is the engine itself, init, or an excluded binary
    Protected(String),
    EnforcementDisabled,
    Hash(String),
    Filter(String),
    /// Deferred action never completed
    Timeout,
    /// Some targets of a multi-process scope were not signalled
    PartialFailure { signaled: usize, failed: usize },
    /// No deferred-action scheduler is running
    SchedulerUnavailable,
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionError::Signal { pid, reason } => write!(f, "failed to signal {}: {}", pid, reason),
            ActionError::ProcessGone(pid) => write!(f, "process {} already exited", pid),
            ActionError::NoTarget(msg) => write!(f, "no target: {}", msg),
            ActionError::Protected(what) => write!(f, "refusing to act on {}", what),
            ActionError::EnforcementDisabled => write!(f, "enforcement disabled"),
            ActionError::Hash(msg) => write!(f, "hash failed: {}", msg),
            ActionError::Filter(msg) => write!(f, "network filter failed: {}", msg),
            ActionError::Timeout => write!(f, "deferred action never completed"),
            ActionError::PartialFailure { signaled, failed } => {
                write!(f, "signalled {} processes, {} failed", signaled, failed)
            }
            ActionError::SchedulerUnavailable => write!(f, "deferred action scheduler unavailable"),
        }
    }
}

impl std::error::Error for ActionError {}
