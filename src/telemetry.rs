//! Remediation-status records and the sinks that receive them
//!
//! Records are emitted for rules tagged `remediation_rule: "true"` and are
//! shaped for the backend's remediation view:
//!
//! ```json
//! {
//!   "agent.rule_id": "kill_miner",
//!   "event_type": "exec",
//!   "remediation_action": "kill",
//!   "status": "performed",
//!   "scope": "container",
//!   "process.pid": 4242,
//!   "rule_tags": {"remediation_rule": "true", "creator": "secops"}
//! }
//! ```

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::actions::report::ActionReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    Kill,
    NetworkIsolation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationState {
    Performed,
    PartiallyPerformed,
    /// This trigger was suppressed by a disarmer
    Disarmed,
    /// A disarmer of the rule just tripped
    RuleDisarmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationStatus {
    #[serde(rename = "agent.rule_id")]
    pub rule_id: String,
    pub event_type: String,
    pub remediation_action: RemediationAction,
    pub status: RemediationState,
    pub scope: String,
    #[serde(rename = "process.pid")]
    pub pid: u32,
    pub rule_tags: BTreeMap<String, String>,
    pub timestamp_ns: u64,
}

/// Receiver of remediation records and completed deferred actions
pub trait TelemetrySink: Send + Sync {
    fn remediation_status(&self, status: &RemediationStatus);

    /// A deferred action reached its final state
    fn action_completed(&self, _report: &ActionReport) {}
}

/// Writes records to the log
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn remediation_status(&self, status: &RemediationStatus) {
        info!(
            rule_id = %status.rule_id,
            event_type = %status.event_type,
            action = ?status.remediation_action,
            status = ?status.status,
            scope = %status.scope,
            pid = status.pid,
            "remediation status"
        );
    }

    fn action_completed(&self, report: &ActionReport) {
        info!(
            rule_id = %report.rule_id,
            action = report.kind.as_str(),
            status = report.status.as_str(),
            hashes = ?report.hashes,
            "deferred action completed"
        );
    }
}

/// Keeps every record in memory
#[derive(Default)]
pub struct MemorySink {
    statuses: Mutex<Vec<RemediationStatus>>,
    completed: Mutex<Vec<ActionReport>>,
}

impl MemorySink {
    pub fn statuses(&self) -> Vec<RemediationStatus> {
        self.statuses.lock().clone()
    }

    pub fn completed(&self) -> Vec<ActionReport> {
        self.completed.lock().clone()
    }
}

impl TelemetrySink for MemorySink {
    fn remediation_status(&self, status: &RemediationStatus) {
        self.statuses.lock().push(status.clone());
    }

    fn action_completed(&self, report: &ActionReport) {
        self.completed.lock().push(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_json_shape() {
        let status = RemediationStatus {
            rule_id: "kill_miner".to_string(),
            event_type: "exec".to_string(),
            remediation_action: RemediationAction::NetworkIsolation,
            status: RemediationState::RuleDisarmed,
            scope: "container".to_string(),
            pid: 4242,
            rule_tags: BTreeMap::from([("creator".to_string(), "secops".to_string())]),
            timestamp_ns: 1,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["agent.rule_id"], "kill_miner");
        assert_eq!(json["remediation_action"], "network_isolation");
        assert_eq!(json["status"], "rule_disarmed");
        assert_eq!(json["process.pid"], 4242);
        assert_eq!(json["rule_tags"]["creator"], "secops");
    }
}
