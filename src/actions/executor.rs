//! Action executor
//!
//! Runs the actions of a matched rule, in declaration order, against the
//! event that matched. Every action yields one `ActionReport`; a failing
//! action is recorded as `failed` and the next one still runs.
//!
//! ```text
//! kill            enforcement on? ─► protected? ─► disarmers armed? ─► resolve scope ─► signal
//! hash            process gone? ─► hash now        : schedule on the HashScheduler
//! set             value/field ─► VariableStore
//! network_filter  enforcement on? ─► PacketFilterInstaller
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::filter::{FilterScope, FilterTarget, PacketFilterInstaller};
use super::hash::{FileHasher, HashScheduler};
use super::kill::{kill_targets, ProcessResolver, ProcessSignaler};
use super::report::{unix_nanos, ActionError, ActionKind, ActionReport, ActionStatus, HashTrigger};
use crate::config::{EnforcementConfig, EngineConfig};
use crate::disarmer::{DisarmerKind, KillDisarmer, Transition};
use crate::event::{Event, EventType};
use crate::metrics::ACTIONS;
use crate::rules::{Action, HashAction, KillAction, NetworkFilterAction, Rule, SetAction, ValueSource};
use crate::telemetry::{RemediationAction, RemediationState, RemediationStatus, TelemetrySink};
use crate::variables::VariableStore;

/// A disarmer key of a rule changed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisarmTransition {
    pub rule_id: String,
    pub kind: DisarmerKind,
    pub key: String,
    pub transition: Transition,
}

/// Everything that came out of running one rule's actions
#[derive(Debug, Default)]
pub struct Execution {
    pub reports: Vec<ActionReport>,
    pub transitions: Vec<DisarmTransition>,
}

pub struct ActionExecutor {
    signaler: Arc<dyn ProcessSignaler>,
    resolver: Arc<dyn ProcessResolver>,
    filters: Arc<dyn PacketFilterInstaller>,
    telemetry: Arc<dyn TelemetrySink>,
    variables: Arc<VariableStore>,
    hasher: FileHasher,
    hash_scheduler: Option<HashScheduler>,
    enforcement: EnforcementConfig,
    /// One disarmer pair per rule carrying a kill action
    disarmers: RwLock<HashMap<String, Arc<KillDisarmer>>>,
    own_pid: u32,
}

impl ActionExecutor {
    pub fn new(
        config: &EngineConfig,
        variables: Arc<VariableStore>,
        signaler: Arc<dyn ProcessSignaler>,
        resolver: Arc<dyn ProcessResolver>,
        filters: Arc<dyn PacketFilterInstaller>,
        telemetry: Arc<dyn TelemetrySink>,
        hash_scheduler: Option<HashScheduler>,
    ) -> Self {
        Self {
            signaler,
            resolver,
            filters,
            telemetry,
            variables,
            hasher: FileHasher::new(config.hash.max_file_size),
            hash_scheduler,
            enforcement: config.enforcement.clone(),
            disarmers: RwLock::new(HashMap::new()),
            own_pid: std::process::id(),
        }
    }

    /// Track disarmers for a new ruleset. Rules that were already loaded keep
    /// their disarm state; rules that are gone lose it.
    pub fn register_rules(&self, rules: &[Arc<Rule>]) {
        let settings = &self.enforcement.disarmer;
        let mut disarmers = self.disarmers.write();
        let mut next = HashMap::new();
        for rule in rules.iter().filter(|r| r.has_kill()) {
            let disarmer = disarmers
                .remove(&rule.id)
                .unwrap_or_else(|| Arc::new(KillDisarmer::new(&settings.executable, &settings.container)));
            next.insert(rule.id.clone(), disarmer);
        }
        *disarmers = next;
    }

    pub fn execute(&self, rule: &Rule, event: &Event) -> Execution {
        let mut execution = Execution::default();
        for action in &rule.actions {
            let report = match action {
                Action::Kill(kill) => self.kill(rule, kill, event, &mut execution),
                Action::Hash(hash) => self.hash(rule, hash, event),
                Action::Set(set) => self.set(rule, set, event),
                Action::NetworkFilter(filter) => self.network_filter(rule, filter, event),
            };

            ACTIONS
                .with_label_values(&[report.kind.as_str(), report.status.as_str()])
                .inc();
            match &report.error {
                Some(error) => warn!(
                    rule_id = %rule.id,
                    action = report.kind.as_str(),
                    error = %error,
                    "action failed"
                ),
                None => debug!(
                    rule_id = %rule.id,
                    action = report.kind.as_str(),
                    status = report.status.as_str(),
                    "action executed"
                ),
            }
            execution.reports.push(report);
        }
        execution
    }

    /// A process exited; completes the hashes waiting on it
    pub fn notify_exit(&self, pid: u32) {
        if let Some(scheduler) = &self.hash_scheduler {
            scheduler.notify_exit(pid);
        }
    }

    /// Drop the filters attached to a target that went away
    pub fn release_filters(&self, target: &FilterTarget) -> usize {
        self.filters.remove(target)
    }

    /// Forget the disarm state of a container or cgroup that went away
    pub fn release_container(&self, key: &str) -> usize {
        self.disarmers
            .read()
            .values()
            .filter(|d| d.release_container(key))
            .count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Kill
    // ─────────────────────────────────────────────────────────────────────────

    fn kill(&self, rule: &Rule, action: &KillAction, event: &Event, execution: &mut Execution) -> ActionReport {
        let mut report = ActionReport::new(&rule.id, ActionKind::Kill);
        report.scope = Some(action.scope.as_str().to_string());
        report.signal = Some(action.signal.as_str().to_string());

        if let Err(e) = self.kill_allowed(event) {
            report.fail(&e);
            self.emit_remediation(rule, event, RemediationAction::Kill, action.scope.as_str(), &report);
            return report;
        }

        let disarmer = self.disarmers.read().get(&rule.id).cloned();
        if let Some(disarmer) = disarmer {
            let executable = Some(event.process.executable.as_str())
                .filter(|exe| !exe.is_empty() && !action.disable_executable_disarmer);
            let container = event
                .container_id()
                .or_else(|| event.cgroup_id())
                .filter(|_| !action.disable_container_disarmer);

            let verdict = disarmer.check(executable, container, Instant::now());
            for (kind, key, transition) in verdict.transitions {
                if transition == Transition::Disarmed {
                    self.emit(rule, event, RemediationAction::Kill, action.scope.as_str(), RemediationState::RuleDisarmed);
                }
                execution.transitions.push(DisarmTransition {
                    rule_id: rule.id.clone(),
                    kind,
                    key,
                    transition,
                });
            }
            if !verdict.armed {
                report.complete(ActionStatus::Disarmed);
                self.emit_remediation(rule, event, RemediationAction::Kill, action.scope.as_str(), &report);
                return report;
            }
        }

        let targets = match kill_targets(action.scope, event, self.resolver.as_ref()) {
            Ok(pids) => pids,
            Err(e) => {
                report.fail(&e);
                self.emit_remediation(rule, event, RemediationAction::Kill, action.scope.as_str(), &report);
                return report;
            }
        };
        let targets: Vec<u32> = targets
            .into_iter()
            .filter(|pid| *pid > 1 && *pid != self.own_pid)
            .collect();
        if targets.is_empty() {
            report.fail(&ActionError::NoTarget(format!("no killable process in {} scope", action.scope.as_str())));
            self.emit_remediation(rule, event, RemediationAction::Kill, action.scope.as_str(), &report);
            return report;
        }

        let mut last_error = None;
        for pid in &targets {
            match self.signaler.signal(*pid, action.signal) {
                Ok(()) => report.pids.push(*pid),
                Err(e) => {
                    debug!(rule_id = %rule.id, pid, error = %e, "signal not delivered");
                    last_error = Some(e);
                }
            }
        }

        let failed = targets.len() - report.pids.len();
        match (report.pids.len(), last_error) {
            (_, None) => report.complete(ActionStatus::Performed),
            (0, Some(e)) if targets.len() == 1 => report.fail(&e),
            (0, Some(_)) => report.fail(&ActionError::PartialFailure { signaled: 0, failed }),
            (signaled, Some(_)) => {
                report.error = Some(ActionError::PartialFailure { signaled, failed }.to_string());
                report.complete(ActionStatus::PartiallyPerformed);
            }
        }
        self.emit_remediation(rule, event, RemediationAction::Kill, action.scope.as_str(), &report);
        report
    }

    fn kill_allowed(&self, event: &Event) -> Result<(), ActionError> {
        if !self.enforcement.enabled {
            return Err(ActionError::EnforcementDisabled);
        }
        let exe = event.process.executable.as_str();
        if self.enforcement.excluded_binaries.iter().any(|b| b == exe) {
            return Err(ActionError::Protected(exe.to_string()));
        }
        if event.process.pid == self.own_pid {
            return Err(ActionError::Protected("the engine process".to_string()));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hash
    // ─────────────────────────────────────────────────────────────────────────

    fn hash(&self, rule: &Rule, action: &HashAction, event: &Event) -> ActionReport {
        let mut report = ActionReport::new(&rule.id, ActionKind::Hash);

        let path = match &action.field {
            Some(field) => field.get(event).and_then(|v| v.as_str().map(str::to_string)),
            None => event.file.as_ref().map(|f| f.path.clone()),
        };
        let Some(path) = path.filter(|p| !p.is_empty()) else {
            report.fail(&ActionError::NoTarget("event has no file to hash".to_string()));
            return report;
        };
        report.file_path = Some(path.clone());

        let pid = event.process.pid;
        if event.event_type == EventType::Exit || !self.resolver.is_alive(pid) {
            report.trigger = Some(HashTrigger::ProcessExit);
            match self.hasher.hash_file(Path::new(&path)) {
                Ok(hash) => {
                    report.hashes.push(hash);
                    report.complete(ActionStatus::Done);
                }
                Err(e) => report.fail(&e),
            }
            return report;
        }

        let scheduled = match &self.hash_scheduler {
            Some(scheduler) => scheduler.schedule(report.clone(), pid, PathBuf::from(path)),
            None => Err(ActionError::SchedulerUnavailable),
        };
        if let Err(e) = scheduled {
            report.fail(&e);
        }
        report
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Set
    // ─────────────────────────────────────────────────────────────────────────

    fn set(&self, rule: &Rule, action: &SetAction, event: &Event) -> ActionReport {
        let mut report = ActionReport::new(&rule.id, ActionKind::Set);
        report.scope = Some(action.scope.as_str().to_string());

        let value = match &action.source {
            ValueSource::Literal(v) => Some(v.clone()),
            ValueSource::Field(field) => field.get(event),
        };
        let Some(value) = value else {
            report.fail(&ActionError::NoTarget(format!("event has no value for {}", action.name)));
            return report;
        };
        let Some(owner) = action.scope.owner_key(event) else {
            report.fail(&ActionError::NoTarget(format!("event has no {} scope", action.scope.as_str())));
            return report;
        };

        self.variables
            .set_with(action.scope, &owner, &action.name, value.clone(), &action.options);
        report.value = Some(value);
        report.complete(ActionStatus::Performed);
        report
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Network filter
    // ─────────────────────────────────────────────────────────────────────────

    fn network_filter(&self, rule: &Rule, action: &NetworkFilterAction, event: &Event) -> ActionReport {
        let mut report = ActionReport::new(&rule.id, ActionKind::NetworkFilter);
        report.scope = Some(action.scope.as_str().to_string());

        let target = match action.scope {
            FilterScope::Process => Ok(FilterTarget::Process(event.process.pid)),
            FilterScope::Cgroup => event
                .cgroup_id()
                .map(|id| FilterTarget::Cgroup(id.to_string()))
                .ok_or_else(|| ActionError::NoTarget("event has no cgroup".to_string())),
        };

        let installed = if self.enforcement.enabled {
            target.and_then(|t| self.filters.install(&t, &action.expression, action.policy))
        } else {
            Err(ActionError::EnforcementDisabled)
        };
        match installed {
            Ok(()) => report.complete(ActionStatus::Performed),
            Err(e) => report.fail(&e),
        }
        self.emit_remediation(rule, event, RemediationAction::NetworkIsolation, action.scope.as_str(), &report);
        report
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Telemetry
    // ─────────────────────────────────────────────────────────────────────────

    fn emit_remediation(
        &self,
        rule: &Rule,
        event: &Event,
        action: RemediationAction,
        scope: &str,
        report: &ActionReport,
    ) {
        let state = match report.status {
            ActionStatus::Performed | ActionStatus::Done => RemediationState::Performed,
            ActionStatus::PartiallyPerformed => RemediationState::PartiallyPerformed,
            ActionStatus::Disarmed => RemediationState::Disarmed,
            ActionStatus::Failed | ActionStatus::Pending => RemediationState::Failed,
        };
        self.emit(rule, event, action, scope, state);
    }

    fn emit(&self, rule: &Rule, event: &Event, action: RemediationAction, scope: &str, state: RemediationState) {
        if !rule.is_remediation() {
            return;
        }
        self.telemetry.remediation_status(&RemediationStatus {
            rule_id: rule.id.clone(),
            event_type: event.event_type.as_str().to_string(),
            remediation_action: action,
            status: state,
            scope: scope.to_string(),
            pid: event.process.pid,
            rule_tags: rule.tags.clone(),
            timestamp_ns: unix_nanos(),
        });
    }
}
