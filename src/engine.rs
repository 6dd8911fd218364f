//! Rule engine
//!
//! Owns every piece of shared state and runs the evaluation path:
//!
//! ```text
//!                     ┌─────────────────────────────────────────┐
//!   Event ──────────► │ rules of event.type                      │
//!                     │   │ matches(event, variables)?           │
//!                     │   ▼                                      │
//!                     │ rate limiter "rules"/<rule id>           │
//!                     │   ▼                                      │
//!                     │ dispatcher: rule-match listeners (veto)  │
//!                     │   ▼                                      │
//!                     │ ActionExecutor ──► ActionReports         │
//!                     │   ▼                                      │
//!                     │ dispatcher: custom events, send-event    │
//!                     └─────────────────────────────────────────┘
//!   no rule matched ──► discarders
//!   exit / lifecycle ─► release variables, finish hashes, drop filters
//! ```
//!
//! The engine is `Send + Sync`; events may be processed from any number of
//! threads at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::actions::filter::{FilterTable, FilterTarget, PacketFilterInstaller};
use crate::actions::hash::HashScheduler;
use crate::actions::kill::{NixSignaler, ProcessResolver, ProcessSignaler, ProcfsResolver};
use crate::actions::ActionExecutor;
use crate::config::EngineConfig;
use crate::disarmer::Transition;
use crate::dispatcher::{CustomEvent, CustomEventKind, Discarder, Dispatcher, MatchVerdict, MatchedEvent};
use crate::event::{Event, EventType, FieldAccessor, Value};
use crate::metrics::{RULE_RATE_LIMITER_ALLOW, RULE_RATE_LIMITER_DROP};
use crate::ratelimit::{Limit, LimiterStats, RateLimiterError, RateLimiterRegistry};
use crate::rules::{Rule, RuleDefinition, RuleError};
use crate::telemetry::{LogSink, TelemetrySink};
use crate::variables::{Scope, VariableStore};

/// Limiter group holding one limiter per loaded rule
pub const RULE_LIMITER_GROUP: &str = "rules";

/// Notification from the process/container lifecycle tracker
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    ProcessExit { pid: u32 },
    ContainerExit { id: String },
    CgroupReleased { id: String },
}

/// Error type for engine construction and rule loading
#[derive(Debug)]
pub enum EngineError {
    Rule(RuleError),
    RateLimiter(RateLimiterError),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Rule(e) => write!(f, "{}", e),
            EngineError::RateLimiter(e) => write!(f, "rate limiter: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<RuleError> for EngineError {
    fn from(e: RuleError) -> Self {
        EngineError::Rule(e)
    }
}

impl From<RateLimiterError> for EngineError {
    fn from(e: RateLimiterError) -> Self {
        EngineError::RateLimiter(e)
    }
}

/// A field every rule of an event type pins to a literal
struct DiscardableField {
    field: FieldAccessor,
    values: Vec<Value>,
}

#[derive(Default)]
struct Ruleset {
    by_id: HashMap<String, Arc<Rule>>,
    by_type: HashMap<EventType, Vec<Arc<Rule>>>,
    discardable: HashMap<EventType, Vec<DiscardableField>>,
}

impl Ruleset {
    fn build(rules: &[Arc<Rule>]) -> Self {
        let mut set = Ruleset::default();
        for rule in rules {
            set.by_id.insert(rule.id.clone(), rule.clone());
            set.by_type.entry(rule.event_type).or_default().push(rule.clone());
        }
        for (event_type, rules) in &set.by_type {
            let fields = discardable_fields(rules);
            if !fields.is_empty() {
                debug!(event_type = event_type.as_str(), fields = fields.len(), "discardable fields");
                set.discardable.insert(*event_type, fields);
            }
        }
        set
    }
}

fn discardable_fields(rules: &[Arc<Rule>]) -> Vec<DiscardableField> {
    let Some(equalities) = rules
        .iter()
        .map(|r| r.literal_equalities())
        .collect::<Option<Vec<_>>>()
    else {
        return Vec::new();
    };
    let Some(first) = equalities.first() else {
        return Vec::new();
    };

    let mut fields: Vec<DiscardableField> = Vec::new();
    for (field, _) in first {
        if fields.iter().any(|d| d.field == *field) {
            continue;
        }
        if !equalities.iter().all(|eqs| eqs.iter().any(|(f, _)| f == field)) {
            continue;
        }
        let values = equalities
            .iter()
            .flat_map(|eqs| eqs.iter().filter(|(f, _)| f == field).map(|(_, v)| v.clone()))
            .collect();
        fields.push(DiscardableField { field: *field, values });
    }
    fields
}

pub struct EngineBuilder {
    config: EngineConfig,
    signaler: Option<Arc<dyn ProcessSignaler>>,
    resolver: Option<Arc<dyn ProcessResolver>>,
    filters: Option<Arc<dyn PacketFilterInstaller>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    hash_scheduler: Option<HashScheduler>,
}

impl EngineBuilder {
    pub fn with_signaler(mut self, signaler: Arc<dyn ProcessSignaler>) -> Self {
        self.signaler = Some(signaler);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ProcessResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_filter_installer(mut self, filters: Arc<dyn PacketFilterInstaller>) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Deferred hashes are failed when no scheduler is set
    pub fn with_hash_scheduler(mut self, scheduler: HashScheduler) -> Self {
        self.hash_scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> Result<RuleEngine, EngineError> {
        let rl = &self.config.rate_limiter;
        let burst = i64::try_from(rl.default_burst).unwrap_or(i64::MAX);
        let default_limit = Limit::checked(rl.default_rate, burst)?;
        let limiters = Arc::new(RateLimiterRegistry::new(default_limit));
        limiters.register_group(RULE_LIMITER_GROUP, default_limit.rate, burst)?;

        let variables = Arc::new(VariableStore::new());
        let executor = ActionExecutor::new(
            &self.config,
            variables.clone(),
            self.signaler.unwrap_or_else(|| Arc::new(NixSignaler)),
            self.resolver.unwrap_or_else(|| Arc::new(ProcfsResolver::default())),
            self.filters.unwrap_or_else(|| Arc::new(FilterTable::new())),
            self.telemetry.unwrap_or_else(|| Arc::new(LogSink)),
            self.hash_scheduler,
        );

        info!(
            default_rate = default_limit.rate,
            default_burst = default_limit.burst,
            enforcement = self.config.enforcement.enabled,
            "rule engine created"
        );

        Ok(RuleEngine {
            config: self.config,
            rules: RwLock::new(Arc::new(Ruleset::default())),
            reload: Mutex::new(()),
            limiters,
            variables,
            executor,
            dispatcher: Arc::new(Dispatcher::new()),
        })
    }
}

pub struct RuleEngine {
    config: EngineConfig,
    rules: RwLock<Arc<Ruleset>>,
    /// Held for a whole reload so limiters, disarmers and rules agree
    reload: Mutex<()>,
    limiters: Arc<RateLimiterRegistry>,
    variables: Arc<VariableStore>,
    executor: ActionExecutor,
    dispatcher: Arc<Dispatcher>,
}

impl RuleEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            signaler: None,
            resolver: None,
            filters: None,
            telemetry: None,
            hash_scheduler: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn limiters(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiters
    }

    pub fn variables(&self) -> &Arc<VariableStore> {
        &self.variables
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Ids of the loaded rules, sorted
    pub fn rule_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rules.read().by_id.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Per-rule limiter counters since the last call
    pub fn rule_stats(&self) -> Result<std::collections::BTreeMap<String, LimiterStats>, RateLimiterError> {
        self.limiters.get_all_group_stats(RULE_LIMITER_GROUP)
    }

    /// Replace the loaded ruleset.
    ///
    /// Disabled rules are skipped. Nothing changes if any rule fails to
    /// compile. Returns the number of rules loaded.
    pub fn load_rules(&self, definitions: &[RuleDefinition]) -> Result<usize, EngineError> {
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(definitions.len());
        for def in definitions {
            if !seen.insert(def.id.as_str()) {
                return Err(RuleError::DuplicateId(def.id.clone()).into());
            }
            if def.disabled {
                debug!(rule_id = %def.id, "rule disabled, skipped");
                continue;
            }
            rules.push(Rule::compile(def)?);
        }
        self.load_compiled(rules)
    }

    /// Replace the loaded ruleset with rules compiled elsewhere
    pub fn load_compiled(&self, rules: Vec<Rule>) -> Result<usize, EngineError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if rule.id.is_empty() {
                return Err(RuleError::EmptyId.into());
            }
            if !seen.insert(rule.id.clone()) {
                return Err(RuleError::DuplicateId(rule.id.clone()).into());
            }
        }

        let rules: Vec<Arc<Rule>> = rules.into_iter().map(Arc::new).collect();
        let _reload = self.reload.lock();
        let previous = self.rules.read().clone();

        let ids: Vec<&str> = rules.iter().map(|r| r.id.as_str()).collect();
        self.limiters.set_group_limiters(RULE_LIMITER_GROUP, &ids);
        for rule in &rules {
            match rule.every {
                Some(every) if !every.is_zero() => {
                    self.limiters
                        .update_limit(RULE_LIMITER_GROUP, &rule.id, 1.0 / every.as_secs_f64(), 1)?;
                }
                _ if previous.by_id.get(&rule.id).is_some_and(|r| r.every.is_some()) => {
                    // `every` was dropped from the rule, back to the group default
                    let rl = &self.config.rate_limiter;
                    let burst = i64::try_from(rl.default_burst).unwrap_or(i64::MAX);
                    self.limiters
                        .update_limit(RULE_LIMITER_GROUP, &rule.id, rl.default_rate, burst)?;
                }
                _ => {}
            }
        }

        self.executor.register_rules(&rules);
        let count = rules.len();
        let rule_ids: Vec<String> = rules.iter().map(|r| r.id.clone()).collect();
        *self.rules.write() = Arc::new(Ruleset::build(&rules));

        info!(rules = count, "ruleset loaded");
        self.dispatcher.emit_custom(&CustomEvent {
            kind: CustomEventKind::RulesetLoaded,
            rule_id: None,
            payload: json!({ "rules": count, "rule_ids": rule_ids }),
        });
        Ok(count)
    }

    /// Evaluate one event. Returns the matches that were delivered, with
    /// the reports of their actions.
    pub fn process_event(&self, event: &Event) -> Vec<MatchedEvent> {
        let ruleset = self.rules.read().clone();
        let mut delivered = Vec::new();
        let mut matched_any = false;

        for rule in ruleset.by_type.get(&event.event_type).into_iter().flatten() {
            if !rule.matches(event, &self.variables) {
                continue;
            }
            matched_any = true;

            match self.limiters.allow(RULE_LIMITER_GROUP, &rule.id) {
                Ok(true) => RULE_RATE_LIMITER_ALLOW.with_label_values(&[rule.id.as_str()]).inc(),
                Ok(false) => {
                    RULE_RATE_LIMITER_DROP.with_label_values(&[rule.id.as_str()]).inc();
                    debug!(rule_id = %rule.id, pid = event.process.pid, "match rate limited");
                    continue;
                }
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "no limiter for rule, match dropped");
                    continue;
                }
            }

            if self.dispatcher.rule_matched(rule, event) == MatchVerdict::Drop {
                continue;
            }

            let execution = self.executor.execute(rule, event);
            for t in &execution.transitions {
                let kind = match t.transition {
                    Transition::Disarmed => CustomEventKind::RuleDisarmed,
                    Transition::Rearmed => CustomEventKind::RuleRearmed,
                };
                self.dispatcher.emit_custom(&CustomEvent {
                    kind,
                    rule_id: Some(t.rule_id.clone()),
                    payload: json!({ "disarmer": t.kind.as_str(), "key": t.key }),
                });
            }

            let matched = MatchedEvent {
                rule_id: rule.id.clone(),
                event: event.clone(),
                reports: execution.reports,
                tags: rule.tags.clone(),
            };
            self.dispatcher.send_event(&matched);
            delivered.push(matched);
        }

        if !matched_any {
            self.push_discarders(&ruleset, event);
        }
        if event.event_type == EventType::Exit {
            self.handle_lifecycle(&LifecycleEvent::ProcessExit {
                pid: event.process.pid,
            });
        }
        delivered
    }

    fn push_discarders(&self, ruleset: &Ruleset, event: &Event) {
        let Some(fields) = ruleset.discardable.get(&event.event_type) else {
            return;
        };
        for d in fields {
            let Some(value) = d.field.get(event) else {
                continue;
            };
            if d.values.contains(&value) {
                continue;
            }
            self.dispatcher.push_discarder(&Discarder {
                event_type: event.event_type,
                field: d.field.name().to_string(),
                value,
            });
        }
    }

    /// Release everything owned by a process, container or cgroup that went away
    pub fn handle_lifecycle(&self, lifecycle: &LifecycleEvent) {
        match lifecycle {
            LifecycleEvent::ProcessExit { pid } => {
                self.variables.release(Scope::Process, &pid.to_string());
                self.executor.notify_exit(*pid);
                self.executor.release_filters(&FilterTarget::Process(*pid));
            }
            LifecycleEvent::ContainerExit { id } => {
                self.variables.release(Scope::Container, id);
                self.executor.release_container(id);
            }
            LifecycleEvent::CgroupReleased { id } => {
                self.variables.release(Scope::Cgroup, id);
                self.executor.release_container(id);
                self.executor.release_filters(&FilterTarget::Cgroup(id.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ProcessContext;

    fn defs(json: &str) -> Vec<RuleDefinition> {
        serde_json::from_str(json).unwrap()
    }

    fn engine() -> RuleEngine {
        RuleEngine::builder(EngineConfig::default()).build().unwrap()
    }

    fn open(pid: u32, path: &str) -> Event {
        Event::new(
            EventType::Open,
            ProcessContext {
                pid,
                executable: "/bin/cat".to_string(),
                ..ProcessContext::default()
            },
        )
        .with_file(path)
    }

    #[test]
    fn test_load_is_atomic() {
        let engine = engine();
        engine
            .load_rules(&defs(r#"[{"id": "a", "conditions": [{"field": "open.file.path", "value": "/a"}]}]"#))
            .unwrap();

        let bad = engine.load_rules(&defs(
            r#"[{"id": "b", "conditions": [{"field": "open.file.path", "value": "/b"}]},
                {"id": "c", "conditions": [{"field": "nope", "value": 1}]}]"#,
        ));
        assert!(matches!(bad, Err(EngineError::Rule(RuleError::UnknownField { .. }))));
        assert_eq!(engine.rule_ids(), vec!["a"]);

        let dup = engine.load_rules(&defs(r#"[{"id": "x", "event_type": "open"}, {"id": "x", "event_type": "open"}]"#));
        assert!(matches!(dup, Err(EngineError::Rule(RuleError::DuplicateId(_)))));
    }

    #[test]
    fn test_limiters_follow_ruleset() {
        let engine = engine();
        let loaded = engine
            .load_rules(&defs(
                r#"[{"id": "a", "event_type": "open", "every_ms": 2000},
                    {"id": "b", "event_type": "open"},
                    {"id": "off", "event_type": "open", "disabled": true}]"#,
            ))
            .unwrap();
        assert_eq!(loaded, 2);
        assert_eq!(engine.limiters().ids(RULE_LIMITER_GROUP), vec!["a", "b"]);
        assert_eq!(engine.limiters().get_limit(RULE_LIMITER_GROUP, "a").unwrap(), Limit::new(0.5, 1));
        assert_eq!(engine.limiters().get_limit(RULE_LIMITER_GROUP, "b").unwrap(), Limit::new(1.0, 40));

        engine.load_rules(&defs(r#"[{"id": "a", "event_type": "open"}]"#)).unwrap();
        assert_eq!(engine.limiters().ids(RULE_LIMITER_GROUP), vec!["a"]);
        assert_eq!(engine.limiters().get_limit(RULE_LIMITER_GROUP, "a").unwrap(), Limit::new(1.0, 40));
    }

    #[test]
    fn test_concurrent_reloads_keep_limiters_in_step() {
        let engine = engine();
        let a = defs(r#"[{"id": "a", "event_type": "open"}]"#);
        let b = defs(r#"[{"id": "b", "event_type": "open", "every_ms": 1000}]"#);

        for _ in 0..500 {
            std::thread::scope(|s| {
                s.spawn(|| engine.load_rules(&a).unwrap());
                s.spawn(|| engine.load_rules(&b).unwrap());
            });
            assert_eq!(engine.limiters().ids(RULE_LIMITER_GROUP), engine.rule_ids());
        }
    }

    #[test]
    fn test_load_compiled_predicate_rule() {
        let engine = engine();
        let rule = Rule::with_predicate("ext", EventType::Open, |ev, _| ev.file.is_some())
            .with_every(std::time::Duration::from_secs(4))
            .with_tag("creator", "secops");
        assert_eq!(engine.load_compiled(vec![rule]).unwrap(), 1);
        assert_eq!(engine.limiters().get_limit(RULE_LIMITER_GROUP, "ext").unwrap(), Limit::new(0.25, 1));

        let delivered = engine.process_event(&open(7, "/tmp/x"));
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].tags.get("creator").map(String::as_str), Some("secops"));
        assert!(engine.process_event(&open(8, "/tmp/y")).is_empty());
    }

    #[test]
    fn test_every_suppresses_second_match() {
        let engine = engine();
        engine
            .load_rules(&defs(
                r#"[{"id": "r", "every_ms": 5000,
                     "conditions": [{"field": "open.file.path", "value": "/etc/shadow"}]}]"#,
            ))
            .unwrap();

        assert_eq!(engine.process_event(&open(10, "/etc/shadow")).len(), 1);
        assert!(engine.process_event(&open(11, "/etc/shadow")).is_empty());

        let stats = engine.rule_stats().unwrap();
        assert_eq!(stats["r"].allowed, 1);
        assert_eq!(stats["r"].dropped, 1);
    }

    #[test]
    fn test_discarders() {
        let engine = engine();
        engine
            .load_rules(&defs(
                r#"[{"id": "a", "conditions": [{"field": "open.file.path", "value": "/etc/shadow"},
                                               {"field": "process.uid", "value": 0}]},
                    {"id": "b", "conditions": [{"field": "open.file.path", "value": "/etc/sudoers"}]}]"#,
            ))
            .unwrap();

        let pushed = Arc::new(Mutex::new(Vec::new()));
        let sink = pushed.clone();
        engine.dispatcher().add_discarder_listener(move |d| sink.lock().push(d.clone()));

        engine.process_event(&open(5, "/tmp/scratch"));
        // no match either, but /etc/shadow is a value some rule waits for
        let mut non_root = open(5, "/etc/shadow");
        non_root.process.uid = 1;
        engine.process_event(&non_root);

        let pushed = pushed.lock();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].field, "open.file.path");
        assert_eq!(pushed[0].value, Value::from("/tmp/scratch"));
    }

    #[test]
    fn test_veto_skips_actions() {
        let engine = engine();
        engine
            .load_rules(&defs(
                r#"[{"id": "r", "conditions": [{"field": "open.file.path", "value": "/x"}],
                     "actions": [{"set": {"name": "hit", "value": true}}]}]"#,
            ))
            .unwrap();
        engine.dispatcher().add_rule_match_listener(|_, ev| {
            if ev.process.pid == 1 {
                MatchVerdict::Drop
            } else {
                MatchVerdict::Accept
            }
        });

        assert!(engine.process_event(&open(1, "/x")).is_empty());
        assert!(engine.variables().get(Scope::Global, "", "hit").is_none());

        let delivered = engine.process_event(&open(2, "/x"));
        assert_eq!(delivered[0].reports.len(), 1);
        assert_eq!(engine.variables().get(Scope::Global, "", "hit"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_exit_releases_process_variables() {
        let engine = engine();
        engine
            .load_rules(&defs(
                r#"[{"id": "r", "conditions": [{"field": "open.file.path", "value": "/x"}],
                     "actions": [{"set": {"name": "opened", "field": "open.file.path", "scope": "process"}}]}]"#,
            ))
            .unwrap();

        engine.process_event(&open(42, "/x"));
        assert!(engine.variables().get(Scope::Process, "42", "opened").is_some());

        let exit = Event::new(
            EventType::Exit,
            ProcessContext {
                pid: 42,
                ..ProcessContext::default()
            },
        );
        engine.process_event(&exit);
        assert!(engine.variables().get(Scope::Process, "42", "opened").is_none());
    }

    #[test]
    fn test_ruleset_loaded_event() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.dispatcher().add_custom_event_listener(move |e| sink.lock().push(e.clone()));

        engine.load_rules(&defs(r#"[{"id": "r", "event_type": "exec"}]"#)).unwrap();
        let seen = seen.lock();
        assert_eq!(seen[0].kind, CustomEventKind::RulesetLoaded);
        assert_eq!(seen[0].payload["rules"], 1);
    }
}
