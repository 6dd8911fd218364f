//! Rule definitions and their compiled form
//!
//! Rules arrive already parsed (from a policy file or the policy loader of
//! the embedding agent). Compilation resolves every field name to a typed
//! accessor, every signal name to a signal number and infers the event
//! type the rule applies to, so the evaluation path only walks structs.
//!
//! ```json
//! {
//!   "id": "kill_shadow_readers",
//!   "conditions": [
//!     {"field": "open.file.path", "value": "/etc/shadow"},
//!     {"field": "process.file.name", "op": "not_in", "value": "${allowed_readers}"}
//!   ],
//!   "actions": [{"kill": {"signal": "SIGKILL", "scope": "process"}}],
//!   "every_ms": 5000,
//!   "tags": {"remediation_rule": "true", "creator": "secops"}
//! }
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::actions::filter::{FilterPolicy, FilterScope};
use crate::actions::kill::{parse_signal, KillScope};
use crate::event::{Event, EventType, FieldAccessor, Value};
use crate::variables::{Scope, SetOptions, VariableStore};

/// Tag marking a rule whose actions are remediations
pub const REMEDIATION_TAG: &str = "remediation_rule";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Eq,
    Ne,
    In,
    NotIn,
    Contains,
    Prefix,
    Gt,
    Lt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionDefinition {
    pub field: String,
    #[serde(default)]
    pub op: Operator,
    /// Literal, or `${name}` / `${<scope>.name}` to read a variable
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillDefinition {
    pub signal: String,
    pub scope: KillScope,
    pub disable_executable_disarmer: bool,
    pub disable_container_disarmer: bool,
}

impl Default for KillDefinition {
    fn default() -> Self {
        Self {
            signal: "SIGKILL".to_string(),
            scope: KillScope::Process,
            disable_executable_disarmer: false,
            disable_container_disarmer: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HashDefinition {
    /// Field holding the path to hash, the event's file when unset
    pub field: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDefinition {
    pub name: String,
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub append: bool,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkFilterDefinition {
    pub bpf_filter: String,
    #[serde(default)]
    pub policy: FilterPolicy,
    #[serde(default)]
    pub scope: FilterScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionDefinition {
    Kill(KillDefinition),
    Hash(HashDefinition),
    Set(SetDefinition),
    NetworkFilter(NetworkFilterDefinition),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    /// Source expression, kept for reporting
    #[serde(default)]
    pub expression: String,
    /// Required only when no condition names an event-specific field
    #[serde(default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub conditions: Vec<ConditionDefinition>,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// At most one match per this many milliseconds
    #[serde(default)]
    pub every_ms: Option<u64>,
    #[serde(default)]
    pub disabled: bool,
}

/// Error type for rule compilation
#[derive(Debug, Clone, PartialEq)]
pub enum RuleError {
    EmptyId,
    DuplicateId(String),
    UnknownField { rule: String, field: String },
    EventTypeConflict { rule: String, first: EventType, second: EventType },
    MissingEventType(String),
    InvalidSignal { rule: String, signal: String },
    InvalidAction { rule: String, reason: String },
}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleError::EmptyId => write!(f, "rule without id"),
            RuleError::DuplicateId(id) => write!(f, "duplicate rule id {}", id),
            RuleError::UnknownField { rule, field } => {
                write!(f, "rule {}: unknown field {}", rule, field)
            }
            RuleError::EventTypeConflict { rule, first, second } => {
                write!(f, "rule {}: fields of both {} and {} events", rule, first, second)
            }
            RuleError::MissingEventType(rule) => {
                write!(f, "rule {}: cannot infer event type, set event_type", rule)
            }
            RuleError::InvalidSignal { rule, signal } => {
                write!(f, "rule {}: invalid signal {}", rule, signal)
            }
            RuleError::InvalidAction { rule, reason } => write!(f, "rule {}: {}", rule, reason),
        }
    }
}

impl std::error::Error for RuleError {}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Variable { scope: Scope, name: String },
}

impl Operand {
    fn parse(value: Value) -> Self {
        let reference = value
            .as_str()
            .and_then(|s| s.strip_prefix("${"))
            .and_then(|s| s.strip_suffix('}'))
            .map(str::to_string);

        let Some(reference) = reference else {
            return Operand::Literal(value);
        };
        match reference.split_once('.') {
            Some((scope, name)) => match Scope::parse(scope) {
                Some(scope) => Operand::Variable {
                    scope,
                    name: name.to_string(),
                },
                None => Operand::Variable {
                    scope: Scope::Global,
                    name: reference,
                },
            },
            None => Operand::Variable {
                scope: Scope::Global,
                name: reference,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct Condition {
    field: FieldAccessor,
    op: Operator,
    operand: Operand,
}

impl Condition {
    fn eval(&self, event: &Event, vars: &VariableStore) -> bool {
        let Some(actual) = self.field.get(event) else {
            return false;
        };

        let expected = match &self.operand {
            Operand::Literal(v) => Cow::Borrowed(v),
            Operand::Variable { scope, name } => {
                // Unset variables make the condition false
                let Some(owner) = scope.owner_key(event) else {
                    return false;
                };
                match vars.get(*scope, &owner, name) {
                    Some(v) => Cow::Owned(v),
                    None => return false,
                }
            }
        };

        match self.op {
            Operator::Eq => actual == *expected,
            Operator::Ne => actual != *expected,
            Operator::In => expected.contains(&actual),
            Operator::NotIn => !expected.contains(&actual),
            Operator::Contains => actual.contains(&expected),
            Operator::Prefix => match (actual.as_str(), expected.as_str()) {
                (Some(a), Some(e)) => a.starts_with(e),
                _ => false,
            },
            Operator::Gt => matches!((actual.as_int(), expected.as_int()), (Some(a), Some(e)) if a > e),
            Operator::Lt => matches!((actual.as_int(), expected.as_int()), (Some(a), Some(e)) if a < e),
        }
    }
}

/// Predicate compiled by an external expression evaluator
pub type ExternalPredicate = Arc<dyn Fn(&Event, &VariableStore) -> bool + Send + Sync>;

#[derive(Clone)]
enum Predicate {
    /// All conditions must hold
    Conditions(Vec<Condition>),
    External(ExternalPredicate),
}

#[derive(Debug, Clone)]
pub struct KillAction {
    pub signal: Signal,
    pub scope: KillScope,
    pub disable_executable_disarmer: bool,
    pub disable_container_disarmer: bool,
}

#[derive(Debug, Clone)]
pub struct HashAction {
    pub field: Option<FieldAccessor>,
}

#[derive(Debug, Clone)]
pub enum ValueSource {
    Literal(Value),
    Field(FieldAccessor),
}

#[derive(Debug, Clone)]
pub struct SetAction {
    pub name: String,
    pub scope: Scope,
    pub source: ValueSource,
    pub options: SetOptions,
}

#[derive(Debug, Clone)]
pub struct NetworkFilterAction {
    pub expression: String,
    pub policy: FilterPolicy,
    pub scope: FilterScope,
}

#[derive(Debug, Clone)]
pub enum Action {
    Kill(KillAction),
    Hash(HashAction),
    Set(SetAction),
    NetworkFilter(NetworkFilterAction),
}

/// A compiled rule
#[derive(Clone)]
pub struct Rule {
    pub id: String,
    pub event_type: EventType,
    pub expression: String,
    pub actions: Vec<Action>,
    pub tags: BTreeMap<String, String>,
    pub every: Option<Duration>,
    predicate: Predicate,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("actions", &self.actions.len())
            .finish()
    }
}

impl Rule {
    pub fn compile(def: &RuleDefinition) -> Result<Self, RuleError> {
        if def.id.is_empty() {
            return Err(RuleError::EmptyId);
        }

        let mut event_type = def.event_type;
        let mut conditions = Vec::with_capacity(def.conditions.len());
        for cond in &def.conditions {
            let field = resolve_field(&def.id, &cond.field)?;
            if let Some(t) = field.event_type() {
                match event_type {
                    Some(first) if first != t => {
                        return Err(RuleError::EventTypeConflict {
                            rule: def.id.clone(),
                            first,
                            second: t,
                        })
                    }
                    _ => event_type = Some(t),
                }
            }
            conditions.push(Condition {
                field,
                op: cond.op,
                operand: Operand::parse(cond.value.clone()),
            });
        }

        let event_type = event_type.ok_or_else(|| RuleError::MissingEventType(def.id.clone()))?;

        Ok(Self {
            id: def.id.clone(),
            event_type,
            expression: def.expression.clone(),
            actions: compile_actions(&def.id, &def.actions)?,
            tags: def.tags.clone(),
            every: def.every_ms.filter(|ms| *ms > 0).map(Duration::from_millis),
            predicate: Predicate::Conditions(conditions),
        })
    }

    /// Rule around a predicate compiled elsewhere
    pub fn with_predicate<F>(id: impl Into<String>, event_type: EventType, predicate: F) -> Self
    where
        F: Fn(&Event, &VariableStore) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            event_type,
            expression: String::new(),
            actions: Vec::new(),
            tags: BTreeMap::new(),
            every: None,
            predicate: Predicate::External(Arc::new(predicate)),
        }
    }

    pub fn with_actions(mut self, actions: &[ActionDefinition]) -> Result<Self, RuleError> {
        self.actions = compile_actions(&self.id, actions)?;
        Ok(self)
    }

    pub fn with_every(mut self, every: Duration) -> Self {
        self.every = Some(every);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, event: &Event, vars: &VariableStore) -> bool {
        if event.event_type != self.event_type {
            return false;
        }
        match &self.predicate {
            Predicate::Conditions(conds) => conds.iter().all(|c| c.eval(event, vars)),
            Predicate::External(f) => f(event, vars),
        }
    }

    pub fn is_remediation(&self) -> bool {
        self.tags.get(REMEDIATION_TAG).map(|v| v == "true").unwrap_or(false)
    }

    pub fn has_kill(&self) -> bool {
        self.actions.iter().any(|a| matches!(a, Action::Kill(_)))
    }

    /// `field == literal` conditions of this rule, `None` when its predicate
    /// is opaque. Used to derive discarders.
    pub(crate) fn literal_equalities(&self) -> Option<Vec<(FieldAccessor, Value)>> {
        match &self.predicate {
            Predicate::External(_) => None,
            Predicate::Conditions(conds) => Some(
                conds
                    .iter()
                    .filter_map(|c| match (&c.op, &c.operand) {
                        (Operator::Eq, Operand::Literal(v)) => Some((c.field, v.clone())),
                        _ => None,
                    })
                    .collect(),
            ),
        }
    }
}

fn resolve_field(rule: &str, name: &str) -> Result<FieldAccessor, RuleError> {
    FieldAccessor::resolve(name).ok_or_else(|| RuleError::UnknownField {
        rule: rule.to_string(),
        field: name.to_string(),
    })
}

fn compile_actions(rule: &str, defs: &[ActionDefinition]) -> Result<Vec<Action>, RuleError> {
    defs.iter().map(|def| compile_action(rule, def)).collect()
}

fn compile_action(rule: &str, def: &ActionDefinition) -> Result<Action, RuleError> {
    let invalid = |reason: &str| RuleError::InvalidAction {
        rule: rule.to_string(),
        reason: reason.to_string(),
    };

    match def {
        ActionDefinition::Kill(k) => {
            let signal = parse_signal(&k.signal).ok_or_else(|| RuleError::InvalidSignal {
                rule: rule.to_string(),
                signal: k.signal.clone(),
            })?;
            Ok(Action::Kill(KillAction {
                signal,
                scope: k.scope,
                disable_executable_disarmer: k.disable_executable_disarmer,
                disable_container_disarmer: k.disable_container_disarmer,
            }))
        }
        ActionDefinition::Hash(h) => {
            let field = h.field.as_deref().map(|f| resolve_field(rule, f)).transpose()?;
            Ok(Action::Hash(HashAction { field }))
        }
        ActionDefinition::Set(s) => {
            if s.name.is_empty() {
                return Err(invalid("set action without a name"));
            }
            let source = match (&s.value, &s.field) {
                (Some(v), None) => ValueSource::Literal(v.clone()),
                (None, Some(f)) => ValueSource::Field(resolve_field(rule, f)?),
                _ => return Err(invalid("set action needs exactly one of value or field")),
            };
            Ok(Action::Set(SetAction {
                name: s.name.clone(),
                scope: s.scope,
                source,
                options: SetOptions {
                    append: s.append,
                    ttl: s.ttl_ms.map(Duration::from_millis),
                    size: s.size,
                },
            }))
        }
        ActionDefinition::NetworkFilter(n) => {
            if n.bpf_filter.trim().is_empty() {
                return Err(invalid("network_filter with an empty bpf_filter"));
            }
            Ok(Action::NetworkFilter(NetworkFilterAction {
                expression: n.bpf_filter.clone(),
                policy: n.policy,
                scope: n.scope,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ProcessContext;

    fn def(json: &str) -> RuleDefinition {
        serde_json::from_str(json).unwrap()
    }

    fn open(pid: u32, exe: &str, path: &str) -> Event {
        Event::new(
            EventType::Open,
            ProcessContext {
                pid,
                executable: exe.to_string(),
                ..ProcessContext::default()
            },
        )
        .with_file(path)
    }

    #[test]
    fn test_compile_infers_event_type() {
        let rule = Rule::compile(&def(
            r#"{"id": "r", "conditions": [
                {"field": "process.uid", "value": 0},
                {"field": "open.file.path", "value": "/etc/shadow"}
            ]}"#,
        ))
        .unwrap();
        assert_eq!(rule.event_type, EventType::Open);
    }

    #[test]
    fn test_compile_errors() {
        let unknown = Rule::compile(&def(r#"{"id": "r", "conditions": [{"field": "open.nope", "value": 1}]}"#));
        assert!(matches!(unknown, Err(RuleError::UnknownField { .. })));

        let conflict = Rule::compile(&def(
            r#"{"id": "r", "conditions": [
                {"field": "open.file.path", "value": "/a"},
                {"field": "exec.file.path", "value": "/b"}
            ]}"#,
        ));
        assert!(matches!(conflict, Err(RuleError::EventTypeConflict { .. })));

        let missing = Rule::compile(&def(r#"{"id": "r", "conditions": [{"field": "process.pid", "value": 1}]}"#));
        assert_eq!(missing.unwrap_err(), RuleError::MissingEventType("r".to_string()));

        let signal = Rule::compile(&def(
            r#"{"id": "r", "event_type": "exec", "actions": [{"kill": {"signal": "SIGNOPE"}}]}"#,
        ));
        assert!(matches!(signal, Err(RuleError::InvalidSignal { .. })));

        let set = Rule::compile(&def(
            r#"{"id": "r", "event_type": "exec", "actions": [{"set": {"name": "x"}}]}"#,
        ));
        assert!(matches!(set, Err(RuleError::InvalidAction { .. })));
    }

    #[test]
    fn test_operators() {
        let vars = VariableStore::new();
        let rule = Rule::compile(&def(
            r#"{"id": "r", "conditions": [
                {"field": "open.file.path", "op": "prefix", "value": "/etc/"},
                {"field": "process.file.name", "op": "in", "value": ["cat", "less"]},
                {"field": "process.pid", "op": "gt", "value": 100}
            ]}"#,
        ))
        .unwrap();

        assert!(rule.matches(&open(200, "/bin/cat", "/etc/shadow"), &vars));
        assert!(!rule.matches(&open(50, "/bin/cat", "/etc/shadow"), &vars));
        assert!(!rule.matches(&open(200, "/bin/vim", "/etc/shadow"), &vars));
        assert!(!rule.matches(&open(200, "/bin/cat", "/tmp/x"), &vars));
    }

    #[test]
    fn test_variable_operand() {
        let vars = VariableStore::new();
        let rule = Rule::compile(&def(
            r#"{"id": "r", "conditions": [
                {"field": "open.file.path", "op": "in", "value": "${process.watched}"}
            ]}"#,
        ))
        .unwrap();
        let ev = open(9, "/bin/cat", "/etc/hosts");

        // unset variable evaluates to false, never errors
        assert!(!rule.matches(&ev, &vars));

        vars.set(Scope::Process, "9", "watched", Value::from("/etc/hosts"), true);
        assert!(rule.matches(&ev, &vars));
        assert!(!rule.matches(&open(10, "/bin/cat", "/etc/hosts"), &vars));
    }

    #[test]
    fn test_operand_parsing() {
        assert_eq!(
            Operand::parse(Value::from("${container.tainted}")),
            Operand::Variable {
                scope: Scope::Container,
                name: "tainted".to_string()
            }
        );
        assert_eq!(
            Operand::parse(Value::from("${allowed}")),
            Operand::Variable {
                scope: Scope::Global,
                name: "allowed".to_string()
            }
        );
        assert_eq!(Operand::parse(Value::from("$HOME")), Operand::Literal(Value::from("$HOME")));
    }

    #[test]
    fn test_actions_compile() {
        let rule = Rule::compile(&def(
            r#"{"id": "r", "event_type": "open", "every_ms": 5000,
                "tags": {"remediation_rule": "true"},
                "actions": [
                    {"kill": {"signal": "SIGTERM", "scope": "container"}},
                    {"hash": {}},
                    {"set": {"name": "seen", "field": "open.file.path", "append": true, "size": 10}},
                    {"network_filter": {"bpf_filter": "port 53", "policy": "drop"}}
                ]}"#,
        ))
        .unwrap();

        assert_eq!(rule.every, Some(Duration::from_secs(5)));
        assert!(rule.is_remediation());
        assert!(rule.has_kill());
        assert_eq!(rule.actions.len(), 4);
        match &rule.actions[0] {
            Action::Kill(k) => {
                assert_eq!(k.signal, Signal::SIGTERM);
                assert_eq!(k.scope, KillScope::Container);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_external_predicate() {
        let vars = VariableStore::new();
        let rule = Rule::with_predicate("ext", EventType::Open, |ev, _| ev.process.pid == 1);
        assert!(rule.matches(&open(1, "/sbin/init", "/x"), &vars));
        assert!(!rule.matches(&open(2, "/sbin/init", "/x"), &vars));
        assert!(rule.literal_equalities().is_none());
    }
}
