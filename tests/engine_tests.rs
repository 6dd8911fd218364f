//! Integration tests for the rule engine
//!
//! These drive `RuleEngine` through its public API with recording fakes in
//! place of kill(2), procfs and the telemetry backend.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use parking_lot::Mutex;

use runtime_guard::actions::{
    ActionKind, ActionStatus, FileHasher, HashScheduler, HashTrigger, ProcessResolver, ProcessSignaler,
};
use runtime_guard::dispatcher::{CustomEventKind, Delivery};
use runtime_guard::telemetry::{MemorySink, RemediationState};
use runtime_guard::{
    ActionError, EngineConfig, Event, EventType, LifecycleEvent, ProcessContext, RuleDefinition, RuleEngine,
    Scope, Value,
};

#[derive(Default)]
struct RecordingSignaler {
    sent: Mutex<Vec<(u32, Signal)>>,
}

impl RecordingSignaler {
    fn pids(&self) -> Vec<u32> {
        self.sent.lock().iter().map(|(pid, _)| *pid).collect()
    }
}

impl ProcessSignaler for RecordingSignaler {
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ActionError> {
        self.sent.lock().push((pid, signal));
        Ok(())
    }
}

/// Every process is alive and alone in its scope
struct LiveResolver;

impl ProcessResolver for LiveResolver {
    fn cgroup_pids(&self, _: &str) -> io::Result<Vec<u32>> {
        Ok(Vec::new())
    }
    fn container_pids(&self, _: &str) -> io::Result<Vec<u32>> {
        Ok(Vec::new())
    }
    fn is_alive(&self, _: u32) -> bool {
        true
    }
}

struct Fixture {
    engine: RuleEngine,
    signaler: Arc<RecordingSignaler>,
    sink: Arc<MemorySink>,
}

fn fixture(config: EngineConfig, rules: &str, scheduler: Option<HashScheduler>) -> Fixture {
    let signaler = Arc::new(RecordingSignaler::default());
    let sink = Arc::new(MemorySink::default());
    let mut builder = RuleEngine::builder(config)
        .with_signaler(signaler.clone())
        .with_resolver(Arc::new(LiveResolver))
        .with_telemetry(sink.clone());
    if let Some(scheduler) = scheduler {
        builder = builder.with_hash_scheduler(scheduler);
    }
    let engine = builder.build().unwrap();

    let defs: Vec<RuleDefinition> = serde_json::from_str(rules).unwrap();
    engine.load_rules(&defs).unwrap();
    Fixture { engine, signaler, sink }
}

fn event(event_type: EventType, pid: u32, exe: &str, container: Option<&str>) -> Event {
    Event::new(
        event_type,
        ProcessContext {
            pid,
            ppid: 1,
            executable: exe.to_string(),
            container_id: container.map(str::to_string),
            ..ProcessContext::default()
        },
    )
}

/// A rule with `every` lets one match through per window
#[test]
fn test_every_limits_kills_across_processes() {
    let f = fixture(
        EngineConfig::default(),
        r#"[{"id": "kill_shadow_open", "every_ms": 5000,
             "conditions": [{"field": "open.file.path", "value": "/etc/shadow"}],
             "actions": [{"kill": {"signal": "SIGKILL"}}]}]"#,
        None,
    );

    let first = f
        .engine
        .process_event(&event(EventType::Open, 1001, "/bin/cat", None).with_file("/etc/shadow"));
    let second = f
        .engine
        .process_event(&event(EventType::Open, 1002, "/bin/cat", None).with_file("/etc/shadow"));

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].reports[0].status, ActionStatus::Performed);
    assert!(second.is_empty());
    assert_eq!(f.signaler.pids(), vec![1001]);
}

/// Disarm after the threshold, re-arm after a quiet period
#[test]
fn test_kill_disarm_and_rearm() {
    let mut config = EngineConfig::default();
    config.enforcement.disarmer.executable.max_allowed = 1;
    config.enforcement.disarmer.executable.period_ms = 200;
    config.enforcement.disarmer.container.enabled = false;

    let f = fixture(
        config,
        r#"[{"id": "kill_sleep", "tags": {"remediation_rule": "true", "creator": "secops"},
             "conditions": [{"field": "exec.file.path", "value": "/usr/bin/sleep"}],
             "actions": [{"kill": {}}]}]"#,
        None,
    );
    let customs = Arc::new(Mutex::new(Vec::new()));
    let seen = customs.clone();
    f.engine
        .dispatcher()
        .add_custom_event_listener(move |e| seen.lock().push(e.kind));

    let exec_sleep = |pid| event(EventType::Exec, pid, "/usr/bin/sleep", None).with_file("/usr/bin/sleep");
    let status = |pid| f.engine.process_event(&exec_sleep(pid))[0].reports[0].status;

    assert_eq!(status(2001), ActionStatus::Performed);
    assert_eq!(status(2002), ActionStatus::Performed);
    assert_eq!(status(2003), ActionStatus::Disarmed);
    assert_eq!(f.signaler.pids(), vec![2001, 2002]);

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(status(2004), ActionStatus::Performed);
    assert_eq!(f.signaler.pids(), vec![2001, 2002, 2004]);

    assert_eq!(
        *customs.lock(),
        vec![CustomEventKind::RuleDisarmed, CustomEventKind::RuleRearmed]
    );

    let states: Vec<RemediationState> = f.sink.statuses().iter().map(|s| s.status).collect();
    assert_eq!(
        states,
        vec![
            RemediationState::Performed,
            RemediationState::RuleDisarmed,
            RemediationState::Performed,
            RemediationState::Disarmed,
            RemediationState::Performed,
        ]
    );
    let last = f.sink.statuses().pop().unwrap();
    assert_eq!(last.rule_id, "kill_sleep");
    assert_eq!(last.pid, 2004);
    assert_eq!(last.rule_tags.get("creator").map(String::as_str), Some("secops"));
}

/// One executable storming inside a container does not disarm other containers
#[test]
fn test_container_disarmer_is_per_container() {
    let mut config = EngineConfig::default();
    config.enforcement.disarmer.executable.enabled = false;
    config.enforcement.disarmer.container.max_allowed = 1;

    let f = fixture(
        config,
        r#"[{"id": "kill_miner", "conditions": [{"field": "process.file.name", "value": "xmrig"}],
             "event_type": "exec", "actions": [{"kill": {"scope": "process"}}]}]"#,
        None,
    );
    let run = |pid, container| {
        f.engine
            .process_event(&event(EventType::Exec, pid, "/tmp/xmrig", Some(container)))[0]
            .reports[0]
            .status
    };

    assert_eq!(run(3001, "c1"), ActionStatus::Performed);
    assert_eq!(run(3002, "c1"), ActionStatus::Performed);
    assert_eq!(run(3003, "c1"), ActionStatus::Disarmed);
    assert_eq!(run(3004, "c2"), ActionStatus::Performed);

    // a container id that exits takes its disarm state with it
    f.engine
        .handle_lifecycle(&LifecycleEvent::ContainerExit { id: "c1".to_string() });
    assert_eq!(run(3005, "c1"), ActionStatus::Performed);
}

fn hashed_file() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dropper.sh");
    std::fs::write(&path, "hello").unwrap();
    (dir, path.to_string_lossy().into_owned())
}

const HASH_RULE: &str = r#"[{"id": "hash_tmp_writes",
    "conditions": [{"field": "open.file.path", "op": "prefix", "value": "/"}],
    "actions": [{"hash": {}}]}]"#;

const HELLO_SHA256: &str = "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

#[tokio::test]
async fn test_hash_completes_on_process_exit() {
    let (_dir, path) = hashed_file();
    let sink = Arc::new(MemorySink::default());
    let (scheduler, mut completed) =
        HashScheduler::spawn(FileHasher::new(1 << 20), Duration::from_secs(30), sink.clone());
    let f = fixture(EngineConfig::default(), HASH_RULE, Some(scheduler));

    let matched = f
        .engine
        .process_event(&event(EventType::Open, 4001, "/bin/sh", None).with_file(path.as_str()));
    let pending = &matched[0].reports[0];
    assert_eq!(pending.kind, ActionKind::Hash);
    assert_eq!(pending.status, ActionStatus::Pending);

    f.engine
        .process_event(&event(EventType::Exit, 4001, "/bin/sh", None));

    let done = tokio::time::timeout(Duration::from_secs(5), completed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.id, pending.id);
    assert_eq!(done.status, ActionStatus::Done);
    assert_eq!(done.trigger, Some(HashTrigger::ProcessExit));
    assert_eq!(done.hashes, vec![HELLO_SHA256.to_string()]);
    assert_eq!(sink.completed().len(), 1);
}

#[tokio::test]
async fn test_hash_completes_on_timeout() {
    let (_dir, path) = hashed_file();
    let (scheduler, mut completed) = HashScheduler::spawn(
        FileHasher::new(1 << 20),
        Duration::from_millis(100),
        Arc::new(MemorySink::default()),
    );
    let f = fixture(EngineConfig::default(), HASH_RULE, Some(scheduler));

    f.engine
        .process_event(&event(EventType::Open, 4002, "/bin/sh", None).with_file(path.as_str()));

    let done = tokio::time::timeout(Duration::from_secs(5), completed.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, ActionStatus::Done);
    assert_eq!(done.trigger, Some(HashTrigger::Timeout));
    assert_eq!(done.hashes, vec![HELLO_SHA256.to_string()]);
}

#[test]
fn test_hash_without_scheduler_fails() {
    let (_dir, path) = hashed_file();
    let f = fixture(EngineConfig::default(), HASH_RULE, None);

    let matched = f
        .engine
        .process_event(&event(EventType::Open, 4003, "/bin/sh", None).with_file(path.as_str()));
    assert_eq!(matched[0].reports[0].status, ActionStatus::Failed);
}

/// Variables written by one rule steer another, and die with their container
#[test]
fn test_container_variables_drive_rules() {
    let f = fixture(
        EngineConfig::default(),
        r#"[{"id": "track_drops",
             "conditions": [{"field": "open.file.path", "op": "prefix", "value": "/tmp/"}],
             "actions": [{"set": {"name": "dropped", "scope": "container",
                                  "field": "open.file.path", "append": true}}]},
            {"id": "kill_dropped_exec",
             "conditions": [{"field": "exec.file.path", "op": "in", "value": "${container.dropped}"}],
             "actions": [{"kill": {}}]}]"#,
        None,
    );

    let exec_payload = |pid, container| {
        event(EventType::Exec, pid, "/tmp/payload", Some(container)).with_file("/tmp/payload")
    };

    // nothing dropped yet: the unset variable makes the rule false
    assert!(f.engine.process_event(&exec_payload(5001, "c1")).is_empty());

    for path in ["/tmp/a", "/tmp/payload"] {
        f.engine
            .process_event(&event(EventType::Open, 5002, "/usr/bin/curl", Some("c1")).with_file(path));
    }
    assert_eq!(
        f.engine.variables().get(Scope::Container, "c1", "dropped"),
        Some(Value::List(vec![Value::from("/tmp/a"), Value::from("/tmp/payload")]))
    );
    assert_eq!(
        f.engine.variables().get_all().get("container.dropped.c1"),
        Some(&Value::List(vec![Value::from("/tmp/a"), Value::from("/tmp/payload")]))
    );

    let matched = f.engine.process_event(&exec_payload(5003, "c1"));
    assert_eq!(matched[0].rule_id, "kill_dropped_exec");
    // another container never dropped the file
    assert!(f.engine.process_event(&exec_payload(5004, "c2")).is_empty());

    f.engine.handle_lifecycle(&LifecycleEvent::ContainerExit { id: "c1".to_string() });
    assert!(f.engine.variables().get(Scope::Container, "c1", "dropped").is_none());
    assert!(f.engine.process_event(&exec_payload(5005, "c1")).is_empty());
}

#[tokio::test]
async fn test_waiter_receives_match() {
    let f = fixture(
        EngineConfig::default(),
        r#"[{"id": "sysctl_write", "conditions": [{"field": "sysctl.name", "op": "prefix", "value": "kernel."}]}]"#,
        None,
    );
    let mut waiter = f.engine.dispatcher().wait_for(Some("sysctl_write"), Delivery::Skip);

    let mut ev = event(EventType::Sysctl, 6001, "/sbin/sysctl", None);
    ev.sysctl = Some(runtime_guard::event::SysctlInfo {
        name: "kernel.yama.ptrace_scope".to_string(),
        value: "0".to_string(),
    });
    f.engine.process_event(&ev);

    let matched = waiter.next(Duration::from_secs(1)).await.unwrap();
    assert_eq!(matched.rule_id, "sysctl_write");
    assert_eq!(matched.event.process.pid, 6001);
}

#[test]
fn test_matched_event_json() {
    let f = fixture(
        EngineConfig::default(),
        r#"[{"id": "kill_nc", "event_type": "exec", "tags": {"remediation_rule": "true"},
             "conditions": [{"field": "process.file.name", "value": "nc"}],
             "actions": [{"kill": {"signal": "SIGTERM", "scope": "process"}}]}]"#,
        None,
    );

    let matched = f
        .engine
        .process_event(&event(EventType::Exec, 7001, "/usr/bin/nc", None).with_file("/usr/bin/nc"));
    let json = serde_json::to_value(&matched[0]).unwrap();

    assert_eq!(json["rule_id"], "kill_nc");
    assert_eq!(json["event"]["type"], "exec");
    assert_eq!(json["reports"][0]["kind"], "kill");
    assert_eq!(json["reports"][0]["status"], "performed");
    assert_eq!(json["reports"][0]["signal"], "SIGTERM");
    assert_eq!(json["reports"][0]["pids"][0], 7001);
    assert_eq!(json["tags"]["remediation_rule"], "true");
}
