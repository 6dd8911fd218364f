//! runtime-guard daemon
//!
//! Loads a policy, then reads one JSON document per line on stdin:
//!
//! ```text
//! {"event": {"type": "open", "process": {"pid": 42, ...}, "file": {"path": "/etc/shadow"}}}
//! {"lifecycle": {"process_exit": {"pid": 42}}}
//! {"lifecycle": {"container_exit": {"id": "abc123"}}}
//! ```
//!
//! Matched events (with their action reports) and completed deferred
//! actions are written to stdout as JSON lines; logs go to stderr.
//!
//! Usage: `runtime-guard <policy.json>` or `RUNTIME_GUARD_POLICY=<path>`.
//! Set `RUNTIME_GUARD_OTLP_ENDPOINT` to export traces.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use runtime_guard::actions::{FileHasher, HashScheduler};
use runtime_guard::telemetry::{LogSink, TelemetrySink};
use runtime_guard::tracing::{init_logging, init_tracing, shutdown_tracing};
use runtime_guard::{Event, LifecycleEvent, Policy, RuleEngine};

const POLICY_ENV: &str = "RUNTIME_GUARD_POLICY";
const OTLP_ENV: &str = "RUNTIME_GUARD_OTLP_ENDPOINT";

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum Input {
    Event(Event),
    Lifecycle(LifecycleEvent),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    match std::env::var(OTLP_ENV) {
        Ok(endpoint) => init_tracing("runtime-guard", Some(&endpoint))?,
        Err(_) => init_logging()?,
    }

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(POLICY_ENV).ok())
        .ok_or("usage: runtime-guard <policy.json>")?;
    let Policy { mut config, rules } = Policy::load(&path)?;
    config.apply_overrides(|key| std::env::var(key).ok())?;

    let telemetry: Arc<dyn TelemetrySink> = Arc::new(LogSink);
    let (scheduler, mut completed) = HashScheduler::spawn(
        FileHasher::new(config.hash.max_file_size),
        config.hash.timeout(),
        telemetry.clone(),
    );
    let engine = RuleEngine::builder(config)
        .with_telemetry(telemetry)
        .with_hash_scheduler(scheduler)
        .build()?;
    let loaded = engine.load_rules(&rules)?;
    info!(policy = %path, rules = loaded, "policy loaded");

    let printer = tokio::spawn(async move {
        while let Some(report) = completed.recv().await {
            println!("{}", json!({ "completed": report }));
        }
    });

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&engine, &line),
                None => break,
            },
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
        }
    }

    if let Ok(stats) = engine.rule_stats() {
        for (rule_id, s) in stats {
            info!(rule_id = %rule_id, allowed = s.allowed, dropped = s.dropped, "rule rate limiter");
        }
    }

    // Dropping the engine closes the scheduler, which flushes what is pending
    drop(engine);
    let _ = printer.await;
    shutdown_tracing();
    Ok(())
}

fn handle_line(engine: &RuleEngine, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<Input>(line) {
        Ok(Input::Event(event)) => {
            for matched in engine.process_event(&event) {
                match serde_json::to_string(&matched) {
                    Ok(out) => println!("{}", out),
                    Err(e) => warn!(rule_id = %matched.rule_id, error = %e, "failed to encode match"),
                }
            }
        }
        Ok(Input::Lifecycle(lifecycle)) => engine.handle_lifecycle(&lifecycle),
        Err(e) => warn!(error = %e, "skipping malformed input line"),
    }
}
