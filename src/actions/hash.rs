//! Hash action: file hashing with deferred completion
//!
//! A file opened by a live process may still be written to, so the hash is
//! taken when the process exits, or when the timeout elapses, whichever
//! comes first. Deferred hashes are owned by a single tokio task fed
//! through a channel:
//!
//! ```text
//!  executor ──Schedule(report, pid, path)──┐
//!                                          ▼
//!  engine ────ProcessExit(pid)──────► [ scheduler task ] ──► completion channel
//!                                          ▲                  + telemetry
//!  timer ─────deadline reached─────────────┘
//! ```
//!
//! A pending hash completes exactly once; the first trigger wins.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use super::report::{ActionError, ActionReport, ActionStatus, HashTrigger};
use crate::metrics::ACTIONS;
use crate::telemetry::TelemetrySink;

const READ_CHUNK: usize = 64 * 1024;

/// SHA-256 over a whole file, refusing files above a size cap
#[derive(Debug, Clone, Copy)]
pub struct FileHasher {
    max_file_size: u64,
}

impl FileHasher {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }

    /// Returns `sha256:<hex>`
    pub fn hash_file(&self, path: &Path) -> Result<String, ActionError> {
        let file = File::open(path).map_err(|e| ActionError::Hash(format!("{}: {}", path.display(), e)))?;
        let size = file
            .metadata()
            .map_err(|e| ActionError::Hash(e.to_string()))?
            .len();
        if size > self.max_file_size {
            return Err(ActionError::Hash(format!(
                "{} is {} bytes, above the {} byte limit",
                path.display(),
                size,
                self.max_file_size
            )));
        }

        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf).map_err(|e| ActionError::Hash(e.to_string()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }
}

enum HashCommand {
    Schedule(PendingHash),
    ProcessExit(u32),
}

struct PendingHash {
    report: ActionReport,
    pid: u32,
    path: PathBuf,
    deadline: Instant,
}

/// Handle to the deferred-hash task. Cheap to clone.
#[derive(Clone)]
pub struct HashScheduler {
    tx: mpsc::UnboundedSender<HashCommand>,
    timeout: Duration,
}

impl HashScheduler {
    /// Spawn the scheduler task on the current tokio runtime.
    ///
    /// Returns the handle and the channel on which completed reports arrive.
    pub fn spawn(
        hasher: FileHasher,
        timeout: Duration,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> (Self, mpsc::UnboundedReceiver<ActionReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx, done_tx, hasher, telemetry));
        (Self { tx, timeout }, done_rx)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Queue a hash of `path`, completed when `pid` exits or the timeout elapses
    pub fn schedule(&self, report: ActionReport, pid: u32, path: PathBuf) -> Result<(), ActionError> {
        let pending = PendingHash {
            report,
            pid,
            path,
            deadline: Instant::now() + self.timeout,
        };
        self.tx
            .send(HashCommand::Schedule(pending))
            .map_err(|_| ActionError::SchedulerUnavailable)
    }

    pub fn notify_exit(&self, pid: u32) {
        let _ = self.tx.send(HashCommand::ProcessExit(pid));
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<HashCommand>,
    done_tx: mpsc::UnboundedSender<ActionReport>,
    hasher: FileHasher,
    telemetry: Arc<dyn TelemetrySink>,
) {
    let mut pending: Vec<PendingHash> = Vec::new();

    loop {
        let next_deadline = pending.iter().map(|p| p.deadline).min();
        // Parked far away when nothing is pending; the branch is disabled anyway
        let wake_at = next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(HashCommand::Schedule(p)) => {
                    debug!(rule_id = %p.report.rule_id, pid = p.pid, path = %p.path.display(), "hash deferred");
                    pending.push(p);
                }
                Some(HashCommand::ProcessExit(pid)) => {
                    let (ready, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|p| p.pid == pid);
                    pending = rest;
                    for p in ready {
                        finish(p, HashTrigger::ProcessExit, hasher, &done_tx, telemetry.as_ref()).await;
                    }
                }
                None => break,
            },
            _ = sleep_until(wake_at), if next_deadline.is_some() => {
                let now = Instant::now();
                let (ready, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|p| p.deadline <= now);
                pending = rest;
                for p in ready {
                    finish(p, HashTrigger::Timeout, hasher, &done_tx, telemetry.as_ref()).await;
                }
            }
        }
    }

    // Every handle is gone; nothing will ever trigger what is left
    for mut p in pending {
        p.report.fail(&ActionError::Timeout);
        publish(p.report, &done_tx, telemetry.as_ref());
    }
}

async fn finish(
    mut p: PendingHash,
    trigger: HashTrigger,
    hasher: FileHasher,
    done_tx: &mpsc::UnboundedSender<ActionReport>,
    telemetry: &dyn TelemetrySink,
) {
    let path = p.path.clone();
    let result = tokio::task::spawn_blocking(move || hasher.hash_file(&path))
        .await
        .unwrap_or_else(|e| Err(ActionError::Hash(e.to_string())));

    p.report.trigger = Some(trigger);
    match result {
        Ok(hash) => {
            p.report.hashes.push(hash);
            p.report.complete(ActionStatus::Done);
        }
        Err(e) => {
            warn!(rule_id = %p.report.rule_id, path = %p.path.display(), error = %e, "deferred hash failed");
            p.report.fail(&e);
        }
    }
    publish(p.report, done_tx, telemetry);
}

fn publish(report: ActionReport, done_tx: &mpsc::UnboundedSender<ActionReport>, telemetry: &dyn TelemetrySink) {
    ACTIONS
        .with_label_values(&[report.kind.as_str(), report.status.as_str()])
        .inc();
    telemetry.action_completed(&report);
    let _ = done_tx.send(report);
}
