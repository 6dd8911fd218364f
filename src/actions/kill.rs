//! Kill action plumbing: signal delivery and scope → pid resolution
//!
//! A kill targets one of three scopes:
//!
//! ```text
//! process    → the pid of the event
//! cgroup     → every pid listed in <cgroup_root>/<cgroup id>/cgroup.procs
//! container  → every pid whose /proc/<pid>/cgroup mentions the container id
//! ```

use std::fs;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use super::report::ActionError;
use crate::event::Event;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KillScope {
    #[default]
    Process,
    Cgroup,
    Container,
}

impl KillScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillScope::Process => "process",
            KillScope::Cgroup => "cgroup",
            KillScope::Container => "container",
        }
    }
}

/// Parse `SIGKILL`, `kill`, `sigterm` or a signal number
pub fn parse_signal(name: &str) -> Option<Signal> {
    let name = name.trim();
    if let Ok(num) = name.parse::<i32>() {
        return Signal::try_from(num).ok();
    }
    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&full).ok()
}

/// Delivers signals to processes
pub trait ProcessSignaler: Send + Sync {
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ActionError>;
}

/// Signals through kill(2)
pub struct NixSignaler;

impl ProcessSignaler for NixSignaler {
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ActionError> {
        let raw = i32::try_from(pid).map_err(|_| ActionError::Signal {
            pid,
            reason: "pid out of range".to_string(),
        })?;
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(ActionError::ProcessGone(pid)),
            Err(e) => Err(ActionError::Signal {
                pid,
                reason: e.desc().to_string(),
            }),
        }
    }
}

/// Answers which processes live in a scope
pub trait ProcessResolver: Send + Sync {
    fn cgroup_pids(&self, cgroup_id: &str) -> io::Result<Vec<u32>>;
    fn container_pids(&self, container_id: &str) -> io::Result<Vec<u32>>;
    fn is_alive(&self, pid: u32) -> bool;
}

/// Resolver reading procfs and the cgroup v2 hierarchy
pub struct ProcfsResolver {
    proc_root: PathBuf,
    cgroup_root: PathBuf,
}

impl ProcfsResolver {
    pub fn new(proc_root: impl Into<PathBuf>, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            cgroup_root: cgroup_root.into(),
        }
    }
}

impl Default for ProcfsResolver {
    fn default() -> Self {
        Self::new("/proc", "/sys/fs/cgroup")
    }
}

impl ProcessResolver for ProcfsResolver {
    fn cgroup_pids(&self, cgroup_id: &str) -> io::Result<Vec<u32>> {
        let procs = self
            .cgroup_root
            .join(cgroup_id.trim_start_matches('/'))
            .join("cgroup.procs");
        let content = fs::read_to_string(procs)?;
        Ok(content.lines().filter_map(|l| l.trim().parse().ok()).collect())
    }

    fn container_pids(&self, container_id: &str) -> io::Result<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.proc_root)? {
            let entry = entry?;
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes may exit while we scan
            if let Ok(cgroups) = fs::read_to_string(entry.path().join("cgroup")) {
                if cgroups.contains(container_id) {
                    pids.push(pid);
                }
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.proc_root.join(pid.to_string()).exists()
    }
}

/// Pids a kill with `scope` should reach for `event`
pub(crate) fn kill_targets(
    scope: KillScope,
    event: &Event,
    resolver: &dyn ProcessResolver,
) -> Result<Vec<u32>, ActionError> {
    let io_err = |e: io::Error| ActionError::NoTarget(e.to_string());
    match scope {
        KillScope::Process => Ok(vec![event.process.pid]),
        KillScope::Cgroup => {
            let id = event
                .cgroup_id()
                .ok_or_else(|| ActionError::NoTarget("event has no cgroup".to_string()))?;
            resolver.cgroup_pids(id).map_err(io_err)
        }
        KillScope::Container => {
            let id = event
                .container_id()
                .ok_or_else(|| ActionError::NoTarget("event has no container".to_string()))?;
            resolver.container_pids(id).map_err(io_err)
        }
    }
}
