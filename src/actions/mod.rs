//! Rule actions
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ActionExecutor                        │
//! │                                                              │
//! │   kill ─────────► KillDisarmer ──► ProcessSignaler           │
//! │                                    ProcessResolver           │
//! │   hash ─────────► FileHasher / HashScheduler (tokio task)    │
//! │   set ──────────► VariableStore                              │
//! │   network_filter ► PacketFilterInstaller                     │
//! │                                                              │
//! │   every action ──► ActionReport (+ remediation telemetry)    │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod executor;
pub mod filter;
pub mod hash;
pub mod kill;
pub mod report;

pub use executor::{ActionExecutor, DisarmTransition, Execution};
pub use filter::{FilterPolicy, FilterScope, FilterTable, FilterTarget, InstalledFilter, PacketFilterInstaller};
pub use hash::{FileHasher, HashScheduler};
pub use kill::{parse_signal, KillScope, NixSignaler, ProcessResolver, ProcessSignaler, ProcfsResolver};
pub use report::{ActionError, ActionKind, ActionReport, ActionStatus, HashTrigger};
