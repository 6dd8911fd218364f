//! Rule match dispatcher
//!
//! Notification fan-out for the evaluation path. For a matched event the
//! engine walks the chains in a fixed order:
//!
//! ```text
//!   rule-match listeners ──(any Drop?)──► stop
//!          │ accept
//!          ▼
//!   actions executed by the engine
//!          │
//!          ▼
//!   custom-event listeners (rule_disarmed / rule_rearmed)
//!          │
//!          ▼
//!   send-event listeners ──► waiters
//! ```
//!
//! Discarder listeners are called instead when an event matched nothing.
//!
//! Waiters are consumers blocked on the next match of a rule. A `Skip`
//! waiter holds at most one undelivered match and drops the rest; a
//! `Continue` waiter queues every match.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::actions::report::ActionReport;
use crate::event::{Event, EventType, Value};
use crate::metrics::{DISCARDERS, WAITER_DROPS};
use crate::rules::Rule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchVerdict {
    Accept,
    /// Stop processing this match: no actions, no send-event
    Drop,
}

/// A field value that can never make any rule of an event type match
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discarder {
    pub event_type: EventType,
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomEventKind {
    RulesetLoaded,
    RuleDisarmed,
    RuleRearmed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CustomEvent {
    pub kind: CustomEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub payload: serde_json::Value,
}

/// An event that matched a rule, with the reports of the rule's actions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedEvent {
    pub rule_id: String,
    pub event: Event,
    pub reports: Vec<ActionReport>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

/// What a waiter does with matches arriving while one is still undelivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queue them
    Continue,
    /// Drop them
    Skip,
}

type RuleMatchListener = Arc<dyn Fn(&Rule, &Event) -> MatchVerdict + Send + Sync>;
type DiscarderListener = Arc<dyn Fn(&Discarder) + Send + Sync>;
type CustomEventListener = Arc<dyn Fn(&CustomEvent) + Send + Sync>;
type SendEventListener = Arc<dyn Fn(&MatchedEvent) + Send + Sync>;

enum WaiterTx {
    Bounded(mpsc::Sender<MatchedEvent>),
    Unbounded(mpsc::UnboundedSender<MatchedEvent>),
}

struct WaiterSlot {
    rule_id: Option<String>,
    tx: WaiterTx,
}

enum WaiterRx {
    Bounded(mpsc::Receiver<MatchedEvent>),
    Unbounded(mpsc::UnboundedReceiver<MatchedEvent>),
}

/// Receiving end of `Dispatcher::wait_for`. Dropping it unregisters the waiter.
pub struct Waiter {
    rx: WaiterRx,
}

impl Waiter {
    /// Next match, or `None` if none arrives within `timeout`
    pub async fn next(&mut self, timeout: Duration) -> Option<MatchedEvent> {
        let recv = async {
            match &mut self.rx {
                WaiterRx::Bounded(rx) => rx.recv().await,
                WaiterRx::Unbounded(rx) => rx.recv().await,
            }
        };
        tokio::time::timeout(timeout, recv).await.ok().flatten()
    }

    pub fn try_next(&mut self) -> Option<MatchedEvent> {
        match &mut self.rx {
            WaiterRx::Bounded(rx) => rx.try_recv().ok(),
            WaiterRx::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

#[derive(Default)]
pub struct Dispatcher {
    rule_match: RwLock<Vec<RuleMatchListener>>,
    discarder: RwLock<Vec<DiscarderListener>>,
    custom: RwLock<Vec<CustomEventListener>>,
    send: RwLock<Vec<SendEventListener>>,
    waiters: Mutex<Vec<WaiterSlot>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule_match_listener<F>(&self, listener: F)
    where
        F: Fn(&Rule, &Event) -> MatchVerdict + Send + Sync + 'static,
    {
        self.rule_match.write().push(Arc::new(listener));
    }

    pub fn add_discarder_listener<F>(&self, listener: F)
    where
        F: Fn(&Discarder) + Send + Sync + 'static,
    {
        self.discarder.write().push(Arc::new(listener));
    }

    pub fn add_custom_event_listener<F>(&self, listener: F)
    where
        F: Fn(&CustomEvent) + Send + Sync + 'static,
    {
        self.custom.write().push(Arc::new(listener));
    }

    pub fn add_send_event_listener<F>(&self, listener: F)
    where
        F: Fn(&MatchedEvent) + Send + Sync + 'static,
    {
        self.send.write().push(Arc::new(listener));
    }

    /// Register a waiter for the next matches of `rule_id`, or of any rule
    pub fn wait_for(&self, rule_id: Option<&str>, delivery: Delivery) -> Waiter {
        let (tx, rx) = match delivery {
            Delivery::Skip => {
                let (tx, rx) = mpsc::channel(1);
                (WaiterTx::Bounded(tx), WaiterRx::Bounded(rx))
            }
            Delivery::Continue => {
                let (tx, rx) = mpsc::unbounded_channel();
                (WaiterTx::Unbounded(tx), WaiterRx::Unbounded(rx))
            }
        };
        self.waiters.lock().push(WaiterSlot {
            rule_id: rule_id.map(str::to_string),
            tx,
        });
        Waiter { rx }
    }

    /// Ask every rule-match listener; one `Drop` vetoes the match
    pub fn rule_matched(&self, rule: &Rule, event: &Event) -> MatchVerdict {
        let listeners = self.rule_match.read().clone();
        let mut verdict = MatchVerdict::Accept;
        for listener in listeners {
            if listener(rule, event) == MatchVerdict::Drop {
                verdict = MatchVerdict::Drop;
            }
        }
        if verdict == MatchVerdict::Drop {
            debug!(rule_id = %rule.id, "match vetoed by listener");
        }
        verdict
    }

    pub fn push_discarder(&self, discarder: &Discarder) {
        DISCARDERS.with_label_values(&[discarder.event_type.as_str()]).inc();
        let listeners = self.discarder.read().clone();
        for listener in listeners {
            listener(discarder);
        }
    }

    pub fn emit_custom(&self, event: &CustomEvent) {
        let listeners = self.custom.read().clone();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn send_event(&self, matched: &MatchedEvent) {
        let listeners = self.send.read().clone();
        for listener in listeners {
            listener(matched);
        }

        let mut waiters = self.waiters.lock();
        waiters.retain(|slot| {
            if slot.rule_id.as_deref().is_some_and(|id| id != matched.rule_id) {
                return !is_closed(&slot.tx);
            }
            match &slot.tx {
                WaiterTx::Unbounded(tx) => tx.send(matched.clone()).is_ok(),
                WaiterTx::Bounded(tx) => match tx.try_send(matched.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        WAITER_DROPS.with_label_values(&[matched.rule_id.as_str()]).inc();
                        debug!(rule_id = %matched.rule_id, "waiter busy, match skipped");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                },
            }
        });
    }

    /// Waiters still registered
    pub fn waiters(&self) -> usize {
        let mut waiters = self.waiters.lock();
        waiters.retain(|slot| !is_closed(&slot.tx));
        waiters.len()
    }
}

fn is_closed(tx: &WaiterTx) -> bool {
    match tx {
        WaiterTx::Bounded(tx) => tx.is_closed(),
        WaiterTx::Unbounded(tx) => tx.is_closed(),
    }
}
