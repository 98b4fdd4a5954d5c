//! Ordered reparent phase events and the subscribable sink they flow into.

use std::fmt;
use std::time::SystemTime;

use tokio::sync::broadcast;

/// Phases of the emergency reparent state machine, in transition order.
/// `Aborted` is the error terminal; everything else advances toward `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReparentPhase {
    Started,
    Locked,
    ReplicasStopped,
    RelaysCaughtUp,
    IntermediatePromoted,
    FinalPromoted,
    Reparented,
    Done,
    Aborted,
}

impl fmt::Display for ReparentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReparentPhase::Started => "started",
            ReparentPhase::Locked => "locked",
            ReparentPhase::ReplicasStopped => "replicas_stopped",
            ReparentPhase::RelaysCaughtUp => "relays_caught_up",
            ReparentPhase::IntermediatePromoted => "intermediate_promoted",
            ReparentPhase::FinalPromoted => "final_promoted",
            ReparentPhase::Reparented => "reparented",
            ReparentPhase::Done => "done",
            ReparentPhase::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// One state transition of one reparent run.
#[derive(Debug, Clone)]
pub struct ReparentEvent {
    pub keyspace: String,
    pub shard: String,
    pub phase: ReparentPhase,
    pub detail: String,
    pub at: SystemTime,
}

/// Broadcast sink for reparent events. Subscribers that fall behind lose the
/// oldest events; emission never blocks the state machine.
pub struct EventSink {
    tx: broadcast::Sender<ReparentEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReparentEvent> {
        self.tx.subscribe()
    }

    /// Emit to all current subscribers. Fine to call with none.
    pub fn emit(&self, event: ReparentEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(64)
    }
}

/// The ordered transitions of one run, returned to the caller.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<ReparentEvent>,
}

impl EventLog {
    pub fn push(&mut self, event: ReparentEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[ReparentEvent] {
        &self.events
    }

    pub fn phases(&self) -> Vec<ReparentPhase> {
        self.events.iter().map(|e| e.phase).collect()
    }

    pub fn last_phase(&self) -> Option<ReparentPhase> {
        self.events.last().map(|e| e.phase)
    }
}
