use cs_api_types::{ActionStatus, DashboardError, DashboardSnapshot, SessionSnapshot};
use cs_dashboard_core::DashboardObserver;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::epoch_ms;

pub(crate) const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum EventKind {
    Session(SessionSnapshot),
    Holdings(DashboardSnapshot),
    Action(ActionStatus),
    Error { code: &'static str, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct EventRecord {
    pub seq: u64,
    pub at_epoch_ms: u128,
    #[serde(flatten)]
    pub event: EventKind,
}

struct Ring {
    next_seq: u64,
    records: VecDeque<EventRecord>,
}

/// Keeps the most recent notifications so HTTP clients can poll for them.
pub(crate) struct EventLog {
    capacity: usize,
    ring: Mutex<Ring>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ring: Mutex::new(Ring {
                next_seq: 1,
                records: VecDeque::with_capacity(capacity),
            }),
        }
    }

    fn push(&self, event: EventKind) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let seq = ring.next_seq;
        ring.next_seq += 1;
        if ring.records.len() == self.capacity {
            ring.records.pop_front();
        }
        ring.records.push_back(EventRecord {
            seq,
            at_epoch_ms: epoch_ms().unwrap_or_default(),
            event,
        });
    }

    /// Newest last, at most `limit` records.
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let skip = ring.records.len().saturating_sub(limit);
        ring.records.iter().skip(skip).cloned().collect()
    }
}

impl DashboardObserver for EventLog {
    fn on_session_changed(&self, session: &SessionSnapshot) {
        self.push(EventKind::Session(session.clone()));
    }

    fn on_holdings_updated(&self, snapshot: &DashboardSnapshot) {
        self.push(EventKind::Holdings(snapshot.clone()));
    }

    fn on_action_status_changed(&self, status: &ActionStatus) {
        self.push(EventKind::Action(status.clone()));
    }

    fn on_error(&self, error: &DashboardError) {
        self.push(EventKind::Error {
            code: error.code(),
            message: error.to_string(),
        });
    }
}
