use cs_api_types::{ActionStatus, DashboardError, DashboardSnapshot, SessionSnapshot};
use cs_session::SessionManager;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::warn;

/// What the presentation layer hears from the core. Every hook defaults to
/// doing nothing.
pub trait DashboardObserver: Send + Sync {
    fn on_session_changed(&self, _session: &SessionSnapshot) {}
    fn on_holdings_updated(&self, _snapshot: &DashboardSnapshot) {}
    fn on_action_status_changed(&self, _status: &ActionStatus) {}
    fn on_error(&self, _error: &DashboardError) {}
}

/// Fans notifications out to every registered observer.
#[derive(Default)]
pub struct Notifier {
    observers: RwLock<Vec<Arc<dyn DashboardObserver>>>,
}

impl Notifier {
    pub fn register(&self, observer: Arc<dyn DashboardObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    fn each(&self, f: impl Fn(&dyn DashboardObserver)) {
        let observers = self.observers.read().unwrap_or_else(|e| e.into_inner()).clone();
        for observer in &observers {
            f(observer.as_ref());
        }
    }

    pub fn session_changed(&self, session: &SessionSnapshot) {
        self.each(|o| o.on_session_changed(session));
    }

    pub fn holdings_updated(&self, snapshot: &DashboardSnapshot) {
        self.each(|o| o.on_holdings_updated(snapshot));
    }

    pub fn action_status_changed(&self, status: &ActionStatus) {
        self.each(|o| o.on_action_status_changed(status));
    }

    pub fn error(&self, error: &DashboardError) {
        self.each(|o| o.on_error(error));
    }
}

/// Relays every session transition to the observers. Runs until aborted.
pub fn forward_sessions(notifier: Arc<Notifier>, sessions: &SessionManager) -> JoinHandle<()> {
    let mut changes = sessions.subscribe();
    let sessions = sessions.clone();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(session) => notifier.session_changed(session.snapshot()),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("observers missed {} session changes", skipped);
                    notifier.session_changed(sessions.current_session().snapshot());
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Observer that keeps everything it hears, for tests and diagnostics.
#[derive(Default)]
pub struct RecordingObserver {
    events: std::sync::Mutex<Vec<Notification>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Session(SessionSnapshot),
    Holdings(DashboardSnapshot),
    Action(ActionStatus),
    Error(DashboardError),
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn actions(&self) -> Vec<ActionStatus> {
        self.events()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Action(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn holdings(&self) -> Vec<DashboardSnapshot> {
        self.events()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Holdings(snapshot) => Some(snapshot),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<DashboardError> {
        self.events()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Error(err) => Some(err),
                _ => None,
            })
            .collect()
    }

    fn push(&self, notification: Notification) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}

impl DashboardObserver for RecordingObserver {
    fn on_session_changed(&self, session: &SessionSnapshot) {
        self.push(Notification::Session(session.clone()));
    }

    fn on_holdings_updated(&self, snapshot: &DashboardSnapshot) {
        self.push(Notification::Holdings(snapshot.clone()));
    }

    fn on_action_status_changed(&self, status: &ActionStatus) {
        self.push(Notification::Action(status.clone()));
    }

    fn on_error(&self, error: &DashboardError) {
        self.push(Notification::Error(error.clone()));
    }
}
