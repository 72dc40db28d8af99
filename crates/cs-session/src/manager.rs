use alloy_primitives::Address;
use cs_api_types::{BackendKind, DashboardError, DisconnectReason, SessionStatus};
use cs_wallet_backend::{BackendEvent, WalletBackend};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{BackendFactory, Session, SessionConfig};

struct State {
    session: Session,
    pump: Option<JoinHandle<()>>,
    next_epoch: u64,
}

struct Shared {
    factory: Arc<dyn BackendFactory>,
    config: SessionConfig,
    state: Mutex<State>,
    changes: broadcast::Sender<Session>,
}

/// Owns the single wallet session of one dashboard.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

fn edge_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    matches!(
        (from, to),
        (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Disconnected)
            | (Connected, Disconnected)
            // in-place update (account switch, chain refresh)
            | (Connected, Connected)
    )
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies `next` if the edge is legal and publishes it.
    fn transition(&self, state: &mut State, next: Session) -> bool {
        let from = state.session.status();
        let to = next.status();
        if !edge_allowed(from, to) {
            warn!("refusing session transition {:?} -> {:?}", from, to);
            return false;
        }
        if from != to {
            info!(
                "session {:?} -> {:?} (epoch {}, backend {:?})",
                from,
                to,
                next.epoch(),
                next.snapshot().backend
            );
        }
        state.session = next.clone();
        let _ = self.changes.send(next);
        true
    }

    fn bump_epoch(state: &mut State) -> u64 {
        state.next_epoch += 1;
        state.next_epoch
    }

    /// Ends the connected session identified by `epoch`. Returns the backend
    /// that was live, or `None` when the epoch is already stale.
    fn end_connected(
        &self,
        epoch: u64,
        reason: DisconnectReason,
    ) -> Option<(Arc<dyn WalletBackend>, Option<JoinHandle<()>>)> {
        let mut state = self.state();
        if state.session.epoch() != epoch || !state.session.is_connected() {
            return None;
        }
        let backend = state
            .session
            .signer()
            .map(|signer| Arc::clone(signer.backend()))?;
        let next_epoch = Self::bump_epoch(&mut state);
        self.transition(&mut state, Session::disconnected(next_epoch, Some(reason)));
        Some((backend, state.pump.take()))
    }
}

impl SessionManager {
    pub fn new(factory: Arc<dyn BackendFactory>, config: SessionConfig) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                factory,
                config,
                state: Mutex::new(State {
                    session: Session::disconnected(0, None),
                    pump: None,
                    next_epoch: 0,
                }),
                changes,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn current_session(&self) -> Session {
        self.shared.state().session.clone()
    }

    /// Every transition and every in-place update, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<Session> {
        self.shared.changes.subscribe()
    }

    pub async fn connect(&self, kind: BackendKind) -> Result<Session, DashboardError> {
        let current = self.current_session();
        match current.status() {
            SessionStatus::Connecting => return Err(pending()),
            SessionStatus::Connected if current.snapshot().backend == Some(kind) => {
                debug!("connect({:?}) while already connected", kind);
                return Ok(current);
            }
            SessionStatus::Connected => {
                info!("switching wallet backend to {:?}", kind);
                self.disconnect().await;
            }
            SessionStatus::Disconnected => {}
        }

        let epoch = self.begin_connecting(kind)?;
        match self.establish(kind).await {
            Ok((backend, address, chain_id)) => self.commit(epoch, backend, address, chain_id).await,
            Err(err) => {
                warn!("connect({:?}) failed: {}", kind, err);
                self.abandon(epoch, &err);
                Err(err)
            }
        }
    }

    /// Ends the session and tells the backend. Safe to call in any state.
    pub async fn disconnect(&self) -> Session {
        let (backend, pump, session) = {
            let mut state = self.shared.state();
            match state.session.status() {
                SessionStatus::Disconnected => return state.session.clone(),
                SessionStatus::Connecting => {
                    // The pending attempt notices the epoch change when the
                    // prompt resolves and releases its backend itself.
                    let epoch = Shared::bump_epoch(&mut state);
                    self.shared.transition(
                        &mut state,
                        Session::disconnected(epoch, Some(DisconnectReason::UserRequested)),
                    );
                    (None, None, state.session.clone())
                }
                SessionStatus::Connected => {
                    let backend = state
                        .session
                        .signer()
                        .map(|signer| Arc::clone(signer.backend()));
                    let epoch = Shared::bump_epoch(&mut state);
                    self.shared.transition(
                        &mut state,
                        Session::disconnected(epoch, Some(DisconnectReason::UserRequested)),
                    );
                    (backend, state.pump.take(), state.session.clone())
                }
            }
        };

        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(backend) = backend {
            if let Err(err) = backend.disconnect().await {
                warn!("backend disconnect failed: {}", err);
            }
        }
        session
    }

    fn begin_connecting(&self, kind: BackendKind) -> Result<u64, DashboardError> {
        let mut state = self.shared.state();
        if state.session.status() != SessionStatus::Disconnected {
            return Err(pending());
        }
        let epoch = Shared::bump_epoch(&mut state);
        self.shared.transition(&mut state, Session::connecting(kind, epoch));
        Ok(epoch)
    }

    async fn establish(
        &self,
        kind: BackendKind,
    ) -> Result<(Arc<dyn WalletBackend>, Address, u64), DashboardError> {
        let backend = self.shared.factory.open(kind).await?;

        let accounts = self.bounded(backend.request_accounts()).await?;
        let Some(address) = accounts.first().copied() else {
            return Err(DashboardError::UserRejected);
        };

        let chain_id = self.bounded(backend.chain_id()).await?;
        if chain_id != self.shared.config.expected_chain_id {
            warn!(
                "wallet is on chain {}, expected {}",
                chain_id, self.shared.config.expected_chain_id
            );
            if let Err(err) = backend.disconnect().await {
                debug!("backend disconnect after wrong chain failed: {}", err);
            }
            return Err(DashboardError::WrongChain);
        }

        Ok((backend, address, chain_id))
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, DashboardError>>,
    ) -> Result<T, DashboardError> {
        tokio::time::timeout(self.shared.config.prompt_timeout, fut)
            .await
            .map_err(|_| DashboardError::Timeout)?
    }

    async fn commit(
        &self,
        epoch: u64,
        backend: Arc<dyn WalletBackend>,
        address: Address,
        chain_id: u64,
    ) -> Result<Session, DashboardError> {
        let committed = {
            let mut state = self.shared.state();
            if state.session.epoch() != epoch
                || state.session.status() != SessionStatus::Connecting
            {
                None
            } else {
                let events = backend.subscribe();
                let session = Session::connected(address, chain_id, epoch, Arc::clone(&backend));
                self.shared.transition(&mut state, session.clone());
                state.pump = Some(spawn_pump(Arc::downgrade(&self.shared), epoch, events));
                Some(session)
            }
        };

        match committed {
            Some(session) => Ok(session),
            None => {
                info!("connect attempt {} superseded by disconnect", epoch);
                if let Err(err) = backend.disconnect().await {
                    debug!("releasing superseded backend failed: {}", err);
                }
                Err(DashboardError::NotConnected)
            }
        }
    }

    fn abandon(&self, epoch: u64, err: &DashboardError) {
        let mut state = self.shared.state();
        if state.session.epoch() != epoch || state.session.status() != SessionStatus::Connecting {
            return;
        }
        let reason = matches!(err, DashboardError::WrongChain).then_some(DisconnectReason::WrongChain);
        let next_epoch = Shared::bump_epoch(&mut state);
        self.shared
            .transition(&mut state, Session::disconnected(next_epoch, reason));
    }
}

fn pending() -> DashboardError {
    DashboardError::UnknownBackendError("wallet connection request already pending".to_owned())
}

fn spawn_pump(
    shared: Weak<Shared>,
    epoch: u64,
    mut events: broadcast::Receiver<BackendEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("missed {} wallet events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => BackendEvent::Disconnect {
                    code: 0,
                    message: "event stream closed".to_owned(),
                },
            };
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if !handle_event(&shared, epoch, event).await {
                return;
            }
        }
    })
}

/// Applies one backend event to the session of `epoch`. Returns false once
/// that session is over.
async fn handle_event(shared: &Shared, epoch: u64, event: BackendEvent) -> bool {
    debug!("wallet event {:?}", event);
    let (reason, tell_backend) = match event {
        BackendEvent::AccountsChanged(accounts) => match accounts.first().copied() {
            Some(address) => {
                let mut state = shared.state();
                if state.session.epoch() != epoch || !state.session.is_connected() {
                    return false;
                }
                if state.session.address() != Some(address) {
                    info!("wallet switched account to {}", address);
                    let next = state.session.with_address(address);
                    shared.transition(&mut state, next);
                }
                return true;
            }
            None => (DisconnectReason::AccountsRevoked, false),
        },
        BackendEvent::ChainChanged(chain_id) if chain_id == shared.config.expected_chain_id => {
            let mut state = shared.state();
            if state.session.epoch() != epoch || !state.session.is_connected() {
                return false;
            }
            let next = state.session.with_chain(chain_id);
            shared.transition(&mut state, next);
            return true;
        }
        BackendEvent::ChainChanged(chain_id) => {
            warn!("wallet moved to unsupported chain {}", chain_id);
            (DisconnectReason::WrongChain, true)
        }
        BackendEvent::Disconnect { code, message } => {
            info!("wallet disconnected ({}): {}", code, message);
            (DisconnectReason::BackendDisconnected, false)
        }
    };

    // The pump's own handle is dropped rather than aborted; returning ends it.
    if let Some((backend, _pump)) = shared.end_connected(epoch, reason) {
        if tell_backend {
            if let Err(err) = backend.disconnect().await {
                warn!("backend disconnect failed: {}", err);
            }
        }
    }
    false
}
