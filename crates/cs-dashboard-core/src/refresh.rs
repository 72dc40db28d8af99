use alloy_primitives::Address;
use cs_api_types::{DashboardError, DashboardSnapshot, HoldingsSnapshot, RewardStatus};
use cs_contracts::ContractGateway;
use cs_session::Session;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RetryPolicy;
use crate::notifier::Notifier;

pub type RefreshOutcome = Result<DashboardSnapshot, DashboardError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
    Failed,
}

/// The round currently reading holdings, and the session epoch it reads for.
struct Round {
    id: u64,
    epoch: u64,
    outcome: broadcast::Sender<RefreshOutcome>,
}

struct Inner {
    gateway: ContractGateway,
    notifier: Arc<Notifier>,
    interval: Duration,
    retry: RetryPolicy,
    in_flight: Mutex<Option<Round>>,
    next_round: AtomicU64,
    last_good: Mutex<Option<DashboardSnapshot>>,
    state: Mutex<RefreshState>,
    polling: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Keeps the published holdings in step with the chain.
///
/// One round reads the holdings of the connected address. Requests that
/// arrive while a round for the same session epoch is running share its
/// outcome instead of starting another. A round left over from an earlier
/// epoch is not joined; the new round replaces it.
#[derive(Clone)]
pub struct DashboardRefresher {
    inner: Arc<Inner>,
}

impl DashboardRefresher {
    pub fn new(
        gateway: ContractGateway,
        notifier: Arc<Notifier>,
        interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                notifier,
                interval,
                retry,
                in_flight: Mutex::new(None),
                next_round: AtomicU64::new(1),
                last_good: Mutex::new(None),
                state: Mutex::new(RefreshState::Idle),
                polling: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> RefreshState {
        *lock(&self.inner.state)
    }

    /// Last snapshot successfully published for the current session.
    pub fn last_good(&self) -> Option<DashboardSnapshot> {
        lock(&self.inner.last_good).clone()
    }

    /// Whether the periodic timer is running.
    pub fn is_polling(&self) -> bool {
        self.inner.polling.load(Ordering::Acquire)
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        let session = self.inner.gateway.sessions().current_session();
        let mut outcome = {
            let mut slot = lock(&self.inner.in_flight);
            match slot.as_ref().filter(|round| round.epoch == session.epoch()) {
                Some(round) => {
                    debug!("joining in-flight refresh {}", round.id);
                    round.outcome.subscribe()
                }
                None => {
                    if let Some(stale) = slot.as_ref() {
                        debug!("refresh {} belongs to epoch {}, starting a new one", stale.id, stale.epoch);
                    }
                    let id = self.inner.next_round.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = broadcast::channel(1);
                    *slot = Some(Round {
                        id,
                        epoch: session.epoch(),
                        outcome: tx.clone(),
                    });
                    tokio::spawn(run_round(Arc::clone(&self.inner), id, session, tx));
                    rx
                }
            }
        };

        outcome
            .recv()
            .await
            .map_err(|_| DashboardError::UnknownBackendError("refresh round abandoned".to_owned()))?
    }

    /// Re-reads holdings with backoff until they differ from `previous`.
    pub async fn refresh_until_changed(&self, previous: Option<&HoldingsSnapshot>) -> RefreshOutcome {
        let retry = &self.inner.retry;
        let mut delay = retry.initial_delay();
        for attempt in 1..=retry.attempts {
            tokio::time::sleep(delay).await;
            match self.refresh().await {
                Ok(snapshot) if previous != Some(&snapshot.holdings) => return Ok(snapshot),
                Ok(_) => debug!("holdings unchanged after attempt {}", attempt),
                Err(DashboardError::NotConnected) => return Err(DashboardError::NotConnected),
                Err(err) => debug!("post-action refresh attempt {} failed: {}", attempt, err),
            }
            delay = (delay * 2).min(retry.max_delay());
        }
        warn!("holdings did not change after {} attempts", retry.attempts);
        Err(DashboardError::Timeout)
    }

    /// Follows the session: refreshes on connect and account switch, polls
    /// while connected, and forgets the cache once the session ends.
    pub fn spawn_supervisor(&self) -> JoinHandle<()> {
        let refresher = self.clone();
        let mut changes = self.inner.gateway.sessions().subscribe();
        let initial = self.inner.gateway.sessions().current_session();

        tokio::spawn(async move {
            let mut watched: Option<(u64, Address)> = None;
            let mut ticker: Option<Interval> = None;
            refresher.follow(&initial, &mut watched, &mut ticker);

            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(session) => refresher.follow(&session, &mut watched, &mut ticker),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("refresh supervisor missed {} session changes", skipped);
                            let session = refresher.inner.gateway.sessions().current_session();
                            refresher.follow(&session, &mut watched, &mut ticker);
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = tick(&mut ticker) => {
                        debug!("periodic dashboard refresh");
                        refresher.trigger();
                    }
                }
            }
            refresher.inner.polling.store(false, Ordering::Release);
        })
    }

    fn follow(
        &self,
        session: &Session,
        watched: &mut Option<(u64, Address)>,
        ticker: &mut Option<Interval>,
    ) {
        let current = match (session.is_connected(), session.address()) {
            (true, Some(address)) => Some((session.epoch(), address)),
            _ => None,
        };
        if current == *watched {
            return;
        }
        *watched = current;
        *lock(&self.inner.last_good) = None;

        match current {
            Some((_, address)) => {
                info!("watching holdings of {} every {:?}", address, self.inner.interval);
                let mut interval =
                    tokio::time::interval_at(Instant::now() + self.inner.interval, self.inner.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *ticker = Some(interval);
                self.inner.polling.store(true, Ordering::Release);
                self.trigger();
            }
            None => {
                if ticker.take().is_some() {
                    info!("session ended, dashboard polling stopped");
                }
                self.inner.polling.store(false, Ordering::Release);
            }
        }
    }

    fn trigger(&self) {
        let refresher = self.clone();
        tokio::spawn(async move {
            let _ = refresher.refresh().await;
        });
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn set_state(inner: &Inner, next: RefreshState) {
    *lock(&inner.state) = next;
}

fn still_current(before: &Session, now: &Session) -> bool {
    now.is_connected() && now.epoch() == before.epoch() && now.address() == before.address()
}

async fn run_round(
    inner: Arc<Inner>,
    id: u64,
    session: Session,
    round: broadcast::Sender<RefreshOutcome>,
) {
    set_state(&inner, RefreshState::Refreshing);

    let read = match session.address().filter(|_| session.is_connected()) {
        Some(address) => inner
            .gateway
            .read_holdings(address)
            .await
            .map(|holdings| DashboardSnapshot {
                address,
                reward_status: RewardStatus::from_holdings(&holdings),
                holdings,
                fetched_at_epoch_ms: epoch_ms(),
            }),
        None => Err(DashboardError::NotConnected),
    };

    let now = inner.gateway.sessions().current_session();
    let outcome = if session.is_connected() && !still_current(&session, &now) {
        debug!("discarding refresh for epoch {}: session moved on", session.epoch());
        Err(DashboardError::NotConnected)
    } else {
        match read {
            Ok(snapshot) => {
                debug!("holdings refreshed for {}", snapshot.address);
                *lock(&inner.last_good) = Some(snapshot.clone());
                inner.notifier.holdings_updated(&snapshot);
                set_state(&inner, RefreshState::Idle);
                Ok(snapshot)
            }
            Err(DashboardError::NotConnected) => {
                set_state(&inner, RefreshState::Idle);
                Err(DashboardError::NotConnected)
            }
            Err(err) => {
                warn!("dashboard refresh failed: {}", err);
                set_state(&inner, RefreshState::Failed);
                inner.notifier.error(&err);
                set_state(&inner, RefreshState::Idle);
                Err(err)
            }
        }
    };

    {
        let mut slot = lock(&inner.in_flight);
        if slot.as_ref().is_some_and(|current| current.id == id) {
            slot.take();
            if matches!(outcome, Err(DashboardError::NotConnected)) {
                set_state(&inner, RefreshState::Idle);
            }
        }
    }
    let _ = round.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::RecordingObserver;
    use alloy_primitives::{U256, address};
    use cs_api_types::BackendKind;
    use cs_contracts::ContractAddresses;
    use cs_contracts::simulator::SimulatedChain;
    use cs_session::{SessionConfig, SessionManager};

    const HOLDER: Address = address!("0x00000000000000000000000000000000000000c1");
    const SECOND: Address = address!("0x00000000000000000000000000000000000000c2");

    struct Fixture {
        chain: Arc<SimulatedChain>,
        sessions: SessionManager,
        refresher: DashboardRefresher,
        recorder: Arc<RecordingObserver>,
    }

    fn fixture() -> Fixture {
        let chain = Arc::new(SimulatedChain::new(ContractAddresses::default(), 56));
        chain.set_wallet_accounts(vec![HOLDER]);
        let sessions = SessionManager::new(Arc::new(chain.backends()), SessionConfig::default());
        let gateway = ContractGateway::new(sessions.clone(), chain.addresses());
        let notifier = Arc::new(Notifier::default());
        let recorder = Arc::new(RecordingObserver::default());
        notifier.register(recorder.clone());
        let refresher =
            DashboardRefresher::new(gateway, notifier, Duration::from_secs(30), RetryPolicy::default());
        Fixture {
            chain,
            sessions,
            refresher,
            recorder,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn refresh_publishes_snapshot_with_reward_status() -> Result<(), DashboardError> {
        let f = fixture();
        f.chain.set_tokens(HOLDER, U256::from(10));
        f.sessions.connect(BackendKind::Extension).await?;

        let snapshot = f.refresher.refresh().await?;
        assert_eq!(snapshot.address, HOLDER);
        assert_eq!(snapshot.reward_status, RewardStatus::NextRewardPending);
        assert_eq!(f.refresher.last_good(), Some(snapshot.clone()));
        assert_eq!(f.recorder.holdings(), vec![snapshot]);
        assert_eq!(f.refresher.state(), RefreshState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn refresh_without_session_is_not_connected() {
        let f = fixture();
        assert_eq!(f.refresher.refresh().await, Err(DashboardError::NotConnected));
        assert!(f.recorder.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_share_one_round() -> Result<(), DashboardError> {
        let f = fixture();
        f.sessions.connect(BackendKind::Extension).await?;
        f.chain.set_latency(Duration::from_millis(200));

        let (a, b) = tokio::join!(f.refresher.refresh(), f.refresher.refresh());
        assert_eq!(a?, b?);
        assert_eq!(f.chain.calls_to("getUserHoldings"), 1);
        assert_eq!(f.recorder.holdings().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failure_keeps_last_good_snapshot() -> Result<(), DashboardError> {
        let f = fixture();
        f.chain.set_tokens(HOLDER, U256::from(5));
        f.sessions.connect(BackendKind::Extension).await?;
        let good = f.refresher.refresh().await?;

        f.chain.fail_reads(Some("node overloaded"));
        let failed = f.refresher.refresh().await;
        assert!(matches!(failed, Err(DashboardError::UnknownBackendError(_))));
        assert_eq!(f.refresher.last_good(), Some(good));
        assert_eq!(f.refresher.state(), RefreshState::Idle);
        assert_eq!(f.recorder.errors().len(), 1);
        assert_eq!(f.recorder.holdings().len(), 1);

        f.chain.fail_reads(None);
        f.chain.set_tokens(HOLDER, U256::from(6));
        assert_eq!(f.refresher.refresh().await?.holdings.balance, U256::from(6));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_refresh_discards_and_stops_polling() -> Result<(), DashboardError> {
        let f = fixture();
        let supervisor = f.refresher.spawn_supervisor();
        f.sessions.connect(BackendKind::Extension).await?;
        settle().await;
        assert!(f.refresher.is_polling());

        // Let the connect-triggered round finish, then start a slow one.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let published = f.recorder.holdings().len();
        f.chain.set_latency(Duration::from_secs(5));
        let pending = tokio::spawn({
            let refresher = f.refresher.clone();
            async move { refresher.refresh().await }
        });
        settle().await;

        f.sessions.disconnect().await;
        let outcome = pending.await.expect("refresh task");
        assert_eq!(outcome, Err(DashboardError::NotConnected));
        assert_eq!(f.recorder.holdings().len(), published);
        assert_eq!(f.refresher.last_good(), None);
        assert!(!f.refresher.is_polling());

        let reads = f.chain.calls_to("getUserHoldings");
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(f.chain.calls_to("getUserHoldings"), reads);

        supervisor.abort();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_during_slow_refresh_starts_a_fresh_round() -> Result<(), DashboardError> {
        let f = fixture();
        f.chain.set_tokens(SECOND, U256::from(42));
        let supervisor = f.refresher.spawn_supervisor();
        f.sessions.connect(BackendKind::Extension).await?;
        settle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let published = f.recorder.holdings().len();

        f.chain.set_latency(Duration::from_secs(5));
        let stale = tokio::spawn({
            let refresher = f.refresher.clone();
            async move { refresher.refresh().await }
        });
        settle().await;

        f.sessions.disconnect().await;
        f.chain.set_wallet_accounts(vec![SECOND]);
        f.sessions.connect(BackendKind::Extension).await?;
        settle().await;
        assert_eq!(f.refresher.state(), RefreshState::Refreshing);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(stale.await.expect("refresh task"), Err(DashboardError::NotConnected));

        let holdings = f.recorder.holdings();
        assert_eq!(holdings.len(), published + 1);
        let latest = holdings.last().expect("published after reconnect");
        assert_eq!(latest.address, SECOND);
        assert_eq!(latest.holdings.balance, U256::from(42));
        assert_eq!(f.refresher.last_good().map(|s| s.address), Some(SECOND));
        assert_eq!(f.refresher.state(), RefreshState::Idle);

        supervisor.abort();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_timer_refreshes_while_connected() -> Result<(), DashboardError> {
        let f = fixture();
        let supervisor = f.refresher.spawn_supervisor();
        f.sessions.connect(BackendKind::Extension).await?;
        settle().await;
        let after_connect = f.chain.calls_to("getUserHoldings");
        assert_eq!(after_connect, 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(f.chain.calls_to("getUserHoldings"), after_connect + 2);
        supervisor.abort();
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_until_changed_waits_for_new_holdings() -> Result<(), DashboardError> {
        let f = fixture();
        f.sessions.connect(BackendKind::Extension).await?;
        let before = f.refresher.refresh().await?.holdings;

        assert_eq!(
            f.refresher.refresh_until_changed(Some(&before)).await,
            Err(DashboardError::Timeout)
        );

        let chain = f.chain.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            chain.set_tokens(HOLDER, U256::from(99));
        });
        let changed = f.refresher.refresh_until_changed(Some(&before)).await?;
        assert_eq!(changed.holdings.balance, U256::from(99));
        Ok(())
    }
}
