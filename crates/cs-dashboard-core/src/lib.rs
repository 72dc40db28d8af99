mod actions;
pub mod config;
mod notifier;
mod referral;
mod refresh;

pub use actions::{ActionController, ActionOutcome, ApprovalPolicy, ApprovalPrompt, ApprovalRequest};
pub use config::{DashboardConfig, RetryPolicy, WalletConnectSettings};
pub use notifier::{DashboardObserver, Notification, Notifier, RecordingObserver, forward_sessions};
pub use referral::{ReferralBook, referrer_from_query};
pub use refresh::{DashboardRefresher, RefreshOutcome, RefreshState};

use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use cs_api_types::{
    BackendKind, DashboardError, DashboardSnapshot, PaymentMethod, ReferralInfo, SessionSnapshot,
};
use cs_contracts::ContractGateway;
use cs_session::{BackendFactory, SessionManager};
use cs_storage::ReferralStore;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

/// Everything a front end needs, wired together once at start-up.
pub struct Dashboard {
    config: DashboardConfig,
    sessions: SessionManager,
    gateway: ContractGateway,
    refresher: DashboardRefresher,
    referrals: Arc<ReferralBook>,
    notifier: Arc<Notifier>,
    actions: ActionController,
    session_forwarder: JoinHandle<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Dashboard {
    pub async fn new(
        config: DashboardConfig,
        backends: Arc<dyn BackendFactory>,
        store: Arc<dyn ReferralStore>,
        profile: impl Into<String>,
    ) -> Result<Self> {
        config.validate().context("invalid dashboard configuration")?;

        let sessions = SessionManager::new(backends, config.session_config());
        let gateway = ContractGateway::new(sessions.clone(), config.contracts)
            .with_confirmation(config.confirmation_policy());
        let notifier = Arc::new(Notifier::default());
        let refresher = DashboardRefresher::new(
            gateway.clone(),
            notifier.clone(),
            config.refresh_interval(),
            config.post_action_retry.clone(),
        );
        let referrals = Arc::new(ReferralBook::load(store, profile).await?);
        let actions = ActionController::new(
            gateway.clone(),
            refresher.clone(),
            referrals.clone(),
            notifier.clone(),
            config.approval_multiplier,
        )?;
        let session_forwarder = forward_sessions(notifier.clone(), &sessions);

        Ok(Self {
            config,
            sessions,
            gateway,
            refresher,
            referrals,
            notifier,
            actions,
            session_forwarder,
            supervisor: Mutex::new(None),
        })
    }

    pub fn register_observer(&self, observer: Arc<dyn DashboardObserver>) {
        self.notifier.register(observer);
    }

    /// Starts refreshing holdings as the session changes. Session changes
    /// reach observers with or without it. Calling it again is a no-op.
    pub fn start(&self) {
        let mut supervisor = self.supervisor.lock().unwrap_or_else(|e| e.into_inner());
        if supervisor.is_none() {
            info!(
                "dashboard started for sale contract {} on chain {}",
                self.config.contracts.sale, self.config.expected_chain_id
            );
            *supervisor = Some(self.refresher.spawn_supervisor());
        }
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub fn gateway(&self) -> &ContractGateway {
        &self.gateway
    }

    pub fn refresher(&self) -> &DashboardRefresher {
        &self.refresher
    }

    pub fn referrals(&self) -> &ReferralBook {
        &self.referrals
    }

    pub fn session(&self) -> SessionSnapshot {
        self.sessions.current_session().snapshot().clone()
    }

    pub async fn connect(&self, kind: BackendKind) -> Result<SessionSnapshot, DashboardError> {
        let session = self.sessions.connect(kind).await?;
        Ok(session.snapshot().clone())
    }

    pub async fn disconnect(&self) -> SessionSnapshot {
        self.sessions.disconnect().await.snapshot().clone()
    }

    pub async fn refresh(&self) -> RefreshOutcome {
        self.refresher.refresh().await
    }

    /// The last holdings published for the current session, if any.
    pub fn snapshot(&self) -> Option<DashboardSnapshot> {
        self.refresher.last_good()
    }

    pub async fn buy(
        &self,
        amount: U256,
        method: PaymentMethod,
        prompt: &dyn ApprovalPrompt,
    ) -> Result<ActionOutcome, DashboardError> {
        self.actions.buy(amount, method, prompt).await
    }

    pub async fn sell(&self, amount: U256) -> Result<ActionOutcome, DashboardError> {
        self.actions.sell(amount).await
    }

    pub async fn claim(&self) -> Result<ActionOutcome, DashboardError> {
        self.actions.claim().await
    }

    pub async fn seed_referral(&self, query: &str) -> Result<Option<Address>> {
        self.referrals.seed_from_query(query).await
    }

    /// On-chain referral figures for the connected address.
    pub async fn referral_info(&self) -> Result<ReferralInfo, DashboardError> {
        let session = self.sessions.current_session();
        let address = session.require_signer()?.address();
        self.gateway.read_referral_info(address).await
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.session_forwarder.abort();
        if let Some(supervisor) = self
            .supervisor
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            supervisor.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use cs_api_types::{ActionStage, SessionStatus};
    use cs_contracts::amount::unit;
    use cs_contracts::simulator::SimulatedChain;
    use cs_storage::InMemoryReferralStore;

    const HOLDER: Address = address!("0x00000000000000000000000000000000000000a5");
    const REFERRER: Address = address!("0x00000000000000000000000000000000000000a6");

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn dashboard(chain: &Arc<SimulatedChain>) -> Result<Dashboard> {
        Dashboard::new(
            DashboardConfig::default(),
            Arc::new(chain.backends()),
            Arc::new(InMemoryReferralStore::default()),
            "default",
        )
        .await
    }

    #[tokio::test]
    async fn invalid_config_is_refused() {
        let chain = Arc::new(SimulatedChain::new(Default::default(), 56));
        let config = DashboardConfig {
            approval_multiplier: 0,
            ..DashboardConfig::default()
        };
        let built = Dashboard::new(
            config,
            Arc::new(chain.backends()),
            Arc::new(InMemoryReferralStore::default()),
            "default",
        )
        .await;
        assert!(built.is_err());
    }

    #[tokio::test]
    async fn session_changes_reach_observers_before_start() -> Result<()> {
        let chain = Arc::new(SimulatedChain::new(Default::default(), 56));
        chain.set_wallet_accounts(vec![HOLDER]);
        let dashboard = dashboard(&chain).await?;
        let recorder = Arc::new(RecordingObserver::default());
        dashboard.register_observer(recorder.clone());

        dashboard.connect(BackendKind::Extension).await?;
        settle().await;
        assert!(!dashboard.refresher().is_polling());
        assert!(recorder.holdings().is_empty());
        let statuses: Vec<SessionStatus> = recorder
            .events()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Session(s) => Some(s.status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![SessionStatus::Connecting, SessionStatus::Connected]);
        assert_eq!(
            recorder.events().last(),
            Some(&Notification::Session(dashboard.session()))
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn connect_buy_and_disconnect_through_the_facade() -> Result<()> {
        let chain = Arc::new(SimulatedChain::new(Default::default(), 56));
        chain.set_wallet_accounts(vec![HOLDER]);
        chain.fund_stablecoin(HOLDER, U256::from(20) * unit(18));

        let dashboard = dashboard(&chain).await?;
        let recorder = Arc::new(RecordingObserver::default());
        dashboard.register_observer(recorder.clone());
        dashboard.start();
        dashboard.start();
        dashboard.seed_referral(&format!("ref={REFERRER}")).await?;

        let session = dashboard.connect(BackendKind::Extension).await?;
        assert_eq!(session.status, SessionStatus::Connected);
        settle().await;
        assert!(dashboard.refresher().is_polling());
        assert_eq!(dashboard.snapshot().map(|s| s.address), Some(HOLDER));

        let outcome = dashboard
            .buy(U256::from(10) * unit(18), PaymentMethod::Stablecoin, &ApprovalPolicy::Granted)
            .await?;
        assert_eq!(outcome.referrer, Some(REFERRER));
        assert!(outcome.dashboard_refreshed);
        assert_eq!(
            dashboard.snapshot().map(|s| s.holdings.balance),
            Some(U256::from(10) * unit(18))
        );
        assert_eq!(dashboard.referrals().current().await, None);
        assert_eq!(dashboard.referral_info().await?.referrer, Some(REFERRER));

        let session = dashboard.disconnect().await;
        assert_eq!(session.status, SessionStatus::Disconnected);
        settle().await;
        assert!(!dashboard.refresher().is_polling());
        assert_eq!(dashboard.snapshot(), None);
        assert_eq!(dashboard.referral_info().await.err(), Some(DashboardError::NotConnected));

        let sessions: Vec<SessionStatus> = recorder
            .events()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Session(s) => Some(s.status),
                _ => None,
            })
            .collect();
        assert_eq!(
            sessions,
            vec![SessionStatus::Connecting, SessionStatus::Connected, SessionStatus::Disconnected]
        );
        assert_eq!(
            recorder.actions().last().map(|s| s.stage.clone()),
            Some(ActionStage::Done)
        );
        Ok(())
    }
}
