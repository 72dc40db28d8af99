use alloy_primitives::{Address, TxHash, U256};
use async_trait::async_trait;
use anyhow::ensure;
use cs_api_types::{
    ActionKind, ActionStage, ActionStatus, DashboardError, HoldingsSnapshot, PaymentMethod, PendingAction,
};
use cs_contracts::amount::{checked_mul, native_for_stable};
use cs_contracts::{ContractGateway, TransactionHandle};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::notifier::Notifier;
use crate::referral::ReferralBook;
use crate::refresh::DashboardRefresher;

/// Details shown to the user before a stablecoin approval is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub spender: Address,
    pub purchase: U256,
    pub current_allowance: U256,
    pub approve_amount: U256,
}

/// Asks the user whether the approval may go ahead. Returning an error
/// aborts the purchase with that error.
#[async_trait]
pub trait ApprovalPrompt: Send + Sync {
    async fn confirm_approval(&self, request: &ApprovalRequest) -> Result<(), DashboardError>;
}

/// Fixed answers for front ends that collect consent up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    /// Consent was given with the request.
    Granted,
    /// No consent yet; the caller should ask and retry.
    Withheld,
    /// The user said no.
    Declined,
}

#[async_trait]
impl ApprovalPrompt for ApprovalPolicy {
    async fn confirm_approval(&self, _request: &ApprovalRequest) -> Result<(), DashboardError> {
        match self {
            ApprovalPolicy::Granted => Ok(()),
            ApprovalPolicy::Withheld => Err(DashboardError::AllowanceInsufficient),
            ApprovalPolicy::Declined => Err(DashboardError::UserRejected),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub action_id: Uuid,
    pub kind: ActionKind,
    pub tx_hash: TxHash,
    pub approval_tx_hash: Option<TxHash>,
    pub referrer: Option<Address>,
    /// Whether the post-action refresh saw the new holdings.
    pub dashboard_refreshed: bool,
}

/// Publishes the stages of one action.
struct ActionRun<'a> {
    id: Uuid,
    kind: ActionKind,
    notifier: &'a Notifier,
}

impl ActionRun<'_> {
    fn publish(&self, stage: ActionStage, tx_hash: Option<TxHash>, message: Option<String>) {
        info!("action {} ({:?}) -> {:?}", self.id, self.kind, stage);
        self.notifier.action_status_changed(&ActionStatus {
            action_id: self.id,
            kind: self.kind,
            stage,
            tx_hash,
            message,
        });
    }

    fn stage(&self, stage: ActionStage) {
        self.publish(stage, None, None);
    }

    fn failed(&self, err: DashboardError) -> DashboardError {
        warn!("action {} ({:?}) failed: {}", self.id, self.kind, err);
        self.publish(ActionStage::Failed(err.clone()), None, Some(err.to_string()));
        err
    }
}

/// A write that went out, with the holdings published just before it.
struct Submitted {
    handle: TransactionHandle,
    baseline: Option<HoldingsSnapshot>,
}

/// Runs buy, sell and claim from validation to a refreshed dashboard.
pub struct ActionController {
    gateway: ContractGateway,
    refresher: DashboardRefresher,
    referrals: Arc<ReferralBook>,
    notifier: Arc<Notifier>,
    approval_multiplier: U256,
}

impl ActionController {
    pub fn new(
        gateway: ContractGateway,
        refresher: DashboardRefresher,
        referrals: Arc<ReferralBook>,
        notifier: Arc<Notifier>,
        approval_multiplier: u64,
    ) -> anyhow::Result<Self> {
        ensure!(
            approval_multiplier >= 2,
            "approval multiplier must be at least 2, got {}",
            approval_multiplier
        );
        Ok(Self {
            gateway,
            refresher,
            referrals,
            notifier,
            approval_multiplier: U256::from(approval_multiplier),
        })
    }

    fn begin(&self, kind: ActionKind) -> ActionRun<'_> {
        let run = ActionRun {
            id: Uuid::new_v4(),
            kind,
            notifier: &self.notifier,
        };
        run.stage(ActionStage::Validating);
        run
    }

    fn buyer(&self) -> Result<Address, DashboardError> {
        let session = self.gateway.sessions().current_session();
        Ok(session.require_signer()?.address())
    }

    /// Holdings last published for `account`. Taken before a write goes out
    /// so a refresh racing the confirmation cannot move it.
    fn baseline(&self, account: Address) -> Option<HoldingsSnapshot> {
        self.refresher
            .last_good()
            .filter(|snapshot| snapshot.address == account)
            .map(|snapshot| snapshot.holdings)
    }

    pub async fn buy(
        &self,
        amount: U256,
        method: PaymentMethod,
        prompt: &dyn ApprovalPrompt,
    ) -> Result<ActionOutcome, DashboardError> {
        let run = self.begin(ActionKind::Buy);
        match self.execute_buy(&run, amount, method, prompt).await {
            Ok((submitted, approval, pending)) => {
                let outcome = self.finish(&run, &submitted, pending.referrer).await;
                if pending.referrer.is_some() {
                    if let Err(err) = self.referrals.clear().await {
                        warn!("referred purchase confirmed but referrer not cleared: {:#}", err);
                    }
                }
                Ok(ActionOutcome {
                    approval_tx_hash: approval,
                    ..outcome
                })
            }
            Err(err) => Err(run.failed(err)),
        }
    }

    async fn execute_buy(
        &self,
        run: &ActionRun<'_>,
        amount: U256,
        method: PaymentMethod,
        prompt: &dyn ApprovalPrompt,
    ) -> Result<(Submitted, Option<TxHash>, PendingAction), DashboardError> {
        let buyer = self.buyer()?;
        if amount.is_zero() {
            return Err(DashboardError::InvalidAmount("0".to_owned()));
        }
        let pending = PendingAction {
            kind: ActionKind::Buy,
            payment_method: Some(method),
            amount,
            referrer: self.referrals.referrer_for(buyer).await,
        };

        let mut approval_tx = None;
        let mut baseline = None;
        let handle = match method {
            PaymentMethod::Stablecoin => {
                let balance = self.gateway.read_stablecoin_balance(buyer).await?;
                if balance < amount {
                    return Err(DashboardError::InsufficientFunds);
                }

                let sale = self.gateway.addresses().sale;
                let allowance = self.gateway.read_allowance(buyer, sale).await?;
                if allowance < amount {
                    let request = ApprovalRequest {
                        spender: sale,
                        purchase: amount,
                        current_allowance: allowance,
                        approve_amount: checked_mul(amount, self.approval_multiplier)?,
                    };
                    run.stage(ActionStage::Approving);
                    prompt.confirm_approval(&request).await?;
                    let approval = self
                        .gateway
                        .submit_approve(sale, request.approve_amount)
                        .await?;
                    run.publish(ActionStage::Approving, Some(approval.tx_hash()), None);
                    approval.await_confirmation().await?;
                    approval_tx = Some(approval.tx_hash());
                }

                baseline = self.baseline(buyer);
                run.stage(ActionStage::Submitting);
                self.gateway.submit_buy(amount, pending.referrer).await?
            }
            PaymentMethod::NativeCoin => {
                let rate = self.gateway.read_exchange_rate().await?;
                let value = native_for_stable(amount, rate)?;
                baseline = self.baseline(buyer);
                run.stage(ActionStage::Submitting);
                self.gateway.submit_buy_native(value, pending.referrer).await?
            }
        };

        run.publish(ActionStage::Confirming, Some(handle.tx_hash()), None);
        handle.await_confirmation().await?;
        Ok((Submitted { handle, baseline }, approval_tx, pending))
    }

    pub async fn sell(&self, amount: U256) -> Result<ActionOutcome, DashboardError> {
        let run = self.begin(ActionKind::Sell);
        let submitted = async {
            let seller = self.buyer()?;
            if amount.is_zero() {
                return Err(DashboardError::InvalidAmount("0".to_owned()));
            }
            let baseline = self.baseline(seller);
            run.stage(ActionStage::Submitting);
            let handle = self.gateway.submit_sell(amount).await?;
            Ok(Submitted { handle, baseline })
        };
        self.confirm_and_finish(&run, submitted.await).await
    }

    pub async fn claim(&self) -> Result<ActionOutcome, DashboardError> {
        let run = self.begin(ActionKind::Claim);
        let submitted = async {
            let claimant = self.buyer()?;
            let baseline = self.baseline(claimant);
            run.stage(ActionStage::Submitting);
            let handle = self.gateway.submit_claim().await?;
            Ok(Submitted { handle, baseline })
        };
        self.confirm_and_finish(&run, submitted.await).await
    }

    async fn confirm_and_finish(
        &self,
        run: &ActionRun<'_>,
        submitted: Result<Submitted, DashboardError>,
    ) -> Result<ActionOutcome, DashboardError> {
        let submitted = submitted.map_err(|err| run.failed(err))?;
        run.publish(ActionStage::Confirming, Some(submitted.handle.tx_hash()), None);
        submitted
            .handle
            .await_confirmation()
            .await
            .map_err(|err| run.failed(err))?;
        Ok(self.finish(run, &submitted, None).await)
    }

    /// Marks the action done and waits for the dashboard to move off the
    /// pre-submit holdings. A refresh that never sees the change is
    /// reported, not returned.
    async fn finish(
        &self,
        run: &ActionRun<'_>,
        submitted: &Submitted,
        referrer: Option<Address>,
    ) -> ActionOutcome {
        let tx_hash = submitted.handle.tx_hash();
        run.publish(ActionStage::Done, Some(tx_hash), None);

        let refreshed = self.refresher.refresh_until_changed(submitted.baseline.as_ref()).await;
        let dashboard_refreshed = match refreshed {
            Ok(_) => true,
            Err(err) => {
                warn!("dashboard not refreshed after {:?}: {}", run.kind, err);
                self.notifier.error(&err);
                false
            }
        };

        ActionOutcome {
            action_id: run.id,
            kind: run.kind,
            tx_hash,
            approval_tx_hash: None,
            referrer,
            dashboard_refreshed,
        }
    }
}
