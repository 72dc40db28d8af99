use alloy_primitives::{Address, TxHash, U256};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Extension,
    WalletConnect,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    UserRequested,
    BackendDisconnected,
    AccountsRevoked,
    WrongChain,
}

/// Serializable view of the wallet session. The signing capability never
/// leaves the session manager, so it has no field here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub address: Option<Address>,
    pub backend: Option<BackendKind>,
    pub chain_id: Option<u64>,
    pub epoch: u64,
    pub last_disconnect: Option<DisconnectReason>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            address: None,
            backend: None,
            chain_id: None,
            epoch: 0,
            last_disconnect: None,
        }
    }
}

/// Holdings of one address as reported by the sale contract.
///
/// Amounts are 18-decimal fixed point. `lock_end` is a unix timestamp in
/// seconds and is only present while the position is locked.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoldingsSnapshot {
    pub balance: U256,
    pub pending_rewards: U256,
    pub locked_amount: U256,
    pub lock_end: Option<u64>,
    pub is_locked: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    NoRewardsYet,
    NextRewardPending,
    RewardsClaimable,
}

impl RewardStatus {
    pub fn from_holdings(holdings: &HoldingsSnapshot) -> Self {
        if !holdings.pending_rewards.is_zero() {
            RewardStatus::RewardsClaimable
        } else if !holdings.balance.is_zero() {
            RewardStatus::NextRewardPending
        } else {
            RewardStatus::NoRewardsYet
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DashboardSnapshot {
    pub address: Address,
    pub holdings: HoldingsSnapshot,
    pub reward_status: RewardStatus,
    pub fetched_at_epoch_ms: u128,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Stablecoin,
    NativeCoin,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Buy,
    Sell,
    Claim,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingAction {
    pub kind: ActionKind,
    pub payment_method: Option<PaymentMethod>,
    pub amount: U256,
    pub referrer: Option<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "stage", content = "error", rename_all = "snake_case")]
pub enum ActionStage {
    Validating,
    Approving,
    Submitting,
    Confirming,
    Done,
    Failed(DashboardError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionStatus {
    pub action_id: Uuid,
    pub kind: ActionKind,
    #[serde(flatten)]
    pub stage: ActionStage,
    pub tx_hash: Option<TxHash>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferralInfo {
    pub referrer: Option<Address>,
    pub total_earnings: U256,
    pub count: U256,
    pub total_volume: U256,
}

/// Every failure the dashboard core can report. The `Display` text of each
/// variant is what a user gets to read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum DashboardError {
    #[error("no wallet extension was found; install or unlock one and try again")]
    NoProviderFound,
    #[error("the WalletConnect relay is unavailable; try again in a moment")]
    RelayUnavailable,
    #[error("the request was rejected in your wallet")]
    UserRejected,
    #[error("your wallet is on the wrong network; switch to the supported chain")]
    WrongChain,
    #[error("connect your wallet first")]
    NotConnected,
    #[error("insufficient balance for this amount")]
    InsufficientFunds,
    #[error("spending approval required before this purchase")]
    AllowanceInsufficient,
    #[error("the transaction was reverted on-chain: {0}")]
    TransactionReverted(String),
    #[error("amount is too large")]
    AmountOverflow,
    #[error("the wallet or network did not respond in time")]
    Timeout,
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("wallet error: {0}")]
    UnknownBackendError(String),
}

impl DashboardError {
    pub fn code(&self) -> &'static str {
        match self {
            DashboardError::NoProviderFound => "no_provider_found",
            DashboardError::RelayUnavailable => "relay_unavailable",
            DashboardError::UserRejected => "user_rejected",
            DashboardError::WrongChain => "wrong_chain",
            DashboardError::NotConnected => "not_connected",
            DashboardError::InsufficientFunds => "insufficient_funds",
            DashboardError::AllowanceInsufficient => "allowance_insufficient",
            DashboardError::TransactionReverted(_) => "transaction_reverted",
            DashboardError::AmountOverflow => "amount_overflow",
            DashboardError::Timeout => "timeout",
            DashboardError::InvalidAmount(_) => "invalid_amount",
            DashboardError::UnknownBackendError(_) => "unknown_backend_error",
        }
    }

    /// Failures detected before anything was sent to the wallet.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            DashboardError::NotConnected
                | DashboardError::InsufficientFunds
                | DashboardError::InvalidAmount(_)
                | DashboardError::AmountOverflow
        )
    }
}

// ── HTTP adapter payloads ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyRequest {
    pub amount: String,
    pub method: PaymentMethod,
    #[serde(default)]
    pub approve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellRequest {
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardResponse {
    pub address: Option<String>,
    pub short_address: Option<String>,
    pub balance: Option<String>,
    pub pending_rewards: Option<String>,
    pub locked_amount: Option<String>,
    pub lock_status: Option<String>,
    pub reward_status: Option<RewardStatus>,
    pub fetched_at_epoch_ms: Option<u128>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub action_id: Uuid,
    pub kind: ActionKind,
    pub tx_hash: TxHash,
    pub approval_tx_hash: Option<TxHash>,
    pub referrer: Option<Address>,
    pub dashboard_refreshed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralResponse {
    pub referrer: Option<Address>,
    pub info: Option<ReferralInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reward_status_follows_rewards_then_balance() {
        let mut holdings = HoldingsSnapshot::default();
        assert_eq!(RewardStatus::from_holdings(&holdings), RewardStatus::NoRewardsYet);

        holdings.balance = U256::from(1000);
        assert_eq!(RewardStatus::from_holdings(&holdings), RewardStatus::NextRewardPending);

        holdings.pending_rewards = U256::from(5);
        assert_eq!(RewardStatus::from_holdings(&holdings), RewardStatus::RewardsClaimable);
    }

    #[test]
    fn rejection_revert_and_preflight_read_differently() {
        let rejected = DashboardError::UserRejected.to_string();
        let reverted = DashboardError::TransactionReverted("sale closed".to_owned()).to_string();
        let funds = DashboardError::InsufficientFunds.to_string();
        let offline = DashboardError::NotConnected.to_string();

        assert!(reverted.contains("sale closed"));
        let all = [&rejected, &reverted, &funds, &offline];
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
            assert_ne!(a.as_str(), "error");
        }
        assert!(DashboardError::InsufficientFunds.is_preflight());
        assert!(!DashboardError::UserRejected.is_preflight());
    }

    #[test]
    fn failed_stage_serializes_with_error_code() -> Result<(), serde_json::Error> {
        let status = ActionStatus {
            action_id: Uuid::nil(),
            kind: ActionKind::Buy,
            stage: ActionStage::Failed(DashboardError::InsufficientFunds),
            tx_hash: None,
            message: None,
        };
        let value = serde_json::to_value(&status)?;
        assert_eq!(value["stage"], "failed");
        assert_eq!(value["error"]["code"], "insufficient_funds");
        Ok(())
    }
}
