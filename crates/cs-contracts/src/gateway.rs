use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::{SolCall, SolType, SolValue};
use cs_api_types::{DashboardError, HoldingsSnapshot, ReferralInfo};
use cs_session::{SessionManager, SigningHandle};
use cs_wallet_backend::TxRequest;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bindings::{SaleContract, Stablecoin};
use crate::{ConfirmationPolicy, ContractAddresses, TransactionHandle};

/// Typed reads and writes against the two contracts, through the wallet of
/// the current session.
#[derive(Clone)]
pub struct ContractGateway {
    sessions: SessionManager,
    addresses: ContractAddresses,
    confirmation: ConfirmationPolicy,
}

fn undecodable(function: &str, err: alloy_sol_types::Error) -> DashboardError {
    DashboardError::UnknownBackendError(format!("undecodable {function} result: {err}"))
}

fn decode<T>(function: &str, raw: &[u8]) -> Result<T, DashboardError>
where
    T: SolValue + From<<T::SolType as SolType>::RustType>,
{
    T::abi_decode(raw).map_err(|err| undecodable(function, err))
}

fn decode_user_holdings(raw: &[u8]) -> Result<HoldingsSnapshot, DashboardError> {
    let (locked_amount, _earned, total_balance, pending_rewards, lock_end, is_locked) =
        <(U256, U256, U256, U256, U256, bool)>::abi_decode_params(raw)
            .map_err(|err| undecodable("getUserHoldings", err))?;

    Ok(HoldingsSnapshot {
        balance: total_balance,
        pending_rewards,
        locked_amount,
        lock_end: is_locked.then(|| lock_end.saturating_to::<u64>()),
        is_locked,
    })
}

impl ContractGateway {
    pub fn new(sessions: SessionManager, addresses: ContractAddresses) -> Self {
        Self {
            sessions,
            addresses,
            confirmation: ConfirmationPolicy::default(),
        }
    }

    pub fn with_confirmation(mut self, policy: ConfirmationPolicy) -> Self {
        self.confirmation = policy;
        self
    }

    pub fn addresses(&self) -> &ContractAddresses {
        &self.addresses
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn signer(&self) -> Result<SigningHandle, DashboardError> {
        self.sessions.current_session().require_signer().cloned()
    }

    async fn eth_call<C: SolCall>(&self, to: Address, call: C) -> Result<Bytes, DashboardError> {
        let signer = self.signer()?;
        let tx = TxRequest::call(to, call.abi_encode()).from(signer.address());
        signer.backend().call(&tx).await
    }

    pub async fn read_balance(&self, address: Address) -> Result<U256, DashboardError> {
        let raw = self
            .eth_call(self.addresses.sale, SaleContract::balanceOfCall { account: address })
            .await?;
        decode("balanceOf", &raw)
    }

    pub async fn read_pending_rewards(&self, address: Address) -> Result<U256, DashboardError> {
        let raw = self
            .eth_call(self.addresses.sale, SaleContract::calculateRewardsCall { user: address })
            .await?;
        decode("calculateRewards", &raw)
    }

    /// One consistent view of `address`'s position. Falls back to
    /// `balanceOf` + `calculateRewards` when the deployment cannot answer
    /// `getUserHoldings`: the call reverts or returns nothing decodable.
    /// Transport and node failures are returned as they are.
    pub async fn read_holdings(&self, address: Address) -> Result<HoldingsSnapshot, DashboardError> {
        let combined = self
            .eth_call(self.addresses.sale, SaleContract::getUserHoldingsCall { user: address })
            .await;
        let unavailable = match combined {
            Ok(raw) => match decode_user_holdings(&raw) {
                Ok(holdings) => return Ok(holdings),
                Err(err) => err,
            },
            Err(err @ DashboardError::TransactionReverted(_)) => err,
            Err(err) => return Err(err),
        };

        debug!("getUserHoldings unavailable for {} ({}), composing from balance and rewards", address, unavailable);
        let balance = self.read_balance(address).await?;
        let pending_rewards = self.read_pending_rewards(address).await?;
        Ok(HoldingsSnapshot {
            balance,
            pending_rewards,
            ..HoldingsSnapshot::default()
        })
    }

    pub async fn read_allowance(&self, owner: Address, spender: Address) -> Result<U256, DashboardError> {
        let raw = self
            .eth_call(self.addresses.stablecoin, Stablecoin::allowanceCall { owner, spender })
            .await?;
        decode("allowance", &raw)
    }

    pub async fn read_stablecoin_balance(&self, address: Address) -> Result<U256, DashboardError> {
        let raw = self
            .eth_call(self.addresses.stablecoin, Stablecoin::balanceOfCall { account: address })
            .await?;
        decode("balanceOf", &raw)
    }

    /// Stablecoin per native coin, 18 decimals.
    pub async fn read_exchange_rate(&self) -> Result<U256, DashboardError> {
        let raw = self
            .eth_call(self.addresses.sale, SaleContract::bnbToUsdtRateCall {})
            .await?;
        decode("bnbToUsdtRate", &raw)
    }

    pub async fn read_referral_info(&self, address: Address) -> Result<ReferralInfo, DashboardError> {
        let raw = self
            .eth_call(self.addresses.sale, SaleContract::getReferralInfoCall { user: address })
            .await?;
        let (referrer, total_earnings, count, total_volume) =
            <(Address, U256, U256, U256)>::abi_decode_params(&raw)
                .map_err(|err| undecodable("getReferralInfo", err))?;
        Ok(ReferralInfo {
            referrer: (referrer != Address::ZERO).then_some(referrer),
            total_earnings,
            count,
            total_volume,
        })
    }

    pub async fn has_referrer(&self, address: Address) -> Result<bool, DashboardError> {
        let raw = self
            .eth_call(self.addresses.sale, SaleContract::hasReferrerCall { user: address })
            .await?;
        decode("hasReferrer", &raw)
    }

    async fn submit<C: SolCall>(
        &self,
        to: Address,
        call: C,
        value: Option<U256>,
        label: &'static str,
    ) -> Result<TransactionHandle, DashboardError> {
        let signer = self.signer()?;
        let mut tx = TxRequest::call(to, call.abi_encode()).from(signer.address());
        if let Some(value) = value {
            tx = tx.value(value);
        }
        let tx_hash = signer.backend().send_transaction(&tx).await?;
        info!("{} from {} broadcast as {}", label, signer.address(), tx_hash);
        Ok(TransactionHandle::new(
            tx_hash,
            label,
            Arc::clone(signer.backend()),
            self.confirmation.clone(),
        ))
    }

    pub async fn submit_buy(
        &self,
        amount: U256,
        referrer: Option<Address>,
    ) -> Result<TransactionHandle, DashboardError> {
        let sale = self.addresses.sale;
        match referrer {
            Some(referrer) => {
                let call = SaleContract::buyTokensWithReferralCall { usdtAmount: amount, referrer };
                self.submit(sale, call, None, "buyTokensWithReferral").await
            }
            None => {
                let call = SaleContract::buyTokensCall { usdtAmount: amount };
                self.submit(sale, call, None, "buyTokens").await
            }
        }
    }

    pub async fn submit_buy_native(
        &self,
        amount_native: U256,
        referrer: Option<Address>,
    ) -> Result<TransactionHandle, DashboardError> {
        let sale = self.addresses.sale;
        match referrer {
            Some(referrer) => {
                let call = SaleContract::buyTokensWithBNBAndReferralCall { referrer };
                self.submit(sale, call, Some(amount_native), "buyTokensWithBNBAndReferral")
                    .await
            }
            None => {
                let call = SaleContract::buyTokensWithBNBCall {};
                self.submit(sale, call, Some(amount_native), "buyTokensWithBNB").await
            }
        }
    }

    pub async fn submit_sell(&self, amount: U256) -> Result<TransactionHandle, DashboardError> {
        let call = SaleContract::sellTokensCall { amount };
        self.submit(self.addresses.sale, call, None, "sellTokens").await
    }

    pub async fn submit_claim(&self) -> Result<TransactionHandle, DashboardError> {
        let call = SaleContract::claimRewardsCall {};
        self.submit(self.addresses.sale, call, None, "claimRewards").await
    }

    pub async fn submit_approve(
        &self,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionHandle, DashboardError> {
        let call = Stablecoin::approveCall { spender, amount };
        self.submit(self.addresses.stablecoin, call, None, "approve").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::{parse_units, unit};
    use crate::simulator::SimulatedChain;
    use alloy_primitives::address;
    use cs_api_types::BackendKind;
    use cs_session::SessionConfig;
    use std::time::Duration;

    const HOLDER: Address = address!("0x00000000000000000000000000000000000000d1");

    fn tokens(n: u64) -> U256 {
        U256::from(n) * unit(18)
    }

    fn setup() -> (Arc<SimulatedChain>, ContractGateway) {
        let chain = Arc::new(SimulatedChain::new(ContractAddresses::default(), 56));
        chain.set_wallet_accounts(vec![HOLDER]);
        let sessions = SessionManager::new(Arc::new(chain.backends()), SessionConfig::default());
        let gateway = ContractGateway::new(sessions, chain.addresses()).with_confirmation(
            ConfirmationPolicy {
                initial_poll: Duration::from_millis(10),
                max_poll: Duration::from_millis(40),
                timeout: Duration::from_secs(2),
            },
        );
        (chain, gateway)
    }

    #[tokio::test]
    async fn holdings_come_from_the_combined_call() -> Result<(), DashboardError> {
        let (chain, gateway) = setup();
        chain.set_tokens(HOLDER, tokens(500));
        chain.set_rewards(HOLDER, tokens(3));
        chain.lock(HOLDER, tokens(200), 1_900_000_000);
        gateway.sessions().connect(BackendKind::Extension).await?;

        let first = gateway.read_holdings(HOLDER).await?;
        assert_eq!(first.balance, tokens(500));
        assert_eq!(first.pending_rewards, tokens(3));
        assert_eq!(first.locked_amount, tokens(200));
        assert_eq!(first.lock_end, Some(1_900_000_000));
        assert!(first.is_locked);

        let second = gateway.read_holdings(HOLDER).await?;
        assert_eq!(first, second);
        assert_eq!(chain.calls_to("balanceOf"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn holdings_fall_back_when_combined_call_is_missing() -> Result<(), DashboardError> {
        let (chain, gateway) = setup();
        chain.disable_holdings();
        chain.set_tokens(HOLDER, tokens(7));
        chain.set_rewards(HOLDER, tokens(1));
        gateway.sessions().connect(BackendKind::Extension).await?;

        let holdings = gateway.read_holdings(HOLDER).await?;
        assert_eq!(
            holdings,
            HoldingsSnapshot {
                balance: tokens(7),
                pending_rewards: tokens(1),
                ..HoldingsSnapshot::default()
            }
        );
        assert_eq!(chain.calls_to("balanceOf"), 1);
        assert_eq!(chain.calls_to("calculateRewards"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn node_failures_are_not_papered_over_by_the_fallback() -> Result<(), DashboardError> {
        let (chain, gateway) = setup();
        chain.set_tokens(HOLDER, tokens(7));
        chain.lock(HOLDER, tokens(5), 1_900_000_000);
        gateway.sessions().connect(BackendKind::Extension).await?;

        chain.fail_reads(Some("node overloaded"));
        assert!(matches!(
            gateway.read_holdings(HOLDER).await,
            Err(DashboardError::UnknownBackendError(_))
        ));
        assert_eq!(chain.calls_to("balanceOf"), 0);

        chain.fail_reads(None);
        assert!(gateway.read_holdings(HOLDER).await?.is_locked);
        Ok(())
    }

    #[tokio::test]
    async fn everything_needs_a_connected_session() {
        let (chain, gateway) = setup();
        assert_eq!(gateway.read_holdings(HOLDER).await, Err(DashboardError::NotConnected));
        assert_eq!(gateway.submit_claim().await.err(), Some(DashboardError::NotConnected));
        assert_eq!(
            gateway.submit_approve(chain.addresses().sale, tokens(1)).await.err(),
            Some(DashboardError::NotConnected)
        );
        assert!(chain.sent().is_empty());
    }

    #[tokio::test]
    async fn approve_then_buy_moves_funds() -> Result<(), DashboardError> {
        let (chain, gateway) = setup();
        let sale = chain.addresses().sale;
        chain.fund_stablecoin(HOLDER, tokens(100));
        gateway.sessions().connect(BackendKind::Extension).await?;

        let approval = gateway.submit_approve(sale, tokens(1000)).await?;
        approval.await_confirmation().await?;
        assert_eq!(gateway.read_allowance(HOLDER, sale).await?, tokens(1000));

        let buy = gateway.submit_buy(parse_units("40", 18)?, None).await?;
        let receipt = buy.await_confirmation().await?;
        assert!(receipt.success);
        assert_eq!(receipt.tx_hash, buy.tx_hash());
        assert_eq!(gateway.read_balance(HOLDER).await?, tokens(40));
        assert_eq!(gateway.read_stablecoin_balance(HOLDER).await?, tokens(60));
        assert_eq!(chain.sent(), vec!["approve", "buyTokens"]);
        Ok(())
    }

    #[tokio::test]
    async fn native_buy_with_referral_records_the_referrer() -> Result<(), DashboardError> {
        let (chain, gateway) = setup();
        let referrer = address!("0x00000000000000000000000000000000000000f0");
        gateway.sessions().connect(BackendKind::Extension).await?;

        let rate = gateway.read_exchange_rate().await?;
        assert_eq!(rate, tokens(600));
        let handle = gateway.submit_buy_native(unit(18), Some(referrer)).await?;
        handle.await_confirmation().await?;

        assert_eq!(gateway.read_balance(HOLDER).await?, tokens(600));
        assert!(gateway.has_referrer(HOLDER).await?);
        let info = gateway.read_referral_info(HOLDER).await?;
        assert_eq!(info.referrer, Some(referrer));
        let earned = gateway.read_referral_info(referrer).await?;
        assert_eq!(earned.count, U256::from(1));
        assert_eq!(earned.total_volume, tokens(600));
        Ok(())
    }

    #[tokio::test]
    async fn rejection_and_reverts_are_classified() -> Result<(), DashboardError> {
        let (chain, gateway) = setup();
        chain.set_rewards(HOLDER, tokens(2));
        gateway.sessions().connect(BackendKind::Extension).await?;

        chain.reject_next_send();
        assert_eq!(gateway.submit_claim().await.err(), Some(DashboardError::UserRejected));

        // Rejected by the node before broadcast.
        let err = gateway.submit_sell(tokens(5)).await.err();
        assert_eq!(
            err,
            Some(DashboardError::TransactionReverted("Insufficient token balance".to_owned()))
        );

        // Mined with status 0.
        chain.revert_next_tx();
        let handle = gateway.submit_claim().await?;
        assert!(matches!(
            handle.await_confirmation().await,
            Err(DashboardError::TransactionReverted(_))
        ));
        assert_eq!(gateway.read_pending_rewards(HOLDER).await?, tokens(2));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_gives_up_after_timeout() -> Result<(), DashboardError> {
        let (chain, gateway) = setup();
        chain.set_rewards(HOLDER, tokens(2));
        chain.set_receipt_delay(u32::MAX);
        gateway.sessions().connect(BackendKind::Extension).await?;

        let handle = gateway.submit_claim().await?;
        assert_eq!(handle.await_confirmation().await, Err(DashboardError::Timeout));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn receipt_lookup_errors_are_retried_until_mined() -> Result<(), DashboardError> {
        let (chain, gateway) = setup();
        chain.set_rewards(HOLDER, tokens(2));
        gateway.sessions().connect(BackendKind::Extension).await?;

        let handle = gateway.submit_claim().await?;
        chain.fail_receipt_polls(3);
        let receipt = handle.await_confirmation().await?;
        assert!(receipt.success);
        assert_eq!(gateway.read_pending_rewards(HOLDER).await?, U256::ZERO);
        Ok(())
    }
}
