//! In-memory model of the sale and stablecoin contracts behind a wallet.
//!
//! `SimulatedChain` answers the EIP-1193 surface (and the relay surface) the
//! way a wallet connected to the real deployment would, so the dashboard can
//! be driven end to end without a node.

use alloy_primitives::{Address, Bytes, TxHash, U256, hex, keccak256};
use alloy_sol_types::{Revert, SolError, SolInterface, SolValue};
use async_trait::async_trait;
use cs_session::StaticBackends;
use cs_wallet_backend::{
    BackendEvent, Eip1193Provider, InjectedBackend, ProviderRpcError, RelayClient, RelayConfig,
    WalletConnectBackend, codes,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::ContractAddresses;
use crate::amount::{DECIMALS, unit};
use crate::bindings::{SaleContract::SaleContractCalls, Stablecoin::StablecoinCalls};

/// Referral commission paid by the modelled contract, in percent.
const REFERRAL_PERCENT: u64 = 5;

#[derive(Debug, Clone, Default)]
struct Account {
    tokens: U256,
    rewards: U256,
    claimed: U256,
    locked: U256,
    lock_end: Option<u64>,
    stablecoin: U256,
}

#[derive(Debug, Clone, Default)]
struct ReferralStats {
    earnings: U256,
    count: U256,
    volume: U256,
}

#[derive(Debug, Clone)]
struct PendingReceipt {
    polls_left: u32,
    success: bool,
    block: u64,
}

struct ChainState {
    chain_id: u64,
    wallet_accounts: Vec<Address>,
    reject_connect: bool,
    relay_down: bool,
    ledger: HashMap<Address, Account>,
    allowances: HashMap<(Address, Address), U256>,
    rate: U256,
    referrers: HashMap<Address, Address>,
    referral_stats: HashMap<Address, ReferralStats>,
    holdings_supported: bool,
    reject_next_send: bool,
    revert_next_tx: bool,
    receipt_delay: u32,
    receipts: HashMap<TxHash, PendingReceipt>,
    nonce: u64,
    block: u64,
    latency: Duration,
    read_failure: Option<String>,
    receipt_failures: u32,
    calls: Vec<&'static str>,
    sent: Vec<&'static str>,
    relay_config: Option<RelayConfig>,
}

pub struct SimulatedChain {
    addresses: ContractAddresses,
    state: Mutex<ChainState>,
    events: broadcast::Sender<BackendEvent>,
}

#[derive(Debug, Deserialize)]
struct CallObject {
    from: Option<Address>,
    to: Address,
    #[serde(default, alias = "input")]
    data: Option<Bytes>,
    #[serde(default)]
    value: Option<U256>,
}

fn revert(reason: &str) -> ProviderRpcError {
    let payload = Revert {
        reason: reason.to_owned(),
    }
    .abi_encode();
    ProviderRpcError::new(codes::EXECUTION_REVERTED, format!("execution reverted: {reason}"))
        .with_data(Value::String(hex::encode_prefixed(payload)))
}

fn invalid_params(message: impl Into<String>) -> ProviderRpcError {
    ProviderRpcError::new(-32602, message)
}

fn encoded(bytes: Vec<u8>) -> Value {
    Value::String(hex::encode_prefixed(bytes))
}

fn call_object(params: &Value) -> Result<CallObject, ProviderRpcError> {
    let raw = params.get(0).cloned().unwrap_or(Value::Null);
    serde_json::from_value(raw).map_err(|err| invalid_params(format!("bad call object: {err}")))
}

impl SimulatedChain {
    pub fn new(addresses: ContractAddresses, chain_id: u64) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            addresses,
            state: Mutex::new(ChainState {
                chain_id,
                wallet_accounts: Vec::new(),
                reject_connect: false,
                relay_down: false,
                ledger: HashMap::new(),
                allowances: HashMap::new(),
                rate: U256::from(600) * unit(DECIMALS),
                referrers: HashMap::new(),
                referral_stats: HashMap::new(),
                holdings_supported: true,
                reject_next_send: false,
                revert_next_tx: false,
                receipt_delay: 1,
                receipts: HashMap::new(),
                nonce: 0,
                block: 1_000,
                latency: Duration::ZERO,
                read_failure: None,
                receipt_failures: 0,
                calls: Vec::new(),
                sent: Vec::new(),
                relay_config: None,
            }),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn account(&self, holder: Address) -> Account {
        self.state().ledger.get(&holder).cloned().unwrap_or_default()
    }

    /// Both wallet backends over this chain, ready for a session manager.
    pub fn backends(self: &Arc<Self>) -> StaticBackends {
        let chain_id = self.state().chain_id;
        StaticBackends::default()
            .with_extension(Arc::new(InjectedBackend::new(Arc::clone(self))))
            .with_wallet_connect(Arc::new(WalletConnectBackend::new(
                Arc::clone(self),
                RelayConfig::new("simulator", chain_id),
            )))
    }

    pub fn addresses(&self) -> ContractAddresses {
        self.addresses
    }

    // ── scenario setup ──

    pub fn set_wallet_accounts(&self, accounts: Vec<Address>) {
        self.state().wallet_accounts = accounts;
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state().chain_id = chain_id;
    }

    pub fn reject_connect(&self, reject: bool) {
        self.state().reject_connect = reject;
    }

    pub fn set_relay_down(&self, down: bool) {
        self.state().relay_down = down;
    }

    pub fn fund_stablecoin(&self, holder: Address, amount: U256) {
        self.state().ledger.entry(holder).or_default().stablecoin = amount;
    }

    pub fn set_tokens(&self, holder: Address, amount: U256) {
        self.state().ledger.entry(holder).or_default().tokens = amount;
    }

    pub fn set_rewards(&self, holder: Address, amount: U256) {
        self.state().ledger.entry(holder).or_default().rewards = amount;
    }

    pub fn lock(&self, holder: Address, amount: U256, until: u64) {
        let mut state = self.state();
        let account = state.ledger.entry(holder).or_default();
        account.locked = amount;
        account.lock_end = Some(until);
    }

    pub fn set_allowance(&self, owner: Address, spender: Address, amount: U256) {
        self.state().allowances.insert((owner, spender), amount);
    }

    pub fn set_rate(&self, rate: U256) {
        self.state().rate = rate;
    }

    /// Models a deployment without `getUserHoldings`.
    pub fn disable_holdings(&self) {
        self.state().holdings_supported = false;
    }

    pub fn reject_next_send(&self) {
        self.state().reject_next_send = true;
    }

    /// The next transaction is mined with status 0 and changes nothing.
    pub fn revert_next_tx(&self) {
        self.state().revert_next_tx = true;
    }

    /// Number of receipt polls answered with `null` before a receipt appears.
    /// `u32::MAX` keeps transactions pending forever.
    pub fn set_receipt_delay(&self, polls: u32) {
        self.state().receipt_delay = polls;
    }

    /// Delay applied to every `eth_call`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Makes every `eth_call` fail with an internal node error.
    pub fn fail_reads(&self, message: Option<&str>) {
        self.state().read_failure = message.map(str::to_owned);
    }

    /// The next `polls` receipt lookups fail as if the node hiccuped.
    pub fn fail_receipt_polls(&self, polls: u32) {
        self.state().receipt_failures = polls;
    }

    pub fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    // ── inspection ──

    pub fn tokens_of(&self, holder: Address) -> U256 {
        self.account(holder).tokens
    }

    pub fn stablecoin_of(&self, holder: Address) -> U256 {
        self.account(holder).stablecoin
    }

    pub fn allowance_of(&self, owner: Address, spender: Address) -> U256 {
        self.state()
            .allowances
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn referrer_of(&self, holder: Address) -> Option<Address> {
        self.state().referrers.get(&holder).copied()
    }

    /// How many `eth_call`s hit the named contract function.
    pub fn calls_to(&self, function: &str) -> usize {
        self.state().calls.iter().filter(|name| **name == function).count()
    }

    /// Functions of every broadcast transaction, in order.
    pub fn sent(&self) -> Vec<&'static str> {
        self.state().sent.clone()
    }

    pub fn relay_config(&self) -> Option<RelayConfig> {
        self.state().relay_config.clone()
    }

    // ── EIP-1193 handling ──

    fn read(&self, call: CallObject) -> Result<Value, ProviderRpcError> {
        let data = call.data.unwrap_or_default();
        let mut state = self.state();
        if let Some(message) = &state.read_failure {
            return Err(ProviderRpcError::new(codes::INTERNAL, message.clone()));
        }

        if call.to == self.addresses.sale {
            let decoded = SaleContractCalls::abi_decode(&data)
                .map_err(|err| invalid_params(format!("unknown sale call: {err}")))?;
            let (name, out) = match decoded {
                SaleContractCalls::balanceOf(c) => {
                    let tokens = state.ledger.get(&c.account).map(|a| a.tokens).unwrap_or_default();
                    ("balanceOf", tokens.abi_encode())
                }
                SaleContractCalls::calculateRewards(c) => {
                    let rewards = state.ledger.get(&c.user).map(|a| a.rewards).unwrap_or_default();
                    ("calculateRewards", rewards.abi_encode())
                }
                SaleContractCalls::getUserHoldings(c) => {
                    state.calls.push("getUserHoldings");
                    if !state.holdings_supported {
                        return Err(ProviderRpcError::new(
                            codes::EXECUTION_REVERTED,
                            "execution reverted",
                        ));
                    }
                    let account = state.ledger.get(&c.user).cloned().unwrap_or_default();
                    let out = (
                        account.locked,
                        account.claimed + account.rewards,
                        account.tokens,
                        account.rewards,
                        U256::from(account.lock_end.unwrap_or_default()),
                        account.lock_end.is_some(),
                    )
                        .abi_encode_params();
                    return Ok(encoded(out));
                }
                SaleContractCalls::getReferralInfo(c) => {
                    let referrer = state.referrers.get(&c.user).copied().unwrap_or(Address::ZERO);
                    let stats = state.referral_stats.get(&c.user).cloned().unwrap_or_default();
                    let out = (referrer, stats.earnings, stats.count, stats.volume).abi_encode_params();
                    ("getReferralInfo", out)
                }
                SaleContractCalls::hasReferrer(c) => {
                    ("hasReferrer", state.referrers.contains_key(&c.user).abi_encode())
                }
                SaleContractCalls::bnbToUsdtRate(_) => ("bnbToUsdtRate", state.rate.abi_encode()),
                _ => return Err(invalid_params("state-changing function used with eth_call")),
            };
            state.calls.push(name);
            return Ok(encoded(out));
        }

        if call.to == self.addresses.stablecoin {
            let decoded = StablecoinCalls::abi_decode(&data)
                .map_err(|err| invalid_params(format!("unknown stablecoin call: {err}")))?;
            let (name, out) = match decoded {
                StablecoinCalls::balanceOf(c) => {
                    let balance = state.ledger.get(&c.account).map(|a| a.stablecoin).unwrap_or_default();
                    ("stablecoin.balanceOf", balance.abi_encode())
                }
                StablecoinCalls::allowance(c) => {
                    let allowance = state
                        .allowances
                        .get(&(c.owner, c.spender))
                        .copied()
                        .unwrap_or_default();
                    ("allowance", allowance.abi_encode())
                }
                StablecoinCalls::approve(_) => {
                    return Err(invalid_params("state-changing function used with eth_call"));
                }
            };
            state.calls.push(name);
            return Ok(encoded(out));
        }

        Err(invalid_params(format!("no contract at {}", call.to)))
    }

    fn send(&self, call: CallObject) -> Result<Value, ProviderRpcError> {
        let mut state = self.state();
        if std::mem::take(&mut state.reject_next_send) {
            return Err(ProviderRpcError::new(
                codes::USER_REJECTED,
                "MetaMask Tx Signature: User denied transaction signature.",
            ));
        }
        let from = call
            .from
            .ok_or_else(|| invalid_params("transaction without sender"))?;
        let data = call.data.unwrap_or_default();
        let value = call.value.unwrap_or_default();

        let mut next = ChainStateDelta::from(&*state);
        let label = if call.to == self.addresses.sale {
            let decoded = SaleContractCalls::abi_decode(&data)
                .map_err(|err| invalid_params(format!("unknown sale call: {err}")))?;
            next.apply_sale(self.addresses.sale, from, value, decoded)?
        } else if call.to == self.addresses.stablecoin {
            match StablecoinCalls::abi_decode(&data)
                .map_err(|err| invalid_params(format!("unknown stablecoin call: {err}")))?
            {
                StablecoinCalls::approve(c) => {
                    next.allowances.insert((from, c.spender), c.amount);
                    "approve"
                }
                _ => return Err(invalid_params("view function sent as transaction")),
            }
        } else {
            return Err(invalid_params(format!("no contract at {}", call.to)));
        };

        let success = !std::mem::take(&mut state.revert_next_tx);
        if success {
            state.ledger = next.ledger;
            state.allowances = next.allowances;
            state.referrers = next.referrers;
            state.referral_stats = next.referral_stats;
        }

        state.nonce += 1;
        state.block += 1;
        let tx_hash = keccak256(state.nonce.to_be_bytes());
        let pending = PendingReceipt {
            polls_left: state.receipt_delay,
            success,
            block: state.block,
        };
        state.receipts.insert(tx_hash, pending);
        state.sent.push(label);
        debug!("simulated {} from {} as {}", label, from, tx_hash);
        Ok(json!(tx_hash))
    }

    fn receipt(&self, params: &Value) -> Result<Value, ProviderRpcError> {
        let tx_hash: TxHash = params
            .get(0)
            .cloned()
            .map(serde_json::from_value::<TxHash>)
            .transpose()
            .map_err(|err| invalid_params(format!("bad transaction hash: {err}")))?
            .ok_or_else(|| invalid_params("missing transaction hash"))?;

        let mut state = self.state();
        if state.receipt_failures > 0 {
            state.receipt_failures -= 1;
            return Err(ProviderRpcError::new(codes::INTERNAL, "header not found"));
        }
        let Some(pending) = state.receipts.get_mut(&tx_hash) else {
            return Ok(Value::Null);
        };
        if pending.polls_left > 0 {
            if pending.polls_left != u32::MAX {
                pending.polls_left -= 1;
            }
            return Ok(Value::Null);
        }
        Ok(json!({
            "transactionHash": tx_hash,
            "status": if pending.success { "0x1" } else { "0x0" },
            "blockNumber": format!("{:#x}", pending.block),
        }))
    }
}

/// Working copy of the mutable ledger so a failing transaction leaves no
/// partial effects.
struct ChainStateDelta {
    ledger: HashMap<Address, Account>,
    allowances: HashMap<(Address, Address), U256>,
    referrers: HashMap<Address, Address>,
    referral_stats: HashMap<Address, ReferralStats>,
    rate: U256,
}

impl From<&ChainState> for ChainStateDelta {
    fn from(state: &ChainState) -> Self {
        Self {
            ledger: state.ledger.clone(),
            allowances: state.allowances.clone(),
            referrers: state.referrers.clone(),
            referral_stats: state.referral_stats.clone(),
            rate: state.rate,
        }
    }
}

impl ChainStateDelta {
    fn apply_sale(
        &mut self,
        sale: Address,
        from: Address,
        value: U256,
        call: SaleContractCalls,
    ) -> Result<&'static str, ProviderRpcError> {
        match call {
            SaleContractCalls::buyTokens(c) => {
                self.buy_with_stablecoin(sale, from, c.usdtAmount)?;
                Ok("buyTokens")
            }
            SaleContractCalls::buyTokensWithReferral(c) => {
                self.buy_with_stablecoin(sale, from, c.usdtAmount)?;
                self.record_referral(from, c.referrer, c.usdtAmount);
                Ok("buyTokensWithReferral")
            }
            SaleContractCalls::buyTokensWithBNB(_) => {
                self.buy_with_native(from, value)?;
                Ok("buyTokensWithBNB")
            }
            SaleContractCalls::buyTokensWithBNBAndReferral(c) => {
                let bought = self.buy_with_native(from, value)?;
                self.record_referral(from, c.referrer, bought);
                Ok("buyTokensWithBNBAndReferral")
            }
            SaleContractCalls::sellTokens(c) => {
                let account = self.ledger.entry(from).or_default();
                if account.tokens < c.amount {
                    return Err(revert("Insufficient token balance"));
                }
                account.tokens -= c.amount;
                account.stablecoin += c.amount;
                Ok("sellTokens")
            }
            SaleContractCalls::claimRewards(_) => {
                let account = self.ledger.entry(from).or_default();
                if account.rewards.is_zero() {
                    return Err(revert("No rewards to claim"));
                }
                account.stablecoin += account.rewards;
                account.claimed += account.rewards;
                account.rewards = U256::ZERO;
                Ok("claimRewards")
            }
            _ => Err(invalid_params("view function sent as transaction")),
        }
    }

    fn buy_with_stablecoin(
        &mut self,
        sale: Address,
        from: Address,
        amount: U256,
    ) -> Result<(), ProviderRpcError> {
        if amount.is_zero() {
            return Err(revert("Amount must be greater than 0"));
        }
        let allowance = self.allowances.get(&(from, sale)).copied().unwrap_or_default();
        if allowance < amount {
            return Err(revert("BEP20: transfer amount exceeds allowance"));
        }
        let account = self.ledger.entry(from).or_default();
        if account.stablecoin < amount {
            return Err(revert("BEP20: transfer amount exceeds balance"));
        }
        account.stablecoin -= amount;
        account.tokens += amount;
        self.allowances.insert((from, sale), allowance - amount);
        Ok(())
    }

    fn buy_with_native(&mut self, from: Address, value: U256) -> Result<U256, ProviderRpcError> {
        if value.is_zero() {
            return Err(revert("Send BNB to buy tokens"));
        }
        let bought = value
            .checked_mul(self.rate)
            .map(|v| v / unit(DECIMALS))
            .ok_or_else(|| revert("arithmetic overflow"))?;
        self.ledger.entry(from).or_default().tokens += bought;
        Ok(bought)
    }

    fn record_referral(&mut self, buyer: Address, referrer: Address, volume: U256) {
        if referrer == buyer || referrer == Address::ZERO {
            return;
        }
        self.referrers.entry(buyer).or_insert(referrer);
        let stats = self.referral_stats.entry(referrer).or_default();
        stats.count += U256::from(1);
        stats.volume += volume;
        stats.earnings += volume * U256::from(REFERRAL_PERCENT) / U256::from(100);
    }
}

#[async_trait]
impl Eip1193Provider for SimulatedChain {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderRpcError> {
        match method {
            "eth_requestAccounts" => {
                let state = self.state();
                if state.reject_connect {
                    return Err(ProviderRpcError::new(codes::USER_REJECTED, "User rejected the request."));
                }
                Ok(json!(state.wallet_accounts))
            }
            "eth_accounts" => Ok(json!(self.state().wallet_accounts)),
            "eth_chainId" => Ok(json!(format!("{:#x}", self.state().chain_id))),
            "eth_call" => {
                let call = call_object(&params)?;
                let latency = self.state().latency;
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                self.read(call)
            }
            "eth_sendTransaction" => self.send(call_object(&params)?),
            "eth_getTransactionReceipt" => self.receipt(&params),
            other => Err(ProviderRpcError::new(
                codes::UNSUPPORTED_METHOD,
                format!("simulator does not support {other}"),
            )),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl RelayClient for SimulatedChain {
    async fn init(&self, config: &RelayConfig) -> Result<(), ProviderRpcError> {
        let mut state = self.state();
        if state.relay_down {
            return Err(ProviderRpcError::transport("relay websocket unreachable"));
        }
        state.relay_config = Some(config.clone());
        Ok(())
    }

    async fn enable(&self) -> Result<Vec<Address>, ProviderRpcError> {
        let value = self.request("eth_requestAccounts", json!([])).await?;
        serde_json::from_value(value).map_err(|err| ProviderRpcError::new(codes::INTERNAL, err.to_string()))
    }

    fn accounts(&self) -> Vec<Address> {
        self.state().wallet_accounts.clone()
    }

    async fn disconnect(&self) -> Result<(), ProviderRpcError> {
        let _ = self.events.send(BackendEvent::Disconnect {
            code: codes::DISCONNECTED,
            message: "relay session ended".to_owned(),
        });
        Ok(())
    }
}
