use alloy_primitives::{Address, Bytes, TxHash, U64};
use alloy_sol_types::{Revert, SolError};
use async_trait::async_trait;
use cs_api_types::{BackendKind, DashboardError};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{BackendEvent, BackendResult, TxReceipt, TxRequest, WalletBackend};

/// Error codes from EIP-1193 and JSON-RPC 2.0 that the classifier cares
/// about.
pub mod codes {
    pub const EXECUTION_REVERTED: i64 = 3;
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const DISCONNECTED: i64 = 4900;
    pub const CHAIN_DISCONNECTED: i64 = 4901;
    pub const REQUEST_PENDING: i64 = -32002;
    pub const INTERNAL: i64 = -32603;
    pub const TRANSPORT_FAILURE: i64 = -32099;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message} (code {code})")]
pub struct ProviderRpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl ProviderRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(codes::TRANSPORT_FAILURE, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// `request(method, params)` plus event subscription: the surface an
/// injected provider exposes.
#[async_trait]
pub trait Eip1193Provider: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderRpcError>;
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;
}

/// Maps a raw provider error onto the dashboard taxonomy. Raw messages only
/// survive inside `TransactionReverted` and `UnknownBackendError`.
pub fn classify(err: &ProviderRpcError) -> DashboardError {
    let lower = err.message.to_ascii_lowercase();
    if err.code == codes::USER_REJECTED
        || lower.contains("user rejected")
        || lower.contains("user denied")
    {
        return DashboardError::UserRejected;
    }

    match err.code {
        codes::UNAUTHORIZED | codes::DISCONNECTED | codes::CHAIN_DISCONNECTED => {
            DashboardError::NotConnected
        }
        code if code == codes::EXECUTION_REVERTED || lower.contains("execution reverted") => {
            DashboardError::TransactionReverted(revert_reason(err))
        }
        _ => DashboardError::UnknownBackendError(err.message.clone()),
    }
}

fn revert_reason(err: &ProviderRpcError) -> String {
    if let Some(reason) = err
        .data
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|raw| alloy_primitives::hex::decode(raw).ok())
        .and_then(|bytes| Revert::abi_decode(&bytes).ok())
    {
        return reason.reason;
    }

    match err.message.split_once("execution reverted:") {
        Some((_, reason)) if !reason.trim().is_empty() => reason.trim().to_owned(),
        _ => "execution reverted".to_owned(),
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> BackendResult<T> {
    serde_json::from_value(value).map_err(|err| {
        DashboardError::UnknownBackendError(format!("malformed response to {method}: {err}"))
    })
}

async fn rpc<T: DeserializeOwned>(
    provider: &dyn Eip1193Provider,
    method: &str,
    params: Value,
) -> BackendResult<T> {
    let value = provider
        .request(method, params)
        .await
        .map_err(|err| classify(&err))?;
    decode(method, value)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: TxHash,
    status: Option<U64>,
    block_number: Option<U64>,
}

pub(crate) async fn request_accounts(provider: &dyn Eip1193Provider) -> BackendResult<Vec<Address>> {
    rpc(provider, "eth_requestAccounts", json!([])).await
}

pub(crate) async fn chain_id(provider: &dyn Eip1193Provider) -> BackendResult<u64> {
    let id: U64 = rpc(provider, "eth_chainId", json!([])).await?;
    Ok(id.to::<u64>())
}

pub(crate) async fn call(provider: &dyn Eip1193Provider, tx: &TxRequest) -> BackendResult<Bytes> {
    rpc(provider, "eth_call", json!([tx, "latest"])).await
}

pub(crate) async fn send_transaction(
    provider: &dyn Eip1193Provider,
    tx: &TxRequest,
) -> BackendResult<TxHash> {
    rpc(provider, "eth_sendTransaction", json!([tx])).await
}

pub(crate) async fn transaction_receipt(
    provider: &dyn Eip1193Provider,
    tx_hash: TxHash,
) -> BackendResult<Option<TxReceipt>> {
    let raw: Option<RawReceipt> = rpc(provider, "eth_getTransactionReceipt", json!([tx_hash])).await?;
    Ok(raw.map(|raw| TxReceipt {
        tx_hash: raw.transaction_hash,
        // Pre-byzantium receipts carry no status; treat them as mined.
        success: raw.status.map(|status| !status.is_zero()).unwrap_or(true),
        block_number: raw.block_number.map(|n| n.to::<u64>()),
    }))
}

/// Backend over an injected provider (`window.ethereum` and friends).
pub struct InjectedBackend<P> {
    provider: Arc<P>,
}

impl<P: Eip1193Provider> InjectedBackend<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }
}

#[async_trait]
impl<P: Eip1193Provider + 'static> WalletBackend for InjectedBackend<P> {
    fn kind(&self) -> BackendKind {
        BackendKind::Extension
    }

    async fn request_accounts(&self) -> BackendResult<Vec<Address>> {
        request_accounts(self.provider.as_ref()).await
    }

    async fn chain_id(&self) -> BackendResult<u64> {
        chain_id(self.provider.as_ref()).await
    }

    async fn call(&self, tx: &TxRequest) -> BackendResult<Bytes> {
        call(self.provider.as_ref(), tx).await
    }

    async fn send_transaction(&self, tx: &TxRequest) -> BackendResult<TxHash> {
        send_transaction(self.provider.as_ref(), tx).await
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> BackendResult<Option<TxReceipt>> {
        transaction_receipt(self.provider.as_ref(), tx_hash).await
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.provider.subscribe()
    }

    async fn disconnect(&self) -> BackendResult<()> {
        // Extensions keep their own permission state; there is nothing to end.
        debug!("extension backend released");
        Ok(())
    }
}
