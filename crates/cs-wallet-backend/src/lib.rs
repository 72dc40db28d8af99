//! Wallet backend capability.
//!
//! The dashboard talks to exactly one wallet at a time, either an injected
//! EIP-1193 provider (browser extension style) or a WalletConnect relay
//! session. Both are adapted into the [`WalletBackend`] trait so the rest of
//! the core never cares which one is live.

mod eip1193;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod walletconnect;

use alloy_primitives::{Address, Bytes, TxHash, U256};
use async_trait::async_trait;
use cs_api_types::{BackendKind, DashboardError};
use serde::Serialize;
use tokio::sync::broadcast;

pub use eip1193::{Eip1193Provider, InjectedBackend, ProviderRpcError, classify, codes};
pub use walletconnect::{AppMetadata, RelayClient, RelayConfig, WalletConnectBackend};

pub type BackendResult<T> = Result<T, DashboardError>;

/// Transaction or call object in the shape `eth_call` / `eth_sendTransaction`
/// expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    pub data: Bytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
}

impl TxRequest {
    pub fn call(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            from: None,
            to,
            data: data.into(),
            value: None,
        }
    }

    pub fn from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    pub fn value(mut self, value: U256) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub success: bool,
    pub block_number: Option<u64>,
}

/// Notifications a wallet pushes without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
    Disconnect { code: i64, message: String },
}

#[async_trait]
pub trait WalletBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Prompts the user for account access. May wait on a human.
    async fn request_accounts(&self) -> BackendResult<Vec<Address>>;
    async fn chain_id(&self) -> BackendResult<u64>;
    async fn call(&self, tx: &TxRequest) -> BackendResult<Bytes>;
    /// Asks the wallet to sign and broadcast. May wait on a human.
    async fn send_transaction(&self, tx: &TxRequest) -> BackendResult<TxHash>;
    async fn transaction_receipt(&self, tx_hash: TxHash) -> BackendResult<Option<TxReceipt>>;
    fn subscribe(&self) -> broadcast::Receiver<BackendEvent>;
    /// Ends the session on the wallet side where the backend supports it.
    async fn disconnect(&self) -> BackendResult<()>;
}
