use alloy_primitives::{Address, Bytes, TxHash};
use async_trait::async_trait;
use cs_api_types::{BackendKind, DashboardError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OnceCell, broadcast};
use tracing::{info, warn};

use crate::eip1193::{self, Eip1193Provider, ProviderRpcError, classify};
use crate::{BackendEvent, BackendResult, TxReceipt, TxRequest, WalletBackend};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppMetadata {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "CleanSpark".to_owned(),
            description: "CleanSpark Mining Platform".to_owned(),
            url: "http://localhost".to_owned(),
            icons: Vec::new(),
        }
    }
}

/// Pairing parameters handed to the relay client on `init`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    pub project_id: String,
    pub chains: Vec<u64>,
    pub show_qr_modal: bool,
    pub metadata: AppMetadata,
}

impl RelayConfig {
    pub fn new(project_id: impl Into<String>, chain_id: u64) -> Self {
        Self {
            project_id: project_id.into(),
            chains: vec![chain_id],
            show_qr_modal: true,
            metadata: AppMetadata::default(),
        }
    }
}

/// A WalletConnect-style relay session. The pairing and session protocol
/// live in the client library; this is only the surface the dashboard uses.
#[async_trait]
pub trait RelayClient: Eip1193Provider {
    async fn init(&self, config: &RelayConfig) -> Result<(), ProviderRpcError>;
    /// Opens the pairing flow (QR code or deep link) and waits for approval.
    async fn enable(&self) -> Result<Vec<Address>, ProviderRpcError>;
    fn accounts(&self) -> Vec<Address>;
    async fn disconnect(&self) -> Result<(), ProviderRpcError>;
}

pub struct WalletConnectBackend<R> {
    relay: Arc<R>,
    config: RelayConfig,
    initialized: OnceCell<()>,
}

impl<R: RelayClient> WalletConnectBackend<R> {
    pub fn new(relay: Arc<R>, config: RelayConfig) -> Self {
        Self {
            relay,
            config,
            initialized: OnceCell::new(),
        }
    }

    /// Runs `init` once, even when connects race. A failed init is retried
    /// by the next caller.
    async fn ensure_initialized(&self) -> BackendResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                self.relay.init(&self.config).await.map_err(|err| {
                    warn!("walletconnect relay init failed: {}", err);
                    match classify(&err) {
                        DashboardError::UserRejected => DashboardError::UserRejected,
                        _ => DashboardError::RelayUnavailable,
                    }
                })
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<R: RelayClient + 'static> WalletBackend for WalletConnectBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::WalletConnect
    }

    async fn request_accounts(&self) -> BackendResult<Vec<Address>> {
        self.ensure_initialized().await?;
        let mut accounts = self.relay.enable().await.map_err(|err| classify(&err))?;
        if accounts.is_empty() {
            accounts = self.relay.accounts();
        }
        info!("walletconnect session approved with {} account(s)", accounts.len());
        Ok(accounts)
    }

    async fn chain_id(&self) -> BackendResult<u64> {
        eip1193::chain_id(self.relay.as_ref()).await
    }

    async fn call(&self, tx: &TxRequest) -> BackendResult<Bytes> {
        eip1193::call(self.relay.as_ref(), tx).await
    }

    async fn send_transaction(&self, tx: &TxRequest) -> BackendResult<TxHash> {
        eip1193::send_transaction(self.relay.as_ref(), tx).await
    }

    async fn transaction_receipt(&self, tx_hash: TxHash) -> BackendResult<Option<TxReceipt>> {
        eip1193::transaction_receipt(self.relay.as_ref(), tx_hash).await
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.relay.subscribe()
    }

    async fn disconnect(&self) -> BackendResult<()> {
        RelayClient::disconnect(self.relay.as_ref())
            .await
            .map_err(|err| classify(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codes;
    use crate::mock::MockProvider;
    use alloy_primitives::address;
    use serde_json::json;

    #[tokio::test]
    async fn relay_outage_is_reported_as_relay_unavailable() {
        let relay = Arc::new(MockProvider::default());
        relay.fail_relay_init(ProviderRpcError::new(codes::INTERNAL, "socket stalled"));
        let backend = WalletConnectBackend::new(relay, RelayConfig::new("project", 56));

        assert_eq!(
            backend.request_accounts().await,
            Err(DashboardError::RelayUnavailable)
        );
    }

    #[tokio::test]
    async fn pairing_uses_config_and_classifies_rejection() -> Result<(), DashboardError> {
        let relay = Arc::new(MockProvider::default());
        relay.respond(
            "eth_requestAccounts",
            Err(ProviderRpcError::new(codes::USER_REJECTED, "User rejected.")),
        );
        let backend = WalletConnectBackend::new(relay.clone(), RelayConfig::new("project", 56));
        assert_eq!(backend.request_accounts().await, Err(DashboardError::UserRejected));
        assert_eq!(relay.relay_config().map(|c| c.chains), Some(vec![56]));

        let account = address!("0x00000000000000000000000000000000000000c3");
        relay.respond("eth_requestAccounts", Ok(json!([account])));
        assert_eq!(backend.request_accounts().await?, vec![account]);
        assert_eq!(relay.accounts(), vec![account]);

        backend.disconnect().await?;
        assert_eq!(relay.relay_disconnects(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn racing_connects_initialise_the_relay_once() -> Result<(), DashboardError> {
        let relay = Arc::new(MockProvider::default());
        let account = address!("0x00000000000000000000000000000000000000c4");
        relay.respond("eth_requestAccounts", Ok(json!([account])));
        let backend = WalletConnectBackend::new(relay.clone(), RelayConfig::new("project", 56));

        let (a, b) = tokio::join!(backend.request_accounts(), backend.request_accounts());
        assert_eq!(a?, vec![account]);
        assert_eq!(b?, vec![account]);
        assert_eq!(relay.relay_inits(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_init_is_retried_on_the_next_connect() -> Result<(), DashboardError> {
        let relay = Arc::new(MockProvider::default());
        relay.fail_relay_init(ProviderRpcError::new(codes::INTERNAL, "socket stalled"));
        let backend = WalletConnectBackend::new(relay.clone(), RelayConfig::new("project", 56));
        assert_eq!(backend.request_accounts().await, Err(DashboardError::RelayUnavailable));

        relay.clear_relay_failure();
        let account = address!("0x00000000000000000000000000000000000000c5");
        relay.respond("eth_requestAccounts", Ok(json!([account])));
        assert_eq!(backend.request_accounts().await?, vec![account]);
        assert_eq!(relay.relay_inits(), 2);
        Ok(())
    }
}
