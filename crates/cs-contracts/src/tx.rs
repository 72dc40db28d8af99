use alloy_primitives::TxHash;
use cs_api_types::DashboardError;
use cs_wallet_backend::{TxReceipt, WalletBackend};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How receipts are polled after a transaction is broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    pub initial_poll: Duration,
    pub max_poll: Duration,
    pub timeout: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            initial_poll: Duration::from_secs(1),
            max_poll: Duration::from_secs(8),
            timeout: Duration::from_secs(180),
        }
    }
}

/// A broadcast transaction that has not been confirmed yet.
pub struct TransactionHandle {
    tx_hash: TxHash,
    label: &'static str,
    backend: Arc<dyn WalletBackend>,
    policy: ConfirmationPolicy,
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("tx_hash", &self.tx_hash)
            .field("label", &self.label)
            .finish()
    }
}

impl TransactionHandle {
    pub(crate) fn new(
        tx_hash: TxHash,
        label: &'static str,
        backend: Arc<dyn WalletBackend>,
        policy: ConfirmationPolicy,
    ) -> Self {
        Self {
            tx_hash,
            label,
            backend,
            policy,
        }
    }

    pub fn tx_hash(&self) -> TxHash {
        self.tx_hash
    }

    /// Contract function this transaction calls.
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub async fn await_confirmation(&self) -> Result<TxReceipt, DashboardError> {
        let poll = async {
            let mut delay = self.policy.initial_poll;
            loop {
                match self.backend.transaction_receipt(self.tx_hash).await {
                    Ok(Some(receipt)) if receipt.success => {
                        info!("{} {} confirmed in block {:?}", self.label, self.tx_hash, receipt.block_number);
                        return Ok(receipt);
                    }
                    Ok(Some(_)) => {
                        warn!("{} {} reverted", self.label, self.tx_hash);
                        return Err(DashboardError::TransactionReverted(format!(
                            "{} transaction {} failed",
                            self.label, self.tx_hash
                        )));
                    }
                    Ok(None) => debug!("{} {} not mined yet", self.label, self.tx_hash),
                    // Node hiccups do not end the wait; the timeout does.
                    Err(DashboardError::UnknownBackendError(message)) => {
                        warn!("receipt lookup for {} {} failed: {}", self.label, self.tx_hash, message);
                    }
                    Err(err) => return Err(err),
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.policy.max_poll);
            }
        };

        tokio::time::timeout(self.policy.timeout, poll)
            .await
            .map_err(|_| {
                warn!("{} {} unconfirmed after {:?}", self.label, self.tx_hash, self.policy.timeout);
                DashboardError::Timeout
            })?
    }
}
