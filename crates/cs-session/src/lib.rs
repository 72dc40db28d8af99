//! Wallet session ownership.
//!
//! One [`SessionManager`] owns the connection to one wallet backend. Every
//! other component receives it explicitly and reads the session through it.

mod manager;

use alloy_primitives::Address;
use async_trait::async_trait;
use cs_api_types::{BackendKind, DashboardError, DisconnectReason, SessionSnapshot, SessionStatus};
use cs_wallet_backend::WalletBackend;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use manager::SessionManager;

/// Capability to submit transactions as the connected address. Only the
/// session manager hands these out.
#[derive(Clone)]
pub struct SigningHandle {
    address: Address,
    backend: Arc<dyn WalletBackend>,
}

impl SigningHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn backend(&self) -> &Arc<dyn WalletBackend> {
        &self.backend
    }
}

impl fmt::Debug for SigningHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningHandle")
            .field("address", &self.address)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Session {
    snapshot: SessionSnapshot,
    signer: Option<SigningHandle>,
}

impl Session {
    pub(crate) fn disconnected(epoch: u64, reason: Option<DisconnectReason>) -> Self {
        Self {
            snapshot: SessionSnapshot {
                epoch,
                last_disconnect: reason,
                ..SessionSnapshot::default()
            },
            signer: None,
        }
    }

    pub(crate) fn connecting(backend: BackendKind, epoch: u64) -> Self {
        Self {
            snapshot: SessionSnapshot {
                status: SessionStatus::Connecting,
                backend: Some(backend),
                epoch,
                ..SessionSnapshot::default()
            },
            signer: None,
        }
    }

    pub(crate) fn connected(
        address: Address,
        chain_id: u64,
        epoch: u64,
        backend: Arc<dyn WalletBackend>,
    ) -> Self {
        Self {
            snapshot: SessionSnapshot {
                status: SessionStatus::Connected,
                address: Some(address),
                backend: Some(backend.kind()),
                chain_id: Some(chain_id),
                epoch,
                last_disconnect: None,
            },
            signer: Some(SigningHandle { address, backend }),
        }
    }

    pub(crate) fn with_address(&self, address: Address) -> Self {
        let mut next = self.clone();
        next.snapshot.address = Some(address);
        if let Some(signer) = next.signer.as_mut() {
            signer.address = address;
        }
        next
    }

    pub(crate) fn with_chain(&self, chain_id: u64) -> Self {
        let mut next = self.clone();
        next.snapshot.chain_id = Some(chain_id);
        next
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.status
    }

    pub fn is_connected(&self) -> bool {
        self.snapshot.status == SessionStatus::Connected
    }

    pub fn address(&self) -> Option<Address> {
        self.snapshot.address
    }

    pub fn epoch(&self) -> u64 {
        self.snapshot.epoch
    }

    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn signer(&self) -> Option<&SigningHandle> {
        self.signer.as_ref()
    }

    /// The signing handle, or `NotConnected` unless the session is live.
    pub fn require_signer(&self) -> Result<&SigningHandle, DashboardError> {
        match (&self.signer, self.snapshot.status) {
            (Some(signer), SessionStatus::Connected) => Ok(signer),
            _ => Err(DashboardError::NotConnected),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub expected_chain_id: u64,
    /// Upper bound on how long a wallet prompt may stay unanswered.
    pub prompt_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expected_chain_id: 56,
            prompt_timeout: Duration::from_secs(120),
        }
    }
}

/// Produces the backend for a connect request. The presentation layer
/// decides which providers exist before the core is built.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    async fn open(&self, kind: BackendKind) -> Result<Arc<dyn WalletBackend>, DashboardError>;
}

#[derive(Default, Clone)]
pub struct StaticBackends {
    extension: Option<Arc<dyn WalletBackend>>,
    wallet_connect: Option<Arc<dyn WalletBackend>>,
}

impl StaticBackends {
    pub fn with_extension(mut self, backend: Arc<dyn WalletBackend>) -> Self {
        self.extension = Some(backend);
        self
    }

    pub fn with_wallet_connect(mut self, backend: Arc<dyn WalletBackend>) -> Self {
        self.wallet_connect = Some(backend);
        self
    }
}

#[async_trait]
impl BackendFactory for StaticBackends {
    async fn open(&self, kind: BackendKind) -> Result<Arc<dyn WalletBackend>, DashboardError> {
        match kind {
            BackendKind::Extension => self
                .extension
                .clone()
                .ok_or(DashboardError::NoProviderFound),
            BackendKind::WalletConnect => self
                .wallet_connect
                .clone()
                .ok_or(DashboardError::RelayUnavailable),
        }
    }
}
