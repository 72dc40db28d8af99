use alloy_primitives::{Address, U64};
use async_trait::async_trait;
use cs_wallet_backend::{BackendEvent, Eip1193Provider, ProviderRpcError, codes};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const DEFAULT_RPC_URL: &str = "http://localhost:8545";

/// JSON-RPC 2.0 over HTTP, presented as an injected provider.
///
/// Reads `CS_RPC_URL` from environment at construction time
/// (default: `http://localhost:8545`). The endpoint is expected to hold the
/// signing keys itself (a local node, a signer proxy, or a wallet bridge).
pub struct HttpProvider {
    endpoint: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    events: broadcast::Sender<BackendEvent>,
}

impl Default for HttpProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HttpProvider {
    pub fn new(endpoint: Option<String>) -> Self {
        let endpoint = endpoint
            .or_else(|| std::env::var("CS_RPC_URL").ok())
            .unwrap_or_else(|| DEFAULT_RPC_URL.to_string());
        let (events, _) = broadcast::channel(32);
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            events,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// HTTP cannot push notifications, so account and chain changes are
    /// detected by polling and re-emitted as provider events.
    pub fn spawn_watcher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let provider = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_chain: Option<u64> = None;
            let mut last_accounts: Option<Vec<Address>> = None;
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;

                match provider.request("eth_chainId", json!([])).await {
                    Ok(value) => {
                        if let Ok(id) = serde_json::from_value::<U64>(value) {
                            let id = id.to::<u64>();
                            if last_chain.is_some_and(|prev| prev != id) {
                                let _ = provider.events.send(BackendEvent::ChainChanged(id));
                            }
                            last_chain = Some(id);
                        }
                    }
                    Err(err) if err.code == codes::TRANSPORT_FAILURE => {
                        if last_chain.take().is_some() {
                            let _ = provider.events.send(BackendEvent::Disconnect {
                                code: codes::DISCONNECTED,
                                message: err.message.clone(),
                            });
                        }
                        last_accounts = None;
                        continue;
                    }
                    Err(err) => debug!("chain poll failed: {}", err),
                }

                if let Ok(value) = provider.request("eth_accounts", json!([])).await {
                    if let Ok(accounts) = serde_json::from_value::<Vec<Address>>(value) {
                        if last_accounts.as_ref().is_some_and(|prev| prev != &accounts) {
                            let _ = provider
                                .events
                                .send(BackendEvent::AccountsChanged(accounts.clone()));
                        }
                        last_accounts = Some(accounts);
                    }
                }
            }
        })
    }
}

// ── JSON-RPC envelope ─────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value, ProviderRpcError> {
        if let Some(err) = self.error {
            let mut out = ProviderRpcError::new(err.code, err.message);
            out.data = err.data;
            return Err(out);
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Eip1193Provider for HttpProvider {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderRpcError> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderRpcError::transport(format!("{method} transport: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("rpc {} HTTP {}: {}", method, status, text);
            return Err(ProviderRpcError::transport(format!("{method} HTTP {status}: {text}")));
        }

        let envelope: RpcResponse = response
            .json()
            .await
            .map_err(|err| ProviderRpcError::new(codes::INTERNAL, format!("{method} parse: {err}")))?;

        envelope.into_result()
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}
