//! Scripted provider for exercising the backends without a wallet.

use alloy_primitives::Address;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::{BackendEvent, Eip1193Provider, ProviderRpcError, RelayClient, RelayConfig, codes};

type Scripted = Result<Value, ProviderRpcError>;

/// Answers each method from a queue of scripted responses. The last response
/// queued for a method is repeated once the queue runs dry.
pub struct MockProvider {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    sticky: Mutex<HashMap<String, Scripted>>,
    requests: Mutex<Vec<(String, Value)>>,
    relay_init: Mutex<Option<ProviderRpcError>>,
    relay_config: Mutex<Option<RelayConfig>>,
    relay_inits: Mutex<usize>,
    relay_disconnects: Mutex<usize>,
    relay_accounts: Mutex<Vec<Address>>,
    events: broadcast::Sender<BackendEvent>,
}

impl Default for MockProvider {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            responses: Mutex::new(HashMap::new()),
            sticky: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            relay_init: Mutex::new(None),
            relay_config: Mutex::new(None),
            relay_inits: Mutex::new(0),
            relay_disconnects: Mutex::new(0),
            relay_accounts: Mutex::new(Vec::new()),
            events,
        }
    }
}

impl MockProvider {
    pub fn respond(&self, method: &str, response: Scripted) {
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        responses
            .entry(method.to_owned())
            .or_default()
            .push_back(response);
    }

    pub fn requests_for(&self, method: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    pub fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    pub fn fail_relay_init(&self, err: ProviderRpcError) {
        *self.relay_init.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
    }

    pub fn clear_relay_failure(&self) {
        *self.relay_init.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// How many times `init` reached the relay.
    pub fn relay_inits(&self) -> usize {
        *self.relay_inits.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn relay_config(&self) -> Option<RelayConfig> {
        self.relay_config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn relay_disconnects(&self) -> usize {
        *self.relay_disconnects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Eip1193Provider for MockProvider {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ProviderRpcError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((method.to_owned(), params));

        let next = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(method)
            .and_then(VecDeque::pop_front);

        let mut sticky = self.sticky.lock().unwrap_or_else(|e| e.into_inner());
        match next {
            Some(response) => {
                sticky.insert(method.to_owned(), response.clone());
                response
            }
            None => sticky.get(method).cloned().unwrap_or_else(|| {
                Err(ProviderRpcError::new(
                    codes::UNSUPPORTED_METHOD,
                    format!("no scripted response for {method}"),
                ))
            }),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl RelayClient for MockProvider {
    async fn init(&self, config: &RelayConfig) -> Result<(), ProviderRpcError> {
        // Suspend once, like a socket round trip.
        tokio::task::yield_now().await;
        *self.relay_inits.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        if let Some(err) = self.relay_init.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Err(err);
        }
        *self.relay_config.lock().unwrap_or_else(|e| e.into_inner()) = Some(config.clone());
        Ok(())
    }

    async fn enable(&self) -> Result<Vec<Address>, ProviderRpcError> {
        let value = self.request("eth_requestAccounts", Value::Array(Vec::new())).await?;
        let accounts: Vec<Address> = serde_json::from_value(value)
            .map_err(|err| ProviderRpcError::new(codes::INTERNAL, err.to_string()))?;
        *self.relay_accounts.lock().unwrap_or_else(|e| e.into_inner()) = accounts.clone();
        Ok(accounts)
    }

    fn accounts(&self) -> Vec<Address> {
        self.relay_accounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn disconnect(&self) -> Result<(), ProviderRpcError> {
        *self.relay_disconnects.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        let _ = self.events.send(BackendEvent::Disconnect {
            code: codes::DISCONNECTED,
            message: "session ended".to_owned(),
        });
        Ok(())
    }
}
