use anyhow::{Result, ensure};
use cs_contracts::{ConfirmationPolicy, ContractAddresses};
use cs_session::SessionConfig;
use cs_wallet_backend::{AppMetadata, RelayConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff for re-reading holdings after a confirmed write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 6,
            initial_delay_ms: 1_000,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WalletConnectSettings {
    /// Relay project id. Without one the WalletConnect backend is not offered.
    pub project_id: Option<String>,
    pub metadata: AppMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DashboardConfig {
    pub contracts: ContractAddresses,
    pub expected_chain_id: u64,
    pub refresh_interval_secs: u64,
    pub post_action_retry: RetryPolicy,
    /// The stablecoin approval covers this many purchases of the same size.
    pub approval_multiplier: u64,
    pub prompt_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
    /// Fractional digits shown for amounts.
    pub display_precision: u8,
    pub walletconnect: WalletConnectSettings,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            contracts: ContractAddresses::default(),
            expected_chain_id: 56,
            refresh_interval_secs: 30,
            post_action_retry: RetryPolicy::default(),
            approval_multiplier: 1_000,
            prompt_timeout_secs: 120,
            confirmation_timeout_secs: 180,
            display_precision: 4,
            walletconnect: WalletConnectSettings::default(),
        }
    }
}

impl DashboardConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.approval_multiplier >= 2,
            "approval multiplier must be at least 2, got {}",
            self.approval_multiplier
        );
        ensure!(self.refresh_interval_secs > 0, "refresh interval must be positive");
        ensure!(
            self.post_action_retry.attempts > 0,
            "post-action retry needs at least one attempt"
        );
        ensure!(
            self.post_action_retry.initial_delay_ms <= self.post_action_retry.max_delay_ms,
            "post-action retry initial delay exceeds its cap"
        );
        ensure!(
            self.contracts.sale != self.contracts.stablecoin,
            "sale and stablecoin contracts must differ"
        );
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            expected_chain_id: self.expected_chain_id,
            prompt_timeout: Duration::from_secs(self.prompt_timeout_secs),
        }
    }

    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            timeout: Duration::from_secs(self.confirmation_timeout_secs),
            ..ConfirmationPolicy::default()
        }
    }

    pub fn relay_config(&self) -> Option<RelayConfig> {
        let project_id = self.walletconnect.project_id.as_deref()?;
        let mut relay = RelayConfig::new(project_id, self.expected_chain_id);
        relay.metadata = self.walletconnect.metadata.clone();
        Some(relay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let config = DashboardConfig::default();
        config.validate()?;
        assert_eq!(config.refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.session_config().expected_chain_id, 56);
        assert!(config.relay_config().is_none());
        Ok(())
    }

    #[test]
    fn multiplier_below_two_is_rejected() {
        let config = DashboardConfig {
            approval_multiplier: 1,
            ..DashboardConfig::default()
        };
        let err = config.validate().expect_err("multiplier of 1 is invalid");
        assert!(err.to_string().contains("approval multiplier"));
    }

    #[test]
    fn partial_json_keeps_defaults() -> std::result::Result<(), serde_json::Error> {
        let config: DashboardConfig =
            serde_json::from_str(r#"{"refresh_interval_secs": 10, "walletconnect": {"project_id": "abc", "metadata": {"name": "CleanSpark", "description": "d", "url": "https://example.org", "icons": []}}}"#)?;
        assert_eq!(config.refresh_interval_secs, 10);
        assert_eq!(config.approval_multiplier, 1_000);
        assert_eq!(config.relay_config().map(|r| r.chains), Some(vec![56]));
        Ok(())
    }
}
