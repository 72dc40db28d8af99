use alloy_primitives::Address;
use anyhow::{Context, Result};
use cs_dashboard_core::DashboardConfig;
use std::net::SocketAddr;
use std::str::FromStr;

pub(crate) const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub(crate) const DEFAULT_PROFILE: &str = "default";

/// Start-up settings read from `CS_*` environment variables.
#[derive(Debug, Clone)]
pub(crate) struct ServiceSettings {
    pub dashboard: DashboardConfig,
    pub rpc_url: Option<String>,
    pub profile: String,
    pub referral_db_path: Option<String>,
    pub bind_addr: SocketAddr,
    /// Serve against an in-process simulated chain instead of `rpc_url`.
    pub simulate: bool,
}

impl ServiceSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let mut dashboard = DashboardConfig::default();
        if let Some(chain_id) = parsed::<u64>(&var, "CS_CHAIN_ID")? {
            dashboard.expected_chain_id = chain_id;
        }
        if let Some(sale) = parsed::<Address>(&var, "CS_SALE_CONTRACT")? {
            dashboard.contracts.sale = sale;
        }
        if let Some(stablecoin) = parsed::<Address>(&var, "CS_STABLECOIN_CONTRACT")? {
            dashboard.contracts.stablecoin = stablecoin;
        }
        if let Some(secs) = parsed::<u64>(&var, "CS_REFRESH_INTERVAL_SECS")? {
            dashboard.refresh_interval_secs = secs;
        }
        if let Some(multiplier) = parsed::<u64>(&var, "CS_APPROVAL_MULTIPLIER")? {
            dashboard.approval_multiplier = multiplier;
        }
        dashboard.walletconnect.project_id = var("CS_WALLETCONNECT_PROJECT_ID");
        dashboard.validate()?;

        let bind_addr = var("CS_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_owned());
        let bind_addr = bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("CS_BIND_ADDR is not a socket address: {bind_addr}"))?;

        Ok(Self {
            dashboard,
            rpc_url: var("CS_RPC_URL"),
            profile: var("CS_PROFILE").unwrap_or_else(|| DEFAULT_PROFILE.to_owned()),
            referral_db_path: var("CS_REFERRAL_DB_PATH"),
            bind_addr,
            simulate: var("CS_SIMULATE").is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        })
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(key)
        .map(|raw| raw.parse::<T>().with_context(|| format!("invalid {key}: {raw}")))
        .transpose()
}
