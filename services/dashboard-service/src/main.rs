use alloy_primitives::U256;
use axum::{
    Json, Router,
    extract::{Query, RawQuery, State},
    http::StatusCode,
    routing::{get, post},
};
use cs_api_types::{
    ActionResponse, BuyRequest, ConnectRequest, DashboardError, DashboardResponse, DashboardSnapshot,
    ReferralResponse, SellRequest, SessionSnapshot, SessionStatus,
};
use cs_contracts::amount::{DECIMALS, format_units, parse_units, short_address, unit};
use cs_contracts::simulator::SimulatedChain;
use cs_dashboard_core::{ActionOutcome, ApprovalPolicy, Dashboard, DashboardConfig};
use cs_rpc_http::HttpProvider;
use cs_session::{BackendFactory, StaticBackends};
use cs_storage::{InMemoryReferralStore, ReferralStore, RocksDbReferralStore};
use cs_wallet_backend::{InjectedBackend, WalletConnectBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

mod events;
mod settings;

use events::{EventLog, EventRecord};
use settings::ServiceSettings;

/// Account the simulated wallet hands out.
const DEMO_ACCOUNT: alloy_primitives::Address =
    alloy_primitives::address!("0x00000000000000000000000000000000000d3e70");
const PROVIDER_WATCH_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, Serialize)]
struct HealthResponse {
    service: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

#[derive(Clone)]
struct AppState {
    dashboard: Arc<Dashboard>,
    events: Arc<EventLog>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = ServiceSettings::from_env()?;
    let backends = if settings.simulate {
        info!("serving against a simulated chain");
        simulated_backends(&settings.dashboard)
    } else {
        rpc_backends(&settings)
    };
    let store: Arc<dyn ReferralStore> = match &settings.referral_db_path {
        Some(path) => Arc::new(RocksDbReferralStore::open_default(path)?),
        None => Arc::new(InMemoryReferralStore::default()),
    };

    let state = build_state(settings.dashboard.clone(), backends, store, &settings.profile).await?;
    let app = app(state);

    info!("dashboard-service listening on {}", settings.bind_addr);
    let listener = tokio::net::TcpListener::bind(settings.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn build_state(
    config: DashboardConfig,
    backends: Arc<dyn BackendFactory>,
    store: Arc<dyn ReferralStore>,
    profile: &str,
) -> anyhow::Result<AppState> {
    let dashboard = Arc::new(Dashboard::new(config, backends, store, profile).await?);
    let events = Arc::new(EventLog::new(events::DEFAULT_CAPACITY));
    dashboard.register_observer(events.clone());
    dashboard.start();
    Ok(AppState { dashboard, events })
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/session", get(session))
        .route("/session/connect", post(session_connect))
        .route("/session/disconnect", post(session_disconnect))
        .route("/dashboard", get(dashboard))
        .route("/dashboard/refresh", post(dashboard_refresh))
        .route("/actions/buy", post(action_buy))
        .route("/actions/sell", post(action_sell))
        .route("/actions/claim", post(action_claim))
        .route("/referral", get(referral))
        .route("/events", get(recent_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn rpc_backends(settings: &ServiceSettings) -> Arc<dyn BackendFactory> {
    let provider = Arc::new(HttpProvider::new(settings.rpc_url.clone()));
    info!("wallet requests go to {}", provider.endpoint());
    // The watcher lives as long as the process.
    let _watcher = provider.spawn_watcher(PROVIDER_WATCH_INTERVAL);
    if settings.dashboard.relay_config().is_some() {
        warn!("no WalletConnect relay client in this service; only the extension backend is offered");
    }
    Arc::new(StaticBackends::default().with_extension(Arc::new(InjectedBackend::new(provider))))
}

fn simulated_backends(config: &DashboardConfig) -> Arc<dyn BackendFactory> {
    let chain = Arc::new(SimulatedChain::new(config.contracts, config.expected_chain_id));
    chain.set_wallet_accounts(vec![DEMO_ACCOUNT]);
    chain.fund_stablecoin(DEMO_ACCOUNT, U256::from(1_000) * unit(DECIMALS));

    let mut backends = chain.backends();
    if let Some(relay) = config.relay_config() {
        backends = backends.with_wallet_connect(Arc::new(WalletConnectBackend::new(chain.clone(), relay)));
    }
    Arc::new(backends)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        service: "dashboard-service",
        status: "ok",
    })
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        service: "dashboard-service",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn session(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.dashboard.session())
}

async fn session_connect(
    State(state): State<AppState>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult<SessionSnapshot> {
    let session = state
        .dashboard
        .connect(request.backend)
        .await
        .map_err(dashboard_error)?;
    Ok(Json(session))
}

async fn session_disconnect(State(state): State<AppState>) -> Json<SessionSnapshot> {
    Json(state.dashboard.disconnect().await)
}

async fn dashboard(State(state): State<AppState>) -> Json<DashboardResponse> {
    let precision = state.dashboard.config().display_precision;
    Json(dashboard_response(state.dashboard.snapshot(), precision))
}

async fn dashboard_refresh(State(state): State<AppState>) -> ApiResult<DashboardResponse> {
    let snapshot = state.dashboard.refresh().await.map_err(dashboard_error)?;
    let precision = state.dashboard.config().display_precision;
    Ok(Json(dashboard_response(Some(snapshot), precision)))
}

async fn action_buy(
    State(state): State<AppState>,
    Json(request): Json<BuyRequest>,
) -> ApiResult<ActionResponse> {
    let amount = parse_units(&request.amount, DECIMALS).map_err(dashboard_error)?;
    let prompt = if request.approve {
        ApprovalPolicy::Granted
    } else {
        ApprovalPolicy::Withheld
    };
    let outcome = state
        .dashboard
        .buy(amount, request.method, &prompt)
        .await
        .map_err(dashboard_error)?;
    Ok(Json(action_response(outcome)))
}

async fn action_sell(
    State(state): State<AppState>,
    Json(request): Json<SellRequest>,
) -> ApiResult<ActionResponse> {
    let amount = parse_units(&request.amount, DECIMALS).map_err(dashboard_error)?;
    let outcome = state.dashboard.sell(amount).await.map_err(dashboard_error)?;
    Ok(Json(action_response(outcome)))
}

async fn action_claim(State(state): State<AppState>) -> ApiResult<ActionResponse> {
    let outcome = state.dashboard.claim().await.map_err(dashboard_error)?;
    Ok(Json(action_response(outcome)))
}

async fn referral(
    State(state): State<AppState>,
    RawQuery(query): RawQuery,
) -> ApiResult<ReferralResponse> {
    let referrer = match query {
        Some(query) => state
            .dashboard
            .seed_referral(&query)
            .await
            .map_err(internal_error)?,
        None => state.dashboard.referrals().current().await,
    };

    let info = if state.dashboard.session().status == SessionStatus::Connected {
        Some(state.dashboard.referral_info().await.map_err(dashboard_error)?)
    } else {
        None
    };

    Ok(Json(ReferralResponse { referrer, info }))
}

async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<EventRecord>> {
    let limit = query.limit.unwrap_or(50);
    Json(state.events.recent(limit))
}

fn dashboard_response(snapshot: Option<DashboardSnapshot>, precision: u8) -> DashboardResponse {
    let Some(snapshot) = snapshot else {
        return DashboardResponse {
            address: None,
            short_address: None,
            balance: None,
            pending_rewards: None,
            locked_amount: None,
            lock_status: None,
            reward_status: None,
            fetched_at_epoch_ms: None,
        };
    };

    let holdings = &snapshot.holdings;
    let lock_status = match (holdings.is_locked, holdings.lock_end) {
        (true, Some(end)) => format!("Locked until {end}"),
        (true, None) => "Locked".to_owned(),
        (false, _) => "All unlocked".to_owned(),
    };

    DashboardResponse {
        address: Some(snapshot.address.to_checksum(None)),
        short_address: Some(short_address(&snapshot.address)),
        balance: Some(format_units(holdings.balance, DECIMALS, precision)),
        pending_rewards: Some(format_units(holdings.pending_rewards, DECIMALS, precision)),
        locked_amount: Some(format_units(holdings.locked_amount, DECIMALS, precision)),
        lock_status: Some(lock_status),
        reward_status: Some(snapshot.reward_status),
        fetched_at_epoch_ms: Some(snapshot.fetched_at_epoch_ms),
    }
}

fn action_response(outcome: ActionOutcome) -> ActionResponse {
    ActionResponse {
        action_id: outcome.action_id,
        kind: outcome.kind,
        tx_hash: outcome.tx_hash,
        approval_tx_hash: outcome.approval_tx_hash,
        referrer: outcome.referrer,
        dashboard_refreshed: outcome.dashboard_refreshed,
    }
}

fn dashboard_error(err: DashboardError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        DashboardError::NoProviderFound | DashboardError::RelayUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DashboardError::UserRejected => StatusCode::FORBIDDEN,
        DashboardError::WrongChain | DashboardError::NotConnected => StatusCode::CONFLICT,
        DashboardError::AllowanceInsufficient => StatusCode::PRECONDITION_REQUIRED,
        DashboardError::InsufficientFunds | DashboardError::TransactionReverted(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        DashboardError::InvalidAmount(_) | DashboardError::AmountOverflow => StatusCode::BAD_REQUEST,
        DashboardError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        DashboardError::UnknownBackendError(_) => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: Some(err.code()),
        }),
    )
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: err.to_string(),
            code: None,
        }),
    )
}

fn epoch_ms() -> anyhow::Result<u128> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, Response};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    const HOLDER: alloy_primitives::Address =
        alloy_primitives::address!("0x00000000000000000000000000000000000000f1");
    const REFERRER: &str = "0x00000000000000000000000000000000000000f2";

    async fn test_app() -> anyhow::Result<(Router, Arc<SimulatedChain>)> {
        let config = DashboardConfig::default();
        let chain = Arc::new(SimulatedChain::new(config.contracts, config.expected_chain_id));
        chain.set_wallet_accounts(vec![HOLDER]);
        let state = build_state(
            config,
            Arc::new(chain.backends()),
            Arc::new(InMemoryReferralStore::default()),
            "default",
        )
        .await?;
        Ok((app(state), chain))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> anyhow::Result<(StatusCode, Value)> {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => request.body(Body::empty())?,
        };
        let response: Response<Body> = app.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        Ok((status, value))
    }

    #[tokio::test]
    async fn health_and_idle_dashboard() -> anyhow::Result<()> {
        let (app, _chain) = test_app().await?;

        let (status, body) = call(&app, "GET", "/health", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(&app, "GET", "/dashboard", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["address"], Value::Null);

        let (status, body) = call(&app, "POST", "/actions/claim", None).await?;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "not_connected");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn buy_requires_consent_before_approval() -> anyhow::Result<()> {
        let (app, chain) = test_app().await?;
        chain.fund_stablecoin(HOLDER, U256::from(100) * unit(DECIMALS));

        let (status, body) =
            call(&app, "POST", "/session/connect", Some(json!({"backend": "extension"}))).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "connected");

        let (status, body) = call(&app, "POST", "/dashboard/refresh", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], "0.0000");
        assert_eq!(body["lock_status"], "All unlocked");

        let (status, body) = call(
            &app,
            "POST",
            "/actions/buy",
            Some(json!({"amount": "12.5", "method": "stablecoin"})),
        )
        .await?;
        assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(body["code"], "allowance_insufficient");
        assert!(chain.sent().is_empty());

        let (status, body) = call(
            &app,
            "POST",
            "/actions/buy",
            Some(json!({"amount": "12.5", "method": "stablecoin", "approve": true})),
        )
        .await?;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body["approval_tx_hash"], Value::Null);
        assert_eq!(body["dashboard_refreshed"], true);
        assert_eq!(chain.sent(), vec!["approve", "buyTokens"]);

        let (_, body) = call(&app, "GET", "/dashboard", None).await?;
        assert_eq!(body["balance"], "12.5000");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_amount_is_a_bad_request() -> anyhow::Result<()> {
        let (app, _chain) = test_app().await?;
        call(&app, "POST", "/session/connect", Some(json!({"backend": "extension"}))).await?;

        let (status, body) =
            call(&app, "POST", "/actions/sell", Some(json!({"amount": "twelve"}))).await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_amount");
        Ok(())
    }

    #[tokio::test]
    async fn walletconnect_without_relay_is_unavailable() -> anyhow::Result<()> {
        let (app, chain) = test_app().await?;
        chain.set_relay_down(true);

        let (status, body) =
            call(&app, "POST", "/session/connect", Some(json!({"backend": "wallet_connect"}))).await?;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "relay_unavailable");

        let (_, body) = call(&app, "GET", "/session", None).await?;
        assert_eq!(body["status"], "disconnected");
        Ok(())
    }

    #[tokio::test]
    async fn referral_is_seeded_and_events_are_recorded() -> anyhow::Result<()> {
        let (app, _chain) = test_app().await?;

        let (status, body) = call(&app, "GET", &format!("/referral?ref={REFERRER}"), None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["referrer"].as_str().map(str::to_lowercase), Some(REFERRER.to_owned()));
        assert_eq!(body["info"], Value::Null);

        let (_, body) = call(&app, "GET", "/referral?ref=0xnope", None).await?;
        assert_eq!(body["referrer"].as_str().map(str::to_lowercase), Some(REFERRER.to_owned()));

        call(&app, "POST", "/session/connect", Some(json!({"backend": "extension"}))).await?;
        let (status, body) = call(&app, "GET", "/referral", None).await?;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["info"]["referrer"], Value::Null);

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        let (_, events) = call(&app, "GET", "/events?limit=2", None).await?;
        let events = events.as_array().cloned().unwrap_or_default();
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| e["type"] == "session" || e["type"] == "holdings"));
        Ok(())
    }
}
