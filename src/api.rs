//! Operator HTTP API
//!
//! - GET  /health                              - Per-chain checkpoint, backlog and alerts (JSON)
//! - GET  /healthz                             - Liveness check
//! - GET  /readyz                              - Readiness (checkpoint store reachable)
//! - GET  /metrics                             - Prometheus metrics
//! - GET  /transfers?status=failed&limit=50    - List transfers
//! - GET  /transfers/{event_id}                - One transfer
//! - GET  /transfers/{chain}/nonce/{nonce}     - One transfer by source nonce (`?bridge=0x..`)
//! - GET  /transfers/account/{address}         - Transfer history of one account
//! - POST /admin/transfers/{event_id}/requeue  - FAILED -> PENDING (bearer token)
//! - POST /admin/checkpoints/{chain}           - Reset a checkpoint (bearer token)
//!
//! Admin routes are only mounted when an admin token is configured.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use alloy::primitives::Address;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{EngineError, EngineHandle, ReorgFlag};
use crate::store::StoreError;
use crate::types::{ChainName, EventId, TransferRecord, TransferStatus};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub engine: EngineHandle,
    pub admin_token: Option<Arc<str>>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("missing or invalid bearer token")]
    Unauthorized,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(_) => ApiError::Unavailable(e.to_string()),
            StoreError::InvalidTransition(_) | StoreError::Regression { .. } => {
                ApiError::Conflict(e.to_string())
            }
            StoreError::Corrupt(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(_) | EngineError::UnknownChain(_) => {
                ApiError::NotFound(e.to_string())
            }
            EngineError::Transition(_) => ApiError::Conflict(e.to_string()),
            EngineError::Store(inner) => inner.into(),
            EngineError::SameChain(_)
            | EngineError::DuplicateSource(_)
            | EngineError::NoBridges(_)
            | EngineError::UnmappedBridge { .. } => ApiError::Internal(e.to_string()),
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub store_available: bool,
    pub per_chain: BTreeMap<ChainName, ChainStatus>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChainStatus {
    pub last_processed_block: Option<u64>,
    pub last_scanned_block: Option<u64>,
    pub pending_count: Option<usize>,
    pub reorg_flagged: bool,
    pub reorg: Option<ReorgFlag>,
    pub liveness_alert: bool,
    pub consecutive_failures: u32,
}

async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    let engine = &state.engine;
    let store = engine.store();

    let mut per_chain: BTreeMap<ChainName, ChainStatus> = engine
        .chains()
        .into_iter()
        .map(|chain| (chain, ChainStatus::default()))
        .collect();

    for (chain, health) in engine.health().snapshot() {
        let status = per_chain.entry(chain).or_default();
        status.last_scanned_block = health.last_scanned_block;
        status.reorg_flagged = health.reorg.is_some();
        status.reorg = health.reorg;
        status.liveness_alert = health.liveness_alert;
        status.consecutive_failures = health.consecutive_failures;
    }

    let mut store_available = engine.store_available();
    match store.checkpoints().await {
        Ok(checkpoints) => {
            for checkpoint in checkpoints {
                per_chain.entry(checkpoint.chain).or_default().last_processed_block =
                    Some(checkpoint.last_processed_block);
            }
        }
        Err(_) => store_available = false,
    }
    match store.list_pending().await {
        Ok(pending) => {
            for status in per_chain.values_mut() {
                status.pending_count = Some(0);
            }
            for record in pending {
                let status = per_chain.entry(record.source_chain().clone()).or_default();
                status.pending_count = Some(status.pending_count.unwrap_or(0) + 1);
            }
        }
        Err(_) => store_available = false,
    }

    let degraded = !store_available
        || per_chain
            .values()
            .any(|c| c.reorg_flagged || c.liveness_alert);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        uptime_seconds: engine.health().uptime().as_secs(),
        store_available,
        per_chain,
    })
}

/// Liveness check (always OK while the server runs)
async fn liveness() -> &'static str {
    "OK"
}

/// Readiness check: the engine fails closed without its store
async fn readiness(State(state): State<ApiState>) -> Response {
    match state.engine.store().ping().await {
        Ok(()) if state.engine.store_available() => "OK".into_response(),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY").into_response(),
    }
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

// ============================================================================
// Transfers
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn parse(&self) -> Result<(Option<TransferStatus>, usize), ApiError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<TransferStatus>)
            .transpose()
            .map_err(ApiError::BadRequest)?;
        let limit = self
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        Ok((status, limit))
    }
}

async fn list_transfers(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<TransferRecord>>, ApiError> {
    let (status, limit) = query.parse()?;
    let records = state.engine.store().list_transfers(status, limit).await?;
    Ok(Json(records))
}

async fn get_transfer(
    State(state): State<ApiState>,
    Path(event_id): Path<String>,
) -> Result<Json<TransferRecord>, ApiError> {
    let event_id = EventId::from(event_id);
    state
        .engine
        .store()
        .load_transfer(&event_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no transfer recorded for {}", event_id)))
}

#[derive(Debug, Default, Deserialize)]
pub struct NonceQuery {
    /// Source bridge contract, required when several bridges used the nonce
    pub bridge: Option<String>,
}

async fn get_transfer_by_nonce(
    State(state): State<ApiState>,
    Path((chain, nonce)): Path<(String, u64)>,
    Query(query): Query<NonceQuery>,
) -> Result<Json<TransferRecord>, ApiError> {
    let chain = parse_chain(&chain)?;
    let not_found = || ApiError::NotFound(format!("no transfer recorded for {} nonce {}", chain, nonce));

    if let Some(bridge) = query.bridge.as_deref() {
        let bridge = parse_address(bridge)?;
        return state
            .engine
            .store()
            .load_transfer_by_nonce(&chain, bridge, nonce)
            .await?
            .map(Json)
            .ok_or_else(not_found);
    }

    let mut records = state.engine.store().transfers_by_nonce(&chain, nonce).await?;
    match records.len() {
        0 => Err(not_found()),
        1 => Ok(Json(records.remove(0))),
        n => Err(ApiError::Conflict(format!(
            "{} bridges on {} used nonce {}, select one with ?bridge=",
            n, chain, nonce
        ))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AccountQuery {
    pub limit: Option<usize>,
}

async fn list_account_transfers(
    State(state): State<ApiState>,
    Path(address): Path<String>,
    Query(query): Query<AccountQuery>,
) -> Result<Json<Vec<TransferRecord>>, ApiError> {
    let account = parse_address(&address)?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let records = state.engine.store().list_by_account(account, limit).await?;
    Ok(Json(records))
}

// ============================================================================
// Admin
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub block: u64,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub chain: ChainName,
    pub block: u64,
}

async fn requeue_transfer(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(event_id): Path<String>,
) -> Result<Json<TransferRecord>, ApiError> {
    require_admin(&state, &headers)?;
    let record = state.engine.requeue(&EventId::from(event_id)).await?;
    Ok(Json(record))
}

async fn reset_checkpoint(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(chain): Path<String>,
    Json(request): Json<ResetRequest>,
) -> Result<Json<ResetResponse>, ApiError> {
    require_admin(&state, &headers)?;
    let chain = parse_chain(&chain)?;
    state.engine.reset_checkpoint(&chain, request.block).await?;
    Ok(Json(ResetResponse {
        chain,
        block: request.block,
    }))
}

fn require_admin(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::Unauthorized);
    };
    if bearer_matches(headers, expected) {
        Ok(())
    } else {
        warn!("Rejected admin request with missing or invalid token");
        Err(ApiError::Unauthorized)
    }
}

/// `Authorization: Bearer <token>` check without early exit on mismatch
pub fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    let Some(presented) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return false;
    };
    let (a, b) = (presented.trim().as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn parse_chain(raw: &str) -> Result<ChainName, ApiError> {
    raw.parse::<ChainName>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn parse_address(raw: &str) -> Result<Address, ApiError> {
    raw.parse::<Address>()
        .map_err(|e| ApiError::BadRequest(format!("invalid address {}: {}", raw, e)))
}

// ============================================================================
// Server
// ============================================================================

pub fn router(state: ApiState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .route("/transfers", get(list_transfers))
        .route("/transfers/{event_id}", get(get_transfer))
        .route("/transfers/{chain}/nonce/{nonce}", get(get_transfer_by_nonce))
        .route("/transfers/account/{address}", get(list_account_transfers));

    if state.admin_token.is_some() {
        app = app
            .route(
                "/admin/transfers/{event_id}/requeue",
                post(requeue_transfer),
            )
            .route("/admin/checkpoints/{chain}", post(reset_checkpoint));
    }

    app.with_state(state)
}

/// Start the HTTP server for status, health and admin routes
pub async fn start_server(bind_address: &str, port: u16, state: ApiState) -> eyre::Result<()> {
    let admin = state.admin_token.is_some();
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);
    info!("  /health    - Per-chain status (JSON)");
    info!("  /metrics   - Prometheus metrics");
    info!("  /transfers - Transfer lookup");
    if admin {
        info!("  /admin/*   - Operator actions (bearer token)");
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
