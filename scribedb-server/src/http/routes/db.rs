//! Database reachability, tunnel ops, and a sample data route
//!
//! - GET  /api/db/health  - run the reachability gate
//! - GET  /api/db/proxy   - check or start the tunnel (`?check_only=true`)
//! - POST /api/db/proxy   - same, flag in query or JSON body
//! - GET  /api/db/status  - tunnel state and cached pools
//! - GET  /api/db/ping    - gate, then `SELECT 1`

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};

use scribedb_core::ConnectionStrategy;
use scribedb_pool::{PoolStats, QueryResult};
use scribedb_proxy::{ProxySnapshot, StartReport, StartStatus};

use crate::http::error::ApiError;
use crate::http::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ProxyRequest {
    #[serde(default)]
    pub check_only: bool,
}

#[derive(Debug, Serialize)]
pub struct ReachabilityResponse {
    pub reachable: bool,
    pub strategy: ConnectionStrategy,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ProxyResponse {
    Check { status: &'static str },
    Start(StartReport),
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub port: u16,
    #[serde(flatten)]
    pub stats: PoolStats,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub strategy: ConnectionStrategy,
    pub proxy: Option<ProxySnapshot>,
    pub pools: Vec<PoolStatus>,
}

/// GET /api/db/health
async fn db_health(State(state): State<Arc<AppState>>) -> Json<ReachabilityResponse> {
    let reachable = state.gate.ensure_database_reachable().await;
    Json(ReachabilityResponse {
        reachable,
        strategy: state.gate.strategy(),
    })
}

/// GET /api/db/proxy
async fn proxy_get(
    State(state): State<Arc<AppState>>,
    Query(req): Query<ProxyRequest>,
) -> Json<ProxyResponse> {
    Json(proxy_op(&state, req).await)
}

/// POST /api/db/proxy
async fn proxy_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyRequest>,
    body: Bytes,
) -> Result<Json<ProxyResponse>, ApiError> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        query
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest {
            message: format!("invalid JSON body: {}", e),
        })?
    };
    Ok(Json(proxy_op(&state, req).await))
}

async fn proxy_op(state: &AppState, req: ProxyRequest) -> ProxyResponse {
    let Some(supervisor) = state.gate.supervisor() else {
        return ProxyResponse::Start(StartReport::new(
            StartStatus::Error,
            false,
            None,
            format!(
                "database tunnel is not used in {} mode",
                state.gate.strategy()
            ),
        ));
    };

    if req.check_only {
        let status = if supervisor.is_healthy().await {
            "healthy"
        } else {
            "unhealthy"
        };
        return ProxyResponse::Check { status };
    }

    match state.gate.ensure_tunnel().await {
        Some(report) => ProxyResponse::Start(report),
        None => ProxyResponse::Start(StartReport::new(
            StartStatus::Error,
            false,
            None,
            "database tunnel is not configured",
        )),
    }
}

/// GET /api/db/status
async fn db_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let manager = state.gate.pools();
    let pools = manager
        .cached_names()
        .into_iter()
        .filter_map(|name| {
            let pool = manager.cached(&name)?;
            Some(PoolStatus {
                port: pool.settings().port,
                stats: pool.stats(),
                name,
            })
        })
        .collect();

    Json(StatusResponse {
        strategy: state.gate.strategy(),
        proxy: state.gate.supervisor().map(|s| s.snapshot()),
        pools,
    })
}

/// GET /api/db/ping
async fn db_ping(State(state): State<Arc<AppState>>) -> Result<Json<QueryResult>, ApiError> {
    if !state.gate.ensure_database_reachable().await {
        return Err(ApiError::unavailable(format!(
            "reachability check failed ({})",
            state.gate.strategy()
        )));
    }
    let result = state.gate.query("SELECT 1 AS ok", &[]).await?;
    Ok(Json(result))
}

/// Database routes
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/db/health", get(db_health))
        .route("/api/db/proxy", get(proxy_get).post(proxy_post))
        .route("/api/db/status", get(db_status))
        .route("/api/db/ping", get(db_ping))
}
