//! HTTP surface: intake endpoints, health, and the operator status view.

pub mod intake;
pub mod security;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::store::{JobStore, StatusRecord};
use crate::wallet_rpc::WalletRpc;
use crate::watcher::WatcherState;

/// Shared state behind every handler. Pieces that depend on external
/// services are optional: when configuration is incomplete the endpoints
/// that need them answer 503 instead of the service refusing to boot.
pub struct AppContext {
    pub cfg: Arc<Config>,
    pub store: Option<JobStore>,
    pub rpc: Option<Arc<WalletRpc>>,
    pub started_at: Instant,
    pub status_cache: Mutex<HashMap<String, (Instant, StatusRecord)>>,
    pub watcher: Arc<WatcherState>,
}

impl AppContext {
    pub fn new(
        cfg: Arc<Config>,
        store: Option<JobStore>,
        rpc: Option<Arc<WalletRpc>>,
        watcher: Arc<WatcherState>,
    ) -> Self {
        Self {
            cfg,
            store,
            rpc,
            started_at: Instant::now(),
            status_cache: Mutex::new(HashMap::new()),
            watcher,
        }
    }
}

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/watcher/status", get(watcher_status))
        .route("/api/transaction/create", post(intake::create))
        .route("/api/transaction/status/:ticker/:payment_id", get(intake::status))
        .route("/api/transaction/callback/:ticker", post(intake::callback))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "uptime": ctx.started_at.elapsed().as_secs(),
    }))
}

/// Read-only snapshot of the watcher: per-ticker backoff deadlines and the
/// last error each ticker hit, for operators poking at a stuck deployment.
async fn watcher_status(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let backoffs = ctx.watcher.backoff_until_ms.lock().clone();
    let errors = ctx.watcher.last_errors.lock().clone();
    let tickers: Value = ctx
        .cfg
        .tickers
        .iter()
        .map(|t| {
            (
                t.ticker.clone(),
                json!({
                    "assetMode": t.asset_id.is_some(),
                    "minConfirmations": t.min_confirmations,
                    "decimals": t.decimals,
                    "consolidation": t.consolidation.as_ref().map(|c| c.enabled).unwrap_or(false),
                    "backoffUntil": backoffs.get(&t.ticker),
                    "lastError": errors.get(&t.ticker),
                }),
            )
        })
        .collect::<serde_json::Map<String, Value>>()
        .into();
    Json(json!({
        "enabled": ctx.cfg.watcher_configured().is_none(),
        "intervalMs": ctx.cfg.interval_ms,
        "keyPrefix": ctx.cfg.key_prefix,
        "lastTickAt": *ctx.watcher.last_tick_at_ms.lock(),
        "tickers": tickers,
    }))
}
