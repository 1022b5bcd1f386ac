//! Intake handlers: create, status, callback.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::amount::format_atomic;
use crate::store::{JobRecord, JobState, StatusRecord};

use super::security::{not_configured, require_api_key, require_shared_secret, Rejection};
use super::AppContext;

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub ticker: String,
    #[serde(alias = "clientReference")]
    pub client_reference: Option<String>,
    #[serde(default, alias = "paymentId")]
    pub payment_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "expectedAmount", alias = "expected_amount")]
    pub expected_amount: Option<Value>,
    #[serde(default, rename = "ttlSeconds", alias = "ttl_seconds")]
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub payment_id: String,
    pub address: String,
    #[serde(default)]
    pub amount: Option<Value>,
    pub amount_atomic: Value,
    #[serde(default)]
    pub expected_amount: Option<Value>,
    #[serde(default)]
    pub confirmations: u64,
    pub hash: String,
    #[serde(default)]
    pub client_reference: Option<String>,
    #[serde(default)]
    pub created_at: Option<i64>,
}

fn bad_request(msg: &str) -> Rejection {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })))
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// POST /api/transaction/create (API-key gated).
pub async fn create(
    State(ctx): State<Arc<AppContext>>,
    headers: HeaderMap,
    Json(body): Json<CreateRequest>,
) -> Result<impl IntoResponse, Rejection> {
    require_api_key(&headers, ctx.cfg.api_key.as_deref())?;
    let store = ctx.store.as_ref().ok_or_else(|| not_configured("kv store"))?;
    let ticker_cfg = ctx
        .cfg
        .ticker(&body.ticker)
        .ok_or_else(|| bad_request("ticker not enabled"))?;
    let client_reference = body
        .client_reference
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| bad_request("client_reference is required"))?
        .to_string();

    // The wallet synthesizes an integrated address when the caller does not
    // bring one; the embedded paymentId is what lets us attribute deposits.
    let (address, payment_id) = match (&body.address, &body.payment_id) {
        (Some(addr), Some(pid)) if !addr.is_empty() && !pid.is_empty() => {
            (addr.clone(), pid.clone())
        }
        _ => {
            let rpc = ctx.rpc.as_ref().ok_or_else(|| not_configured("wallet rpc"))?;
            let (address, generated) = rpc
                .make_integrated_address(body.payment_id.as_deref().filter(|s| !s.is_empty()))
                .await
                .map_err(|e| {
                    tracing::warn!(error = %e, "make_integrated_address failed");
                    (
                        StatusCode::BAD_GATEWAY,
                        Json(json!({ "error": format!("wallet rpc: {e}") })),
                    )
                })?;
            let pid = body
                .payment_id
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or(generated);
            if pid.is_empty() {
                return Err(bad_request("payment_id could not be derived"));
            }
            (body.address.clone().filter(|s| !s.is_empty()).unwrap_or(address), pid)
        }
    };

    let now = Utc::now().timestamp_millis();
    let ttl_seconds = body.ttl_seconds.unwrap_or(ctx.cfg.job_ttl_secs);
    let job = JobRecord {
        ticker: ticker_cfg.ticker.clone(),
        address: address.clone(),
        payment_id: payment_id.clone(),
        expected_amount: body.expected_amount.as_ref().and_then(value_to_string),
        min_conf: ticker_cfg.min_confirmations,
        client_reference: Some(client_reference.clone()),
        created_at: now,
        ..Default::default()
    };
    let job_key = store.create_job(&job, Some(ttl_seconds)).await.map_err(kv_reject)?;

    let status = StatusRecord {
        status: JobState::Pending,
        ticker: ticker_cfg.ticker.clone(),
        address: address.clone(),
        payment_id: payment_id.clone(),
        client_reference: Some(client_reference),
        confirmations: 0,
        required_confirmations: ticker_cfg.min_confirmations,
        hash: None,
        paid_amount: None,
        paid_amount_atomic: None,
        effective_amount: None,
        effective_amount_atomic: None,
        fee_atomic: None,
        created_at: now,
        updated_at: now,
        webhook_error: None,
    };
    store.write_status(&status).await.map_err(kv_reject)?;

    tracing::info!(ticker = %ticker_cfg.ticker, payment_id = %payment_id, "deposit job registered");
    Ok(Json(json!({
        "ok": true,
        "jobKey": job_key,
        "status": "PENDING",
        "address": address,
        "paymentId": payment_id,
        "expiresAt": now + (ttl_seconds as i64) * 1000,
        "ttlSeconds": ttl_seconds,
    })))
}

/// GET /api/transaction/status/:ticker/:paymentId (public).
pub async fn status(
    State(ctx): State<Arc<AppContext>>,
    Path((ticker, payment_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, Rejection> {
    let store = ctx.store.as_ref().ok_or_else(|| not_configured("kv store"))?;
    let cache_key = format!("{ticker}:{payment_id}");
    let ttl = std::time::Duration::from_millis(ctx.cfg.status_cache_ttl_ms());

    if let Some((at, cached)) = ctx.status_cache.lock().get(&cache_key) {
        if at.elapsed() < ttl {
            return Ok(Json(serde_json::to_value(cached).unwrap_or(Value::Null)));
        }
    }

    let status = store
        .load_status(&ticker, &payment_id)
        .await
        .map_err(kv_reject)?
        .ok_or((StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))))?;
    ctx.status_cache.lock().insert(cache_key, (Instant::now(), status.clone()));
    Ok(Json(serde_json::to_value(&status).unwrap_or(Value::Null)))
}

/// POST /api/transaction/callback/:ticker (shared-secret gated).
///
/// Lets an external status API push a confirmed deposit directly; the write
/// uses the same canonical status fields as the watcher path.
pub async fn callback(
    State(ctx): State<Arc<AppContext>>,
    Path(ticker): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CallbackRequest>,
) -> Result<impl IntoResponse, Rejection> {
    require_shared_secret(&headers, ctx.cfg.callback_secret.as_deref())?;
    let store = ctx.store.as_ref().ok_or_else(|| not_configured("kv store"))?;
    let ticker_cfg = ctx.cfg.ticker(&ticker).ok_or_else(|| bad_request("ticker not enabled"))?;
    if body.payment_id.is_empty() || body.hash.is_empty() {
        return Err(bad_request("paymentId and hash are required"));
    }
    let atomic: u128 = value_to_string(&body.amount_atomic)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| bad_request("amountAtomic must be a non-negative integer"))?;
    let decimal = body
        .amount
        .as_ref()
        .and_then(value_to_string)
        .unwrap_or_else(|| format_atomic(atomic, ticker_cfg.decimals));

    let now = Utc::now().timestamp_millis();
    let status = StatusRecord {
        status: JobState::Completed,
        ticker: ticker_cfg.ticker.clone(),
        address: body.address.clone(),
        payment_id: body.payment_id.clone(),
        client_reference: body.client_reference.clone(),
        confirmations: body.confirmations,
        required_confirmations: ticker_cfg.min_confirmations,
        hash: Some(body.hash.clone()),
        paid_amount: Some(decimal.clone()),
        paid_amount_atomic: Some(atomic.to_string()),
        effective_amount: Some(decimal),
        effective_amount_atomic: Some(atomic.to_string()),
        fee_atomic: None,
        created_at: body.created_at.unwrap_or(now),
        updated_at: now,
        webhook_error: None,
    };
    store.write_status(&status).await.map_err(kv_reject)?;
    tracing::info!(
        ticker = %ticker_cfg.ticker,
        payment_id = %body.payment_id,
        hash = %body.hash,
        "callback recorded completed deposit"
    );
    Ok(Json(json!({ "ok": true, "status": "COMPLETED" })))
}

fn kv_reject(e: crate::errors::KvError) -> Rejection {
    tracing::warn!(error = %e, "kv operation failed");
    (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "kv unavailable" })))
}
