//! Shared fixtures: an in-process mock wallet JSON-RPC node, a programmable
//! webhook sink, and a fully wired watcher over the in-memory KV store.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};

use zano_settler::config::{BackoffConfig, Config, TickerConfig};
use zano_settler::kv::MemoryKv;
use zano_settler::ledger::LedgerSink;
use zano_settler::machine::MachineDeps;
use zano_settler::store::{JobRecord, JobState, JobStore, Keys, StatusRecord};
use zano_settler::wallet_rpc::WalletRpc;
use zano_settler::watcher::{Watcher, WatcherState};
use zano_settler::webhook::WebhookDispatcher;

pub const API_KEY: &str = "test-api-key";
pub const WEBHOOK_SECRET: &str = "test-hook-secret";
pub const CALLBACK_SECRET: &str = "test-callback-secret";

// ---------- mock wallet ----------

#[derive(Default)]
pub struct MockWallet {
    pub height: Mutex<u64>,
    pub payments: Mutex<Vec<Value>>,
    pub transfers: Mutex<Vec<Value>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_transfer: AtomicBool,
}

impl MockWallet {
    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|m| m.as_str() == method).count()
    }
}

async fn json_rpc(State(state): State<Arc<MockWallet>>, Json(req): Json<Value>) -> Json<Value> {
    let method = req.get("method").and_then(|m| m.as_str()).unwrap_or("");
    state.calls.lock().push(method.to_string());
    let result = match method {
        "get_wallet_info" => json!({
            "current_height": *state.height.lock(),
            "daemon_height": *state.height.lock(),
            "is_synchronized": true,
        }),
        "get_payments" => json!({ "payments": state.payments.lock().clone() }),
        "get_recent_txs_and_info2" => json!({ "transfers": state.transfers.lock().clone() }),
        "transfer" => {
            if state.fail_transfer.load(Ordering::SeqCst) {
                return Json(json!({
                    "jsonrpc": "2.0",
                    "id": req.get("id").cloned().unwrap_or(json!(0)),
                    "error": { "code": -4, "message": "not enough outputs to mix" },
                }));
            }
            json!({ "tx_hash": "sweep-tx-1" })
        }
        "make_integrated_address" => json!({
            "integrated_address": "iZmockintegrated",
            "payment_id": req
                .get("params")
                .and_then(|p| p.get("payment_id"))
                .and_then(|v| v.as_str())
                .unwrap_or("genpid123"),
        }),
        _ => Value::Null,
    };
    Json(json!({
        "jsonrpc": "2.0",
        "id": req.get("id").cloned().unwrap_or(json!(0)),
        "result": result,
    }))
}

/// Serve the mock wallet on an ephemeral port, returning its base URL.
pub async fn spawn_mock_wallet() -> (String, Arc<MockWallet>) {
    let state = Arc::new(MockWallet::default());
    let app = Router::new().route("/json_rpc", post(json_rpc)).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

// ---------- webhook sink ----------

#[derive(Default)]
pub struct WebhookSink {
    /// Status codes to answer with, in order; empty => 200.
    pub statuses: Mutex<VecDeque<u16>>,
    pub received: Mutex<Vec<Value>>,
    pub secrets: Mutex<Vec<String>>,
}

impl WebhookSink {
    pub fn hits(&self) -> usize {
        self.received.lock().len()
    }

    pub fn push_statuses(&self, codes: &[u16]) {
        self.statuses.lock().extend(codes.iter().copied());
    }
}

async fn sink_handler(
    State(state): State<Arc<WebhookSink>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> axum::http::StatusCode {
    if let Some(secret) = headers.get("x-zano-secret").and_then(|v| v.to_str().ok()) {
        state.secrets.lock().push(secret.to_string());
    }
    state.received.lock().push(body);
    let code = state.statuses.lock().pop_front().unwrap_or(200);
    axum::http::StatusCode::from_u16(code).unwrap()
}

pub async fn spawn_webhook_sink() -> (String, Arc<WebhookSink>) {
    let state = Arc::new(WebhookSink::default());
    let app = Router::new().route("/hook", post(sink_handler)).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), state)
}

// ---------- wired-up watcher ----------

pub fn base_ticker() -> TickerConfig {
    TickerConfig {
        ticker: "zano".to_string(),
        decimals: 12,
        min_confirmations: 3,
        asset_id: None,
        webhook_url: None,
        consolidation: None,
    }
}

pub fn asset_ticker(asset_id: &str) -> TickerConfig {
    TickerConfig { ticker: "fusd".to_string(), asset_id: Some(asset_id.to_string()), ..base_ticker() }
}

pub fn test_config(webhook_url: &str, tickers: Vec<TickerConfig>) -> Config {
    Config {
        tickers,
        webhook_url: Some(webhook_url.to_string()),
        webhook_secret: Some(WEBHOOK_SECRET.to_string()),
        backoff: BackoffConfig { base_ms: 1_000, factor: 2.0, max_ms: 1_200_000, jitter: false },
        api_key: Some(API_KEY.to_string()),
        callback_secret: Some(CALLBACK_SECRET.to_string()),
        ..Config::default()
    }
}

pub struct Harness {
    pub cfg: Arc<Config>,
    pub kv: Arc<MemoryKv>,
    pub store: JobStore,
    pub watcher: Watcher,
}

pub fn wire_watcher(cfg: Config, wallet_url: &str) -> Harness {
    let cfg = Arc::new(cfg);
    let kv = Arc::new(MemoryKv::new());
    let keys = Keys::new(&cfg.key_prefix);
    let store = JobStore::new(
        kv.clone(),
        keys,
        cfg.job_ttl_secs,
        cfg.status_ttl_secs,
        cfg.seen_ttl_secs,
    );
    let rpc = Arc::new(WalletRpc::new(wallet_url, None, None, 8_000).unwrap());
    let dispatcher = Arc::new(
        WebhookDispatcher::new(WEBHOOK_SECRET, cfg.webhook_timeout_ms).unwrap(),
    );
    let deps = MachineDeps {
        cfg: cfg.clone(),
        store: store.clone(),
        rpc,
        dispatcher,
        ledger: Arc::new(LedgerSink::Off),
    };
    let watcher = Watcher::new(
        deps,
        Arc::new(AtomicBool::new(true)),
        Arc::new(WatcherState::default()),
    );
    Harness { cfg, kv, store, watcher }
}

/// Register a job + PENDING status the way the create endpoint would.
pub async fn seed_job(
    harness: &Harness,
    ticker: &TickerConfig,
    payment_id: &str,
    address: &str,
) -> String {
    let now = chrono::Utc::now().timestamp_millis();
    let job = JobRecord {
        ticker: ticker.ticker.clone(),
        address: address.to_string(),
        payment_id: payment_id.to_string(),
        min_conf: ticker.min_confirmations,
        client_reference: Some("ref-1".to_string()),
        created_at: now,
        ..Default::default()
    };
    let key = harness.store.create_job(&job, None).await.unwrap();
    let status = StatusRecord {
        status: JobState::Pending,
        ticker: ticker.ticker.clone(),
        address: address.to_string(),
        payment_id: payment_id.to_string(),
        client_reference: Some("ref-1".to_string()),
        confirmations: 0,
        required_confirmations: ticker.min_confirmations,
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
    harness.store.write_status(&status).await.unwrap();
    key
}

pub fn payment_entry(hash: &str, amount_atomic: u128, block_height: u64) -> Value {
    json!({
        "tx_hash": hash,
        "amount": amount_atomic as u64,
        "block_height": block_height,
    })
}
