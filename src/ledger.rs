//! Optional append-only audit trail per `(ticker, txHash)`.
//!
//! Three backends: `off` (default), `kv` (hash entry next to the job data),
//! and `disk` (a local sled tree for deployments that want an audit log that
//! survives KV TTLs). Records capture first-seen, last-seen, and the webhook
//! outcome timestamp. Ledger writes are best-effort: a failing audit sink
//! must never stall settlement, so errors are logged and swallowed.

use std::sync::Arc;

use serde_json::json;

use crate::config::{LedgerConfig, LedgerMode};
use crate::kv::KvStore;
use crate::store::Keys;
use crate::wallet_rpc::DepositObservation;

pub enum LedgerSink {
    Off,
    Kv { kv: Arc<dyn KvStore>, keys: Keys, ttl_secs: Option<u64> },
    Disk { tree: sled::Tree },
}

impl LedgerSink {
    pub fn from_config(
        cfg: &LedgerConfig,
        kv: Option<Arc<dyn KvStore>>,
        keys: &Keys,
    ) -> anyhow::Result<Self> {
        Ok(match cfg.mode {
            LedgerMode::Off => LedgerSink::Off,
            LedgerMode::Kv => match kv {
                Some(kv) => {
                    LedgerSink::Kv { kv, keys: keys.clone(), ttl_secs: cfg.ttl_secs }
                }
                None => {
                    tracing::warn!("ledger mode 'kv' requested without a kv store; audit disabled");
                    LedgerSink::Off
                }
            },
            LedgerMode::Disk => {
                let db = sled::open(&cfg.dir)?;
                let tree = db.open_tree("deposit_ledger")?;
                LedgerSink::Disk { tree }
            }
        })
    }

    /// Record (or refresh) the observation for its hash.
    pub async fn upsert_observation(&self, obs: &DepositObservation, now_ms: i64) {
        match self {
            LedgerSink::Off => {}
            LedgerSink::Kv { kv, keys, ttl_secs } => {
                let key = keys.ledger(&obs.ticker, &obs.hash);
                let mut fields = vec![
                    ("lastSeenAt".to_string(), now_ms.to_string()),
                    ("amountAtomic".to_string(), obs.amount_atomic.to_string()),
                    ("confirmations".to_string(), obs.confirmations.to_string()),
                    ("address".to_string(), obs.address.clone()),
                ];
                match kv.hgetall(&key).await {
                    Ok(existing) => {
                        if !existing.contains_key("firstSeenAt") {
                            fields.push(("firstSeenAt".to_string(), now_ms.to_string()));
                        }
                    }
                    Err(e) => {
                        tracing::warn!(key, error = %e, "ledger read failed");
                        return;
                    }
                }
                if let Err(e) = kv.hset(&key, &fields).await {
                    tracing::warn!(key, error = %e, "ledger write failed");
                    return;
                }
                if let Some(ttl) = ttl_secs {
                    let _ = kv.expire(&key, *ttl).await;
                }
            }
            LedgerSink::Disk { tree } => {
                let key = format!("{}:{}", obs.ticker, obs.hash);
                let first_seen = tree
                    .get(key.as_bytes())
                    .ok()
                    .flatten()
                    .and_then(|v| serde_json::from_slice::<serde_json::Value>(&v).ok())
                    .and_then(|v| v.get("firstSeenAt").and_then(|t| t.as_i64()))
                    .unwrap_or(now_ms);
                let record = json!({
                    "firstSeenAt": first_seen,
                    "lastSeenAt": now_ms,
                    "amountAtomic": obs.amount_atomic.to_string(),
                    "confirmations": obs.confirmations,
                    "address": obs.address,
                });
                if let Err(e) = tree.insert(key.as_bytes(), record.to_string().as_bytes()) {
                    tracing::warn!(key, error = %e, "ledger write failed");
                }
            }
        }
    }

    /// Stamp the accepted-webhook time on the hash's record.
    pub async fn record_webhook(&self, ticker: &str, hash: &str, now_ms: i64) {
        match self {
            LedgerSink::Off => {}
            LedgerSink::Kv { kv, keys, .. } => {
                let key = keys.ledger(ticker, hash);
                let fields = vec![("webhookAt".to_string(), now_ms.to_string())];
                if let Err(e) = kv.hset(&key, &fields).await {
                    tracing::warn!(key, error = %e, "ledger webhook stamp failed");
                }
            }
            LedgerSink::Disk { tree } => {
                let key = format!("{}:{}", ticker, hash);
                let mut record = tree
                    .get(key.as_bytes())
                    .ok()
                    .flatten()
                    .and_then(|v| serde_json::from_slice::<serde_json::Value>(&v).ok())
                    .unwrap_or_else(|| json!({}));
                record["webhookAt"] = json!(now_ms);
                if let Err(e) = tree.insert(key.as_bytes(), record.to_string().as_bytes()) {
                    tracing::warn!(key, error = %e, "ledger webhook stamp failed");
                }
            }
        }
    }
}
