//! Wallet JSON-RPC client.
//!
//! Speaks JSON-RPC 2.0 over HTTP POST to the wallet's `/json_rpc` endpoint
//! with optional basic auth. Wallet deployments disagree on payload shapes,
//! so the read side normalizes the many equivalent field spellings into a
//! canonical [`DepositObservation`] instead of trusting any one schema.

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use crate::errors::RpcError;
use crate::util::log_throttle::warn_throttled;

/// Canonical view of one incoming transfer.
#[derive(Debug, Clone)]
pub struct DepositObservation {
    pub hash: String,
    pub amount_atomic: u128,
    pub confirmations: u64,
    pub address: String,
    pub ticker: String,
}

#[derive(Debug, Clone, Default)]
pub struct WalletInfo {
    pub current_height: u64,
    pub daemon_height: u64,
    pub is_synchronized: bool,
}

pub struct WalletRpc {
    url: String,
    http: Client,
    username: Option<String>,
    password: Option<String>,
}

impl WalletRpc {
    pub fn new(
        url: &str,
        username: Option<String>,
        password: Option<String>,
        timeout_ms: u64,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            // Floor of 8s: wallet nodes routinely stall while syncing.
            .timeout(Duration::from_millis(timeout_ms.max(8_000)))
            .build()?;
        Ok(Self { url: url.trim_end_matches('/').to_string(), http, username, password })
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": method,
            "params": params,
        });
        let url = format!("{}/json_rpc", self.url);
        let mut req = self.http.post(&url).json(&body);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            req = req.basic_auth(user, Some(pass));
        }

        let resp = req.send().await.map_err(|e| RpcError::transport(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            let text = resp.text().await.unwrap_or_default();
            tracing::warn!(method, status = status.as_u16(), "wallet rpc returned error status");
            return Err(RpcError::http(status.as_u16(), truncate(&text, 300)));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| RpcError::transport(format!("rpc reply not json: {e}")))?;
        if let Some(err) = body.get("error") {
            if !err.is_null() {
                tracing::warn!(method, error = %err, "wallet rpc returned error object");
                return Err(RpcError::http(status.as_u16(), err.to_string()));
            }
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn get_wallet_info(&self) -> Result<WalletInfo, RpcError> {
        let result = self.call("get_wallet_info", json!({})).await?;
        let pick = |keys: &[&str]| -> u64 {
            keys.iter()
                .find_map(|k| find_path(&result, k))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        Ok(WalletInfo {
            current_height: pick(&["current_height", "wallet_height", "wi.current_height"]),
            daemon_height: pick(&["daemon_height", "wi.daemon_height"]),
            is_synchronized: ["is_synchronized", "wi.is_synchronized"]
                .iter()
                .find_map(|k| find_path(&result, k))
                .and_then(|v| v.as_bool())
                .unwrap_or(true),
        })
    }

    /// Raw payment entries for a payment id. Only safe for the base coin:
    /// the wallet reports asset legs here without their asset ids.
    pub async fn get_payments(&self, payment_id: &str) -> Result<Vec<Value>, RpcError> {
        let result = self.call("get_payments", json!({ "payment_id": payment_id })).await?;
        Ok(deposit_entries(&result))
    }

    /// Recent transfer entries, newest first, including unconfirmed.
    pub async fn get_recent_txs(&self, offset: u64, count: u64) -> Result<Vec<Value>, RpcError> {
        let result = self
            .call(
                "get_recent_txs_and_info2",
                json!({
                    "offset": offset,
                    "count": count,
                    "exclude_mining_txs": true,
                    "exclude_unconfirmed": false,
                    "order": "FROM_END_TO_BEGIN",
                    "update_provision_info": false,
                }),
            )
            .await?;
        Ok(result
            .get("transfers")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Sweep funds to a destination; used only by consolidation.
    pub async fn transfer(
        &self,
        destination: &str,
        amount_atomic: u128,
        fee_atomic: u128,
        mixin: u64,
        priority: u64,
    ) -> Result<String, RpcError> {
        let result = self
            .call(
                "transfer",
                json!({
                    "destinations": [{ "address": destination, "amount": amount_atomic }],
                    "fee": fee_atomic,
                    "mixin": mixin,
                    "unlock_time": 0,
                    "do_not_relay": false,
                    "priority": priority,
                }),
            )
            .await?;
        result
            .get("tx_hash")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| RpcError::transport(format!("transfer reply missing tx_hash: {result}")))
    }

    /// Synthesize an integrated address, returning `(address, payment_id)`.
    pub async fn make_integrated_address(
        &self,
        payment_id: Option<&str>,
    ) -> Result<(String, String), RpcError> {
        let params = match payment_id {
            Some(pid) => json!({ "payment_id": pid }),
            None => json!({}),
        };
        let result = self.call("make_integrated_address", params).await?;
        let address = result
            .get("integrated_address")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                RpcError::transport(format!("make_integrated_address reply: {result}"))
            })?;
        let pid = result
            .get("payment_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok((address, pid))
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

fn find_path<'a>(v: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = v;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

/// Locate the deposits array wherever this wallet build nested it.
pub fn deposit_entries(raw: &Value) -> Vec<Value> {
    const PATHS: [&str; 10] = [
        "deposits",
        "transactions",
        "items",
        "payments",
        "result.deposits",
        "result.transactions",
        "result.entries",
        "result.in",
        "result.transfers",
        "result",
    ];
    for path in PATHS {
        if let Some(arr) = find_path(raw, path).and_then(|v| v.as_array()) {
            return arr.clone();
        }
    }
    if let Some(arr) = raw.as_array() {
        return arr.clone();
    }
    Vec::new()
}

/// Transaction hash under any of its known spellings.
pub fn entry_hash(entry: &Value) -> Option<String> {
    ["hash", "tx_hash", "txHash", "txid", "transactionHash"]
        .iter()
        .find_map(|k| entry.get(*k))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Atomic amount, accepting integer or numeric-string encodings.
pub fn entry_amount_atomic(entry: &Value) -> Option<u128> {
    ["amountAtomic", "amount_atomic", "amount", "value"]
        .iter()
        .find_map(|k| entry.get(*k))
        .and_then(value_as_u128)
}

fn value_as_u128(v: &Value) -> Option<u128> {
    match v {
        Value::Number(n) => n.as_u64().map(u128::from),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Confirmation count under its known spellings; a bare `confirmed` boolean
/// counts as one confirmation.
pub fn entry_confirmations(entry: &Value) -> Option<u64> {
    ["confirmations", "conf", "num_confirmations", "confirmations_count", "confirmed"]
        .iter()
        .find_map(|k| entry.get(*k))
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::Bool(b) => Some(u64::from(*b)),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
}

pub fn entry_height(entry: &Value) -> Option<u64> {
    ["block_height", "height"]
        .iter()
        .find_map(|k| entry.get(*k))
        .and_then(|v| v.as_u64())
}

/// Convert a raw entry into an observation given the chain tip. Unknown
/// shapes are logged (throttled) and dropped here rather than silently
/// skipped downstream.
pub fn observe_entry(
    entry: &Value,
    current_height: u64,
    address: &str,
    ticker: &str,
) -> Option<DepositObservation> {
    let Some(hash) = entry_hash(entry) else {
        warn_throttled(
            format!("entry_shape:{ticker}"),
            Duration::from_secs(30),
            format!("{ticker}: unrecognized deposit entry shape: {}", truncate(&entry.to_string(), 300)),
        );
        return None;
    };
    let amount_atomic = entry_amount_atomic(entry).unwrap_or(0);
    let confirmations = match entry_height(entry) {
        // Inclusive of the mined block, clamped at zero if the node's view
        // of the tip lags behind the entry's height.
        Some(h) if h > 0 && current_height > 0 => {
            (current_height as i64 - h as i64 + 1).max(0) as u64
        }
        _ => entry_confirmations(entry).unwrap_or(0),
    };
    Some(DepositObservation {
        hash,
        amount_atomic,
        confirmations,
        address: address.to_string(),
        ticker: ticker.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_deposit_arrays_under_known_nestings() {
        let shapes = [
            json!({ "deposits": [{"tx_hash": "a"}] }),
            json!({ "transactions": [{"tx_hash": "a"}] }),
            json!({ "items": [{"tx_hash": "a"}] }),
            json!({ "payments": [{"tx_hash": "a"}] }),
            json!({ "result": { "deposits": [{"tx_hash": "a"}] } }),
            json!({ "result": { "in": [{"tx_hash": "a"}] } }),
            json!({ "result": { "transfers": [{"tx_hash": "a"}] } }),
            json!({ "result": [{"tx_hash": "a"}] }),
            json!([{"tx_hash": "a"}]),
        ];
        for shape in &shapes {
            assert_eq!(deposit_entries(shape).len(), 1, "shape: {shape}");
        }
        assert!(deposit_entries(&json!({ "nothing": 1 })).is_empty());
    }

    #[test]
    fn hash_amount_confirmation_spellings() {
        let e = json!({ "txid": "H", "amount_atomic": "60000000000000", "conf": 3 });
        assert_eq!(entry_hash(&e).as_deref(), Some("H"));
        assert_eq!(entry_amount_atomic(&e), Some(60_000_000_000_000));
        assert_eq!(entry_confirmations(&e), Some(3));

        let e = json!({ "transactionHash": "X", "value": 5, "confirmed": true });
        assert_eq!(entry_hash(&e).as_deref(), Some("X"));
        assert_eq!(entry_amount_atomic(&e), Some(5));
        assert_eq!(entry_confirmations(&e), Some(1));

        let e = json!({ "no_hash_here": 1 });
        assert_eq!(entry_hash(&e), None);
    }

    #[test]
    fn heights_win_over_reported_confirmations() {
        let e = json!({ "tx_hash": "H", "amount": 10, "block_height": 100, "confirmations": 99 });
        let obs = observe_entry(&e, 102, "A", "zano").unwrap();
        assert_eq!(obs.confirmations, 3);

        // Unknown tip: fall back to the payload's confirmations field.
        let obs = observe_entry(&e, 0, "A", "zano").unwrap();
        assert_eq!(obs.confirmations, 99);

        // Height above tip clamps to zero instead of wrapping.
        let e = json!({ "tx_hash": "H", "amount": 10, "block_height": 200 });
        let obs = observe_entry(&e, 102, "A", "zano").unwrap();
        assert_eq!(obs.confirmations, 0);
    }

    #[test]
    fn unconfirmed_entries_report_zero() {
        let e = json!({ "tx_hash": "H", "amount": 10, "height": 0 });
        let obs = observe_entry(&e, 102, "A", "zano").unwrap();
        assert_eq!(obs.confirmations, 0);
    }
}
