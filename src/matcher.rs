//! Deposit matcher: turns wallet RPC replies into the best observation per
//! transaction hash for a registered payment.

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::RpcError;
use crate::wallet_rpc::{
    entry_amount_atomic, entry_height, observe_entry, DepositObservation, WalletRpc,
};

const RECENT_TX_PAGE: u64 = 100;

/// Find all current observations for `(address, ticker, payment_id)`.
///
/// Base-coin mode (no asset id) asks `get_payments` first; asset mode skips
/// it entirely because the wallet reports asset legs there without their
/// asset ids. When `get_payments` yields nothing, recent transfers are
/// scanned and filtered by payment id, income direction, and asset id.
pub async fn find_deposits(
    rpc: &WalletRpc,
    current_height: u64,
    address: &str,
    ticker: &str,
    payment_id: &str,
    expected_asset_id: Option<&str>,
) -> Result<Vec<DepositObservation>, RpcError> {
    let mut observations = Vec::new();

    if expected_asset_id.is_none() {
        for entry in rpc.get_payments(payment_id).await? {
            if let Some(obs) = observe_entry(&entry, current_height, address, ticker) {
                observations.push(obs);
            }
        }
    }

    if observations.is_empty() {
        let transfers = rpc.get_recent_txs(0, RECENT_TX_PAGE).await?;
        for tx in &transfers {
            if let Some(obs) =
                observe_transfer(tx, current_height, address, ticker, payment_id, expected_asset_id)
            {
                observations.push(obs);
            }
        }
    }

    Ok(dedup_best(observations))
}

/// Match one `get_recent_txs_and_info2` transfer entry against the payment.
/// Sums the income subtransfers of the expected asset (or of the base coin
/// when no asset id is configured).
fn observe_transfer(
    tx: &Value,
    current_height: u64,
    address: &str,
    ticker: &str,
    payment_id: &str,
    expected_asset_id: Option<&str>,
) -> Option<DepositObservation> {
    let tx_payment_id = tx.get("payment_id").and_then(|v| v.as_str()).unwrap_or("");
    if tx_payment_id != payment_id {
        return None;
    }

    let subtransfers = tx.get("subtransfers").and_then(|v| v.as_array())?;
    let mut amount: u128 = 0;
    let mut matched = false;
    for sub in subtransfers {
        if !sub.get("is_income").and_then(|v| v.as_bool()).unwrap_or(false) {
            continue;
        }
        let asset_id = sub.get("asset_id").and_then(|v| v.as_str()).unwrap_or("");
        let wanted = match expected_asset_id {
            Some(expected) => asset_id == expected,
            None => asset_id.is_empty(),
        };
        if !wanted {
            continue;
        }
        matched = true;
        amount = amount.saturating_add(entry_amount_atomic(sub).unwrap_or(0));
    }
    if !matched {
        return None;
    }

    let mut obs = observe_entry(tx, current_height, address, ticker)?;
    obs.amount_atomic = amount;
    // A zero height means the transfer is still in the pool.
    if entry_height(tx) == Some(0) {
        obs.confirmations = 0;
    }
    Some(obs)
}

/// At most one observation per hash, keeping the highest confirmations.
pub fn dedup_best(observations: Vec<DepositObservation>) -> Vec<DepositObservation> {
    let mut best: HashMap<String, DepositObservation> = HashMap::new();
    for obs in observations {
        match best.get(&obs.hash) {
            Some(prev) if prev.confirmations >= obs.confirmations => {}
            _ => {
                best.insert(obs.hash.clone(), obs);
            }
        }
    }
    best.into_values().collect()
}
