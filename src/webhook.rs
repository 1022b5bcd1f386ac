//! Webhook delivery with exponential backoff.
//!
//! The dispatcher never raises: every outcome (2xx, non-2xx, network error)
//! comes back as a [`DispatchOutcome`] the state machine folds into the job's
//! retry metadata. The shared secret travels in the `X-Zano-Secret` header;
//! the receiver must be idempotent by `(ticker, paymentId)`.

use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use serde::Serialize;

use crate::amount::format_atomic;
use crate::config::BackoffConfig;
use crate::wallet_rpc::DepositObservation;

pub const SECRET_HEADER: &str = "X-Zano-Secret";

/// Canonical webhook payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub payment_id: String,
    pub address: String,
    pub amount: String,
    pub amount_atomic: String,
    pub paid_amount: String,
    pub paid_amount_atomic: String,
    pub effective_amount: String,
    pub effective_amount_atomic: String,
    pub fee_atomic: Option<String>,
    pub confirmations: u64,
    pub hash: String,
    pub ticker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl WebhookPayload {
    /// Build the payload from a confirmed observation; effective amounts
    /// start equal to gross and are adjusted if consolidation charges a fee.
    pub fn from_observation(
        obs: &DepositObservation,
        decimals: u32,
        client_reference: Option<String>,
        created_at: Option<i64>,
    ) -> Self {
        let decimal = format_atomic(obs.amount_atomic, decimals);
        let atomic = obs.amount_atomic.to_string();
        Self {
            payment_id: String::new(),
            address: obs.address.clone(),
            amount: decimal.clone(),
            amount_atomic: atomic.clone(),
            paid_amount: decimal.clone(),
            paid_amount_atomic: atomic.clone(),
            effective_amount: decimal,
            effective_amount_atomic: atomic,
            fee_atomic: None,
            confirmations: obs.confirmations,
            hash: obs.hash.clone(),
            ticker: obs.ticker.clone(),
            client_reference,
            created_at,
        }
    }

    /// Deduct a consolidation fee: `effective = paid - fee`, decimal form
    /// recomputed.
    pub fn apply_fee(&mut self, fee_atomic: u128, decimals: u32) {
        let paid: u128 = self.paid_amount_atomic.parse().unwrap_or(0);
        let effective = paid.saturating_sub(fee_atomic);
        self.fee_atomic = Some(fee_atomic.to_string());
        self.effective_amount_atomic = effective.to_string();
        self.effective_amount = format_atomic(effective, decimals);
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

pub struct WebhookDispatcher {
    http: Client,
    secret: String,
}

impl WebhookDispatcher {
    pub fn new(secret: &str, timeout_ms: u64) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?;
        Ok(Self { http, secret: secret.to_string() })
    }

    pub async fn dispatch(&self, payload: &WebhookPayload, url: &str) -> DispatchOutcome {
        let res = self
            .http
            .post(url)
            .header(SECRET_HEADER, &self.secret)
            .json(payload)
            .send()
            .await;
        match res {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let ok = (200..300).contains(&status);
                tracing::info!(
                    ticker = %payload.ticker,
                    payment_id = %payload.payment_id,
                    hash = %payload.hash,
                    status,
                    ok,
                    "webhook dispatched"
                );
                DispatchOutcome {
                    ok,
                    status_code: Some(status),
                    error: if ok { None } else { Some(format!("http {status}")) },
                }
            }
            Err(e) => {
                tracing::warn!(
                    ticker = %payload.ticker,
                    payment_id = %payload.payment_id,
                    error = %e,
                    "webhook request failed"
                );
                DispatchOutcome { ok: false, status_code: None, error: Some(e.to_string()) }
            }
        }
    }
}

/// Delay before the next attempt: `min(base * factor^attempts, max)`, drawn
/// uniformly from `[0, delay]` when jitter is on.
pub fn backoff_delay_ms(cfg: &BackoffConfig, attempts: u64) -> u64 {
    let exp = cfg.factor.powi(attempts.min(64) as i32);
    let delay = ((cfg.base_ms as f64) * exp).min(cfg.max_ms as f64) as u64;
    if cfg.jitter && delay > 0 {
        rand::thread_rng().gen_range(0..=delay)
    } else {
        delay
    }
}
