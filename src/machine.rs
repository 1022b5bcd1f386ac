//! Per-job state machine.
//!
//! One invocation per job per scheduling pass, and the single writer to its
//! job record. Transitions PENDING -> CONFIRMING -> COMPLETED | FAILED while
//! holding the idempotency latches: the dynamic threshold is applied once,
//! consolidation is attempted once, and a webhook is accepted once.
//!
//! Write ordering is load-bearing. The Seen guard is checked before the
//! payload is built; `webhookSent` is persisted before the Seen entry; the
//! COMPLETED status lands before the job is deleted. A crash between any two
//! of those writes re-enters at the guard steps on the next pass instead of
//! double-crediting the merchant.

use std::sync::Arc;

use chrono::Utc;

use crate::config::{Config, TickerConfig};
use crate::errors::WatchError;
use crate::ledger::LedgerSink;
use crate::matcher::find_deposits;
use crate::policy::dynamic_min_conf;
use crate::store::{field, JobRecord, JobState, JobStore, StatusRecord};
use crate::wallet_rpc::{DepositObservation, WalletRpc};
use crate::webhook::{backoff_delay_ms, WebhookDispatcher, WebhookPayload};

const MAX_STORED_ERROR_LEN: usize = 500;

#[derive(Clone)]
pub struct MachineDeps {
    pub cfg: Arc<Config>,
    pub store: JobStore,
    pub rpc: Arc<WalletRpc>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub ledger: Arc<LedgerSink>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn clip_error(s: &str) -> String {
    if s.len() <= MAX_STORED_ERROR_LEN {
        return s.to_string();
    }
    let mut end = MAX_STORED_ERROR_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Run one pass over a job. Only RPC and KV failures escape; everything
/// else is recorded on the job and the pass completes.
pub async fn process_job(
    deps: &MachineDeps,
    ticker_cfg: &TickerConfig,
    current_height: u64,
    job_key: &str,
) -> Result<(), WatchError> {
    let ticker = &ticker_cfg.ticker;
    let now = now_ms();

    let Some(mut job) = deps.store.load_job(job_key).await? else {
        return Ok(());
    };
    if job.malformed() {
        tracing::warn!(job_key, "job missing address; deleting");
        deps.store.delete_job(job_key).await?;
        return Ok(());
    }

    // One-time paymentId backfill for records written before the field was
    // mandatory: prefer the status record, fall back to the key suffix.
    if job.payment_id.is_empty() {
        let key_pid = deps
            .store
            .keys()
            .payment_id_of_job_key(ticker, job_key)
            .map(str::to_string);
        let mut pid = None;
        if let Some(candidate) = &key_pid {
            if let Some(status) = deps.store.load_status(ticker, candidate).await? {
                if !status.payment_id.is_empty() {
                    pid = Some(status.payment_id);
                }
            }
        }
        match pid.or(key_pid) {
            Some(pid) => {
                deps.store
                    .update_job(job_key, &[(field::PAYMENT_ID.to_string(), pid.clone())])
                    .await?;
                tracing::info!(job_key, payment_id = %pid, "backfilled job paymentId");
                job.payment_id = pid;
            }
            None => {
                // Nothing to match on; leave the job for a later pass.
                tracing::debug!(job_key, "job has no paymentId; skipping rpc");
                return Ok(());
            }
        }
    }

    let observations = find_deposits(
        deps.rpc.as_ref(),
        current_height,
        &job.address,
        ticker,
        &job.payment_id,
        ticker_cfg.asset_id.as_deref(),
    )
    .await?;

    let Some(best) = observations.iter().max_by_key(|o| o.confirmations).cloned() else {
        // Unobserved jobs stay PENDING with zero confirmations.
        return Ok(());
    };
    deps.ledger.upsert_observation(&best, now).await;

    let prior_status = deps.store.load_status(ticker, &job.payment_id).await?;
    let already_completed =
        matches!(prior_status.as_ref().map(|s| s.status), Some(JobState::Completed));

    if !job.dynamic_min_conf_applied && !already_completed {
        let tier = dynamic_min_conf(best.amount_atomic, ticker_cfg.decimals);
        deps.store
            .update_job(
                job_key,
                &[
                    (field::MIN_CONF.to_string(), tier.to_string()),
                    (field::DYNAMIC_MIN_CONF_APPLIED.to_string(), "true".to_string()),
                ],
            )
            .await?;
        if tier != job.min_conf {
            tracing::info!(
                job_key,
                amount_atomic = %best.amount_atomic,
                from = job.min_conf,
                to = tier,
                "dynamic confirmation tier applied"
            );
        }
        job.min_conf = tier;
        job.dynamic_min_conf_applied = true;
    }
    let min_conf = if job.min_conf > 0 { job.min_conf } else { ticker_cfg.min_confirmations };

    let confirmed = observations
        .iter()
        .filter(|o| o.confirmations >= min_conf)
        .max_by_key(|o| o.confirmations)
        .cloned();
    let Some(confirmed) = confirmed else {
        write_confirming(deps, &job, ticker, &best, min_conf, prior_status.as_ref(), now).await?;
        return Ok(());
    };

    // Hash-level dedup guard, checked before any payload work: a restart
    // that raced the Seen write must not re-credit this transfer.
    if deps.store.seen(&confirmed.hash).await? {
        tracing::info!(job_key, hash = %confirmed.hash, "transfer already settled; clearing job");
        deps.store.delete_job(job_key).await?;
        return Ok(());
    }

    let mut payload = WebhookPayload::from_observation(
        &confirmed,
        ticker_cfg.decimals,
        job.client_reference.clone(),
        (job.created_at > 0).then_some(job.created_at),
    );
    payload.payment_id = job.payment_id.clone();

    if let Some(rule) = ticker_cfg.consolidation.as_ref().filter(|r| r.enabled) {
        if job.consolidation_attempted {
            // Fee already charged by an earlier pass; keep the payload consistent.
            if job.consolidation_tx_id.is_some() {
                payload.apply_fee(rule.fee_atomic, ticker_cfg.decimals);
            }
        } else {
            let sweep_min = rule.min_confirmations.unwrap_or(min_conf);
            if confirmed.confirmations >= sweep_min {
                consolidate(deps, rule, ticker_cfg.decimals, job_key, &mut job, &confirmed, &mut payload)
                    .await?;
            }
            // Below the sweep threshold: defer without burning the attempt.
        }
    }

    if job.webhook_sent {
        // Completed on an earlier pass; only the cleanup writes are missing.
        deps.store.mark_seen(&confirmed.hash).await?;
        deps.store.delete_job(job_key).await?;
        return Ok(());
    }

    if let Some(first) = job.webhook_first_attempt_at {
        if now - first > deps.cfg.webhook_max_retry_window_ms {
            let error = job
                .webhook_last_error
                .clone()
                .unwrap_or_else(|| "webhook retry window exceeded".to_string());
            tracing::warn!(
                job_key,
                hash = %confirmed.hash,
                attempts = job.webhook_attempts,
                "webhook retry window exceeded; failing job"
            );
            let failed = terminal_status(
                JobState::Failed,
                &job,
                ticker,
                &confirmed,
                min_conf,
                &payload,
                prior_status.as_ref(),
                now,
                Some(error),
            );
            deps.store.write_status(&failed).await?;
            deps.store.mark_seen(&confirmed.hash).await?;
            deps.store.delete_job(job_key).await?;
            return Ok(());
        }
    }
    if deps.cfg.webhook_max_attempts > 0 && job.webhook_attempts >= deps.cfg.webhook_max_attempts {
        // Attempt ceiling reached inside the retry window: hold the job in
        // CONFIRMING for manual inspection rather than failing it.
        return Ok(());
    }
    if job.webhook_next_attempt_at.is_some_and(|next| next > now) {
        return Ok(());
    }

    // Refresh before the attempt so polling clients see current numbers.
    write_confirming(deps, &job, ticker, &confirmed, min_conf, prior_status.as_ref(), now).await?;

    let Some(url) = deps.cfg.webhook_url_for(ticker_cfg) else {
        tracing::warn!(job_key, "no webhook url configured for ticker");
        return Ok(());
    };
    let outcome = deps.dispatcher.dispatch(&payload, &url).await;

    if outcome.ok {
        let completed = terminal_status(
            JobState::Completed,
            &job,
            ticker,
            &confirmed,
            min_conf,
            &payload,
            prior_status.as_ref(),
            now,
            None,
        );
        deps.store.write_status(&completed).await?;
        deps.store
            .update_job(
                job_key,
                &[
                    (field::WEBHOOK_SENT.to_string(), "true".to_string()),
                    (field::WEBHOOK_LAST_ERROR.to_string(), String::new()),
                ],
            )
            .await?;
        deps.store.mark_seen(&confirmed.hash).await?;
        deps.ledger.record_webhook(ticker, &confirmed.hash, now).await;
        deps.store.delete_job(job_key).await?;
        tracing::info!(
            job_key,
            hash = %confirmed.hash,
            amount = %payload.effective_amount,
            "deposit settled"
        );
    } else {
        let error = clip_error(&outcome.error.unwrap_or_else(|| "webhook failed".to_string()));
        let delay = backoff_delay_ms(&deps.cfg.backoff, job.webhook_attempts);
        let next_at = now + delay as i64;
        let mut fields = vec![
            (field::WEBHOOK_ATTEMPTS.to_string(), (job.webhook_attempts + 1).to_string()),
            (field::WEBHOOK_LAST_ATTEMPT_AT.to_string(), now.to_string()),
            (field::WEBHOOK_NEXT_ATTEMPT_AT.to_string(), next_at.to_string()),
            (field::WEBHOOK_LAST_ERROR.to_string(), error.clone()),
        ];
        if job.webhook_first_attempt_at.is_none() {
            fields.push((field::WEBHOOK_FIRST_ATTEMPT_AT.to_string(), now.to_string()));
        }
        deps.store.update_job(job_key, &fields).await?;
        tracing::warn!(
            job_key,
            hash = %confirmed.hash,
            attempts = job.webhook_attempts + 1,
            retry_in_ms = delay,
            error = %error,
            "webhook attempt failed"
        );
        write_confirming(deps, &job, ticker, &confirmed, min_conf, prior_status.as_ref(), now)
            .await?;
    }

    Ok(())
}

/// Attempt the treasury sweep. Latches `consolidationAttempted` whether the
/// transfer succeeds or fails; the deposit completes either way.
#[allow(clippy::too_many_arguments)]
async fn consolidate(
    deps: &MachineDeps,
    rule: &crate::config::ConsolidationRule,
    decimals: u32,
    job_key: &str,
    job: &mut JobRecord,
    confirmed: &DepositObservation,
    payload: &mut WebhookPayload,
) -> Result<(), WatchError> {
    let sweep_amount = confirmed.amount_atomic.saturating_sub(rule.fee_atomic);
    if sweep_amount == 0 {
        let error = "deposit does not cover consolidation fee".to_string();
        tracing::warn!(job_key, fee = %rule.fee_atomic, "{error}");
        deps.store
            .update_job(
                job_key,
                &[
                    (field::CONSOLIDATION_ATTEMPTED.to_string(), "true".to_string()),
                    (field::CONSOLIDATION_ERROR.to_string(), error),
                ],
            )
            .await?;
        job.consolidation_attempted = true;
        return Ok(());
    }

    match deps
        .rpc
        .transfer(&rule.address, sweep_amount, rule.fee_atomic, rule.mixin, rule.priority)
        .await
    {
        Ok(tx_id) => {
            tracing::info!(
                job_key,
                tx_id = %tx_id,
                amount = %sweep_amount,
                "consolidated deposit to treasury"
            );
            deps.store
                .update_job(
                    job_key,
                    &[
                        (field::CONSOLIDATION_ATTEMPTED.to_string(), "true".to_string()),
                        (field::CONSOLIDATION_TX_ID.to_string(), tx_id.clone()),
                    ],
                )
                .await?;
            job.consolidation_attempted = true;
            job.consolidation_tx_id = Some(tx_id);
            payload.apply_fee(rule.fee_atomic, decimals);
        }
        Err(e) => {
            // Never retried: a wallet that already broadcast the sweep must
            // not be asked to spend the same funds twice.
            let error = clip_error(&e.to_string());
            tracing::warn!(job_key, error = %error, "consolidation transfer failed");
            deps.store
                .update_job(
                    job_key,
                    &[
                        (field::CONSOLIDATION_ATTEMPTED.to_string(), "true".to_string()),
                        (field::CONSOLIDATION_ERROR.to_string(), error.clone()),
                    ],
                )
                .await?;
            job.consolidation_attempted = true;
            job.consolidation_error = Some(error);
        }
    }
    Ok(())
}

async fn write_confirming(
    deps: &MachineDeps,
    job: &JobRecord,
    ticker: &str,
    obs: &DepositObservation,
    min_conf: u64,
    prior: Option<&StatusRecord>,
    now: i64,
) -> Result<(), WatchError> {
    // Confirmations never go backwards for a hash the client already saw,
    // even when a lagging node briefly reports fewer.
    let confirmations = match prior {
        Some(p) if p.hash.as_deref() == Some(&obs.hash) => p.confirmations.max(obs.confirmations),
        _ => obs.confirmations,
    };
    let status = StatusRecord {
        status: JobState::Confirming,
        ticker: ticker.to_string(),
        address: job.address.clone(),
        payment_id: job.payment_id.clone(),
        client_reference: job.client_reference.clone(),
        confirmations,
        required_confirmations: min_conf,
        hash: Some(obs.hash.clone()),
        paid_amount: None,
        paid_amount_atomic: None,
        effective_amount: None,
        effective_amount_atomic: None,
        fee_atomic: None,
        created_at: prior.map(|p| p.created_at).filter(|t| *t > 0).unwrap_or(job.created_at),
        updated_at: now,
        webhook_error: None,
    };
    deps.store.write_status(&status).await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn terminal_status(
    state: JobState,
    job: &JobRecord,
    ticker: &str,
    obs: &DepositObservation,
    min_conf: u64,
    payload: &WebhookPayload,
    prior: Option<&StatusRecord>,
    now: i64,
    webhook_error: Option<String>,
) -> StatusRecord {
    StatusRecord {
        status: state,
        ticker: ticker.to_string(),
        address: job.address.clone(),
        payment_id: job.payment_id.clone(),
        client_reference: job.client_reference.clone(),
        confirmations: obs.confirmations,
        required_confirmations: min_conf,
        hash: Some(obs.hash.clone()),
        paid_amount: Some(payload.paid_amount.clone()),
        paid_amount_atomic: Some(payload.paid_amount_atomic.clone()),
        effective_amount: Some(payload.effective_amount.clone()),
        effective_amount_atomic: Some(payload.effective_amount_atomic.clone()),
        fee_atomic: payload.fee_atomic.clone(),
        created_at: prior.map(|p| p.created_at).filter(|t| *t > 0).unwrap_or(job.created_at),
        updated_at: now,
        webhook_error,
    }
}
