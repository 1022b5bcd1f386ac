//! Typed helpers over the KV store: key construction and the Job / Status /
//! Seen record codecs.
//!
//! Jobs are stored as string-field hashes so the state machine can upsert
//! only the fields it changed. Status records are JSON blobs read by the
//! public polling endpoint. Seen entries are short-lived dedup guards keyed
//! by transaction hash.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::KvError;
use crate::kv::KvStore;

pub mod field {
    pub const TICKER: &str = "ticker";
    pub const ADDRESS: &str = "address";
    pub const PAYMENT_ID: &str = "paymentId";
    pub const EXPECTED_AMOUNT: &str = "expectedAmount";
    pub const MIN_CONF: &str = "minConf";
    pub const CLIENT_REFERENCE: &str = "clientReference";
    pub const CREATED_AT: &str = "createdAt";
    pub const DYNAMIC_MIN_CONF_APPLIED: &str = "dynamicMinConfApplied";
    pub const WEBHOOK_SENT: &str = "webhookSent";
    pub const WEBHOOK_ATTEMPTS: &str = "webhookAttempts";
    pub const WEBHOOK_FIRST_ATTEMPT_AT: &str = "webhookFirstAttemptAt";
    pub const WEBHOOK_LAST_ATTEMPT_AT: &str = "webhookLastAttemptAt";
    pub const WEBHOOK_NEXT_ATTEMPT_AT: &str = "webhookNextAttemptAt";
    pub const WEBHOOK_LAST_ERROR: &str = "webhookLastError";
    pub const CONSOLIDATION_ATTEMPTED: &str = "consolidationAttempted";
    pub const CONSOLIDATION_TX_ID: &str = "consolidationTxId";
    pub const CONSOLIDATION_ERROR: &str = "consolidationError";
}

/// Deterministic key names under the caller-supplied prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn job(&self, ticker: &str, payment_id: &str) -> String {
        format!("{}:deposit:{}:{}", self.prefix, ticker, payment_id)
    }

    pub fn job_pattern(&self, ticker: &str) -> String {
        format!("{}:deposit:{}:*", self.prefix, ticker)
    }

    pub fn status(&self, ticker: &str, payment_id: &str) -> String {
        format!("{}:transaction:status:{}:{}", self.prefix, ticker, payment_id)
    }

    pub fn seen(&self, tx_hash: &str) -> String {
        format!("{}:seen:{}", self.prefix, tx_hash)
    }

    pub fn ledger(&self, ticker: &str, tx_hash: &str) -> String {
        format!("{}:deposit:ledger:{}:{}", self.prefix, ticker, tx_hash)
    }

    /// paymentId component of a job key, when the key has the expected shape.
    pub fn payment_id_of_job_key<'a>(&self, ticker: &str, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&format!("{}:deposit:{}:", self.prefix, ticker))
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "CONFIRMING")]
    Confirming,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Confirming => "CONFIRMING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// One registered deposit, decoded from its KV hash.
#[derive(Debug, Clone, Default)]
pub struct JobRecord {
    pub ticker: String,
    pub address: String,
    pub payment_id: String,
    pub expected_amount: Option<String>,
    pub min_conf: u64,
    pub client_reference: Option<String>,
    pub created_at: i64,
    pub dynamic_min_conf_applied: bool,
    pub webhook_sent: bool,
    pub webhook_attempts: u64,
    pub webhook_first_attempt_at: Option<i64>,
    pub webhook_last_attempt_at: Option<i64>,
    pub webhook_next_attempt_at: Option<i64>,
    pub webhook_last_error: Option<String>,
    pub consolidation_attempted: bool,
    pub consolidation_tx_id: Option<String>,
    pub consolidation_error: Option<String>,
}

fn get_bool(map: &HashMap<String, String>, key: &str) -> bool {
    map.get(key).map(|v| v == "true" || v == "1").unwrap_or(false)
}

fn get_u64(map: &HashMap<String, String>, key: &str) -> Option<u64> {
    map.get(key).and_then(|v| v.parse().ok())
}

fn get_i64(map: &HashMap<String, String>, key: &str) -> Option<i64> {
    map.get(key).and_then(|v| v.parse().ok())
}

fn get_opt(map: &HashMap<String, String>, key: &str) -> Option<String> {
    map.get(key).filter(|v| !v.is_empty()).cloned()
}

impl JobRecord {
    pub fn from_fields(map: &HashMap<String, String>) -> Self {
        Self {
            ticker: map.get(field::TICKER).cloned().unwrap_or_default(),
            address: map.get(field::ADDRESS).cloned().unwrap_or_default(),
            payment_id: map.get(field::PAYMENT_ID).cloned().unwrap_or_default(),
            expected_amount: get_opt(map, field::EXPECTED_AMOUNT),
            min_conf: get_u64(map, field::MIN_CONF).unwrap_or(0),
            client_reference: get_opt(map, field::CLIENT_REFERENCE),
            created_at: get_i64(map, field::CREATED_AT).unwrap_or(0),
            dynamic_min_conf_applied: get_bool(map, field::DYNAMIC_MIN_CONF_APPLIED),
            webhook_sent: get_bool(map, field::WEBHOOK_SENT),
            webhook_attempts: get_u64(map, field::WEBHOOK_ATTEMPTS).unwrap_or(0),
            webhook_first_attempt_at: get_i64(map, field::WEBHOOK_FIRST_ATTEMPT_AT),
            webhook_last_attempt_at: get_i64(map, field::WEBHOOK_LAST_ATTEMPT_AT),
            webhook_next_attempt_at: get_i64(map, field::WEBHOOK_NEXT_ATTEMPT_AT),
            webhook_last_error: get_opt(map, field::WEBHOOK_LAST_ERROR),
            consolidation_attempted: get_bool(map, field::CONSOLIDATION_ATTEMPTED),
            consolidation_tx_id: get_opt(map, field::CONSOLIDATION_TX_ID),
            consolidation_error: get_opt(map, field::CONSOLIDATION_ERROR),
        }
    }

    /// Full field list for initial creation.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            (field::TICKER.to_string(), self.ticker.clone()),
            (field::ADDRESS.to_string(), self.address.clone()),
            (field::PAYMENT_ID.to_string(), self.payment_id.clone()),
            (field::MIN_CONF.to_string(), self.min_conf.to_string()),
            (field::CREATED_AT.to_string(), self.created_at.to_string()),
            (
                field::DYNAMIC_MIN_CONF_APPLIED.to_string(),
                self.dynamic_min_conf_applied.to_string(),
            ),
            (field::WEBHOOK_SENT.to_string(), self.webhook_sent.to_string()),
            (field::WEBHOOK_ATTEMPTS.to_string(), self.webhook_attempts.to_string()),
            (
                field::CONSOLIDATION_ATTEMPTED.to_string(),
                self.consolidation_attempted.to_string(),
            ),
        ];
        if let Some(v) = &self.expected_amount {
            fields.push((field::EXPECTED_AMOUNT.to_string(), v.clone()));
        }
        if let Some(v) = &self.client_reference {
            fields.push((field::CLIENT_REFERENCE.to_string(), v.clone()));
        }
        fields
    }

    /// A job is workable only when it still knows where to look.
    pub fn malformed(&self) -> bool {
        self.address.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub status: JobState,
    pub ticker: String,
    pub address: String,
    pub payment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_reference: Option<String>,
    pub confirmations: u64,
    pub required_confirmations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_amount_atomic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_amount_atomic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_atomic: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_error: Option<String>,
}

/// KV-backed store with the service TTLs baked in.
#[derive(Clone)]
pub struct JobStore {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    job_ttl_secs: u64,
    status_ttl_secs: u64,
    seen_ttl_secs: u64,
}

impl JobStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        job_ttl_secs: u64,
        status_ttl_secs: u64,
        seen_ttl_secs: u64,
    ) -> Self {
        Self { kv, keys, job_ttl_secs, status_ttl_secs, seen_ttl_secs }
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub async fn create_job(
        &self,
        job: &JobRecord,
        ttl_secs_override: Option<u64>,
    ) -> Result<String, KvError> {
        let key = self.keys.job(&job.ticker, &job.payment_id);
        // Re-registering a payment resets the record; stale retry fields
        // from an earlier registration must not leak into the new job.
        self.kv.del(&key).await?;
        self.kv.hset(&key, &job.to_fields()).await?;
        self.kv.expire(&key, ttl_secs_override.unwrap_or(self.job_ttl_secs)).await?;
        Ok(key)
    }

    pub async fn load_job(&self, key: &str) -> Result<Option<JobRecord>, KvError> {
        let map = self.kv.hgetall(key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        Ok(Some(JobRecord::from_fields(&map)))
    }

    pub async fn update_job(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        self.kv.hset(key, fields).await
    }

    pub async fn delete_job(&self, key: &str) -> Result<(), KvError> {
        self.kv.del(key).await
    }

    pub async fn scan_jobs(
        &self,
        ticker: &str,
        count: u64,
        cursor: &str,
    ) -> Result<(String, Vec<String>), KvError> {
        self.kv.scan(&self.keys.job_pattern(ticker), count, cursor).await
    }

    pub async fn write_status(&self, status: &StatusRecord) -> Result<(), KvError> {
        let key = self.keys.status(&status.ticker, &status.payment_id);
        let json = serde_json::to_value(status)
            .map_err(|e| KvError::Protocol(format!("encode status: {e}")))?;
        crate::kv::set_json(self.kv.as_ref(), &key, &json, Some(self.status_ttl_secs)).await
    }

    /// Parse failures read as absent: the job continues under its KV truth.
    pub async fn load_status(
        &self,
        ticker: &str,
        payment_id: &str,
    ) -> Result<Option<StatusRecord>, KvError> {
        let key = self.keys.status(ticker, payment_id);
        let value = crate::kv::get_json(self.kv.as_ref(), &key).await?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    pub async fn mark_seen(&self, tx_hash: &str) -> Result<(), KvError> {
        self.kv.set(&self.keys.seen(tx_hash), "1", Some(self.seen_ttl_secs)).await
    }

    pub async fn seen(&self, tx_hash: &str) -> Result<bool, KvError> {
        self.kv.exists(&self.keys.seen(tx_hash)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    #[test]
    fn keys_are_deterministic() {
        let keys = Keys::new("zano");
        assert_eq!(keys.job("zano", "pid1"), "zano:deposit:zano:pid1");
        assert_eq!(keys.status("fusd", "p"), "zano:transaction:status:fusd:p");
        assert_eq!(keys.seen("H"), "zano:seen:H");
        assert_eq!(keys.ledger("zano", "H"), "zano:deposit:ledger:zano:H");
        assert_eq!(keys.job_pattern("zano"), "zano:deposit:zano:*");
        assert_eq!(keys.payment_id_of_job_key("zano", "zano:deposit:zano:pid1"), Some("pid1"));
        assert_eq!(keys.payment_id_of_job_key("zano", "zano:deposit:zano:"), None);
    }

    #[test]
    fn job_record_round_trips_through_fields() {
        let job = JobRecord {
            ticker: "zano".into(),
            address: "A".into(),
            payment_id: "pid1".into(),
            expected_amount: Some("60".into()),
            min_conf: 3,
            client_reference: Some("r1".into()),
            created_at: 1_700_000_000_000,
            ..Default::default()
        };
        let map: HashMap<String, String> = job.to_fields().into_iter().collect();
        let back = JobRecord::from_fields(&map);
        assert_eq!(back.ticker, "zano");
        assert_eq!(back.payment_id, "pid1");
        assert_eq!(back.min_conf, 3);
        assert_eq!(back.expected_amount.as_deref(), Some("60"));
        assert!(!back.webhook_sent);
        assert!(!back.malformed());
    }

    #[test]
    fn missing_address_is_malformed() {
        let map = HashMap::from([(field::PAYMENT_ID.to_string(), "p".to_string())]);
        assert!(JobRecord::from_fields(&map).malformed());
    }

    #[tokio::test]
    async fn status_round_trips_and_bad_json_reads_as_absent() {
        let kv = Arc::new(MemoryKv::new());
        let store =
            JobStore::new(kv.clone(), Keys::new("zano"), 86_400, 604_800, 14_400);
        let status = StatusRecord {
            status: JobState::Pending,
            ticker: "zano".into(),
            address: "A".into(),
            payment_id: "pid1".into(),
            client_reference: Some("r1".into()),
            confirmations: 0,
            required_confirmations: 3,
            hash: None,
            paid_amount: None,
            paid_amount_atomic: None,
            effective_amount: None,
            effective_amount_atomic: None,
            fee_atomic: None,
            created_at: 1,
            updated_at: 1,
            webhook_error: None,
        };
        store.write_status(&status).await.unwrap();
        let back = store.load_status("zano", "pid1").await.unwrap().unwrap();
        assert_eq!(back.status, JobState::Pending);
        assert_eq!(back.required_confirmations, 3);

        kv.set("zano:transaction:status:zano:broken", "{not json", None).await.unwrap();
        assert!(store.load_status("zano", "broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seen_guard_round_trips() {
        let kv = Arc::new(MemoryKv::new());
        let store = JobStore::new(kv, Keys::new("zano"), 86_400, 604_800, 14_400);
        assert!(!store.seen("H").await.unwrap());
        store.mark_seen("H").await.unwrap();
        assert!(store.seen("H").await.unwrap());
    }
}
