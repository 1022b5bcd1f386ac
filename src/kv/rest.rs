//! REST-backed key-value client.
//!
//! The reference store exposes each operation as an HTTP POST of a JSON
//! command array with a bearer token, answering `{"result": ...}`. Network
//! failures and 5xx replies are transient (the tick aborts and retries next
//! interval); anything else we cannot interpret is a protocol error.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use crate::errors::KvError;

use super::KvStore;

pub struct RestKv {
    url: String,
    token: String,
    http: Client,
}

impl RestKv {
    pub fn new(url: &str, token: &str, timeout_ms: u64) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?;
        Ok(Self { url: url.trim_end_matches('/').to_string(), token: token.to_string(), http })
    }

    async fn command(&self, cmd: Vec<String>) -> Result<Value, KvError> {
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&cmd)
            .send()
            .await
            .map_err(|e| KvError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(KvError::Transient(format!("kv replied {status}")));
        }
        if !status.is_success() {
            return Err(KvError::Protocol(format!("kv replied {status}")));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| KvError::Protocol(format!("kv reply not json: {e}")))?;
        if let Some(err) = body.get("error") {
            if !err.is_null() {
                return Err(KvError::Protocol(format!("kv error: {err}")));
            }
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl KvStore for RestKv {
    async fn scan(
        &self,
        pattern: &str,
        count: u64,
        cursor: &str,
    ) -> Result<(String, Vec<String>), KvError> {
        let result = self
            .command(vec![
                "SCAN".into(),
                cursor.to_string(),
                "MATCH".into(),
                pattern.to_string(),
                "COUNT".into(),
                count.to_string(),
            ])
            .await?;
        let pair = result
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| KvError::Protocol(format!("unexpected scan reply: {result}")))?;
        // The cursor must round-trip as a string even when the store encodes
        // it as a number.
        let next = as_string(&pair[0])
            .ok_or_else(|| KvError::Protocol("scan cursor not string-like".into()))?;
        let keys = pair[1]
            .as_array()
            .map(|a| a.iter().filter_map(as_string).collect())
            .unwrap_or_default();
        Ok((next, keys))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let result = self.command(vec!["HGETALL".into(), key.to_string()]).await?;
        let mut out = HashMap::new();
        match result {
            // Flat [field, value, field, value] reply.
            Value::Array(items) => {
                let mut it = items.into_iter();
                while let (Some(f), Some(v)) = (it.next(), it.next()) {
                    if let (Some(f), Some(v)) = (as_string(&f), as_string(&v)) {
                        out.insert(f, v);
                    }
                }
            }
            Value::Object(map) => {
                for (f, v) in map {
                    if let Some(v) = as_string(&v) {
                        out.insert(f, v);
                    }
                }
            }
            Value::Null => {}
            other => {
                return Err(KvError::Protocol(format!("unexpected hgetall reply: {other}")))
            }
        }
        Ok(out)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = vec!["HSET".to_string(), key.to_string()];
        for (f, v) in fields {
            cmd.push(f.clone());
            cmd.push(v.clone());
        }
        self.command(cmd).await.map(|_| ())
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.command(vec!["EXPIRE".into(), key.to_string(), ttl_secs.to_string()])
            .await
            .map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let result = self.command(vec!["GET".into(), key.to_string()]).await?;
        Ok(match result {
            Value::Null => None,
            other => as_string(&other),
        })
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), KvError> {
        let mut cmd = vec!["SET".to_string(), key.to_string(), value.to_string()];
        if let Some(ttl) = ttl_secs {
            cmd.push("EX".into());
            cmd.push(ttl.to_string());
        }
        self.command(cmd).await.map(|_| ())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let result = self.command(vec!["EXISTS".into(), key.to_string()]).await?;
        Ok(result.as_u64().unwrap_or(0) > 0)
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.command(vec!["DEL".into(), key.to_string()]).await.map(|_| ())
    }
}
