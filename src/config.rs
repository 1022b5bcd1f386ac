//! Service configuration.
//!
//! Everything is resolved from process environment once at startup into an
//! immutable [`Config`] that is passed explicitly into the scheduler, the
//! state machine, and the clients. Per-ticker options use upper-cased ticker
//! suffixes, e.g. `ZANO_DECIMALS_FUSD=12`, `ZANO_ASSET_ID_FUSD=<hex>`.

use std::collections::HashMap;

pub const DEFAULT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_SCAN_COUNT: u64 = 100;
pub const DEFAULT_ERROR_BACKOFF_MS: u64 = 30_000;
pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 20 * 60 * 1000;
pub const DEFAULT_RETRY_WINDOW_MS: i64 = 2 * 60 * 60 * 1000;
pub const DEFAULT_SEEN_TTL_SECS: u64 = 4 * 3600;
pub const DEFAULT_JOB_TTL_SECS: u64 = 24 * 3600;
pub const DEFAULT_STATUS_TTL_SECS: u64 = 7 * 24 * 3600;
pub const DEFAULT_DECIMALS: u32 = 12;
pub const DEFAULT_MIN_CONFIRMATIONS: u64 = 3;
pub const DEFAULT_CONSOLIDATION_MIXIN: u64 = 3;
pub const DEFAULT_CONSOLIDATION_PRIORITY: u64 = 0;
/// 0.01 ZANO at 12 decimals, the wallet's customary flat fee.
pub const DEFAULT_CONSOLIDATION_FEE_ATOMIC: u128 = 10_000_000_000;

/// Exponential backoff shape for webhook retries.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_BACKOFF_BASE_MS,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_ms: DEFAULT_BACKOFF_MAX_MS,
            jitter: true,
        }
    }
}

/// Sweep rules for one ticker. `mixin` and `priority` keep the wallet's
/// customary defaults but remain overridable per deployment.
#[derive(Debug, Clone)]
pub struct ConsolidationRule {
    pub enabled: bool,
    pub address: String,
    pub fee_atomic: u128,
    /// Confirmations required before sweeping; defaults to the job's
    /// effective deposit threshold when unset.
    pub min_confirmations: Option<u64>,
    pub mixin: u64,
    pub priority: u64,
}

/// Per-ticker settings.
#[derive(Debug, Clone)]
pub struct TickerConfig {
    pub ticker: String,
    pub decimals: u32,
    /// Initial threshold before the dynamic policy is applied.
    pub min_confirmations: u64,
    /// Non-empty => asset mode; empty => base-coin mode.
    pub asset_id: Option<String>,
    /// Per-ticker webhook target; falls back to the service default.
    pub webhook_url: Option<String>,
    pub consolidation: Option<ConsolidationRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMode {
    Off,
    Kv,
    Disk,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub mode: LedgerMode,
    pub dir: String,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub tickers: Vec<TickerConfig>,
    pub interval_ms: u64,
    pub scan_count: u64,
    pub error_backoff_ms: u64,
    pub key_prefix: String,

    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_timeout_ms: u64,
    pub backoff: BackoffConfig,
    /// 0 = unlimited attempts.
    pub webhook_max_attempts: u64,
    pub webhook_max_retry_window_ms: i64,

    pub seen_ttl_secs: u64,
    pub job_ttl_secs: u64,
    pub status_ttl_secs: u64,

    pub kv_url: Option<String>,
    pub kv_token: Option<String>,

    pub wallet_rpc_url: Option<String>,
    pub wallet_rpc_user: Option<String>,
    pub wallet_rpc_pass: Option<String>,
    pub wallet_rpc_timeout_ms: u64,

    pub api_key: Option<String>,
    pub callback_secret: Option<String>,
    pub bind: String,

    pub ledger: LedgerConfig,
    pub log_level: String,
    pub log_error_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            interval_ms: DEFAULT_INTERVAL_MS,
            scan_count: DEFAULT_SCAN_COUNT,
            error_backoff_ms: DEFAULT_ERROR_BACKOFF_MS,
            key_prefix: "zano".to_string(),
            webhook_url: None,
            webhook_secret: None,
            webhook_timeout_ms: DEFAULT_WEBHOOK_TIMEOUT_MS,
            backoff: BackoffConfig::default(),
            webhook_max_attempts: 0,
            webhook_max_retry_window_ms: DEFAULT_RETRY_WINDOW_MS,
            seen_ttl_secs: DEFAULT_SEEN_TTL_SECS,
            job_ttl_secs: DEFAULT_JOB_TTL_SECS,
            status_ttl_secs: DEFAULT_STATUS_TTL_SECS,
            kv_url: None,
            kv_token: None,
            wallet_rpc_url: None,
            wallet_rpc_user: None,
            wallet_rpc_pass: None,
            wallet_rpc_timeout_ms: 8_000,
            api_key: None,
            callback_secret: None,
            bind: "0.0.0.0:8787".to_string(),
            ledger: LedgerConfig { mode: LedgerMode::Off, dir: "deposit-ledger".to_string(), ttl_secs: None },
            log_level: "info".to_string(),
            log_error_file: None,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_u64(key: &str, default_: u64) -> u64 {
    env_str(key).and_then(|s| s.parse().ok()).unwrap_or(default_)
}

fn env_i64(key: &str, default_: i64) -> i64 {
    env_str(key).and_then(|s| s.parse().ok()).unwrap_or(default_)
}

fn env_f64(key: &str, default_: f64) -> f64 {
    env_str(key).and_then(|s| s.parse().ok()).unwrap_or(default_)
}

fn env_bool(key: &str, default_: bool) -> bool {
    match env_str(key) {
        Some(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        None => default_,
    }
}

fn ticker_suffix(ticker: &str) -> String {
    ticker.to_uppercase().replace(|c: char| !c.is_ascii_alphanumeric(), "_")
}

fn resolve_ticker(ticker: &str) -> TickerConfig {
    let t = ticker_suffix(ticker);
    let consolidation_address = env_str(&format!("ZANO_CONSOLIDATION_{t}_ADDRESS"));
    let consolidation_enabled = env_bool(&format!("ZANO_CONSOLIDATION_{t}_ENABLED"), false);
    let consolidation = consolidation_address
        .filter(|_| consolidation_enabled)
        .map(|address| ConsolidationRule {
            enabled: true,
            address,
            fee_atomic: env_str(&format!("ZANO_CONSOLIDATION_{t}_FEE_ATOMIC"))
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_CONSOLIDATION_FEE_ATOMIC),
            min_confirmations: env_str(&format!("ZANO_CONSOLIDATION_{t}_MIN_CONF"))
                .and_then(|s| s.parse().ok()),
            mixin: env_u64(&format!("ZANO_CONSOLIDATION_{t}_MIXIN"), DEFAULT_CONSOLIDATION_MIXIN),
            priority: env_u64(
                &format!("ZANO_CONSOLIDATION_{t}_PRIORITY"),
                DEFAULT_CONSOLIDATION_PRIORITY,
            ),
        });

    TickerConfig {
        ticker: ticker.to_lowercase(),
        decimals: env_u64(&format!("ZANO_DECIMALS_{t}"), DEFAULT_DECIMALS as u64).min(30) as u32,
        min_confirmations: env_u64(&format!("ZANO_MIN_CONF_{t}"), DEFAULT_MIN_CONFIRMATIONS),
        asset_id: env_str(&format!("ZANO_ASSET_ID_{t}")),
        webhook_url: env_str(&format!("ZANO_WEBHOOK_URL_{t}")),
        consolidation,
    }
}

impl Config {
    /// Resolve the full configuration from process environment.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        let tickers: Vec<TickerConfig> = env_str("ZANO_TICKERS")
            .unwrap_or_else(|| "zano".to_string())
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(resolve_ticker)
            .collect();

        let ledger_mode = match env_str("ZANO_LEDGER_MODE").as_deref() {
            Some("kv") => LedgerMode::Kv,
            Some("disk") => LedgerMode::Disk,
            _ => LedgerMode::Off,
        };

        Self {
            tickers,
            interval_ms: env_u64("ZANO_INTERVAL_MS", defaults.interval_ms),
            scan_count: env_u64("ZANO_SCAN_COUNT", defaults.scan_count).max(1),
            error_backoff_ms: env_u64("ZANO_ERROR_BACKOFF_MS", defaults.error_backoff_ms),
            key_prefix: env_str("ZANO_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            webhook_url: env_str("ZANO_WEBHOOK_URL"),
            webhook_secret: env_str("ZANO_WEBHOOK_SECRET"),
            webhook_timeout_ms: env_u64("ZANO_WEBHOOK_TIMEOUT_MS", defaults.webhook_timeout_ms),
            backoff: BackoffConfig {
                base_ms: env_u64("ZANO_WEBHOOK_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
                factor: env_f64("ZANO_WEBHOOK_BACKOFF_FACTOR", DEFAULT_BACKOFF_FACTOR),
                max_ms: env_u64("ZANO_WEBHOOK_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS),
                jitter: env_bool("ZANO_WEBHOOK_BACKOFF_JITTER", true),
            },
            webhook_max_attempts: env_u64("ZANO_WEBHOOK_MAX_ATTEMPTS", 0),
            webhook_max_retry_window_ms: env_i64(
                "ZANO_WEBHOOK_MAX_RETRY_WINDOW_MS",
                DEFAULT_RETRY_WINDOW_MS,
            ),
            seen_ttl_secs: env_u64("ZANO_SEEN_TTL_SECS", defaults.seen_ttl_secs),
            job_ttl_secs: env_u64("ZANO_JOB_TTL_SECS", defaults.job_ttl_secs),
            status_ttl_secs: env_u64("ZANO_STATUS_TTL_SECS", defaults.status_ttl_secs),
            kv_url: env_str("ZANO_KV_URL"),
            kv_token: env_str("ZANO_KV_TOKEN"),
            wallet_rpc_url: env_str("ZANO_WALLET_RPC_URL"),
            wallet_rpc_user: env_str("ZANO_WALLET_RPC_USER"),
            wallet_rpc_pass: env_str("ZANO_WALLET_RPC_PASS"),
            wallet_rpc_timeout_ms: env_u64("ZANO_WALLET_RPC_TIMEOUT_MS", 8_000).max(8_000),
            api_key: env_str("ZANO_API_KEY"),
            callback_secret: env_str("ZANO_CALLBACK_SECRET"),
            bind: env_str("ZANO_BIND").unwrap_or(defaults.bind),
            ledger: LedgerConfig {
                mode: ledger_mode,
                dir: env_str("ZANO_LEDGER_DIR").unwrap_or(defaults.ledger.dir),
                ttl_secs: env_str("ZANO_LEDGER_TTL_SECS").and_then(|s| s.parse().ok()),
            },
            log_level: env_str("ZANO_LOG")
                .or_else(|| env_str("RUST_LOG"))
                .unwrap_or(defaults.log_level),
            log_error_file: env_str("ZANO_LOG_ERROR_FILE"),
        }
    }

    pub fn ticker(&self, ticker: &str) -> Option<&TickerConfig> {
        self.tickers.iter().find(|t| t.ticker.eq_ignore_ascii_case(ticker))
    }

    /// Webhook target for a ticker, honoring the per-ticker override.
    pub fn webhook_url_for(&self, ticker: &TickerConfig) -> Option<String> {
        ticker.webhook_url.clone().or_else(|| self.webhook_url.clone())
    }

    /// Status responses are cached in-process for `min(5s, intervalMs)`.
    pub fn status_cache_ttl_ms(&self) -> u64 {
        self.interval_ms.min(5_000)
    }

    /// Whether the watcher has everything it needs to start. A partial
    /// configuration logs one info line and the watcher stays down; HTTP
    /// endpoints that need the missing pieces answer 503.
    pub fn watcher_configured(&self) -> Option<&'static str> {
        if self.kv_url.is_none() || self.kv_token.is_none() {
            return Some("kv url/token");
        }
        if self.wallet_rpc_url.is_none() {
            return Some("wallet rpc url");
        }
        if self.webhook_secret.is_none() {
            return Some("webhook secret");
        }
        let all_tickers_covered =
            self.webhook_url.is_some() || self.tickers.iter().all(|t| t.webhook_url.is_some());
        if !all_tickers_covered {
            return Some("webhook url");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = Config::default();
        assert_eq!(cfg.interval_ms, 15_000);
        assert_eq!(cfg.scan_count, 100);
        assert_eq!(cfg.error_backoff_ms, 30_000);
        assert_eq!(cfg.seen_ttl_secs, 4 * 3600);
        assert_eq!(cfg.job_ttl_secs, 24 * 3600);
        assert_eq!(cfg.status_ttl_secs, 7 * 24 * 3600);
        assert_eq!(cfg.webhook_max_retry_window_ms, 7_200_000);
        assert_eq!(cfg.key_prefix, "zano");
        assert!(cfg.backoff.jitter);
    }

    #[test]
    fn status_cache_ttl_is_capped() {
        let mut cfg = Config::default();
        assert_eq!(cfg.status_cache_ttl_ms(), 5_000);
        cfg.interval_ms = 2_000;
        assert_eq!(cfg.status_cache_ttl_ms(), 2_000);
    }

    #[test]
    fn watcher_configured_reports_first_gap() {
        let mut cfg = Config::default();
        cfg.tickers.push(TickerConfig {
            ticker: "zano".into(),
            decimals: DEFAULT_DECIMALS,
            min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            asset_id: None,
            webhook_url: None,
            consolidation: None,
        });
        assert_eq!(cfg.watcher_configured(), Some("kv url/token"));
        cfg.kv_url = Some("https://kv.example".into());
        cfg.kv_token = Some("tok".into());
        assert_eq!(cfg.watcher_configured(), Some("wallet rpc url"));
        cfg.wallet_rpc_url = Some("http://127.0.0.1:11211".into());
        cfg.webhook_secret = Some("s".into());
        assert_eq!(cfg.watcher_configured(), Some("webhook url"));

        // A per-ticker target satisfies the requirement without a default.
        cfg.tickers[0].webhook_url = Some("https://merchant.example/hook".into());
        assert_eq!(cfg.watcher_configured(), None);
        cfg.tickers[0].webhook_url = None;
        cfg.webhook_url = Some("https://merchant.example/hook".into());
        assert_eq!(cfg.watcher_configured(), None);
    }
}
