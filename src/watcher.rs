//! Scheduler: the polling loop that drives the state machine.
//!
//! Round-robins over the enabled tickers in configured order, scanning each
//! ticker's jobs with cursored paging and handing every key to the state
//! machine. RPC failures back the whole ticker off; KV failures abort the
//! tick. Strictly sequential: one job at a time, tickers one after another,
//! which is what makes the single-writer contract hold.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use crate::config::TickerConfig;
use crate::errors::WatchError;
use crate::machine::{process_job, MachineDeps};

const MIN_SLEEP_MS: u64 = 1_000;

/// Operator-visible snapshot, served by `/api/watcher/status`.
#[derive(Default)]
pub struct WatcherState {
    pub backoff_until_ms: Mutex<HashMap<String, i64>>,
    pub last_tick_at_ms: Mutex<Option<i64>>,
    pub last_errors: Mutex<HashMap<String, String>>,
}

pub struct Watcher {
    deps: MachineDeps,
    running: Arc<AtomicBool>,
    state: Arc<WatcherState>,
}

impl Watcher {
    pub fn new(deps: MachineDeps, running: Arc<AtomicBool>, state: Arc<WatcherState>) -> Self {
        Self { deps, running, state }
    }

    pub async fn run(self) {
        tracing::info!(
            tickers = ?self.deps.cfg.tickers.iter().map(|t| t.ticker.as_str()).collect::<Vec<_>>(),
            interval_ms = self.deps.cfg.interval_ms,
            "deposit watcher started"
        );
        while self.running.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.tick().await;
            let elapsed = started.elapsed().as_millis() as u64;
            let sleep_ms = self.deps.cfg.interval_ms.saturating_sub(elapsed).max(MIN_SLEEP_MS);
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
        tracing::info!("deposit watcher stopped");
    }

    /// One full pass over every enabled ticker.
    pub async fn tick(&self) {
        *self.state.last_tick_at_ms.lock() = Some(Utc::now().timestamp_millis());
        for ticker_cfg in &self.deps.cfg.tickers {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let now = Utc::now().timestamp_millis();
            let deadline = self
                .state
                .backoff_until_ms
                .lock()
                .get(&ticker_cfg.ticker)
                .copied()
                .unwrap_or(0);
            if deadline > now {
                tracing::debug!(ticker = %ticker_cfg.ticker, until = deadline, "ticker in backoff");
                continue;
            }
            match self.run_ticker(ticker_cfg).await {
                Ok(()) => {
                    self.state.last_errors.lock().remove(&ticker_cfg.ticker);
                }
                Err(WatchError::Rpc(e)) => {
                    let until = now + self.deps.cfg.error_backoff_ms as i64;
                    tracing::warn!(
                        ticker = %ticker_cfg.ticker,
                        error = %e,
                        backoff_ms = self.deps.cfg.error_backoff_ms,
                        "rpc failure; backing off ticker"
                    );
                    self.state.backoff_until_ms.lock().insert(ticker_cfg.ticker.clone(), until);
                    self.state.last_errors.lock().insert(ticker_cfg.ticker.clone(), e.to_string());
                }
                Err(WatchError::Kv(e)) => {
                    // No partial state was written; retry the whole pass
                    // next interval.
                    tracing::warn!(error = %e, "kv failure; aborting tick");
                    self.state
                        .last_errors
                        .lock()
                        .insert(ticker_cfg.ticker.clone(), e.to_string());
                    return;
                }
            }
        }
    }

    async fn run_ticker(&self, ticker_cfg: &TickerConfig) -> Result<(), WatchError> {
        // One wallet-info call per ticker pass converts block heights into
        // confirmation counts for every job in the scan.
        let info = self.deps.rpc.get_wallet_info().await?;
        let mut cursor = "0".to_string();
        loop {
            let (next, keys) = self
                .deps
                .store
                .scan_jobs(&ticker_cfg.ticker, self.deps.cfg.scan_count, &cursor)
                .await?;
            for key in keys {
                // RPC trouble is almost never job-specific: it propagates
                // out of the ticker so the whole thing cools down. Job-level
                // problems were already logged and recorded by the machine.
                process_job(&self.deps, ticker_cfg, info.current_height, &key).await?;
                if !self.running.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }
            if next == "0" {
                break;
            }
            cursor = next;
        }
        Ok(())
    }
}
