use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use zano_settler::api::{self, AppContext};
use zano_settler::config::Config;
use zano_settler::kv::{KvStore, RestKv};
use zano_settler::ledger::LedgerSink;
use zano_settler::logging;
use zano_settler::machine::MachineDeps;
use zano_settler::store::{JobStore, Keys};
use zano_settler::wallet_rpc::WalletRpc;
use zano_settler::watcher::{Watcher, WatcherState};
use zano_settler::webhook::WebhookDispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(Config::from_env());
    logging::init(&cfg.log_level, cfg.log_error_file.as_deref());
    info!(version = env!("CARGO_PKG_VERSION"), "zano-settler starting");

    let keys = Keys::new(&cfg.key_prefix);
    let kv: Option<Arc<dyn KvStore>> = match (&cfg.kv_url, &cfg.kv_token) {
        (Some(url), Some(token)) => Some(Arc::new(RestKv::new(url, token, 10_000)?)),
        _ => None,
    };
    let store = kv.clone().map(|kv| {
        JobStore::new(kv, keys.clone(), cfg.job_ttl_secs, cfg.status_ttl_secs, cfg.seen_ttl_secs)
    });
    let rpc = match &cfg.wallet_rpc_url {
        Some(url) => Some(Arc::new(WalletRpc::new(
            url,
            cfg.wallet_rpc_user.clone(),
            cfg.wallet_rpc_pass.clone(),
            cfg.wallet_rpc_timeout_ms,
        )?)),
        None => None,
    };

    let watcher_state = Arc::new(WatcherState::default());
    let running = Arc::new(AtomicBool::new(true));

    if let Some(missing) = cfg.watcher_configured() {
        info!(missing, "watcher not configured; serving http surface only");
    } else if let (Some(store), Some(rpc), Some(secret)) =
        (store.clone(), rpc.clone(), cfg.webhook_secret.clone())
    {
        let dispatcher = Arc::new(WebhookDispatcher::new(&secret, cfg.webhook_timeout_ms)?);
        let ledger = Arc::new(LedgerSink::from_config(&cfg.ledger, kv.clone(), &keys)?);
        let deps = MachineDeps { cfg: cfg.clone(), store, rpc, dispatcher, ledger };
        let watcher = Watcher::new(deps, running.clone(), watcher_state.clone());
        tokio::spawn(watcher.run());
    }

    let ctx = Arc::new(AppContext::new(cfg.clone(), store, rpc, watcher_state));
    let app = api::router(ctx);
    let listener = tokio::net::TcpListener::bind(&cfg.bind).await?;
    info!(bind = %cfg.bind, "http surface listening");

    let shutdown_running = running.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            // The watcher finishes its in-flight job, then its loop exits.
            shutdown_running.store(false, Ordering::SeqCst);
            info!("shutdown signal received; finishing in-flight work");
        })
        .await?;
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
