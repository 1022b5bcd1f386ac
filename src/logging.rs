//! Tracing setup: console output filtered by `ZANO_LOG`/`RUST_LOG`, plus an
//! optional WARN+ tee into an append-only file for deployments that page on
//! the error log.

use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub fn init(default_level: &str, error_file: Option<&str>) {
    let filter =
        EnvFilter::try_new(default_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let error_layer = error_file.and_then(|path| {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_filter(LevelFilter::WARN),
            ),
            Err(e) => {
                eprintln!("failed to open error log {path}: {e}");
                None
            }
        }
    });

    // try_init so a second call (tests) is a no-op instead of a panic.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_filter(filter))
        .with(error_layer)
        .try_init();
}
