//! Error taxonomy shared across the service.

use thiserror::Error;

/// Wallet RPC (or status API) failure: transport error, HTTP >= 400, or a
/// JSON-RPC `error` object in the reply. The scheduler treats this as a
/// signal to back off the whole ticker.
#[derive(Debug, Clone, Error)]
#[error("wallet rpc error{}: {message}", .status.map(|s| format!(" (http {s})")).unwrap_or_default())]
pub struct RpcError {
    /// HTTP status when the transport produced one; `None` on network errors.
    pub status: Option<u16>,
    pub message: String,
}

impl RpcError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into() }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), message: message.into() }
    }
}

/// Key-value store failure. Transient errors (network, 5xx) abort the
/// current tick; protocol errors indicate a reply we could not interpret.
#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("kv transient error: {0}")]
    Transient(String),
    #[error("kv protocol error: {0}")]
    Protocol(String),
}

/// Errors surfaced by one state-machine pass over a job. Only these two
/// escape the machine; everything else is recorded on the job and logged.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Kv(#[from] KvError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_error_display_includes_status() {
        let e = RpcError::http(502, "bad gateway");
        assert!(e.to_string().contains("502"));
        let e = RpcError::transport("connect refused");
        assert!(!e.to_string().contains("http"));
    }
}
