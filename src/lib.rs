//! Deposit detection and settlement for the Zano/FUSD wallet family.
//!
//! A merchant backend registers an expected deposit; the watcher polls the
//! wallet JSON-RPC, tracks per-transfer confirmations, optionally sweeps the
//! funds to a treasury address, and delivers one signed webhook per confirmed
//! deposit. Durable state lives in a shared key-value store so the service
//! survives restarts without double-crediting.

pub mod amount;
pub mod api;
pub mod config;
pub mod errors;
pub mod kv;
pub mod ledger;
pub mod logging;
pub mod machine;
pub mod matcher;
pub mod policy;
pub mod store;
pub mod util;
pub mod wallet_rpc;
pub mod watcher;
pub mod webhook;
