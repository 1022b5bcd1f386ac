//! REST KV client against a mock command-array store.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use zano_settler::errors::KvError;
use zano_settler::kv::{KvStore, RestKv};

#[derive(Default)]
struct MockStore {
    strings: Mutex<HashMap<String, String>>,
    hashes: Mutex<HashMap<String, Vec<(String, String)>>>,
    fail_next: Mutex<bool>,
}

async fn handle(
    State(state): State<Arc<MockStore>>,
    Json(cmd): Json<Vec<String>>,
) -> Result<Json<Value>, StatusCode> {
    if std::mem::take(&mut *state.fail_next.lock()) {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    let name = cmd.first().map(String::as_str).unwrap_or("");
    let result = match name {
        "SET" => {
            state.strings.lock().insert(cmd[1].clone(), cmd[2].clone());
            json!("OK")
        }
        "GET" => state
            .strings
            .lock()
            .get(&cmd[1])
            .map(|v| json!(v))
            .unwrap_or(Value::Null),
        "EXISTS" => {
            let n = state.strings.lock().contains_key(&cmd[1]) as u64
                + state.hashes.lock().contains_key(&cmd[1]) as u64;
            json!(n)
        }
        "DEL" => {
            state.strings.lock().remove(&cmd[1]);
            state.hashes.lock().remove(&cmd[1]);
            json!(1)
        }
        "EXPIRE" => json!(1),
        "HSET" => {
            let mut hashes = state.hashes.lock();
            let entry = hashes.entry(cmd[1].clone()).or_default();
            for pair in cmd[2..].chunks(2) {
                entry.retain(|(f, _)| f != &pair[0]);
                entry.push((pair[0].clone(), pair[1].clone()));
            }
            json!(1)
        }
        "HGETALL" => {
            // Flat [field, value, ...] reply, the wire shape the client
            // has to reassemble.
            let hashes = state.hashes.lock();
            let flat: Vec<String> = hashes
                .get(&cmd[1])
                .map(|fields| {
                    fields.iter().flat_map(|(f, v)| [f.clone(), v.clone()]).collect()
                })
                .unwrap_or_default();
            json!(flat)
        }
        "SCAN" => {
            // Two keys per page; numeric cursor encoded as a JSON number to
            // prove the client round-trips it as a string anyway.
            let strings = state.strings.lock();
            let mut keys: Vec<&String> = strings.keys().collect();
            keys.sort();
            let start: usize = cmd[1].parse().unwrap_or(0);
            let end = (start + 2).min(keys.len());
            let page: Vec<&String> = keys[start..end].to_vec();
            let next = if end >= keys.len() { json!("0") } else { json!(end) };
            json!([next, page])
        }
        _ => Value::Null,
    };
    Ok(Json(json!({ "result": result })))
}

async fn spawn_store() -> (String, Arc<MockStore>) {
    let state = Arc::new(MockStore::default());
    let app = Router::new().route("/", post(handle)).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn string_and_hash_operations_round_trip() {
    let (url, _state) = spawn_store().await;
    let kv = RestKv::new(&url, "token", 5_000).unwrap();

    kv.set("k", "v", Some(60)).await.unwrap();
    assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
    assert!(kv.exists("k").await.unwrap());
    assert_eq!(kv.get("missing").await.unwrap(), None);

    kv.hset("h", &[("a".into(), "1".into()), ("b".into(), "2".into())]).await.unwrap();
    let all = kv.hgetall("h").await.unwrap();
    assert_eq!(all.get("a").map(String::as_str), Some("1"));
    assert_eq!(all.get("b").map(String::as_str), Some("2"));
    assert!(kv.hgetall("missing").await.unwrap().is_empty());

    kv.del("k").await.unwrap();
    assert!(!kv.exists("k").await.unwrap());
}

#[tokio::test]
async fn scan_round_trips_numeric_cursors_as_strings() {
    let (url, _state) = spawn_store().await;
    let kv = RestKv::new(&url, "token", 5_000).unwrap();
    for i in 0..5 {
        kv.set(&format!("key{i}"), "x", None).await.unwrap();
    }

    let mut cursor = "0".to_string();
    let mut seen = Vec::new();
    loop {
        let (next, keys) = kv.scan("key*", 2, &cursor).await.unwrap();
        seen.extend(keys);
        if next == "0" {
            break;
        }
        cursor = next;
    }
    assert_eq!(seen.len(), 5);
}

#[tokio::test]
async fn server_errors_are_transient() {
    let (url, state) = spawn_store().await;
    let kv = RestKv::new(&url, "token", 5_000).unwrap();

    *state.fail_next.lock() = true;
    match kv.get("k").await {
        Err(KvError::Transient(_)) => {}
        other => panic!("expected transient error, got {other:?}"),
    }
    // Recovered on the next call.
    assert_eq!(kv.get("k").await.unwrap(), None);
}
