// tests/common/mod.rs
//
// Shared helpers for the integration tests: logging setup and a fake esub
// node that serves the HTTP/WebSocket protocol on top of a `MemoryHub`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use esub::{ClientConfig, EsubClient, EsubError, Key, MemoryHub, PrepMessage, Token};

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = env_logger::builder().is_test(true).try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}

pub fn key(k: &str) -> Key {
    Key::new(k).unwrap()
}

/// Yield until `n` one-shot waiters sit on `key` in `hub`.
pub async fn wait_for_waiters(hub: &MemoryHub, k: &str, n: usize) {
    // ---
    let k = key(k);
    while hub.waiting(&k) < n {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
}

/// A fake esub node listening on localhost.
pub struct FakeNode {
    // ---
    pub addr: SocketAddr,
    pub hub: Arc<MemoryHub>,
    task: JoinHandle<()>,
}

impl FakeNode {
    // ---

    pub async fn start(hub: Arc<MemoryHub>) -> Self {
        // ---
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let router = Router::new()
            .route("/sub/{key}", get(sub))
            .route("/rep/{key}", post(rep))
            .route("/info", get(info))
            .route("/psub/{key}", get(psub))
            .route("/prep", get(prep))
            .with_state(hub.clone());

        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("fake node should run");
        });

        Self { addr, hub, task }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::with_endpoint("127.0.0.1", self.addr.port())
    }

    pub async fn client(&self, config: ClientConfig) -> EsubClient {
        EsubClient::new(config).await.unwrap()
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type Params = Query<HashMap<String, String>>;

fn token(params: &Params) -> Option<Token> {
    params.get("token").map(|t| Token::from(t.as_str()))
}

fn flag(params: &Params, name: &str) -> bool {
    params.get(name).is_some_and(|v| v == "1")
}

fn error_response(err: EsubError) -> Response {
    // ---
    let status = match &err {
        EsubError::Unauthorized => StatusCode::UNAUTHORIZED,
        EsubError::NoSubscriber(_) => StatusCode::NOT_FOUND,
        EsubError::KeyInUse(_) => StatusCode::CONFLICT,
        EsubError::InvalidKey(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, err.to_string()).into_response()
}

async fn sub(State(hub): State<Arc<MemoryHub>>, Path(k): Path<String>, params: Params) -> Response {
    // ---
    let k = match Key::new(k) {
        Ok(k) => k,
        Err(err) => return error_response(err),
    };
    match hub.sub(&k, token(&params).as_ref()).await {
        Ok(msg) => msg.into_response(),
        Err(err) => error_response(err),
    }
}

async fn rep(
    State(hub): State<Arc<MemoryHub>>,
    Path(k): Path<String>,
    params: Params,
    body: Bytes,
) -> Response {
    // ---
    let k = match Key::new(k) {
        Ok(k) => k,
        Err(err) => return error_response(err),
    };
    match hub.rep(&k, body, token(&params).as_ref(), flag(&params, "psub")).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => error_response(err),
    }
}

async fn info() -> Response {
    Json(serde_json::json!({ "ip": "127.0.0.1" })).into_response()
}

async fn psub(
    State(hub): State<Arc<MemoryHub>>,
    Path(k): Path<String>,
    params: Params,
    ws: WebSocketUpgrade,
) -> Response {
    // ---
    let k = match Key::new(k) {
        Ok(k) => k,
        Err(err) => return error_response(err),
    };
    let mut feed = match hub.psub(&k, token(&params).as_ref(), flag(&params, "shared")) {
        Ok(feed) => feed,
        Err(err) => return error_response(err),
    };

    ws.on_upgrade(move |mut socket: WebSocket| async move {
        loop {
            tokio::select! {
                msg = feed.recv() => {
                    let Some(msg) = msg else { break };
                    if socket.send(Message::Binary(msg)).await.is_err() {
                        break;
                    }
                }
                frame = socket.recv() => match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Receipts and keepalives.
                    Some(Ok(_)) => {}
                },
            }
        }
    })
}

async fn prep(State(hub): State<Arc<MemoryHub>>, ws: WebSocketUpgrade) -> Response {
    // ---
    ws.on_upgrade(move |mut socket: WebSocket| async move {
        while let Some(Ok(frame)) = socket.recv().await {
            let text = match frame {
                Message::Text(text) => text.as_str().to_string(),
                Message::Close(_) => break,
                _ => continue,
            };

            let confirmation = match deliver(&hub, &text).await {
                Ok(()) => "ok".to_string(),
                Err(err) => err.to_string(),
            };
            if socket.send(Message::Text(confirmation.into())).await.is_err() {
                break;
            }
        }
    })
}

async fn deliver(hub: &MemoryHub, text: &str) -> esub::Result<()> {
    // ---
    let msg: PrepMessage = serde_json::from_str(text)?;
    let k = Key::new(msg.key)?;
    let token = msg.token.map(Token::from);
    hub.rep(&k, Bytes::from(msg.data), token.as_ref(), msg.psub)
        .await
}
