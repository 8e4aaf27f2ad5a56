//! Persistent calls over WebSocket.
//!
//! Each persistent subscription or publisher owns one connection, driven by
//! a spawned task. The handle returned to the caller talks to that task
//! over channels and stops it through a `CancellationToken`, so the task is
//! the only place that touches the socket.
//!
//! Wire behavior:
//!
//! - `/psub/{key}`: every Text or Binary frame is one message. With receipt
//!   confirmation on, each message is answered with a Text `ok`. Otherwise an
//!   unsolicited Pong goes out every `ping_frequency` to keep idle
//!   connections open.
//! - `/prep`: every message is one JSON Text frame
//!   `{"key", "token", "psub", "data"}`. With receipt confirmation on, the
//!   next frame from the broker is that message's confirmation.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, USER_AGENT};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{deadline, status_error, Call};
use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    CancelReason,
    EsubError,
    Key,
    PersistentSubscription,
    PrepMessage,
    PrepOptions,
    PublishCmd,
    Publisher,
    Result,
    Token,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Queue depth between a connection task and its handle.
const CHANNEL_BUFFER: usize = 16;

/// Lower bound for the keepalive interval; `interval` rejects zero.
const MIN_KEEPALIVE: Duration = Duration::from_secs(1);

/// How a persistent subscription behaves once connected.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PsubSettings {
    pub confirm_receipt: bool,
    pub ping_frequency: Duration,
    pub timeout: Option<Duration>,
}

/// Open a WebSocket to `url`, mapping a refused upgrade to the matching error.
async fn connect(url: &Url, call: Call, key: &str) -> Result<WsStream> {
    // ---
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| EsubError::InvalidConfig(format!("websocket request: {e}")))?;
    request.headers_mut().insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("esub ", env!("CARGO_PKG_VERSION"))),
    );

    match connect_async(request).await {
        Ok((stream, _)) => Ok(stream),
        Err(WsError::Http(resp)) => {
            let message = resp
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).into_owned())
                .unwrap_or_default();
            Err(status_error(call, resp.status().as_u16(), key, message))
        }
        Err(err) => Err(EsubError::connection(err)),
    }
}

/// Connect a persistent subscription and start its reader task.
pub(crate) async fn open_psub(
    url: Url,
    key: Key,
    settings: PsubSettings,
    closer: CancellationToken,
) -> Result<PersistentSubscription> {
    // ---
    let stream = connect(&url, Call::Psub, key.as_str()).await?;
    log_debug!("psub on {key}: connected");

    let (tx, inbox) = mpsc::channel(CHANNEL_BUFFER);
    tokio::spawn(run_psub(stream, key, settings, tx, closer.clone()));

    Ok(PersistentSubscription::new(inbox, closer))
}

async fn run_psub(
    stream: WsStream,
    key: Key,
    settings: PsubSettings,
    tx: mpsc::Sender<Bytes>,
    stop: CancellationToken,
) {
    // ---
    let (mut sink, mut source) = stream.split();
    let until = settings.timeout.map(|t| Instant::now() + t);

    let period = settings.ping_frequency.max(MIN_KEEPALIVE);
    let mut keepalive = time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,

            _ = deadline(until) => {
                log_debug!("psub on {key}: timeout reached");
                break;
            }

            _ = keepalive.tick(), if !settings.confirm_receipt => {
                if sink.send(Message::Pong(Bytes::new())).await.is_err() {
                    break;
                }
            }

            frame = source.next() => {
                let data = match frame {
                    Some(Ok(Message::Text(text))) => Bytes::copy_from_slice(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => {
                        log_debug!("psub on {key}: closed by broker");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(_err)) => {
                        log_warn!("psub on {key}: connection lost: {_err}");
                        break;
                    }
                };

                if tx.send(data).await.is_err() {
                    break;
                }
                if settings.confirm_receipt && sink.send(Message::text("ok")).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    log_debug!("psub on {key}: closed");
}

/// Connect a persistent publisher and start its writer task.
pub(crate) async fn open_prep(
    url: Url,
    confirm_receipt: bool,
    opts: PrepOptions,
    session_token: Option<Token>,
    closer: CancellationToken,
) -> Result<Publisher> {
    // ---
    let stream = connect(&url, Call::Prep, "").await?;
    log_debug!("prep: connected");

    let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER);
    let actor = PrepActor {
        confirm_receipt,
        opts,
        session_token,
    };
    tokio::spawn(actor.run(stream, cmd_rx, closer.clone()));

    Ok(Publisher::new(cmd_tx, closer))
}

struct PrepActor {
    confirm_receipt: bool,
    opts: PrepOptions,
    session_token: Option<Token>,
}

impl PrepActor {
    // ---

    async fn run(
        self,
        stream: WsStream,
        mut cmd_rx: mpsc::Receiver<PublishCmd>,
        stop: CancellationToken,
    ) {
        // ---
        let (mut sink, mut source) = stream.split();

        loop {
            let cmd = tokio::select! {
                _ = stop.cancelled() => break,

                cmd = cmd_rx.recv() => cmd,

                // Idle: keep reading so control frames are answered and a
                // broker-side close is noticed.
                frame = source.next() => match frame {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                        log_debug!("prep: closed by broker");
                        break;
                    }
                    Some(Ok(_)) => continue,
                },
            };
            let Some(PublishCmd { msg, resp }) = cmd else {
                break;
            };

            let msg = msg.resolve(&self.opts, self.session_token.as_ref());
            let result = tokio::select! {
                _ = stop.cancelled() => Err(EsubError::Canceled(CancelReason::Shutdown)),
                result = self.publish_one(&mut sink, &mut source, &msg) => result,
            };

            let fatal = matches!(
                result,
                Err(EsubError::ConnectionFailed(_) | EsubError::Canceled(_))
            );
            if let Err(Err(_err)) = resp.send(result) {
                log_error!("prep: send abandoned by caller failed: {_err}");
            }
            if fatal {
                break;
            }
        }

        let _ = sink.close().await;
        log_debug!("prep: closed");
    }

    async fn publish_one(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        msg: &PrepMessage,
    ) -> Result<Option<String>> {
        // ---
        let text = serde_json::to_string(msg)?;
        sink.send(Message::text(text))
            .await
            .map_err(EsubError::connection)?;

        if !self.confirm_receipt {
            return Ok(None);
        }

        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_string())),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()))
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(EsubError::ConnectionFailed(
                        "broker closed the publisher before confirming".into(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(EsubError::connection(err)),
            }
        }
    }
}
