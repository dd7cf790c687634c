//! Framed JSON-RPC over a single WebSocket.
//!
//! State machine: `Disconnected -> Registering -> Open -> Disconnected`.
//! Inbound text frames surface as `PayloadReceived`; binary and ping frames
//! are dropped here. This layer never reconnects on its own; the relayer
//! decides when to dial again.

use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::constants::{CONNECT_TIMEOUT, TRANSPORT_ERROR_CODE};
use crate::error::{Error, Result};
use crate::rpc::{JsonRpcResponse, RpcId};

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    PayloadReceived(String),
    ErrorReceived(String),
    Closed,
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type RegisterResult = Option<std::result::Result<(), String>>;

enum State {
    Disconnected,
    /// Holds the completion every concurrent `open` call awaits.
    Registering(watch::Receiver<RegisterResult>),
    Open { sink: WsSink, epoch: u64 },
}

pub struct Connection {
    state: Mutex<State>,
    events: mpsc::UnboundedSender<SocketEvent>,
    /// Bumped on every successful dial so a stale reader cannot tear down a
    /// newer connection.
    epoch: std::sync::atomic::AtomicU64,
}

impl Connection {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                state: Mutex::new(State::Disconnected),
                events,
                epoch: std::sync::atomic::AtomicU64::new(0),
            }),
            rx,
        )
    }

    pub async fn is_open(&self) -> bool {
        matches!(*self.state.lock().await, State::Open { .. })
    }

    /// Dials `url`. Duplicate calls while a dial is in flight share its
    /// outcome instead of racing a second handshake.
    pub async fn open(self: &Arc<Self>, url: &str) -> Result<()> {
        enum OpenAction {
            AlreadyOpen,
            Wait(watch::Receiver<RegisterResult>),
            Dial(watch::Sender<RegisterResult>),
        }

        let action = {
            let mut state = self.state.lock().await;
            if matches!(&*state, State::Open { .. }) {
                OpenAction::AlreadyOpen
            } else if let State::Registering(rx) = &*state {
                OpenAction::Wait(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                *state = State::Registering(rx);
                OpenAction::Dial(tx)
            }
        };

        match action {
            OpenAction::AlreadyOpen => Ok(()),
            OpenAction::Dial(tx) => self.dial(url, tx).await,
            OpenAction::Wait(mut rx) => loop {
                if let Some(outcome) = rx.borrow_and_update().clone() {
                    return outcome.map_err(Error::TransportUnavailable);
                }
                if rx.changed().await.is_err() {
                    return Err(Error::TransportUnavailable(
                        "registration abandoned".to_string(),
                    ));
                }
            },
        }
    }

    async fn dial(self: &Arc<Self>, url: &str, tx: watch::Sender<RegisterResult>) -> Result<()> {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url)).await;
        let stream = match connect {
            Err(_) => {
                let err = Error::TransportUnavailable(format!(
                    "connect timeout after {CONNECT_TIMEOUT:?}"
                ));
                *self.state.lock().await = State::Disconnected;
                let _ = tx.send(Some(Err(err.to_string())));
                return Err(err);
            }
            Ok(Err(e)) => {
                let err = map_connect_error(&e.to_string());
                *self.state.lock().await = State::Disconnected;
                let _ = tx.send(Some(Err(err.to_string())));
                return Err(err);
            }
            Ok(Ok((stream, _response))) => stream,
        };

        let (sink, mut source) = stream.split();
        let epoch = self
            .epoch
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        *self.state.lock().await = State::Open { sink, epoch };
        let _ = tx.send(Some(Ok(())));
        debug!("socket open: {url}");

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let mut cause = None;
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        let _ = connection
                            .events
                            .send(SocketEvent::PayloadReceived(text.to_string()));
                    }
                    Ok(WsMessage::Close(close_frame)) => {
                        cause = close_frame
                            .filter(|f| !f.reason.is_empty())
                            .map(|f| f.reason.to_string());
                        break;
                    }
                    // binary, ping, pong: not part of the protocol
                    Ok(_) => {}
                    Err(e) => {
                        cause = Some(e.to_string());
                        break;
                    }
                }
            }
            connection.teardown(epoch, cause).await;
        });

        Ok(())
    }

    async fn teardown(&self, epoch: u64, cause: Option<String>) {
        {
            let mut state = self.state.lock().await;
            let ours = matches!(&*state, State::Open { epoch: current, .. } if *current == epoch);
            if !ours {
                // a newer dial already replaced us
                return;
            }
            *state = State::Disconnected;
        }
        if let Some(cause) = cause {
            warn!("socket error: {cause}");
            let _ = self.events.send(SocketEvent::ErrorReceived(cause));
        }
        let _ = self.events.send(SocketEvent::Closed);
    }

    /// Writes one JSON payload. A failed or impossible write never errors
    /// out: a synthesized JSON-RPC error for `id` is looped back through
    /// `PayloadReceived` so the waiter keyed on that id fails instead of
    /// hanging.
    pub async fn send(&self, id: RpcId, payload: String) {
        let mut state = self.state.lock().await;
        let failure = match &mut *state {
            State::Open { sink, .. } => match sink.send(WsMessage::Text(payload.into())).await {
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            },
            _ => Some("socket not open".to_string()),
        };
        drop(state);

        if let Some(reason) = failure {
            warn!("send failed for id {id}: {reason}");
            let synthesized = JsonRpcResponse::error(id, TRANSPORT_ERROR_CODE, &reason);
            if let Ok(raw) = serde_json::to_string(&synthesized) {
                let _ = self.events.send(SocketEvent::PayloadReceived(raw));
            }
        }
    }

    /// Closes the socket without emitting an error cause.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let State::Open { sink, .. } = &mut *state {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        *state = State::Disconnected;
    }
}

fn map_connect_error(message: &str) -> Error {
    const UNAVAILABLE_MARKERS: &[&str] = &[
        "ENOTFOUND",
        "ECONNREFUSED",
        "Connection refused",
        "connection refused",
        "dns error",
        "failed to lookup",
        "timed out",
    ];
    if UNAVAILABLE_MARKERS.iter().any(|m| message.contains(m)) {
        Error::TransportUnavailable(message.to_string())
    } else {
        Error::TransportUnavailable(format!("connect failed: {message}"))
    }
}
