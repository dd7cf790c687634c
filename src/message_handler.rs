//! Decrypts relayed envelopes and routes the JSON-RPC inside them.
//!
//! Requests dispatch to the handler registered for their method; responses
//! resolve the waiter registered when the request was sent. Both run on the
//! single dispatch task so per-topic ordering is preserved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::constants::{
    PAIRING_DELETE, PAIRING_PING, PING_TIMEOUT, REQUEST_TIMEOUT, TAG_PAIRING_DELETE,
    TAG_PAIRING_DELETE_RESPONSE, TAG_PAIRING_PING, TAG_PAIRING_PING_RESPONSE, TTL_PAIRING_DELETE,
    TTL_PAIRING_PING, TTL_PUBLISH_DEFAULT,
};
use crate::crypto::Crypto;
use crate::error::{Error, Result};
use crate::relayer::{PublishOptions, Relayer, RelayerEvent};
use crate::rpc::{IdGenerator, Message, RpcId};

/// A decrypted inbound request handed to a registered handler.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub topic: String,
    pub id: RpcId,
    pub params: Value,
    pub tag: u32,
}

type RequestHandler = Box<dyn Fn(RequestEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct Registration {
    token: u64,
    on_request: RequestHandler,
}

struct PendingRequest {
    method: String,
    waiter: oneshot::Sender<Result<Value>>,
}

/// Per-method publish settings for requests and their replies.
#[derive(Debug, Clone, Copy)]
pub struct MethodOptions {
    pub request_tag: u32,
    pub response_tag: u32,
    pub ttl: Duration,
    pub timeout: Duration,
    pub prompt: bool,
}

pub fn method_options(method: &str) -> MethodOptions {
    match method {
        PAIRING_PING => MethodOptions {
            request_tag: TAG_PAIRING_PING,
            response_tag: TAG_PAIRING_PING_RESPONSE,
            ttl: TTL_PAIRING_PING,
            timeout: PING_TIMEOUT,
            prompt: false,
        },
        PAIRING_DELETE => MethodOptions {
            request_tag: TAG_PAIRING_DELETE,
            response_tag: TAG_PAIRING_DELETE_RESPONSE,
            ttl: TTL_PAIRING_DELETE,
            timeout: REQUEST_TIMEOUT,
            prompt: false,
        },
        _ => MethodOptions {
            request_tag: 0,
            response_tag: 0,
            ttl: TTL_PUBLISH_DEFAULT,
            timeout: REQUEST_TIMEOUT,
            prompt: false,
        },
    }
}

/// Removes its registration when disposed (or dropped).
pub struct HandlerToken {
    method: String,
    token: u64,
    registry: Weak<Mutex<HashMap<String, Registration>>>,
}

impl HandlerToken {
    pub fn dispose(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().expect("handler registry lock");
            if registry.get(&self.method).is_some_and(|r| r.token == self.token) {
                registry.remove(&self.method);
            }
        }
    }
}

impl Drop for HandlerToken {
    fn drop(&mut self) {
        self.dispose();
    }
}

pub struct MessageHandler {
    crypto: Arc<Crypto>,
    relayer: Arc<Relayer>,
    ids: Arc<IdGenerator>,
    registry: Arc<Mutex<HashMap<String, Registration>>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    receivers: Mutex<HashMap<u64, oneshot::Receiver<Result<Value>>>>,
    next_token: AtomicU64,
}

impl MessageHandler {
    pub fn new(crypto: Arc<Crypto>, relayer: Arc<Relayer>, ids: Arc<IdGenerator>) -> Self {
        Self {
            crypto,
            relayer,
            ids,
            registry: Arc::new(Mutex::new(HashMap::new())),
            pending: Mutex::new(HashMap::new()),
            receivers: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Registers the request handler for a method. The previous registration
    /// for the method, if any, is replaced. Dropping the returned token
    /// unregisters.
    pub fn handle_message_type<Req, F, Fut>(&self, method: &str, on_request: F) -> HandlerToken
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(String, RpcId, Req, u32) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let method_name = method.to_string();
        let wrapped: RequestHandler = Box::new(move |event: RequestEvent| {
            let RequestEvent {
                topic,
                id,
                params,
                tag,
            } = event;
            match serde_json::from_value::<Req>(params) {
                Ok(params) => {
                    let fut: BoxFuture<'static, ()> = Box::pin(on_request(topic, id, params, tag));
                    fut
                }
                Err(e) => {
                    warn!("dropping request with malformed params: {e}");
                    Box::pin(async {})
                }
            }
        });

        self.registry.lock().expect("handler registry lock").insert(
            method.to_string(),
            Registration {
                token,
                on_request: wrapped,
            },
        );
        HandlerToken {
            method: method_name,
            token,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Encrypts and publishes a request, registering the response waiter
    /// before anything touches the wire.
    pub async fn send_request(&self, topic: &str, method: &str, params: Value) -> Result<RpcId> {
        let id = self.ids.next();
        let payload = serde_json::to_string(&Message::request(id, method, params))?;
        let encrypted = self.crypto.encode(topic, &payload).await?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(
            id.0,
            PendingRequest {
                method: method.to_string(),
                waiter: tx,
            },
        );
        self.receivers.lock().expect("receivers lock").insert(id.0, rx);

        let opts = method_options(method);
        let published = self
            .relayer
            .publish(
                topic,
                &encrypted,
                PublishOptions {
                    ttl: Some(opts.ttl),
                    tag: opts.request_tag,
                    prompt: opts.prompt.then_some(true),
                },
            )
            .await;
        if let Err(e) = published {
            self.pending.lock().expect("pending lock").remove(&id.0);
            self.receivers.lock().expect("receivers lock").remove(&id.0);
            return Err(e);
        }
        Ok(id)
    }

    /// Awaits the response correlated with `id`. The deadline defaults to the
    /// method's timeout from [`method_options`].
    pub async fn wait_for_response(&self, id: RpcId, timeout: Option<Duration>) -> Result<Value> {
        let rx = self
            .receivers
            .lock()
            .expect("receivers lock")
            .remove(&id.0)
            .ok_or_else(|| Error::NoMatchingKey(format!("pending request {id}")))?;
        let deadline = timeout.unwrap_or_else(|| {
            self.pending
                .lock()
                .expect("pending lock")
                .get(&id.0)
                .map(|p| method_options(&p.method).timeout)
                .unwrap_or(REQUEST_TIMEOUT)
        });

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::TransportUnavailable(
                "dispatcher stopped while waiting".to_string(),
            )),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&id.0);
                Err(Error::Timeout(format!("response for id {id}")))
            }
        }
    }

    /// Replies to an inbound request. The reply reuses the request id.
    pub async fn send_result(
        &self,
        id: RpcId,
        topic: &str,
        method: &str,
        result: Value,
    ) -> Result<()> {
        let payload = serde_json::to_string(&Message::response(id, result))?;
        let encrypted = self.crypto.encode(topic, &payload).await?;
        self.publish_reply(topic, method, encrypted).await
    }

    pub async fn send_error(
        &self,
        id: RpcId,
        topic: &str,
        method: &str,
        code: i64,
        message: &str,
    ) -> Result<()> {
        let payload = serde_json::to_string(&Message::error_response(id, code, message))?;
        let encrypted = self.crypto.encode(topic, &payload).await?;
        self.publish_reply(topic, method, encrypted).await
    }

    async fn publish_reply(&self, topic: &str, method: &str, encrypted: String) -> Result<()> {
        let opts = method_options(method);
        self.relayer
            .publish(
                topic,
                &encrypted,
                PublishOptions {
                    ttl: Some(opts.ttl),
                    tag: opts.response_tag,
                    prompt: None,
                },
            )
            .await
    }

    /// Spawns the dispatch task over the relayer's inbound events.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let handler = Arc::clone(self);
        let mut events = self.relayer.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RelayerEvent::MessageReceived {
                        topic,
                        message,
                        tag,
                    }) => handler.dispatch(&topic, &message, tag).await,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("dispatcher lagged, {n} messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn dispatch(&self, topic: &str, message: &str, tag: u32) {
        let payload = match self.crypto.decode(topic, message).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("dropping undecryptable message on {topic}: {e}");
                return;
            }
        };
        let parsed: Message = match serde_json::from_str(&payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("dropping non-rpc payload on {topic}: {e}");
                return;
            }
        };

        if parsed.is_request() {
            self.dispatch_request(topic, parsed, tag).await;
        } else {
            self.dispatch_response(parsed);
        }
    }

    async fn dispatch_request(&self, topic: &str, message: Message, tag: u32) {
        let method = message.method.unwrap_or_default();
        let future = {
            let registry = self.registry.lock().expect("handler registry lock");
            let Some(registration) = registry.get(&method) else {
                debug!("no handler for {method}, dropping request {}", message.id);
                return;
            };
            (registration.on_request)(RequestEvent {
                topic: topic.to_string(),
                id: message.id,
                params: message.params.unwrap_or(Value::Null),
                tag,
            })
        };
        // awaited on the dispatch task: handlers for one topic run in order
        future.await;
    }

    fn dispatch_response(&self, message: Message) {
        let Some(pending) = self.pending.lock().expect("pending lock").remove(&message.id.0)
        else {
            debug!("dropping orphan response for id {}", message.id);
            return;
        };

        let outcome = if let Some(error) = message.error {
            Err(Error::Rpc {
                code: error.code,
                message: error.message,
            })
        } else {
            Ok(message.result.unwrap_or(Value::Null))
        };
        if pending.waiter.send(outcome).is_err() {
            debug!(
                "response for cancelled request {} ({}) dropped",
                message.id, pending.method
            );
        }
    }
}
