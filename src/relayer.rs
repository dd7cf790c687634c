//! Topic-addressed publish/subscribe over the relay socket.
//!
//! One pump task owns the inbound side: it correlates RPC responses with
//! their waiters, demultiplexes `iridium_subscription` notifications into
//! `MessageReceived` events (per-topic FIFO follows from the single
//! consumer), and drives reconnection with exponential backoff.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use lru::LruCache;
use serde_json::{json, Value};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::connection::{Connection, SocketEvent};
use crate::constants::{
    DEDUP_CAPACITY, DEDUP_WINDOW, RECONNECT_BACKOFF_INITIAL, RECONNECT_BACKOFF_MAX,
    RELAY_PUBLISH, RELAY_SUBSCRIBE, RELAY_SUBSCRIPTION, RELAY_UNSUBSCRIBE, RPC_TIMEOUT,
    SESSION_REQUEST_TAGS, STORE_MESSAGES, STORE_SUBSCRIPTIONS, TRANSPORT_ERROR_CODE,
    TTL_PUBLISH_DEFAULT,
};
use crate::error::{Error, Result};
use crate::rpc::{
    IdGenerator, InboundFrame, JsonRpcRequest, JsonRpcResponse, PublishParams, SubscribeParams,
    SubscriptionParams, UnsubscribeParams,
};
use crate::storage::{KeyValueStorage, Store};
use crate::types::{RelayProtocolOptions, Subscription};
use crate::utils::{sha256, unix_timestamp};

#[derive(Debug, Clone, PartialEq)]
pub enum RelayerEvent {
    MessageReceived {
        topic: String,
        message: String,
        tag: u32,
    },
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub ttl: Option<Duration>,
    pub tag: u32,
    pub prompt: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct SeenMessage {
    topic: String,
    hash: String,
    seen_at: u64,
}

pub struct Relayer {
    url: Mutex<String>,
    connection: Arc<Connection>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    subscription_store: Store<Subscription>,
    message_store: Store<SeenMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    ids: Arc<IdGenerator>,
    events: broadcast::Sender<RelayerEvent>,
    dedup: Mutex<LruCache<(String, [u8; 32]), Instant>>,
    shutdown: watch::Sender<bool>,
}

impl Relayer {
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        connection: Arc<Connection>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);
        Self {
            url: Mutex::new(String::new()),
            connection,
            subscriptions: Mutex::new(HashMap::new()),
            subscription_store: Store::new(storage.clone(), STORE_SUBSCRIPTIONS),
            message_store: Store::new(storage, STORE_MESSAGES),
            pending: Mutex::new(HashMap::new()),
            ids,
            events,
            dedup: Mutex::new(LruCache::new(
                NonZeroUsize::new(DEDUP_CAPACITY).expect("capacity is non-zero"),
            )),
            shutdown,
        }
    }

    /// Loads the persisted subscription index and dedup window.
    pub async fn init(&self) -> Result<()> {
        self.subscription_store.init().await?;
        let mut subscriptions = self.subscriptions.lock().await;
        for record in self.subscription_store.values().await {
            subscriptions.insert(record.topic.clone(), record);
        }
        drop(subscriptions);

        self.message_store.init().await?;
        let now = unix_timestamp();
        let mut dedup = self.dedup.lock().await;
        for seen in self.message_store.values().await {
            if now.saturating_sub(seen.seen_at) < DEDUP_WINDOW.as_secs() {
                if let Ok(hash) = crate::utils::decode_key(&seen.hash) {
                    dedup.put((seen.topic.clone(), hash), Instant::now());
                }
            } else {
                let _ = self
                    .message_store
                    .delete(&format!("{}:{}", seen.topic, seen.hash), "dedup window passed")
                    .await;
            }
        }
        Ok(())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayerEvent> {
        self.events.subscribe()
    }

    /// Opens the socket and restores every known subscription.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<()> {
        *self.url.lock().await = url.to_string();
        self.connection.open(url).await?;
        self.resubscribe_all().await;
        Ok(())
    }

    /// Stops the pump, silences further events and closes the socket.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.connection.close().await;
    }

    /// Sends one relay RPC and waits for the matching response.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.ids.next();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.0, tx);

        let raw = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        self.connection.send(id, raw).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::TransportUnavailable(
                "relayer stopped while waiting".to_string(),
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id.0);
                Err(Error::Timeout(format!("{method} (id {id})")))
            }
        }
    }

    /// Subscribes to a topic and records the relay-assigned id.
    pub async fn subscribe(
        &self,
        topic: &str,
        relay: Option<RelayProtocolOptions>,
    ) -> Result<String> {
        let relay = relay.unwrap_or_default();
        let result = self
            .request(
                RELAY_SUBSCRIBE,
                serde_json::to_value(SubscribeParams {
                    topic: topic.to_string(),
                })?,
                RPC_TIMEOUT,
            )
            .await?;
        let id: String = serde_json::from_value(result)?;

        let subscription = Subscription {
            id: id.clone(),
            topic: topic.to_string(),
            relay,
            extra: serde_json::Map::new(),
        };
        self.subscription_store.set(topic, subscription.clone()).await?;
        self.subscriptions
            .lock()
            .await
            .insert(topic.to_string(), subscription);
        debug!("subscribed {topic} -> {id}");
        Ok(id)
    }

    /// Drops the subscription for a topic. Unknown topics error with
    /// `NoMatchingKey`.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let subscription = self
            .subscriptions
            .lock()
            .await
            .remove(topic)
            .ok_or_else(|| Error::NoMatchingKey(format!("subscription for {topic}")))?;
        let _ = self.subscription_store.delete(topic, "unsubscribed").await;

        self.request(
            RELAY_UNSUBSCRIBE,
            serde_json::to_value(UnsubscribeParams {
                id: subscription.id,
                topic: topic.to_string(),
            })?,
            RPC_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    pub async fn subscribed(&self, topic: &str) -> bool {
        self.subscriptions.lock().await.contains_key(topic)
    }

    /// Publishes an envelope, returning once the relay acknowledges.
    ///
    /// Tags in `SESSION_REQUEST_TAGS` are retried with exponential backoff
    /// until the TTL deadline; everything else surfaces the first failure.
    pub async fn publish(&self, topic: &str, message: &str, opts: PublishOptions) -> Result<()> {
        let ttl = opts.ttl.unwrap_or(TTL_PUBLISH_DEFAULT);
        let params = serde_json::to_value(PublishParams {
            topic: topic.to_string(),
            message: message.to_string(),
            ttl: ttl.as_secs(),
            tag: opts.tag,
            prompt: opts.prompt,
        })?;

        if !SESSION_REQUEST_TAGS.contains(&opts.tag) {
            return self.publish_once(params).await;
        }

        let deadline = Instant::now() + ttl;
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        loop {
            match self.publish_once(params.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && Instant::now() + backoff < deadline => {
                    warn!("publish on {topic} failed, retrying in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish_once(&self, params: Value) -> Result<()> {
        self.request(RELAY_PUBLISH, params, RPC_TIMEOUT).await?;
        Ok(())
    }

    /// Spawns the inbound pump. The pump exits once `close` is called or the
    /// socket event channel is dropped.
    pub fn start(
        self: &Arc<Self>,
        mut socket_events: tokio::sync::mpsc::UnboundedReceiver<SocketEvent>,
    ) -> JoinHandle<()> {
        let relayer = Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown = relayer.shutdown.subscribe();
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => break,
                    event = socket_events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    SocketEvent::PayloadReceived(text) => relayer.handle_payload(&text).await,
                    SocketEvent::ErrorReceived(cause) => warn!("relay socket error: {cause}"),
                    SocketEvent::Closed => {
                        let _ = relayer.events.send(RelayerEvent::Disconnected);
                        if *shutdown.borrow() {
                            break;
                        }
                        relayer.reconnect(&mut shutdown).await;
                    }
                }
            }
            debug!("relayer pump stopped");
        })
    }

    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) {
        let url = self.url.lock().await.clone();
        if url.is_empty() {
            return;
        }
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            match self.connection.open(&url).await {
                Ok(()) => {
                    self.resubscribe_all().await;
                    let _ = self.events.send(RelayerEvent::Connected);
                    return;
                }
                Err(e) => {
                    warn!("reconnect failed, next attempt in {backoff:?}: {e}");
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                }
            }
        }
    }

    async fn resubscribe_all(&self) {
        let topics: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        for topic in topics {
            let result = self
                .request(
                    RELAY_SUBSCRIBE,
                    json!({ "topic": topic }),
                    RPC_TIMEOUT,
                )
                .await
                .and_then(|v| serde_json::from_value::<String>(v).map_err(Error::from));
            match result {
                Ok(id) => {
                    let mut subscriptions = self.subscriptions.lock().await;
                    if let Some(subscription) = subscriptions.get_mut(&topic) {
                        subscription.id = id;
                        let record = subscription.clone();
                        drop(subscriptions);
                        let _ = self.subscription_store.set(&topic, record).await;
                    }
                }
                Err(e) => warn!("resubscribe of {topic} failed: {e}"),
            }
        }
    }

    async fn handle_payload(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping unparseable frame: {e}");
                return;
            }
        };

        if frame.is_request() {
            self.handle_request(frame).await;
        } else {
            self.handle_response(frame).await;
        }
    }

    async fn handle_request(&self, frame: InboundFrame) {
        let method = frame.method.as_deref().unwrap_or_default();
        let Some(id) = frame.id else {
            warn!("dropping request without id: {method}");
            return;
        };
        if method != RELAY_SUBSCRIPTION {
            warn!("dropping unexpected relay request: {method}");
            return;
        }
        let params: SubscriptionParams = match frame
            .params
            .ok_or_else(|| Error::InvalidEnvelope("missing params".to_string()))
            .and_then(|p| serde_json::from_value(p).map_err(Error::from))
        {
            Ok(params) => params,
            Err(e) => {
                warn!("dropping malformed subscription payload: {e}");
                return;
            }
        };

        let topic = params.data.topic.clone();
        {
            let subscriptions = self.subscriptions.lock().await;
            let Some(known) = subscriptions.get(&topic) else {
                warn!("dropping message for unknown topic {topic}");
                return;
            };
            if known.id != params.id {
                // ids churn across reconnects; the topic is what matters
                debug!("subscription id mismatch on {topic}");
            }
        }

        // acknowledge before fan-out so the relay stops redelivering
        let ack = JsonRpcResponse::result(id, Value::Bool(true));
        if let Ok(raw) = serde_json::to_string(&ack) {
            self.connection.send(id, raw).await;
        }

        if self.is_duplicate(&topic, &params.data.message).await {
            debug!("dropping duplicate message on {topic}");
            return;
        }

        let _ = self.events.send(RelayerEvent::MessageReceived {
            topic,
            message: params.data.message,
            tag: params.data.tag,
        });
    }

    async fn handle_response(&self, frame: InboundFrame) {
        let Some(id) = frame.id else {
            warn!("dropping response without id");
            return;
        };
        let Some(waiter) = self.pending.lock().await.remove(&id.0) else {
            debug!("dropping orphan response for id {id}");
            return;
        };

        let outcome = if let Some(error) = frame.error {
            if error.code == TRANSPORT_ERROR_CODE {
                Err(Error::TransportUnavailable(error.message))
            } else {
                Err(Error::Rpc {
                    code: error.code,
                    message: error.message,
                })
            }
        } else {
            Ok(frame.result.unwrap_or(Value::Null))
        };
        let _ = waiter.send(outcome);
    }

    async fn is_duplicate(&self, topic: &str, message: &str) -> bool {
        let key = (topic.to_string(), sha256(message));
        let mut dedup = self.dedup.lock().await;
        if let Some(seen) = dedup.get(&key) {
            if seen.elapsed() < DEDUP_WINDOW {
                return true;
            }
        }
        dedup.put(key.clone(), Instant::now());
        drop(dedup);

        let hash = hex::encode(key.1);
        let _ = self
            .message_store
            .set(
                &format!("{topic}:{hash}"),
                SeenMessage {
                    topic: topic.to_string(),
                    hash,
                    seen_at: unix_timestamp(),
                },
            )
            .await;
        false
    }
}
