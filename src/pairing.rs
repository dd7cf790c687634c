//! The pairing control plane: URI bootstrap, topic lifecycle, ping/delete.
//!
//! State machine per topic:
//!
//! ```text
//!           Create / Pair
//!  start ------------------> Inactive
//!                               | Activate
//!                               v
//!                             Active
//!                               | Disconnect / peer delete / expiry
//!                               v
//!                             Deleted (terminal)
//! ```
//!
//! Operations on a deleted topic fail with `NoMatchingKey`; operations on an
//! expired topic tear the pairing down first and fail with `Expired`.

use std::sync::Arc;

use log::{debug, warn};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::constants::{
    PAIRING_ACTIVE_EXPIRY, PAIRING_DELETE, PAIRING_INACTIVE_EXPIRY, PAIRING_PING, PING_TIMEOUT,
    STORE_PAIRINGS,
};
use crate::error::{Error, Result};
use crate::expirer::{Expirer, ExpirerEvent, Target};
use crate::keychain::Keychain;
use crate::message_handler::{HandlerToken, MessageHandler};
use crate::relayer::Relayer;
use crate::rpc::RpcId;
use crate::storage::{KeyValueStorage, Store};
use crate::types::{ErrorReason, Metadata, PairingRecord, RelayProtocolOptions};
use crate::utils::{build_uri, parse_uri, random_bytes32, unix_timestamp};

#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    Pinged { topic: String, id: RpcId },
    Deleted { topic: String },
    Expired { topic: String },
}

/// Result of [`Pairing::create`].
#[derive(Debug, Clone, PartialEq)]
pub struct PairingCreated {
    pub topic: String,
    pub uri: String,
}

pub struct Pairing {
    store: Store<PairingRecord>,
    keychain: Arc<Keychain>,
    relayer: Arc<Relayer>,
    handler: Arc<MessageHandler>,
    expirer: Arc<Expirer>,
    events: broadcast::Sender<PairingEvent>,
    registered_methods: std::sync::Mutex<Vec<String>>,
    tokens: std::sync::Mutex<Vec<HandlerToken>>,
}

impl Pairing {
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        keychain: Arc<Keychain>,
        relayer: Arc<Relayer>,
        handler: Arc<MessageHandler>,
        expirer: Arc<Expirer>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store: Store::new(storage, STORE_PAIRINGS),
            keychain,
            relayer,
            handler,
            expirer,
            events,
            registered_methods: std::sync::Mutex::new(Vec::new()),
            tokens: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Loads persisted pairings, registers the control-plane RPC handlers and
    /// starts watching the expirer. Returns the watcher handle.
    pub async fn init(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.store.init().await?;

        let ping_pairing = Arc::clone(self);
        let ping_token = self.handler.handle_message_type::<Value, _, _>(
            PAIRING_PING,
            move |topic, id, _params, _tag| {
                let pairing = Arc::clone(&ping_pairing);
                async move { pairing.on_ping_request(topic, id).await }
            },
        );
        let delete_handler = Arc::clone(self);
        let delete_token = self.handler.handle_message_type::<ErrorReason, _, _>(
            PAIRING_DELETE,
            move |topic, id, reason, _tag| {
                let pairing = Arc::clone(&delete_handler);
                async move { pairing.on_delete_request(topic, id, reason).await }
            },
        );
        self.tokens
            .lock()
            .expect("token registry lock")
            .extend([ping_token, delete_token]);

        Ok(self.start_expiry_watcher())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PairingEvent> {
        self.events.subscribe()
    }

    /// Records method names this client accepts over pairing topics.
    pub fn register(&self, methods: &[&str]) {
        let mut registered = self.registered_methods.lock().expect("methods lock");
        for method in methods {
            if !registered.iter().any(|m| m == method) {
                registered.push(method.to_string());
            }
        }
    }

    pub fn registered_methods(&self) -> Vec<String> {
        self.registered_methods.lock().expect("methods lock").clone()
    }

    /// Creates a fresh inactive pairing and returns its topic and URI.
    pub async fn create(&self) -> Result<PairingCreated> {
        let sym_key = random_bytes32();
        let topic = self.keychain.set_sym_key(sym_key).await?;
        let relay = RelayProtocolOptions::default();
        let expiry = unix_timestamp() + PAIRING_INACTIVE_EXPIRY.as_secs();
        let record = PairingRecord::new(topic.clone(), relay.clone(), expiry);

        if let Err(e) = self.store.create(&topic, record).await {
            self.keychain.delete_sym_key(&topic).await;
            return Err(e);
        }
        self.finish_setup(&topic, expiry).await?;

        let uri = build_uri(&topic, &sym_key, &relay);
        debug!("created pairing {topic}");
        Ok(PairingCreated { topic, uri })
    }

    /// Adopts a pairing from a URI produced by the peer's `create`.
    pub async fn pair(&self, uri: &str, activate: bool) -> Result<PairingRecord> {
        let params = parse_uri(uri)?;
        let topic = params.topic.clone();

        if self.store.has(&topic).await || self.keychain.has_keys(&topic).await {
            return Err(Error::AlreadyExists(format!("pairing {topic}")));
        }

        self.keychain
            .set_sym_key_for_topic(params.sym_key, &topic)
            .await?;
        let expiry = params
            .expiry_timestamp
            .unwrap_or_else(|| unix_timestamp() + PAIRING_INACTIVE_EXPIRY.as_secs());
        let record = PairingRecord::new(topic.clone(), params.relay, expiry);
        if let Err(e) = self.store.create(&topic, record.clone()).await {
            self.keychain.delete_sym_key(&topic).await;
            return Err(e);
        }
        self.finish_setup(&topic, expiry).await?;
        if let Some(methods) = &params.methods {
            let methods: Vec<&str> = methods.iter().map(String::as_str).collect();
            self.register(&methods);
        }

        if activate {
            return self.activate(&topic).await;
        }
        Ok(record)
    }

    /// Subscribes and arms expiry. Rolls every prior write back on failure so
    /// a cancelled or failed setup leaves no partial state.
    async fn finish_setup(&self, topic: &str, expiry: u64) -> Result<()> {
        let armed = self.expirer.set(&Target::Topic(topic.to_string()), expiry).await;
        let subscribed = match armed {
            Ok(()) => self.relayer.subscribe(topic, None).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = subscribed {
            self.delete_pairing(topic).await;
            return Err(e);
        }
        Ok(())
    }

    /// Marks a pairing active and extends its lifetime to 30 days.
    pub async fn activate(&self, topic: &str) -> Result<PairingRecord> {
        self.checked(topic).await?;
        let expiry = unix_timestamp() + PAIRING_ACTIVE_EXPIRY.as_secs();
        let record = self
            .store
            .update(topic, json!({"active": true, "expiry": expiry}))
            .await?;
        self.expirer
            .set(&Target::Topic(topic.to_string()), expiry)
            .await?;
        Ok(record)
    }

    pub async fn update_expiry(&self, topic: &str, expiry: u64) -> Result<PairingRecord> {
        self.checked(topic).await?;
        let record = self.store.update(topic, json!({"expiry": expiry})).await?;
        self.expirer
            .set(&Target::Topic(topic.to_string()), expiry)
            .await?;
        Ok(record)
    }

    pub async fn update_metadata(&self, topic: &str, metadata: Metadata) -> Result<PairingRecord> {
        self.checked(topic).await?;
        self.store
            .update(topic, json!({"peerMetadata": metadata}))
            .await
    }

    pub async fn get(&self, topic: &str) -> Result<PairingRecord> {
        self.store.get(topic).await
    }

    pub async fn list(&self) -> Vec<PairingRecord> {
        self.store.values().await
    }

    /// Pings the peer over an active pairing.
    pub async fn ping(&self, topic: &str) -> Result<()> {
        let record = self.checked(topic).await?;
        if !record.active {
            return Err(Error::NoMatchingKey(format!("active pairing {topic}")));
        }

        let id = self.handler.send_request(topic, PAIRING_PING, json!({})).await?;
        let result = self
            .handler
            .wait_for_response(id, Some(PING_TIMEOUT))
            .await?;
        if result != Value::Bool(true) {
            return Err(Error::Rpc {
                code: 0,
                message: format!("unexpected ping result: {result}"),
            });
        }
        let _ = self.events.send(PairingEvent::Pinged {
            topic: topic.to_string(),
            id,
        });
        Ok(())
    }

    /// Tells the peer we are done, then tears the pairing down locally.
    /// The delete publish is best-effort; teardown happens regardless.
    pub async fn disconnect(&self, topic: &str) -> Result<()> {
        self.checked(topic).await?;

        let reason = ErrorReason::user_disconnected();
        match self
            .handler
            .send_request(topic, PAIRING_DELETE, serde_json::to_value(&reason)?)
            .await
        {
            Ok(_id) => {}
            Err(e) => warn!("pairing delete publish failed for {topic}: {e}"),
        }

        self.delete_pairing(topic).await;
        let _ = self.events.send(PairingEvent::Deleted {
            topic: topic.to_string(),
        });
        Ok(())
    }

    /// Idempotent teardown of everything attached to a topic.
    async fn delete_pairing(&self, topic: &str) {
        let unsubscribe = async {
            if self.relayer.subscribed(topic).await {
                if let Err(e) = self.relayer.unsubscribe(topic).await {
                    warn!("unsubscribe during teardown of {topic} failed: {e}");
                }
            }
        };
        let drop_record = async {
            if self.store.has(topic).await {
                let _ = self.store.delete(topic, "pairing deleted").await;
            }
        };
        let expirer_target = Target::Topic(topic.to_string());
        tokio::join!(
            unsubscribe,
            drop_record,
            self.keychain.delete_sym_key(topic),
            self.expirer.delete(&expirer_target),
        );
    }

    /// Fetches a live record. Expired records are torn down before the error
    /// is returned.
    async fn checked(&self, topic: &str) -> Result<PairingRecord> {
        let record = self.store.get(topic).await?;
        if record.expiry <= unix_timestamp() {
            self.delete_pairing(topic).await;
            let _ = self.events.send(PairingEvent::Expired {
                topic: topic.to_string(),
            });
            return Err(Error::Expired(format!("pairing {topic}")));
        }
        Ok(record)
    }

    async fn on_ping_request(&self, topic: String, id: RpcId) {
        if self.checked(&topic).await.is_err() {
            warn!("ignoring ping for unknown or expired pairing {topic}");
            return;
        }
        if let Err(e) = self
            .handler
            .send_result(id, &topic, PAIRING_PING, Value::Bool(true))
            .await
        {
            warn!("ping ack on {topic} failed: {e}");
            return;
        }
        let _ = self.events.send(PairingEvent::Pinged { topic, id });
    }

    async fn on_delete_request(&self, topic: String, id: RpcId, reason: ErrorReason) {
        if !self.store.has(&topic).await {
            warn!("ignoring delete for unknown pairing {topic}");
            return;
        }
        debug!("peer deleted pairing {topic}: {} {}", reason.code, reason.message);
        if let Err(e) = self
            .handler
            .send_result(id, &topic, PAIRING_DELETE, Value::Bool(true))
            .await
        {
            warn!("delete ack on {topic} failed: {e}");
        }
        self.delete_pairing(&topic).await;
        let _ = self.events.send(PairingEvent::Deleted { topic });
    }

    fn start_expiry_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let pairing = Arc::clone(self);
        let mut expirations = self.expirer.subscribe();
        tokio::spawn(async move {
            loop {
                match expirations.recv().await {
                    Ok(ExpirerEvent::Expired {
                        target: Target::Topic(topic),
                    }) => {
                        if pairing.store.has(&topic).await {
                            pairing.delete_pairing(&topic).await;
                            let _ = pairing.events.send(PairingEvent::Expired { topic });
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("expiry watcher lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::crypto::Crypto;
    use crate::rpc::IdGenerator;
    use crate::storage::MemoryStorage;
    use crate::test_util::fake_relay;
    use std::time::Duration;

    struct Fixture {
        pairing: Arc<Pairing>,
        keychain: Arc<Keychain>,
        relayer: Arc<Relayer>,
        expirer: Arc<Expirer>,
        _workers: Vec<JoinHandle<()>>,
    }

    /// Full stack against the loopback relay: every publish is delivered
    /// back to this client, so the pairing module acts as its own peer.
    async fn fixture() -> Fixture {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(MemoryStorage::new());
        let ids = Arc::new(IdGenerator::new());
        let (connection, socket_events) = Connection::new();
        let relayer = Arc::new(Relayer::new(storage.clone(), connection, ids.clone()));
        let pump = relayer.start(socket_events);
        relayer.connect(&fake_relay().await).await.unwrap();

        let keychain = Arc::new(Keychain::new(storage.clone()));
        let crypto = Arc::new(Crypto::new(keychain.clone()));
        let handler = Arc::new(MessageHandler::new(crypto, relayer.clone(), ids));
        let dispatch = handler.start();

        let expirer = Arc::new(Expirer::new(storage.clone()));
        let expirer_worker = expirer.start();

        let pairing = Arc::new(Pairing::new(
            storage,
            keychain.clone(),
            relayer.clone(),
            handler,
            expirer.clone(),
        ));
        let watcher = pairing.init().await.unwrap();

        Fixture {
            pairing,
            keychain,
            relayer,
            expirer,
            _workers: vec![pump, dispatch, expirer_worker, watcher],
        }
    }

    #[tokio::test]
    async fn create_yields_parseable_uri() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();

        let parsed = parse_uri(&created.uri).unwrap();
        assert_eq!(parsed.topic, created.topic);
        assert_eq!(parsed.version, 2);
        assert_eq!(
            crate::utils::topic_from_key(&parsed.sym_key),
            created.topic
        );

        let record = fx.pairing.get(&created.topic).await.unwrap();
        assert!(!record.active);
        assert!(fx.keychain.has_keys(&created.topic).await);
        assert!(fx.relayer.subscribed(&created.topic).await);
        assert!(fx.expirer.has(&Target::Topic(created.topic)).await);
    }

    #[tokio::test]
    async fn pair_adopts_uri_without_activation() {
        let fx = fixture().await;
        let sym_key = random_bytes32();
        let topic = crate::utils::topic_from_key(&sym_key);
        let uri = build_uri(&topic, &sym_key, &RelayProtocolOptions::default());

        let before = unix_timestamp();
        let record = fx.pairing.pair(&uri, false).await.unwrap();

        assert_eq!(record.topic, topic);
        assert!(!record.active);
        let slack = PAIRING_INACTIVE_EXPIRY.as_secs();
        assert!(record.expiry >= before + slack && record.expiry <= before + slack + 2);

        assert_eq!(fx.pairing.store.keys().await, vec![topic.clone()]);
        assert_eq!(fx.keychain.get_sym_key(&topic).await.unwrap(), sym_key);
    }

    #[tokio::test]
    async fn pair_rejects_known_topic_and_leaves_no_state() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();

        let err = fx.pairing.pair(&created.uri, false).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        // the original pairing is untouched
        assert!(fx.pairing.get(&created.topic).await.is_ok());
        assert_eq!(fx.pairing.store.len().await, 1);
    }

    #[tokio::test]
    async fn activate_extends_expiry() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();

        let record = fx.pairing.activate(&created.topic).await.unwrap();
        assert!(record.active);
        assert!(record.expiry > unix_timestamp() + PAIRING_ACTIVE_EXPIRY.as_secs() - 5);
        assert_eq!(
            fx.expirer.get(&Target::Topic(created.topic)).await,
            Some(record.expiry)
        );
    }

    #[tokio::test]
    async fn ping_roundtrip_emits_event() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();
        fx.pairing.activate(&created.topic).await.unwrap();

        let mut events = fx.pairing.subscribe_events();
        fx.pairing.ping(&created.topic).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, PairingEvent::Pinged { topic, .. } if topic == created.topic));
    }

    #[tokio::test]
    async fn ping_requires_active_pairing() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();

        let err = fx.pairing.ping(&created.topic).await.unwrap_err();
        assert!(matches!(err, Error::NoMatchingKey(_)));
    }

    #[tokio::test]
    async fn disconnect_tears_everything_down() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();
        fx.pairing.activate(&created.topic).await.unwrap();

        fx.pairing.disconnect(&created.topic).await.unwrap();

        assert!(fx.pairing.store.keys().await.is_empty());
        assert!(!fx.keychain.has_keys(&created.topic).await);
        assert!(!fx.expirer.has(&Target::Topic(created.topic.clone())).await);
        assert!(!fx.relayer.subscribed(&created.topic).await);

        let err = fx.pairing.disconnect(&created.topic).await.unwrap_err();
        assert!(matches!(err, Error::NoMatchingKey(_)));
    }

    #[tokio::test]
    async fn peer_delete_request_tears_down_and_emits() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();
        fx.pairing.activate(&created.topic).await.unwrap();
        let mut events = fx.pairing.subscribe_events();

        // over the loopback relay our own delete request plays the peer's
        let reason = serde_json::to_value(ErrorReason::user_disconnected()).unwrap();
        fx.pairing
            .handler
            .send_request(&created.topic, PAIRING_DELETE, reason)
            .await
            .unwrap();

        let deleted = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let PairingEvent::Deleted { topic } = events.recv().await.unwrap() {
                    break topic;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(deleted, created.topic);

        let err = fx.pairing.ping(&created.topic).await.unwrap_err();
        assert!(matches!(err, Error::NoMatchingKey(_)));
    }

    #[tokio::test]
    async fn expiry_event_deletes_pairing() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();
        let mut events = fx.pairing.subscribe_events();

        // force the deadline into the past; the watcher must tear down
        fx.expirer
            .set(&Target::Topic(created.topic.clone()), unix_timestamp())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            PairingEvent::Expired {
                topic: created.topic.clone()
            }
        );
        assert!(!fx.pairing.store.has(&created.topic).await);
        assert!(!fx.keychain.has_keys(&created.topic).await);
    }

    #[tokio::test]
    async fn operations_on_expired_pairing_fail_after_teardown() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();

        // expire the record in the store without going through the expirer
        fx.pairing
            .store
            .update(&created.topic, json!({"expiry": unix_timestamp()}))
            .await
            .unwrap();

        let err = fx.pairing.activate(&created.topic).await.unwrap_err();
        assert!(matches!(err, Error::Expired(_)));
        assert!(!fx.pairing.store.has(&created.topic).await);
        assert!(!fx.keychain.has_keys(&created.topic).await);
    }

    #[tokio::test]
    async fn register_records_methods_once() {
        let fx = fixture().await;
        fx.pairing.register(&["wc_sessionPropose", "wc_sessionAuthenticate"]);
        fx.pairing.register(&["wc_sessionPropose"]);
        assert_eq!(
            fx.pairing.registered_methods(),
            vec![
                "wc_sessionPropose".to_string(),
                "wc_sessionAuthenticate".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn update_metadata_sets_peer_metadata() {
        let fx = fixture().await;
        let created = fx.pairing.create().await.unwrap();

        let metadata = Metadata {
            name: "Example dApp".to_string(),
            description: "test peer".to_string(),
            url: "https://example.org".to_string(),
            icons: vec![],
        };
        let record = fx
            .pairing
            .update_metadata(&created.topic, metadata.clone())
            .await
            .unwrap();
        assert_eq!(record.peer_metadata, Some(metadata));
    }
}
