//! Wires storage, crypto, transport and pairing into one client core.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::crypto::Crypto;
use crate::error::Result;
use crate::expirer::Expirer;
use crate::keychain::Keychain;
use crate::message_handler::MessageHandler;
use crate::pairing::Pairing;
use crate::relay_auth::{relay_url, sign_jwt, Keypair};
use crate::relayer::Relayer;
use crate::storage::KeyValueStorage;

/// The protocol core. Owns every subsystem; outer clients (sign, auth) hold
/// an `Arc<Core>` and register their handlers through
/// [`message_handler`](Core::message_handler).
pub struct Core {
    auth: Keypair,
    keychain: Arc<Keychain>,
    crypto: Arc<Crypto>,
    connection: Arc<Connection>,
    relayer: Arc<Relayer>,
    message_handler: Arc<MessageHandler>,
    expirer: Arc<Expirer>,
    pairing: Arc<Pairing>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    /// Builds and starts the core on top of the given storage backend.
    /// `client_seed` fixes the relay identity across restarts.
    pub async fn init(storage: Arc<dyn KeyValueStorage>, client_seed: [u8; 32]) -> Result<Arc<Self>> {
        let ids = Arc::new(crate::rpc::IdGenerator::new());
        let (connection, socket_events) = Connection::new();
        let keychain = Arc::new(Keychain::new(storage.clone()));
        let crypto = Arc::new(Crypto::new(keychain.clone()));
        let relayer = Arc::new(Relayer::new(storage.clone(), connection.clone(), ids.clone()));
        let message_handler = Arc::new(MessageHandler::new(crypto.clone(), relayer.clone(), ids));
        let expirer = Arc::new(Expirer::new(storage.clone()));
        let pairing = Arc::new(Pairing::new(
            storage,
            keychain.clone(),
            relayer.clone(),
            message_handler.clone(),
            expirer.clone(),
        ));

        keychain.init().await?;
        relayer.init().await?;
        expirer.init().await?;

        let mut workers = vec![
            relayer.start(socket_events),
            message_handler.start(),
            expirer.start(),
        ];
        workers.push(pairing.init().await?);

        Ok(Arc::new(Self {
            auth: Keypair::from_seed(client_seed),
            keychain,
            crypto,
            connection,
            relayer,
            message_handler,
            expirer,
            pairing,
            workers: std::sync::Mutex::new(workers),
        }))
    }

    /// Connects to the relay, authenticating with a freshly signed JWT.
    pub async fn connect(&self, relay_base_url: &str, project_id: &str) -> Result<()> {
        let jwt = sign_jwt(relay_base_url, &self.auth, None);
        let url = relay_url(relay_base_url, project_id, &jwt);
        self.relayer.connect(&url).await
    }

    /// The `did:key` identity this core presents to the relay.
    pub fn client_id(&self) -> String {
        self.auth.client_id()
    }

    pub fn pairing(&self) -> &Arc<Pairing> {
        &self.pairing
    }

    pub fn message_handler(&self) -> &Arc<MessageHandler> {
        &self.message_handler
    }

    pub fn relayer(&self) -> &Arc<Relayer> {
        &self.relayer
    }

    pub fn crypto(&self) -> &Arc<Crypto> {
        &self.crypto
    }

    pub fn keychain(&self) -> &Arc<Keychain> {
        &self.keychain
    }

    pub fn expirer(&self) -> &Arc<Expirer> {
        &self.expirer
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Stops every worker. No events are emitted afterwards.
    pub async fn shutdown(&self) {
        self.relayer.close().await;
        for worker in self.workers.lock().expect("worker list lock").drain(..) {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::test_util::fake_relay;
    use std::time::Duration;

    #[tokio::test]
    async fn end_to_end_pairing_flow() {
        let core = Core::init(Arc::new(MemoryStorage::new()), [7; 32])
            .await
            .unwrap();
        core.connect(&fake_relay().await, "test-project").await.unwrap();

        let created = core.pairing().create().await.unwrap();
        core.pairing().activate(&created.topic).await.unwrap();

        // loopback relay: our ping is answered by our own handler
        core.pairing().ping(&created.topic).await.unwrap();

        core.pairing().disconnect(&created.topic).await.unwrap();
        assert!(core.pairing().get(&created.topic).await.is_err());

        core.shutdown().await;
    }

    #[tokio::test]
    async fn client_id_is_stable_for_a_seed() {
        let core = Core::init(Arc::new(MemoryStorage::new()), [0; 32])
            .await
            .unwrap();
        assert_eq!(
            core.client_id(),
            "did:key:z6MkiTBz1ymuepAQ4HEHYSF1H8quG5GLVVQR3djdX3mDooWp"
        );
        core.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_silences_events() {
        let core = Core::init(Arc::new(MemoryStorage::new()), [7; 32])
            .await
            .unwrap();
        core.connect(&fake_relay().await, "test-project").await.unwrap();
        let created = core.pairing().create().await.unwrap();

        let mut events = core.pairing().subscribe_events();
        core.shutdown().await;

        // an expiry after shutdown must not produce a pairing event
        core.expirer()
            .set(
                &crate::expirer::Target::Topic(created.topic),
                crate::utils::unix_timestamp(),
            )
            .await
            .unwrap();
        assert!(matches!(
            tokio::time::timeout(Duration::from_millis(500), events.recv()).await,
            Err(_) | Ok(Err(_))
        ));
    }
}
