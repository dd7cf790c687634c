//! Persisted key material, indexed by topic (symmetric keys) or by public
//! key hex (X25519 private keys).
//!
//! The keychain holds the only persistent copy of every secret; callers get
//! by-value copies and must not cache them.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::{KeyValueStorage, Store};
use crate::utils::{decode_key, derive_sym_key, random_bytes32, topic_from_key};

pub struct Keychain {
    store: Store<String>,
}

impl Keychain {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            store: Store::new(storage, crate::constants::STORE_KEYCHAIN),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.store.init().await
    }

    /// Persists a symmetric key under its derived topic and returns it.
    pub async fn set_sym_key(&self, key: [u8; 32]) -> Result<String> {
        let topic = topic_from_key(&key);
        self.store.set(&topic, hex::encode(key)).await?;
        Ok(topic)
    }

    /// Persists a symmetric key under a topic known out-of-band (pairing URI).
    pub async fn set_sym_key_for_topic(&self, key: [u8; 32], topic: &str) -> Result<()> {
        self.store.set(topic, hex::encode(key)).await
    }

    pub async fn has_keys(&self, tag: &str) -> bool {
        self.store.has(tag).await
    }

    pub async fn get_sym_key(&self, topic: &str) -> Result<[u8; 32]> {
        let hex_key = self
            .store
            .get(topic)
            .await
            .map_err(|_| Error::NoMatchingKey(topic.to_string()))?;
        decode_key(&hex_key)
    }

    /// Removes the key for a topic. Deleting an absent topic is a no-op.
    pub async fn delete_sym_key(&self, topic: &str) {
        let _ = self.store.delete(topic, "sym key removed").await;
    }

    /// Generates an X25519 keypair, storing the private key under the hex of
    /// the public key. Returns the public key hex.
    pub async fn generate_key_pair(&self) -> Result<String> {
        let private = random_bytes32();
        let public = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(private));
        let public_hex = hex::encode(public.as_bytes());
        self.store.set(&public_hex, hex::encode(private)).await?;
        Ok(public_hex)
    }

    /// Runs X25519 agreement between our stored private key for `self_public`
    /// and `peer_public`, persists the HKDF-derived symmetric key, and
    /// returns the topic it was stored under.
    pub async fn generate_shared_key(
        &self,
        self_public: &str,
        peer_public: &str,
        override_topic: Option<&str>,
    ) -> Result<String> {
        let private_hex = self
            .store
            .get(self_public)
            .await
            .map_err(|_| Error::NoMatchingKey(self_public.to_string()))?;
        let private = decode_key(&private_hex)?;
        let peer = decode_key(peer_public)?;

        let sym_key = derive_sym_key(private, peer);
        match override_topic {
            Some(topic) => {
                self.set_sym_key_for_topic(sym_key, topic).await?;
                Ok(topic.to_string())
            }
            None => self.set_sym_key(sym_key).await,
        }
    }
}
