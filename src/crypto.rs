//! Envelope sealing for relay payloads.
//!
//! Layouts, before base64:
//!
//! ```text
//! type 0: [0x00][iv:12][ciphertext + tag]
//! type 1: [0x01][senderPublicKey:32][iv:12][ciphertext + tag]
//! ```
//!
//! Cipher is ChaCha20-Poly1305 with a 256-bit key, 96-bit nonce, 128-bit tag
//! and empty associated data.

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use log::debug;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::keychain::Keychain;
use crate::utils::decode_key;

pub const TYPE_0: u8 = 0;
pub const TYPE_1: u8 = 1;

const TYPE_LENGTH: usize = 1;
const IV_LENGTH: usize = 12;
const KEY_LENGTH: usize = 32;
const TAG_LENGTH: usize = 16;

/// A parsed envelope, independent of transport encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub type_byte: u8,
    pub sender_public_key: Option<[u8; 32]>,
    pub iv: [u8; IV_LENGTH],
    pub sealed: Vec<u8>,
}

impl Envelope {
    pub fn to_base64(&self) -> String {
        let mut bytes = vec![self.type_byte];
        if let Some(sender) = &self.sender_public_key {
            bytes.extend_from_slice(sender);
        }
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.sealed);
        Base64::encode_string(&bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Base64::decode_vec(encoded)
            .map_err(|_| Error::InvalidEnvelope("bad base64".to_string()))?;
        let Some(&type_byte) = bytes.first() else {
            return Err(Error::InvalidEnvelope("empty envelope".to_string()));
        };

        let header = match type_byte {
            TYPE_0 => TYPE_LENGTH,
            TYPE_1 => TYPE_LENGTH + KEY_LENGTH,
            other => {
                return Err(Error::InvalidEnvelope(format!("unknown type byte {other}")));
            }
        };
        if bytes.len() < header + IV_LENGTH + TAG_LENGTH {
            return Err(Error::InvalidEnvelope(format!(
                "short frame: {} bytes",
                bytes.len()
            )));
        }

        let sender_public_key = (type_byte == TYPE_1).then(|| {
            let mut key = [0u8; KEY_LENGTH];
            key.copy_from_slice(&bytes[TYPE_LENGTH..TYPE_LENGTH + KEY_LENGTH]);
            key
        });
        let mut iv = [0u8; IV_LENGTH];
        iv.copy_from_slice(&bytes[header..header + IV_LENGTH]);

        Ok(Envelope {
            type_byte,
            sender_public_key,
            iv,
            sealed: bytes[header + IV_LENGTH..].to_vec(),
        })
    }
}

/// Seals and opens envelopes with keys resolved through the keychain.
pub struct Crypto {
    keychain: Arc<Keychain>,
}

impl Crypto {
    pub fn new(keychain: Arc<Keychain>) -> Self {
        Self { keychain }
    }

    /// Encrypts `payload` as a type-0 envelope on `topic`.
    pub async fn encode(&self, topic: &str, payload: &str) -> Result<String> {
        let sym_key = self.keychain.get_sym_key(topic).await?;
        Ok(seal(&sym_key, random_iv(), payload, None)?.to_base64())
    }

    /// Encrypts `payload` as a type-1 key-agreement proposal, embedding the
    /// sender's public key so the peer can derive the shared secret.
    pub async fn encode_type1(
        &self,
        topic: &str,
        payload: &str,
        sender_public_key: &str,
    ) -> Result<String> {
        let sym_key = self.keychain.get_sym_key(topic).await?;
        let sender = decode_key(sender_public_key)?;
        Ok(seal(&sym_key, random_iv(), payload, Some(sender))?.to_base64())
    }

    /// Decrypts an envelope received on `topic`.
    pub async fn decode(&self, topic: &str, message: &str) -> Result<String> {
        self.decode_with_receiver(topic, message, None).await
    }

    /// Like [`decode`](Self::decode), but able to open a type-1 envelope on a
    /// topic with no symmetric key yet: the shared key is derived from our
    /// keypair under `receiver_public_key` and the embedded sender key, and
    /// persisted under `topic`.
    pub async fn decode_with_receiver(
        &self,
        topic: &str,
        message: &str,
        receiver_public_key: Option<&str>,
    ) -> Result<String> {
        let envelope = Envelope::from_base64(message)?;

        if envelope.type_byte == TYPE_1 && !self.keychain.has_keys(topic).await {
            let sender = envelope
                .sender_public_key
                .ok_or_else(|| Error::InvalidEnvelope("type 1 without sender key".to_string()))?;
            let receiver = receiver_public_key.ok_or_else(|| {
                Error::NoMatchingKey(format!("{topic} (no receiver key for type 1)"))
            })?;
            self.keychain
                .generate_shared_key(receiver, &hex::encode(sender), Some(topic))
                .await?;
        }

        let sym_key = self.keychain.get_sym_key(topic).await?;
        open(&sym_key, &envelope)
    }
}

fn random_iv() -> [u8; IV_LENGTH] {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);
    iv
}

fn seal(
    sym_key: &[u8; KEY_LENGTH],
    iv: [u8; IV_LENGTH],
    payload: &str,
    sender_public_key: Option<[u8; 32]>,
) -> Result<Envelope> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(sym_key));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), payload.as_bytes())
        .map_err(|_| Error::InvalidEnvelope("aead seal failure".to_string()))?;
    debug!("sealed {} payload bytes", payload.len());

    Ok(Envelope {
        type_byte: if sender_public_key.is_some() {
            TYPE_1
        } else {
            TYPE_0
        },
        sender_public_key,
        iv,
        sealed,
    })
}

fn open(sym_key: &[u8; KEY_LENGTH], envelope: &Envelope) -> Result<String> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(sym_key));
    let plain = cipher
        .decrypt(Nonce::from_slice(&envelope.iv), envelope.sealed.as_ref())
        .map_err(|_| Error::AuthenticationFailed)?;
    String::from_utf8(plain).map_err(|_| Error::InvalidEnvelope("payload is not utf-8".to_string()))
}
