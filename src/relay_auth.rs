//! Relay authentication: ed25519 client identity and the signed JWT the
//! relay expects in its connection url.

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::ed25519::signature::SignerMut;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::constants::{JWT_ALG, JWT_TTL, JWT_TYP};
use crate::utils::{encode_iss, random_bytes32, unix_timestamp};

#[derive(Debug, Clone)]
pub struct Keypair {
    pub seed: [u8; 32],
    pub public_key: [u8; 32],
}

impl Keypair {
    pub fn generate() -> Self {
        Keypair::from_seed(random_bytes32())
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        Keypair {
            seed,
            public_key: signing_key.verifying_key().to_bytes(),
        }
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        let mut signing_key = SigningKey::from(self.seed);
        signing_key.sign(data).to_bytes()
    }

    /// The `did:key` identity the relay sees for this client.
    pub fn client_id(&self) -> String {
        encode_iss(&self.public_key)
    }
}

#[derive(Serialize, Deserialize)]
struct JwtHeader {
    alg: &'static str,
    typ: &'static str,
}

#[derive(Serialize, Deserialize)]
struct JwtPayload {
    iss: String,
    sub: String,
    aud: String,
    iat: u64,
    exp: u64,
}

fn encode_json<T: ?Sized + Serialize>(val: &T) -> String {
    let json = serde_json::to_string(val).expect("jwt segments serialize without maps");
    Base64UrlUnpadded::encode_string(json.as_bytes())
}

/// Signs the relay JWT: `iss` is the client id, `sub` a fresh 32-byte hex
/// session identifier, `aud` the relay url.
pub fn sign_jwt(aud: &str, keypair: &Keypair, iat: Option<u64>) -> String {
    let iat = iat.unwrap_or_else(unix_timestamp);
    let header = JwtHeader {
        alg: JWT_ALG,
        typ: JWT_TYP,
    };
    let payload = JwtPayload {
        iss: keypair.client_id(),
        sub: hex::encode(random_bytes32()),
        aud: aud.to_string(),
        iat,
        exp: iat + JWT_TTL,
    };

    let head_payload = format!("{}.{}", encode_json(&header), encode_json(&payload));
    let signature = keypair.sign(head_payload.as_bytes());
    format!(
        "{head_payload}.{}",
        Base64UrlUnpadded::encode_string(&signature)
    )
}

/// Builds the websocket url for the relay, carrying project id and auth.
pub fn relay_url(base: &str, project_id: &str, jwt: &str) -> String {
    format!("{base}/?projectId={project_id}&auth={jwt}")
}
