//! Pairing URI grammar and the key-derivation helpers shared by the
//! keychain and crypto layers.

use std::collections::HashMap;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use url::form_urlencoded;

use crate::constants::{
    DID_DELIMITER, DID_METHOD, DID_PREFIX, MULTICODEC_ED25519_BASE, MULTICODEC_ED25519_HEADER,
};
use crate::error::{Error, Result};
use crate::types::RelayProtocolOptions;

#[derive(Debug, Clone, PartialEq)]
pub struct UriParameters {
    pub topic: String,
    pub version: u32,
    pub sym_key: [u8; 32],
    pub relay: RelayProtocolOptions,
    pub methods: Option<Vec<String>>,
    pub expiry_timestamp: Option<u64>,
}

/// Parses `wc:{topic}@{version}?symKey=..&relay-protocol=..[&relay-data=..]`.
///
/// Unknown query parameters are ignored. A version other than 2 parses fine
/// and is recorded; rejecting it is the caller's decision.
pub fn parse_uri(input: &str) -> Result<UriParameters> {
    let rest = input
        .strip_prefix("wc://")
        .or_else(|| input.strip_prefix("wc:"))
        .ok_or_else(|| Error::InvalidUri("missing wc: scheme".to_string()))?;

    let (path, query_string) = rest
        .split_once('?')
        .ok_or_else(|| Error::InvalidUri("missing query".to_string()))?;
    let (topic, version) = path
        .split_once('@')
        .ok_or_else(|| Error::InvalidUri("missing @version".to_string()))?;

    if !is_lower_hex(topic, 64) {
        return Err(Error::InvalidUri(format!("bad topic: {topic}")));
    }
    let version = version
        .parse::<u32>()
        .map_err(|_| Error::InvalidUri(format!("bad version: {version}")))?;

    let mut params: HashMap<String, String> = HashMap::new();
    for (key, value) in form_urlencoded::parse(query_string.as_bytes()) {
        params.insert(key.into_owned(), value.into_owned());
    }

    let sym_key_hex = params
        .get("symKey")
        .ok_or_else(|| Error::InvalidUri("symKey not present".to_string()))?;
    let sym_key = decode_key(sym_key_hex)
        .map_err(|_| Error::InvalidUri(format!("bad symKey: {sym_key_hex}")))?;

    let protocol = params
        .get("relay-protocol")
        .ok_or_else(|| Error::InvalidUri("relay-protocol not present".to_string()))?
        .clone();
    let relay = RelayProtocolOptions {
        protocol,
        data: params.get("relay-data").cloned(),
    };

    let methods = params
        .get("methods")
        .map(|m| m.split(',').map(str::to_string).collect());
    let expiry_timestamp = params.get("expiryTimestamp").and_then(|v| v.parse().ok());

    Ok(UriParameters {
        topic: topic.to_string(),
        version,
        sym_key,
        relay,
        methods,
        expiry_timestamp,
    })
}

pub fn build_uri(topic: &str, sym_key: &[u8; 32], relay: &RelayProtocolOptions) -> String {
    let mut uri = format!(
        "wc:{topic}@2?symKey={}&relay-protocol={}",
        hex::encode(sym_key),
        relay.protocol
    );
    if let Some(data) = &relay.data {
        uri.push_str("&relay-data=");
        uri.push_str(data);
    }
    uri
}

pub fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len
        && s.bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

pub fn decode_key(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str)
        .map_err(|e| Error::InvalidEnvelope(format!("bad hex key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| Error::InvalidEnvelope("key is not 32 bytes".to_string()))
}

pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    Sha256::digest(data.as_ref()).into()
}

/// Topic for a symmetric key: hex(sha256(key)).
pub fn topic_from_key(sym_key: &[u8; 32]) -> String {
    hex::encode(sha256(sym_key))
}

/// X25519 agreement followed by HKDF-SHA256 with empty salt and info.
pub fn derive_sym_key(private_key: [u8; 32], peer_public_key: [u8; 32]) -> [u8; 32] {
    let secret = x25519_dalek::StaticSecret::from(private_key);
    let peer = x25519_dalek::PublicKey::from(peer_public_key);
    let shared = secret.diffie_hellman(&peer);

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut sym_key = [0u8; 32];
    hk.expand(&[], &mut sym_key)
        .expect("32 bytes is a valid hkdf-sha256 output length");
    sym_key
}

pub fn random_bytes32() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// `did:key` encoding of an ed25519 public key (multicodec 0xed01, base58btc).
pub fn encode_iss(public_key: &[u8; 32]) -> String {
    let header = bs58::decode(MULTICODEC_ED25519_HEADER)
        .into_vec()
        .expect("multicodec header is valid base58");

    let multicodec = format!(
        "{}{}",
        MULTICODEC_ED25519_BASE,
        bs58::encode([header.as_slice(), public_key].concat()).into_string()
    );

    [DID_PREFIX, DID_METHOD, &multicodec].join(DID_DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_uri() {
        let result = parse_uri(
            "wc:b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee@2?relay-protocol=iridium&symKey=761ab2f7f9deae2d5d18f887d2a8d812da0ec5fda0d0df8cc7ec1969832c0da2&expiryTimestamp=1742817708&methods=wc_sessionAuthenticate",
        )
        .unwrap();

        assert_eq!(
            result.topic,
            "b29dcadbdad95479378331a2563baa512a71c014c30015387798a29f95aa44ee"
        );
        assert_eq!(result.version, 2);
        assert_eq!(
            hex::encode(result.sym_key),
            "761ab2f7f9deae2d5d18f887d2a8d812da0ec5fda0d0df8cc7ec1969832c0da2"
        );
        assert_eq!(result.relay.protocol, "iridium");
        assert_eq!(result.relay.data, None);
        assert_eq!(
            result.methods,
            Some(vec!["wc_sessionAuthenticate".to_string()])
        );
        assert_eq!(result.expiry_timestamp, Some(1742817708));
    }

    #[test]
    fn parse_rejects_missing_sym_key() {
        let err = parse_uri(&format!("wc:{}@2?relay-protocol=iridium", "ab".repeat(32)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUri(_)));
    }

    #[test]
    fn parse_rejects_bad_topic() {
        let err = parse_uri(&format!(
            "wc:XYZ@2?relay-protocol=iridium&symKey={}",
            "ab".repeat(32)
        ))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidUri(_)));
    }

    #[test]
    fn parse_accepts_other_versions() {
        let result = parse_uri(&format!(
            "wc:{}@3?relay-protocol=iridium&symKey={}",
            "ab".repeat(32),
            "cd".repeat(32)
        ))
        .unwrap();
        assert_eq!(result.version, 3);
    }

    #[test]
    fn parse_ignores_unknown_params() {
        let result = parse_uri(&format!(
            "wc:{}@2?relay-protocol=iridium&symKey={}&futureParam=1",
            "ab".repeat(32),
            "cd".repeat(32)
        ))
        .unwrap();
        assert_eq!(result.version, 2);
    }

    #[test]
    fn uri_roundtrip() {
        let sym_key = random_bytes32();
        let topic = topic_from_key(&sym_key);
        let uri = build_uri(&topic, &sym_key, &RelayProtocolOptions::default());

        let parsed = parse_uri(&uri).unwrap();
        assert_eq!(parsed.topic, topic);
        assert_eq!(parsed.sym_key, sym_key);
        assert_eq!(parsed.relay, RelayProtocolOptions::default());
    }

    #[test]
    fn derive_sym_key_agrees_for_both_sides() {
        let a = random_bytes32();
        let b = random_bytes32();
        let a_pub = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(a));
        let b_pub = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(b));

        let ab = derive_sym_key(a, *b_pub.as_bytes());
        let ba = derive_sym_key(b, *a_pub.as_bytes());
        assert_eq!(ab, ba);
    }

    #[test]
    fn topic_is_hash_of_key() {
        let key = [0x11u8; 32];
        let topic = topic_from_key(&key);
        assert_eq!(topic, hex::encode(sha256(key)));
        assert!(is_lower_hex(&topic, 64));
    }
}
