use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Peer application metadata exchanged during pairing.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub name: String,
    pub description: String,
    pub url: String,
    pub icons: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RelayProtocolOptions {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Default for RelayProtocolOptions {
    fn default() -> Self {
        Self {
            protocol: crate::constants::RELAY_PROTOCOL.to_string(),
            data: None,
        }
    }
}

/// A pairing as persisted in the pairing store.
///
/// `extra` keeps any fields written by a newer client so records survive a
/// round-trip through an older one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PairingRecord {
    pub topic: String,
    pub relay: RelayProtocolOptions,
    pub expiry: u64,
    pub active: bool,
    #[serde(rename = "peerMetadata", skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<Metadata>,
    #[serde(rename = "selfMetadata", skip_serializing_if = "Option::is_none")]
    pub self_metadata: Option<Metadata>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PairingRecord {
    pub fn new(topic: String, relay: RelayProtocolOptions, expiry: u64) -> Self {
        Self {
            topic,
            relay,
            expiry,
            active: false,
            peer_metadata: None,
            self_metadata: None,
            extra: Map::new(),
        }
    }
}

/// A live (topic, relay) binding as acknowledged by the relay.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub id: String,
    pub topic: String,
    pub relay: RelayProtocolOptions,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reason attached to `wc_pairingDelete`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorReason {
    pub code: i64,
    pub message: String,
}

impl ErrorReason {
    pub fn user_disconnected() -> Self {
        Self {
            code: crate::constants::USER_DISCONNECTED_CODE,
            message: "User disconnected.".to_string(),
        }
    }
}
