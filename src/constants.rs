// Protocol constants: relay RPC method names, publish tags, TTLs and the
// storage namespace layout. Tag/TTL values are pinned to the pairing RPC
// table; unknown inbound tags are logged, never rejected.

use std::time::Duration;

pub const RELAY_PROTOCOL: &str = "iridium";

pub const RELAY_SUBSCRIBE: &str = "iridium_subscribe";
pub const RELAY_UNSUBSCRIBE: &str = "iridium_unsubscribe";
pub const RELAY_PUBLISH: &str = "iridium_publish";
pub const RELAY_SUBSCRIPTION: &str = "iridium_subscription";

pub const PAIRING_PING: &str = "wc_pairingPing";
pub const PAIRING_DELETE: &str = "wc_pairingDelete";

/// Publish tags for the pairing control plane.
pub const TAG_PAIRING_DELETE: u32 = 1001;
pub const TAG_PAIRING_DELETE_RESPONSE: u32 = 1000;
pub const TAG_PAIRING_PING: u32 = 1002;
pub const TAG_PAIRING_PING_RESPONSE: u32 = 1003;

/// Tags whose publishes are retried with backoff until the TTL deadline.
pub const SESSION_REQUEST_TAGS: &[u32] = &[1108];

pub const TTL_PAIRING_PING: Duration = Duration::from_secs(30);
pub const TTL_PAIRING_DELETE: Duration = Duration::from_secs(86_400);
/// Relay-side retention when the caller does not specify one.
pub const TTL_PUBLISH_DEFAULT: Duration = Duration::from_secs(6 * 60 * 60);

/// Lifetime of a pairing that has not seen a successful exchange yet.
pub const PAIRING_INACTIVE_EXPIRY: Duration = Duration::from_secs(5 * 60);
/// Lifetime granted on activation.
pub const PAIRING_ACTIVE_EXPIRY: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
pub const RPC_TIMEOUT: Duration = Duration::from_secs(15);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound message dedup window and cache bound.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEDUP_CAPACITY: usize = 1024;

pub const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Namespace prefix for every record persisted by the core.
pub const STORAGE_PREFIX: &str = "wc@2:core";
pub const STORE_PAIRINGS: &str = "pairing";
pub const STORE_EXPIRATIONS: &str = "expirer";
pub const STORE_KEYCHAIN: &str = "keychain";
pub const STORE_SUBSCRIPTIONS: &str = "subscription";
pub const STORE_MESSAGES: &str = "messages";

/// JSON-RPC error code used when a send fails at the socket and the error is
/// looped back to the waiting caller.
pub const TRANSPORT_ERROR_CODE: i64 = -32000;
/// Reason code sent with `wc_pairingDelete`.
pub const USER_DISCONNECTED_CODE: i64 = 6000;

// Relay JWT / did:key client identity.
pub const JWT_ALG: &str = "EdDSA";
pub const JWT_TYP: &str = "JWT";
pub const JWT_TTL: u64 = 24 * 60 * 60;

pub const DID_DELIMITER: &str = ":";
pub const DID_PREFIX: &str = "did";
pub const DID_METHOD: &str = "key";

pub const MULTICODEC_ED25519_BASE: &str = "z";
pub const MULTICODEC_ED25519_HEADER: &str = "K36";
