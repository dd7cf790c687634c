//! WalletConnect v2 relay protocol core.
//!
//! End-to-end encrypted, topic-addressed JSON-RPC messaging between two
//! peers through an untrusted relay. The crate covers the pairing bootstrap,
//! the websocket relayer, envelope crypto and scheduled expiry; session and
//! auth semantics live in the clients built on top.
//!
//! ```no_run
//! use std::sync::Arc;
//! use walletconnect_core::{Core, MemoryStorage};
//!
//! # async fn run() -> walletconnect_core::Result<()> {
//! let core = Core::init(Arc::new(MemoryStorage::new()), rand::random()).await?;
//! core.connect("wss://relay.walletconnect.org", "my-project-id").await?;
//!
//! let created = core.pairing().create().await?;
//! println!("scan this: {}", created.uri);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod constants;
pub mod core;
pub mod crypto;
pub mod error;
pub mod expirer;
pub mod keychain;
pub mod message_handler;
pub mod pairing;
pub mod relay_auth;
pub mod relayer;
pub mod rpc;
pub mod storage;
pub mod types;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_util;

pub use crate::core::Core;
pub use error::{Error, Result};
pub use pairing::{Pairing, PairingCreated, PairingEvent};
pub use storage::{KeyValueStorage, MemoryStorage};
pub use types::{Metadata, PairingRecord, RelayProtocolOptions};
