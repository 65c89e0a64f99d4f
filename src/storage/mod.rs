//! Persistent state: the two opaque datastore directories under `statedir`.
//!
//! Uses sled embedded databases for fast, reliable storage.

pub mod store;

pub use store::{DhtStore, PeerBook, StorageError, DHT_DIR, PEERSTORE_DIR};
