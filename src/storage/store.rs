//! sled-backed datastores: the Kademlia record/provider store and the peer
//! address book.
//!
//! Both live under the `statedir` handed over at configure time and are
//! opaque to the host. Record expiry instants are not persisted — a record
//! read back after a restart simply has no expiry and ages out of the DHT
//! through the normal republish cycle.

use std::borrow::Cow;
use std::path::Path;

use libp2p::kad::store::{Error as StoreError, RecordStore, Result as StoreResult};
use libp2p::kad::{ProviderRecord, Record, RecordKey, K_VALUE};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use thiserror::Error;
use tracing::warn;

/// Directory names under `statedir`. Versioned so a future layout change can
/// coexist with old state.
pub const PEERSTORE_DIR: &str = "libp2p-peerstore-v0";
pub const DHT_DIR: &str = "libp2p-dht-v0";

const MAX_RECORDS: usize = 1024;
const MAX_PROVIDED_KEYS: usize = 1024;
const MAX_VALUE_BYTES: usize = 65 * 1024;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    value: Vec<u8>,
    publisher: Option<Vec<u8>>,
}

#[derive(Serialize, Deserialize)]
struct StoredProvider {
    provider: Vec<u8>,
    addresses: Vec<String>,
}

/// Kademlia record store persisted in `statedir/libp2p-dht-v0`.
pub struct DhtStore {
    #[allow(dead_code)]
    db: Db,
    records: Tree,
    providers: Tree,
    local_peer: PeerId,
}

impl DhtStore {
    /// Open or create the DHT datastore at the given path.
    pub fn open(path: impl AsRef<Path>, local_peer: PeerId) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let records = db.open_tree("records")?;
        let providers = db.open_tree("providers")?;
        Ok(Self {
            db,
            records,
            providers,
            local_peer,
        })
    }

    fn decode_record(key: &[u8], raw: &[u8]) -> Option<Record> {
        let stored: StoredRecord = match serde_json::from_slice(raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "dropping corrupt DHT record");
                return None;
            }
        };
        let publisher = stored
            .publisher
            .as_deref()
            .and_then(|b| PeerId::from_bytes(b).ok());
        Some(Record {
            key: RecordKey::from(key.to_vec()),
            value: stored.value,
            publisher,
            expires: None,
        })
    }

    fn decode_providers(key: &[u8], raw: &[u8]) -> Vec<ProviderRecord> {
        let stored: Vec<StoredProvider> = match serde_json::from_slice(raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "dropping corrupt provider set");
                return Vec::new();
            }
        };
        stored
            .into_iter()
            .filter_map(|p| {
                let provider = PeerId::from_bytes(&p.provider).ok()?;
                let addresses = p
                    .addresses
                    .iter()
                    .filter_map(|a| a.parse::<Multiaddr>().ok())
                    .collect();
                Some(ProviderRecord {
                    key: RecordKey::from(key.to_vec()),
                    provider,
                    expires: None,
                    addresses,
                })
            })
            .collect()
    }

    fn encode_providers(records: &[ProviderRecord]) -> Result<Vec<u8>, StorageError> {
        let stored: Vec<StoredProvider> = records
            .iter()
            .map(|r| StoredProvider {
                provider: r.provider.to_bytes(),
                addresses: r.addresses.iter().map(|a| a.to_string()).collect(),
            })
            .collect();
        Ok(serde_json::to_vec(&stored)?)
    }
}

impl RecordStore for DhtStore {
    type RecordsIter<'a> = std::vec::IntoIter<Cow<'a, Record>>;
    type ProvidedIter<'a> = std::vec::IntoIter<Cow<'a, ProviderRecord>>;

    fn get(&self, k: &RecordKey) -> Option<Cow<'_, Record>> {
        let raw = self.records.get(k.as_ref()).ok().flatten()?;
        Self::decode_record(k.as_ref(), &raw).map(Cow::Owned)
    }

    fn put(&mut self, r: Record) -> StoreResult<()> {
        if r.value.len() > MAX_VALUE_BYTES {
            return Err(StoreError::ValueTooLarge);
        }
        let replacing = self.records.contains_key(r.key.as_ref()).unwrap_or(false);
        if !replacing && self.records.len() >= MAX_RECORDS {
            return Err(StoreError::MaxRecords);
        }
        let stored = StoredRecord {
            value: r.value,
            publisher: r.publisher.map(|p| p.to_bytes()),
        };
        let encoded = match serde_json::to_vec(&stored) {
            Ok(bytes) => bytes,
            Err(e) => {
                // kad's store error has no I/O variant; surface as capacity.
                warn!(error = %e, "failed to encode DHT record");
                return Err(StoreError::MaxRecords);
            }
        };
        if let Err(e) = self.records.insert(r.key.as_ref(), encoded) {
            warn!(error = %e, "failed to persist DHT record");
            return Err(StoreError::MaxRecords);
        }
        Ok(())
    }

    fn remove(&mut self, k: &RecordKey) {
        if let Err(e) = self.records.remove(k.as_ref()) {
            warn!(error = %e, "failed to remove DHT record");
        }
    }

    fn records(&self) -> Self::RecordsIter<'_> {
        let mut out = Vec::new();
        for item in self.records.iter() {
            let Ok((key, raw)) = item else { continue };
            if let Some(record) = Self::decode_record(&key, &raw) {
                out.push(Cow::Owned(record));
            }
        }
        out.into_iter()
    }

    fn add_provider(&mut self, record: ProviderRecord) -> StoreResult<()> {
        let key = record.key.clone();
        let mut existing = match self.providers.get(key.as_ref()) {
            Ok(Some(raw)) => Self::decode_providers(key.as_ref(), &raw),
            Ok(None) => {
                if self.providers.len() >= MAX_PROVIDED_KEYS {
                    return Err(StoreError::MaxProvidedKeys);
                }
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "failed to read provider set");
                return Err(StoreError::MaxProvidedKeys);
            }
        };

        existing.retain(|p| p.provider != record.provider);
        existing.push(record);
        // Bounded per key; oldest entries drop first.
        if existing.len() > K_VALUE.get() {
            let excess = existing.len() - K_VALUE.get();
            existing.drain(..excess);
        }

        let encoded = match Self::encode_providers(&existing) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode provider set");
                return Err(StoreError::MaxProvidedKeys);
            }
        };
        if let Err(e) = self.providers.insert(key.as_ref(), encoded) {
            warn!(error = %e, "failed to persist provider set");
            return Err(StoreError::MaxProvidedKeys);
        }
        Ok(())
    }

    fn providers(&self, key: &RecordKey) -> Vec<ProviderRecord> {
        match self.providers.get(key.as_ref()) {
            Ok(Some(raw)) => Self::decode_providers(key.as_ref(), &raw),
            _ => Vec::new(),
        }
    }

    fn provided(&self) -> Self::ProvidedIter<'_> {
        let mut out = Vec::new();
        for item in self.providers.iter() {
            let Ok((key, raw)) = item else { continue };
            for record in Self::decode_providers(&key, &raw) {
                if record.provider == self.local_peer {
                    out.push(Cow::Owned(record));
                }
            }
        }
        out.into_iter()
    }

    fn remove_provider(&mut self, k: &RecordKey, p: &PeerId) {
        let remaining: Vec<ProviderRecord> = match self.providers.get(k.as_ref()) {
            Ok(Some(raw)) => Self::decode_providers(k.as_ref(), &raw)
                .into_iter()
                .filter(|r| r.provider != *p)
                .collect(),
            _ => return,
        };
        let result = if remaining.is_empty() {
            self.providers.remove(k.as_ref()).map(|_| ())
        } else {
            match Self::encode_providers(&remaining) {
                Ok(bytes) => self.providers.insert(k.as_ref(), bytes).map(|_| ()),
                Err(e) => {
                    warn!(error = %e, "failed to encode provider set");
                    return;
                }
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to update provider set");
        }
    }
}

/// Peer address book persisted in `statedir/libp2p-peerstore-v0`.
///
/// Records every address learned from mDNS and identify so the routing table
/// can be rewarmed after a restart and `discoveredPeer` upcalls can carry
/// everything known about a peer.
pub struct PeerBook {
    #[allow(dead_code)]
    db: Db,
    addrs: Tree,
}

impl PeerBook {
    /// Open or create the peerstore at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let addrs = db.open_tree("addrs")?;
        Ok(Self { db, addrs })
    }

    /// Merge addresses into a peer's known set.
    pub fn add_addresses<'a>(
        &self,
        peer: &PeerId,
        new: impl IntoIterator<Item = &'a Multiaddr>,
    ) -> Result<(), StorageError> {
        let mut known: Vec<String> = match self.addrs.get(peer.to_bytes())? {
            Some(raw) => serde_json::from_slice(&raw)?,
            None => Vec::new(),
        };
        for addr in new {
            let s = addr.to_string();
            if !known.contains(&s) {
                known.push(s);
            }
        }
        self.addrs.insert(peer.to_bytes(), serde_json::to_vec(&known)?)?;
        Ok(())
    }

    /// All known addresses for a peer.
    pub fn addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let Ok(Some(raw)) = self.addrs.get(peer.to_bytes()) else {
            return Vec::new();
        };
        let known: Vec<String> = match serde_json::from_slice(&raw) {
            Ok(known) => known,
            Err(_) => return Vec::new(),
        };
        known.iter().filter_map(|s| s.parse().ok()).collect()
    }

    /// Every peer with at least one recorded address.
    pub fn peers(&self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        let mut out = Vec::new();
        for item in self.addrs.iter() {
            let Ok((key, raw)) = item else { continue };
            let Ok(peer) = PeerId::from_bytes(&key) else {
                continue;
            };
            let Ok(known) = serde_json::from_slice::<Vec<String>>(&raw) else {
                continue;
            };
            let addrs: Vec<Multiaddr> = known.iter().filter_map(|s| s.parse().ok()).collect();
            if !addrs.is_empty() {
                out.push((peer, addrs));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_round_trip_across_reopen() {
        let dir = tempdir().unwrap();
        let local = PeerId::random();
        let publisher = PeerId::random();
        let key = RecordKey::new(&b"/pk/abcd".to_vec());

        {
            let mut store = DhtStore::open(dir.path(), local).unwrap();
            let mut record = Record::new(key.clone(), b"value-bytes".to_vec());
            record.publisher = Some(publisher);
            store.put(record).unwrap();
        }

        let store = DhtStore::open(dir.path(), local).unwrap();
        let got = store.get(&key).expect("record must survive reopen");
        assert_eq!(got.value, b"value-bytes");
        assert_eq!(got.publisher, Some(publisher));
        assert_eq!(store.records().count(), 1);
    }

    #[test]
    fn test_put_rejects_oversized_values() {
        let dir = tempdir().unwrap();
        let mut store = DhtStore::open(dir.path(), PeerId::random()).unwrap();
        let record = Record::new(
            RecordKey::new(&b"/pk/big".to_vec()),
            vec![0u8; MAX_VALUE_BYTES + 1],
        );
        assert!(matches!(store.put(record), Err(StoreError::ValueTooLarge)));
    }

    #[test]
    fn test_remove_deletes_record() {
        let dir = tempdir().unwrap();
        let mut store = DhtStore::open(dir.path(), PeerId::random()).unwrap();
        let key = RecordKey::new(&b"/pk/gone".to_vec());
        store.put(Record::new(key.clone(), b"v".to_vec())).unwrap();
        store.remove(&key);
        assert!(store.get(&key).is_none());
    }

    #[test]
    fn test_provider_round_trip_and_provided_filter() {
        let dir = tempdir().unwrap();
        let local = PeerId::random();
        let other = PeerId::random();
        let key = RecordKey::new(&b"rendezvous".to_vec());

        let mut store = DhtStore::open(dir.path(), local).unwrap();
        for provider in [local, other] {
            store
                .add_provider(ProviderRecord {
                    key: key.clone(),
                    provider,
                    expires: None,
                    addresses: vec!["/ip4/10.0.0.1/tcp/8302".parse().unwrap()],
                })
                .unwrap();
        }

        assert_eq!(store.providers(&key).len(), 2);
        // provided() only reports our own announcements.
        let provided: Vec<_> = store.provided().collect();
        assert_eq!(provided.len(), 1);
        assert_eq!(provided[0].provider, local);

        store.remove_provider(&key, &other);
        assert_eq!(store.providers(&key).len(), 1);
    }

    #[test]
    fn test_peer_book_merges_addresses() {
        let dir = tempdir().unwrap();
        let book = PeerBook::open(dir.path()).unwrap();
        let peer = PeerId::random();
        let a: Multiaddr = "/ip4/10.0.0.1/tcp/8302".parse().unwrap();
        let b: Multiaddr = "/ip4/10.0.0.2/tcp/8302".parse().unwrap();

        book.add_addresses(&peer, [&a]).unwrap();
        book.add_addresses(&peer, [&a, &b]).unwrap();

        let addrs = book.addresses(&peer);
        assert_eq!(addrs.len(), 2, "duplicates must not accumulate");
        assert_eq!(book.peers().len(), 1);
        assert!(book.addresses(&PeerId::random()).is_empty());
    }
}
