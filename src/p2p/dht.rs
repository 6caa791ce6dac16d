//! Provider-record DHT
//!
//! Peers advertise themselves under a rendezvous key; searchers ask the
//! peers closest to that key (XOR distance over SHA-256) for the records
//! they hold. Records expire after a fixed TTL.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::PeerId;
use crate::crypto::hash_bytes;

/// A reachable peer: identity plus listen address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

/// Position of a rendezvous key in the id space
pub fn key_id(key: &str) -> [u8; 32] {
    hash_bytes(key.as_bytes()).0
}

/// XOR distance between two ids
pub fn distance(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

/// The `count` records closest to `target`, nearest first
pub fn nearest(mut records: Vec<PeerRecord>, target: &[u8; 32], count: usize) -> Vec<PeerRecord> {
    records.sort_by_key(|r| distance(r.peer_id.as_bytes(), target));
    records.truncate(count);
    records
}

#[derive(Debug, Clone)]
struct ProviderEntry {
    record: PeerRecord,
    expires: Instant,
}

/// Routing table and provider store of one node
#[derive(Debug)]
pub struct Dht {
    local: PeerId,
    replication: usize,
    provider_ttl: Duration,
    /// Known peers by id
    routing: HashMap<PeerId, PeerRecord>,
    /// Rendezvous key id -> providers
    providers: HashMap<[u8; 32], Vec<ProviderEntry>>,
}

impl Dht {
    pub fn new(local: PeerId, replication: usize, provider_ttl: Duration) -> Self {
        Self {
            local,
            replication: replication.max(1),
            provider_ttl,
            routing: HashMap::new(),
            providers: HashMap::new(),
        }
    }

    /// Number of peers an operation contacts
    pub fn replication(&self) -> usize {
        self.replication
    }

    /// Learn a peer record; the local node is never stored
    pub fn add_peer(&mut self, record: PeerRecord) {
        if record.peer_id != self.local {
            self.routing.insert(record.peer_id, record);
        }
    }

    pub fn remove_peer(&mut self, peer_id: &PeerId) {
        self.routing.remove(peer_id);
    }

    pub fn known_peers(&self) -> usize {
        self.routing.len()
    }

    /// The `count` known peers closest to `target`, nearest first
    pub fn closest(&self, target: &[u8; 32], count: usize) -> Vec<PeerRecord> {
        nearest(self.routing.values().copied().collect(), target, count)
    }

    /// Store (or refresh) a provider record
    pub fn add_provider(&mut self, key: &str, record: PeerRecord, now: Instant) {
        let expires = now + self.provider_ttl;
        let entries = self.providers.entry(key_id(key)).or_default();
        match entries.iter_mut().find(|e| e.record.peer_id == record.peer_id) {
            Some(entry) => {
                entry.record = record;
                entry.expires = expires;
            }
            None => entries.push(ProviderEntry { record, expires }),
        }
    }

    /// Live providers of `key`; expired records are dropped
    pub fn providers(&mut self, key: &str, now: Instant) -> Vec<PeerRecord> {
        let id = key_id(key);
        let Some(entries) = self.providers.get_mut(&id) else {
            return Vec::new();
        };
        entries.retain(|e| e.expires > now);
        let live: Vec<PeerRecord> = entries.iter().map(|e| e.record).collect();
        if entries.is_empty() {
            self.providers.remove(&id);
        }
        live
    }

    /// Drop expired provider records everywhere
    pub fn prune(&mut self, now: Instant) {
        self.providers.retain(|_, entries| {
            entries.retain(|e| e.expires > now);
            !entries.is_empty()
        });
    }
}
