//! Topic publish/subscribe
//!
//! Messages are signed by their originator and identified by
//! `(source, seqno)`. Receivers verify, de-duplicate through a bounded seen
//! cache and forward each new message once to their other subscribers.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::broadcast;

use super::{Identity, PeerId};
use crate::codec::{self, SerializationError};
use crate::crypto::{double_hash, hash_bytes, Hash, PublicKey, SchnorrSignature};

/// Default size of the seen-message cache
pub const SEEN_CACHE_CAPACITY: usize = 4096;

/// Buffered messages per topic channel before slow loops start lagging
pub const TOPIC_CHANNEL_CAPACITY: usize = 256;

/// A signed topic message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    /// Unique id derived from source and sequence number
    pub id: Hash,
    pub topic: String,
    /// Originating peer
    pub source: PeerId,
    /// Per-source sequence number
    pub seqno: u64,
    pub data: Vec<u8>,
    /// Originator's key; must hash to `source`
    pub key: PublicKey,
    pub signature: SchnorrSignature,
}

impl GossipMessage {
    /// Build and sign a message originated by `identity`
    pub fn sign(
        identity: &Identity,
        topic: &str,
        seqno: u64,
        data: Vec<u8>,
    ) -> Result<Self, SerializationError> {
        let source = identity.peer_id();
        let digest = signing_digest(topic, &source, seqno, &data)?;
        Ok(Self {
            id: message_id(&source, seqno),
            topic: topic.to_string(),
            source,
            seqno,
            data,
            key: identity.public_key().clone(),
            signature: identity.private_key().sign(&digest),
        })
    }

    /// Check id, key binding and signature
    pub fn verify(&self) -> bool {
        if PeerId::from_public_key(&self.key) != self.source {
            return false;
        }
        if message_id(&self.source, self.seqno) != self.id {
            return false;
        }
        match signing_digest(&self.topic, &self.source, self.seqno, &self.data) {
            Ok(digest) => self.key.verify(&digest, &self.signature),
            Err(_) => false,
        }
    }

    /// Payload as text, or hex when it is not UTF-8
    pub fn payload_text(&self) -> String {
        match std::str::from_utf8(&self.data) {
            Ok(text) => text.to_string(),
            Err(_) => hex::encode(&self.data),
        }
    }
}

fn message_id(source: &PeerId, seqno: u64) -> Hash {
    let mut buffer = Vec::with_capacity(40);
    buffer.extend_from_slice(source.as_bytes());
    buffer.extend_from_slice(&seqno.to_le_bytes());
    hash_bytes(&buffer)
}

fn signing_digest(
    topic: &str,
    source: &PeerId,
    seqno: u64,
    data: &[u8],
) -> Result<Hash, SerializationError> {
    Ok(double_hash(&codec::encode(&(topic, source, seqno, data))?))
}

/// Bounded set of recently seen message ids; oldest ids are evicted first
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    order: VecDeque<Hash>,
    ids: HashSet<Hash>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Record an id; returns `false` if it was already present
    pub fn insert(&mut self, id: Hash) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: &Hash) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Locally joined topics and their delivery channels
#[derive(Debug, Default)]
pub struct Topics {
    channels: HashMap<String, broadcast::Sender<GossipMessage>>,
}

impl Topics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a topic; returns its channel and whether it was newly joined
    pub fn join(&mut self, topic: &str) -> (broadcast::Sender<GossipMessage>, bool) {
        if let Some(sender) = self.channels.get(topic) {
            return (sender.clone(), false);
        }
        let (sender, _) = broadcast::channel(TOPIC_CHANNEL_CAPACITY);
        self.channels.insert(topic.to_string(), sender.clone());
        (sender, true)
    }

    /// Leave a topic; its delivery loops observe a closed channel
    pub fn leave(&mut self, topic: &str) -> bool {
        self.channels.remove(topic).is_some()
    }

    pub fn is_joined(&self, topic: &str) -> bool {
        self.channels.contains_key(topic)
    }

    pub fn joined(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Hand a message to local delivery loops of its topic
    pub fn deliver(&self, message: GossipMessage) {
        if let Some(sender) = self.channels.get(&message.topic) {
            if sender.send(message).is_err() {
                debug!(target: "gossip", "No delivery loop running for joined topic");
            }
        }
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }
}
