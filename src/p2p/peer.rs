//! Peer management
//!
//! Live connection table of the overlay. Each entry owns the outbound
//! queue of one connection; removing the entry closes the connection.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

use super::dht::PeerRecord;
use super::{Message, PeerId};

/// An established overlay connection
#[derive(Debug)]
pub struct PeerConnection {
    /// Remote peer id
    pub peer_id: PeerId,
    /// Local id distinguishing repeated connections to the same peer
    pub conn_id: u64,
    /// Address the connection was made on
    pub remote_addr: SocketAddr,
    /// Address the peer accepts connections on
    pub listen_addr: SocketAddr,
    /// Peer that opened the connection
    pub dialer: PeerId,
    /// Topics the peer has subscribed to
    pub topics: HashSet<String>,
    /// Connection time
    pub connected_at: Instant,
    sender: mpsc::UnboundedSender<Message>,
}

impl PeerConnection {
    pub fn new(
        peer_id: PeerId,
        conn_id: u64,
        remote_addr: SocketAddr,
        listen_addr: SocketAddr,
        dialer: PeerId,
        sender: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            peer_id,
            conn_id,
            remote_addr,
            listen_addr,
            dialer,
            topics: HashSet::new(),
            connected_at: Instant::now(),
            sender,
        }
    }

    /// Queue a message; returns `false` if the connection is gone
    pub fn send(&self, message: Message) -> bool {
        self.sender.send(message).is_ok()
    }

    pub fn record(&self) -> PeerRecord {
        PeerRecord {
            peer_id: self.peer_id,
            addr: self.listen_addr,
        }
    }
}

/// Outcome of registering a connection
#[derive(Debug)]
pub enum Admission {
    /// First connection to this peer
    Accepted,
    /// Preferred over the existing connection, which is returned
    Replaced(PeerConnection),
    /// The existing connection is kept
    Rejected,
}

/// Peer manager
#[derive(Debug)]
pub struct PeerTable {
    /// Local peer id, used for the duplicate tie-break
    local: PeerId,
    /// Connected peers
    peers: HashMap<PeerId, PeerConnection>,
}

impl PeerTable {
    /// Create an empty table
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: HashMap::new(),
        }
    }

    /// Register a new connection.
    ///
    /// When two connections to the same peer exist, both ends keep the one
    /// dialed by the smaller peer id.
    pub fn admit(&mut self, conn: PeerConnection) -> Admission {
        let Some(existing) = self.peers.get(&conn.peer_id) else {
            self.peers.insert(conn.peer_id, conn);
            return Admission::Accepted;
        };

        let preferred = self.local.min(conn.peer_id);
        if existing.dialer != conn.dialer && conn.dialer == preferred {
            // Subscriptions belong to the peer, not the connection
            let mut conn = conn;
            conn.topics = existing.topics.clone();
            self.peers
                .insert(conn.peer_id, conn)
                .map_or(Admission::Accepted, Admission::Replaced)
        } else {
            Admission::Rejected
        }
    }

    /// Remove a peer if `conn_id` still identifies its current connection
    pub fn remove(&mut self, peer_id: &PeerId, conn_id: u64) -> Option<PeerConnection> {
        match self.peers.get(peer_id) {
            Some(conn) if conn.conn_id == conn_id => self.peers.remove(peer_id),
            _ => None,
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerConnection> {
        self.peers.get(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Record a topic subscription of a peer
    pub fn subscribe(&mut self, peer_id: &PeerId, topic: &str) {
        if let Some(conn) = self.peers.get_mut(peer_id) {
            conn.topics.insert(topic.to_string());
        }
    }

    pub fn unsubscribe(&mut self, peer_id: &PeerId, topic: &str) {
        if let Some(conn) = self.peers.get_mut(peer_id) {
            conn.topics.remove(topic);
        }
    }

    /// Get all connected peers
    pub fn connected(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Dialable records of every connected peer
    pub fn records(&self) -> Vec<PeerRecord> {
        self.peers.values().map(PeerConnection::record).collect()
    }

    /// Peers subscribed to `topic`
    pub fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|c| c.topics.contains(topic))
            .map(|c| c.peer_id)
            .collect()
    }

    /// Queue a message to every peer subscribed to `topic`, skipping `exclude`.
    ///
    /// Returns the number of peers the message was queued for.
    pub fn send_to_topic(&self, topic: &str, message: &Message, exclude: &[PeerId]) -> usize {
        self.peers
            .values()
            .filter(|c| c.topics.contains(topic) && !exclude.contains(&c.peer_id))
            .filter(|c| c.send(message.clone()))
            .count()
    }

    /// Queue a message to every connected peer
    pub fn send_to_all(&self, message: &Message) -> usize {
        self.peers.values().filter(|c| c.send(message.clone())).count()
    }

    /// Get number of connected peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop every connection
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::Identity;

    fn make_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    fn conn(
        peer: PeerId,
        conn_id: u64,
        dialer: PeerId,
    ) -> (PeerConnection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            PeerConnection::new(peer, conn_id, make_addr(9000), make_addr(4000), dialer, tx),
            rx,
        )
    }

    /// Two ids ordered as (smaller, larger)
    fn ordered_ids() -> (PeerId, PeerId) {
        let a = Identity::generate().peer_id();
        let b = Identity::generate().peer_id();
        (a.min(b), a.max(b))
    }

    #[test]
    fn test_admit_and_remove() {
        let local = Identity::generate().peer_id();
        let remote = Identity::generate().peer_id();
        let mut table = PeerTable::new(local);

        let (c, _rx) = conn(remote, 1, local);
        assert!(matches!(table.admit(c), Admission::Accepted));
        assert_eq!(table.len(), 1);

        // Stale connection id does not remove the live entry
        assert!(table.remove(&remote, 2).is_none());
        assert!(table.remove(&remote, 1).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_tie_break_is_symmetric() {
        let (small, large) = ordered_ids();

        // Table of the smaller peer: its own dial is preferred
        let mut table = PeerTable::new(small);
        let (inbound, _rx1) = conn(large, 1, large);
        let (outbound, _rx2) = conn(large, 2, small);
        assert!(matches!(table.admit(inbound), Admission::Accepted));
        assert!(matches!(table.admit(outbound), Admission::Replaced(old) if old.conn_id == 1));
        assert_eq!(table.get(&large).unwrap().dialer, small);

        // Table of the larger peer: the inbound dial from `small` is preferred
        let mut table = PeerTable::new(large);
        let (inbound, _rx3) = conn(small, 3, small);
        let (outbound, _rx4) = conn(small, 4, large);
        assert!(matches!(table.admit(inbound), Admission::Accepted));
        assert!(matches!(table.admit(outbound), Admission::Rejected));
        assert_eq!(table.get(&small).unwrap().dialer, small);
    }

    #[test]
    fn test_same_direction_duplicate_rejected() {
        let (small, large) = ordered_ids();
        let mut table = PeerTable::new(small);
        let (first, _rx1) = conn(large, 1, small);
        let (second, _rx2) = conn(large, 2, small);
        assert!(matches!(table.admit(first), Admission::Accepted));
        assert!(matches!(table.admit(second), Admission::Rejected));
    }

    #[test]
    fn test_topic_routing() {
        let local = Identity::generate().peer_id();
        let a = Identity::generate().peer_id();
        let b = Identity::generate().peer_id();
        let mut table = PeerTable::new(local);

        let (ca, mut rx_a) = conn(a, 1, local);
        let (cb, mut rx_b) = conn(b, 2, local);
        table.admit(ca);
        table.admit(cb);

        table.subscribe(&a, "transaction");
        table.subscribe(&b, "transaction");
        table.unsubscribe(&b, "transaction");
        assert_eq!(table.topic_peers("transaction"), vec![a]);

        let msg = Message::Subscribe("x".to_string());
        assert_eq!(table.send_to_topic("transaction", &msg, &[]), 1);
        assert_eq!(table.send_to_topic("transaction", &msg, &[a]), 0);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        assert_eq!(table.send_to_all(&msg), 2);
    }

    #[test]
    fn test_removed_connection_closes_queue() {
        let local = Identity::generate().peer_id();
        let remote = Identity::generate().peer_id();
        let mut table = PeerTable::new(local);
        let (c, mut rx) = conn(remote, 1, local);
        table.admit(c);
        table.clear();
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
