//! Overlay network service
//!
//! Owns the listener, the connection table, joined topics, the provider
//! DHT and every background task. All tasks observe one stop signal and are
//! joined by [`Network::shutdown`].

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

use super::dht::{key_id, nearest, Dht, PeerRecord};
use super::gossip::{GossipMessage, SeenCache, Topics, SEEN_CACHE_CAPACITY};
use super::peer::{Admission, PeerConnection, PeerTable};
use super::protocol::{read_frame, write_frame, Hello, Message};
use super::stream::{logging_handler, InboundStream, LineStream, StreamHandler};
use super::{Identity, NetworkError, NetworkResult, PeerAddr, PeerId};
use crate::config::NetworkConfig;

type ProvidersReply = (Vec<PeerRecord>, Vec<PeerRecord>);

struct Inner {
    identity: Identity,
    config: NetworkConfig,
    listen_addr: SocketAddr,
    peers: Mutex<PeerTable>,
    topics: Mutex<Topics>,
    seen: Mutex<SeenCache>,
    dht: Mutex<Dht>,
    stream_handlers: Mutex<HashMap<String, StreamHandler>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ProvidersReply>>>,
    next_seqno: AtomicU64,
    next_conn_id: AtomicU64,
    next_request_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    tasks: Mutex<JoinSet<()>>,
}

/// Handle to a running overlay node; clones share the same node
#[derive(Clone)]
pub struct Network {
    inner: Arc<Inner>,
}

impl Network {
    /// Bind the listener, subscribe the default topic with a logging handler,
    /// dial the bootnode and start discovery.
    ///
    /// Bind and bootnode failures are returned; everything after that runs in
    /// the background.
    pub async fn start(config: NetworkConfig) -> NetworkResult<Network> {
        let identity = Identity::generate();
        let local = identity.peer_id();
        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen_addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let network = Network {
            inner: Arc::new(Inner {
                dht: Mutex::new(Dht::new(local, config.replication, config.provider_ttl)),
                peers: Mutex::new(PeerTable::new(local)),
                topics: Mutex::new(Topics::new()),
                seen: Mutex::new(SeenCache::new(SEEN_CACHE_CAPACITY)),
                stream_handlers: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_seqno: AtomicU64::new(1),
                next_conn_id: AtomicU64::new(1),
                next_request_id: AtomicU64::new(1),
                tasks: Mutex::new(JoinSet::new()),
                identity,
                config,
                listen_addr,
                stop_tx,
                stop_rx,
            }),
        };
        info!(target: "p2p", "Local peer {local} listening on {listen_addr}");

        let config = &network.inner.config;
        network.set_stream_handler(
            &config.stream_protocol,
            logging_handler(config.max_stream_read_errors),
        );

        let acceptor = network.clone();
        network.spawn(async move { acceptor.accept_loop(listener).await });

        let joined = network.subscribe(&config.default_topic, log_gossip);
        let bootstrapped = match (&config.bootnode, joined) {
            (_, Err(e)) => Err(e),
            (Some(bootnode), Ok(())) => network.bootstrap(bootnode).await,
            (None, Ok(())) => Ok(()),
        };
        if let Err(e) = bootstrapped {
            network.shutdown().await;
            return Err(e);
        }

        let discovery = network.clone();
        network.spawn(async move { discovery.discovery_loop().await });
        Ok(network)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.identity.peer_id()
    }

    /// Bound listen address
    pub fn listen_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Full dialable address of this node
    pub fn local_addr(&self) -> PeerAddr {
        PeerAddr::new(self.inner.listen_addr, Some(self.local_peer_id()))
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.peers.lock().connected()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.peers.lock().contains(peer)
    }

    /// Connected peers subscribed to `topic`
    pub fn topic_peers(&self, topic: &str) -> Vec<PeerId> {
        self.inner.peers.lock().topic_peers(topic)
    }

    /// Peers in the DHT routing table
    pub fn known_peers(&self) -> usize {
        self.inner.dht.lock().known_peers()
    }

    pub fn joined_topics(&self) -> Vec<String> {
        self.inner.topics.lock().joined()
    }

    pub fn is_stopping(&self) -> bool {
        *self.inner.stop_rx.borrow()
    }

    fn stop_signal(&self) -> watch::Receiver<bool> {
        self.inner.stop_rx.clone()
    }

    /// Track a background task; refused once shutdown has begun
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Checked under the lock so a task cannot slip past shutdown's take
        let mut tasks = self.inner.tasks.lock();
        if self.is_stopping() {
            return;
        }
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!(target: "p2p", "Network task panicked: {e}");
                }
            }
        }
        tasks.spawn(task);
    }

    // ---- connections ----

    async fn accept_loop(self, listener: TcpListener) {
        let mut stop = self.stop_signal();
        loop {
            let accepted = tokio::select! {
                _ = stopped(&mut stop) => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, remote)) => {
                    let network = self.clone();
                    self.spawn(async move {
                        if let Err(e) = network.handle_inbound(socket, remote).await {
                            debug!(target: "p2p", "Inbound connection from {remote} closed: {e}");
                        }
                    });
                }
                Err(e) => warn!(target: "p2p", "Accept failed: {e}"),
            }
        }
        debug!(target: "p2p", "Accept loop stopped");
    }

    async fn handle_inbound(&self, mut socket: TcpStream, remote: SocketAddr) -> NetworkResult<()> {
        let hello = self.read_hello(&mut socket).await?;

        if hello.protocol == self.inner.config.overlay_protocol {
            self.send_hello(&mut socket, &hello.protocol).await?;
            let dialer = hello.peer_id;
            self.register(socket, remote, hello, dialer)?;
            return Ok(());
        }

        let handler = self.inner.stream_handlers.lock().get(&hello.protocol).cloned();
        let Some(handler) = handler else {
            return Err(NetworkError::Handshake(format!(
                "unsupported protocol {}",
                hello.protocol
            )));
        };
        self.send_hello(&mut socket, &hello.protocol).await?;

        let mut stop = self.stop_signal();
        let stream = InboundStream::new(hello.peer_id, socket);
        tokio::select! {
            _ = stopped(&mut stop) => {}
            _ = handler(stream) => {}
        }
        Ok(())
    }

    async fn send_hello(&self, socket: &mut TcpStream, protocol: &str) -> NetworkResult<()> {
        let hello = Hello {
            protocol: protocol.to_string(),
            peer_id: self.local_peer_id(),
            public_key: self.inner.identity.public_key().clone(),
            listen_addr: self.inner.listen_addr,
        };
        write_frame(socket, &Message::Hello(hello)).await
    }

    async fn read_hello(&self, socket: &mut TcpStream) -> NetworkResult<Hello> {
        let message = timeout(self.inner.config.query_timeout, read_frame(socket))
            .await
            .map_err(|_| NetworkError::Timeout("handshake".to_string()))??;

        let hello = match message {
            Message::Hello(hello) => hello,
            other => {
                return Err(NetworkError::Handshake(format!(
                    "expected hello, got {}",
                    other.command()
                )))
            }
        };
        if !hello.is_consistent() {
            return Err(NetworkError::Handshake(
                "peer id does not match public key".to_string(),
            ));
        }
        if hello.peer_id == self.local_peer_id() {
            return Err(NetworkError::Handshake("connection to self".to_string()));
        }
        Ok(hello)
    }

    /// Open a TCP connection and exchange hellos under `protocol`
    async fn dial(&self, addr: PeerAddr, protocol: &str) -> NetworkResult<(TcpStream, Hello)> {
        let limit = self.inner.config.query_timeout;
        let mut socket = timeout(limit, TcpStream::connect(addr.socket))
            .await
            .map_err(|_| NetworkError::Timeout(format!("connecting to {}", addr.socket)))??;

        self.send_hello(&mut socket, protocol).await?;
        let hello = self.read_hello(&mut socket).await?;

        if hello.protocol != protocol {
            return Err(NetworkError::Handshake(format!(
                "peer answered with protocol {}",
                hello.protocol
            )));
        }
        if let Some(expected) = addr.peer_id {
            if expected != hello.peer_id {
                return Err(NetworkError::Handshake(format!(
                    "expected {expected}, reached {}",
                    hello.peer_id
                )));
            }
        }
        Ok((socket, hello))
    }

    async fn bootstrap(&self, bootnode: &str) -> NetworkResult<()> {
        let addr: PeerAddr = bootnode.parse()?;
        let peer = self.connect(addr).await?;
        info!(target: "p2p", "Bootstrapped from {peer} at {}", addr.socket);
        Ok(())
    }

    /// Dial a peer and add it to the connection table
    pub async fn connect(&self, addr: PeerAddr) -> NetworkResult<PeerId> {
        if self.is_stopping() {
            return Err(NetworkError::ShuttingDown);
        }
        if let Some(id) = addr.peer_id {
            if id == self.local_peer_id() {
                return Err(NetworkError::Handshake("refusing to dial self".to_string()));
            }
            if self.is_connected(&id) {
                return Ok(id);
            }
        }

        let protocol = self.inner.config.overlay_protocol.clone();
        let (socket, hello) = self.dial(addr, &protocol).await?;
        let peer_id = hello.peer_id;
        let local = self.local_peer_id();
        self.register(socket, addr.socket, hello, local)?;
        Ok(peer_id)
    }

    /// Admit a handshaken connection and start its reader and writer.
    ///
    /// Returns `false` when an existing connection to the same peer wins.
    fn register(
        &self,
        socket: TcpStream,
        remote: SocketAddr,
        hello: Hello,
        dialer: PeerId,
    ) -> NetworkResult<bool> {
        if self.is_stopping() {
            return Err(NetworkError::ShuttingDown);
        }
        let peer_id = hello.peer_id;
        let conn_id = self.inner.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (sender, outbound) = mpsc::unbounded_channel();
        let conn = PeerConnection::new(
            peer_id,
            conn_id,
            remote,
            advertised_addr(hello.listen_addr, remote),
            dialer,
            sender,
        );
        let record = conn.record();

        {
            // Lock order: topics, then peers
            let topics = self.inner.topics.lock();
            for topic in topics.joined() {
                conn.send(Message::Subscribe(topic));
            }
            match self.inner.peers.lock().admit(conn) {
                Admission::Accepted => {
                    info!(target: "p2p", "Connected to {peer_id} at {remote}")
                }
                Admission::Replaced(old) => {
                    debug!(target: "p2p", "Connection {conn_id} to {peer_id} replaces {}", old.conn_id)
                }
                Admission::Rejected => {
                    debug!(target: "p2p", "Keeping existing connection to {peer_id}");
                    return Ok(false);
                }
            }
        }
        self.inner.dht.lock().add_peer(record);

        let (reader, writer) = socket.into_split();
        let network = self.clone();
        self.spawn(async move { network.write_loop(writer, outbound).await });
        let network = self.clone();
        self.spawn(async move { network.read_loop(reader, peer_id, conn_id).await });
        Ok(true)
    }

    async fn write_loop(
        self,
        mut writer: OwnedWriteHalf,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) {
        let mut stop = self.stop_signal();
        loop {
            let next = tokio::select! {
                _ = stopped(&mut stop) => break,
                next = outbound.recv() => next,
            };
            let Some(message) = next else { break };
            if let Err(e) = write_frame(&mut writer, &message).await {
                debug!(target: "p2p", "Write of {} failed: {e}", message.command());
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn read_loop(self, mut reader: OwnedReadHalf, peer_id: PeerId, conn_id: u64) {
        let mut stop = self.stop_signal();
        loop {
            let frame = tokio::select! {
                _ = stopped(&mut stop) => break,
                frame = read_frame(&mut reader) => frame,
            };
            match frame {
                Ok(message) => self.handle_message(peer_id, message),
                Err(NetworkError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!(target: "p2p", "Dropping connection {conn_id} to {peer_id}: {e}");
                    break;
                }
            }
        }
        // Lock order: peers, then dht
        let mut peers = self.inner.peers.lock();
        if peers.remove(&peer_id, conn_id).is_some() {
            self.inner.dht.lock().remove_peer(&peer_id);
            drop(peers);
            info!(target: "p2p", "Disconnected from {peer_id}");
        }
    }

    fn handle_message(&self, from: PeerId, message: Message) {
        match message {
            Message::Hello(_) => debug!(target: "p2p", "Ignoring repeated hello from {from}"),
            Message::Subscribe(topic) => {
                debug!(target: "gossip", "{from} subscribed to {topic}");
                self.inner.peers.lock().subscribe(&from, &topic);
            }
            Message::Unsubscribe(topic) => {
                debug!(target: "gossip", "{from} unsubscribed from {topic}");
                self.inner.peers.lock().unsubscribe(&from, &topic);
            }
            Message::Publish(gossip) => self.handle_publish(from, gossip),
            Message::AddProvider { key, provider } => {
                // A peer may only advertise itself, at the address we know it by
                if provider.peer_id != from {
                    warn!(target: "discovery", "{from} advertised foreign record {}", provider.peer_id);
                    return;
                }
                let record = self.inner.peers.lock().get(&from).map(PeerConnection::record);
                if let Some(record) = record {
                    self.inner.dht.lock().add_provider(&key, record, Instant::now());
                }
            }
            Message::GetProviders { request_id, key } => {
                let (providers, closer) = {
                    let mut dht = self.inner.dht.lock();
                    let providers = dht.providers(&key, Instant::now());
                    let closer = dht.closest(&key_id(&key), dht.replication());
                    (providers, closer)
                };
                let reply = Message::Providers {
                    request_id,
                    providers,
                    closer,
                };
                if let Some(conn) = self.inner.peers.lock().get(&from) {
                    conn.send(reply);
                }
            }
            Message::Providers {
                request_id,
                providers,
                closer,
            } => {
                let waiting = self.inner.pending.lock().remove(&request_id);
                match waiting {
                    Some(reply) => {
                        let _ = reply.send((providers, closer));
                    }
                    None => debug!(target: "discovery", "Late providers answer {request_id} from {from}"),
                }
            }
        }
    }

    // ---- publish/subscribe ----

    fn handle_publish(&self, from: PeerId, gossip: GossipMessage) {
        if self.inner.seen.lock().contains(&gossip.id) {
            return;
        }
        if !gossip.verify() {
            warn!(target: "gossip", "Dropping message with bad signature from {from}");
            return;
        }
        if !self.inner.seen.lock().insert(gossip.id) {
            return;
        }

        let topic = gossip.topic.clone();
        let exclude = [from, gossip.source];
        self.inner.topics.lock().deliver(gossip.clone());
        let forwarded =
            self.inner
                .peers
                .lock()
                .send_to_topic(&topic, &Message::Publish(gossip), &exclude);
        debug!(target: "gossip", "Message on {topic} from {from} forwarded to {forwarded} peers");
    }

    fn join_topic(&self, topic: &str) -> broadcast::Sender<GossipMessage> {
        let mut topics = self.inner.topics.lock();
        let (sender, fresh) = topics.join(topic);
        if fresh {
            let notified = self
                .inner
                .peers
                .lock()
                .send_to_all(&Message::Subscribe(topic.to_string()));
            info!(target: "gossip", "Joined topic {topic} ({notified} peers notified)");
        }
        sender
    }

    /// Join a topic without delivering its messages anywhere
    pub fn join(&self, topic: &str) {
        self.join_topic(topic);
    }

    /// Leave a topic; its delivery loops end
    pub fn leave(&self, topic: &str) {
        let mut topics = self.inner.topics.lock();
        if topics.leave(topic) {
            self.inner
                .peers
                .lock()
                .send_to_all(&Message::Unsubscribe(topic.to_string()));
            info!(target: "gossip", "Left topic {topic}");
        }
    }

    /// Join `topic` and run `handler` for every message on it that another
    /// peer originated.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> NetworkResult<()>
    where
        F: Fn(GossipMessage) + Send + 'static,
    {
        if self.is_stopping() {
            return Err(NetworkError::ShuttingDown);
        }
        let receiver = self.join_topic(topic).subscribe();
        let network = self.clone();
        let topic = topic.to_string();
        self.spawn(async move { network.delivery_loop(topic, receiver, handler).await });
        Ok(())
    }

    async fn delivery_loop<F>(
        self,
        topic: String,
        mut receiver: broadcast::Receiver<GossipMessage>,
        handler: F,
    ) where
        F: Fn(GossipMessage) + Send + 'static,
    {
        let local = self.local_peer_id();
        let mut stop = self.stop_signal();
        loop {
            let next = tokio::select! {
                _ = stopped(&mut stop) => break,
                next = receiver.recv() => next,
            };
            match next {
                Ok(message) if message.source == local => continue,
                Ok(message) => handler(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(target: "gossip", "Delivery loop for {topic} skipped {skipped} messages")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(target: "gossip", "Delivery loop for {topic} stopped");
    }

    /// Publish `data` to the connected subscribers of `topic`.
    ///
    /// Best effort: returns the number of peers the message was queued for.
    pub fn broadcast(&self, topic: &str, data: Vec<u8>) -> NetworkResult<usize> {
        if self.is_stopping() {
            return Err(NetworkError::ShuttingDown);
        }
        self.join_topic(topic);

        let seqno = self.inner.next_seqno.fetch_add(1, Ordering::SeqCst);
        let gossip = GossipMessage::sign(&self.inner.identity, topic, seqno, data)?;
        self.inner.seen.lock().insert(gossip.id);
        self.inner.topics.lock().deliver(gossip.clone());

        let sent = self
            .inner
            .peers
            .lock()
            .send_to_topic(topic, &Message::Publish(gossip), &[]);
        debug!(target: "gossip", "Published on {topic} to {sent} peers");
        Ok(sent)
    }

    // ---- discovery ----

    /// Record of this node as others should dial it
    fn local_record(&self) -> PeerRecord {
        PeerRecord {
            peer_id: self.local_peer_id(),
            addr: self.inner.listen_addr,
        }
    }

    /// Announce this node as a provider of `key` to the closest connected peers
    pub fn advertise(&self, key: &str) -> usize {
        let record = self.local_record();
        let replication = {
            let mut dht = self.inner.dht.lock();
            dht.add_provider(key, record, Instant::now());
            dht.replication()
        };

        let peers = self.inner.peers.lock();
        let message = Message::AddProvider {
            key: key.to_string(),
            provider: record,
        };
        nearest(peers.records(), &key_id(key), replication)
            .iter()
            .filter_map(|target| peers.get(&target.peer_id))
            .filter(|conn| conn.send(message.clone()))
            .count()
    }

    /// Look up providers of `key` locally and at the closest connected peers
    pub async fn find_providers(&self, key: &str) -> NetworkResult<Vec<PeerRecord>> {
        let local = self.local_peer_id();
        let (mut found, replication): (HashMap<PeerId, PeerRecord>, usize) = {
            let mut dht = self.inner.dht.lock();
            let found = dht
                .providers(key, Instant::now())
                .into_iter()
                .map(|r| (r.peer_id, r))
                .collect();
            (found, dht.replication())
        };

        let targets = nearest(self.inner.peers.lock().records(), &key_id(key), replication);
        let mut failures = 0;
        for target in &targets {
            match self.query_providers(target.peer_id, key).await {
                Ok((providers, closer)) => {
                    // Only connected peers enter the routing table
                    debug!(
                        target: "discovery",
                        "{} returned {} providers and {} closer peers",
                        target.peer_id,
                        providers.len(),
                        closer.len()
                    );
                    for provider in providers {
                        found.insert(provider.peer_id, provider);
                    }
                }
                Err(e) => {
                    failures += 1;
                    debug!(target: "discovery", "Providers query to {} failed: {e}", target.peer_id);
                }
            }
        }

        found.remove(&local);
        if found.is_empty() && !targets.is_empty() && failures == targets.len() {
            return Err(NetworkError::Discovery(format!(
                "all {failures} provider queries failed"
            )));
        }
        Ok(found.into_values().collect())
    }

    async fn query_providers(&self, peer: PeerId, key: &str) -> NetworkResult<ProvidersReply> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, reply_tx);

        let request = Message::GetProviders {
            request_id,
            key: key.to_string(),
        };
        let sent = self
            .inner
            .peers
            .lock()
            .get(&peer)
            .is_some_and(|conn| conn.send(request));
        if !sent {
            self.inner.pending.lock().remove(&request_id);
            return Err(NetworkError::NotConnected(peer));
        }

        let answer = timeout(self.inner.config.query_timeout, reply_rx).await;
        self.inner.pending.lock().remove(&request_id);
        match answer {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NetworkError::Discovery(format!("query to {peer} dropped"))),
            Err(_) => Err(NetworkError::Timeout(format!("providers query to {peer}"))),
        }
    }

    /// One discovery iteration: re-advertise, look up providers and dial
    /// the ones not yet connected. Returns the number of new connections.
    pub async fn discover_once(&self) -> usize {
        let key = self.inner.config.discovery_key.clone();
        self.advertise(&key);
        self.inner.dht.lock().prune(Instant::now());

        let providers = match self.find_providers(&key).await {
            Ok(providers) => providers,
            Err(e) => {
                warn!(target: "discovery", "Provider lookup failed: {e}");
                return 0;
            }
        };

        let mut connected = 0;
        for record in providers {
            if self.is_connected(&record.peer_id) {
                continue;
            }
            match self.connect(PeerAddr::new(record.addr, Some(record.peer_id))).await {
                Ok(peer) => {
                    info!(target: "discovery", "Connected to discovered peer {peer}");
                    connected += 1;
                }
                Err(e) => warn!(target: "discovery", "Failed to connect to {}: {e}", record.peer_id),
            }
        }
        connected
    }

    async fn discovery_loop(self) {
        let mut stop = self.stop_signal();
        let config = self.inner.config.clone();

        if !pause(&mut stop, config.bootstrap_settle).await {
            return;
        }
        let notified = self.advertise(&config.discovery_key);
        info!(target: "discovery", "Advertising under {} to {notified} peers", config.discovery_key);

        if !pause(&mut stop, config.advertise_settle).await {
            return;
        }
        loop {
            self.discover_once().await;
            if !pause(&mut stop, config.discovery_interval).await {
                break;
            }
        }
        debug!(target: "discovery", "Discovery loop stopped");
    }

    // ---- direct streams ----

    /// Register the handler for inbound streams of `protocol`
    pub fn set_stream_handler(&self, protocol: &str, handler: StreamHandler) {
        self.inner
            .stream_handlers
            .lock()
            .insert(protocol.to_string(), handler);
    }

    /// Open a line stream to a connected peer
    pub async fn open_stream(&self, peer: PeerId) -> NetworkResult<LineStream> {
        let addr = self
            .inner
            .peers
            .lock()
            .get(&peer)
            .map(|conn| conn.listen_addr)
            .ok_or(NetworkError::NotConnected(peer))?;
        let protocol = self.inner.config.stream_protocol.clone();
        let (socket, _) = self.dial(PeerAddr::new(addr, Some(peer)), &protocol).await?;
        Ok(LineStream::new(peer, socket))
    }

    /// Send one line to a peer over a fresh stream
    pub async fn send_message(&self, peer: PeerId, line: &str) -> NetworkResult<()> {
        let mut stream = self.open_stream(peer).await?;
        stream.write_line(line).await?;
        stream.close().await
    }

    // ---- shutdown ----

    /// Stop every background task and wait for them to finish
    pub async fn shutdown(&self) {
        if self.inner.stop_tx.send_replace(true) {
            return;
        }
        info!(target: "p2p", "Shutting down network");

        let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!(target: "p2p", "Network task panicked: {e}");
                }
            }
        }

        self.inner.peers.lock().clear();
        self.inner.topics.lock().clear();
        self.inner.pending.lock().clear();
        info!(target: "p2p", "Network stopped");
    }
}

/// Handler for the default topic
fn log_gossip(message: GossipMessage) {
    info!(
        target: "gossip",
        "{} on {}: {}",
        message.source,
        message.topic,
        message.payload_text()
    );
}

/// Resolve once shutdown has been signalled, including before the call
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopping| *stopping).await;
}

/// Sleep unless the stop signal fires first; returns `false` on stop
async fn pause(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = stopped(stop) => false,
        _ = sleep(duration) => true,
    }
}

/// Address peers should dial: an unspecified listen ip is replaced by the
/// ip the connection came from
fn advertised_addr(listen: SocketAddr, remote: SocketAddr) -> SocketAddr {
    if listen.ip().is_unspecified() {
        SocketAddr::new(remote.ip(), listen.port())
    } else {
        listen
    }
}
