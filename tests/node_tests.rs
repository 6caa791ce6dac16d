//! Two full nodes on loopback: transaction gossip, mining and shutdown

use kiln_core::config::{ChainConfig, NetworkConfig, NodeConfig};
use kiln_core::consensus::Transaction;
use kiln_core::crypto::{Address, Hash};
use kiln_core::node::{BlockAnnouncement, Node, NodeError, BLOCK_TOPIC, TRANSACTION_TOPIC};
use kiln_core::storage::ChainError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

fn node_config(dir: &TempDir, bootnode: Option<&Node>) -> NodeConfig {
    NodeConfig {
        data_dir: dir.path().join("chain"),
        chain: ChainConfig {
            difficulty: 6,
            ..ChainConfig::default()
        },
        network: NetworkConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            bootnode: bootnode.map(|n| n.network().local_addr().to_string()),
            discovery_interval: Duration::from_millis(200),
            bootstrap_settle: Duration::from_millis(50),
            advertise_settle: Duration::from_millis(100),
            ..NetworkConfig::default()
        },
        ..NodeConfig::default()
    }
}

async fn wait_until(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    false
}

async fn pair() -> (Arc<Node>, Arc<Node>, TempDir, TempDir) {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let a = Node::start(node_config(&dir_a, None)).await.unwrap();
    let b = Node::start(node_config(&dir_b, Some(&a))).await.unwrap();

    let a_id = a.local_peer_id();
    let b_id = b.local_peer_id();
    assert!(
        wait_until(Duration::from_secs(5), || {
            b.network().topic_peers(TRANSACTION_TOPIC).contains(&a_id)
                && a.network().topic_peers(TRANSACTION_TOPIC).contains(&b_id)
        })
        .await
    );
    (a, b, dir_a, dir_b)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transaction_gossip_and_mining() {
    let (a, b, _dir_a, _dir_b) = pair().await;

    let tx = Transaction::new(Address([1; 20]), Address([2; 20]), 1, 50);
    a.add_transaction(tx.clone()).unwrap();
    assert_eq!(a.pool().len(), 1);
    assert!(wait_until(Duration::from_secs(5), || b.pool().len() == 1).await);

    let block = a.mine_block().await.unwrap();
    assert_eq!(block.height, 1);
    assert_eq!(block.transactions, vec![tx]);
    assert!(a.pool().is_empty());

    let status = a.chain().status().await.unwrap();
    assert_eq!(status.height, 2);
    assert_eq!(status.head, block.hash);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_transaction_not_pooled_twice() {
    let (a, b, _dir_a, _dir_b) = pair().await;

    let tx = Transaction::new(Address([3; 20]), Address([4; 20]), 9, 1);
    let first = a.add_transaction(tx.clone()).unwrap();
    let second = a.add_transaction(tx).unwrap();
    assert_eq!(first, second);
    assert_eq!(a.pool().len(), 1);

    assert!(wait_until(Duration::from_secs(5), || b.pool().len() == 1).await);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(b.pool().len(), 1);

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_node_rejects_requests() {
    let dir = TempDir::new().unwrap();
    let node = Node::start(node_config(&dir, None)).await.unwrap();
    node.shutdown().await;

    let tx = Transaction::new(Address([1; 20]), Address([2; 20]), 1, 1);
    assert!(matches!(node.add_transaction(tx), Err(NodeError::ShuttingDown)));
    assert!(matches!(node.mine_block().await, Err(NodeError::ShuttingDown)));

    // The store was released, so the chain reopens
    let reopened = Node::start(node_config(&dir, None)).await.unwrap();
    assert_eq!(reopened.chain().status().await.unwrap().height, 1);
    reopened.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_announcement_cancels_local_mining() {
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();

    // Genesis at the easy difficulty, then restart where mining never finishes
    let a = Node::start(node_config(&dir_a, None)).await.unwrap();
    a.shutdown().await;
    let mut hard = node_config(&dir_a, None);
    hard.chain.difficulty = 40;
    let a = Node::start(hard).await.unwrap();
    let b = Node::start(node_config(&dir_b, Some(&a))).await.unwrap();

    let a_id = a.local_peer_id();
    assert!(
        wait_until(Duration::from_secs(5), || {
            b.network().topic_peers(BLOCK_TOPIC).contains(&a_id)
        })
        .await
    );

    let tx = Transaction::new(Address([5; 20]), Address([6; 20]), 1, 10);
    a.add_transaction(tx.clone()).unwrap();
    let miner = a.clone();
    let job = tokio::spawn(async move { miner.mine_block().await });
    assert!(wait_until(Duration::from_secs(5), || a.chain().mining_height() == Some(1)).await);

    let announcement = BlockAnnouncement {
        hash: Hash::zero(),
        height: 1,
        origin: b.local_peer_id(),
    };
    b.network()
        .broadcast(BLOCK_TOPIC, announcement.to_bytes().unwrap())
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), job)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result,
        Err(NodeError::Chain(ChainError::MiningCancelled))
    ));
    assert_eq!(a.pool().len(), 1);
    assert_eq!(a.chain().status().await.unwrap().height, 1);

    b.shutdown().await;
    a.shutdown().await;
}
