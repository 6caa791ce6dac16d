//! Chain manager tests over an on-disk sled store

use kiln_core::config::ChainConfig;
use kiln_core::consensus::Transaction;
use kiln_core::crypto::Address;
use kiln_core::storage::{ChainError, ChainManager, HEAD_KEY};
use tempfile::TempDir;

fn config() -> ChainConfig {
    ChainConfig {
        difficulty: 6,
        block_reward: 100,
        miner_address: Address([9; 20]),
    }
}

fn transfer(nonce: u64) -> Transaction {
    Transaction::new(Address([1; 20]), Address([2; 20]), nonce, 25)
}

#[test]
fn test_chain_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chain");

    let (head, height) = {
        let mut chain = ChainManager::open(&path, &config()).unwrap();
        assert_eq!(chain.height(), 1);
        chain.append(vec![transfer(1), transfer(2)]).unwrap();
        chain.append(vec![]).unwrap();
        let state = (chain.head(), chain.height());
        chain.stop().unwrap();
        state
    };
    assert_eq!(height, 3);

    let chain = ChainManager::open(&path, &config()).unwrap();
    assert_eq!(chain.head(), head);
    assert_eq!(chain.height(), 3);
    assert_eq!(chain.verify_chain().unwrap(), 3);
}

#[test]
fn test_blocks_walk_back_to_genesis() {
    let dir = TempDir::new().unwrap();
    let mut chain = ChainManager::open(dir.path().join("chain"), &config()).unwrap();
    let first = chain.append(vec![transfer(1)]).unwrap();
    let second = chain.append(vec![transfer(2)]).unwrap();

    let blocks: Vec<_> = chain.blocks().unwrap().collect::<Result<_, _>>().unwrap();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].hash, second);
    assert_eq!(blocks[0].header.priori, first);
    assert_eq!(blocks[1].hash, first);
    assert!(blocks[2].is_genesis());
    assert_eq!(blocks[2].transactions.len(), 1);
    assert!(blocks[2].transactions[0].is_coinbase());

    let fetched = chain.get_block(&first).unwrap().unwrap();
    assert_eq!(fetched.transactions, vec![transfer(1)]);
}

#[test]
fn test_head_key_written_on_init() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chain");
    let mut chain = ChainManager::open(&path, &config()).unwrap();
    let head = chain.head();
    chain.stop().unwrap();

    let db = sled::open(&path).unwrap();
    let stored = db.get(HEAD_KEY).unwrap().unwrap();
    assert_eq!(stored.as_ref(), kiln_core::codec::encode(&head).unwrap().as_slice());
}

#[test]
fn test_stopped_chain_rejects_operations() {
    let dir = TempDir::new().unwrap();
    let mut chain = ChainManager::open(dir.path().join("chain"), &config()).unwrap();
    chain.stop().unwrap();
    assert!(matches!(chain.append(vec![]), Err(ChainError::Stopped)));
    assert!(matches!(chain.stop(), Err(ChainError::Stopped)));
}

#[test]
fn test_reopen_right_after_stop() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chain");
    let mut head = None;
    for _ in 0..15 {
        let mut chain = ChainManager::open(&path, &config()).unwrap();
        assert_eq!(chain.height(), 1);
        if let Some(head) = head {
            assert_eq!(chain.head(), head);
        }
        head = Some(chain.head());
        chain.stop().unwrap();
    }
}

#[test]
fn test_unopenable_fresh_path_is_initialization_failure() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let result = ChainManager::open(blocker.join("chain"), &config());
    assert!(matches!(result, Err(ChainError::Initialization(_))));
}
