// Shared harness for the integration tests: hand-rolled collaborator doubles
// wired into a full engine.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hybrid_consensus::memory::{InMemoryChainStorage, LogAuditLog, RecordingMempool};
use hybrid_consensus::merkle::Sha3MerkleService;
use hybrid_consensus::rate_limit::SlidingWindowRateLimiter;
use hybrid_consensus::types::{ChainVoteData, Validator, Vote};
use hybrid_consensus::{
    Block, ChainStorage, ConsensusConfig, ConsensusServices, HybridConsensusEngine,
    InMemoryMetricsSink, LruValidationCache, MerkleService, PowEngine,
};

/// PoW engine double with scripted answers and call counters.
pub struct MockPow {
    pub valid: AtomicBool,
    pub fail_validation: AtomicBool,
    pub fail_participation: AtomicBool,
    pub healthy: AtomicBool,
    pub mining: AtomicBool,
    pub network_difficulty: Mutex<f64>,
    pub participation: Mutex<f64>,
    pub validate_delay: Mutex<Option<Duration>>,
    pub validate_calls: AtomicU64,
    pub difficulty_updates: AtomicU64,
}

impl MockPow {
    pub fn new(network_difficulty: f64) -> Self {
        MockPow {
            valid: AtomicBool::new(true),
            fail_validation: AtomicBool::new(false),
            fail_participation: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            mining: AtomicBool::new(false),
            network_difficulty: Mutex::new(network_difficulty),
            participation: Mutex::new(0.0),
            validate_delay: Mutex::new(None),
            validate_calls: AtomicU64::new(0),
            difficulty_updates: AtomicU64::new(0),
        }
    }

    pub fn validate_calls(&self) -> u64 {
        self.validate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PowEngine for MockPow {
    async fn validate_block(&self, _block: &Block) -> anyhow::Result<bool> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.validate_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_validation.load(Ordering::SeqCst) {
            anyhow::bail!("pow backend unreachable");
        }
        Ok(self.valid.load(Ordering::SeqCst))
    }

    async fn mine_block(&self, mut block: Block) -> anyhow::Result<Block> {
        block.header.hash = block.compute_hash();
        Ok(block)
    }

    async fn create_and_mine_block(&self) -> anyhow::Result<Block> {
        self.mine_block(sealed_block(1, "mock-miner", 1, 1_000, vec![])).await
    }

    async fn network_difficulty(&self) -> anyhow::Result<f64> {
        Ok(*self.network_difficulty.lock())
    }

    async fn participation_rate(&self) -> anyhow::Result<f64> {
        if self.fail_participation.load(Ordering::SeqCst) {
            anyhow::bail!("participation unavailable");
        }
        Ok(*self.participation.lock())
    }

    async fn update_difficulty(&self, _block: &Block) -> anyhow::Result<()> {
        self.difficulty_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_mining(&self) -> anyhow::Result<()> {
        self.mining.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_mining(&self) -> anyhow::Result<()> {
        self.mining.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn metrics(&self) -> serde_json::Value {
        json!({ "validate_calls": self.validate_calls() })
    }
}

/// Merkle service that counts how often it is asked for a root.
#[derive(Default)]
pub struct CountingMerkle {
    pub calls: AtomicU64,
}

impl CountingMerkle {
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MerkleService for CountingMerkle {
    async fn create_root(&self, hashes: &[String]) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Sha3MerkleService::compute_root(hashes))
    }
}

/// Storage whose signature checks take `delay`.
pub struct SlowSignatureStorage {
    pub inner: Arc<InMemoryChainStorage>,
    pub delay: Duration,
}

#[async_trait]
impl ChainStorage for SlowSignatureStorage {
    async fn current_height(&self) -> anyhow::Result<u64> {
        self.inner.current_height().await
    }

    async fn block_by_height(&self, height: u64) -> anyhow::Result<Option<Block>> {
        self.inner.block_by_height(height).await
    }

    async fn voting_start_height(&self) -> anyhow::Result<u64> {
        self.inner.voting_start_height().await
    }

    async fn voting_end_height(&self) -> anyhow::Result<u64> {
        self.inner.voting_end_height().await
    }

    async fn verify_signature(
        &self,
        address: &str,
        message: &str,
        signature: &str,
    ) -> anyhow::Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.verify_signature(address, message, signature).await
    }

    async fn ping(&self) -> bool {
        self.inner.ping().await
    }
}

pub struct Harness {
    pub storage: Arc<InMemoryChainStorage>,
    pub pow: Arc<MockPow>,
    pub merkle: Arc<CountingMerkle>,
    pub audit: Arc<LogAuditLog>,
    pub mempool: Arc<RecordingMempool>,
    pub cache: Arc<LruValidationCache>,
    pub metrics: Arc<InMemoryMetricsSink>,
    pub engine: HybridConsensusEngine,
}

impl Harness {
    pub fn new(config: ConsensusConfig) -> Self {
        Self::with_network_difficulty(config, 100.0)
    }

    pub fn with_network_difficulty(config: ConsensusConfig, network_difficulty: f64) -> Self {
        let storage = Arc::new(InMemoryChainStorage::new());
        let pow = Arc::new(MockPow::new(network_difficulty));
        let merkle = Arc::new(CountingMerkle::default());
        let audit = Arc::new(LogAuditLog::new());
        let mempool = Arc::new(RecordingMempool::new());
        let cache = Arc::new(LruValidationCache::new(config.cache_max_size));
        let metrics = Arc::new(InMemoryMetricsSink::new());

        let services = ConsensusServices {
            pow: pow.clone(),
            storage: storage.clone(),
            merkle: merkle.clone(),
            audit: audit.clone(),
            rate_limiter: Arc::new(SlidingWindowRateLimiter::default()),
            mempool: mempool.clone(),
            cache: cache.clone(),
            metrics: metrics.clone(),
        };
        let engine = HybridConsensusEngine::new(config, services).expect("valid config");

        Harness {
            storage,
            pow,
            merkle,
            audit,
            mempool,
            cache,
            metrics,
            engine,
        }
    }
}

/// Config with millisecond backoff so retry paths finish quickly.
pub fn fast_config() -> ConsensusConfig {
    ConsensusConfig {
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..ConsensusConfig::default()
    }
}

/// A block with a correct merkle root and hash.
pub fn sealed_block(
    height: u64,
    miner: &str,
    difficulty: u64,
    timestamp: u64,
    validators: Vec<Validator>,
) -> Block {
    let mut block = Block::new(height, "0".repeat(64), miner, difficulty, vec![]);
    block.header.timestamp = timestamp;
    block.header.merkle_root = Sha3MerkleService::compute_root(&block.transaction_hashes());
    block.validators = validators;
    block.header.hash = block.compute_hash();
    block
}

/// A vote signed with the key registered for `voter` in `storage`.
pub fn signed_vote(
    storage: &InMemoryChainStorage,
    voter: &str,
    target_chain_id: &str,
    approve: bool,
) -> Vote {
    let timestamp = 1_700_000_000_000;
    let message = Vote::signing_message(target_chain_id, timestamp);
    Vote {
        voter: voter.to_string(),
        chain_vote_data: Some(ChainVoteData {
            target_chain_id: target_chain_id.to_string(),
        }),
        signature: storage.sign(voter, &message),
        timestamp,
        approve,
        balance: Some("1000".into()),
    }
}
