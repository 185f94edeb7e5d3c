// LEADING-ZERO PROOF-OF-WORK ENGINE
// Reference implementation of the PoW collaborator contract.
//
// SAFETY CONSTRAINTS:
// 1. A block is valid only if its stored hash equals the recomputed header hash
// 2. The hash must carry `difficulty` leading hex zeros
// 3. The nonce search is bounded (no unbounded loops on the executor)
// 4. Difficulty auto-adjusts to keep the target block time and never drops below 1

use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::merkle::Sha3MerkleService;
use crate::services::{ChainStorage, PowEngine};
use crate::types::{now_millis, Block};

/// Blocks considered when computing this miner's participation rate.
const PARTICIPATION_WINDOW: usize = 100;

/// Difficulty at which the engine reports itself unhealthy.
const MAX_HEALTHY_DIFFICULTY: u64 = 30;

pub struct LeadingZeroPowEngine {
    miner_id: String,
    storage: Arc<dyn ChainStorage>,
    difficulty: AtomicU64,
    target_block_time_ms: u64,
    max_nonce: u64,
    mining: AtomicBool,
    blocks_mined: AtomicU64,
    last_block_time: Mutex<Option<u64>>,
    recent_miners: Mutex<VecDeque<String>>,
}

impl LeadingZeroPowEngine {
    /// # Arguments
    /// * `miner_id` - Address credited in mined block headers
    /// * `storage` - Chain store used to find the tip for new blocks
    /// * `initial_difficulty` - Leading hex zeros required
    /// * `target_block_time_ms` - Target time between blocks
    pub fn new(
        miner_id: impl Into<String>,
        storage: Arc<dyn ChainStorage>,
        initial_difficulty: u64,
        target_block_time_ms: u64,
    ) -> Self {
        LeadingZeroPowEngine {
            miner_id: miner_id.into(),
            storage,
            difficulty: AtomicU64::new(initial_difficulty.max(1)),
            target_block_time_ms,
            max_nonce: 10_000_000,
            mining: AtomicBool::new(false),
            blocks_mined: AtomicU64::new(0),
            last_block_time: Mutex::new(None),
            recent_miners: Mutex::new(VecDeque::with_capacity(PARTICIPATION_WINDOW)),
        }
    }

    pub fn with_max_nonce(mut self, max_nonce: u64) -> Self {
        self.max_nonce = max_nonce;
        self
    }

    pub fn difficulty(&self) -> u64 {
        self.difficulty.load(Ordering::SeqCst)
    }

    pub fn meets_difficulty(hash: &str, difficulty: u64) -> bool {
        hash.len() as u64 >= difficulty && hash.chars().take(difficulty as usize).all(|c| c == '0')
    }

    /// Search for a nonce whose header hash meets the block's difficulty.
    fn compute_pow(mut block: Block, max_nonce: u64) -> anyhow::Result<Block> {
        let difficulty = block.header.difficulty;
        for nonce in 0..max_nonce {
            block.header.nonce = nonce;
            let hash = block.compute_hash();
            if Self::meets_difficulty(&hash, difficulty) {
                info!(
                    "PoW found: height={}, difficulty={}, nonce={}, hash={}",
                    block.header.height,
                    difficulty,
                    nonce,
                    &hash[..16]
                );
                block.header.hash = hash;
                return Ok(block);
            }
        }
        anyhow::bail!(
            "could not find PoW within {} attempts at difficulty {}",
            max_nonce,
            difficulty
        )
    }

    /// If blocks come too fast, increase difficulty; too slow, decrease it.
    fn adjust_difficulty(&self, actual_block_time_ms: u64) {
        let ratio = actual_block_time_ms as f64 / self.target_block_time_ms.max(1) as f64;
        let current = self.difficulty();
        if ratio < 0.8 {
            self.difficulty.store(current + 1, Ordering::SeqCst);
            info!(
                "Difficulty increased to {} (blocks too fast: {:.1}% of target)",
                current + 1,
                ratio * 100.0
            );
        } else if ratio > 1.2 && current > 1 {
            self.difficulty.store(current - 1, Ordering::SeqCst);
            info!(
                "Difficulty decreased to {} (blocks too slow: {:.1}% of target)",
                current - 1,
                ratio * 100.0
            );
        }
    }
}

#[async_trait]
impl PowEngine for LeadingZeroPowEngine {
    async fn validate_block(&self, block: &Block) -> anyhow::Result<bool> {
        let recomputed = block.compute_hash();
        if recomputed != block.header.hash {
            warn!(
                "Block {} hash mismatch: header claims {}, recomputed {}",
                block.header.height, block.header.hash, recomputed
            );
            return Ok(false);
        }
        Ok(Self::meets_difficulty(&recomputed, block.header.difficulty))
    }

    async fn mine_block(&self, block: Block) -> anyhow::Result<Block> {
        let max_nonce = self.max_nonce;
        let mined = tokio::task::spawn_blocking(move || Self::compute_pow(block, max_nonce)).await??;
        self.blocks_mined.fetch_add(1, Ordering::SeqCst);
        Ok(mined)
    }

    async fn create_and_mine_block(&self) -> anyhow::Result<Block> {
        let height = self.storage.current_height().await?;
        let previous_hash = match self.storage.block_by_height(height).await? {
            Some(tip) => tip.header.hash,
            None => "0".repeat(64),
        };
        let mut block = Block::new(
            height + 1,
            previous_hash,
            self.miner_id.clone(),
            self.difficulty(),
            Vec::new(),
        );
        block.header.merkle_root = Sha3MerkleService::compute_root(&block.transaction_hashes());
        self.mine_block(block).await
    }

    async fn network_difficulty(&self) -> anyhow::Result<f64> {
        Ok(self.difficulty() as f64)
    }

    async fn participation_rate(&self) -> anyhow::Result<f64> {
        let recent = self.recent_miners.lock();
        if recent.is_empty() {
            return Ok(0.0);
        }
        let own = recent.iter().filter(|m| **m == self.miner_id).count();
        Ok(own as f64 * 100.0 / recent.len() as f64)
    }

    async fn update_difficulty(&self, block: &Block) -> anyhow::Result<()> {
        {
            let mut recent = self.recent_miners.lock();
            if recent.len() == PARTICIPATION_WINDOW {
                recent.pop_front();
            }
            recent.push_back(block.header.miner.clone());
        }
        let previous = self.last_block_time.lock().replace(block.header.timestamp);
        if let Some(previous) = previous {
            self.adjust_difficulty(block.header.timestamp.saturating_sub(previous));
        }
        Ok(())
    }

    async fn start_mining(&self) -> anyhow::Result<()> {
        if !self.mining.swap(true, Ordering::SeqCst) {
            info!("Mining started for {}", self.miner_id);
        }
        Ok(())
    }

    async fn stop_mining(&self) -> anyhow::Result<()> {
        if self.mining.swap(false, Ordering::SeqCst) {
            info!("Mining stopped for {}", self.miner_id);
        }
        Ok(())
    }

    async fn health_check(&self) -> bool {
        self.difficulty() < MAX_HEALTHY_DIFFICULTY
    }

    async fn metrics(&self) -> serde_json::Value {
        json!({
            "difficulty": self.difficulty(),
            "blocks_mined": self.blocks_mined.load(Ordering::SeqCst),
            "mining": self.mining.load(Ordering::SeqCst),
            "target_block_time_ms": self.target_block_time_ms,
            "timestamp": now_millis(),
        })
    }
}
