// Collaborator contracts consumed by the consensus core.
//
// The core owns no storage, mining, hashing or networking of its own; it talks
// to these services through narrow traits. Reference implementations live in
// `memory`, `cache`, `merkle`, `pow` and `rate_limit`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::Block;

/// Proof-of-Work mining and difficulty engine.
#[async_trait]
pub trait PowEngine: Send + Sync {
    /// Check that the block's hash satisfies its difficulty.
    async fn validate_block(&self, block: &Block) -> anyhow::Result<bool>;

    /// Search a nonce for the given block and return the mined block.
    async fn mine_block(&self, block: Block) -> anyhow::Result<Block>;

    /// Assemble a block on the current tip and mine it.
    async fn create_and_mine_block(&self) -> anyhow::Result<Block>;

    async fn network_difficulty(&self) -> anyhow::Result<f64>;

    /// PoW participation rate, in percent [0, 100].
    async fn participation_rate(&self) -> anyhow::Result<f64>;

    /// Feed an accepted block into difficulty retargeting.
    async fn update_difficulty(&self, block: &Block) -> anyhow::Result<()>;

    async fn start_mining(&self) -> anyhow::Result<()>;
    async fn stop_mining(&self) -> anyhow::Result<()>;
    async fn health_check(&self) -> bool;
    async fn metrics(&self) -> serde_json::Value;
}

/// Persistent chain state.
#[async_trait]
pub trait ChainStorage: Send + Sync {
    async fn current_height(&self) -> anyhow::Result<u64>;
    async fn block_by_height(&self, height: u64) -> anyhow::Result<Option<Block>>;
    async fn voting_start_height(&self) -> anyhow::Result<u64>;
    async fn voting_end_height(&self) -> anyhow::Result<u64>;
    async fn verify_signature(
        &self,
        address: &str,
        message: &str,
        signature: &str,
    ) -> anyhow::Result<bool>;
    async fn ping(&self) -> bool;
}

#[async_trait]
pub trait MerkleService: Send + Sync {
    async fn create_root(&self, hashes: &[String]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub severity: Severity,
    pub source: String,
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        event_type: impl Into<String>,
        severity: Severity,
        source: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        AuditEvent {
            event_type: event_type.into(),
            severity,
            source: source.into(),
            details,
        }
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Record a structured event and return its id.
    async fn log_event(&self, event: AuditEvent) -> anyhow::Result<String>;

    async fn log(&self, event_type: &str, data: serde_json::Value) -> anyhow::Result<()>;
}

/// DDoS guard.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// `true` when the request is allowed.
    async fn check_request(&self, bucket: &str, identity: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait Mempool: Send + Sync {
    async fn handle_validation_failure(
        &self,
        reason_key: &str,
        validators_csv: &str,
    ) -> anyhow::Result<()>;
}

/// Key → verdict cache used by block validation.
///
/// Implementations must be safe to call from the eviction path: an eviction
/// callback may only log and remove, never re-enter validation.
pub trait ValidationCache: Send + Sync {
    fn get(&self, key: &str) -> Option<bool>;
    fn set(&self, key: &str, value: bool, ttl: Duration, priority: u8);
    fn has(&self, key: &str) -> bool;
    fn delete(&self, key: &str) -> bool;
    fn size(&self) -> usize;
    fn clear(&self);
    /// Hits / lookups, 0.0 when nothing was looked up yet.
    fn hit_rate(&self) -> f64;
    fn eviction_count(&self) -> u64;
    fn max_size(&self) -> usize;
    /// Approximate resident bytes.
    fn memory_usage(&self) -> usize;
}

/// Synchronous metrics sink the engine reports to.
pub trait MetricsSink: Send + Sync {
    fn record(&self, name: &str, value: f64, timestamp: u64);
}
