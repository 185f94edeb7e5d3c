// HYBRID CONSENSUS ENGINE
// PoW block acceptance with token-holder voting on forks.
//
// SAFETY INVARIANTS:
// 1. One validation runs at a time; a validated hash is afterwards a pure cache read
// 2. An open circuit breaker fails validation fast instead of running checks
// 3. Validation is bounded by validation_timeout and fails closed on expiry
// 4. A bad block is a rejection (Ok(false)); only operational faults are errors
// 5. Unexpected errors inside validation trip the circuit breaker and propagate
// 6. A fork block outside a voting window still respects max_fork_length and
//    the timestamp of the block it displaces
// 7. Reward calculation never fails; it degrades to min_reward
// 8. dispose() is idempotent and every operation after it fails with Disposed

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::ConsensusConfig;
use crate::error::{BlockValidationError, ConsensusError, Error, Result};
use crate::fork_resolution::{ForkOutcome, ForkRejection, ForkResolutionCoordinator};
use crate::metrics::{
    CacheMetrics, ConsensusMetrics, EngineCounters, METRIC_BLOCK_ACCEPTED, METRIC_BLOCK_REJECTED,
    METRIC_CACHE_WARMED, METRIC_MINING_ATTEMPT, METRIC_REWARD, METRIC_VALIDATION_MS,
    METRIC_VALIDATION_TIMEOUT,
};
use crate::retry::RetryPolicy;
use crate::reward::{reward_or_min, RewardInputs, RewardParams};
use crate::services::{
    AuditEvent, AuditLog, ChainStorage, Mempool, MerkleService, MetricsSink, PowEngine,
    RateLimiter, Severity, ValidationCache,
};
use crate::types::{now_millis, Block};
use crate::vote_verifier::VoteVerifier;
use crate::voting::VotingPeriodManager;

const AUDIT_SOURCE: &str = "hybrid_consensus";

/// Cache priority of blocks that passed full validation.
const VALIDATED_PRIORITY: u8 = 2;

/// Cache priority of stored blocks loaded during warm-up.
const WARMUP_PRIORITY: u8 = 1;

/// Collaborators the engine is built from.
#[derive(Clone)]
pub struct ConsensusServices {
    pub pow: Arc<dyn PowEngine>,
    pub storage: Arc<dyn ChainStorage>,
    pub merkle: Arc<dyn MerkleService>,
    pub audit: Arc<dyn AuditLog>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub mempool: Arc<dyn Mempool>,
    pub cache: Arc<dyn ValidationCache>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Why a block was not accepted.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RejectReason {
    #[error("Merkle root mismatch: header {header}, computed {computed}")]
    MerkleMismatch { header: String, computed: String },

    #[error("Invalid proof of work")]
    InvalidPow,

    #[error("Insufficient PoW for fork outside voting period")]
    InsufficientForkPow { score: f64, threshold: f64 },

    #[error("Fork resolved in favour of {winner}")]
    ForkLost { winner: String },

    #[error(transparent)]
    Fork(ForkRejection),

    /// The cache holds a `false` verdict for this hash. The engine itself only
    /// caches accepted blocks; a shared or external `ValidationCache` may not.
    #[error("Block previously rejected")]
    PreviouslyRejected,
}

impl RejectReason {
    /// Short key reported to the mempool.
    pub fn reason_key(&self) -> &'static str {
        match self {
            RejectReason::MerkleMismatch { .. } => "invalid_merkle_root",
            RejectReason::InvalidPow => "invalid_pow",
            RejectReason::InsufficientForkPow { .. } => "insufficient_fork_pow",
            RejectReason::ForkLost { .. } => "fork_lost",
            RejectReason::Fork(rejection) => rejection.reason_key(),
            RejectReason::PreviouslyRejected => "previously_rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Accepted,
    Rejected(RejectReason),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted)
    }
}

/// Outcome of the locked validation section.
enum Verdict {
    /// Whatever the cache holds. `false` only appears when something other
    /// than this engine wrote the entry.
    Cached(bool),
    Valid,
    Invalid(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub pow: bool,
    pub voting: bool,
    pub storage: bool,
    pub cache: bool,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.pow && self.voting && self.storage && self.cache
    }
}

pub struct HybridConsensusEngine {
    config: ConsensusConfig,
    pow: Arc<dyn PowEngine>,
    storage: Arc<dyn ChainStorage>,
    merkle: Arc<dyn MerkleService>,
    audit: Arc<dyn AuditLog>,
    mempool: Arc<dyn Mempool>,
    cache: Arc<dyn ValidationCache>,
    metrics: Arc<dyn MetricsSink>,
    voting: Arc<VotingPeriodManager>,
    forks: ForkResolutionCoordinator,
    circuit_breaker: CircuitBreaker,
    counters: Arc<EngineCounters>,
    reward_params: RewardParams,
    validation_lock: Mutex<()>,
    warmup_lock: Mutex<()>,
    disposed: AtomicBool,
}

impl HybridConsensusEngine {
    pub fn new(config: ConsensusConfig, services: ConsensusServices) -> Result<Self> {
        config.validate()?;

        let counters = Arc::new(EngineCounters::default());
        let verifier = Arc::new(VoteVerifier::new(
            services.storage.clone(),
            services.rate_limiter.clone(),
            config.vote_verification_timeout(),
        ));
        let voting = Arc::new(VotingPeriodManager::new(
            config.clone(),
            services.storage.clone(),
            verifier,
            services.audit.clone(),
        ));
        let forks = ForkResolutionCoordinator::new(
            config.clone(),
            services.storage.clone(),
            services.pow.clone(),
            services.rate_limiter.clone(),
            voting.clone(),
            services.metrics.clone(),
            counters.clone(),
        );

        info!(
            "Hybrid consensus engine created (decision threshold {:.2}, emergency PoW threshold {:.2})",
            config.chain_decision_threshold, config.emergency_pow_threshold
        );

        Ok(HybridConsensusEngine {
            circuit_breaker: CircuitBreaker::new(
                config.circuit_breaker_threshold,
                config.circuit_breaker_reset(),
            ),
            reward_params: RewardParams::from(&config),
            config,
            pow: services.pow,
            storage: services.storage,
            merkle: services.merkle,
            audit: services.audit,
            mempool: services.mempool,
            cache: services.cache,
            metrics: services.metrics,
            voting,
            forks,
            counters,
            validation_lock: Mutex::new(()),
            warmup_lock: Mutex::new(()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn voting(&self) -> &Arc<VotingPeriodManager> {
        &self.voting
    }

    pub fn fork_coordinator(&self) -> &ForkResolutionCoordinator {
        &self.forks
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ConsensusError::Disposed);
        }
        Ok(())
    }

    fn record_metric(&self, name: &str, value: f64) {
        self.metrics.record(name, value, now_millis());
    }

    async fn audit_event(&self, event_type: &str, severity: Severity, details: serde_json::Value) {
        let event = AuditEvent::new(event_type, severity, AUDIT_SOURCE, details);
        if let Err(e) = self.audit.log_event(event).await {
            warn!("Audit log unavailable for {}: {}", event_type, e);
        }
    }

    async fn notify_mempool(&self, block: &Block, reason_key: &str) {
        if let Err(e) = self
            .mempool
            .handle_validation_failure(reason_key, &block.validators_csv())
            .await
        {
            warn!("Mempool failure notification for {} failed: {}", block.hash(), e);
        }
    }

    /// Validate `block`, returning `Ok(false)` for a rejected block.
    pub async fn validate_block(&self, block: &Block) -> Result<bool, Error> {
        self.validate_block_detailed(block)
            .await
            .map(|v| v.is_accepted())
    }

    /// Validate `block` and report why it was rejected.
    ///
    /// A validation that misses its deadline notifies the mempool and fails
    /// with `BlockValidationError`.
    pub async fn validate_block_detailed(&self, block: &Block) -> Result<Validation, Error> {
        self.ensure_live()?;
        EngineCounters::bump(&self.counters.validations);
        let started = Instant::now();

        let deadline = self.config.validation_timeout();
        let verdict = match tokio::time::timeout(deadline, self.validate_block_locked(block)).await {
            Ok(verdict) => verdict,
            Err(_) => {
                EngineCounters::bump(&self.counters.timeouts);
                self.record_metric(METRIC_VALIDATION_TIMEOUT, 1.0);
                warn!("Validation of block {} timed out after {:?}", block.hash(), deadline);
                self.notify_mempool(block, "validation_timeout").await;
                self.audit_event(
                    "BLOCK_VALIDATION_TIMEOUT",
                    Severity::Error,
                    json!({ "block_hash": block.hash(), "height": block.height() }),
                )
                .await;
                return Err(BlockValidationError {
                    block_hash: block.hash().to_string(),
                    details: format!("validation timed out after {}ms", self.config.validation_timeout_ms),
                }
                .into());
            }
        };

        let verdict = match verdict {
            Ok(verdict) => verdict,
            Err(e) => {
                EngineCounters::bump(&self.counters.errors);
                return Err(e.into());
            }
        };
        self.record_metric(METRIC_VALIDATION_MS, started.elapsed().as_millis() as f64);

        match verdict {
            Verdict::Cached(true) => {
                EngineCounters::bump(&self.counters.cache_hits);
                debug!("Block {} served from validation cache", block.hash());
                Ok(Validation::Accepted)
            }
            Verdict::Cached(false) => {
                EngineCounters::bump(&self.counters.cache_hits);
                Ok(self.report_rejection(block, RejectReason::PreviouslyRejected).await)
            }
            Verdict::Valid => {
                EngineCounters::bump(&self.counters.accepted);
                self.record_metric(METRIC_BLOCK_ACCEPTED, 1.0);
                Ok(Validation::Accepted)
            }
            Verdict::Invalid(reason) => Ok(self.report_rejection(block, reason).await),
        }
    }

    async fn report_rejection(&self, block: &Block, reason: RejectReason) -> Validation {
        EngineCounters::bump(&self.counters.rejected);
        self.record_metric(METRIC_BLOCK_REJECTED, 1.0);
        warn!("Block {} at height {} rejected: {}", block.hash(), block.height(), reason);
        self.notify_mempool(block, reason.reason_key()).await;
        self.audit_event(
            "BLOCK_VALIDATION_FAILED",
            Severity::Warning,
            json!({
                "block_hash": block.hash(),
                "height": block.height(),
                "reason_key": reason.reason_key(),
                "reason": reason.to_string(),
            }),
        )
        .await;
        Validation::Rejected(reason)
    }

    async fn validate_block_locked(&self, block: &Block) -> Result<Verdict> {
        let _validation = self.validation_lock.lock().await;

        if let Some(cached) = self.cache.get(block.hash()) {
            return Ok(Verdict::Cached(cached));
        }

        if self.circuit_breaker.is_open() {
            warn!("Validation of {} refused: circuit breaker open", block.hash());
            return Err(ConsensusError::CircuitOpen {
                failures: self.circuit_breaker.failures(),
            });
        }

        match self.run_checks(block).await {
            Ok(verdict) => {
                self.circuit_breaker.record_success();
                if matches!(verdict, Verdict::Valid) {
                    info!("Block {} at height {} validated", block.hash(), block.height());
                    self.cache.set(
                        block.hash(),
                        true,
                        self.config.cache_ttl(),
                        VALIDATED_PRIORITY,
                    );
                }
                Ok(verdict)
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                error!("Validation of block {} failed: {}", block.hash(), e);
                Err(e)
            }
        }
    }

    async fn run_checks(&self, block: &Block) -> Result<Verdict> {
        let computed = self.merkle.create_root(&block.transaction_hashes()).await?;
        if computed != block.header.merkle_root {
            return Ok(Verdict::Invalid(RejectReason::MerkleMismatch {
                header: block.header.merkle_root.clone(),
                computed,
            }));
        }

        if !self.pow.validate_block(block).await? {
            return Ok(Verdict::Invalid(RejectReason::InvalidPow));
        }

        if self.forks.is_fork_point(block).await? {
            if self.forks.voting_active().await? {
                match self.forks.handle_chain_fork(block, &block.validators).await? {
                    ForkOutcome::Winner(winner) if winner == block.hash() => {}
                    ForkOutcome::Winner(winner) => {
                        return Ok(Verdict::Invalid(RejectReason::ForkLost { winner }))
                    }
                    ForkOutcome::Rejected(rejection) => {
                        return Ok(Verdict::Invalid(RejectReason::Fork(rejection)))
                    }
                }
            } else {
                if let Some(rejection) = self.forks.check_fork_bounds(block).await? {
                    return Ok(Verdict::Invalid(RejectReason::Fork(rejection)));
                }
                let score = self.forks.pow_score(block).await?;
                if score < self.config.emergency_pow_threshold {
                    return Ok(Verdict::Invalid(RejectReason::InsufficientForkPow {
                        score,
                        threshold: self.config.emergency_pow_threshold,
                    }));
                }
                info!(
                    "Fork block {} accepted outside voting period (PoW score {:.3})",
                    block.hash(),
                    score
                );
            }
        }

        Ok(Verdict::Valid)
    }

    fn mining_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.config.max_mining_attempts,
            std::time::Duration::from_millis(self.config.backoff_base_ms),
            std::time::Duration::from_millis(self.config.backoff_max_ms),
        )
    }

    /// Mine `block` (after setting its merkle root) and validate the result.
    pub async fn process_block(&self, block: Block) -> Result<Block> {
        self.ensure_live()?;
        let mut block = block;
        block.header.merkle_root = self.merkle.create_root(&block.transaction_hashes()).await?;

        let policy = self.mining_policy();
        let mined = policy
            .run("mining", |attempt| {
                let candidate = block.clone();
                async move {
                    let mined = self.record_attempt(attempt, self.pow.mine_block(candidate)).await?;
                    self.accept_mined(mined).await
                }
            })
            .await;
        self.finish_mining(mined).await
    }

    /// Build a block on the current tip, mine it and validate the result.
    pub async fn mine_block(&self) -> Result<Block> {
        self.ensure_live()?;
        let policy = self.mining_policy();
        let mined = policy
            .run("mining", |attempt| async move {
                let mined = self
                    .record_attempt(attempt, self.pow.create_and_mine_block())
                    .await?;
                self.accept_mined(mined).await
            })
            .await;
        self.finish_mining(mined).await
    }

    async fn record_attempt<F>(&self, attempt: u32, mining: F) -> anyhow::Result<Block>
    where
        F: std::future::Future<Output = anyhow::Result<Block>>,
    {
        EngineCounters::bump(&self.counters.mining_attempts);
        self.record_metric(METRIC_MINING_ATTEMPT, (attempt + 1) as f64);
        mining.await
    }

    async fn accept_mined(&self, mined: Block) -> anyhow::Result<Block> {
        if !self.validate_block(&mined).await? {
            anyhow::bail!("mined block {} failed validation", mined.hash());
        }
        Ok(mined)
    }

    async fn finish_mining(&self, mined: anyhow::Result<Block>) -> Result<Block> {
        match mined {
            Ok(block) => {
                EngineCounters::bump(&self.counters.mining_successes);
                if let Err(e) = self.pow.update_difficulty(&block).await {
                    warn!("Difficulty update after block {} failed: {}", block.hash(), e);
                }
                info!("Mined block {} at height {}", block.hash(), block.height());
                self.audit_event(
                    "POW_BLOCK_MINED",
                    Severity::Info,
                    json!({
                        "block_hash": block.hash(),
                        "height": block.height(),
                        "difficulty": block.header.difficulty,
                        "nonce": block.header.nonce,
                        "miner": block.header.miner,
                    }),
                )
                .await;
                Ok(block)
            }
            Err(e) => {
                EngineCounters::bump(&self.counters.mining_failures);
                error!(
                    "Mining failed after {} attempts: {}",
                    self.config.max_mining_attempts, e
                );
                Err(ConsensusError::MiningExhausted {
                    attempts: self.config.max_mining_attempts,
                    last_error: e.to_string(),
                })
            }
        }
    }

    /// Participation reward for a block at `height`. Never fails.
    pub async fn calculate_participation_reward(&self, height: u64) -> u128 {
        let pow_rate = match self.pow.participation_rate().await {
            Ok(rate) => rate,
            Err(e) => {
                warn!("PoW participation unavailable ({}); paying minimum reward", e);
                return self.reward_params.min_reward;
            }
        };
        let network_difficulty = match self.pow.network_difficulty().await {
            Ok(difficulty) => difficulty,
            Err(e) => {
                warn!("Network difficulty unavailable ({}); paying minimum reward", e);
                return self.reward_params.min_reward;
            }
        };

        let inputs = RewardInputs {
            height,
            voting_rate: self.voting.participation_rate_percent(),
            pow_rate,
            network_difficulty,
        };
        let reward = reward_or_min(&self.reward_params, &inputs);
        self.record_metric(METRIC_REWARD, reward as f64);
        debug!("Participation reward at height {}: {}", height, reward);
        reward
    }

    fn cache_healthy(&self) -> bool {
        self.cache.hit_rate() > 0.5
            && self.cache.size() < self.cache.max_size()
            && self.cache.memory_usage() < self.config.cache_memory_limit_bytes
    }

    /// Per-component health.
    pub async fn health_report(&self) -> HealthReport {
        HealthReport {
            pow: self.pow.health_check().await,
            voting: self.voting.health_check(),
            storage: self.storage.ping().await,
            cache: self.cache_healthy(),
        }
    }

    pub async fn health_check(&self) -> bool {
        let report = self.health_report().await;
        if !report.healthy() {
            warn!(
                "Health check failed: pow={}, voting={}, storage={}, cache={} (hit_rate={:.2}, size={}/{}, memory={}B)",
                report.pow,
                report.voting,
                report.storage,
                report.cache,
                self.cache.hit_rate(),
                self.cache.size(),
                self.cache.max_size(),
                self.cache.memory_usage()
            );
        }
        report.healthy()
    }

    pub async fn get_metrics(&self) -> ConsensusMetrics {
        ConsensusMetrics {
            pow: self.pow.metrics().await,
            voting: self.voting.metrics(),
            cache: CacheMetrics {
                hit_rate: self.cache.hit_rate(),
                size: self.cache.size(),
                max_size: self.cache.max_size(),
                eviction_count: self.cache.eviction_count(),
                memory_usage: self.cache.memory_usage(),
            },
            retry: self.counters.retry_stats(),
            validation: self.counters.validation_stats(),
            circuit_breaker: self.circuit_breaker.state(),
            timestamp: now_millis(),
        }
    }

    /// Load the most recent stored blocks into the validation cache.
    async fn warm_cache(&self) -> anyhow::Result<usize> {
        let height = self.storage.current_height().await?;
        let from = height.saturating_sub(self.config.cache_warmup_depth.saturating_sub(1));
        let mut warmed = 0;
        for h in from..=height {
            let Some(block) = self.storage.block_by_height(h).await? else {
                continue;
            };
            if block.hash().is_empty() {
                continue;
            }
            self.cache
                .set(block.hash(), true, self.config.cache_ttl(), WARMUP_PRIORITY);
            warmed += 1;
        }
        Ok(warmed)
    }

    /// Warm the validation cache and optionally start mining.
    ///
    /// Returns the number of cached blocks.
    pub async fn initialize(&self) -> Result<usize> {
        self.ensure_live()?;
        let warmed = {
            let _warmup = self.warmup_lock.lock().await;
            let policy = RetryPolicy::exponential(
                self.config.max_mining_attempts,
                std::time::Duration::from_millis(self.config.backoff_base_ms),
                std::time::Duration::from_millis(self.config.backoff_max_ms),
            );
            policy
                .run("cache warm-up", |attempt| {
                    if attempt > 0 {
                        EngineCounters::bump(&self.counters.warmup_retries);
                    }
                    self.warm_cache()
                })
                .await?
        };
        self.record_metric(METRIC_CACHE_WARMED, warmed as f64);
        info!("Validation cache warmed with {} stored blocks", warmed);

        if self.config.auto_start_mining {
            self.pow.start_mining().await?;
        }
        Ok(warmed)
    }

    /// Release every subsystem. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Hybrid consensus engine already disposed");
            return;
        }
        self.cache.clear();
        self.voting.close();
        if let Err(e) = self.pow.stop_mining().await {
            warn!("Stopping PoW engine during dispose failed: {}", e);
        }
        info!("Hybrid consensus engine disposed");
    }

    /// Lifecycle entry point for the hosting process.
    pub async fn shutdown(&self) {
        self.dispose().await
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}
