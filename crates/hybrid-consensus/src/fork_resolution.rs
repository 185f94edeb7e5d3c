// FORK RESOLUTION COORDINATOR
// Decides which of two blocks competing for the same height wins.
//
// SAFETY INVARIANTS:
// 1. Only one fork resolution runs at a time (resolution lock, then fork lock)
// 2. A competing block more than max_fork_length below the tip is always rejected
// 3. A competing block older than the block it displaces is always rejected
//    (both checked by check_fork_bounds, on the voting and the PoW-only path)
// 4. Inside a voting window the token-holder vote decides; outside it the
//    competing block needs pow_score >= emergency_pow_threshold
// 5. Every resolution is bounded by fork_resolution_timeout

use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, Result};
use crate::metrics::{EngineCounters, METRIC_FORK_RESOLVED, METRIC_FORK_TIMEOUT};
use crate::services::{ChainStorage, MetricsSink, PowEngine, RateLimiter};
use crate::types::{now_millis, Block, Validator, VotingStatus};
use crate::voting::VotingPeriodManager;

/// Rate limiter bucket for fork resolution requests.
pub const FORK_RESOLUTION_BUCKET: &str = "fork_resolution";

/// Why a competing block lost. These are verdicts, not faults.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ForkRejection {
    #[error("Fork at height {height} is below the minimum resolvable height {min_height}")]
    TooDeep { height: u64, min_height: u64 },

    #[error("Competing block timestamp {competing} precedes existing block timestamp {existing}")]
    TimestampRegression { existing: u64, competing: u64 },

    #[error("Insufficient PoW for fork: score {score:.3} below {threshold:.3}")]
    InsufficientPow { score: f64, threshold: f64 },
}

impl ForkRejection {
    /// Short key reported to the mempool.
    pub fn reason_key(&self) -> &'static str {
        match self {
            ForkRejection::TooDeep { .. } => "fork_too_deep",
            ForkRejection::TimestampRegression { .. } => "fork_timestamp_regression",
            ForkRejection::InsufficientPow { .. } => "fork_insufficient_pow",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForkOutcome {
    /// Hash of the block that holds the height after resolution.
    Winner(String),
    Rejected(ForkRejection),
}

impl ForkOutcome {
    pub fn winner(&self) -> Option<&str> {
        match self {
            ForkOutcome::Winner(hash) => Some(hash),
            ForkOutcome::Rejected(_) => None,
        }
    }
}

pub struct ForkResolutionCoordinator {
    config: ConsensusConfig,
    storage: Arc<dyn ChainStorage>,
    pow: Arc<dyn PowEngine>,
    rate_limiter: Arc<dyn RateLimiter>,
    voting: Arc<VotingPeriodManager>,
    metrics: Arc<dyn MetricsSink>,
    counters: Arc<EngineCounters>,
    /// Guards the public entry point, including the rate-limit check.
    resolution_lock: Mutex<()>,
    /// Guards the decision itself.
    fork_lock: Mutex<()>,
}

impl ForkResolutionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConsensusConfig,
        storage: Arc<dyn ChainStorage>,
        pow: Arc<dyn PowEngine>,
        rate_limiter: Arc<dyn RateLimiter>,
        voting: Arc<VotingPeriodManager>,
        metrics: Arc<dyn MetricsSink>,
        counters: Arc<EngineCounters>,
    ) -> Self {
        ForkResolutionCoordinator {
            config,
            storage,
            pow,
            rate_limiter,
            voting,
            metrics,
            counters,
            resolution_lock: Mutex::new(()),
            fork_lock: Mutex::new(()),
        }
    }

    /// A different block is already stored at this block's height.
    pub async fn is_fork_point(&self, block: &Block) -> Result<bool> {
        let existing = self.storage.block_by_height(block.height()).await?;
        Ok(matches!(existing, Some(e) if e.hash() != block.hash()))
    }

    /// The chain's voting window covers the current height.
    pub async fn voting_active(&self) -> Result<bool> {
        let height = self.storage.current_height().await?;
        let start = self.storage.voting_start_height().await?;
        let end = self.storage.voting_end_height().await?;
        Ok(start <= height && height <= end)
    }

    /// Block difficulty relative to the network difficulty.
    ///
    /// A non-positive network difficulty scores 0.
    pub async fn pow_score(&self, block: &Block) -> Result<f64> {
        let network = self.pow.network_difficulty().await?;
        if !network.is_finite() || network <= 0.0 {
            warn!("Network difficulty {} unusable; PoW score is 0", network);
            return Ok(0.0);
        }
        Ok(block.header.difficulty as f64 / network)
    }

    /// Limits every competing block must respect, however the fork is decided:
    /// no deeper than `max_fork_length` below the tip and no older than the
    /// block it displaces.
    pub async fn check_fork_bounds(&self, block: &Block) -> Result<Option<ForkRejection>> {
        let current_height = self.storage.current_height().await?;
        let min_height = current_height.saturating_sub(self.config.max_fork_length);
        if block.height() < min_height {
            let rejection = ForkRejection::TooDeep {
                height: block.height(),
                min_height,
            };
            warn!("Rejecting fork block {}: {}", block.hash(), rejection);
            return Ok(Some(rejection));
        }

        let existing = self.storage.block_by_height(block.height()).await?;
        if let Some(existing) = existing.filter(|e| e.hash() != block.hash()) {
            if block.header.timestamp < existing.header.timestamp {
                let rejection = ForkRejection::TimestampRegression {
                    existing: existing.header.timestamp,
                    competing: block.header.timestamp,
                };
                warn!("Rejecting fork block {}: {}", block.hash(), rejection);
                return Ok(Some(rejection));
            }
        }
        Ok(None)
    }

    /// Resolve a fork involving `block`.
    ///
    /// Errors are operational: lock timeout, rate limiting, resolution
    /// timeout or a collaborator failure. A losing block is `Ok(Rejected)`.
    pub async fn handle_chain_fork(
        &self,
        block: &Block,
        validators: &[Validator],
    ) -> Result<ForkOutcome> {
        let deadline = self.config.fork_resolution_timeout();
        let _resolution = tokio::time::timeout(deadline, self.resolution_lock.lock())
            .await
            .map_err(|_| ConsensusError::LockTimeout("fork resolution lock".into()))?;

        let miner = &block.header.miner;
        if !self
            .rate_limiter
            .check_request(FORK_RESOLUTION_BUCKET, miner)
            .await?
        {
            warn!("Fork resolution for {} refused: rate limited", miner);
            return Err(ConsensusError::RateLimited {
                key: format!("{}:{}", FORK_RESOLUTION_BUCKET, miner),
            });
        }

        match tokio::time::timeout(deadline, self.resolve_fork(block, validators)).await {
            Ok(outcome) => {
                let outcome = outcome?;
                EngineCounters::bump(&self.counters.forks_resolved);
                self.metrics.record(METRIC_FORK_RESOLVED, 1.0, now_millis());
                Ok(outcome)
            }
            Err(_) => {
                EngineCounters::bump(&self.counters.fork_timeouts);
                self.metrics.record(METRIC_FORK_TIMEOUT, 1.0, now_millis());
                warn!(
                    "Fork resolution at height {} timed out after {:?}",
                    block.height(),
                    deadline
                );
                Err(ConsensusError::ForkResolutionTimeout {
                    height: block.height(),
                    timeout_ms: self.config.fork_resolution_timeout_ms,
                })
            }
        }
    }

    async fn resolve_fork(&self, block: &Block, validators: &[Validator]) -> Result<ForkOutcome> {
        let _fork = self.fork_lock.lock().await;

        if let Some(rejection) = self.check_fork_bounds(block).await? {
            return Ok(ForkOutcome::Rejected(rejection));
        }

        let Some(existing) = self.storage.block_by_height(block.height()).await? else {
            debug!("No block at height {}; {} wins", block.height(), block.hash());
            return Ok(ForkOutcome::Winner(block.hash().to_string()));
        };
        if existing.hash() == block.hash() {
            return Ok(ForkOutcome::Winner(block.hash().to_string()));
        }

        if let Some(period) = self.voting.period_for_fork(existing.hash(), block.hash()) {
            return self
                .decide_by_vote(
                    period.period_id,
                    period.status,
                    period.end_time,
                    existing.hash(),
                    validators,
                )
                .await;
        }

        if self.voting_active().await? {
            let period = self
                .voting
                .initialize_chain_voting_period(existing.hash(), block.hash(), block.height())
                .await?;
            info!(
                "Fork at height {} sent to vote in period {}; {} holds until it ends",
                block.height(),
                period.period_id,
                existing.hash()
            );
            return Ok(ForkOutcome::Winner(existing.hash().to_string()));
        }

        let score = self.pow_score(block).await?;
        if score >= self.config.emergency_pow_threshold {
            info!(
                "Fork at height {} resolved by PoW: {} wins (score {:.3})",
                block.height(),
                block.hash(),
                score
            );
            Ok(ForkOutcome::Winner(block.hash().to_string()))
        } else {
            Ok(ForkOutcome::Rejected(ForkRejection::InsufficientPow {
                score,
                threshold: self.config.emergency_pow_threshold,
            }))
        }
    }

    async fn decide_by_vote(
        &self,
        period_id: u64,
        status: VotingStatus,
        end_time: u64,
        existing_hash: &str,
        validators: &[Validator],
    ) -> Result<ForkOutcome> {
        if status == VotingStatus::Active && now_millis() < end_time {
            debug!("Voting period {} still open; {} holds", period_id, existing_hash);
            return Ok(ForkOutcome::Winner(existing_hash.to_string()));
        }
        let winner = self.voting.resolve_period(period_id, validators).await?;
        info!("Voting period {} decided fork in favour of {}", period_id, winner);
        Ok(ForkOutcome::Winner(winner))
    }
}
