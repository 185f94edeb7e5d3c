pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fork_resolution;
pub mod hybrid_engine;
pub mod memory;
pub mod merkle;
pub mod metrics;
pub mod pow;
pub mod rate_limit;
pub mod retry;
pub mod reward;
pub mod services;
pub mod types;
pub mod vote_processor;
pub mod vote_verifier;
pub mod voting;

pub use cache::LruValidationCache;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
pub use config::ConsensusConfig;
pub use error::{BlockValidationError, ConsensusError, Error, RewardError};
pub use fork_resolution::{ForkOutcome, ForkRejection, ForkResolutionCoordinator};
pub use hybrid_engine::{
    ConsensusServices, HealthReport, HybridConsensusEngine, RejectReason, Validation,
};
pub use metrics::{ConsensusMetrics, InMemoryMetricsSink, LogMetricsSink};
pub use retry::RetryPolicy;
pub use reward::{compute_reward, reward_or_min, RewardInputs, RewardParams};
pub use services::{
    AuditEvent, AuditLog, ChainStorage, Mempool, MerkleService, MetricsSink, PowEngine,
    RateLimiter, Severity, ValidationCache,
};
pub use types::{Block, BlockHeader, Transaction, Validator, Vote, VoteTally, VotingPeriod, VotingStatus};
pub use vote_processor::{ChunkResult, VoteProcessor};
pub use vote_verifier::VoteVerifier;
pub use voting::VotingPeriodManager;
