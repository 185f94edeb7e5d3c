// CONSENSUS CONFIGURATION
// Every tunable constant of the hybrid consensus core lives here.
//
// SAFETY INVARIANTS:
// 1. Thresholds are ratios in [0, 1]
// 2. CHAIN_DECISION_THRESHOLD and EMERGENCY_POW_THRESHOLD are independent values
// 3. Intervals, divisors and limits that feed arithmetic are strictly positive
// 4. A config is validated once, before any engine is built from it

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConsensusError;

/// Deepest fork (in blocks below the tip) that may open a voting period.
pub const MAX_FORK_DEPTH: u64 = 1_000;

/// Deepest competing block (in blocks below the tip) fork resolution will consider.
pub const MAX_FORK_LENGTH: u64 = 100;

/// Wall-clock length of a voting period.
pub const CONSENSUS_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Block-height length of a voting period.
pub const VOTING_PERIOD_BLOCKS: u64 = 100;

/// Approval ratio required for the new chain to win a vote.
pub const CHAIN_DECISION_THRESHOLD: f64 = 0.66;

/// PoW score a competing block needs when no vote is running.
pub const EMERGENCY_POW_THRESHOLD: f64 = 0.5;

pub const VALIDATION_TIMEOUT_MS: u64 = 30_000;
pub const FORK_RESOLUTION_TIMEOUT_MS: u64 = 60_000;
pub const VOTE_VERIFICATION_TIMEOUT_MS: u64 = 5_000;

/// Mining attempts per `process_block` call.
pub const MAX_ATTEMPTS: u32 = 3;
pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_MAX_MS: u64 = 30_000;

/// Base block reward in base units (8 decimals).
pub const BASE_REWARD: u128 = 50 * 10u128.pow(8);

/// Floor of every participation reward.
pub const MIN_REWARD: u128 = 10u128.pow(6);

pub const HALVING_INTERVAL: u64 = 210_000;
pub const BASE_DIFFICULTY: u64 = 1;

/// Upper bound every intermediate reward product is checked against.
pub const MAX_SAFE_VALUE: u128 = u64::MAX as u128;

pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;
pub const CIRCUIT_BREAKER_RESET_MS: u64 = 60_000;

pub const CACHE_TTL_MS: u64 = 60 * 60 * 1000;
pub const CACHE_MAX_SIZE: usize = 10_000;
pub const CACHE_MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;
pub const CACHE_WARMUP_DEPTH: u64 = 100;

/// Votes per parallel chunk in stake-weighted aggregation.
pub const VOTE_CHUNK_SIZE: usize = 100_000;

/// Runtime configuration of the consensus core.
///
/// Missing fields fall back to the module constants, so a partial JSON
/// document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub max_fork_depth: u64,
    pub max_fork_length: u64,
    pub consensus_timeout_ms: u64,
    pub voting_period_blocks: u64,
    pub chain_decision_threshold: f64,
    pub emergency_pow_threshold: f64,
    pub validation_timeout_ms: u64,
    pub fork_resolution_timeout_ms: u64,
    pub vote_verification_timeout_ms: u64,
    pub max_mining_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub base_reward: u128,
    pub min_reward: u128,
    pub halving_interval: u64,
    pub base_difficulty: u64,
    pub max_safe_value: u128,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_reset_ms: u64,
    pub cache_ttl_ms: u64,
    pub cache_max_size: usize,
    pub cache_memory_limit_bytes: usize,
    pub cache_warmup_depth: u64,
    pub vote_chunk_size: usize,
    /// Start the PoW engine's miner during `initialize`.
    pub auto_start_mining: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            max_fork_depth: MAX_FORK_DEPTH,
            max_fork_length: MAX_FORK_LENGTH,
            consensus_timeout_ms: CONSENSUS_TIMEOUT_MS,
            voting_period_blocks: VOTING_PERIOD_BLOCKS,
            chain_decision_threshold: CHAIN_DECISION_THRESHOLD,
            emergency_pow_threshold: EMERGENCY_POW_THRESHOLD,
            validation_timeout_ms: VALIDATION_TIMEOUT_MS,
            fork_resolution_timeout_ms: FORK_RESOLUTION_TIMEOUT_MS,
            vote_verification_timeout_ms: VOTE_VERIFICATION_TIMEOUT_MS,
            max_mining_attempts: MAX_ATTEMPTS,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_max_ms: BACKOFF_MAX_MS,
            base_reward: BASE_REWARD,
            min_reward: MIN_REWARD,
            halving_interval: HALVING_INTERVAL,
            base_difficulty: BASE_DIFFICULTY,
            max_safe_value: MAX_SAFE_VALUE,
            circuit_breaker_threshold: CIRCUIT_BREAKER_THRESHOLD,
            circuit_breaker_reset_ms: CIRCUIT_BREAKER_RESET_MS,
            cache_ttl_ms: CACHE_TTL_MS,
            cache_max_size: CACHE_MAX_SIZE,
            cache_memory_limit_bytes: CACHE_MEMORY_LIMIT_BYTES,
            cache_warmup_depth: CACHE_WARMUP_DEPTH,
            vote_chunk_size: VOTE_CHUNK_SIZE,
            auto_start_mining: false,
        }
    }
}

impl ConsensusConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConsensusError> {
        let config: ConsensusConfig = serde_json::from_str(raw)
            .map_err(|e| ConsensusError::InvalidConfig(format!("malformed config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConsensusError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ConsensusError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Check every bound the core relies on.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        let invalid = |msg: &str| Err(ConsensusError::InvalidConfig(msg.to_string()));

        if !(0.0..=1.0).contains(&self.chain_decision_threshold) {
            return invalid("chain_decision_threshold must be between 0 and 1");
        }
        if !(0.0..=1.0).contains(&self.emergency_pow_threshold) {
            return invalid("emergency_pow_threshold must be between 0 and 1");
        }
        if self.halving_interval == 0 {
            return invalid("halving_interval must be > 0");
        }
        if self.base_difficulty == 0 {
            return invalid("base_difficulty must be > 0");
        }
        if self.min_reward > self.base_reward {
            return invalid("min_reward must not exceed base_reward");
        }
        if self.base_reward > self.max_safe_value {
            return invalid("base_reward exceeds max_safe_value");
        }
        if self.max_mining_attempts == 0 {
            return invalid("max_mining_attempts must be > 0");
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return invalid("backoff_base_ms must not exceed backoff_max_ms");
        }
        if self.circuit_breaker_threshold == 0 {
            return invalid("circuit_breaker_threshold must be > 0");
        }
        if self.cache_max_size == 0 {
            return invalid("cache_max_size must be > 0");
        }
        if self.vote_chunk_size == 0 {
            return invalid("vote_chunk_size must be > 0");
        }
        if self.validation_timeout_ms == 0
            || self.fork_resolution_timeout_ms == 0
            || self.vote_verification_timeout_ms == 0
        {
            return invalid("timeouts must be > 0");
        }
        Ok(())
    }

    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_timeout_ms)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    pub fn fork_resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.fork_resolution_timeout_ms)
    }

    pub fn vote_verification_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_verification_timeout_ms)
    }

    pub fn circuit_breaker_reset(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_reset_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ConsensusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ConsensusConfig::from_json_str(
            r#"{ "chain_decision_threshold": 0.75, "max_fork_length": 12 }"#,
        )
        .unwrap();
        assert_eq!(config.chain_decision_threshold, 0.75);
        assert_eq!(config.max_fork_length, 12);
        assert_eq!(config.emergency_pow_threshold, EMERGENCY_POW_THRESHOLD);
        assert_eq!(config.halving_interval, HALVING_INTERVAL);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let config = ConsensusConfig {
            emergency_pow_threshold: 1.5,
            ..ConsensusConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConsensusError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_halving_interval_rejected() {
        let config = ConsensusConfig {
            halving_interval: 0,
            ..ConsensusConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json_rejected() {
        let err = ConsensusConfig::from_json_str("{ not json").unwrap_err();
        assert!(err.to_string().contains("malformed config"));
    }

    #[test]
    fn test_thresholds_are_independent() {
        let config = ConsensusConfig::from_json_str(r#"{ "chain_decision_threshold": 0.9 }"#).unwrap();
        assert_eq!(config.emergency_pow_threshold, EMERGENCY_POW_THRESHOLD);
    }
}
