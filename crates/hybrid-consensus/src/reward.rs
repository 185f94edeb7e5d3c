// PARTICIPATION REWARD
// Overflow-checked block reward arithmetic.
//
// SAFETY CONSTRAINTS:
// 1. Every product is checked against max_safe_value
// 2. Every division checks its divisor
// 3. More than 64 halvings is rejected instead of shifted
// 4. The result is floored at min_reward
//
// Higher participation lowers the marginal reward:
//   reward = base * (100 - mean(voting%, pow%)) / 100
//            >> (height / halving_interval)
//            * floor(network_difficulty) / base_difficulty

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::ConsensusConfig;
use crate::error::RewardError;

/// Participation factor resolution: 10_000 basis points == 100%.
const BASIS_POINTS: u128 = 10_000;

const MAX_HALVINGS: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardParams {
    pub base_reward: u128,
    pub min_reward: u128,
    pub halving_interval: u64,
    pub base_difficulty: u64,
    pub max_safe_value: u128,
}

impl From<&ConsensusConfig> for RewardParams {
    fn from(config: &ConsensusConfig) -> Self {
        RewardParams {
            base_reward: config.base_reward,
            min_reward: config.min_reward,
            halving_interval: config.halving_interval,
            base_difficulty: config.base_difficulty,
            max_safe_value: config.max_safe_value,
        }
    }
}

impl Default for RewardParams {
    fn default() -> Self {
        RewardParams::from(&ConsensusConfig::default())
    }
}

/// Chain observations a reward is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RewardInputs {
    pub height: u64,
    /// Voting participation, percent.
    pub voting_rate: f64,
    /// PoW participation, percent.
    pub pow_rate: f64,
    pub network_difficulty: f64,
}

fn checked_mul(a: u128, b: u128, max: u128, what: &'static str) -> Result<u128, RewardError> {
    a.checked_mul(b)
        .filter(|v| *v <= max)
        .ok_or(RewardError::Overflow(what))
}

fn checked_div(a: u128, b: u128, what: &'static str) -> Result<u128, RewardError> {
    a.checked_div(b).ok_or(RewardError::DivisionByZero(what))
}

fn percent(value: f64, name: &str) -> Result<f64, RewardError> {
    if !value.is_finite() {
        return Err(RewardError::InvalidInput(format!("{} is {}", name, value)));
    }
    Ok(value.clamp(0.0, 100.0))
}

/// Compute the participation reward, reporting why it could not be computed.
pub fn compute_reward(params: &RewardParams, inputs: &RewardInputs) -> Result<u128, RewardError> {
    let voting = percent(inputs.voting_rate, "voting rate")?;
    let pow = percent(inputs.pow_rate, "pow rate")?;
    let hybrid = (voting + pow) / 2.0;

    // (100 - hybrid)% expressed in basis points, in [0, 10_000].
    let factor = ((100.0 - hybrid) * 100.0).round() as u128;
    let scaled = checked_mul(params.base_reward, factor, params.max_safe_value, "participation scaling")?;
    let scaled = checked_div(scaled, BASIS_POINTS, "participation scaling")?;

    let halvings = inputs
        .height
        .checked_div(params.halving_interval)
        .ok_or(RewardError::DivisionByZero("halving interval"))?;
    if halvings > MAX_HALVINGS {
        return Err(RewardError::HalvingOverflow(halvings));
    }
    let halved = scaled >> halvings;

    let network = inputs.network_difficulty;
    if !network.is_finite() || network < 0.0 {
        return Err(RewardError::InvalidInput(format!("network difficulty is {}", network)));
    }
    if network > params.max_safe_value as f64 {
        return Err(RewardError::Overflow("network difficulty"));
    }
    let difficulty = network.floor() as u128;
    let weighted = checked_mul(halved, difficulty, params.max_safe_value, "difficulty scaling")?;
    let reward = checked_div(weighted, params.base_difficulty as u128, "base difficulty")?;

    Ok(reward.max(params.min_reward))
}

/// Like `compute_reward`, but any failure yields `min_reward`.
pub fn reward_or_min(params: &RewardParams, inputs: &RewardInputs) -> u128 {
    match compute_reward(params, inputs) {
        Ok(reward) => reward,
        Err(e) => {
            warn!(
                "Reward calculation at height {} failed ({}); paying minimum reward",
                inputs.height,
                e
            );
            params.min_reward
        }
    }
}
