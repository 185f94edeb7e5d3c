// Error taxonomy for the hybrid consensus core.
//
// Bad blocks and bad votes are expected adversarial input: they surface as
// `false` or a typed rejection, never as one of these errors. The errors here
// are operational failures the caller has to act on.

use thiserror::Error;

/// Operational failure of the consensus core. Always surfaced to the caller.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Too many consecutive validation failures; validation is short-circuited.
    #[error("Circuit breaker open after {failures} consecutive failures")]
    CircuitOpen { failures: u32 },

    /// A lock could not be acquired before its deadline.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Fork resolution did not finish before its deadline.
    #[error("Fork resolution at height {height} timed out after {timeout_ms}ms")]
    ForkResolutionTimeout { height: u64, timeout_ms: u64 },

    /// The DDoS guard refused the request.
    #[error("Rate limit exceeded for {key}")]
    RateLimited { key: String },

    #[error("Fork at height {fork_height} is {depth} blocks deep (max {max_depth})")]
    ForkDepthExceeded { fork_height: u64, depth: u64, max_depth: u64 },

    #[error("Voting period {period_id} still active")]
    VotingPeriodActive { period_id: u64 },

    #[error("Voting period {period_id} already completed")]
    VotingPeriodCompleted { period_id: u64 },

    #[error("Unknown voting period {period_id}")]
    UnknownVotingPeriod { period_id: u64 },

    /// A voter tried to vote twice in the same period.
    #[error("Duplicate vote from {voter} in period {period_id}")]
    DuplicateVote { period_id: u64, voter: String },

    #[error("Mining failed after {attempts} attempts: {last_error}")]
    MiningExhausted { attempts: u32, last_error: String },

    #[error("Consensus engine has been disposed")]
    Disposed,

    #[error("Invalid consensus configuration: {0}")]
    InvalidConfig(String),

    /// Failure reported by an external collaborator (storage, PoW, audit, ...).
    #[error(transparent)]
    Service(#[from] anyhow::Error),
}

/// A specific block failed validation and the failure must be reported
/// rather than encoded as `false` (the validation deadline path).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Block {block_hash} failed validation: {details}")]
pub struct BlockValidationError {
    pub block_hash: String,
    pub details: String,
}

/// Reward arithmetic failure. Never escapes `calculate_participation_reward`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RewardError {
    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),

    #[error("Division by zero in {0}")]
    DivisionByZero(&'static str),

    #[error("Halving count {0} exceeds 64")]
    HalvingOverflow(u64),

    #[error("Invalid reward input: {0}")]
    InvalidInput(String),
}

/// Umbrella error returned by the top-level engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    BlockValidation(#[from] BlockValidationError),
}

impl Error {
    /// True when the error is an operational consensus failure of the given kind.
    pub fn as_consensus(&self) -> Option<&ConsensusError> {
        match self {
            Error::Consensus(e) => Some(e),
            Error::BlockValidation(_) => None,
        }
    }
}

pub type Result<T, E = ConsensusError> = std::result::Result<T, E>;
