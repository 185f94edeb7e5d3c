// VOTE VERIFIER
// Validates a single fork vote before it can be counted.
//
// SAFETY INVARIANTS:
// 1. Verification never returns an error: a bad vote is data, not a fault
// 2. Every voter has a request budget ("vote_verify:<voter>")
// 3. Structural and signature checks are bounded by a hard deadline
// 4. A vote counts only if the voter is an active validator and the signature
//    over "<target_chain_id>:<timestamp>" verifies

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::services::{ChainStorage, RateLimiter};
use crate::types::{Validator, Vote};

pub struct VoteVerifier {
    storage: Arc<dyn ChainStorage>,
    rate_limiter: Arc<dyn RateLimiter>,
    timeout: Duration,
}

impl VoteVerifier {
    pub fn new(
        storage: Arc<dyn ChainStorage>,
        rate_limiter: Arc<dyn RateLimiter>,
        timeout: Duration,
    ) -> Self {
        VoteVerifier {
            storage,
            rate_limiter,
            timeout,
        }
    }

    pub fn rate_limit_key(voter: &str) -> String {
        format!("vote_verify:{}", voter)
    }

    /// Verify one vote against the validator set.
    ///
    /// Returns `false` on rate limiting, timeout, malformed input, ineligible
    /// voter or bad signature.
    pub async fn verify_vote(&self, vote: &Vote, validators: &[Validator]) -> bool {
        let key = Self::rate_limit_key(&vote.voter);
        match self.rate_limiter.check_request(&key, &vote.voter).await {
            Ok(true) => {}
            Ok(false) => {
                warn!("Vote from {} rejected: rate limit exceeded", vote.voter);
                return false;
            }
            Err(e) => {
                warn!("Vote from {} rejected: rate limiter failure: {}", vote.voter, e);
                return false;
            }
        }

        match tokio::time::timeout(self.timeout, self.check_vote(vote, validators)).await {
            Ok(valid) => valid,
            Err(_) => {
                warn!(
                    "Vote from {} rejected: verification timed out after {:?}",
                    vote.voter, self.timeout
                );
                false
            }
        }
    }

    async fn check_vote(&self, vote: &Vote, validators: &[Validator]) -> bool {
        let Some(chain_vote_data) = vote.chain_vote_data.as_ref() else {
            debug!("Vote from {} is missing chain vote data", vote.voter);
            return false;
        };
        let signature = match vote.signature.as_deref() {
            Some(sig) if !sig.is_empty() => sig,
            _ => {
                debug!("Vote from {} is missing a signature", vote.voter);
                return false;
            }
        };
        if vote.voter.is_empty() {
            debug!("Vote has no voter address");
            return false;
        }

        match validators.iter().find(|v| v.address == vote.voter) {
            Some(validator) if validator.active => {}
            Some(_) => {
                debug!("Vote from inactive validator {}", vote.voter);
                return false;
            }
            None => {
                debug!("Vote from unknown validator {}", vote.voter);
                return false;
            }
        }

        let message = Vote::signing_message(&chain_vote_data.target_chain_id, vote.timestamp);
        match self
            .storage
            .verify_signature(&vote.voter, &message, signature)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                debug!("Invalid signature on vote from {}", vote.voter);
                false
            }
            Err(e) => {
                warn!("Signature check for {} failed: {}", vote.voter, e);
                false
            }
        }
    }
}
