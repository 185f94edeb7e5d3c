// VOTING PERIOD MANAGER
// Time-boxed token-holder votes deciding between two competing chains.
//
// SAFETY INVARIANTS:
// 1. A period transitions Active -> Completed exactly once, only after end_time
// 2. One vote per voter per period; a second vote is rejected, never overwrites
// 3. Tallies are computed from an immutable snapshot of the period
// 4. approved + rejected == total_votes for every tally
// 5. Turning a tally into a decision never fails: errors degrade to the old chain
// 6. A Completed period always has a recorded decision

use futures::future::join_all;
use log::{debug, error, info, warn};
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, Result};
use crate::metrics::VotingMetrics;
use crate::services::{AuditEvent, AuditLog, ChainStorage, Severity};
use crate::types::{
    now_millis, CompetingChains, Validator, Vote, VoteTally, VotingPeriod, VotingStatus,
};
use crate::vote_processor::{ChunkResult, VoteProcessor};
use crate::vote_verifier::VoteVerifier;

const AUDIT_SOURCE: &str = "voting_period_manager";

pub struct VotingPeriodManager {
    config: ConsensusConfig,
    storage: Arc<dyn ChainStorage>,
    verifier: Arc<VoteVerifier>,
    audit: Arc<dyn AuditLog>,
    processor: VoteProcessor,
    periods: RwLock<BTreeMap<u64, VotingPeriod>>,
    /// Winning chain id of every completed period.
    decisions: RwLock<HashMap<u64, String>>,
    last_period_id: Mutex<u64>,
    votes_received: AtomicU64,
    votes_rejected: AtomicU64,
    last_participation: Mutex<f64>,
    closed: AtomicBool,
}

impl VotingPeriodManager {
    pub fn new(
        config: ConsensusConfig,
        storage: Arc<dyn ChainStorage>,
        verifier: Arc<VoteVerifier>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        let processor = VoteProcessor::new(config.vote_chunk_size);
        VotingPeriodManager {
            config,
            storage,
            verifier,
            audit,
            processor,
            periods: RwLock::new(BTreeMap::new()),
            decisions: RwLock::new(HashMap::new()),
            last_period_id: Mutex::new(0),
            votes_received: AtomicU64::new(0),
            votes_rejected: AtomicU64::new(0),
            last_participation: Mutex::new(0.0),
            closed: AtomicBool::new(false),
        }
    }

    /// Period ids are derived from wall-clock millis and bumped on collision.
    fn next_period_id(&self, now: u64) -> u64 {
        let mut last = self.last_period_id.lock();
        let id = now.max(last.saturating_add(1));
        *last = id;
        id
    }

    async fn audit(&self, event_type: &str, severity: Severity, details: serde_json::Value) {
        let event = AuditEvent::new(event_type, severity, AUDIT_SOURCE, details);
        if let Err(e) = self.audit.log_event(event).await {
            warn!("Audit log unavailable for {}: {}", event_type, e);
        }
    }

    /// Open a voting period deciding between `old_chain_id` and `new_chain_id`.
    ///
    /// Fails if the fork is deeper than `max_fork_depth` below the tip.
    pub async fn initialize_chain_voting_period(
        &self,
        old_chain_id: &str,
        new_chain_id: &str,
        fork_height: u64,
    ) -> Result<VotingPeriod> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsensusError::Disposed);
        }
        let current_height = self.storage.current_height().await?;
        let depth = current_height.saturating_sub(fork_height);
        if depth > self.config.max_fork_depth {
            return Err(ConsensusError::ForkDepthExceeded {
                fork_height,
                depth,
                max_depth: self.config.max_fork_depth,
            });
        }

        let now = now_millis();
        let period = VotingPeriod {
            period_id: self.next_period_id(now),
            start_block: current_height,
            end_block: current_height.saturating_add(self.config.voting_period_blocks),
            start_time: now,
            end_time: now.saturating_add(self.config.consensus_timeout_ms),
            status: VotingStatus::Active,
            votes: BTreeMap::new(),
            competing_chains: CompetingChains {
                old_chain_id: old_chain_id.to_string(),
                new_chain_id: new_chain_id.to_string(),
                common_ancestor_height: fork_height.saturating_sub(1),
            },
            fork_height,
        };
        self.periods.write().insert(period.period_id, period.clone());

        info!(
            "Voting period {} opened for fork at height {} ({} vs {}), ends at block {}",
            period.period_id, fork_height, old_chain_id, new_chain_id, period.end_block
        );
        self.audit(
            "VOTING_PERIOD_STARTED",
            Severity::Info,
            json!({
                "period_id": period.period_id,
                "fork_height": fork_height,
                "old_chain_id": old_chain_id,
                "new_chain_id": new_chain_id,
                "end_time": period.end_time,
            }),
        )
        .await;
        Ok(period)
    }

    /// Store a vote in an open period.
    pub fn submit_vote(&self, period_id: u64, vote: Vote) -> Result<()> {
        let mut periods = self.periods.write();
        let period = periods
            .get_mut(&period_id)
            .ok_or(ConsensusError::UnknownVotingPeriod { period_id })?;

        if !period.is_open_at(now_millis()) {
            self.votes_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ConsensusError::VotingPeriodCompleted { period_id });
        }
        if period.votes.contains_key(&vote.voter) {
            self.votes_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(ConsensusError::DuplicateVote {
                period_id,
                voter: vote.voter,
            });
        }

        debug!("Vote from {} stored in period {}", vote.voter, period_id);
        period.votes.insert(vote.voter.clone(), vote);
        self.votes_received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Verify and tally the votes of a finished period.
    ///
    /// Works on a snapshot taken at call time, so votes inserted while this
    /// runs cannot change the result.
    pub async fn collect_votes(
        &self,
        period: &VotingPeriod,
        validators: &[Validator],
    ) -> Result<VoteTally> {
        let snapshot = period.clone();
        if snapshot.is_open_at(now_millis()) {
            return Err(ConsensusError::VotingPeriodActive {
                period_id: snapshot.period_id,
            });
        }

        let votes = snapshot.votes();
        let verdicts = join_all(
            votes
                .iter()
                .map(|vote| self.verifier.verify_vote(vote, validators)),
        )
        .await;

        let valid: Vec<Vote> = votes
            .into_iter()
            .zip(verdicts)
            .filter_map(|(vote, ok)| {
                if !ok {
                    warn!(
                        "Discarding invalid vote from {} in period {}",
                        vote.voter, snapshot.period_id
                    );
                    self.votes_rejected.fetch_add(1, Ordering::Relaxed);
                }
                ok.then_some(vote)
            })
            .collect();

        let tally = Self::tally_votes(&valid);
        *self.last_participation.lock() = tally.participation_rate;
        info!(
            "Period {} tallied: approved={}, rejected={}, voters={}",
            snapshot.period_id, tally.approved, tally.rejected, tally.unique_voters
        );
        Ok(tally)
    }

    /// Count approvals and rejections. Malformed votes (no voter) are skipped.
    pub fn tally_votes(votes: &[Vote]) -> VoteTally {
        let mut approved = BigUint::zero();
        let mut rejected = BigUint::zero();
        let mut approved_count: u64 = 0;
        let mut rejected_count: u64 = 0;
        let mut voters = HashSet::new();

        for vote in votes {
            if vote.voter.is_empty() {
                warn!("Skipping malformed vote without voter");
                continue;
            }
            if vote.approve {
                approved += 1u32;
                approved_count += 1;
            } else {
                rejected += 1u32;
                rejected_count += 1;
            }
            voters.insert(vote.voter.as_str());
        }

        let total_votes = approved_count + rejected_count;
        let participation_rate = if total_votes == 0 {
            0.0
        } else {
            approved_count as f64 / total_votes as f64
        };

        VoteTally {
            approved,
            rejected,
            total_votes,
            unique_voters: voters.len() as u64,
            participation_rate,
            timestamp: now_millis(),
        }
    }

    fn approval_ratio(tally: &VoteTally) -> Option<f64> {
        let total = tally.total();
        if total.is_zero() {
            return Some(0.0);
        }
        let approved = tally.approved.to_f64()?;
        let total = total.to_f64()?;
        let ratio = approved / total;
        ratio.is_finite().then_some(ratio)
    }

    /// Pure decision rule. Returns the winner and, when the new chain wins,
    /// the approval ratio that carried it.
    fn decide(
        &self,
        tally: &VoteTally,
        old_chain_id: &str,
        new_chain_id: &str,
    ) -> (String, Option<f64>) {
        if tally.total().is_zero() {
            info!("No votes cast; keeping chain {}", old_chain_id);
            return (old_chain_id.to_string(), None);
        }

        let Some(approval_ratio) = Self::approval_ratio(tally) else {
            error!("Could not compute approval ratio; keeping chain {}", old_chain_id);
            return (old_chain_id.to_string(), None);
        };

        if approval_ratio >= self.config.chain_decision_threshold {
            info!(
                "Chain {} approved ({:.3} >= {:.3})",
                new_chain_id, approval_ratio, self.config.chain_decision_threshold
            );
            (new_chain_id.to_string(), Some(approval_ratio))
        } else {
            info!(
                "Chain {} not approved ({:.3} < {:.3}); keeping {}",
                new_chain_id, approval_ratio, self.config.chain_decision_threshold, old_chain_id
            );
            (old_chain_id.to_string(), None)
        }
    }

    async fn audit_switch(
        &self,
        tally: &VoteTally,
        old_chain_id: &str,
        new_chain_id: &str,
        approval_ratio: f64,
    ) {
        self.audit(
            "CHAIN_SWITCH_APPROVED",
            Severity::Warning,
            json!({
                "old_chain_id": old_chain_id,
                "new_chain_id": new_chain_id,
                "approval_ratio": approval_ratio,
                "approved": tally.approved.to_string(),
                "rejected": tally.rejected.to_string(),
            }),
        )
        .await;
    }

    /// Decide which chain wins. Never fails: no votes or any computation error
    /// keeps `old_chain_id`.
    pub async fn process_voting_results(
        &self,
        tally: &VoteTally,
        old_chain_id: &str,
        new_chain_id: &str,
    ) -> String {
        let (winner, approval_ratio) = self.decide(tally, old_chain_id, new_chain_id);
        if let Some(ratio) = approval_ratio {
            self.audit_switch(tally, old_chain_id, new_chain_id, ratio).await;
        }
        winner
    }

    /// Collect, tally and complete a finished period.
    ///
    /// The decision is recorded together with the status change, so a caller
    /// cancelled at any later await still finds it.
    pub async fn conclude_period(
        &self,
        period_id: u64,
        validators: &[Validator],
    ) -> Result<VoteTally> {
        let snapshot = self
            .get_period(period_id)
            .ok_or(ConsensusError::UnknownVotingPeriod { period_id })?;
        if snapshot.status == VotingStatus::Completed {
            return Err(ConsensusError::VotingPeriodCompleted { period_id });
        }

        let tally = self.collect_votes(&snapshot, validators).await?;
        let chains = &snapshot.competing_chains;
        let (winner, approval_ratio) =
            self.decide(&tally, &chains.old_chain_id, &chains.new_chain_id);

        {
            let mut periods = self.periods.write();
            let period = periods
                .get_mut(&period_id)
                .ok_or(ConsensusError::UnknownVotingPeriod { period_id })?;
            if period.status == VotingStatus::Completed {
                return Err(ConsensusError::VotingPeriodCompleted { period_id });
            }
            period.status = VotingStatus::Completed;
            self.decisions.write().insert(period_id, winner.clone());
        }

        if let Some(ratio) = approval_ratio {
            self.audit_switch(&tally, &chains.old_chain_id, &chains.new_chain_id, ratio)
                .await;
        }
        self.audit(
            "VOTING_PERIOD_COMPLETED",
            Severity::Info,
            json!({
                "period_id": period_id,
                "winner": winner,
                "approved": tally.approved.to_string(),
                "rejected": tally.rejected.to_string(),
                "unique_voters": tally.unique_voters,
            }),
        )
        .await;
        Ok(tally)
    }

    /// Winning chain id of a finished period. Never reports a completed period
    /// as an error: a missing decision is recomputed from the stored votes.
    pub async fn resolve_period(&self, period_id: u64, validators: &[Validator]) -> Result<String> {
        if let Some(decision) = self.decision_for(period_id) {
            return Ok(decision);
        }
        let period = self
            .get_period(period_id)
            .ok_or(ConsensusError::UnknownVotingPeriod { period_id })?;

        if period.status == VotingStatus::Active {
            match self.conclude_period(period_id, validators).await {
                Ok(_) | Err(ConsensusError::VotingPeriodCompleted { .. }) => {}
                Err(e) => return Err(e),
            }
            if let Some(decision) = self.decision_for(period_id) {
                return Ok(decision);
            }
        }

        warn!(
            "Voting period {} completed without a recorded decision; recounting",
            period_id
        );
        let completed = self
            .get_period(period_id)
            .ok_or(ConsensusError::UnknownVotingPeriod { period_id })?;
        let tally = self.collect_votes(&completed, validators).await?;
        let chains = &completed.competing_chains;
        let (winner, _) = self.decide(&tally, &chains.old_chain_id, &chains.new_chain_id);
        let winner = self
            .decisions
            .write()
            .entry(period_id)
            .or_insert(winner)
            .clone();
        Ok(winner)
    }

    /// Stake-weighted view of a period's votes.
    pub fn weighted_tally(&self, period: &VotingPeriod) -> ChunkResult {
        self.processor.process_votes(&period.votes())
    }

    pub fn get_period(&self, period_id: u64) -> Option<VotingPeriod> {
        self.periods.read().get(&period_id).cloned()
    }

    /// The period deciding between these two chains, if one was opened.
    pub fn period_for_fork(&self, old_chain_id: &str, new_chain_id: &str) -> Option<VotingPeriod> {
        self.periods
            .read()
            .values()
            .rev()
            .find(|p| {
                p.competing_chains.old_chain_id == old_chain_id
                    && p.competing_chains.new_chain_id == new_chain_id
            })
            .cloned()
    }

    pub fn active_period_for_fork(
        &self,
        old_chain_id: &str,
        new_chain_id: &str,
    ) -> Option<VotingPeriod> {
        self.period_for_fork(old_chain_id, new_chain_id)
            .filter(|p| p.status == VotingStatus::Active)
    }

    pub fn active_periods(&self) -> Vec<VotingPeriod> {
        self.periods
            .read()
            .values()
            .filter(|p| p.status == VotingStatus::Active)
            .cloned()
            .collect()
    }

    pub fn decision_for(&self, period_id: u64) -> Option<String> {
        self.decisions.read().get(&period_id).cloned()
    }

    /// Participation rate of the latest tally, in percent.
    pub fn participation_rate_percent(&self) -> f64 {
        *self.last_participation.lock() * 100.0
    }

    pub fn metrics(&self) -> VotingMetrics {
        let periods = self.periods.read();
        let active = periods
            .values()
            .filter(|p| p.status == VotingStatus::Active)
            .count() as u64;
        VotingMetrics {
            total_periods: periods.len() as u64,
            active_periods: active,
            completed_periods: periods.len() as u64 - active,
            votes_received: self.votes_received.load(Ordering::Relaxed),
            votes_rejected: self.votes_rejected.load(Ordering::Relaxed),
            last_participation_rate: *self.last_participation.lock(),
        }
    }

    pub fn health_check(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting new periods. Existing periods are kept for audit.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("Voting period manager closed");
        }
    }
}
