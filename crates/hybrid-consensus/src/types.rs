// Data model shared by every consensus component.
//
// SAFETY INVARIANTS:
// 1. A block's hash commits to every header field except the hash itself
// 2. A VotingPeriod holds at most one vote per voter
// 3. A VoteTally always satisfies approved + rejected == total_votes

use chrono::Utc;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::collections::BTreeMap;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub sender: String,
    pub receiver: String,
    pub amount: u64,
    pub timestamp: u64,
}

impl Transaction {
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, amount: u64) -> Self {
        let mut tx = Transaction {
            hash: String::new(),
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
            timestamp: now_millis(),
        };
        tx.hash = tx.compute_hash();
        tx
    }

    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha3_256::new();
        hasher.update(format!(
            "{}{}{}{}",
            self.sender, self.receiver, self.amount, self.timestamp
        ));
        hex::encode(hasher.finalize())
    }
}

/// Block header. `hash` is filled in by the miner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub previous_hash: String,
    pub merkle_root: String,
    pub difficulty: u64,
    pub nonce: u64,
    pub miner: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub hash: String,
}

/// A validator as seen by vote verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub address: String,
    pub active: bool,
    pub stake: u128,
}

impl Validator {
    pub fn new(address: impl Into<String>, stake: u128) -> Self {
        Validator {
            address: address.into(),
            active: true,
            stake,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVoteData {
    /// Chain (tip hash) the voter is voting on.
    pub target_chain_id: String,
}

/// A token-holder vote on a fork decision. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: String,
    pub chain_vote_data: Option<ChainVoteData>,
    /// Hex-encoded signature over `"<target_chain_id>:<timestamp>"`.
    pub signature: Option<String>,
    pub timestamp: u64,
    pub approve: bool,
    /// Token balance backing the vote, as a decimal string.
    #[serde(default)]
    pub balance: Option<String>,
}

impl Vote {
    /// The message a voter signs.
    pub fn signing_message(target_chain_id: &str, timestamp: u64) -> String {
        format!("{}:{}", target_chain_id, timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub validators: Vec<Validator>,
    pub votes: Vec<Vote>,
    pub signature: Option<String>,
}

impl Block {
    /// Create an unmined block on top of `previous_hash`.
    pub fn new(
        height: u64,
        previous_hash: impl Into<String>,
        miner: impl Into<String>,
        difficulty: u64,
        transactions: Vec<Transaction>,
    ) -> Self {
        Block {
            header: BlockHeader {
                height,
                previous_hash: previous_hash.into(),
                merkle_root: String::new(),
                difficulty,
                nonce: 0,
                miner: miner.into(),
                timestamp: now_millis(),
                hash: String::new(),
            },
            transactions,
            validators: Vec::new(),
            votes: Vec::new(),
            signature: None,
        }
    }

    pub fn hash(&self) -> &str {
        &self.header.hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn transaction_hashes(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.hash.clone()).collect()
    }

    /// Compute the header hash using SHA3-256.
    ///
    /// SAFETY: the nonce is part of the preimage, so the PoW search and the
    /// PoW check hash exactly the same bytes.
    pub fn compute_hash(&self) -> String {
        let h = &self.header;
        let mut hasher = Sha3_256::new();
        hasher.update(format!(
            "{}{}{}{}{}{}{}",
            h.height, h.previous_hash, h.merkle_root, h.difficulty, h.nonce, h.miner, h.timestamp
        ));
        hex::encode(hasher.finalize())
    }

    /// Comma-separated validator addresses, as the mempool expects them.
    pub fn validators_csv(&self) -> String {
        self.validators
            .iter()
            .map(|v| v.address.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VotingStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetingChains {
    pub old_chain_id: String,
    pub new_chain_id: String,
    pub common_ancestor_height: u64,
}

/// A bounded window during which votes on one fork decision are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingPeriod {
    pub period_id: u64,
    pub start_block: u64,
    pub end_block: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub status: VotingStatus,
    pub votes: BTreeMap<String, Vote>,
    pub competing_chains: CompetingChains,
    pub fork_height: u64,
}

impl VotingPeriod {
    /// Votes may still be cast and tallying is premature.
    pub fn is_open_at(&self, now: u64) -> bool {
        self.status == VotingStatus::Active && now < self.end_time
    }

    pub fn votes(&self) -> Vec<Vote> {
        self.votes.values().cloned().collect()
    }
}

/// Result of counting a set of votes. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteTally {
    pub approved: BigUint,
    pub rejected: BigUint,
    pub total_votes: u64,
    pub unique_voters: u64,
    /// approved / (approved + rejected): the approval share of cast votes.
    pub participation_rate: f64,
    pub timestamp: u64,
}

impl VoteTally {
    pub fn empty() -> Self {
        VoteTally {
            approved: BigUint::default(),
            rejected: BigUint::default(),
            total_votes: 0,
            unique_voters: 0,
            participation_rate: 0.0,
            timestamp: now_millis(),
        }
    }

    pub fn total(&self) -> BigUint {
        &self.approved + &self.rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_hash_commits_to_nonce() {
        let mut block = Block::new(1, "0".repeat(64), "miner-1", 2, vec![]);
        let first = block.compute_hash();
        block.header.nonce += 1;
        assert_ne!(first, block.compute_hash());
    }

    #[test]
    fn test_transaction_hash_set_on_creation() {
        let tx = Transaction::new("alice", "bob", 10);
        assert_eq!(tx.hash, tx.compute_hash());
        assert_eq!(tx.hash.len(), 64);
    }

    #[test]
    fn test_validators_csv() {
        let mut block = Block::new(1, "prev", "m", 1, vec![]);
        block.validators = vec![Validator::new("v1", 10), Validator::new("v2", 20)];
        assert_eq!(block.validators_csv(), "v1,v2");
    }

    #[test]
    fn test_signing_message_format() {
        assert_eq!(Vote::signing_message("chain-a", 42), "chain-a:42");
    }

    #[test]
    fn test_empty_tally_total() {
        let tally = VoteTally::empty();
        assert_eq!(tally.total(), BigUint::default());
        assert_eq!(tally.participation_rate, 0.0);
    }
}
