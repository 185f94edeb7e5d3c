// Stake-weighted vote aggregation.
//
// Sums the token balance behind approving and rejecting votes in parallel.
// Large vote sets are cut into fixed-size chunks so a single pass never holds
// more than one chunk's intermediate state per worker.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::VOTE_CHUNK_SIZE;
use crate::types::Vote;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub approved: u128,
    pub rejected: u128,
    /// Distinct voters, sorted.
    pub voters: Vec<String>,
}

impl ChunkResult {
    fn merge(mut self, other: ChunkResult) -> ChunkResult {
        self.approved = self.approved.saturating_add(other.approved);
        self.rejected = self.rejected.saturating_add(other.rejected);
        let voters: BTreeSet<String> = self.voters.into_iter().chain(other.voters).collect();
        self.voters = voters.into_iter().collect();
        self
    }
}

#[derive(Debug, Clone)]
pub struct VoteProcessor {
    chunk_size: usize,
}

impl Default for VoteProcessor {
    fn default() -> Self {
        VoteProcessor {
            chunk_size: VOTE_CHUNK_SIZE,
        }
    }
}

impl VoteProcessor {
    pub fn new(chunk_size: usize) -> Self {
        VoteProcessor {
            chunk_size: chunk_size.max(1),
        }
    }

    /// A missing or unparseable balance weighs nothing.
    fn weight(vote: &Vote) -> u128 {
        vote.balance
            .as_deref()
            .and_then(|b| b.trim().parse::<u128>().ok())
            .unwrap_or(0)
    }

    /// Aggregate one chunk of votes.
    pub fn process_vote_chunk(&self, votes: &[Vote]) -> ChunkResult {
        let (approved, rejected) = votes
            .par_iter()
            .fold(
                || (0u128, 0u128),
                |(app, rej), vote| {
                    let weight = Self::weight(vote);
                    if vote.approve {
                        (app.saturating_add(weight), rej)
                    } else {
                        (app, rej.saturating_add(weight))
                    }
                },
            )
            .reduce(
                || (0u128, 0u128),
                |a, b| (a.0.saturating_add(b.0), a.1.saturating_add(b.1)),
            );

        let voters: BTreeSet<String> = votes.iter().map(|v| v.voter.clone()).collect();

        ChunkResult {
            approved,
            rejected,
            voters: voters.into_iter().collect(),
        }
    }

    /// Aggregate an arbitrarily large vote set chunk by chunk.
    pub fn process_votes(&self, votes: &[Vote]) -> ChunkResult {
        votes
            .chunks(self.chunk_size)
            .map(|chunk| self.process_vote_chunk(chunk))
            .fold(ChunkResult::default(), ChunkResult::merge)
    }
}
