// Token-holder voting on forks, end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, sealed_block, signed_vote, Harness, SlowSignatureStorage};
use hybrid_consensus::memory::InMemoryChainStorage;
use hybrid_consensus::rate_limit::SlidingWindowRateLimiter;
use hybrid_consensus::{
    ConsensusConfig, ConsensusError, RejectReason, Validation, Validator, VoteTally,
    VoteVerifier, VotingPeriodManager, VotingStatus,
};

fn voters() -> Vec<Validator> {
    vec![
        Validator::new("alice", 100),
        Validator::new("bob", 100),
        Validator::new("carol", 100),
    ]
}

fn register_voters(storage: &InMemoryChainStorage) {
    for voter in ["alice", "bob", "carol"] {
        storage.register_key(voter, format!("{}-secret", voter).into_bytes());
    }
}

#[test_log::test(tokio::test)]
async fn test_no_votes_keeps_old_chain() {
    let h = Harness::new(fast_config());
    let winner = h
        .engine
        .voting()
        .process_voting_results(&VoteTally::empty(), "old-chain", "new-chain")
        .await;
    assert_eq!(winner, "old-chain");
}

#[test_log::test(tokio::test)]
async fn test_decision_threshold_is_inclusive_of_two_thirds() {
    let storage = InMemoryChainStorage::new();
    register_voters(&storage);
    let votes = vec![
        signed_vote(&storage, "alice", "new-chain", true),
        signed_vote(&storage, "bob", "new-chain", true),
        signed_vote(&storage, "carol", "new-chain", false),
    ];
    let tally = VotingPeriodManager::tally_votes(&votes);
    assert_eq!(tally.total_votes, 3);

    let lenient = Harness::new(ConsensusConfig {
        chain_decision_threshold: 0.66,
        ..fast_config()
    });
    assert_eq!(
        lenient
            .engine
            .voting()
            .process_voting_results(&tally, "old-chain", "new-chain")
            .await,
        "new-chain"
    );
    assert_eq!(lenient.audit.events_of_type("CHAIN_SWITCH_APPROVED").len(), 1);

    let strict = Harness::new(ConsensusConfig {
        chain_decision_threshold: 0.75,
        ..fast_config()
    });
    assert_eq!(
        strict
            .engine
            .voting()
            .process_voting_results(&tally, "old-chain", "new-chain")
            .await,
        "old-chain"
    );
}

#[test_log::test(tokio::test)]
async fn test_collect_votes_waits_for_period_end() {
    let h = Harness::new(ConsensusConfig {
        consensus_timeout_ms: 80,
        ..fast_config()
    });
    let voting = h.engine.voting();
    let period = voting
        .initialize_chain_voting_period("old-chain", "new-chain", 0)
        .await
        .unwrap();

    let err = voting.collect_votes(&period, &voters()).await.unwrap_err();
    assert!(matches!(err, ConsensusError::VotingPeriodActive { .. }));
    assert!(err.to_string().contains("still active"));

    tokio::time::sleep(Duration::from_millis(120)).await;
    let tally = voting.collect_votes(&period, &voters()).await.unwrap();
    assert_eq!(tally.total_votes, 0);
}

#[test_log::test(tokio::test)]
async fn test_fork_depth_limit_on_new_periods() {
    let h = Harness::new(fast_config());
    h.storage.set_current_height(5_000);
    let err = h
        .engine
        .voting()
        .initialize_chain_voting_period("old-chain", "new-chain", 10)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ConsensusError::ForkDepthExceeded { depth: 4_990, max_depth: 1_000, .. }
    ));
}

#[test_log::test(tokio::test)]
async fn test_bad_votes_are_false_not_errors() {
    let storage = Arc::new(InMemoryChainStorage::new());
    register_voters(&storage);
    let verifier = VoteVerifier::new(
        storage.clone(),
        Arc::new(SlidingWindowRateLimiter::default()),
        Duration::from_secs(5),
    );

    let mut unsigned = signed_vote(&storage, "alice", "new-chain", true);
    unsigned.signature = None;
    assert!(!verifier.verify_vote(&unsigned, &voters()).await);

    let mut validators = voters();
    validators[1].active = false;
    let from_inactive = signed_vote(&storage, "bob", "new-chain", true);
    assert!(!verifier.verify_vote(&from_inactive, &validators).await);

    let mut forged = signed_vote(&storage, "carol", "new-chain", true);
    forged.chain_vote_data = Some(hybrid_consensus::types::ChainVoteData {
        target_chain_id: "other-chain".into(),
    });
    assert!(!verifier.verify_vote(&forged, &voters()).await);
}

#[test_log::test(tokio::test)]
async fn test_slow_signature_check_times_out_as_false() {
    let inner = Arc::new(InMemoryChainStorage::new());
    register_voters(&inner);
    let storage = Arc::new(SlowSignatureStorage {
        inner: inner.clone(),
        delay: Duration::from_millis(300),
    });
    let verifier = VoteVerifier::new(
        storage,
        Arc::new(SlidingWindowRateLimiter::default()),
        Duration::from_millis(50),
    );

    let vote = signed_vote(&inner, "alice", "new-chain", true);
    assert!(!verifier.verify_vote(&vote, &voters()).await);
}

#[test_log::test(tokio::test)]
async fn test_duplicate_votes_are_refused() {
    let h = Harness::new(fast_config());
    register_voters(&h.storage);
    let voting = h.engine.voting();
    let period = voting
        .initialize_chain_voting_period("old-chain", "new-chain", 0)
        .await
        .unwrap();

    voting
        .submit_vote(period.period_id, signed_vote(&h.storage, "alice", "new-chain", true))
        .unwrap();
    let err = voting
        .submit_vote(period.period_id, signed_vote(&h.storage, "alice", "new-chain", false))
        .unwrap_err();
    assert!(matches!(err, ConsensusError::DuplicateVote { ref voter, .. } if voter == "alice"));
    assert_eq!(voting.metrics().votes_received, 1);
    assert_eq!(voting.metrics().votes_rejected, 1);
}

#[test_log::test(tokio::test)]
async fn test_vote_decides_fork_inside_voting_window() {
    let config = ConsensusConfig {
        consensus_timeout_ms: 100,
        ..fast_config()
    };
    let h = Harness::new(config);
    register_voters(&h.storage);
    h.storage.set_voting_window(0, 1_000);

    let incumbent = sealed_block(10, "incumbent", 1, 1_000, voters());
    h.storage.insert_block(incumbent.clone());
    let challenger = sealed_block(10, "challenger", 1, 2_000, voters());

    // First sighting opens a vote; the incumbent holds meanwhile.
    let validation = h.engine.validate_block_detailed(&challenger).await.unwrap();
    match validation {
        Validation::Rejected(RejectReason::ForkLost { winner }) => {
            assert_eq!(winner, incumbent.hash())
        }
        other => panic!("unexpected validation {:?}", other),
    }
    let period = h
        .engine
        .voting()
        .active_period_for_fork(incumbent.hash(), challenger.hash())
        .expect("voting period opened");
    assert_eq!(period.fork_height, 10);
    assert_eq!(h.audit.events_of_type("VOTING_PERIOD_STARTED").len(), 1);

    let voting = h.engine.voting();
    for (voter, approve) in [("alice", true), ("bob", true), ("carol", false)] {
        voting
            .submit_vote(
                period.period_id,
                signed_vote(&h.storage, voter, challenger.hash(), approve),
            )
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.engine.validate_block(&challenger).await.unwrap());

    let period = voting.get_period(period.period_id).unwrap();
    assert_eq!(period.status, VotingStatus::Completed);
    assert_eq!(
        voting.decision_for(period.period_id).as_deref(),
        Some(challenger.hash())
    );
    let weighted = voting.weighted_tally(&period);
    assert_eq!(weighted.approved, 2_000);
    assert_eq!(weighted.rejected, 1_000);
    assert!(voting.metrics().last_participation_rate > 0.66);
}

#[test_log::test(tokio::test)]
async fn test_votes_after_period_end_are_refused() {
    let h = Harness::new(ConsensusConfig {
        consensus_timeout_ms: 0,
        ..fast_config()
    });
    register_voters(&h.storage);
    let voting = h.engine.voting();
    let period = voting
        .initialize_chain_voting_period("old-chain", "new-chain", 0)
        .await
        .unwrap();
    let err = voting
        .submit_vote(period.period_id, signed_vote(&h.storage, "alice", "new-chain", true))
        .unwrap_err();
    assert!(matches!(err, ConsensusError::VotingPeriodCompleted { .. }));
}

#[test_log::test(tokio::test)]
async fn test_fork_still_decided_after_period_concluded_directly() {
    let h = Harness::new(ConsensusConfig {
        consensus_timeout_ms: 100,
        ..fast_config()
    });
    register_voters(&h.storage);
    h.storage.set_voting_window(0, 1_000);

    let incumbent = sealed_block(10, "incumbent", 1, 1_000, voters());
    h.storage.insert_block(incumbent.clone());
    let challenger = sealed_block(10, "challenger", 1, 2_000, voters());

    assert!(!h.engine.validate_block(&challenger).await.unwrap());
    let voting = h.engine.voting();
    let period = voting
        .active_period_for_fork(incumbent.hash(), challenger.hash())
        .expect("voting period opened");
    for (voter, approve) in [("alice", true), ("bob", true), ("carol", true)] {
        voting
            .submit_vote(
                period.period_id,
                signed_vote(&h.storage, voter, challenger.hash(), approve),
            )
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(150)).await;
    let tally = voting.conclude_period(period.period_id, &voters()).await.unwrap();
    assert_eq!(tally.total_votes, 3);

    for _ in 0..3 {
        assert!(h.engine.validate_block(&challenger).await.unwrap());
    }
    assert_eq!(h.engine.circuit_breaker().failures(), 0);
    assert_eq!(
        voting.decision_for(period.period_id).as_deref(),
        Some(challenger.hash())
    );
}

#[test_log::test(tokio::test)]
async fn test_concluded_period_without_votes_keeps_incumbent() {
    let h = Harness::new(ConsensusConfig {
        consensus_timeout_ms: 50,
        ..fast_config()
    });
    h.storage.set_voting_window(0, 1_000);

    let incumbent = sealed_block(10, "incumbent", 1, 1_000, voters());
    h.storage.insert_block(incumbent.clone());
    let challenger = sealed_block(10, "challenger", 1, 2_000, voters());

    h.engine.validate_block(&challenger).await.unwrap();
    let period = h
        .engine
        .voting()
        .period_for_fork(incumbent.hash(), challenger.hash())
        .expect("voting period opened");
    tokio::time::sleep(Duration::from_millis(80)).await;
    h.engine
        .voting()
        .conclude_period(period.period_id, &voters())
        .await
        .unwrap();

    for _ in 0..6 {
        let validation = h.engine.validate_block_detailed(&challenger).await.unwrap();
        assert_eq!(
            validation,
            Validation::Rejected(RejectReason::ForkLost {
                winner: incumbent.hash().to_string()
            })
        );
    }
    assert_eq!(h.engine.circuit_breaker().failures(), 0);
}
