use super::*;
use crate::cache::memory::MemoryBackend;
use crate::cache::KeySpace;
use crate::config::Config;
use crate::error::ForumError;
use crate::observability::ForumMetrics;
use crate::types::{PostOrder, VoteDirection, VoteState};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

fn create_test_ledger(backend: &Arc<MemoryBackend>) -> VoteLedger {
    VoteLedger::new(backend.clone(), KeySpace::new("test"), &Config::default().vote, None)
}

#[tokio::test]
async fn test_vote_sequence_on_fresh_post() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);
    ledger.post_created(100, 1).await.unwrap();
    assert_eq!(ledger.score(100).await.unwrap(), 0.0);

    ledger.submit_vote(7, 100, VoteDirection::Up).await.unwrap();
    assert_eq!(ledger.score(100).await.unwrap(), 432.0);
    assert_eq!(ledger.vote_state(7, 100).await.unwrap(), VoteState::Upvoted);

    ledger.submit_vote(7, 100, VoteDirection::Down).await.unwrap();
    assert_eq!(ledger.score(100).await.unwrap(), -432.0);

    ledger.submit_vote(7, 100, VoteDirection::Cancel).await.unwrap();
    assert_eq!(ledger.score(100).await.unwrap(), 0.0);
    assert_eq!(ledger.vote_state(7, 100).await.unwrap(), VoteState::NoVote);
}

#[tokio::test]
async fn test_transition_diffs() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);
    ledger.post_created(1, 1).await.unwrap();

    let steps = [
        (VoteDirection::Down, -432.0),
        (VoteDirection::Cancel, 0.0),
        (VoteDirection::Down, -432.0),
        (VoteDirection::Up, 432.0),
        (VoteDirection::Cancel, 0.0),
    ];
    for (direction, expected) in steps {
        ledger.submit_vote(9, 1, direction).await.unwrap();
        assert_eq!(ledger.score(1).await.unwrap(), expected, "after {:?}", direction);
    }
}

#[tokio::test]
async fn test_repeated_vote_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);
    ledger.post_created(5, 1).await.unwrap();

    ledger.submit_vote(7, 5, VoteDirection::Up).await.unwrap();
    let result = ledger.submit_vote(7, 5, VoteDirection::Up).await;

    assert!(matches!(result, Err(ForumError::VoteRepeated)));
    assert_eq!(ledger.score(5).await.unwrap(), 432.0);

    // cancelling with no vote on record is also a repeat
    let result = ledger.submit_vote(8, 5, VoteDirection::Cancel).await;
    assert!(matches!(result, Err(ForumError::VoteRepeated)));
}

#[tokio::test]
async fn test_vote_after_window_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);
    let created = Utc::now() - ChronoDuration::days(30);
    ledger.register_post(3, 1, created).await.unwrap();

    let inside = ledger
        .submit_vote_at(7, 3, VoteDirection::Up, created + ChronoDuration::days(6))
        .await;
    assert!(inside.is_ok());

    let outside = ledger
        .submit_vote_at(8, 3, VoteDirection::Up, created + ChronoDuration::days(8))
        .await;
    assert!(matches!(outside, Err(ForumError::VoteTimeExpired)));
    assert_eq!(ledger.score(3).await.unwrap(), 432.0);
    assert_eq!(ledger.vote_state(8, 3).await.unwrap(), VoteState::NoVote);
}

#[tokio::test]
async fn test_vote_on_unregistered_post() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);

    let result = ledger.submit_vote(7, 404, VoteDirection::Up).await;
    assert!(matches!(result, Err(ForumError::NotFound(_))));
}

#[tokio::test]
async fn test_ledger_failure_is_propagated() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);
    ledger.post_created(1, 1).await.unwrap();

    backend.set_failing(true);
    let result = ledger.submit_vote(7, 1, VoteDirection::Up).await;
    assert!(matches!(result, Err(ForumError::RedisError(_))));

    backend.set_failing(false);
    assert_eq!(ledger.score(1).await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_post_created_registers_community_membership() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);

    ledger.post_created(11, 4).await.unwrap();
    ledger.post_created(12, 4).await.unwrap();

    let members = backend.set_members(&KeySpace::new("test").community_posts(4));
    assert_eq!(members.len(), 2);
    assert!(members.contains("11"));
}

#[tokio::test]
async fn test_ordered_ids_and_scores() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);
    let now = Utc::now();
    for (offset, post_id) in [(3, 1_i64), (2, 2), (1, 3)] {
        ledger
            .register_post(post_id, 1, now - ChronoDuration::hours(offset))
            .await
            .unwrap();
    }
    ledger.submit_vote(7, 1, VoteDirection::Up).await.unwrap();
    ledger.submit_vote(7, 3, VoteDirection::Down).await.unwrap();

    assert_eq!(ledger.post_ids_in_order(PostOrder::Time, 1, 10).await.unwrap(), vec![3, 2, 1]);
    assert_eq!(ledger.post_ids_in_order(PostOrder::Score, 1, 2).await.unwrap(), vec![1, 2]);
    assert_eq!(ledger.post_ids_in_order(PostOrder::Score, 2, 2).await.unwrap(), vec![3]);
    assert!(ledger.post_ids_in_order(PostOrder::Time, 0, 2).await.is_err());

    let scores = ledger.scores(&[1, 3, 99]).await.unwrap();
    assert_eq!(scores[&1], 432.0);
    assert_eq!(scores[&3], -432.0);
    assert_eq!(scores[&99], 0.0);
}

#[tokio::test]
async fn test_vote_outcomes_are_counted() {
    let backend = Arc::new(MemoryBackend::new());
    let metrics = ForumMetrics::new().unwrap();
    let ledger = VoteLedger::new(
        backend.clone(),
        KeySpace::new("test"),
        &Config::default().vote,
        Some(metrics.clone()),
    );
    ledger.post_created(1, 1).await.unwrap();

    ledger.submit_vote(7, 1, VoteDirection::Up).await.unwrap();
    let _ = ledger.submit_vote(7, 1, VoteDirection::Up).await;

    assert_eq!(metrics.votes_total.with_label_values(&["accepted"]).get(), 1);
    assert_eq!(metrics.votes_total.with_label_values(&["repeated"]).get(), 1);
}

#[tokio::test]
async fn test_page_arithmetic_overflow_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);
    ledger.post_created(1, 1).await.unwrap();

    let result = ledger.post_ids_in_order(PostOrder::Time, i64::MAX / 2, 10).await;
    assert!(matches!(result, Err(ForumError::InvalidRequest(_))));

    let result = ledger.community_post_ids_in_order(1, PostOrder::Score, i64::MAX, 100).await;
    assert!(matches!(result, Err(ForumError::InvalidRequest(_))));

    let result = ledger.post_ids_in_order(PostOrder::Time, 1, 10_000).await;
    assert!(matches!(result, Err(ForumError::InvalidRequest(_))));
}

#[tokio::test(start_paused = true)]
async fn test_community_ordering() {
    let backend = Arc::new(MemoryBackend::new());
    let ledger = create_test_ledger(&backend);
    let now = Utc::now();
    for (offset, post_id, community_id) in [(3, 1_i64, 1_i64), (2, 2, 1), (1, 3, 2)] {
        ledger
            .register_post(post_id, community_id, now - ChronoDuration::hours(offset))
            .await
            .unwrap();
    }
    ledger.submit_vote(7, 1, VoteDirection::Down).await.unwrap();
    ledger.submit_vote(7, 2, VoteDirection::Up).await.unwrap();
    ledger.submit_vote(7, 3, VoteDirection::Up).await.unwrap();

    assert_eq!(
        ledger.community_post_ids_in_order(1, PostOrder::Score, 1, 10).await.unwrap(),
        vec![2, 1]
    );
    assert_eq!(
        ledger.community_post_ids_in_order(1, PostOrder::Time, 1, 10).await.unwrap(),
        vec![2, 1]
    );
    assert_eq!(
        ledger.community_post_ids_in_order(2, PostOrder::Score, 1, 10).await.unwrap(),
        vec![3]
    );
    assert!(ledger
        .community_post_ids_in_order(9, PostOrder::Time, 1, 10)
        .await
        .unwrap()
        .is_empty());

    // the derived ordering is reused until it expires
    ledger.submit_vote(8, 1, VoteDirection::Up).await.unwrap();
    ledger.submit_vote(9, 1, VoteDirection::Up).await.unwrap();
    ledger.submit_vote(10, 1, VoteDirection::Up).await.unwrap();
    assert_eq!(
        ledger.community_post_ids_in_order(1, PostOrder::Score, 1, 10).await.unwrap(),
        vec![2, 1]
    );

    tokio::time::sleep(std::time::Duration::from_secs(61)).await;
    assert_eq!(
        ledger.community_post_ids_in_order(1, PostOrder::Score, 1, 10).await.unwrap(),
        vec![1, 2]
    );
}
