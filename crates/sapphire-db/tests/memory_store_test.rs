//! Integration tests for lifecycle transitions over the in-memory store.
//!
//! This test suite validates:
//! - Concurrent claims of one image: exactly one caller wins
//! - Retried events are idempotent
//! - Missing edges leave the stored status unchanged
//! - Full happy path from registration to annotated

use std::sync::Arc;

use futures::future::join_all;
use sapphire_db::{
    Error, ImageEvent, ImageLifecycle, ImageRepository, ImageStatus, MemoryImageRepository,
    TransitionOutcome,
};
use uuid::Uuid;

fn setup() -> (Arc<MemoryImageRepository>, ImageLifecycle) {
    let repo = Arc::new(MemoryImageRepository::new());
    let lifecycle = ImageLifecycle::new(repo.clone());
    (repo, lifecycle)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_apply_exactly_once() {
    let (repo, lifecycle) = setup();
    let image = lifecycle
        .register(Uuid::new_v4(), "s3://bucket/race.jpg")
        .await
        .unwrap();

    let image_id = image.id;

    let tasks = (0..16).map(|_| {
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move { lifecycle.transition(image_id, ImageEvent::Claim).await })
    });
    let results = join_all(tasks).await;

    let mut applied = 0;
    for result in results {
        match result.expect("task panicked") {
            Ok(TransitionOutcome::Applied { from, to }) => {
                assert_eq!(from, ImageStatus::Unembedded);
                assert_eq!(to, ImageStatus::Embedding);
                applied += 1;
            }
            Ok(TransitionOutcome::AlreadyInState(status)) => {
                assert_eq!(status, ImageStatus::Embedding)
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(applied, 1);
    let stored = repo.get(image.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ImageStatus::Embedding);
}

#[tokio::test]
async fn test_retry_after_success_is_already_in_state() {
    let (_repo, lifecycle) = setup();
    let image = lifecycle.register(Uuid::new_v4(), "a.jpg").await.unwrap();

    lifecycle.transition(image.id, ImageEvent::Claim).await.unwrap();
    let first = lifecycle
        .transition(image.id, ImageEvent::EmbeddingSucceeded)
        .await
        .unwrap();
    let second = lifecycle
        .transition(image.id, ImageEvent::EmbeddingSucceeded)
        .await
        .unwrap();

    assert!(first.is_applied());
    assert_eq!(second, TransitionOutcome::AlreadyInState(ImageStatus::Ready));
}

#[tokio::test]
async fn test_invalid_transition_leaves_status_unchanged() {
    let (repo, lifecycle) = setup();
    let image = lifecycle.register(Uuid::new_v4(), "a.jpg").await.unwrap();

    let err = lifecycle
        .transition(image.id, ImageEvent::ConsensusAccepted)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::InvalidTransition {
            from: ImageStatus::Unembedded,
            event: ImageEvent::ConsensusAccepted,
            ..
        }
    ));
    let stored = repo.get(image.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ImageStatus::Unembedded);
}

#[tokio::test]
async fn test_full_path_to_annotated() {
    let (repo, lifecycle) = setup();
    let image = lifecycle.register(Uuid::new_v4(), "a.jpg").await.unwrap();

    for event in [
        ImageEvent::Claim,
        ImageEvent::EmbeddingSucceeded,
        ImageEvent::ConsensusRejected,
        ImageEvent::ConsensusRejected,
        ImageEvent::ConsensusAccepted,
    ] {
        lifecycle.transition(image.id, event).await.unwrap();
    }

    let stored = repo.get(image.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ImageStatus::Annotated);
    assert!(stored.status.is_terminal());
}

#[tokio::test]
async fn test_failed_embedding_returns_to_queue() {
    let (repo, lifecycle) = setup();
    let image = lifecycle.register(Uuid::new_v4(), "a.jpg").await.unwrap();

    lifecycle.transition(image.id, ImageEvent::Claim).await.unwrap();
    let outcome = lifecycle
        .transition(image.id, ImageEvent::EmbeddingFailed)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        TransitionOutcome::Applied {
            from: ImageStatus::Embedding,
            to: ImageStatus::Unembedded
        }
    );
    let again = lifecycle.transition(image.id, ImageEvent::Claim).await.unwrap();
    assert!(again.is_applied());
    assert_eq!(
        repo.get(image.id).await.unwrap().unwrap().status,
        ImageStatus::Embedding
    );
}
