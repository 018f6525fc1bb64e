use super::mocks::{headers, Harness};
use crate::sync::StoreError;
use containers::BlockNumber;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn numbers(range: std::ops::RangeInclusive<u64>) -> Vec<BlockNumber> {
    range.map(BlockNumber).collect()
}

#[tokio::test]
async fn test_commit_moves_canonical_head() {
    let harness = Harness::new();
    let chain = harness.chain(5, 1);

    let receipt = harness.store.commit(chain.clone(), None).await.unwrap();

    assert_eq!(receipt.head, chain[4].header);
    assert_eq!(receipt.inserted, 5);
    assert_eq!(receipt.unwound_to, None);
    assert_eq!(harness.store.canonical_head().await.unwrap(), chain[4].header);
    assert_eq!(harness.engine.inserted_count(), 5);
    assert_eq!(harness.bridge.processed(), numbers(1..=5));
}

#[tokio::test]
async fn test_commit_is_idempotent() {
    let harness = Harness::new();
    let chain = harness.chain(5, 1);

    harness.store.commit(chain.clone(), None).await.unwrap();
    let receipt = harness.store.commit(chain.clone(), None).await.unwrap();

    assert_eq!(receipt.inserted, 0);
    assert_eq!(receipt.head, chain[4].header);
    assert_eq!(harness.engine.inserted_count(), 5);
    assert_eq!(harness.bridge.processed(), numbers(1..=5));
}

#[tokio::test]
async fn test_commit_skips_canonical_prefix() {
    let harness = Harness::new();
    let chain = harness.chain(8, 1);
    harness.store.commit(chain[..5].to_vec(), None).await.unwrap();

    let receipt = harness.store.commit(chain.clone(), None).await.unwrap();

    assert_eq!(receipt.inserted, 3);
    assert_eq!(receipt.head, chain[7].header);
    assert_eq!(harness.bridge.processed(), numbers(1..=8));
}

#[tokio::test]
async fn test_rejects_gap() {
    let harness = Harness::new();
    let chain = harness.chain(5, 1);

    let err = harness.store.commit(chain[2..].to_vec(), None).await.unwrap_err();

    assert!(matches!(
        err,
        StoreError::Gap {
            start: BlockNumber(3),
            head: BlockNumber(0)
        }
    ));
    assert!(err.is_consistency());
    assert!(harness.bridge.processed().is_empty());
}

#[tokio::test]
async fn test_rejects_unlinked_segment() {
    let harness = Harness::new();
    let chain = harness.chain(3, 1);

    let err = harness
        .store
        .commit(vec![chain[0].clone(), chain[2].clone()], None)
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::NotContiguous { number: BlockNumber(3) }));
}

#[tokio::test]
async fn test_rejects_segment_off_canonical_chain() {
    let harness = Harness::new();
    let chain = harness.chain(5, 1);
    let fork = harness.chain(5, 2);
    harness.store.commit(chain, None).await.unwrap();

    let err = harness.store.commit(fork[1..3].to_vec(), None).await.unwrap_err();

    assert!(matches!(err, StoreError::ParentNotCanonical { number: BlockNumber(2), .. }));
}

#[tokio::test]
async fn test_reorg_unwinds_bridge() {
    let harness = Harness::new();
    let chain = harness.chain(5, 1);
    harness.store.commit(chain.clone(), None).await.unwrap();
    let fork = harness.factory.extend(&chain[1].header, 4, 2);

    let receipt = harness.store.commit(fork.clone(), None).await.unwrap();

    assert_eq!(receipt.unwound_to, Some(BlockNumber(2)));
    assert_eq!(receipt.head, fork[3].header);
    assert_eq!(harness.bridge.unwinds(), vec![BlockNumber(2)]);
    assert_eq!(harness.bridge.processed(), numbers(1..=6));

    let mut expected = headers(&chain[..2]);
    expected.extend(headers(&fork));
    let canonical = harness
        .store
        .canonical_headers(BlockNumber(1), BlockNumber(6))
        .await
        .unwrap();
    assert_eq!(canonical, expected);
}

#[tokio::test]
async fn test_reorg_cannot_replace_finalized_block() {
    let harness = Harness::new();
    let chain = harness.chain(5, 1);
    harness
        .store
        .commit(chain.clone(), Some(chain[3].hash()))
        .await
        .unwrap();
    assert_eq!(harness.engine.finalized(), Some(chain[3].hash()));
    assert_eq!(harness.store.finalized(), Some(chain[3].header.clone()));

    let fork = harness.factory.extend(&chain[1].header, 4, 2);
    let err = harness.store.commit(fork, None).await.unwrap_err();

    assert!(matches!(
        err,
        StoreError::BelowFinalized {
            number: BlockNumber(3),
            finalized: BlockNumber(4)
        }
    ));
    assert!(harness.bridge.unwinds().is_empty());
    assert_eq!(harness.store.canonical_head().await.unwrap(), chain[4].header);
}

#[tokio::test]
async fn test_empty_commit_advances_finalized() {
    let harness = Harness::new();
    let chain = harness.chain(5, 1);
    harness
        .store
        .commit(chain.clone(), Some(chain[1].hash()))
        .await
        .unwrap();

    let receipt = harness.store.commit(Vec::new(), Some(chain[3].hash())).await.unwrap();

    assert_eq!(receipt.inserted, 0);
    assert_eq!(receipt.head, chain[4].header);
    assert_eq!(harness.engine.finalized(), Some(chain[3].hash()));
    assert_eq!(harness.store.finalized(), Some(chain[3].header.clone()));
    assert_eq!(harness.store.canonical_head().await.unwrap(), chain[4].header);
}

#[tokio::test]
async fn test_rejects_finalizing_unknown_block() {
    let harness = Harness::new();
    let chain = harness.chain(5, 1);
    harness.store.commit(chain.clone(), None).await.unwrap();
    let fork = harness.factory.extend(&chain[1].header, 2, 2);

    let err = harness.store.commit(Vec::new(), Some(fork[1].hash())).await.unwrap_err();

    assert!(matches!(err, StoreError::FinalizedNotCanonical { .. }));
    assert!(err.is_consistency());
    assert_eq!(harness.store.finalized(), None);
}

#[tokio::test]
async fn test_run_only_once() {
    let harness = Harness::new();
    // A completed commit proves the write loop owns the queue.
    harness.store.commit(harness.chain(1, 1), None).await.unwrap();

    let result = harness.store.run(CancellationToken::new()).await;

    assert!(result.is_err());
}
