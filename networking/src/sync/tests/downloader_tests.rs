use super::mocks::{checkpoint, milestone, test_config, Behavior, Harness};
use crate::sync::{AttemptError, DownloadError, DownloadTarget, VerificationError};
use crate::types::PenaltyReason;
use containers::{BlockNumber, Bytes32};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_download_batch_from_honest_peer() {
    let harness = Harness::new();
    let chain = harness.chain(10, 1);
    harness.transport.add_peer(Behavior::Honest, &chain);
    let downloader = harness.downloader(test_config());

    let blocks = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(10)))
        .await
        .unwrap();

    assert_eq!(blocks, chain);
    assert!(harness.transport.penalties().is_empty());
}

#[tokio::test]
async fn test_batch_respects_block_limit() {
    let harness = Harness::new();
    let chain = harness.chain(10, 1);
    harness.transport.add_peer(Behavior::Honest, &chain);
    let mut config = test_config();
    config.block_limit = 4;
    let downloader = harness.downloader(config);

    let blocks = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(10)))
        .await
        .unwrap();

    assert_eq!(blocks, chain[..4].to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_exhausts_all_peers() {
    let harness = Harness::new();
    let chain = harness.chain(10, 1);
    for _ in 0..3 {
        harness.transport.add_peer(Behavior::Malformed, &chain);
    }
    let downloader = harness.downloader(test_config());

    let err = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(10)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DownloadError::Exhausted {
            attempts: 3,
            last: AttemptError::Malformed(_)
        }
    ));

    let penalties = harness.transport.penalties();
    assert_eq!(penalties.len(), 3);
    assert!(penalties.iter().all(|(_, reason)| *reason == PenaltyReason::Malformed));
    let distinct: HashSet<_> = penalties.iter().map(|(peer, _)| *peer).collect();
    assert_eq!(distinct.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_rotates_to_next_peer_after_failure() {
    let harness = Harness::new();
    let chain = harness.chain(6, 1);
    let unreachable = harness.transport.add_peer(Behavior::Unreachable, &chain);
    let honest = harness.transport.add_peer(Behavior::Honest, &chain);
    let downloader = harness.downloader(test_config());

    let blocks = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(6)))
        .await
        .unwrap();

    assert_eq!(blocks.len(), 6);
    assert_eq!(harness.transport.penalties(), vec![(unreachable, PenaltyReason::Transport)]);

    let peers = downloader.peer_manager();
    assert_eq!(peers.get_peer(&unreachable).unwrap().failures, 1);
    assert_eq!(peers.get_peer(&honest).unwrap().failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_peer_times_out() {
    let harness = Harness::new();
    let chain = harness.chain(4, 1);
    harness.transport.add_peer(Behavior::Stalled, &chain);
    harness.transport.add_peer(Behavior::Honest, &chain);
    let downloader = harness.downloader(test_config());

    let blocks = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(4)))
        .await
        .unwrap();

    assert_eq!(blocks, chain);
    let reasons: Vec<_> = harness.transport.penalties().into_iter().map(|(_, reason)| reason).collect();
    assert_eq!(reasons, vec![PenaltyReason::Timeout]);
}

#[tokio::test]
async fn test_no_peers() {
    let harness = Harness::new();
    let downloader = harness.downloader(test_config());

    let err = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(4)))
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::NoPeers));
}

#[tokio::test]
async fn test_empty_range() {
    let harness = Harness::new();
    let downloader = harness.downloader(test_config());

    let err = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(5), DownloadTarget::Number(BlockNumber(4)))
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::EmptyRange { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_download() {
    let harness = Harness::new();
    let chain = harness.chain(4, 1);
    harness.transport.add_peer(Behavior::Stalled, &chain);
    let downloader = harness.downloader(test_config());
    let token = CancellationToken::new();
    token.cancel();

    let err = downloader
        .download_blocks(&token, BlockNumber(1), DownloadTarget::Number(BlockNumber(4)))
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::Cancelled));
    assert!(harness.transport.penalties().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rejects_batch_contradicting_checkpoint() {
    let harness = Harness::new();
    let canonical = harness.chain(8, 1);
    let fork = harness.chain(8, 2);
    harness.oracle.add_checkpoint(checkpoint(1, &canonical));
    harness.transport.add_peer(Behavior::Honest, &fork);
    let downloader = harness.downloader(test_config());

    let err = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(8)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DownloadError::Exhausted {
            last: AttemptError::Verification(VerificationError::CheckpointRoot { id: 1, .. }),
            ..
        }
    ));
    assert!(harness
        .transport
        .penalties()
        .iter()
        .all(|(_, reason)| *reason == PenaltyReason::CheckpointMismatch));
}

#[tokio::test]
async fn test_checkpoint_batch_uses_committed_prefix() {
    let harness = Harness::new();
    let chain = harness.chain(8, 1);
    harness.oracle.add_checkpoint(checkpoint(1, &chain));
    harness.store.commit(chain[..4].to_vec(), None).await.unwrap();
    let peer = harness.transport.add_peer(Behavior::Honest, &chain);
    let downloader = harness.downloader(test_config());

    let blocks = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(5), DownloadTarget::Number(BlockNumber(8)))
        .await
        .unwrap();

    assert_eq!(blocks, chain[4..].to_vec());
    assert_eq!(
        harness.transport.header_requests(),
        vec![(peer, BlockNumber(5), BlockNumber(8))]
    );
}

#[tokio::test]
async fn test_checkpoint_fetched_whole_without_committed_prefix() {
    let harness = Harness::new();
    let chain = harness.chain(8, 1);
    harness.oracle.add_checkpoint(checkpoint(1, &chain));
    let peer = harness.transport.add_peer(Behavior::Honest, &chain);
    let downloader = harness.downloader(test_config());

    let blocks = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(5), DownloadTarget::Number(BlockNumber(6)))
        .await
        .unwrap();

    // Verified as one checkpoint, returned from the requested block on.
    assert_eq!(blocks, chain[4..].to_vec());
    assert_eq!(
        harness.transport.header_requests(),
        vec![(peer, BlockNumber(1), BlockNumber(8))]
    );
}

#[tokio::test]
async fn test_checkpoint_batch_is_not_split_by_block_limit() {
    let harness = Harness::new();
    let chain = harness.chain(12, 1);
    harness.oracle.add_checkpoint(checkpoint(1, &chain[..8]));
    let peer = harness.transport.add_peer(Behavior::Honest, &chain);
    let mut config = test_config();
    config.block_limit = 4;
    let downloader = harness.downloader(config);

    let blocks = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(12)))
        .await
        .unwrap();

    // The root only verifies over the whole range, so the checkpoint is one batch.
    assert_eq!(blocks, chain[..8].to_vec());
    assert_eq!(
        harness.transport.header_requests(),
        vec![(peer, BlockNumber(1), BlockNumber(8))]
    );
}

#[tokio::test]
async fn test_batch_stops_at_next_checkpoint() {
    let harness = Harness::new();
    let chain = harness.chain(12, 1);
    harness.oracle.add_checkpoint(checkpoint(1, &chain[5..10]));
    harness.transport.add_peer(Behavior::Honest, &chain);
    let downloader = harness.downloader(test_config());

    let blocks = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(8)))
        .await
        .unwrap();

    // Blocks 6..=10 are left for a batch verified against the checkpoint.
    assert_eq!(blocks, chain[..5].to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_rejects_batch_contradicting_milestone() {
    let harness = Harness::new();
    let canonical = harness.chain(6, 1);
    let fork = harness.chain(6, 2);
    harness.oracle.set_milestone(milestone(1, &canonical[2..]));
    harness.transport.add_peer(Behavior::Honest, &fork);
    let downloader = harness.downloader(test_config());

    let err = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(6)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DownloadError::Exhausted {
            last: AttemptError::Verification(VerificationError::MilestoneHash { id: 1, .. }),
            ..
        }
    ));
}

#[tokio::test]
async fn test_hash_target_truncates_batch() {
    let harness = Harness::new();
    let chain = harness.chain(10, 1);
    harness.transport.add_peer(Behavior::Honest, &chain);
    let mut config = test_config();
    config.block_limit = 64;
    let downloader = harness.downloader(config);
    let target = DownloadTarget::Hash {
        hash: chain[5].hash(),
        number: BlockNumber(6),
    };

    let blocks = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(3), target)
        .await
        .unwrap();

    assert_eq!(blocks, chain[2..6].to_vec());
}

#[tokio::test(start_paused = true)]
async fn test_hash_target_mismatch() {
    let harness = Harness::new();
    let chain = harness.chain(6, 1);
    harness.transport.add_peer(Behavior::Honest, &chain);
    let downloader = harness.downloader(test_config());
    let target = DownloadTarget::Hash {
        hash: Bytes32::repeat_byte(0xee),
        number: BlockNumber(6),
    };

    let err = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), target)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DownloadError::Exhausted {
            last: AttemptError::TargetMismatch { .. },
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_seal_is_remembered() {
    let harness = Harness::new();
    let mut chain = harness.chain(5, 1);
    chain[2].header.seal = Bytes32::repeat_byte(0x99);
    let forged = chain[2].hash();
    harness.transport.add_peer(Behavior::Honest, &chain);
    let downloader = harness.downloader(test_config());

    let err = downloader
        .download_blocks(&CancellationToken::new(), BlockNumber(1), DownloadTarget::Number(BlockNumber(5)))
        .await
        .unwrap_err();

    assert!(downloader.is_bad_block(&forged));
    // Later attempts reject the header before fetching bodies.
    assert!(matches!(
        err,
        DownloadError::Exhausted {
            attempts: 3,
            last: AttemptError::KnownBad(hash),
        } if hash == forged
    ));
    assert!(harness
        .transport
        .penalties()
        .iter()
        .all(|(_, reason)| *reason == PenaltyReason::InvalidBlock));
}
