//! Pruning against checkpoints and milestones

use containers::{BlockNumber, Bytes32};
use fork_choice::*;
use pretty_assertions::assert_eq;

mod common;
use common::*;

#[test]
fn test_builder_never_holds_headers_at_or_below_latest_checkpoint() {
    let (factory, genesis, mut builder) = setup();
    let main = branch(&factory, &genesis.header, 30, 0);
    builder.connect_all(main.clone()).unwrap();

    // Forks hanging off the main chain at several heights.
    for (at, salt) in [(3usize, 1u8), (9, 2), (17, 3), (25, 4)] {
        builder
            .connect_all(branch(&factory, &main[at].header, 2, salt))
            .unwrap();
    }
    builder.evaluate_head();

    for end in [5usize, 12, 20, 28] {
        let boundary = FinalityBoundary {
            number: main[end].number(),
            hash: main[end].hash(),
        };
        let outcome = builder.prune(boundary).unwrap();
        assert!(outcome.rerooted);
        assert!(!outcome.reorg);
        assert_eq!(builder.root_hash(), main[end].hash());
        assert!(builder.headers().all(|h| h.number > main[end].number()));
        assert_eq!(builder.head(), main[29].hash());
    }
}

#[test]
fn test_milestone_on_competing_branch_reorgs() {
    let (factory, genesis, mut builder) = setup();
    let a = branch(&factory, &genesis.header, 6, 0);
    let b = branch(&factory, &a[1].header, 3, 1);
    builder.connect_all(a.clone()).unwrap();
    builder.connect_all(b.clone()).unwrap();
    assert_eq!(builder.evaluate_head(), a[5].hash());

    let outcome = builder
        .prune(FinalityBoundary {
            number: b[1].number(),
            hash: b[1].hash(),
        })
        .unwrap();

    assert!(outcome.rerooted);
    assert!(outcome.reorg);
    assert_eq!(outcome.removed, 7);
    assert_eq!(builder.root_hash(), b[1].hash());
    assert_eq!(builder.head(), b[2].hash());
    assert_eq!(builder.len(), 1);
}

#[test]
fn test_unknown_milestone_below_tip_discards_conflicting_heights() {
    let (factory, genesis, mut builder) = setup();
    let a = branch(&factory, &genesis.header, 6, 0);
    builder.connect_all(a.clone()).unwrap();
    builder.evaluate_head();

    let milestone_hash = Bytes32::repeat_byte(0x42);
    let outcome = builder
        .prune(FinalityBoundary {
            number: BlockNumber(4),
            hash: milestone_hash,
        })
        .unwrap();

    assert!(!outcome.rerooted);
    assert!(outcome.reorg);
    assert_eq!(outcome.removed, 3);
    assert_eq!(builder.head(), a[2].hash());
    assert_eq!(
        builder.pending_boundary(),
        Some(FinalityBoundary {
            number: BlockNumber(4),
            hash: milestone_hash,
        })
    );

    // A header at the boundary height must now match the milestone.
    let err = builder.connect(a[3].clone()).unwrap_err();
    assert!(matches!(err, ChainBuilderError::MilestoneMismatch { .. }));
}

#[test]
fn test_milestone_ahead_of_tip_is_kept_pending_until_reached() {
    let (factory, genesis, mut builder) = setup();
    let a = branch(&factory, &genesis.header, 6, 0);
    builder.connect_all(a[..3].to_vec()).unwrap();
    builder.evaluate_head();

    let boundary = FinalityBoundary {
        number: a[5].number(),
        hash: a[5].hash(),
    };
    let outcome = builder.prune(boundary).unwrap();
    assert_eq!(outcome, PruneOutcome::default());
    assert_eq!(builder.pending_boundary(), Some(boundary));

    builder.connect_all(a[3..].to_vec()).unwrap();
    let outcome = builder.prune(boundary).unwrap();
    assert!(outcome.rerooted);
    assert!(!outcome.reorg);
    assert_eq!(builder.pending_boundary(), None);
    assert!(builder.is_empty());
    assert_eq!(builder.head(), a[5].hash());
}

#[test]
fn test_stale_and_conflicting_boundaries() {
    let (factory, genesis, _) = setup();
    let a = branch(&factory, &genesis.header, 4, 0);
    let mut builder = CanonicalChainBuilder::new(a[1].header.clone());
    builder.connect_all(a[2..].to_vec()).unwrap();

    let stale = builder
        .prune(FinalityBoundary {
            number: a[0].number(),
            hash: Bytes32::repeat_byte(1),
        })
        .unwrap();
    assert_eq!(stale, PruneOutcome::default());
    assert_eq!(builder.len(), 2);

    let same = builder
        .prune(FinalityBoundary {
            number: a[1].number(),
            hash: a[1].hash(),
        })
        .unwrap();
    assert_eq!(same, PruneOutcome::default());

    let err = builder
        .prune(FinalityBoundary {
            number: a[1].number(),
            hash: Bytes32::repeat_byte(1),
        })
        .unwrap_err();
    assert!(matches!(err, ChainBuilderError::FinalityConflict { .. }));
}
