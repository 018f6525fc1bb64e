use super::mocks::{checkpoint, factory, test_config, Behavior, MockOracle, MockTransport, RecordingBridge};
use crate::sync::{ConsensusVerifier, InMemoryExecutionEngine, StoreError, SyncNode, TaskError};
use anyhow::anyhow;
use containers::generator::BlockFactory;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Parts {
    factory: BlockFactory,
    transport: Arc<MockTransport>,
    oracle: Arc<MockOracle>,
    bridge: Arc<RecordingBridge>,
    engine: Arc<InMemoryExecutionEngine>,
}

fn parts() -> Parts {
    let factory = factory();
    let oracle = Arc::new(MockOracle::new(factory.validators().clone()));
    let engine = Arc::new(InMemoryExecutionEngine::new(factory.genesis()));
    Parts {
        factory,
        transport: Arc::new(MockTransport::default()),
        oracle,
        bridge: Arc::new(RecordingBridge::default()),
        engine,
    }
}

fn node(parts: &Parts) -> SyncNode {
    SyncNode::new(
        test_config(),
        parts.transport.clone(),
        parts.oracle.clone(),
        parts.bridge.clone(),
        parts.engine.clone(),
        Arc::new(ConsensusVerifier),
        None,
    )
}

#[tokio::test]
async fn test_first_failure_stops_every_task() {
    let parts = parts();
    parts.oracle.fail_after(Duration::from_millis(50), "oracle connection lost");

    let node = node(&parts);
    let store = node.store();
    let started = Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(5), node.run(CancellationToken::new()))
        .await
        .unwrap()
        .unwrap_err();

    assert_eq!(err.task, "oracle");
    assert_eq!(err.to_string(), "pos sync oracle failed");
    assert_eq!(err.source.to_string(), "oracle connection lost");
    // Every task returned on cancellation instead of being aborted.
    assert!(started.elapsed() < Duration::from_millis(50) + test_config().shutdown_timeout());
    assert!(parts.transport.stopped());
    assert!(parts.bridge.stopped());
    // The store loop, tip events and orchestrator released their handles.
    assert_eq!(Arc::strong_count(&store), 1);
    assert!(matches!(store.commit(Vec::new(), None).await, Err(StoreError::Closed)));
}

#[test]
fn test_task_error_names_the_task() {
    let p2p = TaskError {
        task: "p2p",
        source: anyhow!("listener closed"),
    };
    let sync = TaskError {
        task: "sync",
        source: anyhow!("giving up"),
    };

    assert_eq!(p2p.to_string(), "pos sync p2p failed");
    assert_eq!(sync.to_string(), "pos sync failed");
}

#[tokio::test]
async fn test_shutdown_is_clean() {
    let parts = parts();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node(&parts).run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert!(parts.transport.stopped());
    assert!(parts.oracle.stopped());
    assert!(parts.bridge.stopped());
}

#[tokio::test]
async fn test_node_syncs_to_checkpoint() {
    let parts = parts();
    let chain = parts.factory.extend(&parts.factory.genesis().header, 8, 1);
    parts.transport.add_peer(Behavior::Honest, &chain);
    parts.oracle.add_checkpoint(checkpoint(1, &chain));

    let node = node(&parts);
    let store = node.store();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(shutdown.clone()));

    let synced = tokio::time::timeout(Duration::from_secs(5), async {
        while store.canonical_head().await.unwrap() != chain[7].header {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    shutdown.cancel();

    assert!(synced.is_ok());
    assert!(handle.await.unwrap().is_ok());
    assert_eq!(parts.bridge.processed().len(), 8);
    assert_eq!(parts.engine.finalized(), Some(chain[7].hash()));
}
