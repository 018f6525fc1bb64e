//! Sync service group.
//!
//! Runs the transport, store, tip events, finality oracle, bridge relay and
//! sync orchestrator as one unit. The first component to fail cancels the
//! others, and its error becomes the result of the group.

use anyhow::anyhow;
use futures::FutureExt;
use metrics::SharedMetrics;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transport::PeerTransport;

use super::{
    bridge::BridgeRelay,
    config::SyncConfig,
    downloader::BlockDownloader,
    execution::{ExecutionClient, ExecutionEngine},
    oracle::FinalityOracle,
    service::SyncService,
    store::Store,
    tip_events::TipEvents,
    verification::ChainVerifier,
};

type TaskResult = (&'static str, anyhow::Result<()>);

const SYNC_TASK: &str = "sync";

#[derive(Debug, thiserror::Error)]
#[error("{}", failure_message(.task))]
pub struct TaskError {
    pub task: &'static str,
    #[source]
    pub source: anyhow::Error,
}

fn failure_message(task: &str) -> String {
    if task == SYNC_TASK {
        "pos sync failed".to_string()
    } else {
        format!("pos sync {task} failed")
    }
}

pub struct SyncNode {
    config: SyncConfig,
    transport: Arc<dyn PeerTransport>,
    oracle: Arc<dyn FinalityOracle>,
    bridge: Arc<dyn BridgeRelay>,
    store: Arc<Store>,
    tip_events: Arc<TipEvents>,
    sync: SyncService,
}

impl SyncNode {
    pub fn new(
        config: SyncConfig,
        transport: Arc<dyn PeerTransport>,
        oracle: Arc<dyn FinalityOracle>,
        bridge: Arc<dyn BridgeRelay>,
        engine: Arc<dyn ExecutionEngine>,
        verifier: Arc<dyn ChainVerifier>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let store = Arc::new(Store::new(
            ExecutionClient::new(engine),
            bridge.clone(),
            metrics.clone(),
        ));
        let tip_events = Arc::new(TipEvents::new(
            transport.clone(),
            oracle.clone(),
            config.gossip_queue_capacity,
        ));
        let downloader = Arc::new(BlockDownloader::new(
            config.clone(),
            transport.clone(),
            oracle.clone(),
            verifier.clone(),
            store.clone(),
            metrics.clone(),
        ));
        let sync = SyncService::new(
            config.clone(),
            oracle.clone(),
            verifier,
            downloader,
            store.clone(),
            tip_events.clone(),
            metrics,
        );

        Self {
            config,
            transport,
            oracle,
            bridge,
            store,
            tip_events,
            sync,
        }
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Run every component until `shutdown` is cancelled or one of them fails.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TaskError> {
        let SyncNode {
            config,
            transport,
            oracle,
            bridge,
            store,
            tip_events,
            mut sync,
        } = self;

        let token = shutdown.child_token();
        let mut tasks = JoinSet::new();

        spawn_task(&mut tasks, "p2p", {
            let token = token.clone();
            async move { transport.run(token).await }
        });
        spawn_task(&mut tasks, "store", {
            let token = token.clone();
            async move { store.run(token).await }
        });
        spawn_task(&mut tasks, "events", {
            let token = token.clone();
            async move { tip_events.run(token).await }
        });
        spawn_task(&mut tasks, "oracle", {
            let token = token.clone();
            async move { oracle.run(token).await }
        });
        spawn_task(&mut tasks, "bridge", {
            let token = token.clone();
            async move { bridge.run(token).await }
        });
        spawn_task(&mut tasks, SYNC_TASK, {
            let token = token.clone();
            async move { sync.run(token).await.map_err(anyhow::Error::from) }
        });
        info!(tasks = tasks.len(), "Sync node started");

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let (task, result) = match joined {
                Ok(pair) => pair,
                Err(err) => ("unknown", Err(anyhow!(err))),
            };
            match result {
                Ok(()) => debug!(task, "Task finished"),
                Err(source) => {
                    error!(task, error = format!("{source:#}"), "Task failed, stopping sync node");
                    failure = Some(TaskError { task, source });
                    break;
                }
            }
        }

        token.cancel();
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((task, Err(err))) = joined {
                    debug!(task, error = %err, "Task failed during shutdown");
                }
            }
        };
        if tokio::time::timeout(config.shutdown_timeout(), drain).await.is_err() {
            warn!(remaining = tasks.len(), "Tasks did not stop in time, aborting");
            tasks.abort_all();
        }

        match failure {
            Some(err) => Err(err),
            None => {
                info!("Sync node stopped");
                Ok(())
            }
        }
    }
}

fn spawn_task<F>(tasks: &mut JoinSet<TaskResult>, name: &'static str, task: F)
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    tasks.spawn(async move {
        let result = match AssertUnwindSafe(task).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("task panicked")),
        };
        (name, result)
    });
}
