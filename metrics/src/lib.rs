pub mod server;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    peers: IntGauge,
    peer_penalties: IntCounterVec,
    // Sync
    sync_state: IntGauge,
    head_number: IntGauge,
    finalized_number: IntGauge,
    committed_blocks: IntCounter,
    download_failures: IntCounterVec,
    download_duration: HistogramVec,
    reorgs: IntCounter,
    reorg_depth: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let peers = IntGauge::with_opts(Opts::new("pos_sync_peers", "Number of peers known to the transport"))?;
        registry.register(Box::new(peers.clone()))?;

        let peer_penalties = IntCounterVec::new(
            Opts::new("pos_sync_peer_penalties_total", "Total number of peer penalties"),
            &["reason"],
        )?;
        registry.register(Box::new(peer_penalties.clone()))?;

        let sync_state = IntGauge::with_opts(Opts::new("pos_sync_state", "Current sync state code"))?;
        registry.register(Box::new(sync_state.clone()))?;

        let head_number = IntGauge::with_opts(Opts::new("pos_sync_head_number", "Committed canonical head number"))?;
        registry.register(Box::new(head_number.clone()))?;

        let finalized_number = IntGauge::with_opts(Opts::new(
            "pos_sync_finalized_number",
            "Number of the latest finality boundary",
        ))?;
        registry.register(Box::new(finalized_number.clone()))?;

        let committed_blocks = IntCounter::with_opts(Opts::new(
            "pos_sync_committed_blocks_total",
            "Total number of blocks inserted into the execution engine",
        ))?;
        registry.register(Box::new(committed_blocks.clone()))?;

        let download_failures = IntCounterVec::new(
            Opts::new("pos_sync_download_failures_total", "Total number of failed download attempts"),
            &["kind"],
        )?;
        registry.register(Box::new(download_failures.clone()))?;

        let download_duration = HistogramVec::new(
            HistogramOpts::new("pos_sync_download_duration_seconds", "Time taken to download a verified batch")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &[],
        )?;
        registry.register(Box::new(download_duration.clone()))?;

        let reorgs = IntCounter::with_opts(Opts::new("pos_sync_reorgs_total", "Total number of canonical reorgs"))?;
        registry.register(Box::new(reorgs.clone()))?;

        let reorg_depth = HistogramVec::new(
            HistogramOpts::new("pos_sync_reorg_depth", "Depth of canonical reorgs (in blocks)")
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 7.0, 10.0, 20.0, 30.0, 50.0, 100.0]),
            &[],
        )?;
        registry.register(Box::new(reorg_depth.clone()))?;

        Ok(Self {
            registry,
            peers,
            peer_penalties,
            sync_state,
            head_number,
            finalized_number,
            committed_blocks,
            download_failures,
            download_duration,
            reorgs,
            reorg_depth,
        })
    }

    pub fn gather(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    // Network
    pub fn set_peers(&self, v: i64) {
        self.peers.set(v);
    }

    pub fn inc_peer_penalty(&self, reason: &str) {
        self.peer_penalties.with_label_values(&[reason]).inc();
    }

    // Sync
    pub fn set_sync_state(&self, code: i64) {
        self.sync_state.set(code);
    }

    pub fn set_head_number(&self, v: u64) {
        self.head_number.set(v as i64);
    }

    pub fn set_finalized_number(&self, v: u64) {
        self.finalized_number.set(v as i64);
    }

    pub fn inc_committed_blocks(&self, count: u64) {
        self.committed_blocks.inc_by(count);
    }

    pub fn inc_download_failure(&self, kind: &str) {
        self.download_failures.with_label_values(&[kind]).inc();
    }

    pub fn observe_download_duration(&self, duration: f64) {
        self.download_duration.with_label_values::<&str>(&[]).observe(duration);
    }

    pub fn inc_reorgs(&self) {
        self.reorgs.inc();
    }

    pub fn observe_reorg_depth(&self, depth: f64) {
        self.reorg_depth.with_label_values::<&str>(&[]).observe(depth);
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exposes_sync_series() {
        let metrics = Metrics::new().unwrap();
        metrics.set_head_number(42);
        metrics.inc_peer_penalty("malformed");
        metrics.inc_committed_blocks(3);

        let text = metrics.gather().unwrap();
        assert!(text.contains("pos_sync_head_number 42"));
        assert!(text.contains("pos_sync_peer_penalties_total{reason=\"malformed\"} 1"));
        assert!(text.contains("pos_sync_committed_blocks_total 3"));
    }
}
