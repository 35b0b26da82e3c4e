// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{
    histogram_opts, linear_buckets, register_histogram_with_registry,
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone, Debug)]
pub struct IndexerMetrics {
    /// Transfers currently PENDING, sampled by the matcher producer.
    pub pending_transfers: IntGauge,
    pub transfers_matched: IntCounter,
    pub transfers_failed: IntCounter,
    pub match_errors: IntCounter,
    pub match_timeouts: IntCounter,
    /// Search rounds per successful match; 0 means a cache hit.
    pub match_rounds: Histogram,
    /// 1 while the object-store fetcher is active.
    pub backfill_mode: IntGauge,

    pub transfers_indexed: IntCounter,
    pub indexer_batches: IntCounter,
    pub indexer_errors: IntCounterVec,
    pub active_indexer_workers: IntGauge,
    pub rate_limit_triggers: IntCounter,
}

impl IndexerMetrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        Arc::new(Self {
            pending_transfers: register_int_gauge_with_registry!(
                "pending_transfers",
                "Transfers awaiting correlation",
                registry,
            )
            .unwrap(),
            transfers_matched: register_int_counter_with_registry!(
                "transfers_matched_total",
                "Transfers correlated to an EVM transaction",
                registry,
            )
            .unwrap(),
            transfers_failed: register_int_counter_with_registry!(
                "transfers_failed_total",
                "Transfers marked failed after exhaustive search",
                registry,
            )
            .unwrap(),
            match_errors: register_int_counter_with_registry!(
                "match_errors_total",
                "Searches that errored and left the transfer pending",
                registry,
            )
            .unwrap(),
            match_timeouts: register_int_counter_with_registry!(
                "match_timeouts_total",
                "Searches cancelled by the per-transfer timeout",
                registry,
            )
            .unwrap(),
            match_rounds: register_histogram_with_registry!(
                histogram_opts!(
                    "match_rounds",
                    "Search rounds per successful match",
                    linear_buckets(0.0, 1.0, 21).unwrap(),
                ),
                registry,
            )
            .unwrap(),
            backfill_mode: register_int_gauge_with_registry!(
                "backfill_mode",
                "1 while the object-store fetcher is selected",
                registry,
            )
            .unwrap(),
            transfers_indexed: register_int_counter_with_registry!(
                "transfers_indexed_total",
                "New transfers discovered on the CORE ledger",
                registry,
            )
            .unwrap(),
            indexer_batches: register_int_counter_with_registry!(
                "indexer_batches_total",
                "Ledger update pages processed",
                registry,
            )
            .unwrap(),
            indexer_errors: register_int_counter_vec_with_registry!(
                "indexer_errors_total",
                "Indexer worker failures by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            active_indexer_workers: register_int_gauge_with_registry!(
                "active_indexer_workers",
                "Running per-address indexer workers",
                registry,
            )
            .unwrap(),
            rate_limit_triggers: register_int_counter_with_registry!(
                "rate_limit_triggers_total",
                "Rate-limit responses that pushed the shared backoff",
                registry,
            )
            .unwrap(),
        })
    }
}

async fn serve_metrics(State(registry): State<Registry>) -> String {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .unwrap_or_else(|e| {
            error!("Failed to encode metrics: {e}");
            String::new()
        })
}

/// Serve the Prometheus registry on `/metrics` until cancelled.
pub async fn start_metrics_server(
    address: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> anyhow::Result<JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(serve_metrics))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .context("Failed to bind metrics address")?;
    info!("Metrics server listening on {address}");

    Ok(tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Metrics server error: {e:?}");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new();
        let metrics = IndexerMetrics::new(&registry);
        metrics.transfers_matched.inc();
        metrics.pending_transfers.set(42);
        metrics.match_rounds.observe(3.0);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "transfers_matched_total"));
        assert!(families.iter().any(|f| f.get_name() == "pending_transfers"));
    }
}
