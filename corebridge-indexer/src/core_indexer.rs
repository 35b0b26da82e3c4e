// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The indexer fleet: one worker per watched address.
//!
//! A controller reconciles running workers against the durable watched set.
//! Each worker polls the CORE ledger from its cursor, filters spot transfers
//! headed to a system address, and batch-inserts them PENDING. Progress is
//! measured by inserted rows, not received entries: the upstream API is
//! inclusive-start and happily redelivers the boundary entry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use corebridge_schema::models::NewTransfer;

use crate::assets::is_system_address;
use crate::backoff::SharedBackoff;
use crate::core_client::{CoreClient, LedgerDelta, LedgerEntry};
use crate::error::FetchError;
use crate::metrics::IndexerMetrics;
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct CoreIndexerConfig {
    /// Sleep between polls once an address is caught up.
    pub poll_interval: Duration,
    /// How often the controller reconciles workers with the watched set.
    pub reconcile_interval: Duration,
    /// First retry delay for non-rate-limit failures.
    pub retry_base: Duration,
    pub max_attempts: u32,
}

impl Default for CoreIndexerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

/// Filter a ledger page down to insertable transfers, plus the page's
/// maximum timestamp (the cursor candidate).
pub(crate) fn extract_transfers(
    watched_address: &str,
    entries: &[LedgerEntry],
) -> (Vec<NewTransfer>, Option<i64>) {
    let max_time = entries.iter().map(|e| e.time).max();
    let transfers = entries
        .iter()
        .filter_map(|entry| match &entry.delta {
            LedgerDelta::SpotTransfer {
                token,
                amount,
                user,
                destination,
                usdc_value,
                fee,
                native_token_fee,
            } if is_system_address(destination) => Some(NewTransfer {
                core_hash: entry.hash.clone(),
                core_time: entry.time,
                token: token.clone(),
                amount: amount.clone(),
                recipient: user.to_ascii_lowercase(),
                system_address: destination.to_ascii_lowercase(),
                watched_sender: watched_address.to_string(),
                usdc_value: usdc_value.clone(),
                fee: fee.clone(),
                native_token_fee: native_token_fee.clone(),
            }),
            _ => None,
        })
        .collect();
    (transfers, max_time)
}

/// Start the controller task. Workers are spawned and cancelled as the
/// watched set changes; cancelling the returned task's token stops the whole
/// fleet.
pub fn start_indexer_fleet(
    storage: Storage,
    client: Arc<CoreClient>,
    backoff: Arc<SharedBackoff>,
    metrics: Arc<IndexerMetrics>,
    config: CoreIndexerConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_controller(storage, client, backoff, metrics, config, cancel).await;
    })
}

async fn run_controller(
    storage: Storage,
    client: Arc<CoreClient>,
    backoff: Arc<SharedBackoff>,
    metrics: Arc<IndexerMetrics>,
    config: CoreIndexerConfig,
    cancel: CancellationToken,
) {
    info!("[INDEXER] Controller started");
    let mut workers: HashMap<String, CancellationToken> = HashMap::new();
    let mut interval = tokio::time::interval(config.reconcile_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[INDEXER] Controller cancelled");
                break;
            }
            _ = interval.tick() => {
                let active = match storage.get_active_watched_addresses().await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!("[INDEXER] Failed to load watched addresses: {e:#}");
                        continue;
                    }
                };

                // Start workers for newly-active addresses.
                for row in &active {
                    if workers.contains_key(&row.address) {
                        continue;
                    }
                    info!(
                        "[INDEXER] Starting worker for {} (cursor={})",
                        row.address, row.last_indexed_time
                    );
                    let token = cancel.child_token();
                    workers.insert(row.address.clone(), token.clone());
                    tokio::spawn(run_address_worker(
                        row.address.clone(),
                        row.last_indexed_time,
                        storage.clone(),
                        client.clone(),
                        backoff.clone(),
                        metrics.clone(),
                        config.clone(),
                        token,
                    ));
                }

                // Stop workers for removed or deactivated addresses.
                let active_set: std::collections::HashSet<&str> =
                    active.iter().map(|r| r.address.as_str()).collect();
                workers.retain(|address, token| {
                    if active_set.contains(address.as_str()) {
                        true
                    } else {
                        info!("[INDEXER] Stopping worker for {address}");
                        token.cancel();
                        false
                    }
                });

                metrics.active_indexer_workers.set(workers.len() as i64);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_address_worker(
    address: String,
    initial_cursor: i64,
    storage: Storage,
    client: Arc<CoreClient>,
    backoff: Arc<SharedBackoff>,
    metrics: Arc<IndexerMetrics>,
    config: CoreIndexerConfig,
    cancel: CancellationToken,
) {
    let mut cursor = initial_cursor;
    loop {
        let made_progress = tokio::select! {
            _ = cancel.cancelled() => break,
            result = index_page(
                &address, &mut cursor, &storage, &client, &backoff, &metrics, &config,
            ) => result,
        };

        // Still backfilling: poll again immediately. Otherwise sleep out the
        // poll interval.
        if !made_progress {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
        }
    }
    debug!("[INDEXER] Worker for {address} stopped");
}

/// Fetch and persist one ledger page. Returns true if new transfers were
/// inserted (the worker should keep going without sleeping).
async fn index_page(
    address: &str,
    cursor: &mut i64,
    storage: &Storage,
    client: &CoreClient,
    backoff: &SharedBackoff,
    metrics: &IndexerMetrics,
    config: &CoreIndexerConfig,
) -> bool {
    let entries = match fetch_page(address, *cursor, client, backoff, metrics, config).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!("[INDEXER] {address}: ledger fetch failed: {e}");
            metrics
                .indexer_errors
                .with_label_values(&[e.error_type()])
                .inc();
            return false;
        }
    };
    metrics.indexer_batches.inc();

    let (transfers, max_time) = extract_transfers(address, &entries);
    let inserted = if transfers.is_empty() {
        0
    } else {
        match storage.insert_transfer_batch(&transfers).await {
            Ok(result) => {
                if result.inserted > 0 {
                    info!(
                        "[INDEXER] {address}: inserted {} transfers ({} duplicates)",
                        result.inserted, result.duplicates
                    );
                }
                metrics.transfers_indexed.inc_by(result.inserted as u64);
                result.inserted
            }
            Err(e) => {
                warn!("[INDEXER] {address}: insert failed: {e:#}");
                metrics.indexer_errors.with_label_values(&["storage"]).inc();
                return false;
            }
        }
    };

    // The cursor follows the observed maximum regardless of duplicates; the
    // inserted count alone decides whether we are still backfilling.
    if let Some(max_time) = max_time {
        if max_time > *cursor {
            *cursor = max_time;
            if let Err(e) = storage.advance_cursor(address, max_time).await {
                warn!("[INDEXER] {address}: cursor update failed: {e:#}");
            }
        }
    }

    inserted > 0
}

/// One page fetch with the worker's retry policy: rate limits feed the
/// shared backoff and do not consume attempts, other transient failures get
/// jittered exponential retries.
async fn fetch_page(
    address: &str,
    cursor: i64,
    client: &CoreClient,
    backoff: &SharedBackoff,
    metrics: &IndexerMetrics,
    config: &CoreIndexerConfig,
) -> Result<Vec<LedgerEntry>, FetchError> {
    let mut attempt = 0u32;
    loop {
        backoff.wait().await;
        match client.user_ledger_updates(address, cursor).await {
            Ok(entries) => return Ok(entries),
            Err(FetchError::RateLimited { retry_after_ms }) => {
                // Multiply up a little so we return after the window, not on
                // its edge, and let the shared gate pace everyone.
                let padded = retry_after_ms * 11 / 10;
                warn!("[INDEXER] {address}: rate limited, backing off {padded}ms");
                backoff.trigger(Duration::from_millis(padded));
                metrics.rate_limit_triggers.inc();
            }
            Err(e) if e.is_transient() && attempt + 1 < config.max_attempts => {
                let base = config.retry_base * 2u32.pow(attempt);
                let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
                let delay = base + Duration::from_millis(jitter);
                debug!(
                    "[INDEXER] {address}: attempt {} failed ({e}), retrying in {delay:?}",
                    attempt + 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{system_address_for_index, NATIVE_SYSTEM_ADDRESS};

    fn entry(time: i64, hash: &str, delta: LedgerDelta) -> LedgerEntry {
        LedgerEntry {
            time,
            hash: hash.to_string(),
            delta,
        }
    }

    fn spot_transfer(destination: &str) -> LedgerDelta {
        LedgerDelta::SpotTransfer {
            token: "UBTC".to_string(),
            amount: "0.5".to_string(),
            user: "0xUSER00000000000000000000000000000000000a".to_string(),
            destination: destination.to_string(),
            usdc_value: Some("30000.0".to_string()),
            fee: None,
            native_token_fee: None,
        }
    }

    #[test]
    fn test_extract_keeps_system_address_transfers_only() {
        let watched = "0xuser00000000000000000000000000000000000a";
        let entries = vec![
            entry(100, "0x01", spot_transfer(&system_address_for_index(5))),
            entry(200, "0x02", spot_transfer(NATIVE_SYSTEM_ADDRESS)),
            // A spot transfer to a regular address is not a bridge event.
            entry(
                300,
                "0x03",
                spot_transfer("0x9999999999999999999999999999999999999999"),
            ),
            entry(400, "0x04", LedgerDelta::Other),
        ];
        let (transfers, max_time) = extract_transfers(watched, &entries);
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers[0].core_hash, "0x01");
        assert_eq!(
            transfers[0].system_address,
            system_address_for_index(5)
        );
        assert_eq!(transfers[0].watched_sender, watched);
        // Recipient is normalized to lowercase for matching.
        assert_eq!(
            transfers[0].recipient,
            "0xuser00000000000000000000000000000000000a"
        );
        // The cursor candidate covers every entry, not just the kept ones.
        assert_eq!(max_time, Some(400));
    }

    #[test]
    fn test_extract_is_deterministic_over_redelivery() {
        // The API is inclusive-start and may redeliver a page; the extracted
        // rows must be identical so the unique index absorbs them.
        let watched = "0xabc";
        let entries = vec![
            entry(100, "0x01", spot_transfer(NATIVE_SYSTEM_ADDRESS)),
            entry(150, "0x02", spot_transfer(&system_address_for_index(268))),
        ];
        let (first, _) = extract_transfers(watched, &entries);
        let (second, _) = extract_transfers(watched, &entries);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.core_hash, b.core_hash);
            assert_eq!(a.core_time, b.core_time);
            assert_eq!(a.system_address, b.system_address);
            assert_eq!(a.amount, b.amount);
        }
    }

    #[test]
    fn test_extract_empty_page() {
        let (transfers, max_time) = extract_transfers("0xabc", &[]);
        assert!(transfers.is_empty());
        assert_eq!(max_time, None);
    }
}
