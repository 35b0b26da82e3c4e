// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The matcher pool: one producer, a bounded queue, N consumers.
//!
//! The producer refills the queue from the pending set and picks the fetch
//! strategy: a deep backlog favors the paid object store, steady state the
//! free RPC endpoint. Consumers run the finder and write terminal states.
//! Transfers whose search errored stay PENDING and flow back in on a later
//! refill; the dedup set only keeps them from being queued twice
//! concurrently, correctness rests on the persistence-level idempotence.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use corebridge_schema::models::Transfer;

use crate::anchors::AnchorIndex;
use crate::error::FindError;
use crate::finder::Finder;
use crate::fetchers::BlockFetcher;
use crate::metrics::IndexerMetrics;
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub queue_capacity: usize,
    pub low_watermark: usize,
    pub batch_size: i64,
    pub concurrency: usize,
    pub backfill_threshold: i64,
    pub refill_interval: Duration,
    pub find_timeout: Duration,
    pub dedup_capacity: usize,
    pub dedup_retain: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 2048,
            low_watermark: 100,
            batch_size: 256,
            concurrency: 256,
            backfill_threshold: 10,
            refill_interval: Duration::from_secs(1),
            find_timeout: Duration::from_secs(60),
            dedup_capacity: 10_000,
            dedup_retain: 5_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    Rpc = 0,
    ObjectStore = 1,
}

impl FetchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStrategy::Rpc => "rpc",
            FetchStrategy::ObjectStore => "object-store",
        }
    }
}

/// Decide the strategy for the current backlog depth.
pub(crate) fn select_strategy(pending_count: i64, backfill_threshold: i64) -> FetchStrategy {
    if pending_count > backfill_threshold {
        FetchStrategy::ObjectStore
    } else {
        FetchStrategy::Rpc
    }
}

/// Holds both fetchers; the producer switches the active one with a single
/// atomic store, consumers read it per dequeue.
pub struct FetcherSelector {
    rpc: Arc<dyn BlockFetcher>,
    object_store: Arc<dyn BlockFetcher>,
    mode: AtomicU8,
}

impl FetcherSelector {
    pub fn new(rpc: Arc<dyn BlockFetcher>, object_store: Arc<dyn BlockFetcher>) -> Self {
        Self {
            rpc,
            object_store,
            mode: AtomicU8::new(FetchStrategy::Rpc as u8),
        }
    }

    pub fn switch_to(&self, strategy: FetchStrategy) -> FetchStrategy {
        let previous = self.mode.swap(strategy as u8, Ordering::SeqCst);
        if previous == strategy as u8 {
            strategy
        } else {
            info!("[MATCHER] Fetch strategy switched to {}", strategy.as_str());
            strategy
        }
    }

    pub fn strategy(&self) -> FetchStrategy {
        match self.mode.load(Ordering::SeqCst) {
            0 => FetchStrategy::Rpc,
            _ => FetchStrategy::ObjectStore,
        }
    }

    pub fn current(&self) -> Arc<dyn BlockFetcher> {
        match self.strategy() {
            FetchStrategy::Rpc => self.rpc.clone(),
            FetchStrategy::ObjectStore => self.object_store.clone(),
        }
    }
}

/// Best-effort set of queued core hashes. Bounded: past the capacity, only
/// the most recently queued half is retained, so a long-running backlog
/// cannot grow it without limit. A hash slipping through after truncation is
/// harmless, the terminal-state updates are idempotent.
pub(crate) struct QueuedHashSet {
    inner: Mutex<QueuedHashSetInner>,
    capacity: usize,
    retain: usize,
}

struct QueuedHashSetInner {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl QueuedHashSet {
    pub fn new(capacity: usize, retain: usize) -> Self {
        Self {
            inner: Mutex::new(QueuedHashSetInner {
                set: HashSet::new(),
                order: VecDeque::new(),
            }),
            capacity,
            retain,
        }
    }

    /// Returns false if the hash is already queued.
    pub fn insert(&self, hash: &str) -> bool {
        let mut inner = self.inner.lock().expect("dedup set poisoned");
        if !inner.set.insert(hash.to_string()) {
            return false;
        }
        inner.order.push_back(hash.to_string());
        if inner.order.len() > self.capacity {
            while inner.order.len() > self.retain {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.set.remove(&evicted);
                }
            }
        }
        true
    }

    pub fn remove(&self, hash: &str) {
        let mut inner = self.inner.lock().expect("dedup set poisoned");
        inner.set.remove(hash);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().set.len()
    }
}

#[derive(Default)]
pub struct MatchCounters {
    pub matched: AtomicU64,
    pub failed: AtomicU64,
    pub errors: AtomicU64,
}

/// Everything the producer and consumers share.
struct MatcherShared {
    storage: Storage,
    finder: Finder<AnchorIndex>,
    selector: Arc<FetcherSelector>,
    dedup: QueuedHashSet,
    queue_size: AtomicUsize,
    counters: MatchCounters,
    metrics: Arc<IndexerMetrics>,
    config: MatcherConfig,
}

/// Spawn the producer, the consumers and the stats logger. All tasks stop
/// when `cancel` fires.
pub fn start_matcher_pool(
    storage: Storage,
    finder: Finder<AnchorIndex>,
    selector: Arc<FetcherSelector>,
    metrics: Arc<IndexerMetrics>,
    config: MatcherConfig,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let (tx, rx) = mpsc::channel::<Transfer>(config.queue_capacity);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let shared = Arc::new(MatcherShared {
        storage,
        finder,
        selector,
        dedup: QueuedHashSet::new(config.dedup_capacity, config.dedup_retain),
        queue_size: AtomicUsize::new(0),
        counters: MatchCounters::default(),
        metrics,
        config: config.clone(),
    });

    let mut handles = Vec::with_capacity(config.concurrency + 2);

    let producer_shared = shared.clone();
    let producer_cancel = cancel.clone();
    handles.push(tokio::spawn(async move {
        run_producer(producer_shared, tx, producer_cancel).await;
    }));

    for worker_id in 0..config.concurrency {
        let worker_shared = shared.clone();
        let worker_rx = rx.clone();
        let worker_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_consumer(worker_id, worker_shared, worker_rx, worker_cancel).await;
        }));
    }

    let stats_shared = shared.clone();
    handles.push(tokio::spawn(async move {
        run_stats_logger(stats_shared, cancel).await;
    }));

    handles
}

async fn run_producer(
    shared: Arc<MatcherShared>,
    tx: mpsc::Sender<Transfer>,
    cancel: CancellationToken,
) {
    info!("[MATCHER] Producer started");
    let mut interval = tokio::time::interval(shared.config.refill_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("[MATCHER] Producer cancelled");
                break;
            }
            _ = interval.tick() => {
                if shared.queue_size.load(Ordering::SeqCst) >= shared.config.low_watermark {
                    continue;
                }
                if let Err(e) = refill_once(&shared, &tx, &cancel).await {
                    warn!("[MATCHER] Refill failed: {e:#}");
                }
            }
        }
    }
}

async fn refill_once(
    shared: &Arc<MatcherShared>,
    tx: &mpsc::Sender<Transfer>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let pending = shared.storage.count_pending_transfers().await?;
    shared.metrics.pending_transfers.set(pending);

    let strategy = select_strategy(pending, shared.config.backfill_threshold);
    shared.selector.switch_to(strategy);
    shared
        .metrics
        .backfill_mode
        .set((strategy == FetchStrategy::ObjectStore) as i64);

    let room = shared
        .config
        .queue_capacity
        .saturating_sub(shared.queue_size.load(Ordering::SeqCst));
    let limit = (room as i64).min(shared.config.batch_size);
    if limit <= 0 {
        return Ok(());
    }

    let transfers = shared.storage.get_pending_transfers(limit).await?;
    let mut enqueued = 0usize;
    for transfer in transfers {
        if !shared.dedup.insert(&transfer.core_hash) {
            continue;
        }
        shared.queue_size.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = cancel.cancelled() => {
                shared.queue_size.fetch_sub(1, Ordering::SeqCst);
                return Ok(());
            }
            sent = tx.send(transfer) => {
                if sent.is_err() {
                    shared.queue_size.fetch_sub(1, Ordering::SeqCst);
                    return Ok(());
                }
                enqueued += 1;
            }
        }
    }
    if enqueued > 0 {
        debug!("[MATCHER] Enqueued {enqueued} transfers (pending={pending})");
    }
    Ok(())
}

async fn run_consumer(
    worker_id: usize,
    shared: Arc<MatcherShared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Transfer>>>,
    cancel: CancellationToken,
) {
    loop {
        let transfer = tokio::select! {
            _ = cancel.cancelled() => break,
            transfer = async { rx.lock().await.recv().await } => {
                match transfer {
                    Some(t) => t,
                    None => break,
                }
            }
        };
        shared.queue_size.fetch_sub(1, Ordering::SeqCst);
        process_transfer(worker_id, &shared, transfer).await;
    }
    debug!("[MATCHER] Consumer {worker_id} stopped");
}

async fn process_transfer(worker_id: usize, shared: &Arc<MatcherShared>, transfer: Transfer) {
    // Re-read the selector per transfer: the producer may have switched
    // strategies while this item sat in the queue.
    let fetcher = shared.selector.current();
    let outcome = tokio::time::timeout(
        shared.config.find_timeout,
        shared.finder.find(&transfer, fetcher.as_ref()),
    )
    .await;

    match outcome {
        Ok(Ok(result)) => {
            match shared.storage.mark_matched(&transfer.core_hash, &result.evm).await {
                Ok(()) => {
                    shared.counters.matched.fetch_add(1, Ordering::Relaxed);
                    shared.metrics.transfers_matched.inc();
                    shared
                        .metrics
                        .match_rounds
                        .observe(f64::from(result.rounds));
                    info!(
                        "[MATCHER] Matched {} -> block {} ({} rounds, {} blocks, {:?})",
                        transfer.core_hash,
                        result.evm.block_number,
                        result.rounds,
                        result.blocks_searched,
                        result.elapsed,
                    );
                    // Matched is terminal; the hash never re-enters the
                    // queue, so leaving it in the dedup set is fine.
                }
                Err(e) => {
                    error!(
                        "[MATCHER] Failed to persist match for {}: {e:#}",
                        transfer.core_hash
                    );
                    shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                    shared.metrics.match_errors.inc();
                    shared.dedup.remove(&transfer.core_hash);
                }
            }
        }
        Ok(Err(FindError::NotFound { blocks_searched })) => {
            let reason = format!("not found after {blocks_searched} blocks");
            match shared.storage.mark_failed(&transfer.core_hash, &reason).await {
                Ok(()) => {
                    shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                    shared.metrics.transfers_failed.inc();
                    warn!("[MATCHER] No match for {}: {reason}", transfer.core_hash);
                }
                Err(e) => {
                    error!(
                        "[MATCHER] Failed to persist failure for {}: {e:#}",
                        transfer.core_hash
                    );
                    shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                    shared.metrics.match_errors.inc();
                    shared.dedup.remove(&transfer.core_hash);
                }
            }
        }
        Ok(Err(e)) => {
            // Transient: the transfer stays PENDING and a later refill
            // re-queues it once the hash leaves the dedup set.
            debug!(
                "[MATCHER] Worker {worker_id} search error for {}: {e}",
                transfer.core_hash
            );
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            shared.metrics.match_errors.inc();
            shared.dedup.remove(&transfer.core_hash);
        }
        Err(_) => {
            debug!(
                "[MATCHER] Worker {worker_id} search timed out for {}",
                transfer.core_hash
            );
            shared.counters.errors.fetch_add(1, Ordering::Relaxed);
            shared.metrics.match_timeouts.inc();
            shared.dedup.remove(&transfer.core_hash);
        }
    }
}

async fn run_stats_logger(shared: Arc<MatcherShared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                info!(
                    "[MATCHER] Totals: matched={} failed={} errors={} queued={} strategy={}",
                    shared.counters.matched.load(Ordering::Relaxed),
                    shared.counters.failed.load(Ordering::Relaxed),
                    shared.counters.errors.load(Ordering::Relaxed),
                    shared.queue_size.load(Ordering::SeqCst),
                    shared.selector.strategy().as_str(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetchers::BlockData;
    use async_trait::async_trait;

    struct NullFetcher(&'static str);

    #[async_trait]
    impl BlockFetcher for NullFetcher {
        async fn fetch_blocks(&self, _: &[u64]) -> Result<Vec<BlockData>, FetchError> {
            Ok(vec![])
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    #[test]
    fn test_strategy_threshold() {
        assert_eq!(select_strategy(0, 10), FetchStrategy::Rpc);
        assert_eq!(select_strategy(10, 10), FetchStrategy::Rpc);
        assert_eq!(select_strategy(11, 10), FetchStrategy::ObjectStore);
        assert_eq!(select_strategy(100_000, 10), FetchStrategy::ObjectStore);
    }

    #[test]
    fn test_selector_switches_atomically() {
        let selector = FetcherSelector::new(
            Arc::new(NullFetcher("rpc")),
            Arc::new(NullFetcher("object-store")),
        );
        assert_eq!(selector.strategy(), FetchStrategy::Rpc);
        assert_eq!(selector.current().name(), "rpc");

        selector.switch_to(FetchStrategy::ObjectStore);
        assert_eq!(selector.strategy(), FetchStrategy::ObjectStore);
        assert_eq!(selector.current().name(), "object-store");

        selector.switch_to(FetchStrategy::Rpc);
        assert_eq!(selector.current().name(), "rpc");
    }

    #[test]
    fn test_dedup_set_rejects_queued_hashes() {
        let set = QueuedHashSet::new(100, 50);
        assert!(set.insert("0xaa"));
        assert!(!set.insert("0xaa"));
        set.remove("0xaa");
        assert!(set.insert("0xaa"));
    }

    #[test]
    fn test_dedup_set_truncates_to_recent_half() {
        let set = QueuedHashSet::new(10, 5);
        for i in 0..10 {
            assert!(set.insert(&format!("0x{i:02x}")));
        }
        assert_eq!(set.len(), 10);
        // The 11th insert trips the truncation: only the newest 5 survive.
        assert!(set.insert("0x0a"));
        assert_eq!(set.len(), 5);
        // Old entries may be re-queued once evicted.
        assert!(set.insert("0x00"));
        // Recent entries are still deduplicated.
        assert!(!set.insert("0x0a"));
    }
}
