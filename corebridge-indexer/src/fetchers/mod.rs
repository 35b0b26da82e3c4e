// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Block fetching.
//!
//! Two interchangeable providers return the same normalized view of an EVM
//! block: its timestamp, identifiers, and the system transfers it contains.
//! The RPC variant is free but slow; the object-store variant is paid and
//! fast. The matcher pool swaps between them based on backlog depth.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::U256;
use rand::Rng;
use tracing::debug;

use crate::backoff::SharedBackoff;
use crate::error::FetchError;

mod normalize;
pub mod object_store;
pub mod rpc;

pub use normalize::{normalize_system_tx, system_tx_hashes, RawEvmLog, RawEvmTx};

/// Upstream JSON-RPC batch cap, in operations.
pub const MAX_RPC_BATCH_SIZE: usize = 20;

/// Attempts per chunk/object before a transient error is surfaced.
const MAX_FETCH_ATTEMPTS: u32 = 3;

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// A fetched block, reduced to what correlation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub number: u64,
    pub hash: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub system_txs: Vec<SystemTx>,
}

/// A normalized system transfer. Matching consumes only `from`,
/// `asset_recipient` and `amount_smallest_unit`; the hashes and contract
/// address ride along into the anchor store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemTx {
    pub internal_hash: String,
    pub explorer_hash: String,
    pub from: String,
    pub asset_recipient: String,
    pub amount_smallest_unit: U256,
    pub contract_address: Option<String>,
}

#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Fetch the given blocks, returned sorted by number. Blocks that do not
    /// exist (yet) are absent from the result; that is not an error.
    async fn fetch_blocks(&self, block_numbers: &[u64]) -> Result<Vec<BlockData>, FetchError>;

    /// Stable name for logs and metrics labels.
    fn name(&self) -> &'static str;
}

/// EVM block timestamps are seconds; everything downstream is milliseconds.
pub(crate) fn block_time_ms(timestamp_secs: u64) -> i64 {
    (timestamp_secs as i64).saturating_mul(1000)
}

/// Retry `f` on transient failures with jittered exponential backoff, up to
/// [`MAX_FETCH_ATTEMPTS`] attempts. The shared backoff gate is consulted
/// before every attempt, and a rate-limit response feeds back into it.
pub(crate) async fn with_retries<T, F, Fut>(
    op: &str,
    backoff: &SharedBackoff,
    f: F,
) -> Result<T, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0u32;
    loop {
        backoff.wait().await;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < MAX_FETCH_ATTEMPTS => {
                if let FetchError::RateLimited { retry_after_ms } = &e {
                    backoff.trigger(Duration::from_millis(*retry_after_ms));
                }
                let base = RETRY_BASE_DELAY * 2u32.pow(attempt);
                let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
                let delay = base + Duration::from_millis(jitter);
                debug!(
                    "[FETCH] {op} attempt {} failed ({e}), retrying in {delay:?}",
                    attempt + 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
