// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The block search engine.
//!
//! Given a CORE transfer, locate the EVM block and system transaction that
//! materialize it. The search interpolates over bracketing anchors, fetching
//! small contiguous batches and tightening the bracket each round. Every
//! fetched block is stored as anchors in the background, so the anchor set
//! densifies and later searches start closer to their target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::types::U256;
use tracing::debug;

use corebridge_schema::models::{AnchorTx, Transfer};

use crate::anchors::AnchorStore;
use crate::assets::AssetCache;
use crate::error::FindError;
use crate::fetchers::{BlockData, BlockFetcher};
use crate::storage::{AnchorPoint, EvmMatch};

pub const MAX_SEARCH_ROUNDS: u32 = 20;

/// Contiguous blocks fetched per round.
pub const SEARCH_BATCH_SIZE: u64 = 5;

/// Cache-probe window around the CORE timestamp. Asymmetric: a small
/// allowance for clock skew behind, a generous one ahead for bridge latency.
pub const CACHE_WINDOW_BEFORE_MS: i64 = 5_000;
pub const CACHE_WINDOW_AFTER_MS: i64 = 120_000;

/// Extrapolation rate when the target is not bracketed from above.
const FALLBACK_BLOCK_INTERVAL_MS: i64 = 1_000;

pub const DEFAULT_GENESIS_TIME_MS: i64 = 1_700_000_000_000;

#[derive(Debug, Clone)]
pub struct FinderConfig {
    /// Timestamp of block 1, the seed anchor used when the anchor set is
    /// empty below the target.
    pub chain_genesis_time_ms: i64,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            chain_genesis_time_ms: DEFAULT_GENESIS_TIME_MS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FindResult {
    pub evm: EvmMatch,
    pub rounds: u32,
    pub blocks_searched: u64,
    pub elapsed: Duration,
}

pub struct Finder<S> {
    anchors: S,
    assets: Arc<AssetCache>,
    config: FinderConfig,
}

impl<S: AnchorStore> Finder<S> {
    pub fn new(anchors: S, assets: Arc<AssetCache>, config: FinderConfig) -> Self {
        Self {
            anchors,
            assets,
            config,
        }
    }

    /// Resolve `transfer` to its EVM transaction, or conclude it does not
    /// exist. Fetch errors propagate so the caller can retry later.
    pub async fn find(
        &self,
        transfer: &Transfer,
        fetcher: &dyn BlockFetcher,
    ) -> Result<FindResult, FindError> {
        let started = Instant::now();
        let target_ms = transfer.core_time;

        let decimals = self
            .assets
            .evm_decimals_for_system_address(&transfer.system_address)
            .await;
        let amount =
            parse_amount(&transfer.amount, decimals).map_err(FindError::InvalidTransfer)?;
        let amount_str = amount.to_string();
        let from = transfer.system_address.to_ascii_lowercase();
        let recipient = transfer.recipient.to_ascii_lowercase();

        // Cache probe: a previous search may have fetched the block already.
        if let Some(anchor) = self
            .anchors
            .find_matching_anchor(
                &from,
                &recipient,
                &amount_str,
                target_ms - CACHE_WINDOW_BEFORE_MS,
                target_ms + CACHE_WINDOW_AFTER_MS,
            )
            .await
            .map_err(|e| FindError::Storage(format!("{e:#}")))?
        {
            return Ok(FindResult {
                evm: evm_match_from_anchor(&anchor),
                rounds: 0,
                blocks_searched: 0,
                elapsed: started.elapsed(),
            });
        }

        let bounds = self
            .anchors
            .find_bracketing_anchors(target_ms)
            .await
            .map_err(|e| FindError::Storage(format!("{e:#}")))?;
        let mut lower = bounds.before.unwrap_or(AnchorPoint {
            block_number: 1,
            block_timestamp: self.config.chain_genesis_time_ms,
        });
        let mut upper = bounds.after;
        let mut blocks_searched: u64 = 0;

        for round in 1..=MAX_SEARCH_ROUNDS {
            let est = estimate_block(&lower, upper.as_ref(), target_ms);
            let batch = build_batch(
                est,
                lower.block_number.max(1) as u64,
                upper.map(|u| u.block_number.max(1) as u64),
            );
            debug!(
                "[FINDER] {} round {round}: est={est} batch={}..={}",
                transfer.core_hash,
                batch.first().copied().unwrap_or_default(),
                batch.last().copied().unwrap_or_default(),
            );

            let blocks = fetcher.fetch_blocks(&batch).await?;
            blocks_searched += blocks.len() as u64;
            self.anchors.store_blocks_detached(blocks.clone());

            if let Some(evm) = scan_blocks(&blocks, &from, &recipient, &amount) {
                return Ok(FindResult {
                    evm,
                    rounds: round,
                    blocks_searched,
                    elapsed: started.elapsed(),
                });
            }

            tighten_bounds(&blocks, target_ms, &mut lower, &mut upper);

            if let Some(u) = &upper {
                if u.block_number <= lower.block_number + 1 {
                    // The bracket is closed: the transfer is definitively
                    // absent from the chain.
                    return Err(FindError::NotFound { blocks_searched });
                }
            }
        }

        Err(FindError::NotFound { blocks_searched })
    }
}

fn evm_match_from_anchor(anchor: &AnchorTx) -> EvmMatch {
    EvmMatch {
        internal_hash: anchor.internal_hash.clone(),
        explorer_hash: anchor.explorer_hash.clone(),
        block_number: anchor.block_number,
        block_hash: anchor.block_hash.clone(),
        block_time: anchor.block_timestamp,
        contract_address: anchor.contract_address.clone(),
    }
}

/// The match predicate: all three conjuncts are required to prevent
/// cross-asset collisions.
fn scan_blocks(
    blocks: &[BlockData],
    from: &str,
    recipient: &str,
    amount: &U256,
) -> Option<EvmMatch> {
    for block in blocks {
        for tx in &block.system_txs {
            if tx.from == from
                && tx.asset_recipient == recipient
                && tx.amount_smallest_unit == *amount
            {
                return Some(EvmMatch {
                    internal_hash: tx.internal_hash.clone(),
                    explorer_hash: tx.explorer_hash.clone(),
                    block_number: block.number as i64,
                    block_hash: block.hash.clone(),
                    block_time: block.timestamp,
                    contract_address: tx.contract_address.clone(),
                });
            }
        }
    }
    None
}

/// Estimate the block holding `target_ms` by linear interpolation between
/// the bounds, clamped into them. With no upper bound (or a degenerate one
/// at the same timestamp) extrapolate from the lower anchor at
/// one block per second.
pub(crate) fn estimate_block(
    lower: &AnchorPoint,
    upper: Option<&AnchorPoint>,
    target_ms: i64,
) -> u64 {
    if let Some(upper) = upper {
        let dt = upper.block_timestamp - lower.block_timestamp;
        if dt > 0 {
            let span = (upper.block_number - lower.block_number) as i128;
            let offset = (target_ms - lower.block_timestamp) as i128;
            let est = lower.block_number as i128 + (offset * span + dt as i128 / 2) / dt as i128;
            return est
                .clamp(lower.block_number as i128, upper.block_number as i128)
                .max(1) as u64;
        }
    }
    let offset_ms = (target_ms - lower.block_timestamp).max(0);
    (lower.block_number + offset_ms / FALLBACK_BLOCK_INTERVAL_MS).max(1) as u64
}

/// A contiguous batch of [`SEARCH_BATCH_SIZE`] block numbers centered on the
/// estimate, shifted to stay inside the bracket and clamped at block 1. A
/// bracket narrower than the batch yields a short batch.
pub(crate) fn build_batch(est: u64, lower_block: u64, upper_block: Option<u64>) -> Vec<u64> {
    let half = SEARCH_BATCH_SIZE / 2;
    let start = est.saturating_sub(half).max(1).max(lower_block);
    if let Some(upper) = upper_block {
        let max_start = upper.saturating_sub(SEARCH_BATCH_SIZE - 1).max(1);
        let start = start.min(max_start).max(lower_block).max(1);
        let end = upper.max(start).min(start + SEARCH_BATCH_SIZE - 1);
        return (start..=end).collect();
    }
    (start..start + SEARCH_BATCH_SIZE).collect()
}

/// Raise the lower bound to the largest fetched block at or before the
/// target, and drop the upper bound to the smallest fetched block after it.
/// Bounds only ever move inward.
pub(crate) fn tighten_bounds(
    blocks: &[BlockData],
    target_ms: i64,
    lower: &mut AnchorPoint,
    upper: &mut Option<AnchorPoint>,
) {
    for block in blocks {
        let point = AnchorPoint {
            block_number: block.number as i64,
            block_timestamp: block.timestamp,
        };
        if block.timestamp <= target_ms {
            if point.block_number > lower.block_number {
                *lower = point;
            }
        } else {
            match upper {
                Some(u) if point.block_number >= u.block_number => {}
                _ => *upper = Some(point),
            }
        }
    }
}

/// Parse a human-scale decimal amount into smallest units. Excess decimal
/// places are rounded, not truncated.
pub fn parse_amount(amount: &str, decimals: u32) -> Result<U256, String> {
    let amount = amount.trim();
    let (int_part, frac_part) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(format!("empty amount: {amount:?}"));
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(format!("invalid decimal amount: {amount:?}"));
    }

    let decimals = decimals as usize;
    let mut digits = String::with_capacity(int_part.len().max(1) + decimals);
    digits.push_str(if int_part.is_empty() { "0" } else { int_part });
    let mut round_up = false;
    if frac_part.len() <= decimals {
        digits.push_str(frac_part);
        for _ in 0..decimals - frac_part.len() {
            digits.push('0');
        }
    } else {
        digits.push_str(&frac_part[..decimals]);
        round_up = frac_part.as_bytes()[decimals] >= b'5';
    }

    let mut value =
        U256::from_dec_str(&digits).map_err(|e| format!("amount out of range: {e}"))?;
    if round_up {
        value = value
            .checked_add(U256::one())
            .ok_or_else(|| "amount overflow".to_string())?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(block_number: i64, block_timestamp: i64) -> AnchorPoint {
        AnchorPoint {
            block_number,
            block_timestamp,
        }
    }

    fn block(number: u64, timestamp: i64) -> BlockData {
        BlockData {
            number,
            hash: format!("0x{number:x}"),
            timestamp,
            system_txs: vec![],
        }
    }

    #[test]
    fn test_parse_amount_scales_and_rounds() {
        let cases = [
            ("100.5", 18, "100500000000000000000"),
            ("1", 8, "100000000"),
            (".5", 2, "50"),
            ("0.000001", 6, "1"),
            // Excess places round, half-up.
            ("1.005", 2, "101"),
            ("1.0049", 2, "100"),
            ("0.4445", 3, "445"),
            ("1.5", 0, "2"),
            ("1.23", 0, "1"),
        ];
        for (input, decimals, expected) in cases {
            assert_eq!(
                parse_amount(input, decimals).unwrap(),
                U256::from_dec_str(expected).unwrap(),
                "parse_amount({input:?}, {decimals})"
            );
        }
    }

    #[test]
    fn test_parse_amount_rejects_garbage() {
        assert!(parse_amount("", 8).is_err());
        assert!(parse_amount(".", 8).is_err());
        assert!(parse_amount("-5", 8).is_err());
        assert!(parse_amount("1.2.3", 8).is_err());
        assert!(parse_amount("abc", 8).is_err());
    }

    #[test]
    fn test_estimate_interpolates_between_bounds() {
        let lower = point(1000, 1_700_000_000_000);
        let upper = point(2000, 1_700_001_000_000);
        assert_eq!(
            estimate_block(&lower, Some(&upper), 1_700_000_500_000),
            1500
        );
        // Clamped into the bracket even for targets outside it.
        assert_eq!(
            estimate_block(&lower, Some(&upper), 1_700_005_000_000),
            2000
        );
        assert_eq!(
            estimate_block(&lower, Some(&upper), 1_600_000_000_000),
            1000
        );
    }

    #[test]
    fn test_estimate_rounds_to_nearest_block() {
        let lower = point(0, 0);
        let upper = point(10, 10_000);
        // 5.4s -> block 5, 5.6s -> block 6.
        assert_eq!(estimate_block(&lower, Some(&upper), 5_400), 5);
        assert_eq!(estimate_block(&lower, Some(&upper), 5_600), 6);
    }

    #[test]
    fn test_estimate_extrapolates_without_upper_bound() {
        let lower = point(100, 1_700_000_000_000);
        // 30 seconds later at 1 block/s.
        assert_eq!(estimate_block(&lower, None, 1_700_000_030_000), 130);
        // A target behind the anchor never goes below it.
        assert_eq!(estimate_block(&lower, None, 1_600_000_000_000), 100);
    }

    #[test]
    fn test_estimate_treats_identical_timestamps_as_no_interval() {
        let lower = point(100, 1_700_000_000_000);
        let upper = point(500, 1_700_000_000_000);
        assert_eq!(
            estimate_block(&lower, Some(&upper), 1_700_000_010_000),
            110
        );
    }

    #[test]
    fn test_build_batch_centers_on_estimate() {
        assert_eq!(build_batch(1000, 1, None), vec![998, 999, 1000, 1001, 1002]);
    }

    #[test]
    fn test_build_batch_clamps_at_block_one() {
        assert_eq!(build_batch(1, 1, None), vec![1, 2, 3, 4, 5]);
        assert_eq!(build_batch(2, 1, None), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_build_batch_shifts_inside_bounds() {
        // Estimate near the upper bound: window slides down.
        assert_eq!(
            build_batch(999, 900, Some(1000)),
            vec![996, 997, 998, 999, 1000]
        );
        // Estimate near the lower bound: window slides up.
        assert_eq!(
            build_batch(901, 900, Some(1000)),
            vec![900, 901, 902, 903, 904]
        );
        // Bracket narrower than the batch: short batch.
        assert_eq!(build_batch(901, 900, Some(902)), vec![900, 901, 902]);
    }

    #[test]
    fn test_tighten_bounds_moves_inward_only() {
        let target = 1_700_000_500_000;
        let mut lower = point(1000, 1_700_000_000_000);
        let mut upper: Option<AnchorPoint> = None;

        tighten_bounds(
            &[
                block(1400, 1_700_000_400_000),
                block(1401, 1_700_000_401_000),
                block(1600, 1_700_000_600_000),
            ],
            target,
            &mut lower,
            &mut upper,
        );
        assert_eq!(lower, point(1401, 1_700_000_401_000));
        assert_eq!(upper, Some(point(1600, 1_700_000_600_000)));

        // A looser pair of blocks changes nothing.
        tighten_bounds(
            &[block(1200, 1_700_000_200_000), block(1800, 1_700_000_800_000)],
            target,
            &mut lower,
            &mut upper,
        );
        assert_eq!(lower, point(1401, 1_700_000_401_000));
        assert_eq!(upper, Some(point(1600, 1_700_000_600_000)));
    }

    #[test]
    fn test_empty_fetch_leaves_bounds_unchanged() {
        let mut lower = point(1000, 1_700_000_000_000);
        let mut upper = Some(point(2000, 1_700_001_000_000));
        tighten_bounds(&[], 1_700_000_500_000, &mut lower, &mut upper);
        assert_eq!(lower, point(1000, 1_700_000_000_000));
        assert_eq!(upper, Some(point(2000, 1_700_001_000_000)));
    }
}
