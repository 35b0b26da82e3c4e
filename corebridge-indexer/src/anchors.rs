// Copyright (c) Corebridge, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Anchor index: the finder's view of persisted system transactions.
//!
//! A thin facade over [`Storage`]. Block persistence is deliberately
//! detached: the finder hands fetched blocks off and keeps searching without
//! waiting, so a slow insert never stalls a search round. Failed inserts are
//! logged and retried implicitly the next time the same block is fetched.

use async_trait::async_trait;
use tracing::{debug, warn};

use corebridge_schema::models::AnchorTx;

use crate::fetchers::BlockData;
use crate::storage::{AnchorBounds, Storage};

#[async_trait]
pub trait AnchorStore: Send + Sync {
    async fn find_matching_anchor(
        &self,
        from: &str,
        recipient: &str,
        amount_smallest_unit: &str,
        min_time_ms: i64,
        max_time_ms: i64,
    ) -> anyhow::Result<Option<AnchorTx>>;

    async fn find_bracketing_anchors(&self, target_time_ms: i64) -> anyhow::Result<AnchorBounds>;

    /// Store fetched blocks without blocking the caller.
    fn store_blocks_detached(&self, blocks: Vec<BlockData>);
}

/// Convert fetched blocks into anchor rows. Amounts are canonical decimal
/// strings so equality against stored anchors is exact.
pub fn anchor_rows_from_blocks(blocks: &[BlockData]) -> Vec<AnchorTx> {
    blocks
        .iter()
        .flat_map(|block| {
            block.system_txs.iter().map(|tx| AnchorTx {
                internal_hash: tx.internal_hash.clone(),
                explorer_hash: tx.explorer_hash.clone(),
                block_number: block.number as i64,
                block_hash: block.hash.clone(),
                block_timestamp: block.timestamp,
                from_address: tx.from.clone(),
                asset_recipient: tx.asset_recipient.clone(),
                amount_smallest_unit: tx.amount_smallest_unit.to_string(),
                contract_address: tx.contract_address.clone(),
            })
        })
        .collect()
}

#[derive(Clone)]
pub struct AnchorIndex {
    storage: Storage,
}

impl AnchorIndex {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl AnchorStore for AnchorIndex {
    async fn find_matching_anchor(
        &self,
        from: &str,
        recipient: &str,
        amount_smallest_unit: &str,
        min_time_ms: i64,
        max_time_ms: i64,
    ) -> anyhow::Result<Option<AnchorTx>> {
        self.storage
            .find_matching_anchor(from, recipient, amount_smallest_unit, min_time_ms, max_time_ms)
            .await
    }

    async fn find_bracketing_anchors(&self, target_time_ms: i64) -> anyhow::Result<AnchorBounds> {
        self.storage.find_bracketing_anchors(target_time_ms).await
    }

    fn store_blocks_detached(&self, blocks: Vec<BlockData>) {
        let rows = anchor_rows_from_blocks(&blocks);
        if rows.is_empty() {
            return;
        }
        let storage = self.storage.clone();
        tokio::spawn(async move {
            match storage.insert_anchor_batch(&rows).await {
                Ok(inserted) => {
                    debug!(
                        "[ANCHORS] Stored {inserted} new anchors ({} candidates)",
                        rows.len()
                    )
                }
                Err(e) => warn!("[ANCHORS] Background anchor insert failed: {e:#}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetchers::SystemTx;
    use ethers::types::U256;

    #[test]
    fn test_anchor_rows_carry_block_metadata() {
        let blocks = vec![BlockData {
            number: 1500,
            hash: "0xabc".to_string(),
            timestamp: 1_700_000_500_000,
            system_txs: vec![
                SystemTx {
                    internal_hash: "0x01".to_string(),
                    explorer_hash: "0x02".to_string(),
                    from: "0x2222222222222222222222222222222222222222".to_string(),
                    asset_recipient: "0xaa".to_string(),
                    amount_smallest_unit: U256::from_dec_str("100500000000000000000").unwrap(),
                    contract_address: None,
                },
                SystemTx {
                    internal_hash: "0x03".to_string(),
                    explorer_hash: "0x04".to_string(),
                    from: "0x2000000000000000000000000000000000000005".to_string(),
                    asset_recipient: "0xbb".to_string(),
                    amount_smallest_unit: U256::from(42u64),
                    contract_address: Some("0xcc".to_string()),
                },
            ],
        }];
        let rows = anchor_rows_from_blocks(&blocks);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].block_number, 1500);
        assert_eq!(rows[0].block_timestamp, 1_700_000_500_000);
        assert_eq!(rows[0].amount_smallest_unit, "100500000000000000000");
        assert_eq!(rows[1].amount_smallest_unit, "42");
        assert_eq!(rows[1].contract_address.as_deref(), Some("0xcc"));
    }

    #[test]
    fn test_empty_blocks_produce_no_rows() {
        let blocks = vec![BlockData {
            number: 7,
            hash: "0x0".to_string(),
            timestamp: 1,
            system_txs: vec![],
        }];
        assert!(anchor_rows_from_blocks(&blocks).is_empty());
    }
}
